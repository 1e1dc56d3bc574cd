use std::fs;
use std::path::{Path, PathBuf};

use sombra_durable::config::DurableConfig;
use thiserror::Error;

const CONFIG_DIR: &str = "sombra-durable";
const CONFIG_FILE: &str = "config.toml";

/// Configuration file backing the CLI, with its resolved location.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: DurableConfig,
}

impl CliConfig {
    /// Loads `explicit`, or the per-user default. A missing file yields defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => DurableConfig::default(),
        };
        Ok(Self { path, data })
    }

    /// Config file in use, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn data(&self) -> &DurableConfig {
        &self.data
    }

    /// Writes the configuration back, creating parent directories. Returns the path written.
    pub fn persist(&self) -> Result<PathBuf, ConfigError> {
        let target = self.path.clone().ok_or(ConfigError::NoConfigPath)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized =
            toml::to_string_pretty(&self.data).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(&target, serialized).map_err(|source| ConfigError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

fn read_file(path: &Path) -> Result<DurableConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `<config dir>/sombra-durable/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Config file failures, with the path involved.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no config path could be determined; pass --config")]
    NoConfigPath,
}
