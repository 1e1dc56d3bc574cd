#![forbid(unsafe_code)]
//! TOML configuration for the emitter, producers, consumer and parser.
//!
//! Every field is optional; anything left out keeps the option struct's
//! default. Durations are written in milliseconds.
//!
//! ```toml
//! [emitter]
//! commit_age_ms = 300
//!
//! [producer]
//! handshake = true
//! reconnect_max_ms = 60000
//!
//! [consumer]
//! bind = "0.0.0.0:9100"
//! durable = "/var/lib/sombra/txlog"
//!
//! [parser]
//! serial_check = "silent"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::operation::emitter::EmitterOptions;
use crate::operation::opcode::ProfileId;
use crate::operation::parser::{ExecMode, ParserOptions, SerialCheck};
use crate::replication::consumer::ConsumerOptions;
use crate::replication::producer::ProducerOptions;
use crate::types::{Result, SombraError};

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

/// `[emitter]` section.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmitterSection {
    /// Bytes buffered before a transaction is cut.
    pub commit_size: Option<usize>,
    /// Oldest captured data may wait this long before commit.
    pub commit_age_ms: Option<u64>,
    pub flush_limit: Option<usize>,
    /// Capacity of the capture queue, in blocks.
    pub capture_capacity: Option<usize>,
    pub buffer_order: Option<u32>,
}

/// `[producer]` section.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerSection {
    /// Wait for the subscriber's `ATTACH` reply.
    pub handshake: Option<bool>,
    pub validate: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub reconnect_min_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    /// Failed reconnects before the producer gives up. Unset retries forever.
    pub reconnect_budget: Option<u32>,
    pub commit_timeout_ms: Option<u64>,
    /// Bytes.
    pub sysout_limit: Option<usize>,
    pub idle_period_ms: Option<u64>,
    pub adminport: Option<u16>,
}

/// `[consumer]` section.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerSection {
    /// Listen address, `host:port`.
    pub bind: Option<String>,
    /// Transaction log directory. Unset runs the consumer volatile.
    pub durable: Option<PathBuf>,
    /// Re-apply the transaction log at startup.
    pub replay_log: Option<bool>,
    /// Accepted bytes after which a snapshot is due.
    pub snapshot_threshold: Option<u64>,
    pub validate_only: Option<bool>,
    pub idle_period_ms: Option<u64>,
    pub resume_period_ms: Option<u64>,
    pub max_tx_size: Option<usize>,
    pub max_line: Option<usize>,
    /// Unexecuted bytes that make the consumer throttle its producer.
    pub backlog_limit: Option<usize>,
    pub adminport: Option<u16>,
}

/// `[parser]` section.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParserSection {
    pub validate: Option<bool>,
    pub exec: Option<ExecMode>,
    /// `off`, `silent` or `strict`.
    pub serial_check: Option<SerialCheck>,
    pub max_line: Option<usize>,
    /// Opcode profile applied at startup.
    pub profile: Option<ProfileId>,
}

/// Complete durability configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DurableConfig {
    pub emitter: EmitterSection,
    pub producer: ProducerSection,
    pub consumer: ConsumerSection,
    pub parser: ParserSection,
}

impl DurableConfig {
    /// Rejects unknown sections and keys.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| SombraError::InvalidOwned(format!("config: {err}")))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    /// Renders the configuration, omitting unset keys.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| SombraError::InvalidOwned(format!("config: {err}")))
    }

    /// Emitter options with defaults filled in.
    pub fn emitter_options(&self) -> EmitterOptions {
        let s = &self.emitter;
        let d = EmitterOptions::default();
        EmitterOptions {
            commit_size: s.commit_size.unwrap_or(d.commit_size),
            commit_age: millis(s.commit_age_ms, d.commit_age),
            flush_limit: s.flush_limit.unwrap_or(d.flush_limit),
            capture_capacity: s.capture_capacity.unwrap_or(d.capture_capacity),
            buffer_order: s.buffer_order.unwrap_or(d.buffer_order),
        }
    }

    pub fn producer_options(&self) -> ProducerOptions {
        let s = &self.producer;
        let d = ProducerOptions::default();
        ProducerOptions {
            handshake: s.handshake.unwrap_or(d.handshake),
            validate: s.validate.unwrap_or(d.validate),
            connect_timeout: millis(s.connect_timeout_ms, d.connect_timeout),
            handshake_timeout: millis(s.handshake_timeout_ms, d.handshake_timeout),
            reconnect_min: millis(s.reconnect_min_ms, d.reconnect_min),
            reconnect_max: millis(s.reconnect_max_ms, d.reconnect_max),
            reconnect_budget: s.reconnect_budget.or(d.reconnect_budget),
            commit_timeout: millis(s.commit_timeout_ms, d.commit_timeout),
            sysout_limit: s.sysout_limit.unwrap_or(d.sysout_limit),
            idle_period: millis(s.idle_period_ms, d.idle_period),
            adminport: s.adminport.unwrap_or(d.adminport),
            ..d
        }
    }

    pub fn parser_options(&self) -> ParserOptions {
        let s = &self.parser;
        let d = ParserOptions::default();
        ParserOptions {
            validate: s.validate.unwrap_or(d.validate),
            exec: s.exec.unwrap_or(d.exec),
            serial_check: s.serial_check.unwrap_or(d.serial_check),
            max_line: s.max_line.unwrap_or(d.max_line),
            profile: s.profile.or(d.profile),
            ..d
        }
    }

    /// Consumer options, with the `[parser]` section applied to its parser.
    pub fn consumer_options(&self) -> ConsumerOptions {
        let s = &self.consumer;
        let d = ConsumerOptions::default();
        ConsumerOptions {
            bind: s.bind.clone().unwrap_or(d.bind.clone()),
            durable: s.durable.clone().or(d.durable.clone()),
            replay_log: s.replay_log.unwrap_or(d.replay_log),
            snapshot_threshold: s.snapshot_threshold.unwrap_or(d.snapshot_threshold),
            validate_only: s.validate_only.unwrap_or(d.validate_only),
            parser: self.parser_options(),
            idle_period: millis(s.idle_period_ms, d.idle_period),
            resume_period: millis(s.resume_period_ms, d.resume_period),
            max_tx_size: s.max_tx_size.unwrap_or(d.max_tx_size),
            max_line: s.max_line.unwrap_or(d.max_line),
            backlog_limit: s.backlog_limit.unwrap_or(d.backlog_limit),
            adminport: s.adminport.unwrap_or(d.adminport),
            ..d
        }
    }
}
