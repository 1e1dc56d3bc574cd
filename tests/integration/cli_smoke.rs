#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use sombra_durable::operation::{OpBlock, Operator};
use sombra_durable::primitives::buffer::OperationBuffer;
use sombra_durable::primitives::txlog::TxLog;
use sombra_durable::replication::{write_transaction, SerialSequence};
use sombra_durable::types::now_millis;
use sombra_durable::{ObjectId, OpId, Result};
use tempfile::TempDir;

fn stream(blocks: usize) -> Result<Vec<u8>> {
    let graph = ObjectId::from_name("origin");
    let mut data = Vec::new();
    for i in 0..blocks {
        let name = format!("v{i}");
        let mut block = OpBlock::for_vertex(graph, ObjectId::from_name(&name));
        block.push(Operator::vertex_new(&name, 0x11, 0, 0));
        block.push(Operator::set_rank(0xABC0 + i as u64));
        block.opid = OpId(i as u64 + 1);
        data.extend(block.to_bytes());
    }
    let mut seq = SerialSequence::starting_at(40, 2);
    let mut out = OperationBuffer::with_capacity_order(12, "cli");
    let tx = write_transaction(&mut out, &mut seq, &data, 0, now_millis())?;
    Ok(out.peek(tx.tsize))
}

fn config_path(dir: &TempDir) -> PathBuf {
    dir.path().join("config").join("config.toml")
}

fn json_of(args: &[&str], config: &Path) -> Value {
    let output = cargo_bin_cmd!("sombra-durable")
        .arg("--config")
        .arg(config)
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn opcodes_lists_the_table() {
    let dir = TempDir::new().expect("tempdir");
    let json = json_of(&["opcodes"], &config_path(&dir));
    let rows = json.as_array().expect("array of opcodes");
    assert!(rows.iter().any(|row| row["mnemonic"] == "vxn"));
    assert!(rows.iter().any(|row| row["mnemonic"] == "arc"));
}

#[test]
fn validate_accepts_a_clean_stream_and_flags_damage() -> Result<()> {
    let dir = TempDir::new()?;
    let config = config_path(&dir);
    let bytes = stream(3)?;
    let clean = dir.path().join("clean.ops");
    fs::write(&clean, &bytes)?;

    let json = json_of(&["validate", clean.to_str().expect("utf8 path")], &config);
    assert_eq!(json["valid"], true);
    assert_eq!(json["parser"]["transactions"], 1);
    assert_eq!(json["parser"]["operations"], 3);

    let mut rank_line = Vec::new();
    Operator::set_rank(0xABC1).encode(&mut rank_line);
    let mut damaged = bytes;
    let at = damaged
        .windows(rank_line.len())
        .position(|w| w == rank_line.as_slice())
        .expect("rank line present")
        + rank_line.len()
        - 2;
    assert_eq!(damaged[at], b'1');
    damaged[at] = b'7';
    let broken = dir.path().join("broken.ops");
    fs::write(&broken, &damaged)?;
    cargo_bin_cmd!("sombra-durable")
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .arg(&broken)
        .assert()
        .code(2);

    // Skipping CRC checks lets the same bytes through.
    let json = json_of(
        &["validate", "--no-crc", broken.to_str().expect("utf8 path")],
        &config,
    );
    assert_eq!(json["valid"], true);
    Ok(())
}

#[test]
fn inspect_log_summarizes_records() -> Result<()> {
    let dir = TempDir::new()?;
    let logdir = dir.path().join("log");
    fs::create_dir_all(&logdir)?;
    {
        let log = TxLog::open(&logdir)?;
        for serial in 1..=3u64 {
            let payload = stream(serial as usize)?;
            log.append(serial, ObjectId::from_name(&format!("tx{serial}")), 1000 + serial, &payload)?;
        }
        log.sync()?;
    }

    let json = json_of(
        &["inspect-log", "--records", logdir.to_str().expect("utf8 path")],
        &config_path(&dir),
    );
    assert_eq!(json["records"], 3);
    assert_eq!(json["first_serial"], 1);
    assert_eq!(json["last_serial"], 3);
    let entries = json["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries[1]["txid"],
        ObjectId::from_name("tx2").to_string().as_str()
    );
    Ok(())
}

#[test]
fn inspect_log_refuses_a_directory_without_a_log() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("sombra-durable")
        .arg("--config")
        .arg(config_path(&dir))
        .arg("inspect-log")
        .arg(dir.path())
        .assert()
        .code(1);
}

#[test]
fn config_init_writes_a_loadable_file() {
    let dir = TempDir::new().expect("tempdir");
    let config = config_path(&dir);
    cargo_bin_cmd!("sombra-durable")
        .arg("--config")
        .arg(&config)
        .args(["config", "init"])
        .assert()
        .success();
    assert!(config.exists());
    let json = json_of(&["config", "show"], &config);
    assert!(json.is_object());
}
