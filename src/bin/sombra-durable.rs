//! Binary entry point for the replication CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sombra_durable::{
    config::DurableConfig,
    graph::{ContextOptions, GraphContext},
    operation::{
        opcode::OPCODES, DiscardTarget, ExecMode, FeedOutcome, OperationParser, ParserStats,
        TransactionSink,
    },
    primitives::{
        buffer::OperationBuffer,
        txlog::{TxLog, TXLOG_FILE_NAME},
    },
    replication::{
        AttachMode, ConsumerStats, DurablePosition, ProducerStats, TransactionalConsumerService,
    },
    types::ObjectId,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[path = "cli/config.rs"]
mod config;
#[path = "cli/ui.rs"]
mod ui;

use config::CliConfig;
use ui::Ui;

const SNAPSHOT_FILE_NAME: &str = "snapshot.json";
const READ_CHUNK: usize = 1 << 20;

#[derive(Parser, Debug)]
#[command(
    name = "sombra-durable",
    version,
    about = "Transactional replication tools for Sombra graphs",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Configuration file (defaults to the per-user config)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, help = "Disable colored output")]
    plain: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Accept a producer's transactions into an in-memory graph")]
    Serve(ServeCmd),
    #[command(about = "Replicate the op blocks of a file to a consumer")]
    Send(SendCmd),
    #[command(about = "Parse an operation stream without applying it")]
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, help = "Skip CRC verification")]
        no_crc: bool,
    },
    #[command(about = "Summarize a consumer transaction log")]
    InspectLog {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        #[arg(long, help = "List every record")]
        records: bool,
    },
    #[command(about = "Print the opcode table")]
    Opcodes,
    #[command(subcommand, about = "Inspect or create the configuration file")]
    Config(ConfigCmd),
}

#[derive(Args, Debug)]
struct ServeCmd {
    #[arg(long, value_name = "NAME", default_value = "replica", help = "Graph name")]
    graph: String,
    #[arg(long, value_name = "ADDR", help = "Bind address, overrides [consumer] bind")]
    bind: Option<String>,
    #[arg(long, value_name = "PORT", help = "Bind port on 0.0.0.0")]
    port: Option<u16>,
    #[arg(long, value_name = "DIR", help = "Keep a durable transaction log in DIR")]
    durable: Option<PathBuf>,
    #[arg(long, help = "Replay the durable log into the graph on startup")]
    replay: bool,
    #[arg(long, value_name = "BYTES", help = "Accepted bytes between snapshots")]
    snapshot_threshold: Option<u64>,
    #[arg(long, help = "Verify transactions without applying them")]
    validate_only: bool,
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 10,
        help = "Interval between status log lines"
    )]
    status_interval: u64,
}

#[derive(Args, Debug)]
struct SendCmd {
    #[arg(long, value_name = "HOST:PORT", help = "Consumer endpoint")]
    to: String,
    #[arg(long, value_name = "FILE", help = "File of OP ... ENDOP blocks")]
    file: PathBuf,
    #[arg(long, value_name = "NAME", default_value = "origin", help = "Source graph name")]
    graph: String,
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 30,
        help = "Time allowed for the consumer to accept everything"
    )]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    #[command(about = "Print the effective configuration")]
    Show,
    #[command(about = "Write the effective configuration to the config path")]
    Init,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct ServeReport {
    graph: String,
    fingerprint: ObjectId,
    order: usize,
    size: usize,
    durable: DurablePosition,
    executed: DurablePosition,
    consumer: ConsumerStats,
}

#[derive(Serialize)]
struct SendReport {
    endpoint: String,
    transactions: usize,
    blocks: usize,
    bytes: usize,
    producer: Option<ProducerStats>,
}

#[derive(Serialize)]
struct ValidateReport {
    file: PathBuf,
    valid: bool,
    parser: ParserStats,
}

#[derive(Serialize)]
struct LogRecordRow {
    serial: u64,
    txid: ObjectId,
    tms: u64,
    bytes: usize,
    crc: String,
}

#[derive(Serialize)]
struct LogReport {
    path: PathBuf,
    records: u64,
    bytes: u64,
    first_serial: Option<u64>,
    last_serial: u64,
    truncated_bytes: u64,
    entries: Vec<LogRecordRow>,
}

#[derive(Serialize)]
struct OpcodeRow {
    code: String,
    mnemonic: &'static str,
    description: &'static str,
}

#[derive(Serialize)]
struct SnapshotRecord {
    graph: String,
    fingerprint: ObjectId,
    order: usize,
    size: usize,
    position: DurablePosition,
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SOMBRA_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let ui = Ui::new(cli.plain);
    let config = CliConfig::load(cli.config.clone())?;
    match cli.command {
        Command::Serve(cmd) => {
            let report = serve(cmd, config.data()).await?;
            emit(cli.format, &report, || print_serve_text(&ui, &report))?;
        }
        Command::Send(cmd) => {
            let data = config.data().clone();
            let report = tokio::task::spawn_blocking(move || send(&cmd, &data))
                .await?
                .map_err(|err| err as Box<dyn Error>)?;
            emit(cli.format, &report, || print_send_text(&ui, &report))?;
        }
        Command::Validate { file, no_crc } => {
            let report = validate(&file, !no_crc, config.data())?;
            emit(cli.format, &report, || print_validate_text(&ui, &report))?;
            if !report.valid {
                std::process::exit(2);
            }
        }
        Command::InspectLog { dir, records } => {
            let report = inspect_log(&dir, records)?;
            emit(cli.format, &report, || print_log_text(&ui, &report))?;
        }
        Command::Opcodes => {
            let rows: Vec<OpcodeRow> = OPCODES
                .iter()
                .map(|info| OpcodeRow {
                    code: info.code.to_string(),
                    mnemonic: info.mnemonic,
                    description: info.description,
                })
                .collect();
            emit(cli.format, &rows, || {
                ui.list(
                    "Opcodes",
                    rows.iter()
                        .map(|row| format!("{} {:<5} {}", row.code, row.mnemonic, row.description)),
                )
            })?;
        }
        Command::Config(ConfigCmd::Show) => {
            let text = config.data().to_toml()?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config.data())?),
                OutputFormat::Text => {
                    if let Some(path) = config.path() {
                        println!("# {}", path.display());
                    }
                    print!("{text}");
                }
            }
        }
        Command::Config(ConfigCmd::Init) => {
            let path = config.persist()?;
            ui.success(&format!("wrote {}", path.display()));
        }
    }
    Ok(())
}

async fn serve(cmd: ServeCmd, config: &DurableConfig) -> Result<ServeReport, Box<dyn Error>> {
    let mut options = config.consumer_options();
    if let Some(port) = cmd.port {
        options.bind = format!("0.0.0.0:{port}");
    }
    if let Some(bind) = cmd.bind {
        options.bind = bind;
    }
    if cmd.durable.is_some() {
        options.durable = cmd.durable;
    }
    options.replay_log |= cmd.replay;
    options.validate_only |= cmd.validate_only;
    if let Some(threshold) = cmd.snapshot_threshold {
        options.snapshot_threshold = threshold;
    }
    let snapshot_dir = options.durable.clone();

    let ctx = GraphContext::with_options(&cmd.graph, ContextOptions::default(), config.producer_options());
    let service = TransactionalConsumerService::bind(Arc::clone(&ctx), options)?;
    info!(graph = %cmd.graph, addr = %service.local_addr(), "cli.serve_listening");
    eprintln!("listening on {}", service.local_addr());

    let mut status = tokio::time::interval(Duration::from_secs(cmd.status_interval.max(1)));
    status.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            _ = status.tick() => {
                let stats = service.stats();
                info!(
                    attached = stats.attached,
                    transactions = stats.transactions,
                    last_serial = stats.last_serial,
                    backlog_bytes = stats.backlog_bytes,
                    "cli.serve_status"
                );
                if service.snapshot_due() {
                    write_snapshot(&service, &ctx, snapshot_dir.as_deref())?;
                }
            }
        }
    }

    let report = {
        let store = ctx.store();
        ServeReport {
            graph: cmd.graph,
            fingerprint: ctx.fingerprint(),
            order: store.order(),
            size: store.size(),
            durable: service.durability().get(),
            executed: service.executed(),
            consumer: service.stats(),
        }
    };
    service.shutdown();
    ctx.shutdown();
    Ok(report)
}

fn write_snapshot(
    service: &TransactionalConsumerService,
    ctx: &GraphContext,
    dir: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let Some(dir) = dir else {
        // Nothing to persist into; restart the byte count.
        service.acknowledge_snapshot();
        return Ok(());
    };
    let path = dir.join(SNAPSHOT_FILE_NAME);
    let position = service.snapshot(|position| {
        let record = {
            let store = ctx.store();
            SnapshotRecord {
                graph: ctx.name().to_string(),
                fingerprint: ctx.fingerprint(),
                order: store.order(),
                size: store.size(),
                position,
            }
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|err| sombra_durable::types::SombraError::InvalidOwned(err.to_string()))?;
        fs::write(&path, json)?;
        Ok(position)
    })?;
    info!(path = %path.display(), serial = position.serial, "cli.snapshot_written");
    Ok(())
}

fn send(cmd: &SendCmd, config: &DurableConfig) -> Result<SendReport, Box<dyn Error + Send + Sync>> {
    let text = fs::read(&cmd.file)?;
    let limit = config.emitter_options().commit_size;
    let (transactions, blocks) = split_transactions(&text, limit);
    if blocks == 0 {
        return Err(format!("{} contains no complete op blocks", cmd.file.display()).into());
    }
    let timeout = Duration::from_secs(cmd.timeout);
    let ctx = GraphContext::with_options(&cmd.graph, ContextOptions::default(), config.producer_options());
    let id = ctx.attach_subscriber(&[cmd.to.as_str()], AttachMode::Normal, Some(timeout))?;
    let producers = ctx.producers();
    for (index, data) in transactions.iter().enumerate() {
        producers.commit(data, index as u64 + 1)?;
    }
    let settled = producers.wait_settled(timeout);
    let report = SendReport {
        endpoint: cmd.to.clone(),
        transactions: transactions.len(),
        blocks,
        bytes: transactions.iter().map(Vec::len).sum(),
        producer: producers.get(id),
    };
    ctx.shutdown();
    settled?;
    Ok(report)
}

/// Groups complete `OP` ... `ENDOP` blocks into transactions of about `limit` bytes.
fn split_transactions(text: &[u8], limit: usize) -> (Vec<Vec<u8>>, usize) {
    let mut transactions = Vec::new();
    let mut current = Vec::new();
    let mut block_start = 0usize;
    let mut blocks = 0usize;
    let mut offset = 0usize;
    for line in text.split_inclusive(|&b| b == b'\n') {
        offset += line.len();
        if !line.starts_with(b"ENDOP") || line.last() != Some(&b'\n') {
            continue;
        }
        current.extend_from_slice(&text[block_start..offset]);
        block_start = offset;
        blocks += 1;
        if current.len() >= limit {
            transactions.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        transactions.push(current);
    }
    (transactions, blocks)
}

fn validate(file: &Path, crc: bool, config: &DurableConfig) -> Result<ValidateReport, Box<dyn Error>> {
    let text = fs::read(file)?;
    let mut options = config.parser_options();
    options.exec = ExecMode::Simulate;
    options.validate = crc;
    let mut parser = OperationParser::new(options);
    let mut input = OperationBuffer::with_capacity_order(16, "validate");
    let mut target = DiscardTarget;
    for chunk in text.chunks(READ_CHUNK) {
        input.write(chunk)?;
        while parser.feed(&mut input, &mut target) == FeedOutcome::Yielded {}
    }
    if text.last().is_some_and(|&b| b != b'\n') {
        input.write(b"\n")?;
        while parser.feed(&mut input, &mut target) == FeedOutcome::Yielded {}
    }
    let stats = parser.stats().clone();
    let valid = stats.syntax_errors == 0
        && stats.permanent_errors == 0
        && stats.transaction_errors == 0
        && stats.crc_mismatches == 0
        && !parser.in_transaction();
    Ok(ValidateReport {
        file: file.to_path_buf(),
        valid,
        parser: stats,
    })
}

fn inspect_log(dir: &Path, list: bool) -> Result<LogReport, Box<dyn Error>> {
    if !dir.join(TXLOG_FILE_NAME).exists() {
        return Err(format!("no {TXLOG_FILE_NAME} in {}", dir.display()).into());
    }
    let log = TxLog::open(dir)?;
    let mut iter = log.iter()?;
    let mut report = LogReport {
        path: log.path().to_path_buf(),
        records: 0,
        bytes: 0,
        first_serial: None,
        last_serial: log.last_serial(),
        truncated_bytes: log.stats().truncated_bytes,
        entries: Vec::new(),
    };
    while let Some(record) = iter.next_record()? {
        report.records += 1;
        report.bytes += record.payload.len() as u64;
        report.first_serial.get_or_insert(record.serial);
        if list {
            report.entries.push(LogRecordRow {
                serial: record.serial,
                txid: record.txid,
                tms: record.tms,
                bytes: record.payload.len(),
                crc: format!("{:08X}", record.crc()),
            });
        }
    }
    Ok(report)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_serve_text(ui: &Ui, report: &ServeReport) {
    let stats = &report.consumer;
    ui.section(
        "Graph",
        [
            ("name", report.graph.clone()),
            ("fingerprint", report.fingerprint.to_string()),
            ("vertices", report.order.to_string()),
            ("arcs", report.size.to_string()),
            ("durable serial", report.durable.serial.to_string()),
        ],
    );
    ui.section(
        "Consumer",
        [
            ("connections", stats.connections.to_string()),
            ("transactions", stats.transactions.to_string()),
            ("executed", stats.executed.to_string()),
            ("duplicates", stats.duplicates.to_string()),
            ("retries", stats.retries.to_string()),
            ("rejected", stats.rejected.to_string()),
            ("resyncs", stats.resyncs.to_string()),
            ("bytes received", stats.bytes_received.to_string()),
        ],
    );
}

fn print_send_text(ui: &Ui, report: &SendReport) {
    ui.section(
        "Sent",
        [
            ("endpoint", report.endpoint.clone()),
            ("transactions", report.transactions.to_string()),
            ("blocks", report.blocks.to_string()),
            ("bytes", report.bytes.to_string()),
        ],
    );
    if let Some(producer) = &report.producer {
        ui.section(
            "Producer",
            [
                ("accepted", producer.accepted.to_string()),
                ("retries", producer.retries.to_string()),
                ("resyncs", producer.resyncs.to_string()),
                ("last serial", producer.last_serial.to_string()),
            ],
        );
    }
}

fn print_validate_text(ui: &Ui, report: &ValidateReport) {
    let stats = &report.parser;
    ui.section(
        "Parser",
        [
            ("transactions", stats.transactions),
            ("operations", stats.operations),
            ("opcodes", stats.opcodes),
            ("bytes", stats.bytes),
            ("syntax errors", stats.syntax_errors),
            ("crc mismatches", stats.crc_mismatches),
            ("transaction errors", stats.transaction_errors),
        ],
    );
    if report.valid {
        ui.success(&format!("{} is valid", report.file.display()));
    } else {
        let detail = stats.last_error.as_deref().unwrap_or("incomplete stream");
        ui.warn(&format!("{} is invalid: {detail}", report.file.display()));
    }
}

fn print_log_text(ui: &Ui, report: &LogReport) {
    ui.section(
        "Transaction log",
        [
            ("path", report.path.display().to_string()),
            ("records", report.records.to_string()),
            ("bytes", report.bytes.to_string()),
            (
                "first serial",
                report.first_serial.map_or_else(|| "-".to_string(), |sn| sn.to_string()),
            ),
            ("last serial", report.last_serial.to_string()),
            ("truncated bytes", report.truncated_bytes.to_string()),
        ],
    );
    if !report.entries.is_empty() {
        ui.list(
            "Records",
            report.entries.iter().map(|row| {
                format!(
                    "{:016X} {} tms={} bytes={} crc={}",
                    row.serial, row.txid, row.tms, row.bytes, row.crc
                )
            }),
        );
    }
}
