#![forbid(unsafe_code)]
//! Transactional consumer service: the inbound half of replication.
//!
//! One worker thread owns the listening socket, the single upstream
//! connection, the parser and the execution backlog. Every request line is
//! appended to the open transaction with a running CRC; `COMMIT` checks the
//! id and CRC, logs the transaction when the service is durable, queues it
//! for execution and answers `ACCEPTED`. Anything inconsistent answers
//! `RETRY` and the connection ignores input until the producer's `RESYNC`.
//!
//! Execution can be suspended at a transaction boundary (the readonly
//! coordinator does this through [`Suspendable`]). A durable service keeps
//! accepting into its backlog while suspended; a volatile one asks the
//! producer to hold off instead.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::graph::context::GraphContext;
use crate::graph::executor::GraphExecutor;
use crate::operation::parser::{
    DiscardTarget, ExecMode, FeedOutcome, OperationParser, OperationTarget, ParserOptions, ParserStats,
    SerialCheck,
};
use crate::primitives::buffer::OperationBuffer;
use crate::primitives::concurrency::Suspendable;
use crate::primitives::txlog::TxLog;
use crate::replication::durability::{DurabilityPoint, DurablePosition};
use crate::replication::protocol::{
    compatible, RejectReason, Request, Response, SuspendReason, IDLE_PERIOD, PROTOCOL,
    RESUME_PERIOD, TX_MAX_SIZE, VERSION,
};
use crate::types::{crc32_extend, now_millis, ObjectId, Result, SombraError};

/// Bytes accepted between snapshots before [`TransactionalConsumerService::snapshot_due`] fires.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = (1 << 29) * 16;
/// Most backlog bytes executed per worker pass.
pub const EXECUTE_CHUNK: usize = 64 << 20;

const READ_CHUNK: usize = 64 << 10;
const RECEIVE_PER_PASS: usize = 4 << 20;
const RESYNC_IDLE_LIMIT: u32 = 10;
const REFUSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Transaction id used when rejecting outside any transaction.
const NO_TRANSACTION: ObjectId = ObjectId(u128::MAX);

/// Consumer service tuning.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Listen address; port 0 picks an ephemeral port.
    pub bind: String,
    /// Transaction log directory. `None` keeps accepted transactions in memory only.
    pub durable: Option<PathBuf>,
    /// Re-execute the transaction log into the graph when the service starts.
    pub replay_log: bool,
    /// Accepted bytes after which [`TransactionalConsumerService::snapshot_due`] turns true.
    pub snapshot_threshold: u64,
    /// Parse and acknowledge without touching the graph.
    pub validate_only: bool,
    /// Parser tuning. Its `serial_check` applies per upstream session at
    /// `COMMIT`: `Strict` rejects a regressed serial, `Silent` logs it and
    /// applies the transaction, `Off` applies it quietly. A new `ATTACH`
    /// starts a new session, so a failed-over producer may start lower.
    pub parser: ParserOptions,
    /// Interval between `IDLE` heartbeats to the producer.
    pub idle_period: Duration,
    /// Quiet time after which a `RESUME` nudges a producer that may be holding off.
    pub resume_period: Duration,
    /// Transactions larger than this are rejected.
    pub max_tx_size: usize,
    pub max_line: usize,
    /// Unexecuted bytes that make the service ask its producer to hold off.
    pub backlog_limit: usize,
    /// Bytes fed to the parser per execution step.
    pub execute_chunk: usize,
    pub poll_interval: Duration,
    /// Admin port announced in `ATTACH`.
    pub adminport: u16,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            durable: None,
            replay_log: true,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            validate_only: false,
            parser: ParserOptions::default(),
            idle_period: IDLE_PERIOD,
            resume_period: RESUME_PERIOD,
            max_tx_size: TX_MAX_SIZE,
            max_line: 1 << 20,
            backlog_limit: 256 << 20,
            execute_chunk: EXECUTE_CHUNK,
            poll_interval: Duration::from_millis(5),
            adminport: 0,
        }
    }
}

impl ConsumerOptions {
    pub(crate) fn normalize(mut self) -> Self {
        if self.idle_period.is_zero() {
            self.idle_period = IDLE_PERIOD;
        }
        if self.resume_period.is_zero() {
            self.resume_period = RESUME_PERIOD;
        }
        self.max_tx_size = self.max_tx_size.max(1 << 10);
        self.max_line = self.max_line.clamp(256, self.max_tx_size);
        self.backlog_limit = self.backlog_limit.max(self.max_tx_size);
        self.execute_chunk = self.execute_chunk.max(1 << 10);
        self.snapshot_threshold = self.snapshot_threshold.max(1);
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_millis(1);
        }
        if self.validate_only {
            self.parser.exec = ExecMode::Simulate;
        }
        self
    }
}

/// Consumer counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConsumerStats {
    /// Producer connections accepted.
    pub connections: u64,
    /// Connections turned away because a producer was already attached.
    pub refused: u64,
    pub attached: bool,
    pub upstream_fingerprint: ObjectId,
    /// Transactions accepted for execution.
    pub transactions: u64,
    pub transaction_bytes: u64,
    /// Transactions acknowledged again without executing.
    pub duplicates: u64,
    /// Transactions applied to the graph.
    pub executed: u64,
    pub retries: u64,
    pub rejected: u64,
    pub resyncs: u64,
    pub idles_sent: u64,
    pub bytes_received: u64,
    /// Accepted bytes not yet executed.
    pub backlog_bytes: usize,
    pub backlog_transactions: usize,
    pub last_serial: u64,
    pub last_txid: ObjectId,
    /// Highest master serial seen in a transaction header.
    pub master_serial: u64,
    pub exec_suspended: bool,
    /// The producer was told to hold off until the backlog drains.
    pub input_throttled: bool,
    /// Bytes accepted since the last snapshot.
    pub snapshot_bytes: u64,
    pub parser: ParserStats,
}

#[derive(Default)]
struct ServiceState {
    suspend_requested: bool,
    exec_suspended: bool,
    disconnect_requested: bool,
    bytes_since_snapshot: u64,
    passes: u64,
    stats: ConsumerStats,
}

struct Shared {
    options: ConsumerOptions,
    state: Mutex<ServiceState>,
    changed: Condvar,
    durability: DurabilityPoint,
    /// Last transaction applied to the graph.
    executed: DurabilityPoint,
    /// Held by the worker while it executes and by a snapshot while it writes.
    exec_gate: Mutex<()>,
    stop: AtomicBool,
}

impl Suspendable for Shared {
    fn name(&self) -> &'static str {
        "tx_input"
    }

    fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire) && !self.state.lock().exec_suspended
    }

    fn suspend(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.exec_suspended || self.stop.load(Ordering::Acquire) {
            return Ok(false);
        }
        state.suspend_requested = true;
        self.changed.notify_all();
        while !state.exec_suspended {
            if self.changed.wait_until(&mut state, deadline).timed_out() && !state.exec_suspended {
                state.suspend_requested = false;
                return Err(SombraError::Timeout("transaction input suspend"));
            }
        }
        Ok(true)
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.suspend_requested = false;
        if state.exec_suspended {
            state.exec_suspended = false;
            self.changed.notify_all();
        }
        Ok(())
    }
}

/// Accepts transactions from one producer and replays them into a graph.
pub struct TransactionalConsumerService {
    ctx: Arc<GraphContext>,
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionalConsumerService {
    /// Binds the listener, opens the transaction log and starts the worker.
    ///
    /// The service registers itself as the graph's transaction input so a
    /// readonly transition suspends execution.
    pub fn bind(ctx: Arc<GraphContext>, options: ConsumerOptions) -> Result<Arc<Self>> {
        let options = options.normalize();
        let listener = TcpListener::bind(&options.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let txlog = match &options.durable {
            Some(dir) => Some(TxLog::open(dir)?),
            None => None,
        };
        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(ServiceState::default()),
            changed: Condvar::new(),
            durability: DurabilityPoint::new(),
            executed: DurabilityPoint::new(),
            exec_gate: Mutex::new(()),
            stop: AtomicBool::new(false),
        });
        let mut worker = Worker::new(Arc::clone(&ctx), Arc::clone(&shared), listener, txlog);
        worker.restore()?;
        let handle = thread::Builder::new()
            .name(format!("sombra-consumer-{}", local_addr.port()))
            .spawn(move || worker.run())?;
        let input: Arc<dyn Suspendable> = shared.clone();
        ctx.set_tx_input(Some(input));
        info!(
            graph = %ctx.name(),
            addr = %local_addr,
            durable = shared.options.durable.is_some(),
            "consumer.listening"
        );
        Ok(Arc::new(Self {
            ctx,
            shared,
            local_addr,
            worker: Mutex::new(Some(handle)),
        }))
    }

    /// Bound address, with the ephemeral port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.shared.options
    }

    /// Graph the service executes into.
    pub fn context(&self) -> &Arc<GraphContext> {
        &self.ctx
    }

    /// Last transaction that is durable: logged for a durable service,
    /// executed for a volatile one.
    pub fn durability(&self) -> &DurabilityPoint {
        &self.shared.durability
    }

    /// Last transaction applied to the graph. Trails
    /// [`durability`](Self::durability) while a durable backlog is pending.
    pub fn executed(&self) -> DurablePosition {
        self.shared.executed.get()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ConsumerStats {
        let state = self.shared.state.lock();
        let mut stats = state.stats.clone();
        stats.snapshot_bytes = state.bytes_since_snapshot;
        stats
    }

    /// Stops executing at the next transaction boundary.
    ///
    /// Returns false when execution was already suspended.
    pub fn suspend_execution(&self, timeout: Duration) -> Result<bool> {
        self.shared.suspend(timeout)
    }

    /// Undoes [`Self::suspend_execution`]; queued transactions run next.
    pub fn resume_execution(&self) -> Result<()> {
        self.shared.resume()
    }

    pub fn is_execution_suspended(&self) -> bool {
        self.shared.state.lock().exec_suspended
    }

    /// True once `snapshot_threshold` bytes were accepted since the last snapshot.
    pub fn snapshot_due(&self) -> bool {
        self.shared.state.lock().bytes_since_snapshot >= self.shared.options.snapshot_threshold
    }

    /// Runs `write` as a snapshot of the graph at its executed position.
    ///
    /// Execution is held off while `write` runs, so the position matches the
    /// graph it is handed with. Logged transactions still in the backlog are
    /// past the position and replay on top of the snapshot. The byte counter
    /// behind [`snapshot_due`](Self::snapshot_due) restarts when `write`
    /// succeeds.
    pub fn snapshot<R>(&self, write: impl FnOnce(DurablePosition) -> Result<R>) -> Result<R> {
        let durability = &self.shared.durability;
        let gate = self.shared.exec_gate.lock();
        durability.begin_serialization();
        let position = self.shared.executed.get();
        let result = write(position);
        durability.end_serialization();
        drop(gate);
        if result.is_ok() {
            self.acknowledge_snapshot();
            info!(serial = position.serial, txid = %position.txid, "consumer.snapshot");
        }
        result
    }

    /// Restarts the snapshot byte counter.
    pub fn acknowledge_snapshot(&self) {
        self.shared.state.lock().bytes_since_snapshot = 0;
    }

    /// Drops the upstream connection; the producer reconnects on its own.
    pub fn disconnect(&self) {
        self.shared.state.lock().disconnect_requested = true;
        self.shared.changed.notify_all();
    }

    /// Waits until every transaction accepted before the call has executed.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        let start = state.passes;
        while state.passes < start + 2
            || state.stats.backlog_transactions > 0
            || state.stats.backlog_bytes > 0
        {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                return Err(SombraError::Timeout("consumer backlog"));
            }
        }
        Ok(())
    }

    /// Stops the worker and unregisters from the graph. Idempotent.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.changed.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(addr = %self.local_addr, "consumer.worker_panicked");
            }
            self.ctx.set_tx_input(None);
            info!(addr = %self.local_addr, "consumer.stopped");
        }
    }
}

impl Drop for TransactionalConsumerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TransactionalConsumerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalConsumerService")
            .field("graph", &self.ctx.name())
            .field("addr", &self.local_addr)
            .field("durability", &self.shared.durability.get())
            .finish()
    }
}

struct IncomingTx {
    txid: ObjectId,
    serial: u64,
    master_serial: u64,
    crc: u32,
    data: Vec<u8>,
}

struct Client {
    peer: SocketAddr,
    stream: TcpStream,
    inbuf: OperationBuffer,
    out: Vec<u8>,
    eof: bool,
    closing: bool,
    attached: bool,
    resync_pending: bool,
    retry_txid: ObjectId,
    resync_txid: Option<ObjectId>,
    idles_while_resync: u32,
    tx: Option<IncomingTx>,
}

impl Client {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            peer,
            stream,
            inbuf: OperationBuffer::with_capacity_order(16, "sysin"),
            out: Vec::with_capacity(1024),
            eof: false,
            closing: false,
            attached: false,
            resync_pending: false,
            retry_txid: ObjectId::NONE,
            resync_txid: None,
            idles_while_resync: 0,
            tx: None,
        }
    }

    fn respond(&mut self, response: &Response, accepted_size: Option<usize>) {
        trace!(peer = %self.peer, ?response, "consumer.respond");
        response.encode(&mut self.out, accepted_size);
    }

    fn receive(&mut self) -> Result<usize> {
        let mut received = 0;
        while received < RECEIVE_PER_PASS {
            let segment = self.inbuf.writable_segment(READ_CHUNK)?;
            let window = segment.len().min(READ_CHUNK);
            match self.stream.read(&mut segment[..window]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.inbuf.advance_write(n)?;
                    received += n;
                    if n < window {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(received)
    }

    fn flush(&mut self) -> Result<()> {
        let mut sent = 0;
        while sent < self.out.len() {
            match self.stream.write(&self.out[sent..]) {
                Ok(0) => return Err(SombraError::Closed("producer connection")),
                Ok(n) => sent += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.out.drain(..sent);
        Ok(())
    }
}

struct Submitted {
    txid: ObjectId,
    serial: u64,
    tms: u64,
    remaining: usize,
}

struct Worker {
    ctx: Arc<GraphContext>,
    shared: Arc<Shared>,
    listener: TcpListener,
    client: Option<Client>,
    parser: OperationParser,
    target: Box<dyn OperationTarget + Send>,
    input: OperationBuffer,
    submitted: VecDeque<Submitted>,
    txlog: Option<TxLog>,
    serial_check: SerialCheck,
    /// Highest serial accepted overall, the log included.
    last_serial: u64,
    /// Highest serial and its transaction accepted since the current `ATTACH`.
    session_serial: u64,
    session_txid: ObjectId,
    master_serial: u64,
    backoff_until: Option<Instant>,
    exec_suspended: bool,
    throttled: bool,
    last_tx: Instant,
    last_resume: Instant,
    last_idle: Instant,
    stats: ConsumerStats,
}

impl Worker {
    fn new(ctx: Arc<GraphContext>, shared: Arc<Shared>, listener: TcpListener, txlog: Option<TxLog>) -> Self {
        let options = &shared.options;
        let target: Box<dyn OperationTarget + Send> = if options.validate_only {
            Box::new(DiscardTarget)
        } else {
            Box::new(GraphExecutor::new(Arc::clone(&ctx)))
        };
        let now = Instant::now();
        // Serials are checked per session at COMMIT; the backlog and the log
        // may span several upstreams.
        let parser = OperationParser::new(ParserOptions {
            serial_check: SerialCheck::Off,
            ..options.parser.clone()
        });
        Self {
            parser,
            serial_check: options.parser.serial_check,
            target,
            input: OperationBuffer::with_capacity_order(16, "txinput"),
            submitted: VecDeque::new(),
            last_serial: txlog.as_ref().map_or(0, TxLog::last_serial),
            txlog,
            session_serial: 0,
            session_txid: ObjectId::NONE,
            master_serial: 0,
            backoff_until: None,
            exec_suspended: false,
            throttled: false,
            last_tx: now,
            last_resume: now,
            last_idle: now,
            stats: ConsumerStats::default(),
            ctx,
            shared,
            listener,
            client: None,
        }
    }

    /// Moves the durability point to the end of the log and queues the
    /// logged transactions for replay.
    fn restore(&mut self) -> Result<()> {
        let Some(log) = &self.txlog else {
            return Ok(());
        };
        let replay = self.shared.options.replay_log;
        let mut replayed = 0u64;
        for record in log.iter()? {
            let record = record?;
            self.shared.durability.advance(record.txid, record.serial, record.tms);
            if !replay {
                self.shared.executed.advance(record.txid, record.serial, record.tms);
            } else {
                self.input.write(&record.payload)?;
                self.submitted.push_back(Submitted {
                    txid: record.txid,
                    serial: record.serial,
                    tms: record.tms,
                    remaining: record.payload.len(),
                });
                replayed += 1;
            }
        }
        self.stats.last_serial = self.last_serial;
        if self.last_serial > 0 {
            info!(last_serial = self.last_serial, replayed, "consumer.log_restored");
        }
        Ok(())
    }

    fn run(mut self) {
        debug!(addr = ?self.listener.local_addr().ok(), "consumer.worker_started");
        while !self.shared.stop.load(Ordering::Acquire) {
            let mut busy = self.accept();
            busy |= self.service_client();
            self.control();
            busy |= self.execute();
            self.heartbeat();
            self.publish();
            if !busy {
                let mut state = self.shared.state.lock();
                if !state.suspend_requested && !state.disconnect_requested && !self.shared.stop.load(Ordering::Acquire) {
                    self.shared
                        .changed
                        .wait_for(&mut state, self.shared.options.poll_interval);
                }
            }
        }
        if let Some(mut client) = self.client.take() {
            client.respond(&Response::Detach, None);
            self.close_client(client, "service stopping");
        }
        self.publish();
        debug!("consumer.worker_stopped");
    }

    fn accept(&mut self) -> bool {
        let mut accepted = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    accepted = true;
                    if self.client.is_some() {
                        self.refuse(stream, peer);
                        continue;
                    }
                    if let Err(err) = stream.set_nonblocking(true).and_then(|()| stream.set_nodelay(true)) {
                        warn!(%peer, error = %err, "consumer.socket_setup_failed");
                        continue;
                    }
                    info!(%peer, "consumer.connected");
                    self.stats.connections += 1;
                    self.client = Some(Client::new(stream, peer));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(error = %err, "consumer.accept_failed");
                    break;
                }
            }
        }
        accepted
    }

    fn refuse(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        warn!(%peer, "consumer.extra_connection_refused");
        self.stats.refused += 1;
        let detach = Response::Detach.to_bytes();
        let result = stream
            .set_write_timeout(Some(REFUSE_TIMEOUT))
            .and_then(|()| stream.write_all(&detach));
        if let Err(err) = result {
            debug!(%peer, error = %err, "consumer.refuse_send_failed");
        }
        let _ = stream.shutdown(Shutdown::Both);
    }

    fn service_client(&mut self) -> bool {
        let Some(mut client) = self.client.take() else {
            return false;
        };
        let step = client.receive().and_then(|received| {
            self.stats.bytes_received += received as u64;
            self.process_requests(&mut client)?;
            client.flush()?;
            Ok(received)
        });
        match step {
            Ok(received) if client.closing || client.eof => {
                let reason = if client.closing { "detached" } else { "peer closed" };
                self.close_client(client, reason);
                received > 0
            }
            Ok(received) => {
                self.client = Some(client);
                received > 0
            }
            Err(err) => {
                warn!(peer = %client.peer, error = %err, "consumer.connection_lost");
                self.close_client(client, "connection lost");
                false
            }
        }
    }

    fn close_client(&mut self, mut client: Client, reason: &str) {
        if let Err(err) = client.flush() {
            debug!(peer = %client.peer, error = %err, "consumer.final_flush_failed");
        }
        let _ = client.stream.shutdown(Shutdown::Both);
        if client.tx.is_some() {
            debug!(peer = %client.peer, "consumer.partial_transaction_dropped");
        }
        info!(peer = %client.peer, reason, "consumer.disconnected");
        self.stats.attached = false;
    }

    fn process_requests(&mut self, client: &mut Client) -> Result<()> {
        let max_line = self.shared.options.max_line;
        while let Some(line) = client.inbuf.read_until(max_line, b'\n') {
            let unconfirmed = client.inbuf.unconfirmed();
            client.inbuf.confirm(unconfirmed)?;
            if line.last() != Some(&b'\n') {
                let txid = client.tx.take().map_or(NO_TRANSACTION, |tx| tx.txid);
                error!(peer = %client.peer, txid = %txid, max_line, "consumer.oversized_line");
                self.reject(client, txid, RejectReason::OversizedTxLine);
                client.inbuf.clear();
                break;
            }
            self.handle_line(client, &line)?;
            if client.closing {
                break;
            }
        }
        Ok(())
    }

    fn handle_line(&mut self, client: &mut Client, line: &[u8]) -> Result<()> {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(err) => {
                warn!(peer = %client.peer, error = %err, "consumer.bad_request");
                if let Some(tx) = client.tx.take() {
                    self.retry(client, tx.txid, SuspendReason::after_millis(1));
                }
                return Ok(());
            }
        };
        if !client.attached {
            match request {
                Request::Attach {
                    protocol,
                    version,
                    fingerprint,
                    ..
                } => self.handle_attach(client, protocol, version, fingerprint),
                Request::Blank => {}
                _ => {
                    warn!(peer = %client.peer, "consumer.request_before_attach");
                    client.respond(&Response::Detach, None);
                    client.closing = true;
                }
            }
            return Ok(());
        }
        if client.resync_pending {
            match request {
                Request::Resync { txid, discard } => self.handle_resync(client, txid, discard),
                Request::Idle { tms, fingerprint } => {
                    client.idles_while_resync += 1;
                    if client.idles_while_resync > RESYNC_IDLE_LIMIT {
                        client.idles_while_resync = 0;
                        debug!(peer = %client.peer, txid = %client.retry_txid, "consumer.retry_repeated");
                        let txid = client.retry_txid;
                        client.respond(
                            &Response::Retry {
                                txid,
                                reason: SuspendReason::after_millis(1),
                            },
                            None,
                        );
                    }
                    self.handle_idle(client, tms, fingerprint);
                }
                Request::Attach {
                    protocol,
                    version,
                    fingerprint,
                    ..
                } => self.handle_attach(client, protocol, version, fingerprint),
                Request::Detach => self.handle_detach(client),
                _ => {}
            }
            return Ok(());
        }
        match request {
            Request::Attach {
                protocol,
                version,
                fingerprint,
                ..
            } => self.handle_attach(client, protocol, version, fingerprint),
            Request::Transaction {
                txid,
                serial,
                master_serial,
            } => self.begin_transaction(client, line, txid, serial, master_serial),
            Request::Commit { txid, tms, crc } => self.handle_commit(client, line, txid, tms, crc)?,
            Request::Resync { txid, discard } => self.handle_resync(client, txid, discard),
            Request::Idle { tms, fingerprint } => self.handle_idle(client, tms, fingerprint),
            Request::Detach => self.handle_detach(client),
            Request::Body | Request::Blank => self.append_line(client, line, &request),
        }
        Ok(())
    }

    fn handle_attach(&mut self, client: &mut Client, protocol: u32, version: u32, fingerprint: ObjectId) {
        if self.ctx.is_readonly() {
            warn!(peer = %client.peer, "consumer.attach_refused_readonly");
            self.reject(client, NO_TRANSACTION, RejectReason::Readonly);
            client.respond(&Response::Detach, None);
            client.closing = true;
            return;
        }
        if !compatible(protocol, version) {
            warn!(
                peer = %client.peer,
                protocol = format_args!("{protocol:08X}"),
                version = format_args!("{version:08X}"),
                "consumer.attach_incompatible"
            );
            client.respond(&Response::Detach, None);
            client.closing = true;
            return;
        }
        client.attached = true;
        client.tx = None;
        client.resync_pending = false;
        self.session_serial = 0;
        self.session_txid = ObjectId::NONE;
        self.stats.attached = true;
        self.stats.upstream_fingerprint = fingerprint;
        client.respond(
            &Response::Attach {
                protocol: PROTOCOL,
                version: VERSION,
                fingerprint: self.ctx.fingerprint(),
                adminport: self.shared.options.adminport,
            },
            None,
        );
        if (self.exec_suspended && self.txlog.is_none()) || self.throttled {
            client.respond(&Response::Suspend(SuspendReason::INDEFINITE), None);
        }
        self.last_idle = Instant::now();
        info!(peer = %client.peer, upstream = %fingerprint, "consumer.attached");
    }

    fn handle_detach(&mut self, client: &mut Client) {
        info!(peer = %client.peer, "consumer.detach_requested");
        client.closing = true;
    }

    fn handle_idle(&mut self, client: &mut Client, tms: u64, fingerprint: ObjectId) {
        if !fingerprint.is_none() {
            self.stats.upstream_fingerprint = fingerprint;
        }
        trace!(peer = %client.peer, lag_ms = now_millis().saturating_sub(tms), "consumer.upstream_idle");
        self.send_idle(client);
    }

    fn send_idle(&mut self, client: &mut Client) {
        client.respond(
            &Response::Idle {
                tms: now_millis(),
                fingerprint: self.ctx.fingerprint(),
                master_serial: self.master_serial,
            },
            None,
        );
        self.last_idle = Instant::now();
        self.stats.idles_sent += 1;
    }

    fn handle_resync(&mut self, client: &mut Client, txid: ObjectId, discard: u64) {
        if client.resync_pending {
            info!(peer = %client.peer, txid = %txid, discard, "consumer.resync");
            self.stats.resyncs += 1;
        } else {
            debug!(peer = %client.peer, txid = %txid, "consumer.resync_unsolicited");
        }
        client.resync_pending = false;
        client.idles_while_resync = 0;
        client.resync_txid = Some(txid);
        client.tx = None;
    }

    fn begin_transaction(&mut self, client: &mut Client, line: &[u8], txid: ObjectId, serial: u64, master_serial: u64) {
        if let Some(open) = client.tx.take() {
            warn!(peer = %client.peer, txid = %open.txid, "consumer.incomplete_transaction_dropped");
        }
        if let Some(expected) = client.resync_txid.take() {
            if expected != txid {
                warn!(peer = %client.peer, expected = %expected, got = %txid, "consumer.resync_mismatch");
            }
        }
        client.tx = Some(IncomingTx {
            txid,
            serial,
            master_serial,
            crc: crc32_extend(0, line),
            data: line.to_vec(),
        });
    }

    fn append_line(&mut self, client: &mut Client, line: &[u8], request: &Request) {
        let Some(tx) = client.tx.as_mut() else {
            if *request == Request::Body {
                debug!(peer = %client.peer, "consumer.line_outside_transaction");
            }
            return;
        };
        if tx.data.len() + line.len() > self.shared.options.max_tx_size {
            let txid = tx.txid;
            client.tx = None;
            error!(peer = %client.peer, txid = %txid, limit = self.shared.options.max_tx_size, "consumer.oversized_transaction");
            self.reject(client, txid, RejectReason::OversizedTxData);
            return;
        }
        tx.crc = crc32_extend(tx.crc, line);
        tx.data.extend_from_slice(line);
    }

    fn handle_commit(&mut self, client: &mut Client, line: &[u8], txid: ObjectId, tms: u64, crc: u32) -> Result<()> {
        let Some(tx) = client.tx.take() else {
            warn!(peer = %client.peer, txid = %txid, "consumer.commit_without_transaction");
            self.retry(client, txid, SuspendReason::after_millis(1));
            return Ok(());
        };
        if tx.txid != txid || tx.crc != crc {
            warn!(
                peer = %client.peer,
                expected = %tx.txid,
                got = %txid,
                crc_expected = format_args!("{crc:08X}"),
                crc_actual = format_args!("{:08X}", tx.crc),
                "consumer.transaction_mismatch"
            );
            self.retry(client, txid, SuspendReason::after_millis(1));
            return Ok(());
        }
        if tx.serial <= self.session_serial {
            if txid == self.session_txid {
                debug!(peer = %client.peer, txid = %txid, serial = tx.serial, "consumer.duplicate_transaction");
                self.stats.duplicates += 1;
                client.respond(&Response::Accepted { txid, crc }, Some(tx.data.len()));
                return Ok(());
            }
            match self.serial_check {
                SerialCheck::Strict => {
                    warn!(
                        peer = %client.peer,
                        txid = %txid,
                        serial = tx.serial,
                        last = self.session_serial,
                        "consumer.serial_regression_rejected"
                    );
                    self.reject(client, txid, RejectReason::General);
                    return Ok(());
                }
                SerialCheck::Silent => {
                    warn!(txid = %txid, serial = tx.serial, last = self.session_serial, "consumer.serial_regression");
                }
                SerialCheck::Off => {
                    debug!(txid = %txid, serial = tx.serial, last = self.session_serial, "consumer.serial_regression");
                }
            }
        } else if self.session_serial == 0 && tx.serial <= self.last_serial {
            info!(
                peer = %client.peer,
                serial = tx.serial,
                previous = self.last_serial,
                "consumer.serial_rebased"
            );
        }
        if self.exec_suspended && !self.shared.state.lock().exec_suspended {
            self.resumed();
            if !self.throttled {
                client.respond(&Response::Resume, None);
                self.last_resume = Instant::now();
            }
        }
        if self.exec_suspended && self.txlog.is_none() {
            debug!(peer = %client.peer, txid = %txid, "consumer.execution_suspended_retry");
            self.retry(client, txid, SuspendReason::INDEFINITE);
            return Ok(());
        }

        let mut data = tx.data;
        data.extend_from_slice(line);
        if let Some(log) = &self.txlog {
            if let Err(err) = log.append(tx.serial, txid, tms, &data).and_then(|()| log.sync()) {
                error!(txid = %txid, error = %err, "consumer.txlog_append_failed");
                self.retry(client, txid, SuspendReason::after_millis(1000));
                return Ok(());
            }
            self.shared.durability.advance(txid, tx.serial, tms);
        }
        if let Err(err) = self.input.write(&data) {
            error!(txid = %txid, error = %err, "consumer.backlog_full");
            self.retry(client, txid, SuspendReason::after_millis(1000));
            return Ok(());
        }
        self.submitted.push_back(Submitted {
            txid,
            serial: tx.serial,
            tms,
            remaining: data.len(),
        });
        self.last_serial = tx.serial;
        if tx.serial >= self.session_serial {
            self.session_serial = tx.serial;
            self.session_txid = txid;
        }
        self.master_serial = self.master_serial.max(tx.master_serial);
        self.last_tx = Instant::now();
        self.stats.transactions += 1;
        self.stats.transaction_bytes += data.len() as u64;
        self.stats.last_serial = tx.serial;
        self.stats.last_txid = txid;
        self.shared.state.lock().bytes_since_snapshot += data.len() as u64;
        debug!(txid = %txid, serial = tx.serial, bytes = data.len(), "consumer.accepted");
        client.respond(&Response::Accepted { txid, crc }, Some(data.len()));

        if !self.throttled && self.input.readable() > self.shared.options.backlog_limit {
            self.throttled = true;
            warn!(backlog = self.input.readable(), "consumer.input_throttled");
            client.respond(&Response::Suspend(SuspendReason::INDEFINITE), None);
        }
        Ok(())
    }

    fn retry(&mut self, client: &mut Client, txid: ObjectId, reason: SuspendReason) {
        client.tx = None;
        client.resync_pending = true;
        client.retry_txid = txid;
        client.idles_while_resync = 0;
        self.stats.retries += 1;
        client.respond(&Response::Retry { txid, reason }, None);
    }

    fn reject(&mut self, client: &mut Client, txid: ObjectId, reason: RejectReason) {
        self.stats.rejected += 1;
        client.respond(
            &Response::Rejected {
                txid,
                reason: reason.code(),
            },
            None,
        );
    }

    /// Applies suspend, resume and disconnect requests.
    fn control(&mut self) {
        let (suspend_requested, exec_suspended, disconnect) = {
            let mut state = self.shared.state.lock();
            (
                state.suspend_requested,
                state.exec_suspended,
                std::mem::take(&mut state.disconnect_requested),
            )
        };
        if disconnect {
            if let Some(client) = self.client.take() {
                self.close_client(client, "disconnect requested");
            }
        }
        if self.exec_suspended && !exec_suspended {
            self.resumed();
            if !self.throttled {
                self.send_resume();
            }
        }
        if suspend_requested && !self.exec_suspended && self.at_boundary() {
            self.exec_suspended = true;
            {
                let mut state = self.shared.state.lock();
                state.exec_suspended = true;
                state.suspend_requested = false;
            }
            self.shared.changed.notify_all();
            info!(backlog = self.input.readable(), "consumer.execution_suspended");
            if self.txlog.is_none() {
                if let Some(client) = self.client.as_mut() {
                    client.respond(&Response::Suspend(SuspendReason::INDEFINITE), None);
                }
            }
        }
    }

    fn resumed(&mut self) {
        self.exec_suspended = false;
        self.backoff_until = None;
        info!(backlog = self.input.readable(), "consumer.execution_resumed");
    }

    /// No block or vertex lock is open, and nothing is left that only
    /// lives in memory.
    fn at_boundary(&self) -> bool {
        !self.parser.in_transaction()
            && self.target.held_locks() == 0
            && (self.txlog.is_some() || !self.input.has_readable())
    }

    fn execute(&mut self) -> bool {
        if self.exec_suspended || !self.input.has_readable() {
            return false;
        }
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return false;
            }
            self.backoff_until = None;
        }
        let shared = Arc::clone(&self.shared);
        let _gate = shared.exec_gate.lock();
        let before = self.parser.stats().bytes;
        let chunk = self.shared.options.execute_chunk as u64;
        let outcome = loop {
            let outcome = self.parser.feed(&mut self.input, &mut *self.target);
            if outcome != FeedOutcome::Yielded || self.parser.stats().bytes - before >= chunk {
                break outcome;
            }
        };
        if let FeedOutcome::Backoff(delay) = outcome {
            debug!(delay_ms = delay.as_millis() as u64, "consumer.execution_backoff");
            self.backoff_until = Some(Instant::now() + delay);
        }
        let executed = self.parser.stats().bytes - before;
        self.retire(executed as usize);
        if self.throttled && self.input.readable() <= self.shared.options.backlog_limit / 2 {
            self.throttled = false;
            info!(backlog = self.input.readable(), "consumer.input_unthrottled");
            self.send_resume();
        }
        executed > 0
    }

    fn retire(&mut self, mut executed: usize) {
        let durable = self.txlog.is_some();
        while executed > 0 {
            let Some(front) = self.submitted.front_mut() else {
                break;
            };
            let take = front.remaining.min(executed);
            front.remaining -= take;
            executed -= take;
            if front.remaining > 0 {
                break;
            }
            if let Some(done) = self.submitted.pop_front() {
                self.stats.executed += 1;
                self.shared.executed.advance(done.txid, done.serial, done.tms);
                if !durable {
                    self.shared.durability.advance(done.txid, done.serial, done.tms);
                }
                trace!(txid = %done.txid, serial = done.serial, "consumer.executed");
            }
        }
    }

    fn send_resume(&mut self) {
        if let Some(client) = self.client.as_mut() {
            if client.attached {
                client.respond(&Response::Resume, None);
            }
        }
        self.last_resume = Instant::now();
    }

    /// Periodic `IDLE` status and the `RESUME` nudge for a quiet producer.
    fn heartbeat(&mut self) {
        let Some(mut client) = self.client.take() else {
            return;
        };
        if client.attached && !client.closing {
            let idle_period = self.shared.options.idle_period;
            let resume_period = self.shared.options.resume_period;
            if self.last_idle.elapsed() >= idle_period {
                self.send_idle(&mut client);
            }
            if !self.exec_suspended
                && !self.throttled
                && self.last_tx.elapsed() > resume_period
                && self.last_resume.elapsed() > resume_period
            {
                client.respond(&Response::Resume, None);
                self.last_resume = Instant::now();
            }
            if let Err(err) = client.flush() {
                warn!(peer = %client.peer, error = %err, "consumer.connection_lost");
                self.close_client(client, "connection lost");
                return;
            }
        }
        self.client = Some(client);
    }

    fn publish(&mut self) {
        self.stats.backlog_bytes = self.input.readable();
        self.stats.backlog_transactions = self.submitted.len();
        self.stats.master_serial = self.master_serial;
        self.stats.exec_suspended = self.exec_suspended;
        self.stats.input_throttled = self.throttled;
        self.stats.parser = self.parser.stats().clone();
        let mut state = self.shared.state.lock();
        let snapshot_bytes = state.bytes_since_snapshot;
        state.stats = self.stats.clone();
        state.stats.snapshot_bytes = snapshot_bytes;
        state.passes += 1;
        drop(state);
        self.shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::op::OpBlock;
    use crate::operation::operator::Operator;
    use crate::replication::transaction::{write_transaction, SerialSequence};
    use crate::types::OpId;
    use std::io::{BufRead, BufReader};

    struct Upstream {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl Upstream {
        fn connect(addr: SocketAddr) -> Self {
            let writer = TcpStream::connect(addr).expect("connect");
            writer
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("timeout");
            let reader = BufReader::new(writer.try_clone().expect("clone"));
            Self { reader, writer }
        }

        fn send(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).expect("send");
        }

        fn request(&mut self, request: &Request) {
            self.send(&request.to_bytes());
        }

        fn attach(&mut self) -> Response {
            self.request(&Request::Attach {
                protocol: PROTOCOL,
                version: VERSION,
                fingerprint: ObjectId::from_name("upstream"),
                adminport: 0,
            });
            self.response()
        }

        /// Next response other than an unsolicited `IDLE` or `RESUME`.
        fn response(&mut self) -> Response {
            loop {
                let mut line = String::new();
                assert!(self.reader.read_line(&mut line).expect("read") > 0, "consumer closed");
                match Response::parse(line.as_bytes()).expect("parse") {
                    Some(Response::Idle { .. }) | Some(Response::Resume) | None => {}
                    Some(response) => return response,
                }
            }
        }

        fn closed(&mut self) -> bool {
            let mut line = String::new();
            loop {
                line.clear();
                match self.reader.read_line(&mut line) {
                    Ok(0) => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        }
    }

    fn vertex_tx(seq: &mut SerialSequence, graph: ObjectId, name: &str) -> (Vec<u8>, ObjectId) {
        let mut block = OpBlock::for_vertex(graph, ObjectId::from_name(name));
        block.push(Operator::vertex_new(name, 0x11, 0, 0));
        block.opid = OpId(seq.count() + 1);
        let mut out = OperationBuffer::with_capacity_order(10, "tx");
        let tx = write_transaction(&mut out, seq, &block.to_bytes(), 0, now_millis()).expect("frame");
        (out.peek(tx.tsize), tx.txid)
    }

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            poll_interval: Duration::from_millis(1),
            idle_period: Duration::from_secs(60),
            resume_period: Duration::from_secs(60),
            ..ConsumerOptions::default()
        }
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn accepts_and_executes_transactions() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), options())?;
        let mut up = Upstream::connect(service.local_addr());
        assert!(matches!(up.attach(), Response::Attach { protocol: PROTOCOL, .. }));

        let mut seq = SerialSequence::starting_at(1000, 1);
        let (bytes, txid) = vertex_tx(&mut seq, ctx.obid(), "a");
        up.send(&bytes);
        assert!(matches!(up.response(), Response::Accepted { txid: id, .. } if id == txid));
        service.wait_idle(Duration::from_secs(5))?;
        wait_for("execution", || ctx.store().order() == 1);
        let position = service.durability().get();
        assert_eq!((position.txid, position.serial), (txid, 1001));
        let stats = service.stats();
        assert_eq!(stats.transactions, 1);
        assert_eq!(stats.executed, 1);
        assert!(stats.attached);
        Ok(())
    }

    #[test]
    fn crc_mismatch_retries_until_resync() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), options())?;
        let mut up = Upstream::connect(service.local_addr());
        up.attach();

        let mut seq = SerialSequence::starting_at(2000, 2);
        let (good, txid) = vertex_tx(&mut seq, ctx.obid(), "b");
        let mut bad = good.clone();
        let flip = bad.iter().position(|b| *b == b'v').expect("operator line");
        bad[flip] = b'V';
        up.send(&bad);
        assert!(matches!(up.response(), Response::Retry { txid: id, .. } if id == txid));
        // Ignored until RESYNC.
        up.send(&good);
        up.request(&Request::Resync { txid, discard: 0 });
        up.send(&good);
        assert!(matches!(up.response(), Response::Accepted { txid: id, .. } if id == txid));
        wait_for("execution", || ctx.store().order() == 1);
        let stats = service.stats();
        assert_eq!((stats.retries, stats.resyncs, stats.transactions), (1, 1, 1));
        Ok(())
    }

    #[test]
    fn duplicate_serials_are_acknowledged_without_executing() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), options())?;
        let mut up = Upstream::connect(service.local_addr());
        up.attach();
        let mut seq = SerialSequence::starting_at(3000, 3);
        let (bytes, txid) = vertex_tx(&mut seq, ctx.obid(), "c");
        up.send(&bytes);
        up.send(&bytes);
        for _ in 0..2 {
            assert!(matches!(up.response(), Response::Accepted { txid: id, .. } if id == txid));
        }
        service.wait_idle(Duration::from_secs(5))?;
        wait_for("stats", || service.stats().duplicates == 1);
        assert_eq!(service.stats().executed, 1);
        Ok(())
    }

    #[test]
    fn requests_before_attach_are_refused() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(ctx, options())?;
        let mut up = Upstream::connect(service.local_addr());
        up.request(&Request::Idle {
            tms: now_millis(),
            fingerprint: ObjectId::NONE,
        });
        assert_eq!(up.response(), Response::Detach);
        assert!(up.closed());
        Ok(())
    }

    #[test]
    fn readonly_graph_rejects_attach() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), options())?;
        ctx.set_readonly(Some(Duration::from_secs(5)), false)?;
        let mut up = Upstream::connect(service.local_addr());
        assert_eq!(
            up.attach(),
            Response::Rejected {
                txid: NO_TRANSACTION,
                reason: RejectReason::Readonly.code()
            }
        );
        assert_eq!(up.response(), Response::Detach);
        ctx.clear_readonly()?;
        Ok(())
    }

    #[test]
    fn oversized_transaction_is_rejected() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(
            ctx,
            ConsumerOptions {
                max_tx_size: 1024,
                ..options()
            },
        )?;
        let mut up = Upstream::connect(service.local_addr());
        up.attach();
        let txid = ObjectId::from_name("big");
        up.request(&Request::Transaction {
            txid,
            serial: 1,
            master_serial: 0,
        });
        for _ in 0..40 {
            up.send(b"# padding padding padding padding\n");
        }
        assert_eq!(
            up.response(),
            Response::Rejected {
                txid,
                reason: RejectReason::OversizedTxData.code()
            }
        );
        Ok(())
    }

    #[test]
    fn second_connection_is_detached() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(ctx, options())?;
        let mut first = Upstream::connect(service.local_addr());
        first.attach();
        let mut second = Upstream::connect(service.local_addr());
        assert_eq!(second.response(), Response::Detach);
        wait_for("refusal", || service.stats().refused == 1);
        Ok(())
    }

    #[test]
    fn volatile_suspend_asks_the_producer_to_wait() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), options())?;
        let mut up = Upstream::connect(service.local_addr());
        up.attach();
        assert!(service.suspend_execution(Duration::from_secs(5))?);
        assert!(!service.suspend_execution(Duration::from_secs(5))?);
        assert_eq!(up.response(), Response::Suspend(SuspendReason::INDEFINITE));

        let mut seq = SerialSequence::starting_at(4000, 4);
        let (bytes, txid) = vertex_tx(&mut seq, ctx.obid(), "d");
        up.send(&bytes);
        assert_eq!(
            up.response(),
            Response::Retry {
                txid,
                reason: SuspendReason::INDEFINITE
            }
        );
        service.resume_execution()?;
        up.request(&Request::Resync { txid, discard: 0 });
        up.send(&bytes);
        assert!(matches!(up.response(), Response::Accepted { txid: id, .. } if id == txid));
        wait_for("execution", || ctx.store().order() == 1);
        Ok(())
    }

    #[test]
    fn durable_backlog_executes_after_resume() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(
            Arc::clone(&ctx),
            ConsumerOptions {
                durable: Some(dir.path().to_path_buf()),
                ..options()
            },
        )?;
        let mut up = Upstream::connect(service.local_addr());
        up.attach();
        assert!(service.suspend_execution(Duration::from_secs(5))?);

        let mut seq = SerialSequence::starting_at(5000, 5);
        let (bytes, txid) = vertex_tx(&mut seq, ctx.obid(), "e");
        up.send(&bytes);
        assert!(matches!(up.response(), Response::Accepted { txid: id, .. } if id == txid));
        // Logged, hence durable, but not executed.
        assert_eq!(service.durability().serial(), 5001);
        wait_for("backlog", || service.stats().backlog_transactions == 1);
        assert_eq!(ctx.store().order(), 0);

        service.resume_execution()?;
        service.wait_idle(Duration::from_secs(5))?;
        wait_for("execution", || ctx.store().order() == 1);
        Ok(())
    }

    #[test]
    fn durable_log_replays_into_a_fresh_graph() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let durable = ConsumerOptions {
            durable: Some(dir.path().to_path_buf()),
            ..options()
        };
        let mut seq = SerialSequence::starting_at(6000, 6);
        {
            let ctx = GraphContext::new("replica");
            let service = TransactionalConsumerService::bind(Arc::clone(&ctx), durable.clone())?;
            let mut up = Upstream::connect(service.local_addr());
            up.attach();
            for name in ["x", "y"] {
                let (bytes, _) = vertex_tx(&mut seq, ctx.obid(), name);
                up.send(&bytes);
                assert!(matches!(up.response(), Response::Accepted { .. }));
            }
            service.shutdown();
        }
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), durable)?;
        assert_eq!(service.durability().serial(), 6002);
        service.wait_idle(Duration::from_secs(5))?;
        wait_for("replay", || ctx.store().order() == 2);
        Ok(())
    }

    #[test]
    fn snapshot_threshold_tracks_accepted_bytes() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(
            Arc::clone(&ctx),
            ConsumerOptions {
                snapshot_threshold: 64,
                ..options()
            },
        )?;
        assert!(!service.snapshot_due());
        let mut up = Upstream::connect(service.local_addr());
        up.attach();
        let mut seq = SerialSequence::starting_at(7000, 7);
        let (bytes, _) = vertex_tx(&mut seq, ctx.obid(), "s");
        up.send(&bytes);
        assert!(matches!(up.response(), Response::Accepted { .. }));
        assert!(service.snapshot_due());
        service.wait_idle(Duration::from_secs(5))?;
        let serial = service.snapshot(|position| {
            assert_eq!(service.durability().in_flight(), 1);
            Ok(position.serial)
        })?;
        assert_eq!(serial, 7001);
        assert!(!service.snapshot_due());
        assert_eq!(service.durability().in_flight(), 0);
        Ok(())
    }

    #[test]
    fn failed_over_upstream_with_lower_serials_is_executed() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), options())?;
        {
            let mut first = Upstream::connect(service.local_addr());
            first.attach();
            let mut seq = SerialSequence::starting_at(5000, 5);
            let (bytes, txid) = vertex_tx(&mut seq, ctx.obid(), "a");
            first.send(&bytes);
            assert!(matches!(first.response(), Response::Accepted { txid: id, .. } if id == txid));
        }
        wait_for("first upstream gone", || !service.stats().attached);

        let mut second = Upstream::connect(service.local_addr());
        second.attach();
        let mut seq = SerialSequence::starting_at(1000, 1);
        let (bytes, txid) = vertex_tx(&mut seq, ctx.obid(), "b");
        second.send(&bytes);
        assert!(matches!(second.response(), Response::Accepted { txid: id, .. } if id == txid));
        service.wait_idle(Duration::from_secs(5))?;
        wait_for("execution", || ctx.store().order() == 2);
        let stats = service.stats();
        assert_eq!((stats.duplicates, stats.executed), (0, 2));
        Ok(())
    }

    #[test]
    fn strict_serial_check_rejects_a_regression_within_a_session() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), options())?;
        let mut up = Upstream::connect(service.local_addr());
        up.attach();
        let mut ahead = SerialSequence::starting_at(8000, 8);
        let (bytes, _) = vertex_tx(&mut ahead, ctx.obid(), "p");
        up.send(&bytes);
        assert!(matches!(up.response(), Response::Accepted { .. }));

        let mut behind = SerialSequence::starting_at(7000, 9);
        let (bytes, txid) = vertex_tx(&mut behind, ctx.obid(), "q");
        up.send(&bytes);
        assert_eq!(
            up.response(),
            Response::Rejected {
                txid,
                reason: RejectReason::General.code()
            }
        );
        service.wait_idle(Duration::from_secs(5))?;
        assert_eq!(ctx.store().order(), 1);
        Ok(())
    }

    #[test]
    fn silent_serial_check_applies_a_regression() -> Result<()> {
        let ctx = GraphContext::new("replica");
        let mut opts = options();
        opts.parser.serial_check = SerialCheck::Silent;
        let service = TransactionalConsumerService::bind(Arc::clone(&ctx), opts)?;
        let mut up = Upstream::connect(service.local_addr());
        up.attach();
        let mut ahead = SerialSequence::starting_at(8000, 8);
        let (bytes, _) = vertex_tx(&mut ahead, ctx.obid(), "p");
        up.send(&bytes);
        assert!(matches!(up.response(), Response::Accepted { .. }));
        let mut behind = SerialSequence::starting_at(7000, 9);
        let (bytes, txid) = vertex_tx(&mut behind, ctx.obid(), "q");
        up.send(&bytes);
        assert!(matches!(up.response(), Response::Accepted { txid: id, .. } if id == txid));
        wait_for("execution", || ctx.store().order() == 2);
        Ok(())
    }

    #[test]
    fn snapshot_position_trails_a_durable_backlog() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = GraphContext::new("replica");
        let service = TransactionalConsumerService::bind(
            Arc::clone(&ctx),
            ConsumerOptions {
                durable: Some(dir.path().to_path_buf()),
                ..options()
            },
        )?;
        let mut up = Upstream::connect(service.local_addr());
        up.attach();
        let mut seq = SerialSequence::starting_at(9000, 9);
        let (first, first_txid) = vertex_tx(&mut seq, ctx.obid(), "f");
        up.send(&first);
        assert!(matches!(up.response(), Response::Accepted { .. }));
        service.wait_idle(Duration::from_secs(5))?;

        assert!(service.suspend_execution(Duration::from_secs(5))?);
        let (second, _) = vertex_tx(&mut seq, ctx.obid(), "g");
        up.send(&second);
        assert!(matches!(up.response(), Response::Accepted { .. }));
        assert_eq!(service.durability().serial(), 9002);

        let (position, order) = service.snapshot(|position| Ok((position, ctx.store().order())))?;
        assert_eq!((position.serial, position.txid), (9001, first_txid));
        assert_eq!(order, 1);

        service.resume_execution()?;
        service.wait_idle(Duration::from_secs(5))?;
        wait_for("execution", || service.executed().serial == 9002);
        let (position, order) = service.snapshot(|position| Ok((position, ctx.store().order())))?;
        assert_eq!((position.serial, order), (9002, 2));
        Ok(())
    }
}
