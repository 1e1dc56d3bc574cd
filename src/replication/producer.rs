#![forbid(unsafe_code)]
//! One transactional producer: the outbound half of replication.
//!
//! Transactions are framed into `sysout` and tracked in a pending queue
//! until the subscriber acknowledges them with `ACCEPTED`. Sending and
//! receiving never block; [`TransactionalProducer::exchange`] is driven by
//! a worker thread owned by
//! [`TransactionalProducers`](crate::replication::producers::TransactionalProducers).
//!
//! The buffer cursors carry the protocol state: bytes between the commit
//! and read pointers were sent but not yet accepted, so a lost connection
//! is a rollback followed by retransmission of exactly that suffix.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::operation::emitter::Backlog;
use crate::operation::parser::{DiscardTarget, ExecMode, OperationParser, ParserOptions, SerialCheck};
use crate::primitives::buffer::OperationBuffer;
use crate::replication::protocol::{
    compatible, RejectReason, Request, Response, SuspendCode, SuspendReason, HANDSHAKE_TIMEOUT,
    PRODUCER_IDLE_PERIOD, PROTOCOL, RESPONSE_LINE_MAX, SYSOUT_LIMIT, SYSOUT_THROTTLE, TX_MAX_SIZE,
    VERSION,
};
use crate::replication::transaction::{write_transaction, OperationTransaction, SerialSequence};
use crate::types::{now_millis, ObjectId, Result, SombraError};

/// Bytes reserved in `sysout` for the envelope around the data.
pub const TX_OVERHEAD: usize = 512;

const READ_CHUNK: usize = 16 << 10;
const WRITE_CHUNK: usize = 256 << 10;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Index of a producer inside its [`TransactionalProducers`](crate::replication::producers::TransactionalProducers).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct ProducerId(pub usize);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "producer-{}", self.0)
    }
}

/// Where a producer delivers its transactions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Endpoint {
    /// A consumer service at `host:port`; the only acknowledging endpoint.
    Tcp(String),
    /// Append-only capture file.
    File(PathBuf),
    /// Discards everything.
    Null,
}

impl Endpoint {
    /// Whether the endpoint answers with `ACCEPTED`.
    pub fn is_confirmable(&self) -> bool {
        matches!(self, Endpoint::Tcp(_))
    }
}

impl FromStr for Endpoint {
    type Err = SombraError;

    fn from_str(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri == "null" || uri == "null://" {
            return Ok(Endpoint::Null);
        }
        if let Some(path) = uri.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SombraError::Invalid("file endpoint without a path"));
            }
            return Ok(Endpoint::File(PathBuf::from(path)));
        }
        let address = uri
            .strip_prefix("tcp://")
            .or_else(|| uri.strip_prefix("vgx://"))
            .unwrap_or(uri)
            .trim_end_matches('/');
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(address.to_string()))
            }
            _ => Err(SombraError::InvalidOwned(format!("unsupported endpoint '{uri}'"))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(address) => write!(f, "tcp://{address}"),
            Endpoint::File(path) => write!(f, "file://{}", path.display()),
            Endpoint::Null => f.write_str("null://"),
        }
    }
}

/// How a producer joins its subscriber.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Attach and start streaming right away.
    #[default]
    Normal,
    /// The subscriber is new and must confirm the handshake before data flows.
    SyncNewSubscriber,
}

/// Producer tuning.
#[derive(Clone, Debug)]
pub struct ProducerOptions {
    /// Wait for the subscriber's `ATTACH` answer before attaching.
    pub handshake: bool,
    /// Parse every committed transaction before it is queued.
    pub validate: bool,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Initial reconnect backoff, doubled per failure up to `reconnect_max`.
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Failed reconnects tolerated before the producer is defunct.
    pub reconnect_budget: Option<u32>,
    /// How long a commit waits for room in `sysout`.
    pub commit_timeout: Duration,
    /// Upper bound on unsent plus unacknowledged bytes.
    pub sysout_limit: usize,
    /// Initial `sysout` capacity as a power of two.
    pub buffer_order: u32,
    /// Quiet time before an `IDLE` heartbeat is sent.
    pub idle_period: Duration,
    /// Exchange worker wakeup interval.
    pub poll_interval: Duration,
    /// Admin port announced in `ATTACH`.
    pub adminport: u16,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            handshake: true,
            validate: false,
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            reconnect_min: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
            reconnect_budget: None,
            commit_timeout: Duration::from_secs(60),
            sysout_limit: SYSOUT_LIMIT,
            buffer_order: 16,
            idle_period: PRODUCER_IDLE_PERIOD,
            poll_interval: Duration::from_millis(10),
            adminport: 0,
        }
    }
}

impl ProducerOptions {
    pub(crate) fn normalize(mut self) -> Self {
        if self.connect_timeout.is_zero() {
            self.connect_timeout = Duration::from_millis(100);
        }
        if self.reconnect_min.is_zero() {
            self.reconnect_min = Duration::from_millis(10);
        }
        self.reconnect_max = self.reconnect_max.max(self.reconnect_min);
        self.sysout_limit = self.sysout_limit.max(1 << 16);
        self.buffer_order = self.buffer_order.clamp(6, 30);
        if self.idle_period.is_zero() {
            self.idle_period = PRODUCER_IDLE_PERIOD;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_millis(1);
        }
        self
    }
}

/// Producer condition flags.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ProducerFlags {
    /// The endpoint acknowledges transactions.
    pub confirmable: bool,
    /// Rejected by the subscriber or out of reconnect budget; takes no commits.
    pub defunct: bool,
    /// Connection given up; accounting kept for diagnostics.
    pub abandoned: bool,
    /// `ATTACH` sent, subscriber answer outstanding.
    pub handshake_pending: bool,
    /// Output held back by the owner.
    pub muted: bool,
}

/// What the subscriber last told us about itself.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SubscriberInfo {
    /// Digest of the subscriber's graph state.
    pub fingerprint: ObjectId,
    /// Last serial the subscriber reports having applied.
    pub master_serial: u64,
    pub adminport: u16,
    pub protocol: u32,
    pub version: u32,
    /// Age of the subscriber's last `IDLE` timestamp when it arrived.
    pub lag_ms: u64,
}

/// Producer counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProducerStats {
    pub endpoint: String,
    pub connected: bool,
    pub flags: ProducerFlags,
    pub subscriber: SubscriberInfo,
    /// Transactions queued for this subscriber.
    pub committed: u64,
    pub committed_bytes: u64,
    /// Transactions acknowledged with `ACCEPTED`.
    pub accepted: u64,
    pub accepted_bytes: u64,
    pub rejected: u64,
    /// `RETRY` responses, each followed by a retransmission.
    pub retries: u64,
    pub resyncs: u64,
    pub suspends: u64,
    pub connects: u64,
    /// Links dropped after an I/O error; unaccepted bytes are resent.
    pub connection_losses: u64,
    pub idles_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Transactions sent or queued but not yet accepted.
    pub pending: usize,
    pub pending_bytes: usize,
    pub last_serial: u64,
}

#[derive(Copy, Clone, Debug)]
struct Resync {
    txid: ObjectId,
    remain: usize,
}

enum Link {
    Closed,
    Tcp(TcpStream),
    File(File),
    Null,
}

impl Link {
    fn is_open(&self) -> bool {
        !matches!(self, Link::Closed)
    }
}

/// A single subscriber's outbound stream.
pub struct TransactionalProducer {
    name: String,
    endpoint: Endpoint,
    mode: AttachMode,
    options: ProducerOptions,
    link: Link,
    sysout: OperationBuffer,
    sysin: OperationBuffer,
    pending: VecDeque<OperationTransaction>,
    pending_bytes: usize,
    sequence: SerialSequence,
    resync: Option<Resync>,
    suspend_until: u64,
    fingerprint: ObjectId,
    subscriber: SubscriberInfo,
    flags: ProducerFlags,
    last_send: u64,
    last_attempt: Option<Instant>,
    backoff: Duration,
    failed_attempts: u32,
    validator: Option<OperationParser>,
    stats: ProducerStats,
}

fn write_fully(stream: &mut TcpStream, mut bytes: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

impl TransactionalProducer {
    /// Creates a disconnected producer; the first exchange connects it.
    pub fn new(endpoint: Endpoint, mode: AttachMode, options: ProducerOptions) -> Self {
        let options = options.normalize();
        let name = endpoint.to_string();
        let validator = options.validate.then(|| {
            OperationParser::new(ParserOptions {
                validate: true,
                exec: ExecMode::Simulate,
                serial_check: SerialCheck::Off,
                ..ParserOptions::default()
            })
        });
        Self {
            sysout: OperationBuffer::with_capacity_order(options.buffer_order, format!("sysout {name}")),
            sysin: OperationBuffer::with_capacity_order(12, format!("sysin {name}")),
            flags: ProducerFlags {
                confirmable: endpoint.is_confirmable(),
                ..ProducerFlags::default()
            },
            backoff: options.reconnect_min,
            name,
            endpoint,
            mode,
            options,
            link: Link::Closed,
            pending: VecDeque::new(),
            pending_bytes: 0,
            sequence: SerialSequence::new(),
            resync: None,
            suspend_until: 0,
            fingerprint: ObjectId::NONE,
            subscriber: SubscriberInfo::default(),
            last_send: 0,
            last_attempt: None,
            failed_attempts: 0,
            validator,
            stats: ProducerStats::default(),
        }
    }

    /// Endpoint URI, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    pub fn flags(&self) -> ProducerFlags {
        self.flags
    }

    pub fn subscriber(&self) -> SubscriberInfo {
        self.subscriber
    }

    /// Whether a link is open, handshake or not.
    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    /// Defunct or abandoned producers no longer take part in replication.
    pub fn is_active(&self) -> bool {
        !self.flags.defunct && !self.flags.abandoned
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Oldest unacknowledged transaction.
    pub fn head(&self) -> Option<&OperationTransaction> {
        self.pending.front()
    }

    /// Nothing left to send or to be acknowledged.
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty() && self.sysout.is_empty()
    }

    pub fn set_fingerprint(&mut self, fingerprint: ObjectId) {
        self.fingerprint = fingerprint;
    }

    /// A muted producer queues commits but does not send.
    pub fn set_muted(&mut self, muted: bool) {
        self.flags.muted = muted;
    }

    /// Serial of the last transaction committed to this producer.
    pub fn last_serial(&self) -> u64 {
        self.sequence.last_serial()
    }

    /// Unsent bytes and unacknowledged transactions.
    pub fn backlog(&self) -> Backlog {
        Backlog {
            bytes: self.sysout.size() as u64,
            transactions: self.pending.len() as u64,
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            endpoint: self.name.clone(),
            connected: self.is_connected(),
            flags: self.flags,
            subscriber: self.subscriber,
            pending: self.pending.len(),
            pending_bytes: self.pending_bytes,
            last_serial: self.sequence.last_serial(),
            ..self.stats.clone()
        }
    }

    /// Whether `required` more bytes fit in `sysout`.
    ///
    /// Once a commit has had to wait, room is only reported again after the
    /// buffer drained below the limit by the throttle margin.
    pub fn committable(&self, required: usize, throttled: bool) -> bool {
        let limit = if throttled {
            self.options.sysout_limit.saturating_sub(SYSOUT_THROTTLE.min(self.options.sysout_limit / 2))
        } else {
            self.options.sysout_limit
        };
        self.sysout.size() + required <= limit
    }

    /// Opens the link without any handshake.
    pub fn connect(&mut self) -> Result<()> {
        self.last_attempt = Some(Instant::now());
        self.link = match &self.endpoint {
            Endpoint::Tcp(address) => {
                let mut last_err = None;
                let mut connected = None;
                for addr in address.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, self.options.connect_timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(err) => last_err = Some(err),
                    }
                }
                let stream = match (connected, last_err) {
                    (Some(stream), _) => stream,
                    (None, Some(err)) => return Err(err.into()),
                    (None, None) => return Err(SombraError::Invalid("endpoint resolved to no address")),
                };
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                Link::Tcp(stream)
            }
            Endpoint::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Link::File(OpenOptions::new().create(true).append(true).open(path)?)
            }
            Endpoint::Null => Link::Null,
        };
        self.stats.connects += 1;
        debug!(producer = %self.name, "producer.connected");
        Ok(())
    }

    /// Connects (if needed) and performs the `ATTACH` handshake.
    ///
    /// The answer is awaited only when handshakes are required by the
    /// options or by [`AttachMode::SyncNewSubscriber`].
    pub fn attach(&mut self) -> Result<()> {
        if !self.link.is_open() {
            self.connect()?;
        }
        if !self.flags.confirmable {
            info!(producer = %self.name, "producer.attached");
            return Ok(());
        }
        self.sysin.clear();
        let request = Request::Attach {
            protocol: PROTOCOL,
            version: VERSION,
            fingerprint: self.fingerprint,
            adminport: self.options.adminport,
        };
        self.flags.handshake_pending = true;
        if let Err(err) = self.send_control(&request) {
            self.close_link();
            return Err(err);
        }
        if self.options.handshake || self.mode == AttachMode::SyncNewSubscriber {
            if let Err(err) = self.await_handshake() {
                self.close_link();
                return Err(err);
            }
        }
        self.failed_attempts = 0;
        self.backoff = self.options.reconnect_min;
        self.last_send = now_millis();
        info!(
            producer = %self.name,
            handshake = !self.flags.handshake_pending,
            resend = self.sysout.unconfirmed() + self.sysout.readable(),
            "producer.attached"
        );
        Ok(())
    }

    fn await_handshake(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.options.handshake_timeout;
        while self.flags.handshake_pending {
            if self.flags.defunct {
                return Err(SombraError::Rejected {
                    reason: RejectReason::General.code(),
                    detail: format!("{} refused the attach", self.name),
                });
            }
            if !self.link.is_open() {
                return Err(SombraError::Closed("subscriber closed the connection during handshake"));
            }
            if Instant::now() >= deadline {
                return Err(SombraError::Timeout("subscriber handshake"));
            }
            self.receive_noblock()?;
            self.process_responses()?;
            if self.flags.handshake_pending {
                thread::sleep(self.options.poll_interval);
            }
        }
        Ok(())
    }

    /// Frames `data` as the next transaction and queues it for delivery.
    pub fn commit(&mut self, data: &[u8], master_serial: u64) -> Result<OperationTransaction> {
        if self.flags.defunct {
            return Err(SombraError::Closed("producer is defunct"));
        }
        if !self.committable(data.len() + TX_OVERHEAD, false) {
            return Err(SombraError::Busy("producer output buffer full"));
        }
        let tx = write_transaction(&mut self.sysout, &mut self.sequence, data, master_serial, now_millis())?;
        if let Err(err) = self.validate(&tx) {
            self.sysout.unwrite(tx.tsize);
            return Err(err);
        }
        if tx.tsize >= TX_MAX_SIZE {
            warn!(producer = %self.name, txid = %tx.txid, bytes = tx.tsize, "producer.oversized_transaction");
        }
        if self.flags.confirmable {
            self.pending.push_back(tx);
            self.pending_bytes += tx.tsize;
        }
        self.stats.committed += 1;
        self.stats.committed_bytes += tx.tsize as u64;
        debug!(producer = %self.name, serial = tx.serial, bytes = tx.tsize, "producer.commit");
        Ok(tx)
    }

    fn validate(&mut self, tx: &OperationTransaction) -> Result<()> {
        let Some(parser) = self.validator.as_mut() else {
            return Ok(());
        };
        let before = parser.stats().clone();
        let mut input = OperationBuffer::with_capacity_order(12, "validate");
        input.write(&self.sysout.peek_tail(tx.tsize))?;
        parser.feed(&mut input, &mut DiscardTarget);
        let after = parser.stats();
        let failed = after.syntax_errors > before.syntax_errors
            || after.permanent_errors > before.permanent_errors
            || after.transaction_errors > before.transaction_errors
            || after.crc_mismatches > before.crc_mismatches;
        if failed {
            let detail = after.last_error.clone().unwrap_or_else(|| "invalid transaction".into());
            parser.reset(&mut DiscardTarget);
            error!(producer = %self.name, txid = %tx.txid, %detail, "producer.validation_failed");
            return Err(SombraError::InvalidOwned(detail));
        }
        Ok(())
    }

    /// Moves bytes in both directions without blocking for up to `budget`.
    ///
    /// Returns the number of bytes moved. Connection failures are handled
    /// here (rollback and reconnect with backoff) and never returned.
    pub fn exchange(&mut self, budget: Duration) -> Result<usize> {
        if !self.is_active() {
            return Ok(0);
        }
        match self.link {
            Link::Closed => {
                if !self.reconnect_due() {
                    return Ok(0);
                }
                self.reconnect();
                if !self.link.is_open() {
                    return Ok(0);
                }
            }
            Link::File(_) | Link::Null => return self.drain_local(),
            Link::Tcp(_) => {}
        }
        let deadline = Instant::now() + budget;
        let mut moved = 0;
        loop {
            let step = self
                .send_noblock()
                .and_then(|sent| self.receive_noblock().map(|received| sent + received))
                .and_then(|n| self.process_responses().map(|()| n));
            match step {
                Ok(0) => break,
                Ok(n) => moved += n,
                Err(err) => {
                    self.connection_lost(&err);
                    return Ok(moved);
                }
            }
            if Instant::now() >= deadline || !self.link.is_open() {
                break;
            }
        }
        if let Err(err) = self.maybe_idle() {
            self.connection_lost(&err);
        }
        Ok(moved)
    }

    fn drain_local(&mut self) -> Result<usize> {
        let mut moved = 0;
        while self.sysout.has_readable() {
            let n = {
                let segment = self.sysout.readable_segment(WRITE_CHUNK);
                if let Link::File(file) = &mut self.link {
                    file.write_all(segment)?;
                }
                segment.len()
            };
            self.sysout.advance_read(n);
            self.sysout.confirm(n)?;
            moved += n;
        }
        if moved > 0 {
            if let Link::File(file) = &mut self.link {
                file.flush()?;
            }
            self.stats.bytes_sent += moved as u64;
        }
        Ok(moved)
    }

    fn send_noblock(&mut self) -> Result<usize> {
        if self.flags.muted {
            return Ok(0);
        }
        let mut limit = usize::MAX;
        if let Some(resync) = self.resync {
            if self.suspend_until == u64::MAX {
                return Ok(0);
            }
            self.suspend_until = 0;
            limit = resync.remain;
        } else if self.suspend_until > 0 {
            if now_millis() < self.suspend_until {
                return Ok(0);
            }
            debug!(producer = %self.name, "producer.autoresume");
            self.suspend_until = 0;
        }
        let Link::Tcp(stream) = &mut self.link else {
            return Ok(0);
        };
        let mut sent = 0;
        while sent < limit {
            let segment = self.sysout.readable_segment((limit - sent).min(WRITE_CHUNK));
            if segment.is_empty() {
                break;
            }
            match stream.write(segment) {
                Ok(0) => return Err(SombraError::Closed("subscriber connection")),
                Ok(n) => {
                    self.sysout.advance_read(n);
                    sent += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        if sent > 0 {
            if let Some(resync) = self.resync.as_mut() {
                resync.remain -= sent.min(resync.remain);
            }
            self.last_send = now_millis();
            self.stats.bytes_sent += sent as u64;
            trace!(producer = %self.name, sent, "producer.sent");
        }
        Ok(sent)
    }

    fn receive_noblock(&mut self) -> Result<usize> {
        let Link::Tcp(stream) = &mut self.link else {
            return Ok(0);
        };
        let mut received = 0;
        loop {
            let segment = self.sysin.writable_segment(READ_CHUNK)?;
            let window = segment.len().min(READ_CHUNK);
            match stream.read(&mut segment[..window]) {
                Ok(0) => return Err(SombraError::Closed("subscriber connection")),
                Ok(n) => {
                    self.sysin.advance_write(n)?;
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
        self.stats.bytes_received += received as u64;
        Ok(received)
    }

    fn process_responses(&mut self) -> Result<()> {
        while let Some(line) = self.sysin.read_until(RESPONSE_LINE_MAX, b'\n') {
            let unconfirmed = self.sysin.unconfirmed();
            self.sysin.confirm(unconfirmed)?;
            if line.last() != Some(&b'\n') {
                warn!(producer = %self.name, bytes = line.len(), "producer.oversized_response");
                continue;
            }
            match Response::parse(&line) {
                Ok(Some(response)) => self.handle_response(response)?,
                Ok(None) => {}
                Err(err) => warn!(producer = %self.name, error = %err, "producer.bad_response"),
            }
            if !self.link.is_open() || self.flags.defunct {
                break;
            }
        }
        Ok(())
    }

    fn handle_response(&mut self, response: Response) -> Result<()> {
        trace!(producer = %self.name, ?response, "producer.response");
        match response {
            Response::Accepted { txid, crc } => self.handle_accepted(txid, crc),
            Response::Retry { txid, reason } => self.handle_retry(txid, reason),
            Response::Rejected { txid, reason } => {
                self.handle_rejected(txid, reason);
                Ok(())
            }
            Response::Suspend(reason) => {
                self.handle_suspend(reason);
                Ok(())
            }
            Response::Resume => {
                self.handle_resume();
                Ok(())
            }
            Response::Idle {
                tms,
                fingerprint,
                master_serial,
            } => {
                self.subscriber.fingerprint = fingerprint;
                self.subscriber.master_serial = master_serial;
                self.subscriber.lag_ms = now_millis().saturating_sub(tms);
                Ok(())
            }
            Response::Attach {
                protocol,
                version,
                fingerprint,
                adminport,
            } => self.handle_attach(protocol, version, fingerprint, adminport),
            Response::Detach => {
                info!(producer = %self.name, "producer.detach_requested");
                if let Err(err) = self.send_control(&Request::Detach) {
                    debug!(producer = %self.name, error = %err, "producer.detach_send_failed");
                }
                self.abandon();
                Ok(())
            }
        }
    }

    fn handle_accepted(&mut self, txid: ObjectId, crc: u32) -> Result<()> {
        if let Some(resync) = self.resync {
            if resync.txid != txid {
                debug!(producer = %self.name, resync = %resync.txid, txid = %txid, "producer.ignored_during_resync");
                return Ok(());
            }
            info!(producer = %self.name, txid = %txid, "producer.resync_complete");
            self.resync = None;
        }
        let Some(head) = self.pending.front().copied() else {
            warn!(producer = %self.name, txid = %txid, "producer.accepted_unknown");
            return Ok(());
        };
        if head.txid == txid {
            if head.crc != crc {
                return Err(SombraError::Protocol(format!(
                    "crc mismatch for {txid}: sent {:08X}, accepted {crc:08X}",
                    head.crc
                )));
            }
            self.sysout.confirm(head.tsize)?;
            self.pending.pop_front();
            self.pending_bytes -= head.tsize;
            self.stats.accepted += 1;
            self.stats.accepted_bytes += head.tsize as u64;
            debug!(producer = %self.name, serial = head.serial, "producer.accepted");
            Ok(())
        } else if self.pending.iter().any(|tx| tx.txid == txid) {
            warn!(producer = %self.name, head = %head.txid, txid = %txid, "producer.accepted_out_of_order");
            self.handle_retry(head.txid, SuspendReason::after_millis(0))
        } else {
            warn!(producer = %self.name, txid = %txid, "producer.accepted_unknown");
            Ok(())
        }
    }

    fn handle_rejected(&mut self, txid: ObjectId, reason: u32) {
        let why = RejectReason::from_code(reason);
        self.stats.rejected += 1;
        if let Some(head) = self.pending.front().copied().filter(|head| head.txid == txid) {
            let sent = self.sysout.unconfirmed();
            if sent >= head.tsize && self.sysout.confirm(head.tsize).is_ok() {
                self.pending_bytes -= head.tsize;
                self.pending.pop_front();
            }
        }
        if why == RejectReason::Readonly && self.flags.handshake_pending {
            warn!(producer = %self.name, "producer.subscriber_readonly");
            self.close_link();
            return;
        }
        error!(producer = %self.name, txid = %txid, reason = why.describe(), "producer.rejected");
        self.flags.defunct = true;
    }

    /// Restarts delivery at the oldest unacknowledged transaction.
    fn handle_retry(&mut self, txid: ObjectId, reason: SuspendReason) -> Result<()> {
        self.stats.retries += 1;
        let head = self.pending.front().copied();
        let discard = self.sysout.unconfirmed() as u64;
        warn!(
            producer = %self.name,
            txid = %txid,
            head = ?head.map(|h| h.txid),
            discard,
            "producer.retry"
        );
        self.send_control(&Request::Resync {
            txid: head.map_or(ObjectId::NONE, |h| h.txid),
            discard,
        })?;
        self.sysin.clear();
        self.sysout.rollback();
        self.resync = head.map(|h| Resync {
            txid: h.txid,
            remain: h.tsize,
        });
        self.stats.resyncs += 1;
        self.handle_suspend(reason);
        Ok(())
    }

    fn handle_suspend(&mut self, reason: SuspendReason) {
        self.stats.suspends += 1;
        match reason.code() {
            Some(SuspendCode::AutoresumeTimeout) => {
                let until = now_millis() + u64::from(reason.millis());
                self.suspend_until = self.suspend_until.max(until);
                debug!(producer = %self.name, ms = reason.millis(), "producer.suspended");
            }
            Some(SuspendCode::Indefinite) => {
                self.suspend_until = u64::MAX;
                info!(producer = %self.name, "producer.suspended_indefinitely");
            }
            None => warn!(producer = %self.name, reason = reason.0, "producer.unknown_suspend_reason"),
        }
    }

    fn handle_resume(&mut self) {
        if self.suspend_until != 0 {
            debug!(producer = %self.name, "producer.resumed");
        }
        self.suspend_until = 0;
    }

    fn handle_attach(&mut self, protocol: u32, version: u32, fingerprint: ObjectId, adminport: u16) -> Result<()> {
        if !compatible(protocol, version) {
            error!(producer = %self.name, protocol, version, "producer.incompatible_subscriber");
            self.flags.defunct = true;
            return Err(SombraError::Rejected {
                reason: RejectReason::ProtocolVersion.code(),
                detail: format!("subscriber speaks protocol {protocol:08X} version {version:08X}"),
            });
        }
        self.subscriber.protocol = protocol;
        self.subscriber.version = version;
        self.subscriber.fingerprint = fingerprint;
        self.subscriber.adminport = adminport;
        self.flags.handshake_pending = false;
        debug!(producer = %self.name, fingerprint = %fingerprint, "producer.handshake_complete");
        Ok(())
    }

    fn maybe_idle(&mut self) -> Result<()> {
        if self.sysout.has_readable() || self.flags.muted {
            return Ok(());
        }
        let now = now_millis();
        if now.saturating_sub(self.last_send) < self.options.idle_period.as_millis() as u64 {
            return Ok(());
        }
        self.send_control(&Request::Idle {
            tms: now,
            fingerprint: self.fingerprint,
        })?;
        self.last_send = now;
        self.stats.idles_sent += 1;
        Ok(())
    }

    fn send_control(&mut self, request: &Request) -> Result<()> {
        let Link::Tcp(stream) = &mut self.link else {
            return Ok(());
        };
        write_fully(stream, &request.to_bytes(), CONTROL_TIMEOUT)?;
        Ok(())
    }

    fn close_link(&mut self) {
        if let Link::Tcp(stream) = &self.link {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.link = Link::Closed;
    }

    /// Drops the connection and rewinds to the last acknowledged byte.
    fn connection_lost(&mut self, err: &SombraError) {
        warn!(producer = %self.name, error = %err, unconfirmed = self.sysout.unconfirmed(), "producer.connection_lost");
        self.close_link();
        self.sysout.rollback();
        self.sysin.clear();
        self.resync = None;
        self.suspend_until = 0;
        self.last_attempt = Some(Instant::now());
        self.stats.connection_losses += 1;
    }

    fn reconnect_due(&self) -> bool {
        self.flags.confirmable
            && self
                .last_attempt
                .map_or(true, |at| at.elapsed() >= self.backoff)
    }

    fn reconnect(&mut self) {
        match self.attach() {
            Ok(()) => {}
            Err(err) => {
                self.failed_attempts += 1;
                self.backoff = (self.backoff * 2).min(self.options.reconnect_max);
                warn!(
                    producer = %self.name,
                    error = %err,
                    attempts = self.failed_attempts,
                    next_ms = self.backoff.as_millis() as u64,
                    "producer.reconnect_failed"
                );
                if self
                    .options
                    .reconnect_budget
                    .is_some_and(|budget| self.failed_attempts >= budget)
                {
                    error!(producer = %self.name, attempts = self.failed_attempts, "producer.reconnect_budget_exhausted");
                    self.flags.defunct = true;
                }
            }
        }
    }

    /// Gives up the connection but keeps queue accounting for inspection.
    pub fn abandon(&mut self) {
        if !self.flags.abandoned {
            warn!(producer = %self.name, pending = self.pending.len(), "producer.abandoned");
        }
        self.close_link();
        self.flags.abandoned = true;
    }

    /// Clean detach: tells the subscriber and forgets everything pending.
    pub fn detach(&mut self) {
        if let Err(err) = self.send_control(&Request::Detach) {
            debug!(producer = %self.name, error = %err, "producer.detach_send_failed");
        }
        self.close_link();
        self.pending.clear();
        self.pending_bytes = 0;
        self.sysout.clear();
        self.sysin.clear();
        self.resync = None;
        self.flags.abandoned = true;
        info!(producer = %self.name, "producer.detached");
    }
}

impl fmt::Debug for TransactionalProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalProducer")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("flags", &self.flags)
            .field("pending", &self.pending.len())
            .field("sysout", &self.sysout)
            .finish()
    }
}
