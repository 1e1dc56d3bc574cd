#![forbid(unsafe_code)]
//! Serializes committed operation blocks and forms transactions.
//!
//! Writers hand finished [`OpBlock`]s to [`OperationEmitter::commit`], which
//! assigns the next operation id and queues the block. A background worker
//! encodes queued blocks into an [`OperationBuffer`] in opid order and, once
//! every vertex lock opened in the stream has been released again and the
//! buffer is large or old enough, hands the buffered bytes to a
//! [`TransactionSink`] as one transaction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::operation::op::OpBlock;
use crate::operation::opcode::OpCode;
use crate::primitives::buffer::OperationBuffer;
use crate::primitives::concurrency::Suspendable;
use crate::types::{now_millis, ObjectId, OpId, Result, SombraError};

/// Transactions are formed once this many bytes are buffered.
pub const TX_COMMIT_SIZE_LIMIT: usize = 64 << 10;
/// Transactions are formed once the oldest buffered byte is this old.
pub const TX_COMMIT_AGE: Duration = Duration::from_millis(300);
/// Buffers this large are committed even with vertex locks still open.
pub const TX_FLUSH_LIMIT: usize = 8 << 20;
/// Longest single throttle sleep.
pub const MAX_THROTTLE: Duration = Duration::from_millis(5000);

const CAPTURE_HIGH: f64 = 0.99;
const CAPTURE_LOW: f64 = 0.80;
const BACKLOG_BYTES_THRESHOLD: u64 = 512 << 20;
const BACKLOG_TX_THRESHOLD: u64 = 1 << 20;
const BLOCKED_POLL: Duration = Duration::from_millis(50);
const COMMIT_RETRY_MIN: Duration = Duration::from_millis(10);
const COMMIT_RETRY_MAX: Duration = Duration::from_secs(1);
/// Failed deliveries tolerated while shutting down before the buffer is dropped.
const SHUTDOWN_COMMIT_ATTEMPTS: u32 = 8;

/// Outstanding work reported by a sink, used for throttling.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Backlog {
    /// Unsent or unacknowledged bytes.
    pub bytes: u64,
    pub transactions: u64,
}

impl Backlog {
    /// Worker sleep derived from the backlog, capped at [`MAX_THROTTLE`].
    pub fn throttle(&self) -> Duration {
        let ms = if self.bytes > BACKLOG_BYTES_THRESHOLD {
            (self.bytes - BACKLOG_BYTES_THRESHOLD) >> 20
        } else if self.transactions > BACKLOG_TX_THRESHOLD {
            self.transactions - BACKLOG_TX_THRESHOLD
        } else {
            0
        };
        Duration::from_millis(ms).min(MAX_THROTTLE)
    }
}

/// Destination of formed transactions.
pub trait TransactionSink: Send + Sync {
    /// Delivers one transaction worth of op blocks.
    ///
    /// On error the emitter keeps the bytes and offers them again, together
    /// with anything buffered since, after a backoff.
    fn commit(&self, data: &[u8], master_serial: u64) -> Result<()>;

    fn backlog(&self) -> Backlog {
        Backlog::default()
    }
}

/// Emitter tuning.
#[derive(Clone, Copy, Debug)]
pub struct EmitterOptions {
    /// Buffered bytes that cut a transaction.
    pub commit_size: usize,
    /// Age at which a partial transaction is committed anyway.
    pub commit_age: Duration,
    /// Buffered bytes that force a commit while vertex locks are still held.
    pub flush_limit: usize,
    /// Capacity of the capture queue, in blocks.
    pub capture_capacity: usize,
    pub buffer_order: u32,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        Self {
            commit_size: TX_COMMIT_SIZE_LIMIT,
            commit_age: TX_COMMIT_AGE,
            flush_limit: TX_FLUSH_LIMIT,
            capture_capacity: 4096,
            buffer_order: 16,
        }
    }
}

impl EmitterOptions {
    fn normalize(mut self) -> Self {
        if self.commit_size == 0 {
            self.commit_size = 1;
        }
        if self.commit_age.is_zero() {
            self.commit_age = Duration::from_millis(1);
        }
        self.flush_limit = self.flush_limit.max(self.commit_size);
        self.capture_capacity = self.capture_capacity.max(8);
        self.buffer_order = self.buffer_order.clamp(6, 30);
        self
    }

    fn high_water(&self) -> usize {
        ((self.capture_capacity as f64) * CAPTURE_HIGH) as usize
    }

    fn low_water(&self) -> usize {
        ((self.capture_capacity as f64) * CAPTURE_LOW) as usize
    }
}

/// Emitter counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct EmitterStats {
    /// Op blocks serialized.
    pub ops_emitted: u64,
    pub operators_emitted: u64,
    /// Transactions the sink accepted.
    pub transactions: u64,
    pub bytes: u64,
    /// Times the worker slept on sink backlog.
    pub throttle_events: u64,
    /// Times a writer blocked on a full capture queue.
    pub writer_stalls: u64,
    /// Deliveries the sink refused; the bytes stay buffered for a retry.
    pub failed_commits: u64,
    /// Bytes dropped at shutdown after the sink kept refusing them.
    pub abandoned_bytes: u64,
    pub last_opid: u64,
    /// Highest opid delivered to the sink.
    pub committed_opid: u64,
}

#[derive(Default)]
struct EmitterState {
    queue: VecDeque<OpBlock>,
    next_opid: OpId,
    committed_opid: OpId,
    buffered: usize,
    defer_depth: u32,
    force: bool,
    suspend_requested: bool,
    suspended: bool,
    stalled: bool,
    shutdown: bool,
    worker_alive: bool,
    stats: EmitterStats,
}

struct Shared {
    name: String,
    options: EmitterOptions,
    state: Mutex<EmitterState>,
    wakeup: Condvar,
    progress: Condvar,
    master_serial: AtomicU64,
    modified: AtomicBool,
}

/// Per-graph operation emitter.
pub struct OperationEmitter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Holds transaction formation off until dropped.
pub struct DeferCommit<'a> {
    emitter: &'a OperationEmitter,
}

impl Drop for DeferCommit<'_> {
    fn drop(&mut self) {
        let mut st = self.emitter.shared.state.lock();
        st.defer_depth = st.defer_depth.saturating_sub(1);
        self.emitter.shared.wakeup.notify_one();
    }
}

impl OperationEmitter {
    /// Starts an emitter for `graph` delivering into `sink`.
    pub fn start(
        graph: ObjectId,
        sink: Arc<dyn TransactionSink>,
        options: EmitterOptions,
    ) -> Result<Self> {
        let options = options.normalize();
        let name = format!("emitter-{:08x}", graph.high() >> 32);
        let shared = Arc::new(Shared {
            name: name.clone(),
            options,
            state: Mutex::new(EmitterState {
                worker_alive: true,
                ..EmitterState::default()
            }),
            wakeup: Condvar::new(),
            progress: Condvar::new(),
            master_serial: AtomicU64::new(0),
            modified: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let buffer = OperationBuffer::with_capacity_order(options.buffer_order, name.clone());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Worker::new(worker_shared, sink, buffer).run())?;
        info!(emitter = %name, "emitter.start");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Name used in logs.
    pub fn label(&self) -> &str {
        &self.shared.name
    }

    /// Queues `block` for serialization and returns its operation id.
    ///
    /// Blocks while the capture queue is above its high-water mark.
    pub fn commit(&self, mut block: OpBlock) -> Result<OpId> {
        if block.is_empty() {
            return Err(SombraError::Invalid("empty operation block"));
        }
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.shutdown {
            return Err(SombraError::Closed("operation emitter"));
        }
        if st.stalled || st.queue.len() >= shared.options.high_water() {
            if !st.stalled {
                st.stalled = true;
                st.stats.writer_stalls += 1;
                warn!(
                    emitter = %shared.name,
                    queued = st.queue.len(),
                    "emitter.capture_backoff"
                );
            }
            while st.stalled && !st.shutdown {
                shared.progress.wait(&mut st);
            }
        }
        if block.opid == OpId::NONE {
            st.next_opid = st.next_opid.next();
            block.opid = st.next_opid;
        } else if block.opid > st.next_opid {
            st.next_opid = block.opid;
        }
        block.tms = now_millis();
        let opid = block.opid;
        st.stats.last_opid = opid.0;
        st.queue.push_back(block);
        shared.wakeup.notify_one();
        Ok(opid)
    }

    /// Next operation id that will be assigned.
    pub fn peek_opid(&self) -> OpId {
        self.shared.state.lock().next_opid.next()
    }

    /// Prevents transaction formation while the guard lives.
    pub fn defer_commit(&self) -> DeferCommit<'_> {
        self.shared.state.lock().defer_depth += 1;
        DeferCommit { emitter: self }
    }

    /// Waits until `opid` has been delivered to the sink.
    pub fn fence(&self, opid: OpId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let shared = &self.shared;
        let mut st = shared.state.lock();
        st.force = true;
        shared.wakeup.notify_one();
        while st.committed_opid < opid {
            if !st.worker_alive {
                return Err(SombraError::Closed("operation emitter"));
            }
            if shared.progress.wait_until(&mut st, deadline).timed_out()
                && st.committed_opid < opid
            {
                return Err(SombraError::Timeout("emitter fence"));
            }
        }
        Ok(())
    }

    /// Forces every queued and buffered operation into a transaction.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let target = self.shared.state.lock().next_opid;
        self.fence(target, timeout)
    }

    /// Master serial stamped on subsequent transactions.
    pub fn set_master_serial(&self, serial: u64) {
        self.shared.master_serial.store(serial, Ordering::Release);
    }

    /// Returns and clears the modified flag set by each delivered transaction.
    pub fn take_modified(&self) -> bool {
        self.shared.modified.swap(false, Ordering::AcqRel)
    }

    pub fn stats(&self) -> EmitterStats {
        self.shared.state.lock().stats
    }

    /// True while readonly holds capture back.
    pub fn is_suspended(&self) -> bool {
        self.shared.state.lock().suspended
    }

    /// Flushes outstanding work and stops the worker.
    pub fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
            st.suspended = false;
            self.shared.wakeup.notify_all();
            self.shared.progress.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(emitter = %self.shared.name, "emitter.worker_panicked");
            }
        }
    }
}

impl Drop for OperationEmitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Suspendable for OperationEmitter {
    fn name(&self) -> &'static str {
        "operation emitter"
    }

    fn is_running(&self) -> bool {
        let st = self.shared.state.lock();
        st.worker_alive && !st.suspended
    }

    fn suspend(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.suspended {
            return Ok(false);
        }
        st.suspend_requested = true;
        shared.wakeup.notify_one();
        while !st.suspended {
            if !st.worker_alive || shared.progress.wait_until(&mut st, deadline).timed_out() {
                if st.suspended {
                    break;
                }
                st.suspend_requested = false;
                return Err(SombraError::Timeout("emitter suspend"));
            }
        }
        info!(emitter = %shared.name, "emitter.suspended");
        Ok(true)
    }

    fn resume(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        if st.suspended {
            st.suspended = false;
            info!(emitter = %self.shared.name, "emitter.resumed");
            self.shared.wakeup.notify_one();
        }
        Ok(())
    }
}

struct Worker {
    shared: Arc<Shared>,
    sink: Arc<dyn TransactionSink>,
    buffer: OperationBuffer,
    balance: i64,
    started: Option<Instant>,
    immediate: bool,
    last_serialized: OpId,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Worker {
    fn new(shared: Arc<Shared>, sink: Arc<dyn TransactionSink>, buffer: OperationBuffer) -> Self {
        Self {
            shared,
            sink,
            buffer,
            balance: 0,
            started: None,
            immediate: false,
            last_serialized: OpId::NONE,
            failures: 0,
            retry_at: None,
        }
    }

    fn run(mut self) {
        let mut blocked = false;
        loop {
            let (batch, defer, force, shutdown) = {
                let shared = Arc::clone(&self.shared);
                let mut st = shared.state.lock();
                self.wait_for_work(&mut st, blocked);
                let batch: Vec<OpBlock> = if st.suspended {
                    Vec::new()
                } else {
                    st.queue.drain(..).collect()
                };
                if st.stalled && st.queue.len() <= shared.options.low_water() {
                    st.stalled = false;
                    shared.progress.notify_all();
                }
                (
                    batch,
                    st.defer_depth,
                    st.force || st.suspend_requested,
                    st.shutdown,
                )
            };

            for block in &batch {
                if let Err(err) = self.serialize(block) {
                    error!(emitter = %self.shared.name, opid = block.opid.0, error = %err, "emitter.serialize_failed");
                }
            }

            let defer = if shutdown { 0 } else { defer };
            let committed = self.should_commit(defer, force || shutdown) && self.commit_to_system();
            if shutdown && !committed && self.failures >= SHUTDOWN_COMMIT_ATTEMPTS {
                self.abandon();
            }
            blocked = !committed && self.buffer.has_readable() && (!force || self.retry_at.is_some());

            let mut st = self.shared.state.lock();
            st.buffered = self.buffer.readable();
            if st.buffered == 0 {
                st.committed_opid = st.committed_opid.max(self.last_serialized);
                st.stats.committed_opid = st.committed_opid.0;
                if st.queue.is_empty() {
                    st.force = false;
                    if st.suspend_requested {
                        st.suspend_requested = false;
                        st.suspended = true;
                    }
                }
            }
            self.shared.progress.notify_all();
            if shutdown && st.queue.is_empty() && st.buffered == 0 {
                st.worker_alive = false;
                debug!(emitter = %self.shared.name, "emitter.worker_exit");
                return;
            }
            drop(st);

            if shutdown {
                if let Some(at) = self.retry_at {
                    thread::sleep(at.saturating_duration_since(Instant::now()));
                }
            }
            if committed {
                let pause = self.sink.backlog().throttle();
                if !pause.is_zero() {
                    self.shared.state.lock().stats.throttle_events += 1;
                    warn!(emitter = %self.shared.name, pause_ms = pause.as_millis() as u64, "emitter.throttle");
                    thread::sleep(pause);
                }
            }
        }
    }

    fn wait_for_work(&self, st: &mut parking_lot::MutexGuard<'_, EmitterState>, blocked: bool) {
        let age = self.shared.options.commit_age;
        loop {
            if st.shutdown {
                return;
            }
            if !st.suspended {
                if !st.queue.is_empty() || st.force || st.suspend_requested {
                    if !blocked || !st.queue.is_empty() {
                        return;
                    }
                }
                if self.buffer.has_readable() {
                    let wait = if blocked {
                        BLOCKED_POLL
                    } else {
                        match self.started.map(|t| t.elapsed()) {
                            Some(elapsed) if elapsed >= age => return,
                            Some(elapsed) => age - elapsed,
                            None => age,
                        }
                    };
                    if self.shared.wakeup.wait_for(st, wait).timed_out() {
                        return;
                    }
                    continue;
                }
            }
            self.shared.wakeup.wait(st);
        }
    }

    fn serialize(&mut self, block: &OpBlock) -> Result<()> {
        let mut bytes = Vec::with_capacity(96 + block.operators.len() * 80);
        block.encode(&mut bytes);
        for op in &block.operators {
            match op.code {
                OpCode::VERTICES_ACQUIRE_WL => self.balance += i64::from(op.u32_at(0).unwrap_or(0)),
                OpCode::VERTICES_RELEASE => self.balance -= i64::from(op.u32_at(0).unwrap_or(0)),
                OpCode::VERTEX_ACQUIRE => self.balance += 1,
                OpCode::VERTEX_RELEASE => self.balance -= 1,
                OpCode::VERTICES_RELEASE_ALL => self.balance = 0,
                OpCode::SYSTEM_ATTACH => self.immediate = true,
                _ => {}
            }
            assert!(
                self.balance >= 0,
                "negative vertex lock balance in operation stream at opid {}",
                block.opid
            );
        }
        self.buffer.write(&bytes)?;
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        self.last_serialized = self.last_serialized.max(block.opid);
        let mut st = self.shared.state.lock();
        st.stats.ops_emitted += 1;
        st.stats.operators_emitted += block.operators.len() as u64;
        Ok(())
    }

    fn should_commit(&self, defer: u32, force: bool) -> bool {
        let buffered = self.buffer.readable();
        if buffered == 0 || defer > 0 {
            return false;
        }
        if self.retry_at.is_some_and(|at| Instant::now() < at) {
            return false;
        }
        if force {
            return true;
        }
        let options = &self.shared.options;
        if self.balance != 0 && buffered < options.flush_limit {
            return false;
        }
        let aged = self.started.is_some_and(|t| t.elapsed() >= options.commit_age);
        self.immediate || buffered >= options.commit_size || aged
    }

    /// Hands the buffer to the sink; returns whether it was delivered.
    fn commit_to_system(&mut self) -> bool {
        let data = self.buffer.peek(self.buffer.readable());
        let master_serial = self.shared.master_serial.load(Ordering::Acquire);
        if let Err(err) = self.sink.commit(&data, master_serial) {
            self.failures += 1;
            let backoff = COMMIT_RETRY_MIN
                .saturating_mul(1 << self.failures.min(16))
                .min(COMMIT_RETRY_MAX);
            self.retry_at = Some(Instant::now() + backoff);
            self.shared.state.lock().stats.failed_commits += 1;
            error!(
                emitter = %self.shared.name,
                bytes = data.len(),
                attempt = self.failures,
                retry_ms = backoff.as_millis() as u64,
                error = %err,
                "emitter.commit_failed"
            );
            return false;
        }
        self.reset_transaction();
        self.shared.modified.store(true, Ordering::Release);
        let mut st = self.shared.state.lock();
        st.stats.transactions += 1;
        st.stats.bytes += data.len() as u64;
        debug!(
            emitter = %self.shared.name,
            bytes = data.len(),
            opid = self.last_serialized.0,
            "emitter.commit"
        );
        true
    }

    fn abandon(&mut self) {
        let bytes = self.buffer.readable();
        error!(
            emitter = %self.shared.name,
            bytes,
            attempts = self.failures,
            "emitter.commit_abandoned"
        );
        self.shared.state.lock().stats.abandoned_bytes += bytes as u64;
        self.reset_transaction();
    }

    fn reset_transaction(&mut self) {
        self.buffer.clear();
        if let Err(err) = self.buffer.trim(1 << (self.shared.options.buffer_order + 4)) {
            warn!(emitter = %self.shared.name, error = %err, "emitter.trim_failed");
        }
        self.started = None;
        self.immediate = false;
        self.failures = 0;
        self.retry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::operator::Operator;

    #[derive(Default)]
    struct CollectingSink {
        transactions: Mutex<Vec<Vec<u8>>>,
    }

    impl TransactionSink for CollectingSink {
        fn commit(&self, data: &[u8], _master_serial: u64) -> Result<()> {
            self.transactions.lock().push(data.to_vec());
            Ok(())
        }
    }

    /// Refuses the first `refusals` deliveries.
    struct FlakySink {
        refusals: Mutex<u32>,
        delivered: Mutex<Vec<Vec<u8>>>,
    }

    impl TransactionSink for FlakySink {
        fn commit(&self, data: &[u8], _master_serial: u64) -> Result<()> {
            let mut refusals = self.refusals.lock();
            if *refusals > 0 {
                *refusals -= 1;
                return Err(SombraError::Closed("subscriber unavailable"));
            }
            self.delivered.lock().push(data.to_vec());
            Ok(())
        }
    }

    fn graph() -> ObjectId {
        ObjectId::from_name("emitter-test")
    }

    fn vertex_block(name: &str) -> OpBlock {
        let mut block = OpBlock::for_vertex(graph(), ObjectId::from_name(name));
        block.push(Operator::vertex_new(name, 0x11, 0, 0));
        block
    }

    fn start(sink: &Arc<CollectingSink>, options: EmitterOptions) -> OperationEmitter {
        OperationEmitter::start(graph(), Arc::clone(sink) as Arc<dyn TransactionSink>, options)
            .expect("emitter")
    }

    #[test]
    fn opids_are_strictly_increasing() -> Result<()> {
        let sink = Arc::new(CollectingSink::default());
        let emitter = start(&sink, EmitterOptions::default());
        let a = emitter.commit(vertex_block("a"))?;
        let b = emitter.commit(vertex_block("b"))?;
        assert!(b > a);
        emitter.flush(Duration::from_secs(5))?;
        let all: Vec<u8> = sink.transactions.lock().concat();
        let text = String::from_utf8_lossy(&all);
        assert_eq!(text.matches("    vxn ").count(), 2);
        assert!(text.find(&format!("ENDOP {:016X}", a.0)) < text.find(&format!("ENDOP {:016X}", b.0)));
        assert_eq!(emitter.stats().ops_emitted, 2);
        Ok(())
    }

    #[test]
    fn open_lock_group_holds_the_transaction() -> Result<()> {
        let sink = Arc::new(CollectingSink::default());
        let options = EmitterOptions {
            commit_age: Duration::from_millis(10),
            ..EmitterOptions::default()
        };
        let emitter = start(&sink, options);
        let ids = [ObjectId::from_name("x")];
        emitter.commit(OpBlock::for_graph(graph(), Operator::lock_writable(&ids)))?;
        emitter.commit(vertex_block("x"))?;
        thread::sleep(Duration::from_millis(120));
        assert!(sink.transactions.lock().is_empty());
        let last = emitter.commit(OpBlock::for_graph(graph(), Operator::release(&ids)))?;
        emitter.fence(last, Duration::from_secs(5))?;
        let txs = sink.transactions.lock();
        assert_eq!(txs.len(), 1);
        let text = String::from_utf8_lossy(&txs[0]);
        assert!(text.contains("lxw") && text.contains("vxn") && text.contains("ulv"));
        Ok(())
    }

    #[test]
    fn deferred_commit_waits_for_guard() -> Result<()> {
        let sink = Arc::new(CollectingSink::default());
        let options = EmitterOptions {
            commit_age: Duration::from_millis(5),
            ..EmitterOptions::default()
        };
        let emitter = start(&sink, options);
        {
            let _defer = emitter.defer_commit();
            emitter.commit(vertex_block("d"))?;
            thread::sleep(Duration::from_millis(60));
            assert!(sink.transactions.lock().is_empty());
        }
        emitter.flush(Duration::from_secs(5))?;
        assert_eq!(sink.transactions.lock().len(), 1);
        Ok(())
    }

    #[test]
    fn suspend_drains_then_parks() -> Result<()> {
        let sink = Arc::new(CollectingSink::default());
        let emitter = start(&sink, EmitterOptions::default());
        emitter.commit(vertex_block("s"))?;
        assert!(emitter.suspend(Duration::from_secs(5))?);
        assert!(!emitter.suspend(Duration::from_secs(1))?);
        assert_eq!(sink.transactions.lock().len(), 1);
        let opid = emitter.commit(vertex_block("t"))?;
        thread::sleep(Duration::from_millis(400));
        assert_eq!(sink.transactions.lock().len(), 1);
        emitter.resume()?;
        emitter.fence(opid, Duration::from_secs(5))?;
        assert_eq!(sink.transactions.lock().len(), 2);
        Ok(())
    }

    #[test]
    fn attach_commits_immediately() -> Result<()> {
        let sink = Arc::new(CollectingSink::default());
        let options = EmitterOptions {
            commit_age: Duration::from_secs(60),
            ..EmitterOptions::default()
        };
        let emitter = start(&sink, options);
        let attach = Operator::new(
            OpCode::SYSTEM_ATTACH,
            [
                crate::operation::operator::Arg::U64(now_millis()),
                crate::operation::operator::Arg::Str("tcp://127.0.0.1:9000".into()),
                crate::operation::operator::Arg::Str("host".into()),
                crate::operation::operator::Arg::Str("1.0".into()),
                crate::operation::operator::Arg::U32(0),
            ],
        );
        emitter.commit(OpBlock::for_graph(graph(), attach))?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.transactions.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.transactions.lock().len(), 1);
        Ok(())
    }

    #[test]
    fn refused_delivery_keeps_the_bytes_for_a_retry() -> Result<()> {
        let sink = Arc::new(FlakySink {
            refusals: Mutex::new(2),
            delivered: Mutex::new(Vec::new()),
        });
        let emitter = OperationEmitter::start(
            graph(),
            Arc::clone(&sink) as Arc<dyn TransactionSink>,
            EmitterOptions {
                commit_age: Duration::from_millis(5),
                ..EmitterOptions::default()
            },
        )?;
        let opid = emitter.commit(vertex_block("r"))?;
        emitter.fence(opid, Duration::from_secs(5))?;
        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        let text = String::from_utf8_lossy(&delivered[0]);
        assert!(text.contains(&format!("ENDOP {:016X}", opid.0)));
        let stats = emitter.stats();
        assert_eq!((stats.failed_commits, stats.transactions, stats.abandoned_bytes), (2, 1, 0));
        Ok(())
    }

    #[test]
    fn backlog_throttle_is_capped() {
        assert_eq!(Backlog::default().throttle(), Duration::ZERO);
        let bytes = Backlog {
            bytes: (512 << 20) + (3 << 20),
            transactions: 0,
        };
        assert_eq!(bytes.throttle(), Duration::from_millis(3));
        let huge = Backlog {
            bytes: 0,
            transactions: (1 << 20) + 1_000_000,
        };
        assert_eq!(huge.throttle(), MAX_THROTTLE);
    }

    #[test]
    fn commit_after_shutdown_is_closed() {
        let sink = Arc::new(CollectingSink::default());
        let emitter = start(&sink, EmitterOptions::default());
        emitter.shutdown();
        assert!(matches!(
            emitter.commit(vertex_block("late")),
            Err(SombraError::Closed(_))
        ));
    }
}
