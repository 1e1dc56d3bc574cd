#![forbid(unsafe_code)]
//! Explicit per-graph context.
//!
//! Everything a writer, the readonly coordinator and the replication
//! services need for one graph lives here: the graph state lock, the vertex
//! store, the emitter and the producers it feeds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::graph::memory::MemoryGraph;
use crate::operation::emitter::{EmitterOptions, OperationEmitter, TransactionSink};
use crate::operation::op::{OpBlock, Operation};
use crate::operation::operator::Operator;
use crate::primitives::concurrency::{
    GraphGuard, GraphStateLock, ReadonlyCoordinator, ReadonlyHost, ResumeFlags, Suspendable,
    VertexLock, VertexType,
};
use crate::replication::producers::TransactionalProducers;
use crate::replication::producer::{AttachMode, ProducerId, ProducerOptions};
use crate::types::{now_millis, ObjectId, OpId, Result, SombraError, ThreadTag};

const WRITER_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Lock budgets used by the context's writer API.
#[derive(Clone, Copy, Debug)]
pub struct ContextOptions {
    /// Budget for vertex and graph state locks.
    pub lock_timeout: Duration,
    /// Default wait when entering readonly.
    pub readonly_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            readonly_timeout: Duration::from_secs(10),
        }
    }
}

/// State shared by everything that touches one graph.
pub struct GraphContext {
    name: String,
    obid: ObjectId,
    options: ContextOptions,
    state_lock: GraphStateLock,
    readonly: ReadonlyCoordinator,
    store: RwLock<MemoryGraph>,
    writable: AtomicUsize,
    graph_op: Mutex<Operation>,
    emitter: OnceLock<Arc<OperationEmitter>>,
    event_processor: OnceLock<Arc<dyn Suspendable>>,
    tx_input: Mutex<Option<Arc<dyn Suspendable>>>,
    producers: Arc<TransactionalProducers>,
}

impl GraphContext {
    /// Context with default options and no subscribers.
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_options(name, ContextOptions::default(), ProducerOptions::default())
    }

    /// The graph object id is derived from `name`.
    pub fn with_options(name: &str, options: ContextOptions, producer: ProducerOptions) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            obid: ObjectId::from_name(name),
            options,
            state_lock: GraphStateLock::new(),
            readonly: ReadonlyCoordinator::new(),
            store: RwLock::new(MemoryGraph::new()),
            writable: AtomicUsize::new(0),
            graph_op: Mutex::new(Operation::Unopened),
            emitter: OnceLock::new(),
            event_processor: OnceLock::new(),
            tx_input: Mutex::new(None),
            producers: Arc::new(TransactionalProducers::new(producer)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn obid(&self) -> ObjectId {
        self.obid
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    /// Graph-wide state lock guarding readonly transitions.
    pub fn state_lock(&self) -> &GraphStateLock {
        &self.state_lock
    }

    pub fn readonly(&self) -> &ReadonlyCoordinator {
        &self.readonly
    }

    pub fn producers(&self) -> &Arc<TransactionalProducers> {
        &self.producers
    }

    /// `None` until capture starts.
    pub fn emitter(&self) -> Option<&Arc<OperationEmitter>> {
        self.emitter.get()
    }

    /// Identity of the graph's current content, announced to peers.
    pub fn fingerprint(&self) -> ObjectId {
        ObjectId::from_parts(self.obid.high(), self.store.read().fingerprint())
    }

    /// Attaches a subscriber on the first reachable uri.
    pub fn attach_subscriber<S: AsRef<str>>(
        &self,
        uris: &[S],
        mode: AttachMode,
        timeout: Option<Duration>,
    ) -> Result<ProducerId> {
        self.producers.set_fingerprint(self.fingerprint());
        let id = self.producers.attach(uris, mode, timeout)?;
        info!(graph = %self.name, producer = %id, ?mode, "graph.subscriber_attached");
        Ok(id)
    }

    /// Read access to the vertex store.
    pub fn store(&self) -> RwLockReadGuard<'_, MemoryGraph> {
        self.store.read()
    }

    pub(crate) fn store_mut(&self) -> parking_lot::RwLockWriteGuard<'_, MemoryGraph> {
        self.store.write()
    }

    /// Starts capturing mutations into the graph's producers.
    pub fn start_capture(&self, options: EmitterOptions) -> Result<Arc<OperationEmitter>> {
        let sink: Arc<dyn TransactionSink> = self.producers.clone();
        self.start_capture_into(sink, options)
    }

    /// Starts capturing mutations into `sink`.
    pub fn start_capture_into(
        &self,
        sink: Arc<dyn TransactionSink>,
        options: EmitterOptions,
    ) -> Result<Arc<OperationEmitter>> {
        if self.emitter.get().is_some() {
            return Err(SombraError::Invalid("capture already started"));
        }
        let emitter = Arc::new(OperationEmitter::start(self.obid, sink, options)?);
        self.emitter
            .set(Arc::clone(&emitter))
            .map_err(|_| SombraError::Invalid("capture already started"))?;
        info!(graph = %self.name, "graph.capture_started");
        Ok(emitter)
    }

    /// Registers the event processor suspended around readonly. Only once.
    pub fn set_event_processor(&self, evp: Arc<dyn Suspendable>) -> Result<()> {
        self.event_processor
            .set(evp)
            .map_err(|_| SombraError::Invalid("event processor already set"))
    }

    /// Registers (or clears) the service feeding replicated transactions.
    pub fn set_tx_input(&self, input: Option<Arc<dyn Suspendable>>) {
        *self.tx_input.lock() = input;
    }

    /// Number of vertices currently locked writable.
    pub fn writable_count(&self) -> usize {
        self.writable.load(Ordering::Acquire)
    }

    pub(crate) fn writable_acquired(&self) {
        self.writable.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn writable_released(&self) {
        let prev = self.writable.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "writable vertex count underflow");
        self.state_lock.signal();
    }

    /// Makes the graph readonly, or joins the current readonly period.
    pub fn set_readonly(&self, timeout: Option<Duration>, force: bool) -> Result<i32> {
        let timeout = timeout.or(Some(self.options.readonly_timeout));
        let mut guard = self.state_lock.lock(timeout)?;
        self.readonly.acquire_readonly(&mut guard, self, timeout, force)
    }

    /// Drops one readonly hold; the last one makes the graph writable again.
    pub fn clear_readonly(&self) -> Result<Option<ResumeFlags>> {
        let mut guard = self.state_lock.lock(Some(self.options.lock_timeout))?;
        self.readonly.release_readonly(&mut guard, self)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.is_readonly()
    }

    /// Holds off readonly transitions until the matching [`allow_readonly`](Self::allow_readonly).
    /// Nests; a forced transition ignores it.
    pub fn disallow_readonly(&self) {
        self.readonly.disallow();
    }

    pub fn allow_readonly(&self) {
        self.readonly.allow();
        self.state_lock.signal();
    }

    /// Waits (registered as a waiting writer) until the graph is writable.
    fn wait_writable(&self, guard: &mut GraphGuard<'_>, deadline: Instant) -> Result<()> {
        if !self.readonly.is_readonly() {
            return Ok(());
        }
        self.readonly.begin_writer_wait()?;
        let result = loop {
            if !self.readonly.is_readonly() {
                break Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(SombraError::Readonly);
            }
            guard.wait_signal((deadline - now).min(WRITER_WAIT_SLICE));
        };
        self.readonly.end_writer_wait();
        result
    }

    /// Creates a vertex and returns a writer holding it locked.
    pub fn create_vertex(&self, identifier: &str, vxtype: VertexType) -> Result<VertexWriter<'_>> {
        let obid = ObjectId::from_name(identifier);
        let deadline = Instant::now() + self.options.lock_timeout;
        let mut guard = self.state_lock.lock(Some(self.options.lock_timeout))?;
        self.wait_writable(&mut guard, deadline)?;
        if self.store.read().contains(obid) {
            return Err(SombraError::InvalidOwned(format!(
                "vertex '{identifier}' already exists"
            )));
        }
        let lock = Arc::new(VertexLock::new(vxtype));
        lock.acquire_writable(Some(Duration::ZERO))?;
        self.writable_acquired();
        let mut writer = VertexWriter::new(self, obid, lock);
        let tmc = (now_millis() / 1000) as u32;
        writer.apply(Operator::vertex_new(identifier, vxtype.0, tmc, 0))?;
        drop(guard);
        Ok(writer)
    }

    /// Opens an existing vertex for writing.
    pub fn open_vertex(&self, obid: ObjectId, timeout: Option<Duration>) -> Result<VertexWriter<'_>> {
        let timeout = timeout.unwrap_or(self.options.lock_timeout);
        let deadline = Instant::now() + timeout;
        let lock = {
            let mut guard = self.state_lock.lock(Some(timeout))?;
            self.wait_writable(&mut guard, deadline)?;
            let lock = self.store.read().lock_of(obid).ok_or(SombraError::NotFound)?;
            // Counted before the graph lock is released so a readonly
            // transition cannot slip in between.
            self.writable_acquired();
            lock
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match lock.acquire_writable(Some(remaining)) {
            Ok(count) => {
                if count > 1 {
                    // Reentered: already counted by the outer writer.
                    self.writable.fetch_sub(1, Ordering::AcqRel);
                }
                Ok(VertexWriter::new(self, obid, lock))
            }
            Err(err) => {
                self.writable_released();
                Err(err)
            }
        }
    }

    /// Runs `f` with `obid` locked readonly.
    pub fn read_vertex<R>(
        &self,
        obid: ObjectId,
        timeout: Option<Duration>,
        f: impl FnOnce(&crate::graph::memory::VertexRecord) -> R,
    ) -> Result<R> {
        let lock = self.store.read().lock_of(obid).ok_or(SombraError::NotFound)?;
        lock.acquire_readonly(timeout.or(Some(self.options.lock_timeout)))?;
        let result = self.store.read().vertex(obid).map(f).ok_or(SombraError::NotFound);
        lock.release_readonly();
        result
    }

    /// Locks a group of vertices writable and captures the group as `lxw`.
    pub fn lock_group(&self, ids: &[ObjectId], timeout: Option<Duration>) -> Result<VertexGroup<'_>> {
        let timeout = timeout.unwrap_or(self.options.lock_timeout);
        let deadline = Instant::now() + timeout;
        let mut locks = Vec::with_capacity(ids.len());
        for obid in ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.open_vertex(*obid, Some(remaining)) {
                Ok(writer) => locks.push(writer.into_held()),
                Err(err) => {
                    for (_, lock) in locks.drain(..) {
                        self.release_vertex_lock(&lock);
                    }
                    return Err(err);
                }
            }
        }
        self.capture_graph(Operator::lock_writable(ids))?;
        Ok(VertexGroup { ctx: self, locks })
    }

    fn release_vertex_lock(&self, lock: &VertexLock) {
        if lock.release_writable() == 0 {
            self.writable_released();
        }
    }

    /// Captures a graph-owned operator through the emitter, if capture runs.
    pub fn capture_graph(&self, op: Operator) -> Result<Option<OpId>> {
        let Some(emitter) = self.emitter.get() else {
            return Ok(None);
        };
        let mut graph_op = self.graph_op.lock();
        graph_op.open(self.obid);
        match emitter.commit(OpBlock::for_graph(self.obid, op)) {
            Ok(opid) => {
                graph_op.commit(opid);
                Ok(Some(opid))
            }
            Err(err) => {
                graph_op.close();
                Err(err)
            }
        }
    }

    /// Emits a `tic` carrying the current time.
    pub fn tick(&self) -> Result<Option<OpId>> {
        let op = Operator::tick(now_millis());
        self.store.write().apply_graph(&op)?;
        self.capture_graph(op)
    }

    /// Stops capture, flushing outstanding operations.
    pub fn shutdown(&self) {
        if let Some(emitter) = self.emitter.get() {
            if let Err(err) = emitter.flush(Duration::from_secs(5)) {
                warn!(graph = %self.name, error = %err, "graph.shutdown_flush_failed");
            }
            emitter.shutdown();
        }
        self.producers.shutdown();
    }
}

impl ReadonlyHost for GraphContext {
    fn writable_vertices(&self) -> usize {
        self.writable_count()
    }

    fn event_processor(&self) -> Option<&dyn Suspendable> {
        self.event_processor.get().map(|evp| evp.as_ref() as &dyn Suspendable)
    }

    fn emitter(&self) -> Option<&dyn Suspendable> {
        self.emitter.get().map(|e| e.as_ref() as &dyn Suspendable)
    }

    fn tx_input(&self) -> Option<Arc<dyn Suspendable>> {
        self.tx_input.lock().clone()
    }

    fn capture_transition(&self, readonly: bool) {
        let op = if readonly {
            Operator::readonly()
        } else {
            Operator::readwrite()
        };
        if let Err(err) = self.store.write().apply_graph(&op) {
            warn!(graph = %self.name, error = %err, "graph.transition_state_failed");
        }
        if let Err(err) = self.capture_graph(op) {
            warn!(graph = %self.name, readonly, error = %err, "graph.transition_capture_failed");
        }
    }
}

impl std::fmt::Debug for GraphContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphContext")
            .field("name", &self.name)
            .field("obid", &self.obid)
            .field("readonly", &self.readonly.is_readonly())
            .field("writable", &self.writable_count())
            .finish()
    }
}

/// A vertex locked writable by the calling thread.
///
/// Mutations are applied to the store immediately and captured into one
/// operation block, committed when the writer is closed or dropped.
pub struct VertexWriter<'a> {
    ctx: &'a GraphContext,
    obid: ObjectId,
    lock: Arc<VertexLock>,
    op: Operation,
    block: OpBlock,
    yielded: bool,
    released: bool,
}

impl<'a> VertexWriter<'a> {
    fn new(ctx: &'a GraphContext, obid: ObjectId, lock: Arc<VertexLock>) -> Self {
        Self {
            ctx,
            obid,
            lock,
            op: Operation::Unopened,
            block: OpBlock::for_vertex(ctx.obid, obid),
            yielded: false,
            released: false,
        }
    }

    pub fn obid(&self) -> ObjectId {
        self.obid
    }

    pub fn lock(&self) -> &VertexLock {
        &self.lock
    }

    fn apply(&mut self, op: Operator) -> Result<()> {
        self.ctx.store.write().apply_vertex(self.obid, &self.lock, &op)?;
        if self.ctx.emitter.get().is_some() {
            self.op.open(self.obid);
            self.block.push(op);
        }
        Ok(())
    }

    /// Each setter mutates the store and captures the matching operator.
    pub fn set_rank(&mut self, rank: u64) -> Result<()> {
        self.apply(Operator::set_rank(rank))
    }

    pub fn set_type(&mut self, vxtype: VertexType) -> Result<()> {
        self.apply(Operator::set_type(vxtype.0))
    }

    pub fn set_tmx(&mut self, tmx: u32) -> Result<()> {
        self.apply(Operator::set_tmx(tmx))
    }

    pub fn set_property(&mut self, key: u64, value: &str) -> Result<()> {
        self.apply(Operator::set_property(key, value))
    }

    pub fn delete_property(&mut self, key: u64) -> Result<()> {
        self.apply(Operator::delete_property(key))
    }

    pub fn clear_properties(&mut self) -> Result<()> {
        self.apply(Operator::clear_properties())
    }

    pub fn set_vector(&mut self, encoded: &str) -> Result<()> {
        self.apply(Operator::set_vector(encoded))
    }

    pub fn delete_vector(&mut self) -> Result<()> {
        self.apply(Operator::delete_vector())
    }

    /// Adds an arc to `head`, borrowing its inarcs when another thread holds it.
    pub fn connect(&mut self, predicate: u64, head: ObjectId) -> Result<()> {
        let head_lock = self
            .ctx
            .store
            .read()
            .lock_of(head)
            .ok_or(SombraError::NotFound)?;
        let tid = ThreadTag::current();
        let borrowed = head_lock.update(|d| {
            if !d.is_locked() || d.is_writable_by(tid) {
                Ok(false)
            } else if d.borrow_inarcs() {
                Ok(true)
            } else {
                Err(SombraError::Busy("head vertex inarcs unavailable"))
            }
        })?;
        let result = self.apply(Operator::arc_connect(predicate, head));
        if borrowed {
            head_lock.update(|d| d.return_inarcs());
        }
        result
    }

    /// Removes arcs to `head` with `predicate`.
    pub fn disconnect(&mut self, predicate: u64, head: ObjectId) -> Result<()> {
        self.apply(Operator::arc_disconnect(0, predicate, head))
    }

    /// Captures the number of arcs removed.
    pub fn delete_outarcs(&mut self) -> Result<()> {
        let removed = self
            .ctx
            .store
            .read()
            .vertex(self.obid)
            .map_or(0, |v| v.outarcs.len() as u64);
        self.apply(Operator::delete_outarcs(removed))
    }

    /// Lets one other writer connect arcs into this vertex while it is held.
    pub fn yield_inarcs(&mut self) {
        let tid = ThreadTag::current();
        self.lock.update(|d| d.yield_inarcs(tid));
        self.yielded = true;
    }

    /// Deletes the vertex and releases it.
    pub fn delete(mut self) -> Result<Option<OpId>> {
        self.apply(Operator::vertex_delete(self.obid))?;
        self.close()
    }

    /// Commits captured operators and releases the vertex.
    pub fn close(mut self) -> Result<Option<OpId>> {
        let committed = self.commit_block();
        self.release();
        committed
    }

    fn into_held(mut self) -> (ObjectId, Arc<VertexLock>) {
        self.released = true;
        (self.obid, Arc::clone(&self.lock))
    }

    fn commit_block(&mut self) -> Result<Option<OpId>> {
        if !self.op.is_open() || self.block.is_empty() {
            self.op.close();
            return Ok(None);
        }
        let block = std::mem::replace(&mut self.block, OpBlock::for_vertex(self.ctx.obid, self.obid));
        let Some(emitter) = self.ctx.emitter.get() else {
            self.op.close();
            return Ok(None);
        };
        match emitter.commit(block) {
            Ok(opid) => {
                self.op.commit(opid);
                debug!(vertex = %self.obid, opid = opid.0, "graph.vertex_committed");
                Ok(Some(opid))
            }
            Err(err) => {
                self.op.close();
                Err(err)
            }
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.yielded {
            while !self.lock.update(|d| d.reclaim_inarcs()) {
                std::thread::yield_now();
            }
        }
        self.ctx.release_vertex_lock(&self.lock);
    }
}

impl Drop for VertexWriter<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.commit_block() {
            warn!(vertex = %self.obid, error = %err, "graph.vertex_commit_failed");
        }
        self.release();
    }
}

/// Vertices locked as one `lxw` group; dropping it captures `ulv`.
pub struct VertexGroup<'a> {
    ctx: &'a GraphContext,
    locks: Vec<(ObjectId, Arc<VertexLock>)>,
}

impl VertexGroup<'_> {
    /// Members in lock order.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.locks.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Writer for a member of the group (reentrant on the held lock).
    pub fn writer(&self, obid: ObjectId) -> Result<VertexWriter<'_>> {
        if !self.locks.iter().any(|(id, _)| *id == obid) {
            return Err(SombraError::Invalid("vertex is not part of the group"));
        }
        self.ctx.open_vertex(obid, None)
    }

    /// Releases every member and captures the release.
    pub fn release(mut self) -> Result<Option<OpId>> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<Option<OpId>> {
        if self.locks.is_empty() {
            return Ok(None);
        }
        let ids = self.ids();
        for (_, lock) in self.locks.drain(..) {
            self.ctx.release_vertex_lock(&lock);
        }
        self.ctx.capture_graph(Operator::release(&ids))
    }
}

impl Drop for VertexGroup<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(error = %err, "graph.group_release_failed");
        }
    }
}
