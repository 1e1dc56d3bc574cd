#![forbid(unsafe_code)]
//! Applies parsed operation blocks to a [`GraphContext`].
//!
//! Each vertex block runs with the vertex locked writable by the executing
//! thread; `lxw` groups keep their locks across blocks until `ulv`/`ula`.
//! A lock that cannot be taken immediately is reported as transient so the
//! parser retries the block later.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::graph::context::GraphContext;
use crate::operation::op::OpHeader;
use crate::operation::opcode::{OpCode, OpType};
use crate::operation::operator::Operator;
use crate::operation::parser::{ExecError, ExecResult, OperationTarget};
use crate::primitives::concurrency::{VertexLock, VertexType};
use crate::types::{ObjectId, OpId};

const LOCK_ATTEMPT: Duration = Duration::from_millis(2);

struct OpenVertex {
    obid: ObjectId,
    lock: Arc<VertexLock>,
}

/// Replication-side [`OperationTarget`] for one graph.
pub struct GraphExecutor {
    ctx: Arc<GraphContext>,
    open: Option<OpenVertex>,
    held: BTreeMap<ObjectId, (Arc<VertexLock>, u32)>,
    acquired_in_block: Vec<ObjectId>,
}

impl GraphExecutor {
    pub fn new(ctx: Arc<GraphContext>) -> Self {
        Self {
            ctx,
            open: None,
            held: BTreeMap::new(),
            acquired_in_block: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<GraphContext> {
        &self.ctx
    }

    fn lock_vertex(&self, lock: &VertexLock) -> ExecResult {
        match lock.acquire_writable(Some(LOCK_ATTEMPT)) {
            Ok(count) => {
                if count == 1 {
                    self.ctx.writable_acquired();
                }
                Ok(())
            }
            Err(_) => Err(ExecError::Transient("vertex locked".into())),
        }
    }

    fn unlock_vertex(&self, lock: &VertexLock) {
        if lock.release_writable() == 0 {
            self.ctx.writable_released();
        }
    }

    fn acquire_group(&mut self, op: &Operator) -> ExecResult {
        let ids = op.ids_at(1).unwrap_or_default().to_vec();
        for obid in ids {
            let lock = self
                .ctx
                .store()
                .lock_of(obid)
                .ok_or(ExecError::NoSuchObject(obid))?;
            self.lock_vertex(&lock)?;
            self.held.entry(obid).or_insert_with(|| (lock, 0)).1 += 1;
            self.acquired_in_block.push(obid);
        }
        Ok(())
    }

    fn release_group(&mut self, ids: &[ObjectId]) {
        for obid in ids {
            self.release_one(*obid);
        }
    }

    fn release_one(&mut self, obid: ObjectId) -> bool {
        let Some((lock, count)) = self.held.get_mut(&obid) else {
            debug!(vertex = %obid, "executor.release_not_held");
            return false;
        };
        *count -= 1;
        let lock = Arc::clone(lock);
        if *count == 0 {
            self.held.remove(&obid);
        }
        self.unlock_vertex(&lock);
        true
    }
}

impl OperationTarget for GraphExecutor {
    fn begin(&mut self, header: &OpHeader) -> ExecResult {
        self.acquired_in_block.clear();
        if self.ctx.is_readonly() && header.optype != OpType::System {
            return Err(ExecError::Readonly);
        }
        if header.optype != OpType::VertexObject {
            return Ok(());
        }
        let existing = self.ctx.store().lock_of(header.vertex);
        let lock = existing.unwrap_or_else(|| Arc::new(VertexLock::new(VertexType::VERTEX)));
        self.lock_vertex(&lock)?;
        self.open = Some(OpenVertex {
            obid: header.vertex,
            lock,
        });
        Ok(())
    }

    fn apply(&mut self, header: &OpHeader, op: &Operator) -> ExecResult {
        trace!(op = ?op, "executor.apply");
        match op.code {
            OpCode::VERTICES_ACQUIRE_WL => return self.acquire_group(op),
            OpCode::VERTICES_RELEASE => {
                let ids = op.ids_at(1).unwrap_or_default().to_vec();
                self.release_group(&ids);
                return Ok(());
            }
            OpCode::VERTICES_RELEASE_ALL => {
                self.release_all();
                return Ok(());
            }
            _ => {}
        }
        match (&self.open, header.optype) {
            (Some(open), OpType::VertexObject) => {
                self.ctx.store_mut().apply_vertex(open.obid, &open.lock, op)
            }
            (None, OpType::VertexObject) => Err(ExecError::Permanent("vertex block not open".into())),
            _ => self.ctx.store_mut().apply_graph(op),
        }
    }

    fn end(&mut self, _header: &OpHeader, opid: OpId) -> ExecResult {
        if let Some(open) = self.open.take() {
            self.unlock_vertex(&open.lock);
        }
        self.acquired_in_block.clear();
        if opid != OpId::NONE {
            self.ctx.store_mut().set_last_opid(opid);
        }
        Ok(())
    }

    fn abort(&mut self, _header: &OpHeader) {
        if let Some(open) = self.open.take() {
            self.unlock_vertex(&open.lock);
        }
        for obid in std::mem::take(&mut self.acquired_in_block) {
            self.release_one(obid);
        }
    }

    fn held_locks(&self) -> usize {
        self.held.values().map(|(_, n)| *n as usize).sum()
    }

    fn release_all(&mut self) -> usize {
        let mut released = 0;
        for (_, (lock, count)) in std::mem::take(&mut self.held) {
            for _ in 0..count {
                self.unlock_vertex(&lock);
                released += 1;
            }
        }
        released
    }
}

impl Drop for GraphExecutor {
    fn drop(&mut self) {
        if let Some(open) = self.open.take() {
            self.unlock_vertex(&open.lock);
        }
        self.release_all();
    }
}
