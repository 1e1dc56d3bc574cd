#![forbid(unsafe_code)]
//! In-memory graph store.
//!
//! Writers and the replication parser mutate the store through the same
//! [`MemoryGraph::apply_vertex`] / [`MemoryGraph::apply_graph`] entry points,
//! so a replayed stream reproduces the state that produced it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use xxhash_rust::xxh64::Xxh64;

use crate::operation::opcode::OpCode;
use crate::operation::operator::Operator;
use crate::operation::parser::{ExecError, ExecResult};
use crate::primitives::concurrency::{Manifestation, PropertyFlags, VertexLock, VertexType};
use crate::types::{ObjectId, OpId};

/// One outgoing or incoming relationship.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ArcKey {
    pub predicate: u64,
    /// Head for an outarc, tail for an inarc.
    pub other: ObjectId,
}

/// Stored vertex.
#[derive(Debug, Clone)]
pub struct VertexRecord {
    pub obid: ObjectId,
    /// Name the object id was derived from.
    pub identifier: String,
    /// Lock and packed descriptor shared with writers.
    pub lock: Arc<VertexLock>,
    pub rank: u64,
    /// Creation timestamp.
    pub tmc: u32,
    /// Expiration timestamp, stored as received.
    pub tmx: u32,
    /// Property values by key hash.
    pub properties: BTreeMap<u64, String>,
    /// Encoded vector payload.
    pub vector: Option<String>,
    pub outarcs: BTreeSet<ArcKey>,
    pub inarcs: BTreeSet<ArcKey>,
}

impl VertexRecord {
    pub fn new(obid: ObjectId, identifier: &str, lock: Arc<VertexLock>) -> Self {
        Self {
            obid,
            identifier: identifier.to_string(),
            lock,
            rank: 0,
            tmc: 0,
            tmx: 0,
            properties: BTreeMap::new(),
            vector: None,
            outarcs: BTreeSet::new(),
            inarcs: BTreeSet::new(),
        }
    }

    /// Read from the lock descriptor.
    pub fn vertex_type(&self) -> VertexType {
        self.lock.snapshot().vertex_type()
    }

    fn sync_flags(&self) {
        let props = !self.properties.is_empty();
        let vector = self.vector.is_some();
        let out = !self.outarcs.is_empty();
        let inn = !self.inarcs.is_empty();
        self.lock.update(|d| {
            let mut flags = d.properties();
            flags.set(PropertyFlags::SCOPE_DEFINED, props);
            flags.set(PropertyFlags::VECTOR, vector);
            flags.set(PropertyFlags::DEGREE_OUT, out);
            flags.set(PropertyFlags::DEGREE_IN, inn);
            d.set_properties(flags);
        });
    }
}

/// Graph-level state changed by graph and system operators.
#[derive(Debug, Clone, Default, Eq, PartialEq, serde::Serialize)]
pub struct GraphState {
    /// Readonly state as last reported by the stream.
    pub source_readonly: bool,
    pub events_enabled: bool,
    /// Timestamp of the last `tic`.
    pub last_tick: u64,
    pub event_executions: u64,
    pub comments: u64,
    pub truncations: u64,
    /// Persist and state snapshots seen in the stream.
    pub persisted: u64,
    /// Highest operation id applied.
    pub last_opid: u64,
}

/// Vertices, arcs and enumerations of one graph.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    vertices: HashMap<ObjectId, VertexRecord>,
    enums: BTreeMap<(u32, u64), String>,
    strings: BTreeMap<ObjectId, String>,
    graphs: BTreeMap<ObjectId, String>,
    state: GraphState,
}

fn no_such(obid: ObjectId) -> ExecError {
    ExecError::NoSuchObject(obid)
}

fn bad_args(op: &Operator) -> ExecError {
    ExecError::Permanent(format!("malformed {} operator", op.mnemonic()))
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vertices.
    pub fn order(&self) -> usize {
        self.vertices.len()
    }

    /// Number of arcs.
    pub fn size(&self) -> usize {
        self.vertices.values().map(|v| v.outarcs.len()).sum()
    }

    pub fn vertex(&self, obid: ObjectId) -> Option<&VertexRecord> {
        self.vertices.get(&obid)
    }

    pub fn contains(&self, obid: ObjectId) -> bool {
        self.vertices.contains_key(&obid)
    }

    /// Shared handle to the vertex lock.
    pub fn lock_of(&self, obid: ObjectId) -> Option<Arc<VertexLock>> {
        self.vertices.get(&obid).map(|v| Arc::clone(&v.lock))
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.vertices.keys().copied()
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    /// Registered string for `hash` in the registry `kind` adds to.
    pub fn enum_value(&self, kind: OpCode, hash: u64) -> Option<&str> {
        self.enums.get(&(kind.0, hash)).map(String::as_str)
    }

    pub fn graph_names(&self) -> impl Iterator<Item = (&ObjectId, &String)> {
        self.graphs.iter()
    }

    pub(crate) fn set_last_opid(&mut self, opid: OpId) {
        if opid.0 > self.state.last_opid {
            self.state.last_opid = opid.0;
        }
    }

    /// Order-independent digest of all vertex content, for comparing replicas.
    pub fn fingerprint(&self) -> u64 {
        let mut ids: Vec<&ObjectId> = self.vertices.keys().collect();
        ids.sort();
        let mut hasher = Xxh64::new(0);
        for id in ids {
            let v = &self.vertices[id];
            hasher.update(&id.0.to_le_bytes());
            hasher.update(v.identifier.as_bytes());
            hasher.update(&[v.vertex_type().0]);
            hasher.update(&v.rank.to_le_bytes());
            hasher.update(&v.tmx.to_le_bytes());
            for (key, value) in &v.properties {
                hasher.update(&key.to_le_bytes());
                hasher.update(value.as_bytes());
            }
            if let Some(vector) = &v.vector {
                hasher.update(vector.as_bytes());
            }
            for arc in &v.outarcs {
                hasher.update(&arc.predicate.to_le_bytes());
                hasher.update(&arc.other.0.to_le_bytes());
            }
        }
        for ((kind, hash), value) in &self.enums {
            hasher.update(&kind.to_le_bytes());
            hasher.update(&hash.to_le_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.digest()
    }

    /// Applies a vertex operator to `vertex`.
    ///
    /// `lock` is the lock the caller holds for the vertex; `vxn` adopts it
    /// when the vertex does not exist yet.
    pub fn apply_vertex(&mut self, vertex: ObjectId, lock: &Arc<VertexLock>, op: &Operator) -> ExecResult {
        match op.code {
            OpCode::VERTEX_NEW => {
                let vxtype = op.u8_at(1).ok_or_else(|| bad_args(op))?;
                let identifier = op.str_at(6).ok_or_else(|| bad_args(op))?;
                let record = self
                    .vertices
                    .entry(vertex)
                    .or_insert_with(|| VertexRecord::new(vertex, identifier, Arc::clone(lock)));
                record.tmc = op.u32_at(2).unwrap_or(0);
                record.tmx = op.u32_at(3).unwrap_or(0);
                record.rank = op.u64_at(5).unwrap_or(0);
                record.lock.update(|d| {
                    d.set_type(VertexType(vxtype));
                    d.set_manifestation(Manifestation::Real);
                });
                Ok(())
            }
            OpCode::VERTEX_DELETE => {
                self.remove_vertex(vertex)?;
                Ok(())
            }
            OpCode::VERTEX_DELETE_OUTARCS => {
                let arcs = std::mem::take(&mut self.record_mut(vertex)?.outarcs);
                for arc in arcs {
                    if let Some(head) = self.vertices.get_mut(&arc.other) {
                        head.inarcs.remove(&ArcKey { predicate: arc.predicate, other: vertex });
                        head.sync_flags();
                    }
                }
                self.record_mut(vertex)?.sync_flags();
                Ok(())
            }
            OpCode::VERTEX_DELETE_INARCS => {
                let arcs = std::mem::take(&mut self.record_mut(vertex)?.inarcs);
                for arc in arcs {
                    if let Some(tail) = self.vertices.get_mut(&arc.other) {
                        tail.outarcs.remove(&ArcKey { predicate: arc.predicate, other: vertex });
                        tail.sync_flags();
                    }
                }
                self.record_mut(vertex)?.sync_flags();
                Ok(())
            }
            OpCode::ARC_CONNECT => {
                let predicate = op.u64_at(0).ok_or_else(|| bad_args(op))?;
                let head = op.obid_at(1).ok_or_else(|| bad_args(op))?;
                if !self.vertices.contains_key(&head) {
                    return Err(no_such(head));
                }
                self.record_mut(vertex)?.outarcs.insert(ArcKey { predicate, other: head });
                if let Some(h) = self.vertices.get_mut(&head) {
                    h.inarcs.insert(ArcKey { predicate, other: vertex });
                    h.sync_flags();
                }
                self.record_mut(vertex)?.sync_flags();
                Ok(())
            }
            OpCode::ARC_DISCONNECT => {
                let predicate = op.u64_at(2).ok_or_else(|| bad_args(op))?;
                let head = op.obid_at(3).ok_or_else(|| bad_args(op))?;
                let tail = self.record_mut(vertex)?;
                let removed: Vec<ArcKey> = tail
                    .outarcs
                    .iter()
                    .filter(|a| (predicate == 0 || a.predicate == predicate) && (head.is_none() || a.other == head))
                    .copied()
                    .collect();
                for arc in &removed {
                    tail.outarcs.remove(arc);
                }
                tail.sync_flags();
                for arc in removed {
                    if let Some(h) = self.vertices.get_mut(&arc.other) {
                        h.inarcs.remove(&ArcKey { predicate: arc.predicate, other: vertex });
                        h.sync_flags();
                    }
                }
                Ok(())
            }
            OpCode::VERTEX_ACQUIRE | OpCode::VERTEX_RELEASE => Ok(()),
            code => {
                let record = self.record_mut(vertex)?;
                match code {
                    OpCode::VERTEX_SET_RANK => record.rank = op.u64_at(0).ok_or_else(|| bad_args(op))?,
                    OpCode::VERTEX_SET_TYPE => {
                        let vxtype = op.u8_at(0).ok_or_else(|| bad_args(op))?;
                        record.lock.update(|d| d.set_type(VertexType(vxtype)));
                    }
                    OpCode::VERTEX_SET_TMX => record.tmx = op.u32_at(0).ok_or_else(|| bad_args(op))?,
                    OpCode::VERTEX_CONVERT => {
                        let man = match op.u8_at(0).ok_or_else(|| bad_args(op))? {
                            1 => Manifestation::Real,
                            2 => Manifestation::Virtual,
                            _ => Manifestation::Null,
                        };
                        record.lock.update(|d| d.set_manifestation(man));
                    }
                    OpCode::VERTEX_SET_PROPERTY => {
                        let key = op.u64_at(0).ok_or_else(|| bad_args(op))?;
                        let value = op.str_at(4).ok_or_else(|| bad_args(op))?;
                        record.properties.insert(key, value.to_string());
                    }
                    OpCode::VERTEX_DELETE_PROPERTY => {
                        let key = op.u64_at(0).ok_or_else(|| bad_args(op))?;
                        record.properties.remove(&key);
                    }
                    OpCode::VERTEX_CLEAR_PROPERTIES => record.properties.clear(),
                    OpCode::VERTEX_SET_VECTOR => {
                        record.vector = Some(op.str_at(0).ok_or_else(|| bad_args(op))?.to_string());
                    }
                    OpCode::VERTEX_DELETE_VECTOR => record.vector = None,
                    other => {
                        return Err(ExecError::Permanent(format!(
                            "{} is not a vertex operator",
                            other.mnemonic()
                        )))
                    }
                }
                record.sync_flags();
                Ok(())
            }
        }
    }

    /// Applies a graph, system or enumeration operator.
    ///
    /// Lock-group operators (`lxw`, `ulv`, `ula`) are handled by the caller.
    pub fn apply_graph(&mut self, op: &Operator) -> ExecResult {
        match op.code {
            OpCode::NONE | OpCode::SYSTEM_SIMILARITY | OpCode::SYSTEM_ATTACH | OpCode::SYSTEM_DETACH => {}
            OpCode::SYSTEM_SEND_COMMENT => self.state.comments += 1,
            OpCode::SYSTEM_CLEAR_REGISTRY => self.strings.clear(),
            OpCode::SYSTEM_CREATE_GRAPH => {
                let obid = op.obid_at(3).ok_or_else(|| bad_args(op))?;
                let name = op.str_at(5).ok_or_else(|| bad_args(op))?;
                self.graphs.insert(obid, name.to_string());
            }
            OpCode::SYSTEM_DELETE_GRAPH => {
                let obid = op.obid_at(0).ok_or_else(|| bad_args(op))?;
                self.graphs.remove(&obid);
            }
            OpCode::SYSTEM_CLONE_GRAPH => {
                let name = op.str_at(1).ok_or_else(|| bad_args(op))?;
                self.graphs.insert(ObjectId::from_name(name), name.to_string());
            }
            OpCode::GRAPH_TRUNCATE => {
                let vxtype = op.u8_at(0).ok_or_else(|| bad_args(op))?;
                self.truncate(VertexType(vxtype));
            }
            OpCode::GRAPH_PERSIST | OpCode::GRAPH_STATE => self.state.persisted += 1,
            OpCode::GRAPH_READONLY => self.state.source_readonly = true,
            OpCode::GRAPH_READWRITE => self.state.source_readonly = false,
            OpCode::GRAPH_EVENTS => self.state.events_enabled = true,
            OpCode::GRAPH_NOEVENTS => self.state.events_enabled = false,
            OpCode::GRAPH_TICK => self.state.last_tick = op.u64_at(0).ok_or_else(|| bad_args(op))?,
            OpCode::GRAPH_EVENT_EXEC => self.state.event_executions += 1,
            OpCode::ENUM_ADD_VXTYPE | OpCode::ENUM_ADD_REL | OpCode::ENUM_ADD_DIM | OpCode::ENUM_ADD_KEY => {
                let hash = op.u64_at(0).ok_or_else(|| bad_args(op))?;
                let value = op.str_at(2).ok_or_else(|| bad_args(op))?;
                self.enums.insert((op.code.0, hash), value.to_string());
            }
            OpCode::ENUM_DELETE_VXTYPE
            | OpCode::ENUM_DELETE_REL
            | OpCode::ENUM_DELETE_DIM
            | OpCode::ENUM_DELETE_KEY => {
                let hash = op.u64_at(0).ok_or_else(|| bad_args(op))?;
                let add = OpCode((op.code.0 & !0x1000_000F) | 0x1000_000C);
                self.enums.remove(&(add.0, hash));
            }
            OpCode::ENUM_ADD_STRING => {
                let value = op.str_at(0).ok_or_else(|| bad_args(op))?;
                let obid = op.obid_at(1).ok_or_else(|| bad_args(op))?;
                self.strings.insert(obid, value.to_string());
            }
            OpCode::ENUM_DELETE_STRING => {
                let obid = op.obid_at(0).ok_or_else(|| bad_args(op))?;
                self.strings.remove(&obid);
            }
            other => {
                return Err(ExecError::Permanent(format!(
                    "{} cannot be applied at graph level",
                    other.mnemonic()
                )))
            }
        }
        Ok(())
    }

    /// Removes every vertex of `vxtype` (all vertices for `VertexType::NONE`).
    pub fn truncate(&mut self, vxtype: VertexType) -> usize {
        let doomed: Vec<ObjectId> = self
            .vertices
            .values()
            .filter(|v| vxtype == VertexType::NONE || v.vertex_type() == vxtype)
            .map(|v| v.obid)
            .collect();
        for obid in &doomed {
            // Present by construction.
            let _ = self.remove_vertex(*obid);
        }
        self.state.truncations += 1;
        doomed.len()
    }

    fn remove_vertex(&mut self, vertex: ObjectId) -> ExecResult {
        let record = self.vertices.remove(&vertex).ok_or_else(|| no_such(vertex))?;
        for arc in &record.outarcs {
            if let Some(head) = self.vertices.get_mut(&arc.other) {
                head.inarcs.remove(&ArcKey { predicate: arc.predicate, other: vertex });
                head.sync_flags();
            }
        }
        for arc in &record.inarcs {
            if let Some(tail) = self.vertices.get_mut(&arc.other) {
                tail.outarcs.remove(&ArcKey { predicate: arc.predicate, other: vertex });
                tail.sync_flags();
            }
        }
        record.lock.update(|d| d.set_manifestation(Manifestation::Null));
        Ok(())
    }

    fn record_mut(&mut self, vertex: ObjectId) -> Result<&mut VertexRecord, ExecError> {
        self.vertices.get_mut(&vertex).ok_or_else(|| no_such(vertex))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> Arc<VertexLock> {
        Arc::new(VertexLock::new(VertexType::VERTEX))
    }

    fn add(g: &mut MemoryGraph, name: &str) -> ObjectId {
        let obid = ObjectId::from_name(name);
        g.apply_vertex(obid, &lock(), &Operator::vertex_new(name, 0x11, 0, 1))
            .expect("vxn");
        obid
    }

    #[test]
    fn vertex_lifecycle_and_arcs() {
        let mut g = MemoryGraph::new();
        let a = add(&mut g, "a");
        let b = add(&mut g, "b");
        let la = g.lock_of(a).expect("lock");
        g.apply_vertex(a, &la, &Operator::arc_connect(7, b)).expect("arc");
        assert_eq!(g.size(), 1);
        assert!(g.vertex(b).expect("b").inarcs.contains(&ArcKey { predicate: 7, other: a }));
        assert!(la.snapshot().properties().contains(PropertyFlags::DEGREE_OUT));

        g.apply_vertex(a, &la, &Operator::set_property(3, "x")).expect("vps");
        assert_eq!(g.vertex(a).expect("a").properties.get(&3).map(String::as_str), Some("x"));

        let lb = g.lock_of(b).expect("lock");
        g.apply_vertex(b, &lb, &Operator::vertex_delete(b)).expect("vxd");
        assert_eq!(g.order(), 1);
        assert_eq!(g.size(), 0);
    }

    #[test]
    fn missing_objects_are_reported() {
        let mut g = MemoryGraph::new();
        let a = add(&mut g, "a");
        let ghost = ObjectId::from_name("ghost");
        let la = g.lock_of(a).expect("lock");
        assert_eq!(
            g.apply_vertex(a, &la, &Operator::arc_connect(1, ghost)),
            Err(ExecError::NoSuchObject(ghost))
        );
        assert_eq!(
            g.apply_vertex(ghost, &lock(), &Operator::set_rank(3)),
            Err(ExecError::NoSuchObject(ghost))
        );
    }

    #[test]
    fn fingerprint_tracks_content() {
        let mut g1 = MemoryGraph::new();
        let mut g2 = MemoryGraph::new();
        add(&mut g1, "x");
        add(&mut g1, "y");
        add(&mut g2, "y");
        add(&mut g2, "x");
        assert_eq!(g1.fingerprint(), g2.fingerprint());
        let x = ObjectId::from_name("x");
        let lx = g2.lock_of(x).expect("lock");
        g2.apply_vertex(x, &lx, &Operator::set_rank(99)).expect("vxr");
        assert_ne!(g1.fingerprint(), g2.fingerprint());
    }

    #[test]
    fn graph_state_operators() {
        let mut g = MemoryGraph::new();
        add(&mut g, "a");
        g.apply_graph(&Operator::readonly()).expect("grr");
        assert!(g.state().source_readonly);
        g.apply_graph(&Operator::tick(42)).expect("tic");
        assert_eq!(g.state().last_tick, 42);
        g.apply_graph(&Operator::truncate(0, 1)).expect("grt");
        assert_eq!(g.order(), 0);
        assert!(g.apply_graph(&Operator::set_rank(1)).is_err());
    }
}
