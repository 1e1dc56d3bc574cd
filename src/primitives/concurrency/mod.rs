#![forbid(unsafe_code)]
//! Lock primitives guarding vertex and graph state.

/// Reentrant per-graph critical section with suspend/resume.
pub mod graph_lock;
/// Graph-wide readonly mode coordination.
pub mod readonly;
/// Per-vertex packed lock descriptor.
pub mod vertex;

pub use graph_lock::{GraphGuard, GraphStateLock};
pub use readonly::{
    ReadonlyCoordinator, ReadonlyHost, ReadonlyState, ResumeFlags, Suspendable,
    MAX_READONLY_READERS, MAX_WRITERS_WAITING,
};
pub use vertex::{
    LockState, Manifestation, PropertyFlags, VertexDescriptor, VertexLock, VertexType,
    MAX_READERS, MAX_WRITE_RECURSION,
};
