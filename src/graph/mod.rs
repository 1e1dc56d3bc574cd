//! Graph context, in-memory store and the replication-side executor.

/// Per-graph context with the writer API and readonly coordination hooks.
pub mod context;

/// Applies parsed blocks to a context.
pub mod executor;

/// Vertex and arc store.
pub mod memory;

pub use context::{ContextOptions, GraphContext, VertexGroup, VertexWriter};
pub use executor::GraphExecutor;
pub use memory::{ArcKey, GraphState, MemoryGraph, VertexRecord};
