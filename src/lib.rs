//! Durability and replication core for Sombra graphs.
//!
//! Writers capture graph mutations as operation blocks, the emitter batches
//! committed blocks into transactions, producers stream those to
//! subscribers, and a subscriber's consumer service verifies, logs and
//! replays them into its own graph.

#![warn(missing_docs)]

/// Identifiers, errors and checksums shared by every module.
pub mod types;

/// Field codec, file I/O, locks, buffers and the transaction log.
pub mod primitives;

/// Opcodes, operators, op blocks, the emitter and the parser.
pub mod operation;

/// Producers, the consumer service and the durability point.
pub mod replication;

/// Per-graph context and the in-memory graph store.
pub mod graph;

/// TOML configuration.
pub mod config;

pub use types::{ObjectId, OpId, Result, SombraError};
