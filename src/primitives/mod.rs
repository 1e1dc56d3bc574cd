//! Low-level primitives for the durability core.
//!
//! Includes the wire field codec, file I/O, lock primitives, the circular
//! operation buffer and the consumer transaction log.

/// Text field encoding and line tokenizing.
pub mod bytes;

/// Vertex locks, the graph state lock and readonly coordination.
pub mod concurrency;

/// Positioned file I/O.
pub mod io;

/// Growable circular byte buffer.
pub mod buffer;

/// Durable transaction log.
///
/// Frames are checksummed and chained so a damaged tail is detected on open.
pub mod txlog;
