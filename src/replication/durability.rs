#![forbid(unsafe_code)]
//! Last transaction known to be durably applied on a consumer.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use crate::types::ObjectId;

/// Snapshot of a [`DurabilityPoint`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct DurablePosition {
    /// Transaction that reached the point.
    pub txid: ObjectId,
    pub serial: u64,
    /// Commit timestamp of that transaction.
    pub tms: u64,
}

/// Forward-only durability marker.
///
/// Readers never wait on writers for the serial (`serial()` is a plain
/// atomic load); the full position is behind a short read lock.
#[derive(Debug, Default)]
pub struct DurabilityPoint {
    position: RwLock<DurablePosition>,
    serial: AtomicU64,
    in_flight: AtomicU32,
}

impl DurabilityPoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the point to `serial` if it is newer; returns whether it moved.
    pub fn advance(&self, txid: ObjectId, serial: u64, tms: u64) -> bool {
        let mut position = self.position.write();
        if serial <= position.serial {
            return false;
        }
        *position = DurablePosition { txid, serial, tms };
        self.serial.store(serial, Ordering::Release);
        trace!(txid = %txid, serial, "durability.advance");
        true
    }

    /// Full position under a read lock.
    pub fn get(&self) -> DurablePosition {
        *self.position.read()
    }

    /// Lock-free serial of the current position.
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Registers a serialization (snapshot) in progress.
    pub fn begin_serialization(&self) -> u32 {
        self.in_flight.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the number of serializations still running.
    pub fn end_serialization(&self) -> u32 {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "durability point serialization count underflow");
        prev - 1
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }
}
