#![forbid(unsafe_code)]

//! Shared identifiers, error type and checksum helpers.

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use time::OffsetDateTime;

/// Checksum trait and CRC helpers used by the operation log.
pub mod checksum;

pub use checksum::{crc32_extend, Checksum, Crc32Fast};

/// 128-bit identity of a graph, vertex or transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct ObjectId(pub u128);

/// Monotonic operation identifier assigned by a graph's emitter.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct OpId(pub u64);

/// Small integer identifying an OS thread for lock ownership.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ThreadTag(pub u32);

#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    #[error("not found")]
    NotFound,
    #[error("timeout: {0}")]
    Timeout(&'static str),
    #[error("graph is readonly")]
    Readonly,
    #[error("busy: {0}")]
    Busy(&'static str),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("rejected (reason {reason:08X}): {detail}")]
    Rejected { reason: u32, detail: String },
    #[error("closed: {0}")]
    Closed(&'static str),
}

/// Crate-wide result.
pub type Result<T> = std::result::Result<T, SombraError>;

impl SombraError {
    /// True for conditions the caller may retry after a short wait.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SombraError::Timeout(_) | SombraError::Busy(_) | SombraError::Readonly
        )
    }

    /// Rebuilds an equivalent error so it can be handed to several waiters.
    pub fn duplicate(&self) -> SombraError {
        match self {
            SombraError::Io(err) => {
                SombraError::Io(std::io::Error::new(err.kind(), err.to_string()))
            }
            SombraError::Corruption(msg) => SombraError::Corruption(msg),
            SombraError::Invalid(msg) => SombraError::Invalid(msg),
            SombraError::InvalidOwned(msg) => SombraError::InvalidOwned(msg.clone()),
            SombraError::NotFound => SombraError::NotFound,
            SombraError::Timeout(msg) => SombraError::Timeout(msg),
            SombraError::Readonly => SombraError::Readonly,
            SombraError::Busy(msg) => SombraError::Busy(msg),
            SombraError::Protocol(msg) => SombraError::Protocol(msg.clone()),
            SombraError::Rejected { reason, detail } => SombraError::Rejected {
                reason: *reason,
                detail: detail.clone(),
            },
            SombraError::Closed(msg) => SombraError::Closed(msg),
        }
    }
}

const OBID_SEED_HIGH: u64 = 0x5EED_0F0B_1D00_0001;
const OBID_SEED_LOW: u64 = 0x5EED_0F0B_1D00_0002;

impl ObjectId {
    /// Null id.
    pub const NONE: ObjectId = ObjectId(0);

    /// Derives a stable identity from an external name.
    pub fn from_name(name: &str) -> Self {
        let hi = xxhash_rust::xxh64::xxh64(name.as_bytes(), OBID_SEED_HIGH);
        let lo = xxhash_rust::xxh64::xxh64(name.as_bytes(), OBID_SEED_LOW);
        Self::from_parts(hi, lo)
    }

    /// High half first.
    pub const fn from_parts(high: u64, low: u64) -> Self {
        ObjectId(((high as u128) << 64) | low as u128)
    }

    pub const fn high(self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub const fn low(self) -> u64 {
        self.0 as u64
    }

    /// True for [`Self::NONE`].
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Parses exactly 32 hex digits.
    pub fn parse_hex(token: &[u8]) -> Option<Self> {
        if token.len() != 32 {
            return None;
        }
        let text = std::str::from_utf8(token).ok()?;
        u128::from_str_radix(text, 16).ok().map(ObjectId)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl serde::Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for ObjectId {
    type Err = SombraError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectId::parse_hex(s.as_bytes()).ok_or(SombraError::Invalid("object id must be 32 hex digits"))
    }
}

impl OpId {
    /// Not yet assigned.
    pub const NONE: OpId = OpId(0);

    pub const fn next(self) -> OpId {
        OpId(self.0 + 1)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_THREAD_TAG: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_TAG: Cell<u32> = const { Cell::new(0) };
}

impl ThreadTag {
    /// Tag of the calling thread, allocated on first use. Never zero.
    pub fn current() -> Self {
        THREAD_TAG.with(|tag| {
            if tag.get() == 0 {
                tag.set(NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed));
            }
            ThreadTag(tag.get())
        })
    }
}

impl fmt::Display for ThreadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall clock in milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}
