#![forbid(unsafe_code)]
//! Transaction envelopes written by producers.
//!
//! A transaction is the `TRANSACTION` header, the op block data handed over
//! by the emitter, a human readable timestamp comment and the `COMMIT`
//! trailer. The running CRC covers everything before `COMMIT`.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::primitives::buffer::OperationBuffer;
use crate::replication::protocol::Request;
use crate::types::{crc32_extend, now_millis, ObjectId, Result};

const STAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]");

/// One framed transaction, tracked until the consumer acknowledges it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct OperationTransaction {
    /// Creation time in milliseconds since the epoch.
    pub tms: u64,
    pub serial: u64,
    pub txid: ObjectId,
    /// CRC over the header, data and comment lines.
    pub crc: u32,
    /// Total framed size in bytes, `COMMIT` line included.
    pub tsize: usize,
}

/// Serial and id allocation for one producer.
///
/// Serials start at the creation time in microseconds so a restarted
/// producer never reuses a serial its consumer has already executed.
#[derive(Clone, Debug)]
pub struct SerialSequence {
    serial0: u64,
    sn: u64,
    salt: u64,
}

impl SerialSequence {
    pub fn new() -> Self {
        Self::starting_at(now_millis() * 1000, rand::random())
    }

    pub fn starting_at(serial0: u64, salt: u64) -> Self {
        Self { serial0, sn: 0, salt }
    }

    /// Number of transactions allocated so far.
    pub fn count(&self) -> u64 {
        self.sn
    }

    pub fn last_serial(&self) -> u64 {
        self.serial0 + self.sn
    }

    /// Allocates the next serial and its transaction id.
    pub fn next(&mut self) -> (u64, ObjectId) {
        self.sn += 1;
        let serial = self.serial0 + self.sn;
        let txid = ObjectId::from_name(&format!("serial={serial:x},salt={:x}", self.salt));
        (serial, txid)
    }
}

impl Default for SerialSequence {
    fn default() -> Self {
        Self::new()
    }
}

fn stamp(tms: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(tms) * 1_000_000)
        .ok()
        .and_then(|t| t.format(STAMP_FORMAT).ok())
        .unwrap_or_else(|| tms.to_string())
}

/// Writes one complete transaction carrying `data` into `out`.
///
/// Nothing is left in `out` when an error is returned.
pub fn write_transaction(
    out: &mut OperationBuffer,
    sequence: &mut SerialSequence,
    data: &[u8],
    master_serial: u64,
    tms: u64,
) -> Result<OperationTransaction> {
    let (serial, txid) = sequence.next();
    let mut head = Vec::with_capacity(80);
    Request::Transaction {
        txid,
        serial,
        master_serial,
    }
    .encode(&mut head);
    let comment = format!("# [{}] [sn={}]\n", stamp(tms), sequence.count());

    let mut crc = crc32_extend(0, &head);
    crc = crc32_extend(crc, data);
    crc = crc32_extend(crc, comment.as_bytes());
    let mut commit = Vec::with_capacity(80);
    Request::Commit { txid, tms, crc }.encode(&mut commit);

    let tsize = head.len() + data.len() + comment.len() + commit.len();
    let mut written = 0;
    for piece in [&head[..], data, comment.as_bytes(), &commit[..]] {
        match out.write(piece) {
            Ok(n) => written += n,
            Err(err) => {
                out.unwrite(written);
                return Err(err);
            }
        }
    }
    Ok(OperationTransaction {
        tms,
        serial,
        txid,
        crc,
        tsize,
    })
}
