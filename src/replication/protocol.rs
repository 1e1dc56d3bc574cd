#![forbid(unsafe_code)]
//! Line protocol spoken between a transactional producer and a consumer.
//!
//! Requests flow producer → consumer: the `ATTACH` handshake, transaction
//! envelopes (`TRANSACTION` … `COMMIT`) wrapping op blocks, `RESYNC` after a
//! retry, `IDLE` heartbeats and `DETACH`. Responses flow back one per line,
//! each followed by a ` # vgx` comment and an empty line.

use std::time::Duration;

use crate::primitives::bytes::field;
use crate::primitives::bytes::line::Tokens;
use crate::types::{ObjectId, Result, SombraError};

/// Protocol family both sides must agree on (high 16 bits compared).
pub const PROTOCOL: u32 = 0x0001_0000;
/// Protocol version; a consumer accepts producers up to its own version.
pub const VERSION: u32 = 0x0001_0000;
/// Largest transaction a consumer will buffer.
pub const TX_MAX_SIZE: usize = 8 << 20;
/// Longest response line a producer will read.
pub const RESPONSE_LINE_MAX: usize = 1024;
/// Producers stop accepting commits when their output buffer reaches this size.
pub const SYSOUT_LIMIT: usize = 512 << 20;
/// Headroom released once the output buffer limit has been hit.
pub const SYSOUT_THROTTLE: usize = 64 << 20;
/// Consumer heartbeat interval.
pub const IDLE_PERIOD: Duration = Duration::from_millis(2000);
/// Producer heartbeat interval.
pub const PRODUCER_IDLE_PERIOD: Duration = Duration::from_millis(7000);
/// Suspended consumers repeat their suspend request this often.
pub const RESUME_PERIOD: Duration = Duration::from_millis(11000);
/// How long a producer waits for the consumer's `ATTACH` answer.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// End of message marker.
pub const EOM: &[u8] = b"\n\n";

const COMMENT: &[u8] = b" # vgx\n";

/// Why a consumer refused a transaction.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum RejectReason {
    None = 0,
    ProtocolVersion = 1,
    /// The subscriber graph is readonly.
    Readonly = 2,
    OversizedTxLine = 3,
    OversizedTxData = 4,
    /// Anything else, including a serial regression.
    General = 5,
}

impl RejectReason {
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Unknown codes map to [`RejectReason::None`].
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::ProtocolVersion,
            2 => Self::Readonly,
            3 => Self::OversizedTxLine,
            4 => Self::OversizedTxData,
            5 => Self::General,
            _ => Self::None,
        }
    }

    /// Human readable text for logs.
    pub fn describe(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ProtocolVersion => "protocol version mismatch",
            Self::Readonly => "subscriber readonly",
            Self::OversizedTxLine => "oversized transaction line",
            Self::OversizedTxData => "oversized transaction data",
            Self::General => "unspecified",
        }
    }
}

/// How a producer should behave after `SUSPEND` or `RETRY`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SuspendCode {
    /// Resume automatically after the encoded number of milliseconds.
    AutoresumeTimeout,
    /// Stay suspended until `RESUME`.
    Indefinite,
}

/// Packed suspend reason: `code << 16 | milliseconds`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SuspendReason(pub u32);

impl SuspendReason {
    /// Suspend until explicitly resumed.
    pub const INDEFINITE: SuspendReason = SuspendReason(1 << 16);

    /// Auto-resume after `ms` (at most 65535).
    pub fn after_millis(ms: u32) -> Self {
        SuspendReason(ms.min(0xFFFF))
    }

    /// `None` for codes this side does not know.
    pub fn code(self) -> Option<SuspendCode> {
        match self.0 >> 16 {
            0 => Some(SuspendCode::AutoresumeTimeout),
            1 => Some(SuspendCode::Indefinite),
            _ => None,
        }
    }

    /// Auto-resume delay.
    pub fn millis(self) -> u32 {
        self.0 & 0xFFFF
    }
}

/// A line sent by the producer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// Handshake announcing the producer's protocol and graph.
    Attach {
        protocol: u32,
        version: u32,
        fingerprint: ObjectId,
        adminport: u16,
    },
    /// Opens a transaction.
    Transaction {
        txid: ObjectId,
        serial: u64,
        master_serial: u64,
    },
    /// Closes the transaction; `crc` covers everything since `TRANSACTION`.
    Commit {
        txid: ObjectId,
        tms: u64,
        crc: u32,
    },
    /// Restart from `txid`; `discard` is the count of unacknowledged bytes rewound.
    Resync {
        txid: ObjectId,
        discard: u64,
    },
    Idle {
        tms: u64,
        fingerprint: ObjectId,
    },
    /// Graceful disconnect.
    Detach,
    /// `OP`, operator or `ENDOP` line; left to the operation parser.
    Body,
    /// Blank or comment line.
    Blank,
}

/// A line sent by the consumer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    /// Handshake answer.
    Attach {
        protocol: u32,
        version: u32,
        fingerprint: ObjectId,
        adminport: u16,
    },
    /// Heartbeat with the consumer's progress.
    Idle {
        tms: u64,
        fingerprint: ObjectId,
        master_serial: u64,
    },
    /// Transaction logged (or executed) and acknowledged.
    Accepted {
        txid: ObjectId,
        crc: u32,
    },
    /// Transaction not taken now; resend after `reason`.
    Retry {
        txid: ObjectId,
        reason: SuspendReason,
    },
    /// Transaction refused for good; `reason` is a [`RejectReason`] code.
    Rejected {
        txid: ObjectId,
        reason: u32,
    },
    /// Hold off sending.
    Suspend(SuspendReason),
    Resume,
    Detach,
}

fn protocol_error(line: &[u8], what: &str) -> SombraError {
    SombraError::Protocol(format!("{what}: '{}'", String::from_utf8_lossy(line).trim_end()))
}

fn obid(tokens: &mut Tokens<'_>, line: &[u8], what: &str) -> Result<ObjectId> {
    tokens
        .next()
        .and_then(field::parse_obid)
        .filter(|id| !id.is_none())
        .ok_or_else(|| protocol_error(line, what))
}

fn u64_field(tokens: &mut Tokens<'_>, line: &[u8], what: &str) -> Result<u64> {
    tokens.next().and_then(field::parse_u64).ok_or_else(|| protocol_error(line, what))
}

fn u32_field(tokens: &mut Tokens<'_>, line: &[u8], what: &str) -> Result<u32> {
    tokens.next().and_then(field::parse_u32).ok_or_else(|| protocol_error(line, what))
}

fn u16_field(tokens: &mut Tokens<'_>, line: &[u8], what: &str) -> Result<u16> {
    tokens.next().and_then(field::parse_u16).ok_or_else(|| protocol_error(line, what))
}

impl Request {
    /// Classifies and parses one request line.
    pub fn parse(line: &[u8]) -> Result<Request> {
        let mut tokens = Tokens::new(line);
        let Some(keyword) = tokens.next() else {
            return Ok(Request::Blank);
        };
        let request = match keyword {
            b"ATTACH" => Request::Attach {
                protocol: u32_field(&mut tokens, line, "bad protocol")?,
                version: u32_field(&mut tokens, line, "bad version")?,
                fingerprint: obid(&mut tokens, line, "bad fingerprint")?,
                adminport: u16_field(&mut tokens, line, "bad adminport")?,
            },
            b"TRANSACTION" => Request::Transaction {
                txid: obid(&mut tokens, line, "bad transid")?,
                serial: u64_field(&mut tokens, line, "bad serial")?,
                master_serial: u64_field(&mut tokens, line, "bad master serial")?,
            },
            b"COMMIT" => Request::Commit {
                txid: obid(&mut tokens, line, "bad transid")?,
                tms: u64_field(&mut tokens, line, "bad timestamp")?,
                crc: u32_field(&mut tokens, line, "bad crc")?,
            },
            b"RESYNC" => Request::Resync {
                txid: obid(&mut tokens, line, "bad transid")?,
                discard: u64_field(&mut tokens, line, "bad discard count")?,
            },
            b"IDLE" => Request::Idle {
                tms: u64_field(&mut tokens, line, "bad timestamp")?,
                fingerprint: tokens
                    .next()
                    .and_then(field::parse_obid)
                    .unwrap_or(ObjectId::NONE),
            },
            b"DETACH" => Request::Detach,
            _ => Request::Body,
        };
        Ok(request)
    }

    /// Appends the wire form of an envelope or control request.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Request::Attach {
                protocol,
                version,
                fingerprint,
                adminport,
            } => {
                out.extend_from_slice(b"ATTACH ");
                field::put_u32(out, *protocol);
                out.push(b' ');
                field::put_u32(out, *version);
                out.push(b' ');
                field::put_obid(out, *fingerprint);
                out.push(b' ');
                field::put_u16(out, *adminport);
                out.extend_from_slice(EOM);
            }
            Request::Transaction {
                txid,
                serial,
                master_serial,
            } => {
                out.extend_from_slice(b"TRANSACTION ");
                field::put_obid(out, *txid);
                out.push(b' ');
                field::put_u64(out, *serial);
                out.push(b' ');
                field::put_u64(out, *master_serial);
                out.push(b'\n');
            }
            Request::Commit { txid, tms, crc } => {
                out.extend_from_slice(b"COMMIT ");
                field::put_obid(out, *txid);
                out.push(b' ');
                field::put_u64(out, *tms);
                out.push(b' ');
                field::put_u32(out, *crc);
                out.extend_from_slice(b"\r\n");
            }
            Request::Resync { txid, discard } => {
                out.extend_from_slice(EOM);
                out.extend_from_slice(b"RESYNC ");
                field::put_obid(out, *txid);
                out.push(b' ');
                field::put_u64(out, *discard);
                out.extend_from_slice(EOM);
            }
            Request::Idle { tms, fingerprint } => {
                out.extend_from_slice(EOM);
                out.extend_from_slice(b"IDLE ");
                field::put_u64(out, *tms);
                out.push(b' ');
                field::put_obid(out, *fingerprint);
                out.extend_from_slice(EOM);
            }
            Request::Detach => {
                out.extend_from_slice(EOM);
                out.extend_from_slice(b"DETACH");
                out.extend_from_slice(EOM);
            }
            Request::Body | Request::Blank => {}
        }
    }

    /// Encoded request, terminated as on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        self.encode(&mut out);
        out
    }
}

impl Response {
    /// Parses one response line; `Ok(None)` for blank, comment or unknown lines.
    pub fn parse(line: &[u8]) -> Result<Option<Response>> {
        let mut tokens = Tokens::new(line);
        let Some(keyword) = tokens.next() else {
            return Ok(None);
        };
        let response = match keyword {
            b"ACCEPTED" => Response::Accepted {
                txid: obid(&mut tokens, line, "bad transid")?,
                crc: u32_field(&mut tokens, line, "bad crc")?,
            },
            b"RETRY" => Response::Retry {
                txid: obid(&mut tokens, line, "bad transid")?,
                reason: SuspendReason(u32_field(&mut tokens, line, "bad reason")?),
            },
            b"REJECTED" => Response::Rejected {
                // A consumer that never saw a transaction rejects the all-ones id.
                txid: obid(&mut tokens, line, "bad transid")?,
                reason: u32_field(&mut tokens, line, "bad reason")?,
            },
            b"IDLE" => Response::Idle {
                tms: u64_field(&mut tokens, line, "bad timestamp")?,
                fingerprint: obid(&mut tokens, line, "bad fingerprint")?,
                master_serial: u64_field(&mut tokens, line, "bad master serial")?,
            },
            b"SUSPEND" => Response::Suspend(SuspendReason(u32_field(&mut tokens, line, "bad reason")?)),
            b"RESUME" => Response::Resume,
            b"ATTACH" => Response::Attach {
                protocol: u32_field(&mut tokens, line, "bad protocol")?,
                version: u32_field(&mut tokens, line, "bad version")?,
                fingerprint: obid(&mut tokens, line, "bad fingerprint")?,
                adminport: u16_field(&mut tokens, line, "bad adminport")?,
            },
            b"DETACH" => Response::Detach,
            _ => return Ok(None),
        };
        Ok(Some(response))
    }

    /// Appends the wire form, including the trailing comment.
    ///
    /// `accepted_size` is written into the `ACCEPTED` comment.
    pub fn encode(&self, out: &mut Vec<u8>, accepted_size: Option<usize>) {
        match self {
            Response::Attach {
                protocol,
                version,
                fingerprint,
                adminport,
            } => {
                out.extend_from_slice(b"ATTACH ");
                field::put_u32(out, *protocol);
                out.push(b' ');
                field::put_u32(out, *version);
                out.push(b' ');
                field::put_obid(out, *fingerprint);
                out.push(b' ');
                field::put_u16(out, *adminport);
                out.extend_from_slice(COMMENT);
                out.push(b'\n');
                return;
            }
            Response::Idle {
                tms,
                fingerprint,
                master_serial,
            } => {
                out.extend_from_slice(b"IDLE ");
                field::put_u64(out, *tms);
                out.push(b' ');
                field::put_obid(out, *fingerprint);
                out.push(b' ');
                field::put_u64(out, *master_serial);
            }
            Response::Accepted { txid, crc } => {
                out.extend_from_slice(b"ACCEPTED ");
                field::put_obid(out, *txid);
                out.push(b' ');
                field::put_u32(out, *crc);
                out.extend_from_slice(format!(" # sz={}\n", accepted_size.unwrap_or(0)).as_bytes());
                return;
            }
            Response::Retry { txid, reason } => {
                out.extend_from_slice(b"RETRY ");
                field::put_obid(out, *txid);
                out.push(b' ');
                field::put_u32(out, reason.0);
            }
            Response::Rejected { txid, reason } => {
                out.extend_from_slice(b"REJECTED ");
                field::put_obid(out, *txid);
                out.push(b' ');
                field::put_u32(out, *reason);
            }
            Response::Suspend(reason) => {
                out.extend_from_slice(b"SUSPEND ");
                field::put_u32(out, reason.0);
            }
            Response::Resume => out.extend_from_slice(b"RESUME"),
            Response::Detach => out.extend_from_slice(b"DETACH"),
        }
        out.extend_from_slice(COMMENT);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        self.encode(&mut out, None);
        out
    }
}

/// Protocol/version compatibility as checked by both ends of the handshake.
pub fn compatible(protocol: u32, version: u32) -> bool {
    protocol & 0xFFFF_0000 == PROTOCOL && version & 0xFFFF_0000 <= VERSION
}
