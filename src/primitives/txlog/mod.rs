#![forbid(unsafe_code)]
//! Append-only log of accepted transactions kept by a durable consumer.
//!
//! Each frame stores one transaction's raw text together with its serial,
//! id and timestamp. Frame headers carry their own CRC, the payload CRC and
//! the running chain value of the previous frame, so a torn or corrupted
//! tail is detected and cut off on open.

use std::fmt;
use std::io::{ErrorKind, IoSlice};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::compute_crc32;
use crate::types::{crc32_extend, now_millis, ObjectId, Result, SombraError};

const TXLOG_MAGIC: [u8; 4] = *b"SDTX";
const TXLOG_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 48;
/// File name used inside the log directory.
pub const TXLOG_FILE_NAME: &str = "transactions.log";
/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 64 << 20;

/// Counters for a [`TxLog`].
#[derive(Clone, Debug, Default)]
pub struct TxLogStats {
    /// Frames written since open.
    pub frames_appended: u64,
    pub bytes_appended: u64,
    /// `fsync` calls.
    pub syncs: u64,
    /// Bytes discarded from a damaged tail on open.
    pub truncated_bytes: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
    created_ms: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&TXLOG_MAGIC);
        buf[4..6].copy_from_slice(&TXLOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        buf[16..24].copy_from_slice(&self.created_ms.to_be_bytes());
        let crc = compute_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != TXLOG_MAGIC {
            return Err(SombraError::Corruption("txlog magic mismatch"));
        }
        let version = be_u16(&src[4..6]);
        if version != TXLOG_FORMAT_VERSION {
            return Err(SombraError::Corruption("txlog format version mismatch"));
        }
        let stored_crc = be_u32(&src[28..32]);
        if compute_crc32(&[&src[..28]]) != stored_crc {
            return Err(SombraError::Corruption("txlog header crc mismatch"));
        }
        Ok(Self {
            salt: be_u64(&src[8..16]),
            created_ms: be_u64(&src[16..24]),
        })
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    serial: u64,
    txid: ObjectId,
    tms: u64,
    len: u32,
    payload_crc: u32,
    prev_chain: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.serial.to_be_bytes());
        buf[8..24].copy_from_slice(&self.txid.0.to_be_bytes());
        buf[24..32].copy_from_slice(&self.tms.to_be_bytes());
        buf[32..36].copy_from_slice(&self.len.to_be_bytes());
        buf[36..40].copy_from_slice(&self.payload_crc.to_be_bytes());
        buf[40..44].copy_from_slice(&self.prev_chain.to_be_bytes());
        let crc = compute_crc32(&[&buf[..44]]);
        buf[44..48].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FRAME_HEADER_LEN]) -> Option<Self> {
        let stored_crc = be_u32(&src[44..48]);
        if compute_crc32(&[&src[..44]]) != stored_crc {
            return None;
        }
        Some(Self {
            serial: be_u64(&src[0..8]),
            txid: ObjectId(be_u128(&src[8..24])),
            tms: be_u64(&src[24..32]),
            len: be_u32(&src[32..36]),
            payload_crc: be_u32(&src[36..40]),
            prev_chain: be_u32(&src[40..44]),
        })
    }
}

fn be_array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&src[..N]);
    out
}

fn be_u16(src: &[u8]) -> u16 {
    u16::from_be_bytes(be_array(src))
}

fn be_u32(src: &[u8]) -> u32 {
    u32::from_be_bytes(be_array(src))
}

fn be_u64(src: &[u8]) -> u64 {
    u64::from_be_bytes(be_array(src))
}

fn be_u128(src: &[u8]) -> u128 {
    u128::from_be_bytes(be_array(src))
}

fn chain_after(prev: u32, header: &[u8; FRAME_HEADER_LEN], payload: &[u8]) -> u32 {
    crc32_extend(crc32_extend(prev, header), payload)
}

/// One transaction as stored in the log.
#[derive(Clone, PartialEq, Eq)]
pub struct TxRecord {
    /// Producer serial of the transaction.
    pub serial: u64,
    pub txid: ObjectId,
    pub tms: u64,
    /// Transaction body exactly as received.
    pub payload: Vec<u8>,
}

impl TxRecord {
    /// CRC of the stored transaction text.
    pub fn crc(&self) -> u32 {
        compute_crc32(&[&self.payload])
    }
}

impl fmt::Debug for TxRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxRecord")
            .field("serial", &self.serial)
            .field("txid", &format_args!("{}", self.txid))
            .field("tms", &self.tms)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

struct TxLogState {
    append_offset: u64,
    chain: u32,
    last_serial: u64,
    stats: TxLogStats,
}

/// Durable, checksummed transaction log.
pub struct TxLog {
    io: Arc<dyn FileIo>,
    path: PathBuf,
    header: FileHeader,
    state: Mutex<TxLogState>,
}

impl TxLog {
    /// Opens (or creates) the log in `dir`, dropping any damaged tail.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let io = StdFileIo::open_in(dir.as_ref(), TXLOG_FILE_NAME)?;
        let path = io.path().to_path_buf();
        Self::open_with(Arc::new(io), path)
    }

    /// Opens a log over an arbitrary [`FileIo`].
    pub fn open_with(io: Arc<dyn FileIo>, path: PathBuf) -> Result<Self> {
        let header = if io.len()? < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                salt: rand::random(),
                created_ms: now_millis(),
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            io.sync_all()?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            FileHeader::decode(&buf)?
        };
        let mut iter = TxLogIterator::new(Arc::clone(&io))?;
        let mut last_serial = 0;
        while let Some(record) = iter.next_record()? {
            last_serial = record.serial;
        }
        let end = io.len()?;
        let valid = iter.valid_up_to();
        let mut stats = TxLogStats::default();
        if valid < end {
            warn!(
                path = %path.display(),
                valid,
                end,
                "txlog.truncate_damaged_tail"
            );
            io.truncate(valid)?;
            stats.truncated_bytes = end - valid;
        }
        info!(path = %path.display(), last_serial, "txlog.open");
        Ok(Self {
            io,
            path,
            header,
            state: Mutex::new(TxLogState {
                append_offset: valid,
                chain: iter.chain,
                last_serial,
                stats,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Random value chosen when the log was created.
    pub fn salt(&self) -> u64 {
        self.header.salt
    }

    pub fn created_ms(&self) -> u64 {
        self.header.created_ms
    }

    /// Appends one transaction. Does not sync.
    pub fn append(&self, serial: u64, txid: ObjectId, tms: u64, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(SombraError::Invalid("txlog payload too large"));
        }
        let mut state = self.state.lock();
        let header = FrameHeader {
            serial,
            txid,
            tms,
            len: payload.len() as u32,
            payload_crc: compute_crc32(&[payload]),
            prev_chain: state.chain,
        }
        .encode();
        self.io.writev_at(
            state.append_offset,
            &[IoSlice::new(&header), IoSlice::new(payload)],
        )?;
        let frame_len = (FRAME_HEADER_LEN + payload.len()) as u64;
        state.append_offset += frame_len;
        state.chain = chain_after(state.chain, &header, payload);
        state.last_serial = serial;
        state.stats.frames_appended += 1;
        state.stats.bytes_appended += frame_len;
        debug!(serial, bytes = payload.len(), "txlog.append");
        Ok(())
    }

    /// Flushes appended frames to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Serial of the newest frame (zero for an empty log that was never written).
    pub fn last_serial(&self) -> u64 {
        self.state.lock().last_serial
    }

    pub fn stats(&self) -> TxLogStats {
        self.state.lock().stats.clone()
    }

    /// File length in bytes, header included.
    pub fn len(&self) -> u64 {
        self.state.lock().append_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= FILE_HEADER_LEN as u64
    }

    /// Iterates the frames from the start of the file.
    pub fn iter(&self) -> Result<TxLogIterator> {
        TxLogIterator::new(Arc::clone(&self.io))
    }
}

/// Sequential reader over the frames of a [`TxLog`].
///
/// Stops at the first frame whose header, payload or chain does not verify.
pub struct TxLogIterator {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    chain: u32,
    valid_up_to: u64,
}

impl TxLogIterator {
    fn new(io: Arc<dyn FileIo>) -> Result<Self> {
        let end = io.len()?;
        if end < FILE_HEADER_LEN as u64 {
            return Err(SombraError::Corruption("txlog truncated header"));
        }
        let mut buf = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut buf)?;
        FileHeader::decode(&buf)?;
        Ok(Self {
            io,
            offset: FILE_HEADER_LEN as u64,
            end,
            chain: 0,
            valid_up_to: FILE_HEADER_LEN as u64,
        })
    }

    fn read_or_stop(&mut self, off: u64, dst: &mut [u8]) -> Result<bool> {
        match self.io.read_at(off, dst) {
            Ok(()) => Ok(true),
            Err(SombraError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                self.offset = self.end;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Next verified record, or `None` at the end of the valid prefix.
    pub fn next_record(&mut self) -> Result<Option<TxRecord>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut raw = [0u8; FRAME_HEADER_LEN];
        if !self.read_or_stop(self.offset, &mut raw)? {
            return Ok(None);
        }
        let Some(header) = FrameHeader::decode(&raw) else {
            self.offset = self.end;
            return Ok(None);
        };
        if header.prev_chain != self.chain || header.len as usize > MAX_FRAME_PAYLOAD {
            self.offset = self.end;
            return Ok(None);
        }
        let mut payload = vec![0u8; header.len as usize];
        if !self.read_or_stop(self.offset + FRAME_HEADER_LEN as u64, &mut payload)? {
            return Ok(None);
        }
        if compute_crc32(&[&payload]) != header.payload_crc {
            self.offset = self.end;
            return Ok(None);
        }
        self.chain = chain_after(self.chain, &raw, &payload);
        self.offset += (FRAME_HEADER_LEN + payload.len()) as u64;
        self.valid_up_to = self.offset;
        Ok(Some(TxRecord {
            serial: header.serial,
            txid: header.txid,
            tms: header.tms,
            payload,
        }))
    }

    /// File offset through which frames verified.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }
}

impl Iterator for TxLogIterator {
    type Item = Result<TxRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn txid(n: u64) -> ObjectId {
        ObjectId::from_parts(0xabc, n)
    }

    #[test]
    fn append_and_iterate_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let log = TxLog::open(dir.path())?;
        log.append(1, txid(1), 100, b"TRANSACTION a\nCOMMIT a\n")?;
        log.append(2, txid(2), 200, b"TRANSACTION b\nCOMMIT b\n")?;
        log.sync()?;
        let records: Vec<TxRecord> = log.iter()?.collect::<Result<_>>()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].serial, 1);
        assert_eq!(records[1].txid, txid(2));
        assert_eq!(records[1].payload, b"TRANSACTION b\nCOMMIT b\n");
        assert_eq!(log.stats().frames_appended, 2);
        assert_eq!(log.stats().syncs, 1);
        Ok(())
    }

    #[test]
    fn reopen_continues_chain() -> Result<()> {
        let dir = tempdir()?;
        {
            let log = TxLog::open(dir.path())?;
            log.append(7, txid(7), 1, b"one")?;
            log.sync()?;
        }
        let log = TxLog::open(dir.path())?;
        assert_eq!(log.last_serial(), 7);
        log.append(8, txid(8), 2, b"two")?;
        let serials: Vec<u64> = log
            .iter()?
            .map(|r| r.map(|r| r.serial))
            .collect::<Result<_>>()?;
        assert_eq!(serials, vec![7, 8]);
        Ok(())
    }

    #[test]
    fn corrupted_tail_is_truncated_on_open() -> Result<()> {
        let dir = tempdir()?;
        {
            let log = TxLog::open(dir.path())?;
            log.append(1, txid(1), 1, b"first")?;
            log.append(2, txid(2), 2, b"second")?;
            log.sync()?;
        }
        let io = StdFileIo::open(dir.path().join(TXLOG_FILE_NAME))?;
        let second_payload = (FILE_HEADER_LEN + FRAME_HEADER_LEN + 5 + FRAME_HEADER_LEN) as u64;
        let mut byte = [0u8; 1];
        io.read_at(second_payload, &mut byte)?;
        io.write_at(second_payload, &[byte[0] ^ 0x01])?;

        let log = TxLog::open(dir.path())?;
        assert_eq!(log.last_serial(), 1);
        assert_eq!(log.stats().truncated_bytes, (FRAME_HEADER_LEN + 6) as u64);
        assert_eq!(log.iter()?.count(), 1);
        Ok(())
    }

    #[test]
    fn bad_magic_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let io = StdFileIo::open_in(dir.path(), TXLOG_FILE_NAME)?;
        io.write_at(0, &[0u8; FILE_HEADER_LEN])?;
        assert!(matches!(
            TxLog::open(dir.path()),
            Err(SombraError::Corruption(_))
        ));
        Ok(())
    }
}
