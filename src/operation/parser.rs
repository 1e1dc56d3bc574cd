#![forbid(unsafe_code)]
//! Streaming parser and executor for the operation stream.
//!
//! The parser consumes complete lines from an [`OperationBuffer`]. Bytes are
//! confirmed once the line (or, inside an `OP` block, the whole block) has
//! been handled, so a transient failure can roll the buffer back to the
//! start of the block and retry it later.
//!
//! A block is applied only after its `ENDOP` line has been read and its CRC
//! verified; a damaged block is never executed.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::operation::op::{OpHeader, OpLineError, OpTrailer};
use crate::operation::opcode::{AuxCommand, OpCode, OpcodeFilter, OpcodeGate, ProfileId};
use crate::operation::operator::{signature, Operator};
use crate::primitives::buffer::OperationBuffer;
use crate::primitives::bytes::field;
use crate::primitives::bytes::line::Tokens;
use crate::types::{crc32_extend, now_millis, ObjectId, OpId, SombraError};

const MAX_FEED_BATCH: usize = 1 << 26;
const READONLY_BACKOFF: Duration = Duration::from_millis(5000);
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_IGNORE_WARNINGS: u64 = 8;

/// Parser states, numbered as in the wire protocol documentation.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum ParserState {
    /// Between transactions, any keyword accepted.
    ExpectAny = 0x0000,
    ExpectOp = 0x0001,
    ExpectOptype = 0x0002,
    ExpectGraphObid = 0x0003,
    ExpectVertexObid = 0x0004,
    /// Inside an `OP` block, reading operator lines.
    ExpectOperator = 0x0011,
    ExpectOpname = 0x0021,
    ExpectOpcode = 0x0022,
    ExpectOparg = 0x0023,
    ExpectEndop = 0x0031,
    ExpectOpid = 0x0032,
    ExpectTms = 0x0033,
    ExpectCrc = 0x0034,
    /// Heartbeat line.
    ExpectIdle = 0x0A01,
    ExpectIdleTms = 0x0A02,
    ExpectTransaction = 0x0B01,
    ExpectTransactionId = 0x0B02,
    ExpectTransactionSn = 0x0B03,
    ExpectTransactionMasterSn = 0x0B04,
    ExpectCommit = 0x0C01,
    ExpectCommitId = 0x0C02,
    ExpectCommitTms = 0x0C03,
    ExpectCommitCrc = 0x0C04,
    /// Upstream asks to restart from a transaction id.
    ExpectResync = 0x0D01,
    ExpectResyncId = 0x0D02,
    ExpectResyncCount = 0x0D03,
    ExpectAttach = 0x0E01,
    ExpectAttachProtocol = 0x0E02,
    ExpectAttachVersion = 0x0E03,
    /// Input exhausted mid-stream; resume on the next feed.
    Yield = 0x8000,
    /// Skipping input until the next transaction boundary.
    Recovery = 0xEE01,
    /// Backing off before retrying the current block.
    Transient = 0xEE20,
    Permanent = 0xEE40,
    /// The current transaction failed and is being skipped.
    TransactionError = 0xEE80,
}

impl ParserState {
    /// Wire number, printed as four hex digits in errors.
    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// How transaction serial numbers are checked.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialCheck {
    /// No check.
    Off,
    /// Regressed transactions are parsed but only exempt opcodes run.
    Silent,
    /// Regressed transactions are transaction-level errors.
    #[default]
    Strict,
}

/// Whether parsed blocks are applied to the target.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Apply every block.
    #[default]
    Normal,
    /// Parse and validate only.
    Simulate,
}

/// Parser tuning.
#[derive(Clone, Debug)]
pub struct ParserOptions {
    /// Verify block and transaction CRCs.
    pub validate: bool,
    /// Apply or simulate.
    pub exec: ExecMode,
    pub serial_check: SerialCheck,
    /// Longest accepted line in bytes, at least 256.
    pub max_line: usize,
    /// Opcodes still executed inside a regressed transaction.
    pub regression_exempt: Vec<OpCode>,
    /// Opcode profile applied to the gate at construction.
    pub profile: Option<ProfileId>,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            validate: true,
            exec: ExecMode::Normal,
            serial_check: SerialCheck::Strict,
            max_line: 8 << 20,
            regression_exempt: vec![OpCode::SYSTEM_SEND_COMMENT, OpCode::GRAPH_TICK],
            profile: None,
        }
    }
}

impl ParserOptions {
    fn normalize(mut self) -> Self {
        self.max_line = self.max_line.max(256);
        self
    }
}

/// Why a block could not be applied.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum ExecError {
    #[error("graph is readonly")]
    Readonly,
    /// Retry the block after a short backoff.
    #[error("temporarily unavailable: {0}")]
    Transient(String),
    /// The operation names an object the target does not have; it is skipped.
    #[error("object does not exist: {0}")]
    NoSuchObject(ObjectId),
    /// The block can never succeed.
    #[error("{0}")]
    Permanent(String),
    #[error("transaction error: {0}")]
    Transaction(String),
}

/// Outcome of applying one block.
pub type ExecResult = std::result::Result<(), ExecError>;

impl From<ExecError> for SombraError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Readonly => SombraError::Readonly,
            ExecError::NoSuchObject(_) => SombraError::NotFound,
            ExecError::Transient(_) => SombraError::Busy("object temporarily unavailable"),
            ExecError::Permanent(msg) | ExecError::Transaction(msg) => SombraError::InvalidOwned(msg),
        }
    }
}

/// Graph the parser applies blocks to.
pub trait OperationTarget {
    /// Opens the object a block applies to.
    fn begin(&mut self, header: &OpHeader) -> ExecResult;

    fn apply(&mut self, header: &OpHeader, op: &Operator) -> ExecResult;

    /// Closes the block; `opid` is the producer's operation id when present.
    fn end(&mut self, header: &OpHeader, opid: OpId) -> ExecResult;

    /// Undoes whatever `begin` opened after a failed block.
    fn abort(&mut self, header: &OpHeader);

    /// Vertex locks held across blocks (`lxw` without `ulv` yet).
    fn held_locks(&self) -> usize;

    /// Force-releases every held vertex lock and returns how many there were.
    fn release_all(&mut self) -> usize;
}

/// Receiver of assembled `dat` payloads.
pub trait AuxCommandHandler: Send {
    fn handle(
        &mut self,
        command: AuxCommand,
        obid: ObjectId,
        payload: &str,
    ) -> std::result::Result<(), String>;
}

/// Target that accepts every block without applying it, for validation runs.
#[derive(Debug, Default)]
pub struct DiscardTarget;

impl OperationTarget for DiscardTarget {
    fn begin(&mut self, _header: &OpHeader) -> ExecResult {
        Ok(())
    }

    fn apply(&mut self, _header: &OpHeader, _op: &Operator) -> ExecResult {
        Ok(())
    }

    fn end(&mut self, _header: &OpHeader, _opid: OpId) -> ExecResult {
        Ok(())
    }

    fn abort(&mut self, _header: &OpHeader) {}

    fn held_locks(&self) -> usize {
        0
    }

    fn release_all(&mut self) -> usize {
        0
    }
}

/// Result of one [`OperationParser::feed`] call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FeedOutcome {
    /// Every complete line was consumed.
    Drained,
    /// A batch limit was reached with input left.
    Yielded,
    /// A transient failure; the pending block was rolled back for retry.
    Backoff(Duration),
}

/// Parser counters.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct ParserStats {
    /// Transactions committed.
    pub transactions: u64,
    /// `OP` blocks applied.
    pub operations: u64,
    /// Operator lines parsed.
    pub opcodes: u64,
    pub bytes: u64,
    pub syntax_errors: u64,
    pub transient_errors: u64,
    pub permanent_errors: u64,
    pub transaction_errors: u64,
    /// Blocks or transactions whose CRC did not match.
    pub crc_mismatches: u64,
    /// Operators dropped by the opcode gate.
    pub filtered_opcodes: u64,
    /// Blocks skipped because they named a missing object.
    pub ignored_operations: u64,
    /// Regressed transactions parsed under [`SerialCheck::Silent`].
    pub regressions_skipped: u64,
    pub last_serial: u64,
    /// Age of the last commit timestamp when it was parsed.
    pub lag_ms: u64,
    /// Most recent error, prefixed with the parser state.
    pub last_error: Option<String>,
}

struct PendingBlock {
    header: OpHeader,
    crc: u32,
    operators: Vec<Operator>,
}

enum Step {
    Continue,
    Backoff(Duration),
}

/// Operation stream parser.
pub struct OperationParser {
    options: ParserOptions,
    exempt: BTreeSet<OpCode>,
    gate: OpcodeGate,
    aux: Option<Box<dyn AuxCommandHandler>>,
    aux_parts: Vec<String>,
    state: ParserState,
    errstate: ParserState,
    txid: Option<ObjectId>,
    sn: u64,
    replay: bool,
    tx_crc: u32,
    mark_crc: u32,
    mark_state: ParserState,
    block: Option<PendingBlock>,
    ignore_warnings: u64,
    stats: ParserStats,
}

fn keyword(line: &[u8]) -> Option<&[u8]> {
    Tokens::new(line).next()
}

impl OperationParser {
    /// Starts in [`ParserState::ExpectTransaction`].
    pub fn new(options: ParserOptions) -> Self {
        let options = options.normalize();
        let mut gate = OpcodeGate::new();
        if let Some(profile) = options.profile {
            gate.apply_profile(profile);
        }
        Self {
            exempt: options.regression_exempt.iter().copied().collect(),
            options,
            gate,
            aux: None,
            aux_parts: Vec::new(),
            state: ParserState::ExpectTransaction,
            errstate: ParserState::ExpectAny,
            txid: None,
            sn: 0,
            replay: false,
            tx_crc: 0,
            mark_crc: 0,
            mark_state: ParserState::ExpectTransaction,
            block: None,
            ignore_warnings: 0,
            stats: ParserStats::default(),
        }
    }

    pub fn with_aux_handler(mut self, handler: Box<dyn AuxCommandHandler>) -> Self {
        self.aux = Some(handler);
        self
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    pub fn set_exec_mode(&mut self, exec: ExecMode) {
        self.options.exec = exec;
    }

    pub fn set_serial_check(&mut self, check: SerialCheck) {
        self.options.serial_check = check;
    }

    pub fn set_validate(&mut self, validate: bool) {
        self.options.validate = validate;
    }

    /// Forwards to the gate. `None` if the filter matched nothing.
    pub fn deny(&mut self, filter: OpcodeFilter) -> Option<usize> {
        self.gate.deny(filter)
    }

    pub fn allow(&mut self, filter: OpcodeFilter) -> Option<usize> {
        self.gate.allow(filter)
    }

    pub fn apply_profile(&mut self, profile: ProfileId) -> usize {
        self.gate.apply_profile(profile)
    }

    pub fn gate(&self) -> &OpcodeGate {
        &self.gate
    }

    /// Current state.
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Serial number of the last transaction header accepted.
    pub fn last_serial(&self) -> u64 {
        self.sn
    }

    /// Seeds the serial check, e.g. after restoring from a snapshot.
    pub fn set_last_serial(&mut self, sn: u64) {
        self.sn = sn;
        self.stats.last_serial = sn;
    }

    /// True between `TRANSACTION` and `COMMIT`.
    pub fn in_transaction(&self) -> bool {
        self.txid.is_some()
    }

    pub fn stats(&self) -> &ParserStats {
        &self.stats
    }

    /// Forgets the current transaction and block and releases held locks.
    pub fn reset(&mut self, target: &mut dyn OperationTarget) {
        self.block = None;
        self.txid = None;
        self.sn = 0;
        self.replay = false;
        self.aux_parts.clear();
        self.state = ParserState::ExpectTransaction;
        self.errstate = ParserState::ExpectAny;
        let released = target.release_all();
        if released > 0 {
            warn!(released, "parser.reset.released_vertex_locks");
        }
    }

    /// Consumes complete lines from `input`, applying blocks to `target`.
    pub fn feed(&mut self, input: &mut OperationBuffer, target: &mut dyn OperationTarget) -> FeedOutcome {
        let mut consumed = 0usize;
        self.ignore_warnings = 0;
        loop {
            if consumed >= MAX_FEED_BATCH {
                self.confirm(input);
                return FeedOutcome::Yielded;
            }
            let Some(line) = input.read_until(self.options.max_line, b'\n') else {
                self.confirm(input);
                return FeedOutcome::Drained;
            };
            consumed += line.len();
            if line.last() != Some(&b'\n') {
                self.syntax_error(self.state, "line exceeds maximum length", target);
                // Drop the rest of the oversized line.
                while let Some(rest) = input.read_until(self.options.max_line, b'\n') {
                    if rest.last() == Some(&b'\n') {
                        break;
                    }
                }
                self.confirm(input);
                continue;
            }
            match self.process_line(&line, target) {
                Step::Continue => {
                    if self.block.is_none() {
                        self.confirm(input);
                    }
                }
                Step::Backoff(delay) => {
                    input.rollback();
                    self.stats.transient_errors += 1;
                    debug!(delay_ms = delay.as_millis() as u64, "parser.backoff");
                    return FeedOutcome::Backoff(delay);
                }
            }
        }
    }

    fn confirm(&mut self, input: &mut OperationBuffer) {
        if self.block.is_some() {
            return;
        }
        let n = input.unconfirmed();
        if input.confirm(n).is_ok() {
            self.stats.bytes += n as u64;
        }
    }

    fn process_line(&mut self, line: &[u8], target: &mut dyn OperationTarget) -> Step {
        let crc_before = self.tx_crc;
        let Some(kw) = keyword(line) else {
            if let Some(block) = self.block.as_mut() {
                block.crc = crc32_extend(block.crc, line);
            }
            if self.txid.is_some() {
                self.tx_crc = crc32_extend(self.tx_crc, line);
            }
            return Step::Continue;
        };
        if self.txid.is_some() && kw != b"TRANSACTION" && kw != b"COMMIT" {
            self.tx_crc = crc32_extend(self.tx_crc, line);
        }
        self.dispatch(kw, line, crc_before, target)
    }

    fn dispatch(
        &mut self,
        kw: &[u8],
        line: &[u8],
        crc_before: u32,
        target: &mut dyn OperationTarget,
    ) -> Step {
        match self.state {
            ParserState::Recovery => {
                let resume = match kw {
                    b"TRANSACTION" => Some(ParserState::ExpectTransaction),
                    b"OP" | b"COMMIT" if self.errstate != ParserState::TransactionError => {
                        Some(ParserState::ExpectOp)
                    }
                    _ => None,
                };
                match resume {
                    Some(state) => {
                        debug!(from = ?self.errstate, to = ?state, "parser.recovered");
                        self.errstate = ParserState::ExpectAny;
                        self.state = state;
                        self.dispatch(kw, line, crc_before, target)
                    }
                    None => Step::Continue,
                }
            }
            ParserState::ExpectOperator => {
                if kw == b"ENDOP" {
                    self.end_block(line, target)
                } else if matches!(kw, b"OP" | b"TRANSACTION" | b"COMMIT") {
                    self.syntax_error(ParserState::ExpectEndop, "unterminated operation block", target);
                    self.dispatch(kw, line, crc_before, target)
                } else {
                    self.operator_line(line, target);
                    Step::Continue
                }
            }
            ParserState::ExpectOp => match kw {
                b"OP" => self.begin_block(line, crc_before, target),
                b"COMMIT" => self.commit(line, target),
                b"TRANSACTION" => self.begin_transaction(line, target),
                _ => {
                    self.syntax_error(ParserState::ExpectOp, "expected operation block 'OP ...'", target);
                    Step::Continue
                }
            },
            _ => match kw {
                b"TRANSACTION" => self.begin_transaction(line, target),
                b"OP" => {
                    debug!("parser.non_transactional_op");
                    self.begin_block(line, crc_before, target)
                }
                b"IDLE" => {
                    self.idle(line, target);
                    Step::Continue
                }
                b"RESYNC" => {
                    self.resync(line, target);
                    Step::Continue
                }
                b"ATTACH" => {
                    self.attach(line, target);
                    Step::Continue
                }
                _ => {
                    self.syntax_error(
                        ParserState::ExpectTransaction,
                        "expected 'TRANSACTION ...'",
                        target,
                    );
                    Step::Continue
                }
            },
        }
    }

    fn begin_transaction(&mut self, line: &[u8], target: &mut dyn OperationTarget) -> Step {
        if let Some(previous) = self.txid.take() {
            warn!(txid = %previous, "parser.transaction_truncated");
        }
        if target.held_locks() > 0 {
            let released = target.release_all();
            if released > 0 {
                error!(released, "parser.locks_at_transaction_start");
                return Step::Backoff(TRANSIENT_BACKOFF);
            }
        }
        let mut tokens = Tokens::new(line);
        tokens.next();
        let Some(txid) = tokens.next().and_then(field::parse_obid).filter(|id| !id.is_none()) else {
            self.syntax_error(ParserState::ExpectTransactionId, "expected transaction <transid>", target);
            return Step::Continue;
        };
        let Some(sn) = tokens.next().and_then(field::parse_u64) else {
            self.syntax_error(ParserState::ExpectTransactionSn, "expected transaction <sn>", target);
            return Step::Continue;
        };
        if tokens.next().and_then(field::parse_u64).is_none() {
            self.syntax_error(
                ParserState::ExpectTransactionMasterSn,
                "expected transaction <master_sn>",
                target,
            );
            return Step::Continue;
        }

        self.replay = false;
        if self.options.serial_check != SerialCheck::Off && self.sn != 0 && sn != self.sn + 1 {
            if sn > self.sn {
                info!(gap = sn - self.sn - 1, from = self.sn, to = sn, txid = %txid, "parser.serial_gap");
            } else {
                match self.options.serial_check {
                    SerialCheck::Silent => {
                        debug!(sn, last = self.sn, "parser.regression_skipped");
                        self.stats.regressions_skipped += 1;
                        self.replay = true;
                    }
                    _ => {
                        self.txid = Some(txid);
                        self.transaction_error(
                            format!("regression at sn={sn} ({} steps)", sn as i64 - self.sn as i64),
                            target,
                        );
                        return Step::Continue;
                    }
                }
            }
        }
        if !self.replay {
            self.sn = sn;
            self.stats.last_serial = sn;
        }
        self.txid = Some(txid);
        self.tx_crc = crc32_extend(0, line);
        self.state = ParserState::ExpectOp;
        Step::Continue
    }

    fn commit(&mut self, line: &[u8], target: &mut dyn OperationTarget) -> Step {
        if self.txid.is_none() {
            debug!("parser.commit_without_transaction");
        }
        let mut tokens = Tokens::new(line);
        tokens.next();
        let Some(txid) = tokens.next().and_then(field::parse_obid) else {
            self.syntax_error(ParserState::ExpectCommitId, "expected transid", target);
            return Step::Continue;
        };
        if let Some(current) = self.txid.filter(|current| *current != txid) {
            warn!(current = %current, commit = %txid, "parser.transaction_id_mismatch");
        }
        let Some(tms) = tokens.next().and_then(field::parse_u64) else {
            self.syntax_error(ParserState::ExpectCommitTms, "expected commit <tms>", target);
            return Step::Continue;
        };
        let Some(crc) = tokens.next().and_then(field::parse_u32) else {
            self.syntax_error(ParserState::ExpectCommitCrc, "expected commit <crc>", target);
            return Step::Continue;
        };
        if self.options.validate && self.txid.is_some() && crc != self.tx_crc {
            self.stats.crc_mismatches += 1;
            warn!(expected = crc, computed = self.tx_crc, txid = %txid, "parser.transaction_crc_mismatch");
        }
        self.txid = None;
        self.replay = false;
        self.stats.transactions += 1;
        self.stats.lag_ms = now_millis().saturating_sub(tms);
        let held = target.held_locks();
        if held > 0 {
            error!(held, "parser.locks_at_transaction_end");
        }
        self.state = ParserState::ExpectTransaction;
        Step::Continue
    }

    fn idle(&mut self, line: &[u8], target: &mut dyn OperationTarget) {
        let mut tokens = Tokens::new(line);
        tokens.next();
        if tokens.next().and_then(field::parse_u64).is_none() {
            self.syntax_error(ParserState::ExpectIdleTms, "expected idle <tms>", target);
        }
    }

    fn resync(&mut self, line: &[u8], target: &mut dyn OperationTarget) {
        let mut tokens = Tokens::new(line);
        tokens.next();
        let Some(id) = tokens.next().and_then(field::parse_obid).filter(|id| !id.is_none()) else {
            self.syntax_error(ParserState::ExpectResyncId, "expected resyncid", target);
            return;
        };
        let Some(discarded) = tokens.next().and_then(field::parse_u64) else {
            self.syntax_error(ParserState::ExpectResyncCount, "expected resync <ndiscarded>", target);
            return;
        };
        debug!(resync = %id, discarded, "parser.resync");
    }

    fn attach(&mut self, line: &[u8], target: &mut dyn OperationTarget) {
        let mut tokens = Tokens::new(line);
        tokens.next();
        if tokens.next().and_then(field::parse_u32).is_none() {
            self.syntax_error(ParserState::ExpectAttachProtocol, "expected <protocol>", target);
            return;
        }
        if tokens.next().and_then(field::parse_u32).is_none() {
            self.syntax_error(ParserState::ExpectAttachVersion, "expected <version>", target);
        }
    }

    fn begin_block(&mut self, line: &[u8], crc_before: u32, target: &mut dyn OperationTarget) -> Step {
        match OpHeader::parse(line) {
            Ok(header) => {
                self.mark_state = self.state;
                self.mark_crc = crc_before;
                self.block = Some(PendingBlock {
                    header,
                    crc: crc32_extend(0, line),
                    operators: Vec::new(),
                });
                self.state = ParserState::ExpectOperator;
            }
            Err(err) => {
                let state = match err {
                    OpLineError::GraphObid => ParserState::ExpectGraphObid,
                    OpLineError::VertexObid => ParserState::ExpectVertexObid,
                    _ => ParserState::ExpectOptype,
                };
                self.syntax_error(state, &err.to_string(), target);
            }
        }
        Step::Continue
    }

    fn operator_line(&mut self, line: &[u8], target: &mut dyn OperationTarget) {
        let Some(block) = self.block.as_mut() else {
            self.syntax_error(ParserState::ExpectOperator, "operator outside of block", target);
            return;
        };
        block.crc = crc32_extend(block.crc, line);
        let mut tokens = Tokens::new(line);
        tokens.next();
        let Some(code) = tokens.next().and_then(field::parse_u32).map(OpCode) else {
            self.syntax_error(ParserState::ExpectOpcode, "expected <opcode>", target);
            return;
        };
        if signature(code).is_none() {
            self.permanent_error(format!("unknown opcode {code}"), target);
            return;
        }
        match Operator::decode(line) {
            Ok(op) => {
                self.stats.opcodes += 1;
                if let Some(block) = self.block.as_mut() {
                    block.operators.push(op);
                }
            }
            Err(err) => self.syntax_error(ParserState::ExpectOparg, &err.to_string(), target),
        }
    }

    fn end_block(&mut self, line: &[u8], target: &mut dyn OperationTarget) -> Step {
        let Some(block) = self.block.take() else {
            self.syntax_error(ParserState::ExpectEndop, "ENDOP outside of block", target);
            return Step::Continue;
        };
        let trailer = match OpTrailer::parse(line, block.header.optype) {
            Ok(trailer) => trailer,
            Err(err) => {
                let state = match err {
                    OpLineError::Opid => ParserState::ExpectOpid,
                    OpLineError::Tms => ParserState::ExpectTms,
                    OpLineError::Crc => ParserState::ExpectCrc,
                    _ => ParserState::ExpectEndop,
                };
                self.syntax_error(state, &err.to_string(), target);
                return Step::Continue;
            }
        };
        let crc = crc32_extend(block.crc, &line[..trailer.covered]);
        if self.options.validate && crc != trailer.crc {
            self.stats.crc_mismatches += 1;
            error!(expected = trailer.crc, computed = crc, opid = trailer.opid.0, "parser.block_crc_mismatch");
            self.permanent_error(
                format!("CRC mismatch: expected {:08X}, got {crc:08X}", trailer.crc),
                target,
            );
            return Step::Continue;
        }

        if self.options.exec == ExecMode::Normal {
            if let Err(err) = self.execute(&block, trailer.opid, target) {
                target.abort(&block.header);
                match err {
                    ExecError::Readonly => return self.transient(READONLY_BACKOFF),
                    ExecError::Transient(reason) => {
                        debug!(%reason, "parser.transient");
                        return self.transient(TRANSIENT_BACKOFF);
                    }
                    ExecError::NoSuchObject(obid) => {
                        self.stats.ignored_operations += 1;
                        self.ignore_warnings += 1;
                        if self.ignore_warnings <= MAX_IGNORE_WARNINGS {
                            warn!(obid = %obid, txid = ?self.txid, "parser.operation_ignored");
                        }
                    }
                    ExecError::Permanent(msg) => {
                        self.permanent_error(format!("execution error: {msg}"), target);
                        return Step::Continue;
                    }
                    ExecError::Transaction(msg) => {
                        self.transaction_error(msg, target);
                        return Step::Continue;
                    }
                }
            }
        }
        self.stats.operations += 1;
        self.state = if self.txid.is_some() {
            ParserState::ExpectOp
        } else {
            ParserState::ExpectTransaction
        };
        Step::Continue
    }

    fn execute(&mut self, block: &PendingBlock, opid: OpId, target: &mut dyn OperationTarget) -> ExecResult {
        let header = &block.header;
        target.begin(header)?;
        for op in &block.operators {
            if !self.gate.is_allowed(op.code) {
                self.stats.filtered_opcodes += 1;
                continue;
            }
            if self.replay && !self.exempt.contains(&op.code) {
                continue;
            }
            if op.code == OpCode::SYSTEM_SEND_RAW_DATA {
                self.aux_data(op)?;
            } else {
                target.apply(header, op)?;
            }
        }
        target.end(header, opid)
    }

    fn aux_data(&mut self, op: &Operator) -> ExecResult {
        let parts = op.u64_at(0).unwrap_or(1);
        let part = op.u64_at(1).unwrap_or(0);
        let data = op.str_at(2).unwrap_or_default();
        let command = AuxCommand(op.u32_at(4).unwrap_or(0));
        let obid = op.obid_at(6).unwrap_or(ObjectId::NONE);
        if part == 0 {
            self.aux_parts.clear();
        }
        if part as usize != self.aux_parts.len() {
            self.aux_parts.clear();
            return Err(ExecError::Permanent(format!(
                "raw data part {part} out of sequence"
            )));
        }
        self.aux_parts.push(data.to_string());
        if part + 1 < parts {
            return Ok(());
        }
        let payload = self.aux_parts.concat();
        self.aux_parts.clear();
        match self.aux.as_mut() {
            Some(handler) => handler
                .handle(command, obid, &payload)
                .map_err(ExecError::Permanent),
            None => {
                debug!(command = command.0, bytes = payload.len(), "parser.aux_unhandled");
                Ok(())
            }
        }
    }

    fn transient(&mut self, delay: Duration) -> Step {
        self.state = self.mark_state;
        self.tx_crc = self.mark_crc;
        Step::Backoff(delay)
    }

    fn record_error(&mut self, msg: String) {
        self.stats.last_error = Some(msg);
    }

    fn syntax_error(&mut self, at: ParserState, msg: &str, _target: &mut dyn OperationTarget) {
        self.stats.syntax_errors += 1;
        warn!(state = format_args!("{:04X}", at.code()), message = msg, "parser.syntax_error");
        self.record_error(format!("syntax error at state {:04X}: {msg}", at.code()));
        self.block = None;
        self.state = ParserState::Recovery;
        self.errstate = ParserState::Recovery;
    }

    fn permanent_error(&mut self, msg: String, target: &mut dyn OperationTarget) {
        self.stats.permanent_errors += 1;
        error!(message = %msg, txid = ?self.txid, "parser.permanent_error");
        self.record_error(msg);
        self.reset(target);
        self.state = ParserState::Recovery;
        self.errstate = ParserState::Permanent;
    }

    fn transaction_error(&mut self, msg: String, target: &mut dyn OperationTarget) {
        self.stats.transaction_errors += 1;
        error!(message = %msg, txid = ?self.txid, "parser.transaction_error");
        self.record_error(msg);
        self.reset(target);
        self.state = ParserState::Recovery;
        self.errstate = ParserState::TransactionError;
    }
}

impl std::fmt::Debug for OperationParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationParser")
            .field("state", &self.state)
            .field("sn", &self.sn)
            .field("txid", &self.txid)
            .field("in_block", &self.block.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::op::OpBlock;

    #[derive(Default)]
    struct Recorder {
        applied: Vec<(ObjectId, OpCode)>,
        ended: Vec<OpId>,
        begin_failures: Vec<ExecError>,
        locks: usize,
    }

    impl OperationTarget for Recorder {
        fn begin(&mut self, _header: &OpHeader) -> ExecResult {
            match self.begin_failures.pop() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn apply(&mut self, header: &OpHeader, op: &Operator) -> ExecResult {
            self.applied.push((header.vertex, op.code));
            Ok(())
        }

        fn end(&mut self, _header: &OpHeader, opid: OpId) -> ExecResult {
            self.ended.push(opid);
            Ok(())
        }

        fn abort(&mut self, _header: &OpHeader) {}

        fn held_locks(&self) -> usize {
            self.locks
        }

        fn release_all(&mut self) -> usize {
            std::mem::take(&mut self.locks)
        }
    }

    fn block(name: &str, opid: u64) -> Vec<u8> {
        let mut b = OpBlock::for_vertex(ObjectId::from_name("g"), ObjectId::from_name(name));
        b.push(Operator::vertex_new(name, 0x11, 0, 0));
        b.push(Operator::set_rank(9));
        b.opid = OpId(opid);
        b.tms = 1;
        b.to_bytes()
    }

    fn transaction(sn: u64, blocks: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = blocks.concat();
        let txid = ObjectId::from_parts(0xAB, sn);
        let mut out = format!("TRANSACTION {txid} {sn:016X} {:016X}\n", 0).into_bytes();
        out.extend_from_slice(&body);
        let crc = crc32_extend(0, &out);
        out.extend_from_slice(format!("COMMIT {txid} {:016X} {crc:08X}\r\n", now_millis()).as_bytes());
        out
    }

    fn buffer(bytes: &[u8]) -> OperationBuffer {
        let mut buf = OperationBuffer::with_capacity_order(8, "test");
        buf.write(bytes).expect("write");
        buf
    }

    #[test]
    fn parses_and_applies_a_transaction() {
        let mut parser = OperationParser::new(ParserOptions::default());
        let mut target = Recorder::default();
        let mut input = buffer(&transaction(1, &[block("a", 1), block("b", 2)]));
        assert_eq!(parser.feed(&mut input, &mut target), FeedOutcome::Drained);
        assert_eq!(target.applied.len(), 4);
        assert_eq!(target.ended, vec![OpId(1), OpId(2)]);
        let stats = parser.stats();
        assert_eq!((stats.transactions, stats.operations, stats.opcodes), (1, 2, 4));
        assert_eq!(stats.crc_mismatches, 0);
        assert_eq!(input.unconfirmed(), 0);
        assert_eq!(parser.state(), ParserState::ExpectTransaction);
    }

    #[test]
    fn partial_input_resumes_mid_block() {
        let mut parser = OperationParser::new(ParserOptions::default());
        let mut target = Recorder::default();
        let data = transaction(1, &[block("a", 1)]);
        let split = data.len() / 2;
        let mut input = buffer(&data[..split]);
        assert_eq!(parser.feed(&mut input, &mut target), FeedOutcome::Drained);
        assert!(target.applied.is_empty());
        input.write(&data[split..]).expect("write");
        assert_eq!(parser.feed(&mut input, &mut target), FeedOutcome::Drained);
        assert_eq!(target.applied.len(), 2);
        assert_eq!(parser.stats().transactions, 1);
    }

    #[test]
    fn flipped_bit_skips_only_the_damaged_block() {
        let mut parser = OperationParser::new(ParserOptions::default());
        let mut target = Recorder::default();
        let mut bad = block("bad", 1);
        let at = bad.len() - 20;
        bad[at] = if bad[at] == b'0' { b'1' } else { b'0' };
        let mut data = transaction(1, &[bad]);
        data.extend_from_slice(&transaction(2, &[block("good", 2)]));
        let mut input = buffer(&data);
        parser.feed(&mut input, &mut target);
        assert_eq!(parser.stats().permanent_errors, 1);
        assert_eq!(target.ended, vec![OpId(2)]);
        assert_eq!(target.applied[0].0, ObjectId::from_name("good"));
    }

    #[test]
    fn syntax_error_recovers_at_next_op() {
        let mut parser = OperationParser::new(ParserOptions::default());
        let mut target = Recorder::default();
        let mut body = b"garbage line\n".to_vec();
        body.extend_from_slice(&block("x", 1));
        let header = format!("TRANSACTION {} {:016X} {:016X}\n", ObjectId::from_parts(0, 0xAB), 1, 0);
        let data = [header.into_bytes(), body].concat();
        let mut input = buffer(&data);
        parser.feed(&mut input, &mut target);
        assert_eq!(parser.stats().syntax_errors, 1);
        assert_eq!(target.ended, vec![OpId(1)]);
    }

    #[test]
    fn bad_vertex_id_in_op_line_is_reported_at_its_state() {
        let mut parser = OperationParser::new(ParserOptions::default());
        let mut target = Recorder::default();
        let mut body = format!("OP 2001 {} not-an-id\n", ObjectId::from_name("g")).into_bytes();
        body.extend_from_slice(&block("y", 1));
        let header = format!("TRANSACTION {} {:016X} {:016X}\n", ObjectId::from_parts(0, 0xAC), 1, 0);
        let mut input = buffer(&[header.into_bytes(), body].concat());
        parser.feed(&mut input, &mut target);
        let stats = parser.stats();
        assert_eq!(stats.syntax_errors, 1);
        let last = stats.last_error.as_deref().unwrap_or_default();
        assert!(last.contains("state 0004") && last.contains("bad vertex obid"), "{last}");
        assert_eq!(target.ended, vec![OpId(1)]);
    }

    #[test]
    fn transient_failure_rolls_back_the_block() {
        let mut parser = OperationParser::new(ParserOptions::default());
        let mut target = Recorder {
            begin_failures: vec![ExecError::Transient("vertex busy".into())],
            ..Recorder::default()
        };
        let mut input = buffer(&transaction(1, &[block("t", 1)]));
        let first = parser.feed(&mut input, &mut target);
        assert_eq!(first, FeedOutcome::Backoff(TRANSIENT_BACKOFF));
        assert!(target.ended.is_empty());
        assert!(input.readable() > 0);
        assert_eq!(parser.feed(&mut input, &mut target), FeedOutcome::Drained);
        assert_eq!(target.ended, vec![OpId(1)]);
        assert_eq!(parser.stats().crc_mismatches, 0);
        assert_eq!(parser.stats().transactions, 1);
    }

    #[test]
    fn strict_regression_is_a_transaction_error() {
        let mut parser = OperationParser::new(ParserOptions::default());
        let mut target = Recorder::default();
        let mut data = transaction(5, &[block("a", 1)]);
        data.extend_from_slice(&transaction(3, &[block("b", 2)]));
        data.extend_from_slice(&transaction(7, &[block("c", 3)]));
        let mut input = buffer(&data);
        parser.feed(&mut input, &mut target);
        assert_eq!(parser.stats().transaction_errors, 1);
        assert_eq!(target.ended, vec![OpId(1), OpId(3)]);
    }

    #[test]
    fn silent_regression_replays_only_exempt_opcodes() {
        let options = ParserOptions {
            serial_check: SerialCheck::Silent,
            ..ParserOptions::default()
        };
        let mut parser = OperationParser::new(options);
        let mut target = Recorder::default();
        let mut data = transaction(5, &[block("a", 1)]);
        data.extend_from_slice(&transaction(4, &[block("b", 2)]));
        let mut input = buffer(&data);
        parser.feed(&mut input, &mut target);
        assert_eq!(parser.stats().transaction_errors, 0);
        assert_eq!(parser.stats().regressions_skipped, 1);
        assert_eq!(target.applied.len(), 2);
        assert_eq!(parser.last_serial(), 5);
    }

    #[test]
    fn denied_opcodes_are_filtered() {
        let mut parser = OperationParser::new(ParserOptions::default());
        parser.deny(OpcodeFilter::exact(OpCode::VERTEX_SET_RANK));
        let mut target = Recorder::default();
        let mut input = buffer(&transaction(1, &[block("a", 1)]));
        parser.feed(&mut input, &mut target);
        assert_eq!(target.applied, vec![(ObjectId::from_name("a"), OpCode::VERTEX_NEW)]);
        assert_eq!(parser.stats().filtered_opcodes, 1);
    }

    #[test]
    fn simulate_mode_validates_without_executing() {
        let options = ParserOptions {
            exec: ExecMode::Simulate,
            ..ParserOptions::default()
        };
        let mut parser = OperationParser::new(options);
        let mut target = Recorder::default();
        let mut input = buffer(&transaction(1, &[block("a", 1)]));
        parser.feed(&mut input, &mut target);
        assert!(target.applied.is_empty());
        assert_eq!(parser.stats().operations, 1);
    }

    #[test]
    fn aux_parts_are_assembled() {
        struct Capture(std::sync::Arc<parking_lot::Mutex<Vec<String>>>);
        impl AuxCommandHandler for Capture {
            fn handle(&mut self, _c: AuxCommand, _o: ObjectId, payload: &str) -> std::result::Result<(), String> {
                self.0.lock().push(payload.to_string());
                Ok(())
            }
        }
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut parser = OperationParser::new(ParserOptions::default())
            .with_aux_handler(Box::new(Capture(std::sync::Arc::clone(&seen))));
        let mut b = OpBlock::for_graph(ObjectId::from_name("g"), Operator::raw_data(2, 0, "hello ", 0x110, ObjectId::NONE));
        b.push(Operator::raw_data(2, 1, "world", 0x110, ObjectId::NONE));
        let mut target = Recorder::default();
        let mut input = buffer(&transaction(1, &[b.to_bytes()]));
        parser.feed(&mut input, &mut target);
        assert_eq!(seen.lock().as_slice(), ["hello world".to_string()]);
    }

    #[test]
    fn state_codes_match_protocol() {
        assert_eq!(ParserState::ExpectTransaction.code(), 0x0B01);
        assert_eq!(ParserState::ExpectCrc.code(), 0x0034);
        assert_eq!(ParserState::TransactionError.code(), 0xEE80);
    }
}
