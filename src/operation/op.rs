#![forbid(unsafe_code)]
//! Operation lifecycle and the `OP` … `ENDOP` block codec.
//!
//! ```text
//! OP 2001 <graph obid> <vertex obid>
//!     vxn 1010111C ...
//!     vps 1010161C ...
//! ENDOP <opid> <tms> <crc>
//! ```
//!
//! The block CRC covers every byte from the start of the `OP` line through
//! the last operator line, plus the `ENDOP` line up to (not including) the
//! space before the CRC token.

use std::fmt;

use crate::operation::opcode::OpType;
use crate::operation::operator::Operator;
use crate::primitives::bytes::field;
use crate::primitives::bytes::line::{is_blank_or_comment, Tokens};
use crate::types::{crc32_extend, ObjectId, OpId, Result, SombraError};

/// State of the operation attached to a vertex or graph.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Operation {
    /// Nothing captured yet.
    #[default]
    Unopened,
    /// Open and bound to its owner; operators may be captured.
    Pending(ObjectId),
    /// Closed after its capture was handed to the emitter.
    Committed(OpId),
}

impl Operation {
    /// Opens the operation for `owner`. Reopening for the same owner is a no-op.
    pub fn open(&mut self, owner: ObjectId) {
        match *self {
            Operation::Pending(current) => {
                assert!(
                    current == owner,
                    "operation already open for {current}, cannot open for {owner}"
                );
            }
            Operation::Unopened | Operation::Committed(_) => *self = Operation::Pending(owner),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Operation::Pending(_))
    }

    /// Object the open operation belongs to.
    pub fn owner(&self) -> Option<ObjectId> {
        match self {
            Operation::Pending(owner) => Some(*owner),
            _ => None,
        }
    }

    /// Id of the last committed capture.
    pub fn last_opid(&self) -> Option<OpId> {
        match self {
            Operation::Committed(opid) => Some(*opid),
            _ => None,
        }
    }

    /// Records that the open capture was committed as `opid`.
    pub fn commit(&mut self, opid: OpId) {
        assert!(self.is_open(), "commit of an operation that is not open");
        *self = Operation::Committed(opid);
    }

    /// Discards the open operation without committing it.
    pub fn close(&mut self) {
        *self = Operation::Unopened;
    }
}

/// An operation block: the operators captured for one object.
#[derive(Clone, PartialEq, Eq)]
pub struct OpBlock {
    /// Decides which identifiers the `OP` line carries.
    pub optype: OpType,
    /// Owning graph.
    pub graph: ObjectId,
    /// Owning vertex, [`ObjectId::NONE`] for graph blocks.
    pub vertex: ObjectId,
    pub operators: Vec<Operator>,
    /// Assigned by the emitter when the block is committed.
    pub opid: OpId,
    /// Commit timestamp in milliseconds.
    pub tms: u64,
}

/// Parsed `OP` line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpHeader {
    pub optype: OpType,
    pub graph: ObjectId,
    pub vertex: ObjectId,
}

/// Parsed `ENDOP` line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpTrailer {
    pub opid: OpId,
    pub tms: u64,
    /// CRC read from the line.
    pub crc: u32,
    /// Length of the line prefix covered by the block CRC.
    pub covered: usize,
}

fn syntax(msg: impl Into<String>) -> SombraError {
    SombraError::InvalidOwned(msg.into())
}

/// Field of an `OP` or `ENDOP` line that failed to parse.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum OpLineError {
    /// Missing or misplaced `OP` or `ENDOP` keyword.
    #[error("expected {0}")]
    Keyword(&'static str),
    #[error("bad optype")]
    Optype,
    /// Well-formed code outside the optype table.
    #[error("unknown optype {0:04X}")]
    UnknownOptype(u16),
    #[error("bad graph obid")]
    GraphObid,
    #[error("bad vertex obid")]
    VertexObid,
    #[error("bad opid")]
    Opid,
    #[error("bad tms")]
    Tms,
    #[error("bad crc")]
    Crc,
    /// Extra tokens after the last field.
    #[error("trailing tokens after {0}")]
    Trailing(&'static str),
}

impl From<OpLineError> for SombraError {
    fn from(err: OpLineError) -> Self {
        SombraError::InvalidOwned(err.to_string())
    }
}

impl OpHeader {
    /// Parses an `OP` line (keyword included).
    pub fn parse(line: &[u8]) -> std::result::Result<OpHeader, OpLineError> {
        let mut tokens = Tokens::new(line);
        if tokens.next() != Some(&b"OP"[..]) {
            return Err(OpLineError::Keyword("OP"));
        }
        let raw = tokens
            .next()
            .and_then(field::parse_u16)
            .ok_or(OpLineError::Optype)?;
        let optype = OpType::from_u16(raw).ok_or(OpLineError::UnknownOptype(raw))?;
        let mut header = OpHeader {
            optype,
            graph: ObjectId::NONE,
            vertex: ObjectId::NONE,
        };
        if optype.has_graph() {
            header.graph = tokens
                .next()
                .and_then(field::parse_obid)
                .ok_or(OpLineError::GraphObid)?;
        }
        if optype.has_vertex() {
            header.vertex = tokens
                .next()
                .and_then(field::parse_obid)
                .ok_or(OpLineError::VertexObid)?;
        }
        if tokens.next().is_some() {
            return Err(OpLineError::Trailing("OP"));
        }
        Ok(header)
    }
}

impl OpTrailer {
    /// Parses an `ENDOP` line for a block of type `optype`.
    pub fn parse(line: &[u8], optype: OpType) -> std::result::Result<OpTrailer, OpLineError> {
        let mut tokens = Tokens::new(line);
        if tokens.next() != Some(&b"ENDOP"[..]) {
            return Err(OpLineError::Keyword("ENDOP"));
        }
        let mut trailer = OpTrailer {
            opid: OpId::NONE,
            tms: 0,
            crc: 0,
            covered: 0,
        };
        if optype.has_opid() {
            trailer.opid = tokens
                .next()
                .and_then(field::parse_u64)
                .map(OpId)
                .ok_or(OpLineError::Opid)?;
            trailer.tms = tokens
                .next()
                .and_then(field::parse_u64)
                .ok_or(OpLineError::Tms)?;
        }
        trailer.covered = tokens.position();
        trailer.crc = tokens
            .next()
            .and_then(field::parse_u32)
            .ok_or(OpLineError::Crc)?;
        if tokens.next().is_some() {
            return Err(OpLineError::Trailing("ENDOP"));
        }
        Ok(trailer)
    }
}

impl OpBlock {
    /// Empty block with no opid yet.
    pub fn new(optype: OpType, graph: ObjectId, vertex: ObjectId) -> OpBlock {
        OpBlock {
            optype,
            graph,
            vertex,
            operators: Vec::new(),
            opid: OpId::NONE,
            tms: 0,
        }
    }

    /// Block owned by a vertex of `graph`.
    pub fn for_vertex(graph: ObjectId, vertex: ObjectId) -> OpBlock {
        OpBlock::new(OpType::VertexObject, graph, vertex)
    }

    /// Graph-owned block typed after its first operator.
    pub fn for_graph(graph: ObjectId, first: Operator) -> OpBlock {
        let mut block = OpBlock::new(OpType::for_capture(first.code, false), graph, ObjectId::NONE);
        block.operators.push(first);
        block
    }

    pub fn push(&mut self, op: Operator) {
        self.operators.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Appends the encoded block to `out` and returns its CRC.
    pub fn encode(&self, out: &mut Vec<u8>) -> u32 {
        let start = out.len();
        out.extend_from_slice(b"OP ");
        field::put_u16(out, self.optype.code());
        if self.optype.has_graph() {
            out.push(b' ');
            field::put_obid(out, self.graph);
        }
        if self.optype.has_vertex() {
            out.push(b' ');
            field::put_obid(out, self.vertex);
        }
        out.push(b'\n');
        for op in &self.operators {
            op.encode(out);
        }
        out.extend_from_slice(b"ENDOP");
        if self.optype.has_opid() {
            out.push(b' ');
            field::put_u64(out, self.opid.0);
            out.push(b' ');
            field::put_u64(out, self.tms);
        }
        let crc = crc32_extend(0, &out[start..]);
        out.push(b' ');
        field::put_u32(out, crc);
        out.push(b'\n');
        crc
    }

    /// Encoded block, CRC included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.operators.len() * 64);
        self.encode(&mut out);
        out
    }

    /// Decodes one complete block and verifies its CRC.
    pub fn decode(text: &[u8]) -> Result<OpBlock> {
        let mut lines = text.split_inclusive(|b| *b == b'\n');
        let mut crc = 0u32;
        let header = loop {
            let line = lines.next().ok_or_else(|| syntax("missing OP line"))?;
            if !is_blank_or_comment(line) {
                crc = crc32_extend(crc, line);
                break OpHeader::parse(line)?;
            }
        };
        let mut block = OpBlock::new(header.optype, header.graph, header.vertex);
        for line in lines {
            if is_blank_or_comment(line) {
                crc = crc32_extend(crc, line);
                continue;
            }
            if line.starts_with(b"ENDOP") {
                let trailer = OpTrailer::parse(line, header.optype)?;
                crc = crc32_extend(crc, &line[..trailer.covered]);
                if crc != trailer.crc {
                    return Err(SombraError::Corruption("op block crc mismatch"));
                }
                block.opid = trailer.opid;
                block.tms = trailer.tms;
                return Ok(block);
            }
            crc = crc32_extend(crc, line);
            block.operators.push(Operator::decode(line)?);
        }
        Err(syntax("missing ENDOP line"))
    }
}

impl fmt::Debug for OpBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpBlock")
            .field("optype", &self.optype)
            .field("graph", &format_args!("{}", self.graph))
            .field("vertex", &format_args!("{}", self.vertex))
            .field("opid", &self.opid.0)
            .field("operators", &self.operators)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::opcode::OpCode;

    fn sample() -> OpBlock {
        let graph = ObjectId::from_name("g");
        let mut block = OpBlock::for_vertex(graph, ObjectId::from_name("alice"));
        block.push(Operator::vertex_new("alice", 0x11, 100, 0));
        block.push(Operator::set_property(0x42, "blue"));
        block.push(Operator::arc_connect(7, ObjectId::from_name("bob")));
        block.opid = OpId(12);
        block.tms = 1_700_000_000_000;
        block
    }

    #[test]
    fn operation_lifecycle() {
        let owner = ObjectId::from_name("v");
        let mut op = Operation::default();
        assert!(!op.is_open());
        op.open(owner);
        op.open(owner);
        assert_eq!(op.owner(), Some(owner));
        op.commit(OpId(3));
        assert_eq!(op.last_opid(), Some(OpId(3)));
        op.open(owner);
        op.close();
        assert_eq!(op, Operation::Unopened);
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn open_for_another_owner_is_fatal() {
        let mut op = Operation::default();
        op.open(ObjectId::from_name("a"));
        op.open(ObjectId::from_name("b"));
    }

    #[test]
    fn block_roundtrip_preserves_operators() -> Result<()> {
        let block = sample();
        let bytes = block.to_bytes();
        let text = String::from_utf8_lossy(&bytes).to_string();
        assert!(text.starts_with("OP 2001 "));
        assert!(text.contains("\nENDOP 000000000000000C "));
        assert_eq!(OpBlock::decode(&bytes)?, block);
        Ok(())
    }

    #[test]
    fn system_block_omits_ids() -> Result<()> {
        let block = OpBlock::for_graph(ObjectId::from_name("g"), Operator::comment("hello"));
        assert_eq!(block.optype, OpType::System);
        let bytes = block.to_bytes();
        assert!(bytes.starts_with(b"OP 0001\n    com "));
        let decoded = OpBlock::decode(&bytes)?;
        assert_eq!(decoded.graph, ObjectId::NONE);
        assert_eq!(decoded.operators[0].code, OpCode::SYSTEM_SEND_COMMENT);
        Ok(())
    }

    #[test]
    fn any_flipped_bit_is_detected() {
        let bytes = sample().to_bytes();
        for i in [3usize, 40, bytes.len() / 2, bytes.len() - 12] {
            let mut damaged = bytes.clone();
            damaged[i] ^= 0x01;
            assert!(OpBlock::decode(&damaged).is_err(), "flip at {i} undetected");
        }
    }

    #[test]
    fn trailer_reports_covered_prefix() -> Result<()> {
        let t = OpTrailer::parse(b"ENDOP 0000000000000001 0000000000000002 DEADBEEF\n", OpType::VertexObject)?;
        assert_eq!(t.covered, "ENDOP 0000000000000001 0000000000000002".len());
        assert_eq!(t.crc, 0xDEADBEEF);
        let t = OpTrailer::parse(b"ENDOP 0000ABCD\n", OpType::System)?;
        assert_eq!(t.covered, 5);
        Ok(())
    }

    #[test]
    fn header_errors_name_the_bad_field() {
        let graph = ObjectId::from_name("g");
        assert_eq!(OpHeader::parse(b"OP 2001 zz\n"), Err(OpLineError::GraphObid));
        assert_eq!(
            OpHeader::parse(format!("OP 2001 {graph} zz\n").as_bytes()),
            Err(OpLineError::VertexObid)
        );
        assert_eq!(OpHeader::parse(b"OP 7777\n"), Err(OpLineError::UnknownOptype(0x7777)));
        assert_eq!(
            OpTrailer::parse(b"ENDOP 0000000000000001 xx DEADBEEF\n", OpType::VertexObject),
            Err(OpLineError::Tms)
        );
    }
}
