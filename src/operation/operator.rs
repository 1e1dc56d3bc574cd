#![forbid(unsafe_code)]
//! Operators: one opcode plus its typed payload, one line on the wire.
//!
//! ```text
//!     vxn 1010111C 4c2b...e1 11 00000000 00000000 00000000 0000000000000000 616c696365 # alice
//! ```
//!
//! Each opcode has a fixed payload signature. Integers are fixed-width
//! upper-case hex, object ids 32 lower-case hex digits, strings the hex of
//! their UTF-8 bytes. An id list takes its length from the `u32` field just
//! before it.

use std::fmt;

use smallvec::SmallVec;

use crate::operation::opcode::OpCode;
use crate::primitives::bytes::field;
use crate::primitives::bytes::line::Tokens;
use crate::types::{ObjectId, Result, SombraError};

/// Payload field kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    /// 32 lower-case hex digits.
    Obid,
    /// Hex of the UTF-8 bytes.
    Str,
    /// Space separated object ids, counted by the preceding `u32`.
    IdList,
}

use FieldKind::*;

const ENUM_ADD: &[FieldKind] = &[U64, U64, Str];
const ENUM_DEL: &[FieldKind] = &[U64, U64];
const COUNTS: &[FieldKind] = &[U64, U64, U64, U64, U64, U64, U32, U16, U8, U8];

/// Payload signature of `code`, `None` for opcodes outside the table.
pub fn signature(code: OpCode) -> Option<&'static [FieldKind]> {
    Some(match code {
        OpCode::NONE => &[],
        // obid, type, tmc, vertex tmx, arc tmx, rank, identifier
        OpCode::VERTEX_NEW => &[Obid, U8, U32, U32, U32, U64, Str],
        // obid, event exec flag
        OpCode::VERTEX_DELETE => &[Obid, U8],
        OpCode::VERTEX_SET_RANK => &[U64],
        OpCode::VERTEX_SET_TYPE => &[U8],
        OpCode::VERTEX_SET_TMX => &[U32],
        OpCode::VERTEX_CONVERT => &[U8],
        // key, value type, data high, data low, string value
        OpCode::VERTEX_SET_PROPERTY => &[U64, U8, U64, U64, Str],
        OpCode::VERTEX_DELETE_PROPERTY => &[U64],
        OpCode::VERTEX_CLEAR_PROPERTIES => &[],
        OpCode::VERTEX_SET_VECTOR => &[Str],
        OpCode::VERTEX_DELETE_VECTOR => &[],
        OpCode::VERTEX_DELETE_OUTARCS | OpCode::VERTEX_DELETE_INARCS => &[U64],
        OpCode::VERTEX_ACQUIRE | OpCode::VERTEX_RELEASE => &[],
        // predicate, head
        OpCode::ARC_CONNECT => &[U64, Obid],
        // event exec, removed count, predicate, head
        OpCode::ARC_DISCONNECT => &[U8, U64, U64, Obid],
        // tms, via uri, origin host, origin version, status
        OpCode::SYSTEM_ATTACH => &[U64, Str, Str, Str, U32],
        OpCode::SYSTEM_DETACH => &[U64, Str, Str, U32],
        OpCode::SYSTEM_CLEAR_REGISTRY => &[],
        OpCode::SYSTEM_SIMILARITY => &[U32, U32, U32, U32, U32, U32, U32, U32, U32, U32],
        OpCode::SYSTEM_SEND_COMMENT => &[Str],
        // parts, part id, data part, part size, aux command, reserved, obid
        OpCode::SYSTEM_SEND_RAW_DATA => &[U64, U64, Str, U64, U32, U32, Obid],
        // source graph, clone name
        OpCode::SYSTEM_CLONE_GRAPH => &[Obid, Str],
        // block order, t0, start opcount, obid, path, name
        OpCode::SYSTEM_CREATE_GRAPH => &[U32, U32, U64, Obid, Str, Str],
        OpCode::SYSTEM_DELETE_GRAPH => &[Obid],
        OpCode::GRAPH_TRUNCATE => &[U8, U64],
        OpCode::GRAPH_PERSIST | OpCode::GRAPH_STATE => COUNTS,
        OpCode::GRAPH_READONLY
        | OpCode::GRAPH_READWRITE
        | OpCode::GRAPH_EVENTS
        | OpCode::GRAPH_NOEVENTS => &[],
        OpCode::GRAPH_TICK => &[U64],
        OpCode::GRAPH_EVENT_EXEC => &[U32, U32],
        OpCode::VERTICES_ACQUIRE_WL | OpCode::VERTICES_RELEASE => &[U32, IdList],
        OpCode::VERTICES_RELEASE_ALL => &[U32],
        OpCode::ENUM_ADD_VXTYPE
        | OpCode::ENUM_ADD_REL
        | OpCode::ENUM_ADD_DIM
        | OpCode::ENUM_ADD_KEY => ENUM_ADD,
        OpCode::ENUM_DELETE_VXTYPE
        | OpCode::ENUM_DELETE_REL
        | OpCode::ENUM_DELETE_DIM
        | OpCode::ENUM_DELETE_KEY => ENUM_DEL,
        OpCode::ENUM_ADD_STRING => &[Str, Obid],
        OpCode::ENUM_DELETE_STRING => &[Obid],
        _ => return None,
    })
}

/// One payload value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Arg {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Obid(ObjectId),
    Str(String),
    Ids(Vec<ObjectId>),
}

impl Arg {
    /// Field kind this value fills.
    pub fn kind(&self) -> FieldKind {
        match self {
            Arg::U8(_) => U8,
            Arg::U16(_) => U16,
            Arg::U32(_) => U32,
            Arg::U64(_) => U64,
            Arg::Obid(_) => Obid,
            Arg::Str(_) => Str,
            Arg::Ids(_) => IdList,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Arg::U8(v) => field::put_u8(out, *v),
            Arg::U16(v) => field::put_u16(out, *v),
            Arg::U32(v) => field::put_u32(out, *v),
            Arg::U64(v) => field::put_u64(out, *v),
            Arg::Obid(id) => field::put_obid(out, *id),
            Arg::Str(s) => field::put_string(out, s),
            Arg::Ids(ids) => {
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    field::put_obid(out, *id);
                }
            }
        }
    }
}

type Args = SmallVec<[Arg; 6]>;

/// An opcode with its payload and an optional display comment.
#[derive(Clone, PartialEq, Eq)]
pub struct Operator {
    /// What the operator does.
    pub code: OpCode,
    /// Payload, in signature order.
    pub args: Args,
    /// Free text after `#`; never part of the payload.
    pub comment: Option<String>,
}

fn syntax(msg: String) -> SombraError {
    SombraError::InvalidOwned(msg)
}

impl Operator {
    /// Builds an operator without validating the payload.
    pub fn new(code: OpCode, args: impl IntoIterator<Item = Arg>) -> Operator {
        Operator {
            code,
            args: args.into_iter().collect(),
            comment: None,
        }
    }

    /// Line breaks become spaces and the text is capped at 1024 chars.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Operator {
        let text: String = comment.into();
        let clean: String = text
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .take(1024)
            .collect();
        self.comment = Some(clean);
        self
    }

    pub fn mnemonic(&self) -> &'static str {
        self.code.mnemonic()
    }

    /// Checks the payload against the opcode's signature.
    pub fn validate(&self) -> Result<()> {
        let sig = signature(self.code)
            .ok_or_else(|| syntax(format!("unknown opcode {}", self.code)))?;
        if sig.len() != self.args.len() {
            return Err(syntax(format!(
                "{} expects {} fields, got {}",
                self.mnemonic(),
                sig.len(),
                self.args.len()
            )));
        }
        for (i, (kind, arg)) in sig.iter().zip(self.args.iter()).enumerate() {
            if arg.kind() != *kind {
                return Err(syntax(format!(
                    "{} field {i}: expected {kind:?}, got {:?}",
                    self.mnemonic(),
                    arg.kind()
                )));
            }
            if let Arg::Ids(ids) = arg {
                let declared = match i.checked_sub(1).map(|p| &self.args[p]) {
                    Some(Arg::U32(n)) => *n as usize,
                    _ => return Err(syntax("id list without count".into())),
                };
                if declared != ids.len() {
                    return Err(syntax(format!(
                        "{} declares {declared} ids, carries {}",
                        self.mnemonic(),
                        ids.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Appends the operator line, including indentation and newline.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"    ");
        out.extend_from_slice(self.mnemonic().as_bytes());
        out.push(b' ');
        field::put_u32(out, self.code.0);
        for arg in &self.args {
            if matches!(arg, Arg::Ids(ids) if ids.is_empty()) {
                continue;
            }
            out.push(b' ');
            arg.encode(out);
        }
        if let Some(comment) = &self.comment {
            out.extend_from_slice(b" # ");
            out.extend_from_slice(comment.as_bytes());
        }
        out.push(b'\n');
    }

    /// Parses one operator line.
    pub fn decode(line: &[u8]) -> Result<Operator> {
        let mut tokens = Tokens::new(line);
        let mnemonic = tokens
            .next()
            .ok_or_else(|| syntax("empty operator line".into()))?;
        let code_token = tokens
            .next()
            .ok_or_else(|| syntax("operator without opcode".into()))?;
        let code = field::parse_u32(code_token)
            .map(OpCode)
            .ok_or_else(|| syntax(format!("bad opcode {}", String::from_utf8_lossy(code_token))))?;
        let sig = signature(code).ok_or_else(|| syntax(format!("unknown opcode {code}")))?;
        if code.mnemonic().as_bytes() != mnemonic {
            return Err(syntax(format!(
                "mnemonic {} does not match opcode {code}",
                String::from_utf8_lossy(mnemonic)
            )));
        }
        let mut args = Args::new();
        let mut last_count = 0usize;
        for kind in sig {
            if *kind == IdList {
                let mut ids = Vec::with_capacity(last_count);
                for _ in 0..last_count {
                    let token = tokens
                        .next()
                        .ok_or_else(|| syntax(format!("{} id list truncated", code.mnemonic())))?;
                    ids.push(
                        field::parse_obid(token)
                            .ok_or_else(|| syntax("bad object id in list".into()))?,
                    );
                }
                args.push(Arg::Ids(ids));
                continue;
            }
            let token = tokens
                .next()
                .ok_or_else(|| syntax(format!("{} missing {kind:?} field", code.mnemonic())))?;
            let bad = || {
                syntax(format!(
                    "{} bad {kind:?} field {}",
                    code.mnemonic(),
                    String::from_utf8_lossy(token)
                ))
            };
            let arg = match kind {
                U8 => Arg::U8(field::parse_u8(token).ok_or_else(bad)?),
                U16 => Arg::U16(field::parse_u16(token).ok_or_else(bad)?),
                U32 => {
                    let v = field::parse_u32(token).ok_or_else(bad)?;
                    last_count = v as usize;
                    Arg::U32(v)
                }
                U64 => Arg::U64(field::parse_u64(token).ok_or_else(bad)?),
                Obid => Arg::Obid(field::parse_obid(token).ok_or_else(bad)?),
                Str => Arg::Str(field::parse_string(token).ok_or_else(bad)?),
                IdList => unreachable!("handled above"),
            };
            args.push(arg);
        }
        if let Some(extra) = tokens.next() {
            return Err(syntax(format!(
                "{} unexpected trailing field {}",
                code.mnemonic(),
                String::from_utf8_lossy(extra)
            )));
        }
        let comment = line
            .iter()
            .position(|b| *b == b'#')
            .map(|at| String::from_utf8_lossy(&line[at + 1..]).trim().to_string())
            .filter(|c| !c.is_empty());
        Ok(Operator {
            code,
            args,
            comment,
        })
    }

    /// Raw payload field `i`.
    pub fn arg(&self, i: usize) -> Option<&Arg> {
        self.args.get(i)
    }

    pub fn u8_at(&self, i: usize) -> Option<u8> {
        match self.args.get(i) {
            Some(Arg::U8(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn u32_at(&self, i: usize) -> Option<u32> {
        match self.args.get(i) {
            Some(Arg::U32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Typed accessors return `None` on a kind mismatch.
    pub fn u64_at(&self, i: usize) -> Option<u64> {
        match self.args.get(i) {
            Some(Arg::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn obid_at(&self, i: usize) -> Option<ObjectId> {
        match self.args.get(i) {
            Some(Arg::Obid(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn str_at(&self, i: usize) -> Option<&str> {
        match self.args.get(i) {
            Some(Arg::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Id list at `i`.
    pub fn ids_at(&self, i: usize) -> Option<&[ObjectId]> {
        match self.args.get(i) {
            Some(Arg::Ids(v)) => Some(v.as_slice()),
            _ => None,
        }
    }
}

/// Constructors for the operators the graph layer captures.
impl Operator {
    /// No-op placeholder.
    pub fn nop() -> Operator {
        Operator::new(OpCode::NONE, [])
    }

    /// Creates the vertex named `id`; its object id is derived from the name.
    pub fn vertex_new(id: &str, vertex_type: u8, tmc: u32, rank: u64) -> Operator {
        Operator::new(
            OpCode::VERTEX_NEW,
            [
                Arg::Obid(ObjectId::from_name(id)),
                Arg::U8(vertex_type),
                Arg::U32(tmc),
                Arg::U32(0),
                Arg::U32(0),
                Arg::U64(rank),
                Arg::Str(id.to_string()),
            ],
        )
        .with_comment(id.chars().take(40).collect::<String>())
    }

    /// Deletes without firing events.
    pub fn vertex_delete(obid: ObjectId) -> Operator {
        Operator::new(OpCode::VERTEX_DELETE, [Arg::Obid(obid), Arg::U8(0)])
    }

    pub fn set_rank(rank: u64) -> Operator {
        Operator::new(OpCode::VERTEX_SET_RANK, [Arg::U64(rank)])
    }

    pub fn set_type(vertex_type: u8) -> Operator {
        Operator::new(OpCode::VERTEX_SET_TYPE, [Arg::U8(vertex_type)])
    }

    pub fn set_tmx(tmx: u32) -> Operator {
        Operator::new(OpCode::VERTEX_SET_TMX, [Arg::U32(tmx)])
    }

    /// Switches the vertex manifestation.
    pub fn convert(manifestation: u8) -> Operator {
        Operator::new(OpCode::VERTEX_CONVERT, [Arg::U8(manifestation)])
    }

    /// String-valued property; `key` is the enumerated key hash.
    pub fn set_property(key: u64, value: &str) -> Operator {
        Operator::new(
            OpCode::VERTEX_SET_PROPERTY,
            [
                Arg::U64(key),
                Arg::U8(0x20),
                Arg::U64(0),
                Arg::U64(value.len() as u64),
                Arg::Str(value.to_string()),
            ],
        )
    }

    pub fn delete_property(key: u64) -> Operator {
        Operator::new(OpCode::VERTEX_DELETE_PROPERTY, [Arg::U64(key)])
    }

    /// Drops every property of the current vertex.
    pub fn clear_properties() -> Operator {
        Operator::new(OpCode::VERTEX_CLEAR_PROPERTIES, [])
    }

    pub fn set_vector(encoded: &str) -> Operator {
        Operator::new(OpCode::VERTEX_SET_VECTOR, [Arg::Str(encoded.to_string())])
    }

    pub fn delete_vector() -> Operator {
        Operator::new(OpCode::VERTEX_DELETE_VECTOR, [])
    }

    /// `removed` is the count dropped at capture time.
    pub fn delete_outarcs(removed: u64) -> Operator {
        Operator::new(OpCode::VERTEX_DELETE_OUTARCS, [Arg::U64(removed)])
    }

    pub fn delete_inarcs(removed: u64) -> Operator {
        Operator::new(OpCode::VERTEX_DELETE_INARCS, [Arg::U64(removed)])
    }

    /// Connects the current vertex to `head`.
    pub fn arc_connect(predicate: u64, head: ObjectId) -> Operator {
        Operator::new(OpCode::ARC_CONNECT, [Arg::U64(predicate), Arg::Obid(head)])
    }

    /// Removes arcs to `head` matching `predicate`.
    pub fn arc_disconnect(removed: u64, predicate: u64, head: ObjectId) -> Operator {
        Operator::new(
            OpCode::ARC_DISCONNECT,
            [
                Arg::U8(0),
                Arg::U64(removed),
                Arg::U64(predicate),
                Arg::Obid(head),
            ],
        )
    }

    /// Free-form annotation carried in the stream.
    pub fn comment(text: &str) -> Operator {
        Operator::new(OpCode::SYSTEM_SEND_COMMENT, [Arg::Str(text.to_string())]).with_comment(text)
    }

    /// One part of an auxiliary data payload.
    pub fn raw_data(parts: u64, part: u64, data: &str, command: u32, obid: ObjectId) -> Operator {
        Operator::new(
            OpCode::SYSTEM_SEND_RAW_DATA,
            [
                Arg::U64(parts),
                Arg::U64(part),
                Arg::Str(data.to_string()),
                Arg::U64(data.len() as u64),
                Arg::U32(command),
                Arg::U32(0),
                Arg::Obid(obid),
            ],
        )
    }

    /// Announces a new graph at `path`.
    pub fn create_graph(obid: ObjectId, path: &str, name: &str, t0: u32) -> Operator {
        Operator::new(
            OpCode::SYSTEM_CREATE_GRAPH,
            [
                Arg::U32(0),
                Arg::U32(t0),
                Arg::U64(0),
                Arg::Obid(obid),
                Arg::Str(path.to_string()),
                Arg::Str(name.to_string()),
            ],
        )
    }

    /// Empties the graph, keeping the type registry.
    pub fn truncate(vertex_type: u8, discarded: u64) -> Operator {
        Operator::new(OpCode::GRAPH_TRUNCATE, [Arg::U8(vertex_type), Arg::U64(discarded)])
    }

    pub fn readonly() -> Operator {
        Operator::new(OpCode::GRAPH_READONLY, []).with_comment("[READONLY GRAPH]")
    }

    pub fn readwrite() -> Operator {
        Operator::new(OpCode::GRAPH_READWRITE, []).with_comment("[READWRITE GRAPH]")
    }

    /// Clock tick in milliseconds.
    pub fn tick(tms: u64) -> Operator {
        Operator::new(OpCode::GRAPH_TICK, [Arg::U64(tms)])
    }

    /// Acquires write locks on `ids`, counted in the payload.
    pub fn lock_writable(ids: &[ObjectId]) -> Operator {
        Operator::new(
            OpCode::VERTICES_ACQUIRE_WL,
            [Arg::U32(ids.len() as u32), Arg::Ids(ids.to_vec())],
        )
    }

    pub fn release(ids: &[ObjectId]) -> Operator {
        Operator::new(
            OpCode::VERTICES_RELEASE,
            [Arg::U32(ids.len() as u32), Arg::Ids(ids.to_vec())],
        )
    }

    pub fn release_all(count: u32) -> Operator {
        Operator::new(OpCode::VERTICES_RELEASE_ALL, [Arg::U32(count)])
    }

    /// One `ENUM_ADD_*` registration; `code` selects the registry.
    pub fn enum_add(code: OpCode, hash: u64, encoded: u64, value: &str) -> Operator {
        Operator::new(
            code,
            [Arg::U64(hash), Arg::U64(encoded), Arg::Str(value.to_string())],
        )
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut line = Vec::new();
        self.encode(&mut line);
        f.write_str(String::from_utf8_lossy(&line).trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::opcode::OPCODES;

    #[test]
    fn every_table_opcode_has_a_signature() {
        for info in OPCODES {
            assert!(signature(info.code).is_some(), "{}", info.mnemonic);
        }
        assert!(signature(OpCode::INVALID).is_none());
    }

    #[test]
    fn vertex_new_line_layout() -> Result<()> {
        let op = Operator::vertex_new("alice", 0x11, 7, 0);
        op.validate()?;
        let mut line = Vec::new();
        op.encode(&mut line);
        let text = String::from_utf8(line.clone()).unwrap();
        assert!(text.starts_with("    vxn 1010111C "));
        assert!(text.ends_with(" 616c696365 # alice\n"));
        let back = Operator::decode(&line)?;
        assert_eq!(back, op);
        Ok(())
    }

    #[test]
    fn id_lists_follow_their_count() -> Result<()> {
        let ids = [ObjectId::from_name("a"), ObjectId::from_name("b")];
        let op = Operator::lock_writable(&ids);
        op.validate()?;
        let mut line = Vec::new();
        op.encode(&mut line);
        let back = Operator::decode(&line)?;
        assert_eq!(back.ids_at(1), Some(&ids[..]));

        let empty = Operator::release(&[]);
        let mut line = Vec::new();
        empty.encode(&mut line);
        assert_eq!(line, b"    ulv 00A013F5 00000000\n");
        assert_eq!(Operator::decode(&line)?.ids_at(1), Some(&[][..]));
        Ok(())
    }

    #[test]
    fn decode_rejects_mismatches() {
        assert!(Operator::decode(b"    vxd 1010111C\n").is_err());
        assert!(Operator::decode(b"    vxr 1010121A 0G\n").is_err());
        assert!(Operator::decode(b"    vxr 1010121A 0000000000000001 FF\n").is_err());
        assert!(Operator::decode(b"    zzz 12345678\n").is_err());
        assert!(Operator::decode(b"    lxw 10A011F5 00000002 0123\n").is_err());
    }

    #[test]
    fn validate_catches_wrong_shapes() {
        let bad = Operator::new(OpCode::VERTEX_SET_RANK, [Arg::U32(1)]);
        assert!(bad.validate().is_err());
        let bad_count = Operator::new(
            OpCode::VERTICES_RELEASE,
            [Arg::U32(3), Arg::Ids(vec![ObjectId::from_name("x")])],
        );
        assert!(bad_count.validate().is_err());
    }
}
