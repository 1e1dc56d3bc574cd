#![forbid(unsafe_code)]
//! Opcode space, mnemonics, operation types and opcode filters.
//!
//! An opcode packs `(type << 8) | target | scope | action` into 32 bits:
//!
//! ```text
//!   A0TxxxMA
//!   ||\  /||
//!   || \/ |`- action: create C, delete D, assign A, event E, state 5
//!   ||  | `-- scope: 1 single object, F one or more objects
//!   ||  `---- operation type
//!   |`------- zero for valid opcodes
//!   `-------- additive bit (1 introduces something, 0 takes it away)
//! ```
//!
//! The top three bits are never part of an opcode. Filters use them to say
//! which field of the opcode a probe matches on.

use std::collections::BTreeSet;
use std::fmt;

use tracing::info;

/// Field masks.
pub mod mask {
    /// Every bit an opcode may use.
    pub const ALL: u32 = 0x1FFF_FFFF;
    /// Low nibble: create, delete, assign, event or state.
    pub const ACTION: u32 = 0x0000_000F;
    /// Single object or many.
    pub const SCOPE: u32 = 0x0000_00F0;
    /// Operation type, shifted left by 8.
    pub const TYPE: u32 = 0x000F_FF00;
    /// Object class the opcode acts on.
    pub const TARGET: u32 = 0x00F0_0000;
    /// Must be clear in a valid opcode.
    pub const ZERO: u32 = 0x0F00_0000;
    /// Set when the opcode introduces something.
    pub const ADDITIVE: u32 = 0x1000_0000;
    /// Filter probe selector; never part of an opcode.
    pub const PROBE: u32 = 0xE000_0000;
}

/// Action field values (the additive bit is part of the action).
pub mod action {
    /// Enter a state, e.g. acquire.
    pub const STATE_1: u32 = 0x1000_0005;
    /// Leave a state, e.g. release.
    pub const STATE_0: u32 = 0x0000_0005;
    pub const ASSIGN: u32 = 0x1000_000A;
    pub const CREATE: u32 = 0x1000_000C;
    pub const DELETE: u32 = 0x0000_000D;
    pub const EVENT: u32 = 0x1000_000E;
}

/// Scope field values.
pub mod scope {
    /// One object.
    pub const SINGLE: u32 = 0x0000_0010;
    /// One or more objects.
    pub const MULTIPLE: u32 = 0x0000_00F0;
}

/// Target field values.
pub mod target {
    pub const VERTEX: u32 = 0x0010_0000;
    pub const ARC: u32 = 0x0020_0000;
    pub const SYSTEM: u32 = 0x0030_0000;
    pub const GRAPH: u32 = 0x0040_0000;
    /// Readonly/writable switch.
    pub const RW: u32 = 0x0050_0000;
    /// Event processor.
    pub const EVP: u32 = 0x0060_0000;
    pub const TIME: u32 = 0x0070_0000;
    pub const EXEC: u32 = 0x0080_0000;
    /// Multi-vertex lock groups.
    pub const ACQUIRE: u32 = 0x00A0_0000;
    /// Enumeration registries.
    pub const ENUM: u32 = 0x00E0_0000;
}

/// Builds an opcode from its fields.
pub const fn compose(type_code: u32, target: u32, scope: u32, action: u32) -> u32 {
    (type_code << 8) | target | scope | action
}

/// A 32-bit operation code.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpCode(pub u32);

impl OpCode {
    /// Never produced by the table; stands in for an unparsable opcode.
    pub const INVALID: OpCode = OpCode(0xFFFF_FFFF);
    /// `nop`.
    pub const NONE: OpCode = OpCode(compose(0x000, 0, scope::SINGLE, action::EVENT));

    /// `vxn`: creates a vertex with its type, rank and expiration.
    pub const VERTEX_NEW: OpCode = OpCode(compose(0x011, target::VERTEX, scope::SINGLE, action::CREATE));
    /// `vxd`
    pub const VERTEX_DELETE: OpCode = OpCode(compose(0x011, target::VERTEX, scope::SINGLE, action::DELETE));
    /// `vxr`
    pub const VERTEX_SET_RANK: OpCode = OpCode(compose(0x012, target::VERTEX, scope::SINGLE, action::ASSIGN));
    /// `vxt`
    pub const VERTEX_SET_TYPE: OpCode = OpCode(compose(0x013, target::VERTEX, scope::SINGLE, action::ASSIGN));
    /// `vxx`: sets the expiration timestamp.
    pub const VERTEX_SET_TMX: OpCode = OpCode(compose(0x014, target::VERTEX, scope::SINGLE, action::ASSIGN));
    pub const VERTEX_CONVERT: OpCode = OpCode(compose(0x015, target::VERTEX, scope::SINGLE, action::ASSIGN));
    /// `vps`: sets one property value.
    pub const VERTEX_SET_PROPERTY: OpCode = OpCode(compose(0x016, target::VERTEX, scope::SINGLE, action::CREATE));
    /// `vpd`
    pub const VERTEX_DELETE_PROPERTY: OpCode = OpCode(compose(0x016, target::VERTEX, scope::SINGLE, action::DELETE));
    /// `vpc`: removes every property.
    pub const VERTEX_CLEAR_PROPERTIES: OpCode = OpCode(compose(0x016, target::VERTEX, scope::MULTIPLE, action::DELETE));
    pub const VERTEX_SET_VECTOR: OpCode = OpCode(compose(0x017, target::VERTEX, scope::SINGLE, action::CREATE));
    pub const VERTEX_DELETE_VECTOR: OpCode = OpCode(compose(0x017, target::VERTEX, scope::SINGLE, action::DELETE));
    /// `vod`: disconnects every outgoing arc.
    pub const VERTEX_DELETE_OUTARCS: OpCode = OpCode(compose(0x018, target::VERTEX, scope::MULTIPLE, action::DELETE));
    /// `vid`: disconnects every incoming arc.
    pub const VERTEX_DELETE_INARCS: OpCode = OpCode(compose(0x019, target::VERTEX, scope::MULTIPLE, action::DELETE));
    /// `val`: the block's vertex is locked writable by the emitting thread.
    pub const VERTEX_ACQUIRE: OpCode = OpCode(compose(0x01C, target::VERTEX, scope::SINGLE, action::STATE_1));
    /// `vrl`: pairs with [`VERTEX_ACQUIRE`](Self::VERTEX_ACQUIRE).
    pub const VERTEX_RELEASE: OpCode = OpCode(compose(0x01C, target::VERTEX, scope::SINGLE, action::STATE_0));

    /// `arc`: connects the block's vertex to a head vertex.
    pub const ARC_CONNECT: OpCode = OpCode(compose(0x001, target::ARC, scope::SINGLE, action::CREATE));
    /// `ard`
    pub const ARC_DISCONNECT: OpCode = OpCode(compose(0x002, target::ARC, scope::MULTIPLE, action::DELETE));

    /// `sya`: a producer attached. Forces an immediate transaction.
    pub const SYSTEM_ATTACH: OpCode = OpCode(compose(0x011, target::SYSTEM, scope::MULTIPLE, action::STATE_1));
    /// `syd`
    pub const SYSTEM_DETACH: OpCode = OpCode(compose(0x012, target::SYSTEM, scope::MULTIPLE, action::STATE_0));
    pub const SYSTEM_CLEAR_REGISTRY: OpCode = OpCode(compose(0x021, target::SYSTEM, scope::MULTIPLE, action::DELETE));
    pub const SYSTEM_SIMILARITY: OpCode = OpCode(compose(0x031, target::SYSTEM, scope::SINGLE, action::CREATE));
    /// `com`: free text, never executed.
    pub const SYSTEM_SEND_COMMENT: OpCode = OpCode(compose(0x0C0, target::SYSTEM, scope::SINGLE, action::EVENT));
    /// `dat`: auxiliary payload, see [`AuxCommand`].
    pub const SYSTEM_SEND_RAW_DATA: OpCode = OpCode(compose(0x0DA, target::SYSTEM, scope::SINGLE, action::EVENT));
    pub const SYSTEM_CLONE_GRAPH: OpCode = OpCode(compose(0x0E1, target::SYSTEM, scope::SINGLE, action::CREATE));

    pub const SYSTEM_CREATE_GRAPH: OpCode = OpCode(compose(0x051, target::GRAPH, scope::SINGLE, action::CREATE));
    pub const SYSTEM_DELETE_GRAPH: OpCode = OpCode(compose(0x052, target::GRAPH, scope::SINGLE, action::DELETE));
    /// `grt`: removes every vertex of one type.
    pub const GRAPH_TRUNCATE: OpCode = OpCode(compose(0x053, target::GRAPH, scope::SINGLE, action::DELETE));
    pub const GRAPH_PERSIST: OpCode = OpCode(compose(0x055, target::GRAPH, scope::SINGLE, action::EVENT));
    pub const GRAPH_STATE: OpCode = OpCode(compose(0x056, target::GRAPH, scope::SINGLE, action::EVENT));

    /// `grr`: the origin graph became readonly.
    pub const GRAPH_READONLY: OpCode = OpCode(compose(0x001, target::RW, scope::SINGLE, action::STATE_0));
    /// `grw`: the origin graph became writable again.
    pub const GRAPH_READWRITE: OpCode = OpCode(compose(0x002, target::RW, scope::SINGLE, action::STATE_1));
    pub const GRAPH_EVENTS: OpCode = OpCode(compose(0x003, target::EVP, scope::SINGLE, action::STATE_1));
    pub const GRAPH_NOEVENTS: OpCode = OpCode(compose(0x004, target::EVP, scope::SINGLE, action::STATE_0));
    /// `tic`: origin clock tick; also a keepalive.
    pub const GRAPH_TICK: OpCode = OpCode(compose(0x005, target::TIME, scope::SINGLE, action::EVENT));
    pub const GRAPH_EVENT_EXEC: OpCode = OpCode(compose(0x006, target::EXEC, scope::SINGLE, action::EVENT));

    /// `lxw`: opens a lock group over the listed vertices.
    pub const VERTICES_ACQUIRE_WL: OpCode = OpCode(compose(0x011, target::ACQUIRE, scope::MULTIPLE, action::STATE_1));
    /// `ulv`: closes part of a lock group.
    pub const VERTICES_RELEASE: OpCode = OpCode(compose(0x013, target::ACQUIRE, scope::MULTIPLE, action::STATE_0));
    /// `ula`: closes every open lock group.
    pub const VERTICES_RELEASE_ALL: OpCode = OpCode(compose(0x0AA, target::ACQUIRE, scope::MULTIPLE, action::STATE_0));

    /// `vea`: registers a vertex type name.
    pub const ENUM_ADD_VXTYPE: OpCode = OpCode(compose(0x001, target::ENUM, scope::SINGLE, action::CREATE));
    pub const ENUM_DELETE_VXTYPE: OpCode = OpCode(compose(0x001, target::ENUM, scope::SINGLE, action::DELETE));
    /// `rea`: registers a relationship name.
    pub const ENUM_ADD_REL: OpCode = OpCode(compose(0x002, target::ENUM, scope::SINGLE, action::CREATE));
    pub const ENUM_DELETE_REL: OpCode = OpCode(compose(0x002, target::ENUM, scope::SINGLE, action::DELETE));
    pub const ENUM_ADD_DIM: OpCode = OpCode(compose(0x003, target::ENUM, scope::SINGLE, action::CREATE));
    pub const ENUM_DELETE_DIM: OpCode = OpCode(compose(0x003, target::ENUM, scope::SINGLE, action::DELETE));
    pub const ENUM_ADD_KEY: OpCode = OpCode(compose(0x004, target::ENUM, scope::SINGLE, action::CREATE));
    pub const ENUM_DELETE_KEY: OpCode = OpCode(compose(0x004, target::ENUM, scope::SINGLE, action::DELETE));
    /// `sea`
    pub const ENUM_ADD_STRING: OpCode = OpCode(compose(0x005, target::ENUM, scope::SINGLE, action::CREATE));
    pub const ENUM_DELETE_STRING: OpCode = OpCode(compose(0x005, target::ENUM, scope::SINGLE, action::DELETE));

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Action field, additive bit excluded.
    pub const fn action(self) -> u32 {
        self.0 & mask::ACTION
    }

    pub const fn scope(self) -> u32 {
        self.0 & mask::SCOPE
    }

    /// Operation type, unshifted.
    pub const fn type_code(self) -> u32 {
        (self.0 & mask::TYPE) >> 8
    }

    /// Target field.
    pub const fn target(self) -> u32 {
        self.0 & mask::TARGET
    }

    /// True when the opcode creates, assigns or enters a state.
    pub const fn is_additive(self) -> bool {
        self.0 & mask::ADDITIVE != 0
    }

    /// True for opcodes with the reserved bits clear.
    pub const fn is_valid(self) -> bool {
        self.0 & (mask::ZERO | mask::PROBE) == 0
    }

    /// Entry in the opcode table.
    pub fn info(self) -> Option<&'static OpInfo> {
        OPCODES.iter().find(|info| info.code == self)
    }

    /// Three-letter mnemonic, or `???` outside the table.
    pub fn mnemonic(self) -> &'static str {
        self.info().map(|info| info.mnemonic).unwrap_or("???")
    }

    /// Table lookup by mnemonic.
    pub fn from_mnemonic(mnemonic: &str) -> Option<OpCode> {
        OPCODES
            .iter()
            .find(|info| info.mnemonic == mnemonic)
            .map(|info| info.code)
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpCode({:08X} {})", self.0, self.mnemonic())
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Opcode table row.
#[derive(Debug)]
pub struct OpInfo {
    pub code: OpCode,
    /// Three letters, as written on operator lines.
    pub mnemonic: &'static str,
    pub description: &'static str,
}

macro_rules! op_table {
    ($($code:ident => $mnem:literal, $desc:literal;)*) => {
        /// Every known opcode, in table order.
        pub static OPCODES: &[OpInfo] = &[
            $(OpInfo { code: OpCode::$code, mnemonic: $mnem, description: $desc },)*
        ];
    };
}

op_table! {
    NONE => "nop", "no operator";
    VERTEX_NEW => "vxn", "vertex new";
    VERTEX_DELETE => "vxd", "vertex delete";
    VERTEX_SET_RANK => "vxr", "vertex rank";
    VERTEX_SET_TYPE => "vxt", "vertex type";
    VERTEX_SET_TMX => "vxx", "vertex expiration";
    VERTEX_CONVERT => "vxc", "vertex convert";
    VERTEX_SET_PROPERTY => "vps", "vertex property set";
    VERTEX_DELETE_PROPERTY => "vpd", "vertex property delete";
    VERTEX_CLEAR_PROPERTIES => "vpc", "vertex properties clear";
    VERTEX_SET_VECTOR => "vvs", "vertex vector set";
    VERTEX_DELETE_VECTOR => "vvd", "vertex vector delete";
    VERTEX_DELETE_OUTARCS => "vod", "vertex outarcs delete";
    VERTEX_DELETE_INARCS => "vid", "vertex inarcs delete";
    VERTEX_ACQUIRE => "val", "vertex acquire lock";
    VERTEX_RELEASE => "vrl", "vertex release lock";
    ARC_CONNECT => "arc", "arc connect";
    ARC_DISCONNECT => "ard", "arc disconnect";
    SYSTEM_ATTACH => "sya", "system attach";
    SYSTEM_DETACH => "syd", "system detach";
    SYSTEM_CLEAR_REGISTRY => "rcl", "registry clear";
    SYSTEM_SIMILARITY => "scf", "similarity config";
    SYSTEM_SEND_COMMENT => "com", "comment";
    SYSTEM_SEND_RAW_DATA => "dat", "raw data";
    SYSTEM_CLONE_GRAPH => "clg", "clone graph";
    SYSTEM_CREATE_GRAPH => "grn", "graph new";
    SYSTEM_DELETE_GRAPH => "grd", "graph delete";
    GRAPH_TRUNCATE => "grt", "graph truncate";
    GRAPH_PERSIST => "grp", "graph persist";
    GRAPH_STATE => "grs", "graph state";
    GRAPH_READONLY => "grr", "graph readonly";
    GRAPH_READWRITE => "grw", "graph writable";
    GRAPH_EVENTS => "gre", "graph events enabled";
    GRAPH_NOEVENTS => "gri", "graph events disabled";
    GRAPH_TICK => "tic", "tick";
    GRAPH_EVENT_EXEC => "evx", "events execute";
    VERTICES_ACQUIRE_WL => "lxw", "lock writable vertices";
    VERTICES_RELEASE => "ulv", "unlock vertices";
    VERTICES_RELEASE_ALL => "ula", "unlock all vertices";
    ENUM_ADD_VXTYPE => "vea", "vertex type enumeration add";
    ENUM_DELETE_VXTYPE => "ved", "vertex type enumeration delete";
    ENUM_ADD_REL => "rea", "relationship enumeration add";
    ENUM_DELETE_REL => "red", "relationship enumeration delete";
    ENUM_ADD_DIM => "dea", "dimension enumeration add";
    ENUM_DELETE_DIM => "ded", "dimension enumeration delete";
    ENUM_ADD_KEY => "kea", "key enumeration add";
    ENUM_DELETE_KEY => "ked", "key enumeration delete";
    ENUM_ADD_STRING => "sea", "string enumeration add";
    ENUM_DELETE_STRING => "sed", "string enumeration delete";
}

/// Which opcode field a filter compares.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Probe {
    /// Matches every valid opcode.
    Any,
    /// Compares all opcode bits.
    Exact,
    Action,
    Scope,
    Type,
    Target,
    /// Compares only the additive bit.
    Additive,
}

impl Probe {
    pub const fn bits(self) -> u32 {
        match self {
            Probe::Any => 0x0000_0000,
            Probe::Exact => 0x2000_0000,
            Probe::Action => 0x4000_0000,
            Probe::Scope => 0x6000_0000,
            Probe::Type => 0x8000_0000,
            Probe::Target => 0xA000_0000,
            Probe::Additive => 0xC000_0000,
        }
    }

    /// Probe named by the top three bits of `bits`.
    pub fn from_bits(bits: u32) -> Option<Probe> {
        Some(match bits & mask::PROBE {
            0x0000_0000 => Probe::Any,
            0x2000_0000 => Probe::Exact,
            0x4000_0000 => Probe::Action,
            0x6000_0000 => Probe::Scope,
            0x8000_0000 => Probe::Type,
            0xA000_0000 => Probe::Target,
            0xC000_0000 => Probe::Additive,
            _ => return None,
        })
    }

    const fn field_mask(self) -> u32 {
        match self {
            Probe::Any => mask::ZERO,
            Probe::Exact => mask::ALL,
            Probe::Action => mask::ACTION,
            Probe::Scope => mask::SCOPE,
            Probe::Type => mask::TYPE,
            Probe::Target => mask::TARGET,
            Probe::Additive => mask::ADDITIVE,
        }
    }
}

/// An opcode pattern: probe bits in the top three bits, field value below.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpcodeFilter(u32);

impl OpcodeFilter {
    /// Normalizes a raw filter value.
    ///
    /// Zero matches everything, a bare opcode matches exactly, and a value
    /// with probe bits is taken as given.
    pub fn new(raw: u32) -> OpcodeFilter {
        if raw & mask::PROBE != 0 || raw == 0 {
            OpcodeFilter(raw)
        } else {
            OpcodeFilter(raw | Probe::Exact.bits())
        }
    }

    /// Filter matching `code` only.
    pub fn exact(code: OpCode) -> OpcodeFilter {
        OpcodeFilter(code.0 | Probe::Exact.bits())
    }

    /// Filter comparing the field `probe` selects against `value`.
    pub fn probe(probe: Probe, value: u32) -> OpcodeFilter {
        OpcodeFilter(probe.bits() | (value & !mask::PROBE))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// False for a filter with an unknown probe.
    pub fn matches(self, code: OpCode) -> bool {
        match Probe::from_bits(self.0) {
            Some(probe) => {
                let field = probe.field_mask();
                code.0 & field == self.0 & field
            }
            None => false,
        }
    }
}

/// Whether a profile lists opcodes to refuse or the only opcodes to accept.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProfileMode {
    /// Refuse the listed opcodes.
    Deny,
    /// Refuse everything else.
    Allow,
}

/// Named opcode profiles a consumer can apply.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileId {
    /// Refuses graph-wide administration on a replica.
    ConsumerDeny,
    /// Admits vertex, arc and enumeration updates only.
    ConsumerAllow,
    DenyDeletes,
}

impl ProfileId {
    pub const fn code(self) -> u32 {
        match self {
            ProfileId::ConsumerDeny => 0x1D00_C000,
            ProfileId::ConsumerAllow => 0x1A00_C000,
            ProfileId::DenyDeletes => 0x1D00_000D,
        }
    }
}

/// A named list of opcodes with a mode.
#[derive(Debug)]
pub struct OpProfile {
    pub id: ProfileId,
    pub mode: ProfileMode,
    pub name: &'static str,
    pub filters: &'static [OpcodeFilter],
}

const fn exact(code: OpCode) -> OpcodeFilter {
    OpcodeFilter(code.0 | 0x2000_0000)
}

static CONSUMER_DENY: &[OpcodeFilter] = &[
    exact(OpCode::SYSTEM_CLEAR_REGISTRY),
    exact(OpCode::SYSTEM_CLONE_GRAPH),
    exact(OpCode::SYSTEM_DELETE_GRAPH),
    exact(OpCode::GRAPH_TRUNCATE),
    exact(OpCode::GRAPH_PERSIST),
    exact(OpCode::GRAPH_STATE),
    exact(OpCode::GRAPH_READONLY),
    exact(OpCode::GRAPH_EVENTS),
    exact(OpCode::GRAPH_NOEVENTS),
    exact(OpCode::GRAPH_EVENT_EXEC),
];

static CONSUMER_ALLOW: &[OpcodeFilter] = &[
    exact(OpCode::VERTEX_NEW),
    exact(OpCode::VERTEX_DELETE),
    exact(OpCode::VERTEX_SET_RANK),
    exact(OpCode::VERTEX_SET_TYPE),
    exact(OpCode::VERTEX_SET_TMX),
    exact(OpCode::VERTEX_CONVERT),
    exact(OpCode::VERTEX_SET_PROPERTY),
    exact(OpCode::VERTEX_DELETE_PROPERTY),
    exact(OpCode::VERTEX_CLEAR_PROPERTIES),
    exact(OpCode::VERTEX_SET_VECTOR),
    exact(OpCode::VERTEX_DELETE_VECTOR),
    exact(OpCode::VERTEX_DELETE_OUTARCS),
    exact(OpCode::VERTEX_DELETE_INARCS),
    exact(OpCode::VERTEX_ACQUIRE),
    exact(OpCode::VERTEX_RELEASE),
    exact(OpCode::ARC_CONNECT),
    exact(OpCode::ARC_DISCONNECT),
    exact(OpCode::SYSTEM_SIMILARITY),
    exact(OpCode::SYSTEM_SEND_COMMENT),
    exact(OpCode::SYSTEM_SEND_RAW_DATA),
    exact(OpCode::SYSTEM_CREATE_GRAPH),
    exact(OpCode::GRAPH_TICK),
    exact(OpCode::VERTICES_ACQUIRE_WL),
    exact(OpCode::VERTICES_RELEASE),
    exact(OpCode::VERTICES_RELEASE_ALL),
    exact(OpCode::ENUM_ADD_VXTYPE),
    exact(OpCode::ENUM_DELETE_VXTYPE),
    exact(OpCode::ENUM_ADD_REL),
    exact(OpCode::ENUM_DELETE_REL),
    exact(OpCode::ENUM_ADD_DIM),
    exact(OpCode::ENUM_DELETE_DIM),
    exact(OpCode::ENUM_ADD_KEY),
    exact(OpCode::ENUM_DELETE_KEY),
    exact(OpCode::ENUM_ADD_STRING),
    exact(OpCode::ENUM_DELETE_STRING),
];

static DENY_DELETES: &[OpcodeFilter] = &[OpcodeFilter(0x4000_0000 | action::DELETE)];

/// Built-in profiles.
pub static PROFILES: &[OpProfile] = &[
    OpProfile {
        id: ProfileId::ConsumerDeny,
        mode: ProfileMode::Deny,
        name: "operation consumer deny profile",
        filters: CONSUMER_DENY,
    },
    OpProfile {
        id: ProfileId::ConsumerAllow,
        mode: ProfileMode::Allow,
        name: "operation consumer allow profile",
        filters: CONSUMER_ALLOW,
    },
    OpProfile {
        id: ProfileId::DenyDeletes,
        mode: ProfileMode::Deny,
        name: "deny deletes profile",
        filters: DENY_DELETES,
    },
];

impl OpProfile {
    /// Built-in profile for `id`.
    pub fn get(id: ProfileId) -> &'static OpProfile {
        match id {
            ProfileId::ConsumerDeny => &PROFILES[0],
            ProfileId::ConsumerAllow => &PROFILES[1],
            ProfileId::DenyDeletes => &PROFILES[2],
        }
    }
}

/// Per-consumer set of opcodes refused for execution.
#[derive(Clone, Debug, Default)]
pub struct OpcodeGate {
    denied: BTreeSet<u32>,
}

impl OpcodeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Denies every table opcode matching `filter`; `None` when nothing matched.
    pub fn deny(&mut self, filter: OpcodeFilter) -> Option<usize> {
        let mut found = false;
        let mut changed = 0;
        for info in OPCODES.iter().filter(|i| filter.matches(i.code)) {
            found = true;
            if self.denied.insert(info.code.0) {
                info!(opcode = %info.code, mnemonic = info.mnemonic, "opcode.deny");
                changed += 1;
            }
        }
        found.then_some(changed)
    }

    /// Re-allows every opcode matching `filter`; `None` when nothing matched.
    pub fn allow(&mut self, filter: OpcodeFilter) -> Option<usize> {
        let mut found = false;
        let mut changed = 0;
        for info in OPCODES.iter().filter(|i| filter.matches(i.code)) {
            found = true;
            if self.denied.remove(&info.code.0) {
                info!(opcode = %info.code, mnemonic = info.mnemonic, "opcode.allow");
                changed += 1;
            }
        }
        found.then_some(changed)
    }

    /// Applies a built-in profile; returns how many opcodes end up denied by it.
    pub fn apply_profile(&mut self, id: ProfileId) -> usize {
        let profile = OpProfile::get(id);
        match profile.mode {
            ProfileMode::Deny => profile
                .filters
                .iter()
                .filter_map(|f| self.deny(*f))
                .sum(),
            ProfileMode::Allow => {
                self.deny(OpcodeFilter::new(0));
                let allowed: usize = profile
                    .filters
                    .iter()
                    .filter_map(|f| self.allow(*f))
                    .sum();
                OPCODES.len() - allowed
            }
        }
    }

    pub fn is_allowed(&self, code: OpCode) -> bool {
        !self.denied.contains(&code.0)
    }

    /// Denied opcodes in ascending order.
    pub fn denied(&self) -> impl Iterator<Item = OpCode> + '_ {
        self.denied.iter().map(|c| OpCode(*c))
    }

    /// Allows every opcode again.
    pub fn clear(&mut self) {
        self.denied.clear();
    }
}

/// Kind of object an operation block applies to.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OpType {
    None = 0x0000,
    /// No graph id; producer and registry housekeeping.
    System = 0x0001,
    /// Graph-owned update with an operation id.
    GraphObject = 0x1001,
    /// Graph state change: readonly, events, ticks.
    GraphState = 0x100A,
    /// Update of one vertex, named on the `OP` line.
    VertexObject = 0x2001,
    /// Opens a multi-vertex lock group.
    VertexLock = 0x200A,
    /// Closes a multi-vertex lock group.
    VertexRelease = 0x200B,
}

impl OpType {
    /// Decodes the `OP` line type field.
    pub fn from_u16(raw: u16) -> Option<OpType> {
        Some(match raw {
            0x0000 => OpType::None,
            0x0001 => OpType::System,
            0x1001 => OpType::GraphObject,
            0x100A => OpType::GraphState,
            0x2001 => OpType::VertexObject,
            0x200A => OpType::VertexLock,
            0x200B => OpType::VertexRelease,
            _ => return None,
        })
    }

    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Whether the `OP` line carries a graph id.
    pub const fn has_graph(self) -> bool {
        !matches!(self, OpType::None | OpType::System)
    }

    /// Whether the `OP` line carries a vertex id.
    pub const fn has_vertex(self) -> bool {
        matches!(self, OpType::VertexObject)
    }

    /// Whether `ENDOP` carries the operation id and timestamp.
    pub const fn has_opid(self) -> bool {
        matches!(self, OpType::GraphObject | OpType::VertexObject)
    }

    /// Operation type of a block whose first operator is `code`.
    ///
    /// Vertex-owned captures are always vertex objects; graph-owned ones
    /// depend on the opcode.
    pub fn for_capture(code: OpCode, vertex_owned: bool) -> OpType {
        if vertex_owned {
            return OpType::VertexObject;
        }
        match code {
            OpCode::SYSTEM_ATTACH
            | OpCode::SYSTEM_DETACH
            | OpCode::SYSTEM_CLEAR_REGISTRY
            | OpCode::SYSTEM_SEND_COMMENT
            | OpCode::SYSTEM_SEND_RAW_DATA
            | OpCode::SYSTEM_CLONE_GRAPH
            | OpCode::SYSTEM_SIMILARITY
            | OpCode::SYSTEM_CREATE_GRAPH
            | OpCode::SYSTEM_DELETE_GRAPH => OpType::System,
            OpCode::GRAPH_TICK
            | OpCode::GRAPH_EVENT_EXEC
            | OpCode::GRAPH_READONLY
            | OpCode::GRAPH_READWRITE
            | OpCode::GRAPH_EVENTS
            | OpCode::GRAPH_NOEVENTS => OpType::GraphState,
            OpCode::VERTICES_ACQUIRE_WL => OpType::VertexLock,
            OpCode::VERTICES_RELEASE => OpType::VertexRelease,
            _ => OpType::GraphObject,
        }
    }
}

/// Auxiliary command carried by a `dat` operator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AuxCommand(pub u32);

impl AuxCommand {
    /// Handled by the system rather than forwarded.
    pub const MASK_SYSTEM: u32 = 0x0000_0010;
    pub const MASK_PROPERTY: u32 = 0x0000_0100;
    pub const MASK_PROP_SET: u32 = 0x0000_0200;
    pub const MASK_PROP_DEL: u32 = 0x0000_0400;
    /// Payload holds several properties.
    pub const MASK_PROP_MULTI: u32 = 0x0000_0800;
    /// Payload is passed through untouched.
    pub const MASK_FORWARD: u32 = 0x0000_1000;

    pub const NONE: AuxCommand = AuxCommand(0);
    pub const SYSTEM_PROPERTY: AuxCommand = AuxCommand(Self::MASK_SYSTEM | Self::MASK_PROPERTY);
    /// Sets one graph property.
    pub const SYSTEM_SET_PROPERTY: AuxCommand =
        AuxCommand(Self::MASK_SYSTEM | Self::MASK_PROPERTY | Self::MASK_PROP_SET);
    pub const SYSTEM_DEL_PROPERTY: AuxCommand =
        AuxCommand(Self::MASK_SYSTEM | Self::MASK_PROPERTY | Self::MASK_PROP_DEL);
    /// Sets several graph properties, split across `dat` parts.
    pub const SYSTEM_SET_PROPERTIES: AuxCommand = AuxCommand(
        Self::MASK_SYSTEM | Self::MASK_PROPERTY | Self::MASK_PROP_SET | Self::MASK_PROP_MULTI,
    );
    pub const SYSTEM_DEL_PROPERTIES: AuxCommand = AuxCommand(
        Self::MASK_SYSTEM | Self::MASK_PROPERTY | Self::MASK_PROP_DEL | Self::MASK_PROP_MULTI,
    );
    /// Opaque forwarded bytes.
    pub const RAW_DATA: AuxCommand = AuxCommand(Self::MASK_SYSTEM | Self::MASK_FORWARD);

    /// True when every bit of `mask` is set.
    pub const fn has(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    pub const fn is_property(self) -> bool {
        self.has(Self::MASK_SYSTEM | Self::MASK_PROPERTY)
    }

    pub const fn is_forward(self) -> bool {
        self.has(Self::MASK_FORWARD)
    }
}
