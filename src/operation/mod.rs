//! Operation model: opcodes, operators, blocks and the emitter/parser pair
//! that turns graph mutations into the durable text stream and back.

/// Opcode table, filters and profiles.
pub mod opcode;

/// Single operator lines.
pub mod operator;

/// Operation lifecycle and `OP` ... `ENDOP` blocks.
pub mod op;

/// Batches capture blocks into transactions.
pub mod emitter;

/// Streaming parser that applies blocks to a graph.
pub mod parser;

pub use emitter::{Backlog, DeferCommit, EmitterOptions, EmitterStats, OperationEmitter, TransactionSink};
pub use op::{OpBlock, OpHeader, OpLineError, OpTrailer, Operation};
pub use opcode::{AuxCommand, OpCode, OpType, OpcodeFilter, OpcodeGate, ProfileId};
pub use operator::{Arg, FieldKind, Operator};
pub use parser::{
    AuxCommandHandler, DiscardTarget, ExecError, ExecMode, ExecResult, FeedOutcome, OperationParser, OperationTarget,
    ParserOptions, ParserState, ParserStats, SerialCheck,
};
