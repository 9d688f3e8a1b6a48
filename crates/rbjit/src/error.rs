//! Compile-error taxonomy.
//!
//! Every error is fatal to the current method compilation: the caller must
//! discard the partially built module and fall back to interpretation.

use thiserror::Error;

/// Result alias used throughout the compiler.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors raised while compiling one method body.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The abstract operand stack exceeded the method's `stack_max`.
    #[error("internal stack overflow: max={max}, next size={next}")]
    StackOverflow { max: usize, next: usize },

    /// A pop was attempted on an empty abstract operand stack.
    #[error("internal stack underflow: next size={next}")]
    StackUnderflow { next: isize },

    /// A helper name was requested that is not in the registry table.
    #[error("'{name}' is not defined in the helper registry")]
    UnknownHelper { name: String },

    /// The translator has no lowering for this instruction.
    #[error("unhandled instruction at offset {pos}: {name}")]
    UnsupportedOpcode { name: &'static str, pos: u32 },

    /// `leave` was reached with a stack depth other than one.
    #[error("unexpected stack size at leave: {depth} (offset {pos})")]
    StackShapeAtLeave { depth: usize, pos: u32 },

    /// A jump tried to merge more than the single routable stack value.
    #[error("unexpected stack size {depth} at branch out of block {start}")]
    StackShapeAtReturn { depth: usize, start: u32 },

    /// Pending incoming values and blocks disagree at a join point.
    #[error("inconsistent join at {label}: {values} pending values vs {blocks} pending blocks")]
    InconsistentJoin {
        label: String,
        values: usize,
        blocks: usize,
    },

    /// A call does not match the helper's declared signature.
    #[error("helper '{name}' expects {expected} fixed arguments, got {got}")]
    TypeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// The instruction stream itself is unusable (truncated instruction,
    /// unknown opcode handle, branch target outside the stream, or a leader
    /// that falls inside operand words).
    #[error("malformed bytecode at offset {pos}: {reason}")]
    MalformedBytecode { pos: u32, reason: String },
}
