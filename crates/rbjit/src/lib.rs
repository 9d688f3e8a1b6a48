//! rbjit — method-level JIT front-end.
//!
//! This crate translates one method's stack-bytecode into an SSA-form module
//! containing a single function. The emitted function reproduces the
//! bytecode's observable effects by calling the host runtime's helper
//! functions by name; it takes the thread pointer and the control-frame
//! pointer as its two `i64` parameters and returns the frame pointer.
//!
//! The pipeline is bytecode → basic-block discovery → abstract stack
//! evaluation → SSA construction, with φ-nodes materialized at join points
//! where the operand stack is live across the merge.

mod compiler;
pub mod error;
pub mod insn;
pub mod ir;
pub mod iseq;
pub mod value;

pub use error::{CompileError, Result};
pub use iseq::{Assembler, CallInfo, InstrSeq};

/// Configuration options for one method compilation.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Print the instruction listing to stderr before compiling.
    pub dump_insns: bool,
}

/// Compile a method body into an SSA module.
///
/// Returns a module holding one function named `funcname` plus declarations
/// for every runtime helper the emitted code references. On error the
/// partially built module is discarded; the caller falls back to
/// interpretation.
///
/// # Example
/// ```
/// use rbjit::{compile_iseq, Assembler, CompileOptions};
/// use rbjit::insn::Opcode;
///
/// let mut asm = Assembler::new();
/// asm.op(Opcode::Putnil, &[]);
/// asm.op(Opcode::Leave, &[]);
/// let iseq = asm.finish();
///
/// let module = compile_iseq(&iseq, "method", &CompileOptions::default()).unwrap();
/// assert!(module.to_string().contains("@push_result"));
/// ```
pub fn compile_iseq(
    iseq: &InstrSeq,
    funcname: &str,
    options: &CompileOptions,
) -> Result<ir::Module> {
    compiler::compile(iseq, funcname, options)
}
