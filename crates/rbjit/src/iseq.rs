//! Method bytecode input model.
//!
//! An [`InstrSeq`] is the host VM's compiled body for a single method: a word
//! array in which each instruction occupies `1 + operand_count` words, plus
//! the auxiliary sizes the compiler needs (stack high-water mark, local and
//! parameter counts) and the call-info table that dispatch operand words
//! resolve through.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::error::{CompileError, Result};
use crate::insn::{Opcode, OperandKind};

/// Resolved call-site metadata behind a call-info operand word.
///
/// The operand word itself is forwarded verbatim to dispatch helpers; the
/// compiler only reads the method id and argument count out of the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    /// Interned method id.
    pub mid: u64,
    /// Number of positional arguments at the call site.
    pub orig_argc: u32,
    /// Call-site flags, forwarded untouched.
    #[serde(default)]
    pub flag: u32,
}

/// One method's compiled instruction sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrSeq {
    /// Instruction-stream length in words.
    pub iseq_size: u32,
    /// Encoded stream: opcode handle followed by operand words, repeated.
    pub iseq_encoded: Vec<u64>,
    /// Runtime operand-stack high-water mark; sizes the compile-time stack.
    pub stack_max: u32,
    /// Number of local-table slots (parameters included).
    pub local_table_size: u32,
    /// Number of parameters.
    pub param_size: u32,
    /// Call-info entries; call-info operand words index into this table.
    #[serde(default)]
    pub call_infos: Vec<CallInfo>,
}

impl InstrSeq {
    /// Decode the opcode at `pos`.
    pub fn opcode_at(&self, pos: u32) -> Result<Opcode> {
        let word = *self
            .iseq_encoded
            .get(pos as usize)
            .ok_or_else(|| CompileError::MalformedBytecode {
                pos,
                reason: format!("offset outside stream of {} words", self.iseq_size),
            })?;
        Opcode::from_addr(word).ok_or_else(|| CompileError::MalformedBytecode {
            pos,
            reason: format!("unknown opcode handle {word}"),
        })
    }

    /// Operand words of the instruction at `pos`.
    pub fn operands(&self, pos: u32, op: Opcode) -> Result<&[u64]> {
        let lo = pos as usize + 1;
        let hi = pos as usize + op.len();
        self.iseq_encoded
            .get(lo..hi)
            .ok_or_else(|| CompileError::MalformedBytecode {
                pos,
                reason: format!("truncated {} instruction", op.name()),
            })
    }

    /// Resolve a call-info operand word.
    pub fn call_info(&self, word: u64) -> Result<&CallInfo> {
        usize::try_from(word)
            .ok()
            .and_then(|idx| self.call_infos.get(idx))
            .ok_or_else(|| CompileError::MalformedBytecode {
                pos: 0,
                reason: format!("call-info word {word} outside table of {}", self.call_infos.len()),
            })
    }

    /// Human-readable instruction listing, with the discovered basic-block
    /// leaders and block ends appended.
    pub fn disasm(&self) -> String {
        let mut out = String::new();
        out.push_str("== disasm ======================================\n");
        let mut pos = 0u32;
        while pos < self.iseq_size {
            let Ok(op) = self.opcode_at(pos) else {
                let _ = writeln!(out, "{pos:04} <malformed>");
                break;
            };
            let kinds: String = op.operand_kinds().iter().map(|k| k.code()).collect();
            let _ = write!(out, "{pos:04} {:<26} [{kinds:<4}]", op.name());
            if let Ok(operands) = self.operands(pos, op) {
                for (kind, operand) in op.operand_kinds().iter().zip(operands) {
                    match kind {
                        OperandKind::Offset => {
                            let target =
                                pos as i64 + op.len() as i64 + *operand as i64;
                            let _ = write!(out, " {target}");
                        }
                        _ => {
                            let _ = write!(out, " {operand}");
                        }
                    }
                }
            }
            out.push('\n');
            pos += op.len() as u32;
        }
        match crate::compiler::analysis::block_starts(self) {
            Ok(starts) => {
                let ends = crate::compiler::analysis::block_ends(&starts, self);
                let _ = writeln!(out, "basic block starts: {starts:?}");
                let _ = writeln!(
                    out,
                    "basic block ends by start: {:?}",
                    ends.iter().collect::<Vec<_>>()
                );
            }
            Err(err) => {
                let _ = writeln!(out, "basic blocks unavailable: {err}");
            }
        }
        out
    }
}

/// Builds an [`InstrSeq`] word by word.
///
/// This is development tooling: tests and benches use it to assemble method
/// bodies without a host VM in the loop. `stack_max` defaults to a value
/// large enough for the small bodies tests build, and can be pinned down
/// with [`Assembler::stack_max`].
#[derive(Debug, Default)]
pub struct Assembler {
    words: Vec<u64>,
    call_infos: Vec<CallInfo>,
    stack_max: Option<u32>,
    local_table_size: u32,
    param_size: u32,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current instruction-stream position in words.
    pub fn pos(&self) -> u32 {
        self.words.len() as u32
    }

    /// Append one instruction. The operand count must match the opcode's
    /// metadata; a mismatch is a programming error in the caller.
    pub fn op(&mut self, op: Opcode, operands: &[u64]) -> &mut Self {
        debug_assert_eq!(
            operands.len(),
            op.operand_kinds().len(),
            "wrong operand count for {op}"
        );
        self.words.push(op.addr());
        self.words.extend_from_slice(operands);
        self
    }

    /// Register a call-info entry and return the operand word that refers to
    /// it.
    pub fn call_info(&mut self, mid: u64, orig_argc: u32) -> u64 {
        self.call_infos.push(CallInfo {
            mid,
            orig_argc,
            flag: 0,
        });
        (self.call_infos.len() - 1) as u64
    }

    pub fn stack_max(&mut self, max: u32) -> &mut Self {
        self.stack_max = Some(max);
        self
    }

    pub fn locals(&mut self, local_table_size: u32, param_size: u32) -> &mut Self {
        self.local_table_size = local_table_size;
        self.param_size = param_size;
        self
    }

    pub fn finish(&mut self) -> InstrSeq {
        InstrSeq {
            iseq_size: self.words.len() as u32,
            iseq_encoded: std::mem::take(&mut self.words),
            stack_max: self.stack_max.unwrap_or(16),
            local_table_size: self.local_table_size,
            param_size: self.param_size,
            call_infos: std::mem::take(&mut self.call_infos),
        }
    }
}
