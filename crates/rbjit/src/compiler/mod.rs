//! # Method compiler
//!
//! Translates one method's instruction sequence into an SSA-form module.
//!
//! ## Pipeline overview
//!
//! ```text
//! InstrSeq
//!      │
//!      ├─[analysis]  block_starts() / block_ends()
//!      │
//!      ├─ block table: one entry per leader (block handle, end offset,
//!      │               compiled flag, φ handle, pending incomings)
//!      │
//!      └─[driver]    compile_block(0)
//!                      └── for each instruction in the block:
//!                            translate_insn()          [translate]
//!                              ├── abstract stack ops  [stack]
//!                              ├── helper calls        [registry]
//!                              └── branch opcodes recurse into
//!                                  compile_block() for their successors
//!                  ─► ir::Module
//! ```
//!
//! The driver is recursive: conditional branches compile both successors,
//! and the per-leader `compiled` flag makes re-entry a no-op, which bounds
//! the recursion by the number of basic blocks and terminates loops.

pub(crate) mod analysis;
mod registry;
mod stack;
mod translate;

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::error::{CompileError, Result};
use crate::insn::Opcode;
use crate::ir::{Builder, FuncSig, Module, Ty, ValueId};
use crate::iseq::InstrSeq;
use crate::CompileOptions;
use stack::OperandStack;

pub(crate) use registry::get_function;

/// Per-leader metadata, keyed by the leader's byte offset in the stream.
#[derive(Debug)]
struct BlockEntry {
    /// Emitted block handle.
    block: crate::ir::BlockId,
    /// Last instruction offset belonging to this block (inclusive).
    end: u32,
    /// Visited flag; re-entering a compiled block is a no-op.
    compiled: bool,
    /// φ-node at this block's head, once constructed.
    phi: Option<ValueId>,
    /// (value, predecessor) pairs deposited before `phi` exists; drained
    /// into the φ when the driver enters the block.
    pending: Vec<(ValueId, crate::ir::BlockId)>,
}

/// Compiler state for one method.
pub(crate) struct Compiler<'a> {
    iseq: &'a InstrSeq,
    builder: Builder,
    blocks: BTreeMap<u32, BlockEntry>,
    /// Thread pointer (parameter 0).
    th: ValueId,
    /// Control-frame pointer (parameter 1).
    cfp: ValueId,
}

impl<'a> Compiler<'a> {
    /// Build the module skeleton: the named function, its two parameters,
    /// and one appended block per leader.
    fn new(iseq: &'a InstrSeq, funcname: &str) -> Result<Self> {
        let starts = analysis::block_starts(iseq)?;
        let ends = analysis::block_ends(&starts, iseq);
        debug!(
            leaders = starts.len(),
            words = iseq.iseq_size,
            "discovered basic blocks"
        );

        let mut module = Module::new("rbjit");
        let func = module.define_function(
            funcname,
            FuncSig {
                ret: Ty::I64,
                params: vec![Ty::I64, Ty::I64],
                variadic: false,
            },
        );
        let mut builder = Builder::new(module, func);
        let th = builder.param(0).ok_or_else(|| CompileError::MalformedBytecode {
            pos: 0,
            reason: "function has no thread parameter".to_string(),
        })?;
        let cfp = builder.param(1).ok_or_else(|| CompileError::MalformedBytecode {
            pos: 0,
            reason: "function has no frame parameter".to_string(),
        })?;

        let mut blocks = BTreeMap::new();
        for start in &starts {
            let block = builder.append_block(format!("label_{start}"));
            blocks.insert(
                *start,
                BlockEntry {
                    block,
                    end: ends[start],
                    compiled: false,
                    phi: None,
                    pending: Vec::new(),
                },
            );
        }

        Ok(Self {
            iseq,
            builder,
            blocks,
            th,
            cfp,
        })
    }

    /// Compile the whole method and return the finished module.
    fn run(mut self) -> Result<Module> {
        self.compile_block(0, None)?;
        let mut module = self.builder.finish();
        // Leaders that no edge ever reached (dead code behind an
        // unconditional jump) stay empty; drop them so every emitted block
        // carries exactly one terminator.
        if let Some(func) = module.functions.first_mut() {
            func.blocks.retain(|b| b.term.is_some());
        }
        Ok(module)
    }

    /// The block handle for the leader at `offset`.
    fn block_of(&self, offset: u32) -> Result<crate::ir::BlockId> {
        self.blocks
            .get(&offset)
            .map(|e| e.block)
            .ok_or_else(|| CompileError::MalformedBytecode {
                pos: offset,
                reason: "branch lands on a non-leader offset".to_string(),
            })
    }

    /// Absolute target of an offset operand, bounds-checked.
    fn branch_target(&self, pos: u32, op: Opcode, operand: u64) -> Result<u32> {
        let target = pos as i64 + op.len() as i64 + operand as i64;
        if target < 0 || target >= self.iseq.iseq_size as i64 {
            return Err(CompileError::MalformedBytecode {
                pos,
                reason: format!("branch target {target} outside stream"),
            });
        }
        Ok(target as u32)
    }

    /// Route a value leaving `pred` into the φ of the block at `dest`.
    ///
    /// Follows the φ-construction protocol: once the destination's φ exists,
    /// add the incoming directly; before that, deposit a pending pair for
    /// the driver to drain on entry. A `jump` routes eagerly
    /// (`create_if_absent`) so a destination that has no pending pairs yet
    /// still ends up with its φ before the driver reaches it by fall-through.
    fn route_phi(
        &mut self,
        dest: u32,
        value: ValueId,
        pred: crate::ir::BlockId,
        create_if_absent: bool,
    ) -> Result<()> {
        let entry = self
            .blocks
            .get_mut(&dest)
            .ok_or_else(|| CompileError::MalformedBytecode {
                pos: dest,
                reason: "phi routed to a non-leader offset".to_string(),
            })?;
        if entry.phi.is_some() {
            self.builder.add_phi_incoming(entry.block, value, pred)
        } else if !create_if_absent || !entry.pending.is_empty() {
            entry.pending.push((value, pred));
            Ok(())
        } else {
            let phi = self.builder.build_phi(entry.block);
            entry.phi = Some(phi);
            self.builder.add_phi_incoming(entry.block, value, pred)
        }
    }

    /// Compile the basic block whose leader is `start`.
    ///
    /// `inbound` is the continuation stack handed over by a fall-through
    /// or branch predecessor; `None` means no inbound stack state (the entry
    /// block and the jump-with-empty-stack fast path), in which case a fresh
    /// stack of capacity `stack_max` is allocated.
    fn compile_block(&mut self, start: u32, inbound: Option<OperandStack>) -> Result<()> {
        let (block, end) = {
            let entry = self
                .blocks
                .get_mut(&start)
                .ok_or_else(|| CompileError::MalformedBytecode {
                    pos: start,
                    reason: "driver entered a non-leader offset".to_string(),
                })?;
            if entry.compiled {
                return Ok(());
            }
            entry.compiled = true;
            (entry.block, entry.end)
        };
        trace!(start, end, "compiling block");

        self.builder.position_at_end(block);
        let mut stack =
            inbound.unwrap_or_else(|| OperandStack::new(self.iseq.stack_max as usize));

        // Materialize or adopt this block's φ before translating anything,
        // so the entry stack depth matches every predecessor's exit depth.
        let (phi, pending) = {
            let entry = self.blocks.get_mut(&start).expect("leader entry exists");
            (entry.phi, std::mem::take(&mut entry.pending))
        };
        match phi {
            Some(phi) => {
                for (value, pred) in pending {
                    self.builder.add_phi_incoming(block, value, pred)?;
                }
                stack.push(phi)?;
            }
            None if !pending.is_empty() => {
                let phi = self.builder.build_phi(block);
                for (value, pred) in pending {
                    self.builder.add_phi_incoming(block, value, pred)?;
                }
                self.blocks.get_mut(&start).expect("leader entry exists").phi = Some(phi);
                stack.push(phi)?;
            }
            None => {}
        }

        let mut pos = start;
        while pos <= end {
            let op = self.iseq.opcode_at(pos)?;
            let jumped = self.translate_insn(&mut stack, pos, op, block, start)?;
            if jumped {
                return Ok(());
            }
            pos += op.len() as u32;
        }

        // The block ran off its end without a terminator: branch to the next
        // leader, handing any remaining stack value over as a φ-contribution.
        let next = end + 1;
        if next >= self.iseq.iseq_size {
            return Err(CompileError::MalformedBytecode {
                pos: end,
                reason: "instruction stream ends without a terminator".to_string(),
            });
        }
        let next_block = self.block_of(next)?;
        if !stack.is_empty() {
            let value = stack.pop()?;
            self.route_phi(next, value, block, false)?;
        }
        self.builder.build_br(next_block);
        self.compile_block(next, Some(stack))
    }
}

/// Compile one method body into a module containing a single function named
/// `funcname`, plus declarations for every runtime helper it references.
pub(crate) fn compile(
    iseq: &InstrSeq,
    funcname: &str,
    options: &CompileOptions,
) -> Result<Module> {
    if options.dump_insns {
        eprintln!("{}", iseq.disasm());
    }
    let module = Compiler::new(iseq, funcname)?.run()?;
    debug!(
        functions = module.functions.len(),
        name = funcname,
        "method compiled"
    );
    Ok(module)
}
