//! Instruction translation.
//!
//! One `translate_insn` call maps one instruction to IR operations over the
//! abstract stack. The return value is the "jumped" flag: `true` means the
//! instruction terminated the block from within (return, throw, or a branch
//! that recursed into its successors) and the driver must stop.

use tracing::debug;

use super::{get_function, stack::OperandStack, Compiler};
use crate::error::{CompileError, Result};
use crate::insn::Opcode;
use crate::ir::{BlockId, ValueId};
use crate::value;

/// Pop `n` values and return them in source (push) order.
fn pop_args(stack: &mut OperandStack, n: usize) -> Result<Vec<ValueId>> {
    let mut args = Vec::with_capacity(n);
    for _ in 0..n {
        args.push(stack.pop()?);
    }
    args.reverse();
    Ok(args)
}

impl Compiler<'_> {
    /// Translate the instruction at `pos` inside the block that starts at
    /// `start`.
    pub(super) fn translate_insn(
        &mut self,
        stack: &mut OperandStack,
        pos: u32,
        op: Opcode,
        block: BlockId,
        start: u32,
    ) -> Result<bool> {
        let iseq = self.iseq;
        let operands = iseq.operands(pos, op)?;
        let (th, cfp) = (self.th, self.cfp);

        match op {
            // ─── Literals and self ─────────────────────────────────────
            Opcode::Putnil => {
                let v = self.builder.const_i64(value::QNIL);
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Putobject | Opcode::Putiseq => {
                let v = self.builder.const_i64(operands[0] as i64);
                stack.push(v)?;
                Ok(false)
            }
            Opcode::PutobjectInt2Fix0 => {
                let v = self.builder.const_i64(value::int2fix(0));
                stack.push(v)?;
                Ok(false)
            }
            Opcode::PutobjectInt2Fix1 => {
                let v = self.builder.const_i64(value::int2fix(1));
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Putself => {
                let v = self.call_value("self_from_cfp", vec![cfp])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Putspecialobject => {
                let vt = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("putspecialobject", vec![vt])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Putstring => {
                let str_c = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("putstring", vec![str_c])?;
                stack.push(v)?;
                Ok(false)
            }

            // ─── Variable access ───────────────────────────────────────
            Opcode::Getglobal => {
                let entry = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("getglobal", vec![entry])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Setglobal => {
                let val = stack.pop()?;
                let entry = self.builder.const_i64(operands[0] as i64);
                self.call_void("setglobal", vec![entry, val])?;
                Ok(false)
            }
            Opcode::Getinstancevariable => {
                let slf = self.call_value("self_from_cfp", vec![cfp])?;
                let id = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("getinstancevariable", vec![slf, id])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Setinstancevariable => {
                let val = stack.pop()?;
                let slf = self.call_value("self_from_cfp", vec![cfp])?;
                let id = self.builder.const_i64(operands[0] as i64);
                self.call_void("setinstancevariable", vec![slf, id, val])?;
                Ok(false)
            }
            Opcode::Getclassvariable => {
                let id = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("getclassvariable", vec![cfp, id])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Setclassvariable => {
                let val = stack.pop()?;
                let id = self.builder.const_i64(operands[0] as i64);
                self.call_void("setclassvariable", vec![cfp, id, val])?;
                Ok(false)
            }
            Opcode::Getconstant => {
                let klass = stack.pop()?;
                let id = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("getconstant", vec![th, klass, id])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Setconstant => {
                let cbase = stack.pop()?;
                let val = stack.pop()?;
                let id = self.builder.const_i64(operands[0] as i64);
                self.call_void("setconstant", vec![cbase, id, val])?;
                Ok(false)
            }
            Opcode::Getspecial => {
                let key = self.builder.const_i64(operands[0] as i64);
                let ty = self.builder.const_i64(operands[1] as i64);
                let v = self.call_value("getspecial", vec![key, ty])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Setspecial => {
                let obj = stack.pop()?;
                let key = self.builder.const_i64(operands[0] as i64);
                self.call_void("setspecial", vec![key, obj])?;
                Ok(false)
            }
            Opcode::GetlocalWc0 => {
                let idx = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("getlocal_level0", vec![cfp, idx])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::SetlocalWc0 => {
                let val = stack.pop()?;
                let idx = self.builder.const_i64(operands[0] as i64);
                self.call_void("setlocal_level0", vec![cfp, idx, val])?;
                Ok(false)
            }
            // Outer-scope access needs a helper contract the host has not
            // fixed yet; reject instead of guessing a lowering.
            Opcode::GetlocalWc1 | Opcode::SetlocalWc1 => Err(self.unsupported(op, pos)),

            // ─── Pure stack manipulation ───────────────────────────────
            Opcode::Nop => Ok(false),
            Opcode::Pop => {
                stack.pop()?;
                Ok(false)
            }
            Opcode::Dup => {
                let v = stack.topn(0)?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Dupn => {
                let n = operands[0] as usize;
                let mut vals = Vec::with_capacity(n);
                for k in (0..n).rev() {
                    vals.push(stack.topn(k)?);
                }
                for v in vals {
                    stack.push(v)?;
                }
                Ok(false)
            }
            Opcode::Swap => {
                let top = stack.pop()?;
                let below = stack.pop()?;
                stack.push(top)?;
                stack.push(below)?;
                Ok(false)
            }
            Opcode::Topn => {
                let v = stack.topn(operands[0] as usize)?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Setn => {
                let top = stack.topn(0)?;
                stack.set_topn(operands[0] as usize, top)?;
                Ok(false)
            }
            Opcode::Adjuststack => {
                for _ in 0..operands[0] {
                    stack.pop()?;
                }
                Ok(false)
            }

            // ─── Composite constructors ────────────────────────────────
            Opcode::Newarray => {
                let n = operands[0];
                let elems = pop_args(stack, n as usize)?;
                let n_c = self.builder.const_i64(n as i64);
                let mut args = vec![n_c];
                args.extend(elems);
                let v = self.call_value("newarray", args)?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Duparray => {
                let ary = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("duparray", vec![ary])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Concatarray => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                let v = self.call_value("concatarray", vec![lhs, rhs])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Splatarray => {
                let ary = stack.pop()?;
                let flag = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("splatarray", vec![ary, flag])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Newhash => {
                // Key/value words leave the stack in pop order but must
                // reach the helper in source order to keep key precedence.
                let n = operands[0];
                let words = pop_args(stack, n as usize)?;
                let n_c = self.builder.const_i64(n as i64);
                let mut args = vec![n_c];
                args.extend(words);
                let v = self.call_value("newhash", args)?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Newrange => {
                let high = stack.pop()?;
                let low = stack.pop()?;
                let flag = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("newrange", vec![low, high, flag])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Toregexp => {
                let opt = operands[0];
                let cnt = operands[1];
                let parts = pop_args(stack, cnt as usize)?;
                let opt_c = self.builder.const_i64(opt as i64);
                let cnt_c = self.builder.const_i64(cnt as i64);
                let mut args = vec![opt_c, cnt_c];
                args.extend(parts);
                let v = self.call_value("toregexp", args)?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Concatstrings => {
                let n = operands[0];
                let parts = pop_args(stack, n as usize)?;
                let n_c = self.builder.const_i64(n as i64);
                let mut args = vec![n_c];
                args.extend(parts);
                let v = self.call_value("concatstrings", args)?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Tostring => {
                let val = stack.pop()?;
                let v = self.call_value("tostring", vec![val])?;
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Freezestring => {
                let str_v = stack.pop()?;
                let debug_info = self.builder.const_i64(operands[0] as i64);
                let v = self.call_value("freezestring", vec![str_v, debug_info])?;
                stack.push(v)?;
                Ok(false)
            }

            // ─── Introspection ─────────────────────────────────────────
            Opcode::Defined => {
                let v = stack.pop()?;
                let op_type = self.builder.const_i64(operands[0] as i64);
                let obj = self.builder.const_i64(operands[1] as i64);
                let needstr = self.builder.const_i64(operands[2] as i64);
                let r = self.call_value("defined", vec![op_type, obj, needstr, v])?;
                stack.push(r)?;
                Ok(false)
            }
            Opcode::Checkmatch => {
                let pattern = stack.pop()?;
                let target = stack.pop()?;
                let flag = self.builder.const_i64(operands[0] as i64);
                let r = self.call_value("checkmatch", vec![target, pattern, flag])?;
                stack.push(r)?;
                Ok(false)
            }
            Opcode::Checkkeyword => {
                let bits = self.builder.const_i64(operands[0] as i64);
                let idx = self.builder.const_i64(operands[1] as i64);
                let r = self.call_value("checkkeyword", vec![cfp, bits, idx])?;
                stack.push(r)?;
                Ok(false)
            }

            // ─── Method dispatch ───────────────────────────────────────
            Opcode::Send | Opcode::OptSendWithoutBlock | Opcode::Invokesuper => {
                let ci_word = operands[0];
                let cc_word = operands[1];
                let blockiseq = operands.get(2).copied().unwrap_or(0);
                let argc = iseq.call_info(ci_word)?.orig_argc;

                let mut argv = pop_args(stack, argc as usize)?;
                let recv = stack.pop()?;
                let stack_size = stack.len();

                let ci_c = self.builder.const_i64(ci_word as i64);
                let cc_c = self.builder.const_i64(cc_word as i64);
                let iseq_c = self.builder.const_i64(blockiseq as i64);
                let size_c = self.builder.const_i64(stack_size as i64);
                let mut args = vec![th, cfp, ci_c, cc_c, iseq_c, size_c, recv];
                args.append(&mut argv);
                let r = self.call_value(op.name(), args)?;
                stack.push(r)?;
                Ok(false)
            }
            Opcode::OptPlus | Opcode::OptMinus | Opcode::OptLt => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                let r = self.call_value(op.name(), vec![lhs, rhs])?;
                stack.push(r)?;
                Ok(false)
            }
            Opcode::OptMult
            | Opcode::OptDiv
            | Opcode::OptMod
            | Opcode::OptEq
            | Opcode::OptNeq
            | Opcode::OptLe
            | Opcode::OptGt
            | Opcode::OptGe
            | Opcode::OptLtlt
            | Opcode::OptAref
            | Opcode::OptAset
            | Opcode::OptLength
            | Opcode::OptSize
            | Opcode::OptEmptyP
            | Opcode::OptSucc
            | Opcode::OptNot
            | Opcode::OptRegexpmatch2 => {
                let ci = iseq.call_info(operands[0])?;
                let (mid, argc) = (ci.mid, ci.orig_argc);
                let r = self.compile_funcall(stack, mid, argc)?;
                stack.push(r)?;
                Ok(false)
            }
            Opcode::OptArefWith => {
                // The key string is an operand, not a stack value, so the
                // dispatch is synthesized directly instead of going through
                // compile_funcall (which would pop an argument).
                let mid = iseq.call_info(operands[0])?.mid;
                let recv = stack.pop()?;
                let mid_c = self.builder.const_i64(mid as i64);
                let one = self.builder.const_i64(1);
                let key = self.builder.const_i64(operands[2] as i64);
                let r = self.call_value("rb_funcall", vec![recv, mid_c, one, key])?;
                stack.push(r)?;
                Ok(false)
            }
            Opcode::OptAsetWith => {
                let mid = iseq.call_info(operands[0])?.mid;
                let val = stack.pop()?;
                let recv = stack.pop()?;
                let mid_c = self.builder.const_i64(mid as i64);
                let two = self.builder.const_i64(2);
                let key = self.builder.const_i64(operands[2] as i64);
                let r = self.call_value("rb_funcall", vec![recv, mid_c, two, key, val])?;
                stack.push(r)?;
                Ok(false)
            }

            // ─── Control flow ──────────────────────────────────────────
            Opcode::Leave => {
                if stack.len() != 1 {
                    return Err(CompileError::StackShapeAtLeave {
                        depth: stack.len(),
                        pos,
                    });
                }
                let result = stack.pop()?;
                self.call_value("push_result", vec![cfp, result])?;
                self.builder.build_ret(cfp);
                Ok(true)
            }
            Opcode::Throw => {
                let state = self.builder.const_i64(operands[0] as i64);
                let val = stack.pop()?;
                self.call_value("insn_throw", vec![th, cfp, state, val])?;
                let zero = self.builder.const_i64(0);
                self.builder.build_ret(zero);
                Ok(true)
            }
            Opcode::Jump => {
                let dest = self.branch_target(pos, op, operands[0])?;
                let dest_block = self.block_of(dest)?;
                if stack.is_empty() {
                    self.builder.build_br(dest_block);
                    self.compile_block(dest, None)?;
                } else {
                    let value = stack.pop()?;
                    if !stack.is_empty() {
                        return Err(CompileError::StackShapeAtReturn {
                            depth: stack.len() + 1,
                            start,
                        });
                    }
                    self.route_phi(dest, value, block, true)?;
                    self.builder.build_br(dest_block);
                    // No recursion here: the driver chain reaches the
                    // destination through another block's fall-through.
                }
                Ok(true)
            }
            Opcode::Branchif | Opcode::Branchunless => {
                let branch_dest = self.branch_target(pos, op, operands[0])?;
                let fallthrough = pos + op.len() as u32;
                let branch_block = self.block_of(branch_dest)?;
                let fall_block = self.block_of(fallthrough)?;

                let cond = stack.pop()?;
                let truthy = self.build_rtest(cond);
                if op == Opcode::Branchif {
                    self.builder.build_cond_br(truthy, branch_block, fall_block);
                } else {
                    self.builder.build_cond_br(truthy, fall_block, branch_block);
                }

                if !stack.is_empty() {
                    let value = stack.pop()?;
                    if !stack.is_empty() {
                        return Err(CompileError::StackShapeAtReturn {
                            depth: stack.len() + 1,
                            start,
                        });
                    }
                    self.route_phi(fallthrough, value, block, false)?;
                    // Backward jumps are loop back-edges and do not
                    // originate φ-contributions.
                    if branch_dest > pos {
                        self.route_phi(branch_dest, value, block, false)?;
                    }
                }
                self.compile_block(fallthrough, Some(stack.clone()))?;
                self.compile_block(branch_dest, Some(stack.clone()))?;
                Ok(true)
            }
            Opcode::Branchnil => {
                let branch_dest = self.branch_target(pos, op, operands[0])?;
                let fallthrough = pos + op.len() as u32;
                let branch_block = self.block_of(branch_dest)?;
                let fall_block = self.block_of(fallthrough)?;

                let cond = stack.pop()?;
                // The skip edge can merge only the synthesized nil with the
                // fall-through's single value.
                if stack.len() > 1 {
                    return Err(CompileError::StackShapeAtReturn {
                        depth: stack.len(),
                        start,
                    });
                }
                let qnil = self.builder.const_i64(value::QNIL);
                let not_nil = self.builder.build_icmp_ne(cond, qnil);
                self.builder.build_cond_br(not_nil, fall_block, branch_block);

                self.route_phi(branch_dest, qnil, block, false)?;
                self.compile_block(fallthrough, Some(stack.clone()))?;
                Ok(true)
            }
            Opcode::OptCaseDispatch => {
                // Dispatch lowering is stubbed: every target is already a
                // leader, so dropping the key and falling through keeps the
                // graph structurally intact.
                stack.pop()?;
                Ok(false)
            }

            // ─── Instrumentation ───────────────────────────────────────
            Opcode::Trace => {
                let flag = self.builder.const_i64(operands[0] as i64);
                self.call_void("trace", vec![th, cfp, flag])?;
                Ok(false)
            }
            Opcode::Getinlinecache => {
                let v = self.builder.const_i64(value::QNIL);
                stack.push(v)?;
                Ok(false)
            }
            Opcode::Setinlinecache => Ok(false),
        }
    }

    /// Lower the host truthiness predicate: everything but `false` and `nil`
    /// is true, and those two differ from all other words in the bits kept
    /// by `!QNIL`, so RTEST is a single mask-and-compare.
    fn build_rtest(&mut self, cond: ValueId) -> ValueId {
        let mask = self.builder.const_i64(!value::QNIL);
        let masked = self.builder.build_and(cond, mask);
        let zero = self.builder.const_i64(0);
        self.builder.build_icmp_ne(masked, zero)
    }

    /// Generic dispatch through `rb_funcall`: pops argc arguments and the
    /// receiver, and returns the call result.
    fn compile_funcall(
        &mut self,
        stack: &mut OperandStack,
        mid: u64,
        argc: u32,
    ) -> Result<ValueId> {
        let tail = pop_args(stack, argc as usize)?;
        let recv = stack.pop()?;
        let mid_c = self.builder.const_i64(mid as i64);
        let argc_c = self.builder.const_i64(argc as i64);
        let mut args = vec![recv, mid_c, argc_c];
        args.extend(tail);
        self.call_value("rb_funcall", args)
    }

    /// Call a helper that produces a value.
    fn call_value(&mut self, name: &str, args: Vec<ValueId>) -> Result<ValueId> {
        let func = get_function(self.builder.module_mut(), name)?;
        self.builder
            .build_call(func, args)?
            .ok_or_else(|| CompileError::TypeMismatch {
                name: name.to_string(),
                expected: 1,
                got: 0,
            })
    }

    /// Call a helper for effect only.
    fn call_void(&mut self, name: &str, args: Vec<ValueId>) -> Result<()> {
        let func = get_function(self.builder.module_mut(), name)?;
        self.builder.build_call(func, args)?;
        Ok(())
    }

    fn unsupported(&self, op: Opcode, pos: u32) -> CompileError {
        debug!("unhandled instruction, disassembly:\n{}", self.iseq.disasm());
        CompileError::UnsupportedOpcode {
            name: op.name(),
            pos,
        }
    }
}
