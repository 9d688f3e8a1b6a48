//! Positioned IR builder.
//!
//! Owns the module and a cursor (one function, one block) and emits
//! instructions at the cursor, the way a native IR builder is positioned at
//! the end of a basic block. φ-nodes are the one exception: they are always
//! inserted at the head of their block, which may differ from the cursor
//! when a predecessor routes a value into a block that has not been entered
//! yet.

use super::types::*;
use crate::error::{CompileError, Result};

/// Builder state for one function under construction.
pub struct Builder {
    module: Module,
    func: FuncId,
    cursor: Option<BlockId>,
    next_block_id: u32,
}

impl Builder {
    /// Start building `func` inside `module`.
    pub fn new(module: Module, func: FuncId) -> Self {
        Self {
            module,
            func,
            cursor: None,
            next_block_id: 0,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    /// Finish building and hand the module back.
    pub fn finish(self) -> Module {
        self.module
    }

    /// Parameter value of the function under construction.
    pub fn param(&self, idx: usize) -> Option<ValueId> {
        self.func().params.get(idx).copied()
    }

    /// Append a new empty block to the function.
    pub fn append_block(&mut self, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.func_mut().blocks.push(Block {
            id,
            label: label.into(),
            instrs: Vec::new(),
            term: None,
        });
        id
    }

    /// Move the cursor to the end of `block`.
    pub fn position_at_end(&mut self, block: BlockId) {
        self.cursor = Some(block);
    }

    /// Emit a 64-bit constant at the cursor.
    pub fn const_i64(&mut self, value: i64) -> ValueId {
        self.emit(InstrKind::Const(value))
    }

    /// Emit a bitwise AND at the cursor.
    pub fn build_and(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.emit(InstrKind::And { lhs, rhs })
    }

    /// Emit an integer inequality compare at the cursor.
    pub fn build_icmp_ne(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.emit(InstrKind::IcmpNe { lhs, rhs })
    }

    /// Emit a call at the cursor. Returns the result value, or `None` for
    /// void helpers. The argument count is checked against the callee's
    /// declared signature.
    pub fn build_call(&mut self, callee: FuncId, args: Vec<ValueId>) -> Result<Option<ValueId>> {
        let (ret, fixed, variadic, name) = {
            let callee = self
                .module
                .function(callee)
                .ok_or_else(|| CompileError::UnknownHelper {
                    name: format!("function #{}", callee.0),
                })?;
            (
                callee.sig.ret,
                callee.sig.params.len(),
                callee.sig.variadic,
                callee.name.clone(),
            )
        };
        let arity_ok = if variadic {
            args.len() >= fixed
        } else {
            args.len() == fixed
        };
        if !arity_ok {
            return Err(CompileError::TypeMismatch {
                name,
                expected: fixed,
                got: args.len(),
            });
        }
        let dest = match ret {
            Ty::Void => None,
            Ty::I32 | Ty::I64 => Some(self.func_mut().new_value()),
        };
        self.push_instr(Instr {
            dest,
            kind: InstrKind::Call { callee, args },
        });
        Ok(dest)
    }

    /// Create an empty φ-node at the head of `block` (not at the cursor).
    pub fn build_phi(&mut self, block: BlockId) -> ValueId {
        let dest = self.func_mut().new_value();
        let func = self.func_mut();
        if let Some(b) = func.block_mut(block) {
            b.instrs.insert(
                0,
                Instr {
                    dest: Some(dest),
                    kind: InstrKind::Phi {
                        incomings: Vec::new(),
                    },
                },
            );
        }
        dest
    }

    /// Add an incoming edge to the φ-node at the head of `block`.
    pub fn add_phi_incoming(
        &mut self,
        block: BlockId,
        value: ValueId,
        pred: BlockId,
    ) -> Result<()> {
        let label = self
            .func()
            .block(block)
            .map(|b| b.label.clone())
            .unwrap_or_else(|| "?".to_string());
        let head = self
            .func_mut()
            .block_mut(block)
            .and_then(|b| b.instrs.first_mut());
        match head {
            Some(Instr {
                kind: InstrKind::Phi { incomings },
                ..
            }) => {
                incomings.push((value, pred));
                Ok(())
            }
            _ => Err(CompileError::InconsistentJoin {
                label,
                values: 1,
                blocks: 0,
            }),
        }
    }

    /// Terminate the current block with a return.
    pub fn build_ret(&mut self, value: ValueId) {
        self.terminate(Terminator::Ret(value));
    }

    /// Terminate the current block with an unconditional branch.
    pub fn build_br(&mut self, dest: BlockId) {
        self.terminate(Terminator::Br(dest));
    }

    /// Terminate the current block with a conditional branch.
    pub fn build_cond_br(&mut self, cond: ValueId, then_dest: BlockId, else_dest: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            then_dest,
            else_dest,
        });
    }

    fn emit(&mut self, kind: InstrKind) -> ValueId {
        let dest = self.func_mut().new_value();
        self.push_instr(Instr {
            dest: Some(dest),
            kind,
        });
        dest
    }

    fn push_instr(&mut self, instr: Instr) {
        let cursor = self.cursor;
        if let Some(block) = cursor.and_then(|c| self.func_mut().block_mut(c)) {
            block.instrs.push(instr);
        }
    }

    fn terminate(&mut self, term: Terminator) {
        let cursor = self.cursor;
        if let Some(block) = cursor.and_then(|c| self.func_mut().block_mut(c)) {
            block.term = Some(term);
        }
    }

    fn func(&self) -> &Function {
        self.module
            .function(self.func)
            .expect("builder function exists")
    }

    fn func_mut(&mut self) -> &mut Function {
        self.module
            .function_mut(self.func)
            .expect("builder function exists")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_builder() -> Builder {
        let mut module = Module::new("test");
        let func = module.define_function(
            "method",
            FuncSig {
                ret: Ty::I64,
                params: vec![Ty::I64, Ty::I64],
                variadic: false,
            },
        );
        Builder::new(module, func)
    }

    #[test]
    fn test_emit_into_positioned_block() {
        let mut builder = new_builder();
        let entry = builder.append_block("label_0");
        builder.position_at_end(entry);
        let c = builder.const_i64(8);
        builder.build_ret(c);

        let module = builder.finish();
        let func = module.function(FuncId(0)).unwrap();
        let block = func.block(entry).unwrap();
        assert_eq!(block.instrs.len(), 1);
        assert!(matches!(block.term, Some(Terminator::Ret(v)) if v == c));
    }

    #[test]
    fn test_params_come_before_locals() {
        let builder = new_builder();
        assert_eq!(builder.param(0), Some(ValueId(0)));
        assert_eq!(builder.param(1), Some(ValueId(1)));
        assert_eq!(builder.param(2), None);
    }

    #[test]
    fn test_phi_inserted_at_block_head() {
        let mut builder = new_builder();
        let b0 = builder.append_block("label_0");
        let b1 = builder.append_block("label_4");
        builder.position_at_end(b1);
        let c = builder.const_i64(3);

        // φ created while the cursor is elsewhere still lands at b1's head.
        builder.position_at_end(b0);
        let phi = builder.build_phi(b1);
        builder.add_phi_incoming(b1, c, b0).unwrap();

        let module = builder.finish();
        let func = module.function(FuncId(0)).unwrap();
        let head = &func.block(b1).unwrap().instrs[0];
        assert_eq!(head.dest, Some(phi));
        assert!(matches!(
            &head.kind,
            InstrKind::Phi { incomings } if incomings.len() == 1
        ));
    }

    #[test]
    fn test_add_incoming_requires_phi_head() {
        let mut builder = new_builder();
        let b0 = builder.append_block("label_0");
        builder.position_at_end(b0);
        let c = builder.const_i64(1);
        assert!(matches!(
            builder.add_phi_incoming(b0, c, b0),
            Err(CompileError::InconsistentJoin { .. })
        ));
    }

    #[test]
    fn test_call_arity_checked() {
        let mut builder = new_builder();
        let entry = builder.append_block("label_0");
        builder.position_at_end(entry);
        let helper = builder.module_mut().declare_function(
            "opt_plus",
            FuncSig {
                ret: Ty::I64,
                params: vec![Ty::I64, Ty::I64],
                variadic: false,
            },
        );
        let a = builder.const_i64(1);
        assert!(matches!(
            builder.build_call(helper, vec![a]),
            Err(CompileError::TypeMismatch { expected: 2, got: 1, .. })
        ));
        let b = builder.const_i64(2);
        let dest = builder.build_call(helper, vec![a, b]).unwrap();
        assert!(dest.is_some());
    }

    #[test]
    fn test_variadic_call_allows_trailing_args() {
        let mut builder = new_builder();
        let entry = builder.append_block("label_0");
        builder.position_at_end(entry);
        let helper = builder.module_mut().declare_function(
            "rb_funcall",
            FuncSig {
                ret: Ty::I64,
                params: vec![Ty::I64, Ty::I64, Ty::I32],
                variadic: true,
            },
        );
        let a = builder.const_i64(1);
        assert!(builder.build_call(helper, vec![a, a]).is_err());
        assert!(builder.build_call(helper, vec![a, a, a]).is_ok());
        assert!(builder.build_call(helper, vec![a, a, a, a, a]).is_ok());
    }

    #[test]
    fn test_void_call_has_no_dest() {
        let mut builder = new_builder();
        let entry = builder.append_block("label_0");
        builder.position_at_end(entry);
        let helper = builder.module_mut().declare_function(
            "setglobal",
            FuncSig {
                ret: Ty::Void,
                params: vec![Ty::I64, Ty::I64],
                variadic: false,
            },
        );
        let a = builder.const_i64(1);
        let dest = builder.build_call(helper, vec![a, a]).unwrap();
        assert!(dest.is_none());
    }
}
