//! Instruction metadata tables.
//!
//! The host VM stores each instruction as an opcode handle followed by its
//! operand words. This module is the read-only metadata the compiler needs to
//! walk that encoding: opcode names, instruction lengths, and the kind of
//! each operand word. It deliberately contains no semantics — the translator
//! owns those.

use std::fmt;

/// Kind of a single operand word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Plain numeric literal (slot index, flag, count, throw state, ...).
    Num,
    /// Relative branch offset; the absolute target is
    /// `insn_pos + insn_len + operand`.
    Offset,
    /// Opaque host object reference (literal, id, global entry, ...).
    Value,
    /// Call-info word; resolvable to (method id, argc) via the iseq's
    /// call-info table and forwarded verbatim to dispatch helpers.
    CallInfo,
    /// Inline/call cache word; forwarded verbatim, never inspected.
    InlineCache,
    /// Reference to a nested instruction sequence.
    IseqRef,
}

impl OperandKind {
    /// One-letter code used by the disassembler's kind column.
    pub fn code(self) -> char {
        match self {
            OperandKind::Num => 'N',
            OperandKind::Offset => 'O',
            OperandKind::Value => 'V',
            OperandKind::CallInfo => 'C',
            OperandKind::InlineCache => 'K',
            OperandKind::IseqRef => 'S',
        }
    }
}

/// Opcodes of the host VM's instruction set.
///
/// The encoded stream stores opcode handles; [`Opcode::from_addr`] resolves a
/// handle back to the opcode. In this front-end a handle is simply the index
/// of the opcode in [`Opcode::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    GetlocalWc0,
    SetlocalWc0,
    GetlocalWc1,
    SetlocalWc1,
    Getspecial,
    Setspecial,
    Getinstancevariable,
    Setinstancevariable,
    Getclassvariable,
    Setclassvariable,
    Getconstant,
    Setconstant,
    Getglobal,
    Setglobal,
    Putnil,
    Putself,
    Putobject,
    Putspecialobject,
    Putiseq,
    Putstring,
    Concatstrings,
    Tostring,
    Freezestring,
    Toregexp,
    Newarray,
    Duparray,
    Concatarray,
    Splatarray,
    Newhash,
    Newrange,
    Pop,
    Dup,
    Dupn,
    Swap,
    Topn,
    Setn,
    Adjuststack,
    Defined,
    Checkmatch,
    Checkkeyword,
    Trace,
    Send,
    OptSendWithoutBlock,
    Invokesuper,
    Leave,
    Throw,
    Jump,
    Branchif,
    Branchunless,
    Branchnil,
    Getinlinecache,
    Setinlinecache,
    OptCaseDispatch,
    OptPlus,
    OptMinus,
    OptMult,
    OptDiv,
    OptMod,
    OptEq,
    OptNeq,
    OptLt,
    OptLe,
    OptGt,
    OptGe,
    OptLtlt,
    OptAref,
    OptAset,
    OptAsetWith,
    OptArefWith,
    OptLength,
    OptSize,
    OptEmptyP,
    OptSucc,
    OptNot,
    OptRegexpmatch2,
    PutobjectInt2Fix0,
    PutobjectInt2Fix1,
}

use OperandKind::{CallInfo, InlineCache, IseqRef, Num, Offset, Value};

impl Opcode {
    /// Every opcode, in handle-encoding order.
    pub const ALL: &'static [Opcode] = &[
        Opcode::Nop,
        Opcode::GetlocalWc0,
        Opcode::SetlocalWc0,
        Opcode::GetlocalWc1,
        Opcode::SetlocalWc1,
        Opcode::Getspecial,
        Opcode::Setspecial,
        Opcode::Getinstancevariable,
        Opcode::Setinstancevariable,
        Opcode::Getclassvariable,
        Opcode::Setclassvariable,
        Opcode::Getconstant,
        Opcode::Setconstant,
        Opcode::Getglobal,
        Opcode::Setglobal,
        Opcode::Putnil,
        Opcode::Putself,
        Opcode::Putobject,
        Opcode::Putspecialobject,
        Opcode::Putiseq,
        Opcode::Putstring,
        Opcode::Concatstrings,
        Opcode::Tostring,
        Opcode::Freezestring,
        Opcode::Toregexp,
        Opcode::Newarray,
        Opcode::Duparray,
        Opcode::Concatarray,
        Opcode::Splatarray,
        Opcode::Newhash,
        Opcode::Newrange,
        Opcode::Pop,
        Opcode::Dup,
        Opcode::Dupn,
        Opcode::Swap,
        Opcode::Topn,
        Opcode::Setn,
        Opcode::Adjuststack,
        Opcode::Defined,
        Opcode::Checkmatch,
        Opcode::Checkkeyword,
        Opcode::Trace,
        Opcode::Send,
        Opcode::OptSendWithoutBlock,
        Opcode::Invokesuper,
        Opcode::Leave,
        Opcode::Throw,
        Opcode::Jump,
        Opcode::Branchif,
        Opcode::Branchunless,
        Opcode::Branchnil,
        Opcode::Getinlinecache,
        Opcode::Setinlinecache,
        Opcode::OptCaseDispatch,
        Opcode::OptPlus,
        Opcode::OptMinus,
        Opcode::OptMult,
        Opcode::OptDiv,
        Opcode::OptMod,
        Opcode::OptEq,
        Opcode::OptNeq,
        Opcode::OptLt,
        Opcode::OptLe,
        Opcode::OptGt,
        Opcode::OptGe,
        Opcode::OptLtlt,
        Opcode::OptAref,
        Opcode::OptAset,
        Opcode::OptAsetWith,
        Opcode::OptArefWith,
        Opcode::OptLength,
        Opcode::OptSize,
        Opcode::OptEmptyP,
        Opcode::OptSucc,
        Opcode::OptNot,
        Opcode::OptRegexpmatch2,
        Opcode::PutobjectInt2Fix0,
        Opcode::PutobjectInt2Fix1,
    ];

    /// Resolve an encoded opcode handle back to its opcode.
    pub fn from_addr(addr: u64) -> Option<Opcode> {
        usize::try_from(addr)
            .ok()
            .and_then(|idx| Self::ALL.get(idx))
            .copied()
    }

    /// The opcode handle stored in the encoded stream.
    pub fn addr(self) -> u64 {
        // ALL is small; a linear scan keeps the two directions in one table.
        Self::ALL.iter().position(|op| *op == self).unwrap_or(0) as u64
    }

    /// Instruction length in words, operands included.
    pub fn len(self) -> usize {
        1 + self.operand_kinds().len()
    }

    /// Kinds of this opcode's operand words, in encoding order.
    pub fn operand_kinds(self) -> &'static [OperandKind] {
        match self {
            Opcode::Nop
            | Opcode::Putnil
            | Opcode::Putself
            | Opcode::Tostring
            | Opcode::Concatarray
            | Opcode::Pop
            | Opcode::Dup
            | Opcode::Swap
            | Opcode::Leave
            | Opcode::PutobjectInt2Fix0
            | Opcode::PutobjectInt2Fix1 => &[],

            Opcode::GetlocalWc0
            | Opcode::SetlocalWc0
            | Opcode::GetlocalWc1
            | Opcode::SetlocalWc1
            | Opcode::Setspecial
            | Opcode::Putspecialobject
            | Opcode::Concatstrings
            | Opcode::Newarray
            | Opcode::Newhash
            | Opcode::Newrange
            | Opcode::Dupn
            | Opcode::Topn
            | Opcode::Setn
            | Opcode::Adjuststack
            | Opcode::Checkmatch
            | Opcode::Trace
            | Opcode::Throw => &[Num],

            Opcode::Getspecial | Opcode::Checkkeyword => &[Num, Num],

            Opcode::Getclassvariable
            | Opcode::Setclassvariable
            | Opcode::Getconstant
            | Opcode::Setconstant
            | Opcode::Getglobal
            | Opcode::Setglobal
            | Opcode::Putobject
            | Opcode::Putstring
            | Opcode::Freezestring
            | Opcode::Duparray
            | Opcode::Splatarray => &[Value],

            Opcode::Getinstancevariable | Opcode::Setinstancevariable => &[Value, InlineCache],

            Opcode::Toregexp => &[Num, Num],

            Opcode::Defined => &[Num, Value, Value],

            Opcode::Putiseq => &[IseqRef],

            Opcode::Send | Opcode::Invokesuper => &[CallInfo, InlineCache, IseqRef],

            Opcode::OptSendWithoutBlock
            | Opcode::OptPlus
            | Opcode::OptMinus
            | Opcode::OptMult
            | Opcode::OptDiv
            | Opcode::OptMod
            | Opcode::OptEq
            | Opcode::OptNeq
            | Opcode::OptLt
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
            | Opcode::OptRegexpmatch2 => &[CallInfo, InlineCache],

            Opcode::OptAsetWith | Opcode::OptArefWith => &[CallInfo, InlineCache, Value],

            Opcode::Jump | Opcode::Branchif | Opcode::Branchunless | Opcode::Branchnil => &[Offset],

            Opcode::Getinlinecache => &[Offset, InlineCache],
            Opcode::Setinlinecache => &[InlineCache],

            Opcode::OptCaseDispatch => &[Value, Offset],
        }
    }

    /// Name as the host VM spells it.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::GetlocalWc0 => "getlocal_OP__WC__0",
            Opcode::SetlocalWc0 => "setlocal_OP__WC__0",
            Opcode::GetlocalWc1 => "getlocal_OP__WC__1",
            Opcode::SetlocalWc1 => "setlocal_OP__WC__1",
            Opcode::Getspecial => "getspecial",
            Opcode::Setspecial => "setspecial",
            Opcode::Getinstancevariable => "getinstancevariable",
            Opcode::Setinstancevariable => "setinstancevariable",
            Opcode::Getclassvariable => "getclassvariable",
            Opcode::Setclassvariable => "setclassvariable",
            Opcode::Getconstant => "getconstant",
            Opcode::Setconstant => "setconstant",
            Opcode::Getglobal => "getglobal",
            Opcode::Setglobal => "setglobal",
            Opcode::Putnil => "putnil",
            Opcode::Putself => "putself",
            Opcode::Putobject => "putobject",
            Opcode::Putspecialobject => "putspecialobject",
            Opcode::Putiseq => "putiseq",
            Opcode::Putstring => "putstring",
            Opcode::Concatstrings => "concatstrings",
            Opcode::Tostring => "tostring",
            Opcode::Freezestring => "freezestring",
            Opcode::Toregexp => "toregexp",
            Opcode::Newarray => "newarray",
            Opcode::Duparray => "duparray",
            Opcode::Concatarray => "concatarray",
            Opcode::Splatarray => "splatarray",
            Opcode::Newhash => "newhash",
            Opcode::Newrange => "newrange",
            Opcode::Pop => "pop",
            Opcode::Dup => "dup",
            Opcode::Dupn => "dupn",
            Opcode::Swap => "swap",
            Opcode::Topn => "topn",
            Opcode::Setn => "setn",
            Opcode::Adjuststack => "adjuststack",
            Opcode::Defined => "defined",
            Opcode::Checkmatch => "checkmatch",
            Opcode::Checkkeyword => "checkkeyword",
            Opcode::Trace => "trace",
            Opcode::Send => "send",
            Opcode::OptSendWithoutBlock => "opt_send_without_block",
            Opcode::Invokesuper => "invokesuper",
            Opcode::Leave => "leave",
            Opcode::Throw => "throw",
            Opcode::Jump => "jump",
            Opcode::Branchif => "branchif",
            Opcode::Branchunless => "branchunless",
            Opcode::Branchnil => "branchnil",
            Opcode::Getinlinecache => "getinlinecache",
            Opcode::Setinlinecache => "setinlinecache",
            Opcode::OptCaseDispatch => "opt_case_dispatch",
            Opcode::OptPlus => "opt_plus",
            Opcode::OptMinus => "opt_minus",
            Opcode::OptMult => "opt_mult",
            Opcode::OptDiv => "opt_div",
            Opcode::OptMod => "opt_mod",
            Opcode::OptEq => "opt_eq",
            Opcode::OptNeq => "opt_neq",
            Opcode::OptLt => "opt_lt",
            Opcode::OptLe => "opt_le",
            Opcode::OptGt => "opt_gt",
            Opcode::OptGe => "opt_ge",
            Opcode::OptLtlt => "opt_ltlt",
            Opcode::OptAref => "opt_aref",
            Opcode::OptAset => "opt_aset",
            Opcode::OptAsetWith => "opt_aset_with",
            Opcode::OptArefWith => "opt_aref_with",
            Opcode::OptLength => "opt_length",
            Opcode::OptSize => "opt_size",
            Opcode::OptEmptyP => "opt_empty_p",
            Opcode::OptSucc => "opt_succ",
            Opcode::OptNot => "opt_not",
            Opcode::OptRegexpmatch2 => "opt_regexpmatch2",
            Opcode::PutobjectInt2Fix0 => "putobject_INT2FIX_0",
            Opcode::PutobjectInt2Fix1 => "putobject_INT2FIX_1",
        }
    }

    /// Whether the offset immediately after this instruction starts a new
    /// basic block (leader rule 3).
    pub fn is_branch_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::Branchif
                | Opcode::Branchunless
                | Opcode::Branchnil
                | Opcode::OptCaseDispatch
                | Opcode::Throw
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_round_trip() {
        for (idx, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(Opcode::from_addr(idx as u64), Some(*op));
            assert_eq!(op.addr(), idx as u64);
        }
        assert_eq!(Opcode::from_addr(Opcode::ALL.len() as u64), None);
        assert_eq!(Opcode::from_addr(u64::MAX), None);
    }

    #[test]
    fn test_lengths_follow_operand_kinds() {
        assert_eq!(Opcode::Putnil.len(), 1);
        assert_eq!(Opcode::Putobject.len(), 2);
        assert_eq!(Opcode::Jump.len(), 2);
        assert_eq!(Opcode::OptPlus.len(), 3);
        assert_eq!(Opcode::Send.len(), 4);
        assert_eq!(Opcode::Defined.len(), 4);
        for op in Opcode::ALL {
            assert_eq!(op.len(), 1 + op.operand_kinds().len());
        }
    }

    #[test]
    fn test_branch_terminators() {
        for op in [
            Opcode::Jump,
            Opcode::Branchif,
            Opcode::Branchunless,
            Opcode::Branchnil,
            Opcode::OptCaseDispatch,
            Opcode::Throw,
        ] {
            assert!(op.is_branch_terminator(), "{op} should start a new block");
        }
        assert!(!Opcode::Leave.is_branch_terminator());
        assert!(!Opcode::OptPlus.is_branch_terminator());
    }

    #[test]
    fn test_offset_operands_only_on_branching_insns() {
        for op in Opcode::ALL {
            let has_offset = op
                .operand_kinds()
                .iter()
                .any(|k| *k == OperandKind::Offset);
            if has_offset {
                assert!(
                    matches!(
                        op,
                        Opcode::Jump
                            | Opcode::Branchif
                            | Opcode::Branchunless
                            | Opcode::Branchnil
                            | Opcode::Getinlinecache
                            | Opcode::OptCaseDispatch
                    ),
                    "unexpected offset operand on {op}"
                );
            }
        }
    }

    #[test]
    fn test_names_match_vm_spelling() {
        assert_eq!(Opcode::GetlocalWc0.name(), "getlocal_OP__WC__0");
        assert_eq!(Opcode::PutobjectInt2Fix1.name(), "putobject_INT2FIX_1");
        assert_eq!(Opcode::OptSendWithoutBlock.name(), "opt_send_without_block");
    }
}
