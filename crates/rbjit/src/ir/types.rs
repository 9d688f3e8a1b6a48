//! IR type definitions.
//!
//! These types represent the SSA-form module the front-end emits: basic
//! blocks holding instructions, explicit value handles (v0, v1, ...) instead
//! of an implicit stack, and named declarations for runtime helpers. The
//! `Display` impl renders the conventional textual form consumed by tests
//! and the CLI.

use std::fmt;

/// Unique identifier for an SSA value within one function.
/// Values are numbered sequentially: v0, v1, v2, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Unique identifier for a basic block within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Index of a function in its module (defined function or helper
/// declaration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

/// IR value types. The host ABI is word-sized: object references, thread and
/// frame pointers are all `I64`; `I32` only appears for native int arguments
/// like argument counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    Void,
    I32,
    I64,
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::I32 => write!(f, "i32"),
            Ty::I64 => write!(f, "i64"),
        }
    }
}

/// Function signature.
#[derive(Debug, Clone)]
pub struct FuncSig {
    pub ret: Ty,
    pub params: Vec<Ty>,
    /// Unlimited trailing arguments after the fixed parameters.
    pub variadic: bool,
}

/// A function: either the single defined function of the compilation or a
/// body-less helper declaration.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub sig: FuncSig,
    /// Pre-allocated parameter values (defined functions only).
    pub params: Vec<ValueId>,
    pub blocks: Vec<Block>,
    pub is_declaration: bool,
    next_value: u32,
}

impl Function {
    /// Allocate the next SSA value handle.
    pub(crate) fn new_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    fn block_label(&self, id: BlockId) -> &str {
        self.block(id).map(|b| b.label.as_str()).unwrap_or("?")
    }
}

/// A basic block: straight-line instructions plus one terminator.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub label: String,
    pub instrs: Vec<Instr>,
    /// `None` only while the block is still under construction.
    pub term: Option<Terminator>,
}

/// A single IR instruction. Every value-producing instruction defines a new
/// SSA value in `dest`.
#[derive(Debug, Clone)]
pub struct Instr {
    pub dest: Option<ValueId>,
    pub kind: InstrKind,
}

#[derive(Debug, Clone)]
pub enum InstrKind {
    /// 64-bit integer constant.
    Const(i64),
    /// Bitwise AND.
    And { lhs: ValueId, rhs: ValueId },
    /// Integer inequality compare (produces a one-bit flag).
    IcmpNe { lhs: ValueId, rhs: ValueId },
    /// Call into a module function (in practice always a helper declaration).
    Call { callee: FuncId, args: Vec<ValueId> },
    /// φ-node: selects a value per predecessor edge. Always the first
    /// instruction of its block.
    Phi { incomings: Vec<(ValueId, BlockId)> },
}

/// How control leaves a basic block.
#[derive(Debug, Clone)]
pub enum Terminator {
    Ret(ValueId),
    Br(BlockId),
    CondBr {
        cond: ValueId,
        then_dest: BlockId,
        else_dest: BlockId,
    },
}

/// A module: the defined function plus accumulated helper declarations.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    /// Look up a function by name.
    pub fn get_named_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|idx| FuncId(idx as u32))
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub(crate) fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.0 as usize)
    }

    /// Add a defined function with parameter values pre-allocated.
    pub fn define_function(&mut self, name: impl Into<String>, sig: FuncSig) -> FuncId {
        let mut func = Function {
            name: name.into(),
            sig,
            params: Vec::new(),
            blocks: Vec::new(),
            is_declaration: false,
            next_value: 0,
        };
        for _ in 0..func.sig.params.len() {
            let v = func.new_value();
            func.params.push(v);
        }
        self.push(func)
    }

    /// Add a body-less helper declaration.
    pub fn declare_function(&mut self, name: impl Into<String>, sig: FuncSig) -> FuncId {
        self.push(Function {
            name: name.into(),
            sig,
            params: Vec::new(),
            blocks: Vec::new(),
            is_declaration: true,
            next_value: 0,
        })
    }

    fn push(&mut self, func: Function) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    fn write_function(&self, f: &mut fmt::Formatter<'_>, func: &Function) -> fmt::Result {
        write!(f, "define {} @{}(", func.sig.ret, func.name)?;
        for (i, (ty, v)) in func.sig.params.iter().zip(&func.params).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ty} %{v}")?;
        }
        writeln!(f, ") {{")?;
        for block in &func.blocks {
            writeln!(f, "{}:", block.label)?;
            for instr in &block.instrs {
                self.write_instr(f, func, instr)?;
            }
            match &block.term {
                Some(Terminator::Ret(v)) => writeln!(f, "  ret i64 %{v}")?,
                Some(Terminator::Br(dest)) => {
                    writeln!(f, "  br {}", func.block_label(*dest))?
                }
                Some(Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                }) => writeln!(
                    f,
                    "  br i1 %{cond}, {}, {}",
                    func.block_label(*then_dest),
                    func.block_label(*else_dest)
                )?,
                None => writeln!(f, "  ; missing terminator")?,
            }
        }
        writeln!(f, "}}")
    }

    fn write_instr(&self, f: &mut fmt::Formatter<'_>, func: &Function, instr: &Instr) -> fmt::Result {
        write!(f, "  ")?;
        if let Some(dest) = instr.dest {
            write!(f, "%{dest} = ")?;
        }
        match &instr.kind {
            InstrKind::Const(v) => writeln!(f, "const i64 {v}"),
            InstrKind::And { lhs, rhs } => writeln!(f, "and i64 %{lhs}, %{rhs}"),
            InstrKind::IcmpNe { lhs, rhs } => writeln!(f, "icmp ne i64 %{lhs}, %{rhs}"),
            InstrKind::Call { callee, args } => {
                let callee = match self.function(*callee) {
                    Some(c) => c,
                    None => return writeln!(f, "call ?"),
                };
                write!(f, "call {} @{}(", callee.sig.ret, callee.name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    let ty = callee.sig.params.get(i).copied().unwrap_or(Ty::I64);
                    write!(f, "{ty} %{arg}")?;
                }
                writeln!(f, ")")
            }
            InstrKind::Phi { incomings } => {
                write!(f, "phi i64 ")?;
                for (i, (v, block)) in incomings.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[ %{v}, {} ]", func.block_label(*block))?;
                }
                writeln!(f)
            }
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for func in self.functions.iter().filter(|fun| !fun.is_declaration) {
            self.write_function(f, func)?;
        }
        for func in self.functions.iter().filter(|fun| fun.is_declaration) {
            write!(f, "declare {} @{}(", func.sig.ret, func.name)?;
            for (i, ty) in func.sig.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{ty}")?;
            }
            if func.sig.variadic {
                if !func.sig.params.is_empty() {
                    write!(f, ", ")?;
                }
                write!(f, "...")?;
            }
            writeln!(f, ")")?;
        }
        Ok(())
    }
}
