//! Tile IR — the layout-annotated intermediate representation.
//!
//! A module holds functions; a function holds one region of blocks; each
//! operation may carry nested regions (structured control flow). Values
//! are function-local ids with types kept in a side table, so passes can
//! retype values without rebuilding the op tree.
//!
//! Operation kinds form a closed set grouped by dialect:
//!   tile      — source tensor ops (load/store/dot/reduce/...)
//!   arith     — elementwise arithmetic and comparisons
//!   math      — transcendental functions
//!   scf       — structured control flow (eliminated by the pipeline)
//!   cf        — flat control flow
//!   tile_gpu  — the lowered target dialect

pub mod builder;
pub mod encoding;
pub mod types;

use std::collections::BTreeMap;
use std::fmt;

use crate::span::Span;
use types::Type;

// ─── Values ───────────────────────────────────────────────────────

/// A function-local SSA value id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Value types, indexed by `ValueId`.
#[derive(Clone, Debug, Default)]
pub struct TypeTable {
    types: Vec<Type>,
}

impl TypeTable {
    pub fn new_value(&mut self, ty: Type) -> ValueId {
        let id = ValueId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub fn type_of(&self, id: ValueId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn set_type(&mut self, id: ValueId, ty: Type) {
        self.types[id.0 as usize] = ty;
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &Type)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (ValueId(i as u32), t))
    }
}

// ─── Operation kinds ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MathFunc {
    Exp,
    Log,
    Sqrt,
    Sin,
    Cos,
}

impl MathFunc {
    pub fn name(&self) -> &'static str {
        match self {
            MathFunc::Exp => "exp",
            MathFunc::Log => "log",
            MathFunc::Sqrt => "sqrt",
            MathFunc::Sin => "sin",
            MathFunc::Cos => "cos",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

/// Dialect an operation belongs to. Drives legality grouping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    Tile,
    Arith,
    Math,
    Scf,
    Cf,
    TileGpu,
}

/// A single IR operation. Closed set.
#[derive(Clone, Debug, PartialEq)]
pub enum OpKind {
    // ── tile (source dialect) ──
    MakeRange { start: i64, end: i64 },
    Splat,
    Broadcast,
    ExpandDims { dim: u32 },
    Load,
    Store,
    AddPtr,
    /// Fused multiply-accumulate: operands (a, b, acc).
    Dot,
    Reduce { dim: u32, kind: ReduceKind },

    // ── arith ──
    Constant(ConstValue),
    Binary(BinOp),
    CmpInt(CmpPred),
    CmpFloat(CmpPred),
    IndexCast,

    // ── math ──
    Math(MathFunc),

    // ── scf (structured control flow) ──
    /// Counted loop; operands (lb, ub, step, iter_inits...), region 0 body.
    For,
    /// Conditional; operand cond, region 0 then, region 1 else.
    If,
    ExecuteRegion,
    Parallel,
    ReduceRegion,
    ReduceReturn,
    Yield,

    // ── cf (flat control flow) ──
    Br { target: usize },
    CondBr { then_target: usize, else_target: usize },
    Return,
    /// Call to an external symbol (math lowering produces these).
    Call { callee: String },

    // ── tile_gpu (target dialect) ──
    ConvertLayout,
    LaneCmpInt(CmpPred),
    LaneCmpFloat(CmpPred),
}

impl OpKind {
    pub fn dialect(&self) -> Dialect {
        match self {
            OpKind::MakeRange { .. }
            | OpKind::Splat
            | OpKind::Broadcast
            | OpKind::ExpandDims { .. }
            | OpKind::Load
            | OpKind::Store
            | OpKind::AddPtr
            | OpKind::Dot
            | OpKind::Reduce { .. } => Dialect::Tile,
            OpKind::Constant(_)
            | OpKind::Binary(_)
            | OpKind::CmpInt(_)
            | OpKind::CmpFloat(_)
            | OpKind::IndexCast => Dialect::Arith,
            OpKind::Math(_) => Dialect::Math,
            OpKind::For
            | OpKind::If
            | OpKind::ExecuteRegion
            | OpKind::Parallel
            | OpKind::ReduceRegion
            | OpKind::ReduceReturn
            | OpKind::Yield => Dialect::Scf,
            OpKind::Br { .. }
            | OpKind::CondBr { .. }
            | OpKind::Return
            | OpKind::Call { .. } => Dialect::Cf,
            OpKind::ConvertLayout | OpKind::LaneCmpInt(_) | OpKind::LaneCmpFloat(_) => {
                Dialect::TileGpu
            }
        }
    }

    /// Pure ops can be CSE'd and dead-code eliminated.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            OpKind::MakeRange { .. }
                | OpKind::Splat
                | OpKind::Broadcast
                | OpKind::ExpandDims { .. }
                | OpKind::AddPtr
                | OpKind::Dot
                | OpKind::Reduce { .. }
                | OpKind::Constant(_)
                | OpKind::Binary(_)
                | OpKind::CmpInt(_)
                | OpKind::CmpFloat(_)
                | OpKind::IndexCast
                | OpKind::Math(_)
                | OpKind::ConvertLayout
                | OpKind::LaneCmpInt(_)
                | OpKind::LaneCmpFloat(_)
        )
    }

    /// Block terminators end a block; everything after them is dead.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            OpKind::Br { .. }
                | OpKind::CondBr { .. }
                | OpKind::Return
                | OpKind::Yield
                | OpKind::ReduceReturn
        )
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpKind::MakeRange { .. } => "tile.make_range",
            OpKind::Splat => "tile.splat",
            OpKind::Broadcast => "tile.broadcast",
            OpKind::ExpandDims { .. } => "tile.expand_dims",
            OpKind::Load => "tile.load",
            OpKind::Store => "tile.store",
            OpKind::AddPtr => "tile.addptr",
            OpKind::Dot => "tile.dot",
            OpKind::Reduce { .. } => "tile.reduce",
            OpKind::Constant(_) => "arith.constant",
            OpKind::Binary(_) => "arith.binary",
            OpKind::CmpInt(_) => "arith.cmpi",
            OpKind::CmpFloat(_) => "arith.cmpf",
            OpKind::IndexCast => "arith.index_cast",
            OpKind::Math(_) => "math.call",
            OpKind::For => "scf.for",
            OpKind::If => "scf.if",
            OpKind::ExecuteRegion => "scf.execute_region",
            OpKind::Parallel => "scf.parallel",
            OpKind::ReduceRegion => "scf.reduce",
            OpKind::ReduceReturn => "scf.reduce.return",
            OpKind::Yield => "scf.yield",
            OpKind::Br { .. } => "cf.br",
            OpKind::CondBr { .. } => "cf.cond_br",
            OpKind::Return => "cf.return",
            OpKind::Call { .. } => "cf.call",
            OpKind::ConvertLayout => "tile_gpu.convert_layout",
            OpKind::LaneCmpInt(_) => "tile_gpu.cmpi",
            OpKind::LaneCmpFloat(_) => "tile_gpu.cmpf",
        }
    }
}

// ─── Structure ────────────────────────────────────────────────────

/// An operation: kind, operands, results, nested regions, source span.
#[derive(Clone, Debug)]
pub struct Op {
    pub kind: OpKind,
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub regions: Vec<Region>,
    pub span: Span,
}

impl Op {
    pub fn new(kind: OpKind, operands: Vec<ValueId>, results: Vec<ValueId>) -> Self {
        Self {
            kind,
            operands,
            results,
            regions: Vec::new(),
            span: Span::dummy(),
        }
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    pub args: Vec<ValueId>,
    pub ops: Vec<Op>,
}

#[derive(Clone, Debug, Default)]
pub struct Region {
    pub blocks: Vec<Block>,
}

impl Region {
    pub fn single_block(ops: Vec<Op>) -> Self {
        Self {
            blocks: vec![Block {
                args: Vec::new(),
                ops,
            }],
        }
    }

    /// Visit every op in this region, nested regions included.
    pub fn for_each_op<'a>(&'a self, f: &mut impl FnMut(&'a Op)) {
        for block in &self.blocks {
            for op in &block.ops {
                f(op);
                for region in &op.regions {
                    region.for_each_op(f);
                }
            }
        }
    }
}

/// An external function declaration, optionally annotated with the
/// library that provides it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternFn {
    pub name: String,
    pub libname: Option<String>,
    pub libpath: Option<String>,
}

/// One IR function: single body region plus kernel-level annotations.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<ValueId>,
    pub body: Region,
    pub types: TypeTable,
    /// Launch bound: maximum threads per block, 0–3 dimensions.
    pub max_threads: Vec<u32>,
    /// Entry point launched by the hardware scheduler.
    pub is_kernel: bool,
}

impl Function {
    pub fn for_each_op<'a>(&'a self, f: &mut impl FnMut(&'a Op)) {
        self.body.for_each_op(f);
    }
}

/// A whole compilation module.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub externs: Vec<ExternFn>,
    /// Module-level externs dictionary: library name → path.
    pub extern_libs: BTreeMap<String, String>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Attach extra libraries to link. Mismatched or empty input is
    /// ignored, matching the surface API contract.
    pub fn add_external_libs(&mut self, names: &[String], paths: &[String]) {
        if names.is_empty() || names.len() != paths.len() {
            return;
        }
        for (name, path) in names.iter().zip(paths) {
            self.extern_libs
                .insert(name.trim().to_string(), path.trim().to_string());
        }
    }

    /// Declare an external symbol once; later declarations win only if
    /// they carry library info the first lacked.
    pub fn declare_extern(&mut self, decl: ExternFn) {
        if let Some(existing) = self.externs.iter_mut().find(|e| e.name == decl.name) {
            if existing.libname.is_none() {
                existing.libname = decl.libname;
                existing.libpath = decl.libpath;
            }
            return;
        }
        self.externs.push(decl);
    }
}

// ─── Textual dump ─────────────────────────────────────────────────

fn dump_region(f: &mut fmt::Formatter<'_>, func: &Function, region: &Region, indent: usize) -> fmt::Result {
    let pad = "  ".repeat(indent);
    for (bi, block) in region.blocks.iter().enumerate() {
        if region.blocks.len() > 1 || !block.args.is_empty() {
            write!(f, "{}^bb{}(", pad, bi)?;
            for (i, a) in block.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", a, func.types.type_of(*a))?;
            }
            writeln!(f, "):")?;
        }
        for op in &block.ops {
            write!(f, "{}  ", pad)?;
            for (i, r) in op.results.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", r)?;
            }
            if !op.results.is_empty() {
                write!(f, " = ")?;
            }
            write!(f, "{}", op.kind.mnemonic())?;
            for operand in &op.operands {
                write!(f, " {}", operand)?;
            }
            if let Some(r0) = op.results.first() {
                write!(f, " : {}", func.types.type_of(*r0))?;
            }
            writeln!(f)?;
            for region in &op.regions {
                dump_region(f, func, region, indent + 1)?;
            }
        }
    }
    Ok(())
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module @{} {{", self.name)?;
        for ext in &self.externs {
            match &ext.libname {
                Some(lib) => writeln!(f, "  extern @{} from \"{}\"", ext.name, lib)?,
                None => writeln!(f, "  extern @{}", ext.name)?,
            }
        }
        for func in &self.functions {
            write!(f, "  func @{}(", func.name)?;
            for (i, p) in func.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", p, func.types.type_of(*p))?;
            }
            write!(f, ")")?;
            if func.is_kernel {
                write!(f, " kernel")?;
            }
            if !func.max_threads.is_empty() {
                write!(f, " max_threads={:?}", func.max_threads)?;
            }
            writeln!(f, " {{")?;
            dump_region(f, func, &func.body, 2)?;
            writeln!(f, "  }}")?;
        }
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::types::ElemType;
    use super::*;

    #[test]
    fn test_dialect_grouping() {
        assert_eq!(OpKind::Dot.dialect(), Dialect::Tile);
        assert_eq!(OpKind::CmpInt(CmpPred::Eq).dialect(), Dialect::Arith);
        assert_eq!(OpKind::Math(MathFunc::Exp).dialect(), Dialect::Math);
        assert_eq!(OpKind::Parallel.dialect(), Dialect::Scf);
        assert_eq!(OpKind::Return.dialect(), Dialect::Cf);
        assert_eq!(OpKind::ConvertLayout.dialect(), Dialect::TileGpu);
    }

    #[test]
    fn test_purity() {
        assert!(OpKind::Binary(BinOp::Add).is_pure());
        assert!(OpKind::ConvertLayout.is_pure());
        assert!(!OpKind::Store.is_pure());
        assert!(!OpKind::Load.is_pure());
        assert!(!OpKind::For.is_pure());
    }

    #[test]
    fn test_add_external_libs_ignores_mismatch() {
        let mut m = Module::new("m");
        m.add_external_libs(&["a".into()], &[]);
        assert!(m.extern_libs.is_empty());
        m.add_external_libs(&["a".into()], &["/p/a.tm".into()]);
        assert_eq!(m.extern_libs.get("a").map(String::as_str), Some("/p/a.tm"));
    }

    #[test]
    fn test_declare_extern_merges_lib_info() {
        let mut m = Module::new("m");
        m.declare_extern(ExternFn {
            name: "__tl_exp_f32".into(),
            libname: None,
            libpath: None,
        });
        m.declare_extern(ExternFn {
            name: "__tl_exp_f32".into(),
            libname: Some("mathlib".into()),
            libpath: Some("/lib/mathlib.tm".into()),
        });
        assert_eq!(m.externs.len(), 1);
        assert_eq!(m.externs[0].libname.as_deref(), Some("mathlib"));
    }

    #[test]
    fn test_dump_contains_function() {
        let mut types = TypeTable::default();
        let v = types.new_value(Type::Scalar(ElemType::F32));
        let func = Function {
            name: "k".into(),
            params: vec![v],
            body: Region::single_block(vec![Op::new(OpKind::Return, vec![], vec![])]),
            types,
            max_threads: vec![128],
            is_kernel: true,
        };
        let mut m = Module::new("m");
        m.functions.push(func);
        let text = format!("{}", m);
        assert!(text.contains("func @k"));
        assert!(text.contains("kernel"));
        assert!(text.contains("cf.return"));
    }
}
