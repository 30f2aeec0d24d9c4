//! Export: lowered tile IR to the textual hardware module.
//!
//! Every value is expanded to its physical slots through the
//! representation converter; one instruction line is emitted per result
//! slot. Structured control flow must already be flattened — a residual
//! structured op is an export failure, not something to paper over.

use std::collections::HashMap;
use std::fmt;

use crate::ir::{
    BinOp, CmpPred, ConstValue, Dialect, Function, Module, Op, OpKind, ReduceKind, ValueId,
};
use crate::lower::repr::{PhysValue, ReprConverter};

use super::module::{CodeFunction, CodeModule};

/// The module could not be exported.
#[derive(Debug)]
pub struct ExportError {
    pub message: String,
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export failed: {}", self.message)
    }
}

impl std::error::Error for ExportError {}

/// Export a fully lowered module.
pub fn export(module: &Module, converter: &ReprConverter) -> Result<CodeModule, ExportError> {
    let mut code = CodeModule::new(module.name.clone());
    for ext in &module.externs {
        code.externs.insert(ext.name.clone());
    }
    for func in &module.functions {
        code.functions.push(export_function(func, converter)?);
    }
    Ok(code)
}

struct FunctionExporter<'a> {
    func: &'a Function,
    converter: &'a ReprConverter,
    values: HashMap<ValueId, PhysValue>,
    next_reg: u32,
    lines: Vec<String>,
}

fn export_function(func: &Function, converter: &ReprConverter) -> Result<CodeFunction, ExportError> {
    let mut ex = FunctionExporter {
        func,
        converter,
        values: HashMap::new(),
        next_reg: 0,
        lines: Vec::new(),
    };

    let mut out = CodeFunction::new(func.name.clone());
    for param in &func.params {
        let value = ex.materialize(*param)?;
        for slot in ex.converter.unpack(&value) {
            out.params.push(format!("{} {}", phys_ty(&slot), reg(&slot)));
        }
    }

    let multi_block = func.body.blocks.len() > 1;
    for (bi, block) in func.body.blocks.iter().enumerate() {
        if multi_block {
            ex.lines.push(format!("LBB{}:", bi));
        }
        for arg in &block.args {
            // Block arguments become registers the predecessors write.
            ex.materialize(*arg)?;
        }
        for op in &block.ops {
            ex.emit(op)?;
        }
    }
    out.body = ex.lines;
    Ok(out)
}

impl<'a> FunctionExporter<'a> {
    /// Physical value for `id`, creating fresh registers on first use.
    fn materialize(&mut self, id: ValueId) -> Result<PhysValue, ExportError> {
        if let Some(v) = self.values.get(&id) {
            return Ok(v.clone());
        }
        let ty = self.func.types.type_of(id);
        let repr = self.converter.representation_of(ty).map_err(diag_to_export)?;
        let slots: Vec<Option<PhysValue>> = repr
            .slots
            .iter()
            .map(|slot| {
                let reg = self.next_reg;
                self.next_reg += 1;
                Some(PhysValue::Slot { ty: *slot, id: reg })
            })
            .collect();
        let value = self
            .converter
            .pack(crate::span::Span::dummy(), &slots, &repr)
            .map_err(diag_to_export)?;
        self.values.insert(id, value.clone());
        Ok(value)
    }

    fn operand_slots(&mut self, id: ValueId) -> Result<Vec<PhysValue>, ExportError> {
        let value = self.materialize(id)?;
        Ok(self.converter.unpack(&value))
    }

    fn result_slots(&mut self, op: &Op) -> Result<Vec<PhysValue>, ExportError> {
        match op.results.first() {
            Some(r) => {
                let value = self.materialize(*r)?;
                Ok(self.converter.unpack(&value))
            }
            None => Ok(Vec::new()),
        }
    }

    /// One instruction line per result slot, cycling shorter operand
    /// slot lists so mixed-arity ops (dot, reduce) stay well-formed.
    fn emit_elementwise(&mut self, op: &Op, opcode: &str) -> Result<(), ExportError> {
        let operands: Vec<Vec<PhysValue>> = op
            .operands
            .iter()
            .map(|v| self.operand_slots(*v))
            .collect::<Result<_, _>>()?;
        for (i, dst) in self.result_slots(op)?.iter().enumerate() {
            let mut line = format!("{} = {}.{}", reg(dst), opcode, phys_ty(dst));
            for (j, slots) in operands.iter().enumerate() {
                if slots.is_empty() {
                    continue;
                }
                line.push_str(if j == 0 { " " } else { ", " });
                line.push_str(&reg(&slots[i % slots.len()]));
            }
            self.lines.push(line);
        }
        Ok(())
    }

    fn emit(&mut self, op: &Op) -> Result<(), ExportError> {
        if op.kind.dialect() == Dialect::Scf {
            return Err(ExportError {
                message: format!(
                    "structured control flow survived lowering: '{}' cannot be exported",
                    op.kind.mnemonic()
                ),
            });
        }
        match &op.kind {
            OpKind::Constant(value) => {
                let imm = match value {
                    ConstValue::Int(v) => v.to_string(),
                    ConstValue::Float(v) => format!("{:?}", v),
                };
                for dst in self.result_slots(op)? {
                    self.lines
                        .push(format!("{} = mov.{} {}", reg(&dst), phys_ty(&dst), imm));
                }
            }
            OpKind::Binary(bin) => self.emit_elementwise(op, bin_opcode(*bin))?,
            OpKind::CmpInt(pred) | OpKind::LaneCmpInt(pred) => {
                self.emit_elementwise(op, &format!("setp.{}.s", cmp_opcode(*pred)))?
            }
            OpKind::CmpFloat(pred) | OpKind::LaneCmpFloat(pred) => {
                self.emit_elementwise(op, &format!("setp.{}.f", cmp_opcode(*pred)))?
            }
            OpKind::IndexCast => self.emit_elementwise(op, "cvt")?,
            OpKind::MakeRange { start, .. } => {
                for (i, dst) in self.result_slots(op)?.iter().enumerate() {
                    self.lines.push(format!(
                        "{} = mov.{} {}",
                        reg(dst),
                        phys_ty(dst),
                        *start + i as i64
                    ));
                }
            }
            OpKind::Splat | OpKind::Broadcast | OpKind::ExpandDims { .. } => {
                self.emit_elementwise(op, "mov")?
            }
            OpKind::AddPtr => self.emit_elementwise(op, "addptr")?,
            OpKind::Load => self.emit_elementwise(op, "ld.global")?,
            OpKind::Store => {
                let ptrs = self.operand_slots(op.operands[0])?;
                let vals = self.operand_slots(op.operands[1])?;
                for (ptr, val) in ptrs.iter().zip(&vals) {
                    self.lines.push(format!(
                        "st.global.{} {}, {}",
                        phys_ty(val),
                        reg(ptr),
                        reg(val)
                    ));
                }
            }
            OpKind::Dot => self.emit_elementwise(op, "mma.sync")?,
            OpKind::Reduce { kind, .. } => {
                let opcode = match kind {
                    ReduceKind::Sum => "reduce.add",
                    ReduceKind::Max => "reduce.max",
                    ReduceKind::Min => "reduce.min",
                };
                self.emit_elementwise(op, opcode)?
            }
            OpKind::ConvertLayout => self.emit_elementwise(op, "cvt.layout")?,
            OpKind::Call { callee } => {
                let args = op
                    .operands
                    .iter()
                    .map(|v| self.operand_slots(*v))
                    .collect::<Result<Vec<_>, _>>()?;
                let results = self.result_slots(op)?;
                if results.is_empty() {
                    self.lines.push(format!("call @{}", callee));
                } else {
                    for (i, dst) in results.iter().enumerate() {
                        let mut line = format!("{} = call @{}", reg(dst), callee);
                        for slots in &args {
                            if slots.is_empty() {
                                continue;
                            }
                            line.push(' ');
                            line.push_str(&reg(&slots[i % slots.len()]));
                        }
                        self.lines.push(line);
                    }
                }
            }
            OpKind::Br { target } => {
                for arg in &op.operands {
                    // Forward branch arguments into the target's registers.
                    let _ = self.operand_slots(*arg)?;
                }
                self.lines.push(format!("bra LBB{}", target));
            }
            OpKind::CondBr {
                then_target,
                else_target,
            } => {
                let cond = self.operand_slots(op.operands[0])?;
                self.lines
                    .push(format!("@{} bra LBB{}", reg(&cond[0]), then_target));
                self.lines.push(format!("bra LBB{}", else_target));
            }
            OpKind::Return => self.lines.push("ret".to_string()),
            OpKind::Math(func) => {
                return Err(ExportError {
                    message: format!(
                        "math op '{}' survived lowering; it must become an external call first",
                        func.name()
                    ),
                });
            }
            // Structured ops were rejected above.
            _ => {}
        }
        Ok(())
    }
}

fn diag_to_export(d: crate::diagnostic::Diagnostic) -> ExportError {
    ExportError { message: d.message }
}

fn reg(value: &PhysValue) -> String {
    match value {
        PhysValue::Slot { id, .. } => format!("%r{}", id),
        PhysValue::Aggregate { .. } => "%agg".to_string(),
    }
}

fn phys_ty(value: &PhysValue) -> String {
    match value.slot_ty() {
        Some(ty) => ty.to_string(),
        None => "agg".to_string(),
    }
}

fn bin_opcode(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::Div => "div",
        BinOp::Rem => "rem",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
        BinOp::Min => "min",
        BinOp::Max => "max",
    }
}

fn cmp_opcode(pred: CmpPred) -> &'static str {
    match pred {
        CmpPred::Eq => "eq",
        CmpPred::Ne => "ne",
        CmpPred::Lt => "lt",
        CmpPred::Le => "le",
        CmpPred::Gt => "gt",
        CmpPred::Ge => "ge",
    }
}
