//! Tile-to-hardware conversion driver.
//!
//! `EncodingConverter` decides the converted form of every type: scalars
//! pass through, encoded tensors are already done, and a bare tensor gets
//! the pessimistic natural Blocked encoding. The driver applies the
//! converter and the op rewrites (lane-aware comparisons, fused-multiply
//! operand wrapping) until the conversion target reports the module
//! legal. No progress while still illegal is a legality deadlock — an
//! internal defect, not a user error.

use crate::ir::encoding::{Encoding, MmaOperandEncoding, OperandSide};
use crate::ir::types::{TensorType, Type};
use crate::ir::{Function, Module, Op, OpKind, Region, TypeTable, ValueId};

use super::legal::ConversionTarget;

/// The module could not reach a fully legal state.
#[derive(Debug)]
pub struct Deadlock {
    pub message: String,
}

/// Converts types into their fully-encoded target form.
pub struct EncodingConverter {
    num_warps: u32,
}

impl EncodingConverter {
    pub fn new(num_warps: u32) -> Self {
        debug_assert!(num_warps > 0);
        Self { num_warps }
    }

    /// A type already in the right format is returned unchanged; a bare
    /// tensor gets the natural Blocked encoding.
    pub fn convert_type(&self, ty: &Type) -> Type {
        match ty {
            Type::Tensor(t) if t.encoding.is_none() => {
                let encoding = Encoding::natural(&t.shape, self.num_warps);
                Type::Tensor(TensorType {
                    shape: t.shape.clone(),
                    elem: t.elem,
                    encoding: Some(encoding),
                })
            }
            other => other.clone(),
        }
    }

    pub fn is_legal_type(&self, ty: &Type) -> bool {
        ty.is_encoded()
    }
}

const MAX_ROUNDS: usize = 8;

/// Drive the conversion to a fixed point.
pub fn run(module: &mut Module, converter: &EncodingConverter) -> Result<(), Deadlock> {
    for _ in 0..MAX_ROUNDS {
        let mut changed = false;
        for func in &mut module.functions {
            changed |= convert_function(func, converter);
        }
        let target = ConversionTarget::new(converter);
        if target.module_legal(module) {
            return Ok(());
        }
        if !changed {
            return Err(deadlock(module, converter));
        }
    }
    Err(deadlock(module, converter))
}

fn deadlock(module: &Module, converter: &EncodingConverter) -> Deadlock {
    let target = ConversionTarget::new(converter);
    for func in &module.functions {
        if let Some(op) = target.first_illegal(func) {
            return Deadlock {
                message: format!(
                    "conversion deadlock in @{}: {} cannot be legalized",
                    func.name,
                    op.kind.mnemonic()
                ),
            };
        }
    }
    Deadlock {
        message: "conversion deadlock: module never reached a legal state".to_string(),
    }
}

fn convert_function(func: &mut Function, converter: &EncodingConverter) -> bool {
    let mut changed = false;

    // Retype every value the converter would change.
    let ids: Vec<ValueId> = func.types.iter().map(|(id, _)| id).collect();
    for id in ids {
        let ty = func.types.type_of(id);
        if !converter.is_legal_type(ty) {
            let converted = converter.convert_type(ty);
            func.types.set_type(id, converted);
            changed = true;
        }
    }

    let Function { body, types, .. } = func;
    changed |= rewrite_region(body, types);
    changed
}

fn rewrite_region(region: &mut Region, types: &mut TypeTable) -> bool {
    let mut changed = false;
    for block in &mut region.blocks {
        let mut i = 0;
        while i < block.ops.len() {
            match block.ops[i].kind {
                // The target dialect replaces plain comparisons.
                OpKind::CmpInt(pred) => {
                    block.ops[i].kind = OpKind::LaneCmpInt(pred);
                    changed = true;
                }
                OpKind::CmpFloat(pred) => {
                    block.ops[i].kind = OpKind::LaneCmpFloat(pred);
                    changed = true;
                }
                OpKind::Dot => {
                    changed |= wrap_dot_operands(block, i, types);
                }
                _ => {}
            }
            for nested in &mut block.ops[i].regions {
                changed |= rewrite_region(nested, types);
            }
            i += 1;
        }
    }
    changed
}

/// Give each non-accumulator Dot operand the operand-of-fused-multiply
/// encoding by materializing a layout conversion in front of the op.
/// The parent encoding is the accumulator's layout, which the placement
/// passes have already chosen (blocked for the FMA path, matrix-unit
/// otherwise).
fn wrap_dot_operands(block: &mut crate::ir::Block, at: usize, types: &mut TypeTable) -> bool {
    let span = block.ops[at].span;
    let acc = block.ops[at].operands[2];
    let Some(parent) = types
        .type_of(acc)
        .as_tensor()
        .and_then(|t| t.encoding.clone())
    else {
        return false;
    };

    let mut changed = false;
    let mut dot_at = at;
    for (idx, side) in [(0, OperandSide::A), (1, OperandSide::B)] {
        let operand = block.ops[dot_at].operands[idx];
        let Type::Tensor(t) = types.type_of(operand).clone() else {
            continue;
        };
        if matches!(t.encoding, Some(Encoding::MmaOperand(_))) {
            continue;
        }
        let wrapped = Encoding::MmaOperand(MmaOperandEncoding {
            side,
            parent: Box::new(parent.clone()),
        });
        let new_ty = Type::Tensor(TensorType {
            shape: t.shape.clone(),
            elem: t.elem,
            encoding: Some(wrapped),
        });
        let new_value = types.new_value(new_ty);
        let convert = Op::new(OpKind::ConvertLayout, vec![operand], vec![new_value]).with_span(span);
        block.ops.insert(dot_at, convert);
        dot_at += 1;
        block.ops[dot_at].operands[idx] = new_value;
        changed = true;
    }
    changed
}
