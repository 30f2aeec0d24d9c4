//! Lowering Legality Target — decides, op by op and region by region,
//! whether a program location is already in fully-lowered form.
//!
//! Legality is a pure function of the current program state: repeated
//! checks on an unchanged region always agree, which is what lets the
//! rewrite driver treat it as a fixed-point condition.

use crate::ir::encoding::Encoding;
use crate::ir::{Dialect, Function, Module, Op, OpKind, Region};

use super::convert::EncodingConverter;

/// Conversion target for the tile-to-hardware rewrite.
pub struct ConversionTarget<'a> {
    converter: &'a EncodingConverter,
}

impl<'a> ConversionTarget<'a> {
    pub fn new(converter: &'a EncodingConverter) -> Self {
        Self { converter }
    }

    /// Whether one operation is legal under the in-progress conversion.
    pub fn op_legal(&self, func: &Function, op: &Op) -> bool {
        match op.kind.dialect() {
            // The lowered dialect is unconditionally legal.
            Dialect::TileGpu => true,

            // Structured parallel/reduce forms must have been eliminated.
            Dialect::Scf
                if matches!(
                    op.kind,
                    OpKind::ExecuteRegion
                        | OpKind::Parallel
                        | OpKind::ReduceRegion
                        | OpKind::ReduceReturn
                ) =>
            {
                false
            }

            // The target dialect carries layout-aware comparison ops;
            // the plain ones may not survive.
            Dialect::Arith if matches!(op.kind, OpKind::CmpInt(_) | OpKind::CmpFloat(_)) => false,

            // Fused multiply-accumulate: both non-accumulator operands
            // must already carry an operand encoding.
            Dialect::Tile if matches!(op.kind, OpKind::Dot) => {
                op.operands[..2].iter().all(|v| {
                    matches!(
                        func.types.type_of(*v).as_tensor().and_then(|t| t.encoding.as_ref()),
                        Some(Encoding::MmaOperand(_))
                    )
                })
            }

            // Mixed dialects: legal only once every nested region and
            // every operand/result type is fully converted.
            Dialect::Tile | Dialect::Arith | Dialect::Math | Dialect::Cf | Dialect::Scf => {
                op.regions.iter().all(|r| self.region_converted(func, r))
                    && self.signature_converted(func, op)
            }
        }
    }

    /// All types appearing in the op signature are fully encoded.
    fn signature_converted(&self, func: &Function, op: &Op) -> bool {
        op.operands
            .iter()
            .chain(&op.results)
            .all(|v| self.converter.is_legal_type(func.types.type_of(*v)))
    }

    /// All types inside a region (block arguments and op signatures,
    /// nested regions included) are fully encoded.
    pub fn region_converted(&self, func: &Function, region: &Region) -> bool {
        for block in &region.blocks {
            if !block
                .args
                .iter()
                .all(|v| self.converter.is_legal_type(func.types.type_of(*v)))
            {
                return false;
            }
            for op in &block.ops {
                if !self.signature_converted(func, op) {
                    return false;
                }
                if !op.regions.iter().all(|r| self.region_converted(func, r)) {
                    return false;
                }
            }
        }
        true
    }

    /// The whole module is legal when every op of every function is.
    pub fn module_legal(&self, module: &Module) -> bool {
        module.functions.iter().all(|func| {
            let mut legal = true;
            func.for_each_op(&mut |op| {
                legal = legal && self.op_legal(func, op);
            });
            legal
        })
    }

    /// First illegal op, for deadlock reporting.
    pub fn first_illegal<'f>(&self, func: &'f Function) -> Option<&'f Op> {
        let mut found = None;
        func.for_each_op(&mut |op| {
            if found.is_none() && !self.op_legal(func, op) {
                found = Some(op);
            }
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::encoding::{MmaEncoding, MmaOperandEncoding, MmaVersion, OperandSide};
    use crate::ir::types::{ElemType, TensorType, Type};
    use crate::ir::{BinOp, CmpPred, Op, Region};

    fn encoded(shape: Vec<u64>, elem: ElemType) -> Type {
        let enc = Encoding::natural(&shape, 4);
        Type::Tensor(TensorType::new(shape, elem).with_encoding(enc))
    }

    fn operand_encoded(shape: Vec<u64>, elem: ElemType, side: OperandSide) -> Type {
        let parent = Encoding::Mma(MmaEncoding {
            version: MmaVersion::Ampere,
            warps_per_block: vec![1, 1],
        });
        Type::Tensor(TensorType::new(shape, elem).with_encoding(Encoding::MmaOperand(
            MmaOperandEncoding {
                side,
                parent: Box::new(parent),
            },
        )))
    }

    fn target_check(func: &Function, op_index: usize) -> bool {
        let converter = EncodingConverter::new(4);
        let target = ConversionTarget::new(&converter);
        target.op_legal(func, &func.body.blocks[0].ops[op_index])
    }

    #[test]
    fn test_target_dialect_always_legal() {
        let mut b = FunctionBuilder::new("f");
        // Even over an unencoded operand, the target dialect op is legal.
        let x = b.param(Type::tensor(vec![8], ElemType::F32));
        let _ = b.convert_layout(x, Encoding::natural(&[8], 4));
        let f = b.finish();
        assert!(target_check(&f, 0));
    }

    #[test]
    fn test_parallel_forms_always_illegal() {
        for kind in [
            OpKind::ExecuteRegion,
            OpKind::Parallel,
            OpKind::ReduceRegion,
            OpKind::ReduceReturn,
        ] {
            let mut b = FunctionBuilder::new("f");
            b.push(Op::new(kind, vec![], vec![]).with_regions(vec![Region::default()]));
            let f = b.finish();
            assert!(!target_check(&f, 0));
        }
    }

    #[test]
    fn test_plain_cmp_always_illegal() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(encoded(vec![8], ElemType::I32));
        let _ = b.cmp_int(CmpPred::Lt, x, x);
        let f = b.finish();
        assert!(!target_check(&f, 0));
    }

    #[test]
    fn test_lane_cmp_is_legal() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(encoded(vec![8], ElemType::I32));
        let r = b.new_value(encoded(vec![8], ElemType::I1));
        b.push(Op::new(OpKind::LaneCmpInt(CmpPred::Lt), vec![x, x], vec![r]));
        let f = b.finish();
        assert!(target_check(&f, 0));
    }

    #[test]
    fn test_arith_legal_only_when_types_encoded() {
        let mut b = FunctionBuilder::new("f");
        let bare = b.param(Type::tensor(vec![8], ElemType::F32));
        let _ = b.binary(BinOp::Add, bare, bare);
        let f = b.finish();
        assert!(!target_check(&f, 0));

        let mut b = FunctionBuilder::new("g");
        let enc = b.param(encoded(vec![8], ElemType::F32));
        let _ = b.binary(BinOp::Add, enc, enc);
        let f = b.finish();
        assert!(target_check(&f, 0));
    }

    #[test]
    fn test_inner_region_blocks_outer_legality() {
        // An scf.for whose body still holds an unencoded type is illegal
        // even though the for op's own operands are scalars.
        let mut b = FunctionBuilder::new("f");
        let lb = b.const_int(0, ElemType::I32);
        let ub = b.const_int(8, ElemType::I32);
        let step = b.const_int(1, ElemType::I32);
        let body = b.nested(|b| {
            let bare = b.new_value(Type::tensor(vec![4], ElemType::F32));
            b.push(Op::new(OpKind::Splat, vec![lb], vec![bare]));
            b.push(Op::new(OpKind::Yield, vec![], vec![]));
        });
        b.push(
            Op::new(OpKind::For, vec![lb, ub, step], vec![])
                .with_regions(vec![Region::single_block(body)]),
        );
        let f = b.finish();
        assert!(!target_check(&f, 3));
    }

    #[test]
    fn test_dot_requires_both_operand_encodings() {
        let a_enc = operand_encoded(vec![16, 16], ElemType::F16, OperandSide::A);
        let b_enc = operand_encoded(vec![16, 8], ElemType::F16, OperandSide::B);
        let acc = encoded(vec![16, 8], ElemType::F32);

        // One operand still blocked: illegal.
        let mut b = FunctionBuilder::new("f");
        let a = b.param(a_enc.clone());
        let bad_b = b.param(encoded(vec![16, 8], ElemType::F16));
        let c = b.param(acc.clone());
        let _ = b.dot(a, bad_b, c);
        let f = b.finish();
        assert!(!target_check(&f, 0));

        // Both wrapped: legal.
        let mut b = FunctionBuilder::new("g");
        let a = b.param(a_enc);
        let bb = b.param(b_enc);
        let c = b.param(acc);
        let _ = b.dot(a, bb, c);
        let f = b.finish();
        assert!(target_check(&f, 0));
    }

    #[test]
    fn test_legality_is_deterministic() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(Type::tensor(vec![8], ElemType::F32));
        let _ = b.binary(BinOp::Add, x, x);
        let f = b.finish();
        let converter = EncodingConverter::new(4);
        let target = ConversionTarget::new(&converter);
        let first = target.op_legal(&f, &f.body.blocks[0].ops[0]);
        for _ in 0..10 {
            assert_eq!(target.op_legal(&f, &f.body.blocks[0].ops[0]), first);
        }
    }
}
