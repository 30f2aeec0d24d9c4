//! IR construction helper used by passes and tests.

use super::encoding::Encoding;
use super::types::{ElemType, TensorType, Type};
use super::{
    BinOp, Block, CmpPred, ConstValue, Function, MathFunc, Op, OpKind, Region, TypeTable, ValueId,
};

/// Builds one function op by op. Nested regions are built through
/// [`FunctionBuilder::nested`], which stages ops on a frame stack so the
/// value table stays shared across region boundaries.
pub struct FunctionBuilder {
    name: String,
    params: Vec<ValueId>,
    types: TypeTable,
    frames: Vec<Vec<Op>>,
    max_threads: Vec<u32>,
    is_kernel: bool,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            types: TypeTable::default(),
            frames: vec![Vec::new()],
            max_threads: Vec::new(),
            is_kernel: false,
        }
    }

    pub fn kernel(mut self, max_threads: Vec<u32>) -> Self {
        debug_assert!(max_threads.len() <= 3);
        self.is_kernel = true;
        self.max_threads = max_threads;
        self
    }

    pub fn param(&mut self, ty: Type) -> ValueId {
        let id = self.types.new_value(ty);
        self.params.push(id);
        id
    }

    pub fn new_value(&mut self, ty: Type) -> ValueId {
        self.types.new_value(ty)
    }

    pub fn type_of(&self, id: ValueId) -> &Type {
        self.types.type_of(id)
    }

    pub fn push(&mut self, op: Op) {
        self.frames.last_mut().unwrap().push(op);
    }

    /// Stage the ops produced by `f` into a fresh frame and return them,
    /// for use as a nested region body.
    pub fn nested(&mut self, f: impl FnOnce(&mut Self)) -> Vec<Op> {
        self.frames.push(Vec::new());
        f(self);
        self.frames.pop().unwrap()
    }

    // ── op helpers ──

    fn emit(&mut self, kind: OpKind, operands: Vec<ValueId>, ty: Type) -> ValueId {
        let result = self.types.new_value(ty);
        self.push(Op::new(kind, operands, vec![result]));
        result
    }

    pub fn const_int(&mut self, value: i64, ty: ElemType) -> ValueId {
        self.emit(
            OpKind::Constant(ConstValue::Int(value)),
            vec![],
            Type::Scalar(ty),
        )
    }

    pub fn const_float(&mut self, value: f64, ty: ElemType) -> ValueId {
        self.emit(
            OpKind::Constant(ConstValue::Float(value)),
            vec![],
            Type::Scalar(ty),
        )
    }

    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.types.type_of(lhs).clone();
        self.emit(OpKind::Binary(op), vec![lhs, rhs], ty)
    }

    pub fn cmp_int(&mut self, pred: CmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = bool_like(self.types.type_of(lhs));
        self.emit(OpKind::CmpInt(pred), vec![lhs, rhs], ty)
    }

    pub fn cmp_float(&mut self, pred: CmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = bool_like(self.types.type_of(lhs));
        self.emit(OpKind::CmpFloat(pred), vec![lhs, rhs], ty)
    }

    pub fn math(&mut self, func: MathFunc, arg: ValueId) -> ValueId {
        let ty = self.types.type_of(arg).clone();
        self.emit(OpKind::Math(func), vec![arg], ty)
    }

    pub fn make_range(&mut self, start: i64, end: i64) -> ValueId {
        debug_assert!(end > start);
        let ty = Type::tensor(vec![(end - start) as u64], ElemType::I32);
        self.emit(OpKind::MakeRange { start, end }, vec![], ty)
    }

    pub fn splat(&mut self, scalar: ValueId, shape: Vec<u64>) -> ValueId {
        let elem = self.types.type_of(scalar).elem();
        self.emit(OpKind::Splat, vec![scalar], Type::tensor(shape, elem))
    }

    pub fn load(&mut self, ptr: ValueId, result_ty: Type) -> ValueId {
        self.emit(OpKind::Load, vec![ptr], result_ty)
    }

    pub fn store(&mut self, ptr: ValueId, value: ValueId) {
        self.push(Op::new(OpKind::Store, vec![ptr, value], vec![]));
    }

    pub fn dot(&mut self, a: ValueId, b: ValueId, acc: ValueId) -> ValueId {
        let ty = self.types.type_of(acc).clone();
        self.emit(OpKind::Dot, vec![a, b, acc], ty)
    }

    pub fn convert_layout(&mut self, value: ValueId, encoding: Encoding) -> ValueId {
        let tensor = self
            .types
            .type_of(value)
            .as_tensor()
            .expect("convert_layout applies to tensors")
            .clone();
        let ty = Type::Tensor(TensorType {
            encoding: Some(encoding),
            ..tensor
        });
        self.emit(OpKind::ConvertLayout, vec![value], ty)
    }

    pub fn ret(&mut self) {
        self.push(Op::new(OpKind::Return, vec![], vec![]));
    }

    pub fn finish(mut self) -> Function {
        let ops = self.frames.pop().unwrap();
        debug_assert!(self.frames.is_empty(), "unclosed nested frame");
        Function {
            name: self.name,
            params: self.params,
            body: Region {
                blocks: vec![Block {
                    args: Vec::new(),
                    ops,
                }],
            },
            types: self.types,
            max_threads: self.max_threads,
            is_kernel: self.is_kernel,
        }
    }
}

fn bool_like(ty: &Type) -> Type {
    match ty {
        Type::Scalar(_) => Type::Scalar(ElemType::I1),
        Type::Tensor(t) => Type::Tensor(TensorType {
            shape: t.shape.clone(),
            elem: ElemType::I1,
            encoding: t.encoding.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_flat_function() {
        let mut b = FunctionBuilder::new("axpy").kernel(vec![128]);
        let x = b.param(Type::tensor(vec![64], ElemType::F32));
        let y = b.param(Type::tensor(vec![64], ElemType::F32));
        let s = b.binary(BinOp::Add, x, y);
        let _ = b.math(MathFunc::Exp, s);
        b.ret();
        let f = b.finish();
        assert_eq!(f.name, "axpy");
        assert_eq!(f.params.len(), 2);
        assert!(f.is_kernel);
        assert_eq!(f.body.blocks[0].ops.len(), 3);
    }

    #[test]
    fn test_cmp_result_is_bool_shaped() {
        let mut b = FunctionBuilder::new("f");
        let x = b.param(Type::tensor(vec![16], ElemType::I32));
        let c = b.cmp_int(CmpPred::Lt, x, x);
        let Type::Tensor(t) = b.type_of(c) else {
            panic!("tensor compare must stay a tensor");
        };
        assert_eq!(t.elem, ElemType::I1);
        assert_eq!(t.shape, vec![16]);
    }

    #[test]
    fn test_nested_frames() {
        let mut b = FunctionBuilder::new("f");
        let c = b.const_int(1, ElemType::I1);
        let then_ops = b.nested(|b| {
            let v = b.const_int(2, ElemType::I32);
            let _ = b.binary(BinOp::Mul, v, v);
            b.push(Op::new(OpKind::Yield, vec![], vec![]));
        });
        let else_ops = b.nested(|b| {
            b.push(Op::new(OpKind::Yield, vec![], vec![]));
        });
        b.push(
            Op::new(OpKind::If, vec![c], vec![]).with_regions(vec![
                Region::single_block(then_ops),
                Region::single_block(else_ops),
            ]),
        );
        b.ret();
        let f = b.finish();
        let if_op = &f.body.blocks[0].ops[1];
        assert_eq!(if_op.regions.len(), 2);
        assert_eq!(if_op.regions[0].blocks[0].ops.len(), 3);
    }
}
