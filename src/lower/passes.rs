//! IR passes run by the code-generation pipeline around the
//! tile-to-hardware conversion: structured-control-flow elimination,
//! index-type elimination, math-to-extern lowering, and the cleanup
//! trio (canonicalize, CSE, symbol DCE).

use std::collections::{BTreeSet, HashMap};

use crate::ir::types::{ElemType, TensorType, Type};
use crate::ir::{
    BinOp, Block, CmpPred, ConstValue, ExternFn, Function, Module, Op, OpKind, Region, ReduceKind,
    TypeTable, ValueId,
};

// ─── Structured-control-flow elimination ──────────────────────────

/// Rewrite structured control flow into flat blocks with branches.
///
/// `scf.for`/`scf.if` become header/body/exit blocks, `scf.parallel`
/// becomes a counted loop first, reduce regions collapse into `tile.reduce`,
/// and `scf.execute_region` is inlined. After this pass the only
/// terminators are `cf.br`, `cf.cond_br` and `cf.return`.
pub fn eliminate_structured_cf(func: &mut Function) {
    let Function { body, types, .. } = func;
    let entry = std::mem::take(body);
    let mut blocks = vec![Block {
        args: entry.blocks.first().map(|b| b.args.clone()).unwrap_or_default(),
        ops: Vec::new(),
    }];
    let ops: Vec<Op> = entry.blocks.into_iter().flat_map(|b| b.ops).collect();
    flatten_ops(&mut blocks, 0, ops, types);
    *body = Region { blocks };
}

/// Append `ops` starting at block `cur`, materializing new blocks for
/// structured ops. Returns the block index control ends up in. A trailing
/// `scf.yield` is left in place for the enclosing handler to rewrite.
fn flatten_ops(blocks: &mut Vec<Block>, mut cur: usize, ops: Vec<Op>, types: &mut TypeTable) -> usize {
    for mut op in ops {
        match op.kind {
            OpKind::Parallel => {
                // A parallel loop lowers through the sequential form.
                op.kind = OpKind::For;
                cur = flatten_for(blocks, cur, op, types);
            }
            OpKind::For => {
                cur = flatten_for(blocks, cur, op, types);
            }
            OpKind::If => {
                cur = flatten_if(blocks, cur, op, types);
            }
            OpKind::ExecuteRegion => {
                debug_assert!(op.results.is_empty());
                let region = op.regions.remove(0);
                let inner: Vec<Op> = region.blocks.into_iter().flat_map(|b| b.ops).collect();
                cur = flatten_ops(blocks, cur, inner, types);
                drop_trailing_yield(&mut blocks[cur]);
            }
            OpKind::ReduceRegion => {
                let kind = reduce_kind_of(&op);
                blocks[cur].ops.push(
                    Op::new(OpKind::Reduce { dim: 0, kind }, op.operands, op.results)
                        .with_span(op.span),
                );
            }
            OpKind::ReduceReturn => {
                // Only meaningful inside a reduce region; dropped with it.
            }
            _ => blocks[cur].ops.push(op),
        }
    }
    cur
}

fn flatten_for(blocks: &mut Vec<Block>, cur: usize, mut op: Op, types: &mut TypeTable) -> usize {
    debug_assert!(op.results.is_empty(), "loop-carried results lower through memory");
    let (lb, ub, step) = (op.operands[0], op.operands[1], op.operands[2]);
    let mut body_region = op.regions.remove(0);
    let first = body_region.blocks.first_mut();
    let iv = match first.and_then(|b| {
        if b.args.is_empty() {
            None
        } else {
            Some(b.args.remove(0))
        }
    }) {
        Some(iv) => iv,
        None => types.new_value(types.type_of(lb).clone()),
    };

    let header = blocks.len();
    blocks.push(Block {
        args: vec![iv],
        ops: Vec::new(),
    });
    blocks[cur]
        .ops
        .push(Op::new(OpKind::Br { target: header }, vec![lb], vec![]));

    let body = blocks.len();
    blocks.push(Block::default());
    let body_ops: Vec<Op> = body_region.blocks.into_iter().flat_map(|b| b.ops).collect();
    let body_end = flatten_ops(blocks, body, body_ops, types);

    // Latch: bump the induction variable and jump back to the header.
    drop_trailing_yield(&mut blocks[body_end]);
    let next = types.new_value(types.type_of(iv).clone());
    blocks[body_end]
        .ops
        .push(Op::new(OpKind::Binary(BinOp::Add), vec![iv, step], vec![next]));
    blocks[body_end]
        .ops
        .push(Op::new(OpKind::Br { target: header }, vec![next], vec![]));

    let exit = blocks.len();
    blocks.push(Block::default());

    let cond = types.new_value(Type::Scalar(ElemType::I1));
    blocks[header]
        .ops
        .push(Op::new(OpKind::CmpInt(CmpPred::Lt), vec![iv, ub], vec![cond]));
    blocks[header].ops.push(Op::new(
        OpKind::CondBr {
            then_target: body,
            else_target: exit,
        },
        vec![cond],
        vec![],
    ));
    exit
}

fn flatten_if(blocks: &mut Vec<Block>, cur: usize, mut op: Op, types: &mut TypeTable) -> usize {
    let cond = op.operands[0];
    let else_region = if op.regions.len() > 1 {
        op.regions.pop()
    } else {
        None
    };
    let then_region = op.regions.pop().unwrap_or_default();

    let then_idx = blocks.len();
    blocks.push(Block::default());
    let then_ops: Vec<Op> = then_region.blocks.into_iter().flat_map(|b| b.ops).collect();
    let then_end = flatten_ops(blocks, then_idx, then_ops, types);

    let (else_idx, else_end) = match else_region {
        Some(region) if !region.blocks.is_empty() => {
            let idx = blocks.len();
            blocks.push(Block::default());
            let ops: Vec<Op> = region.blocks.into_iter().flat_map(|b| b.ops).collect();
            (Some(idx), Some(flatten_ops(blocks, idx, ops, types)))
        }
        _ => (None, None),
    };

    let merge = blocks.len();
    blocks.push(Block {
        args: op.results.clone(),
        ops: Vec::new(),
    });

    blocks[cur].ops.push(Op::new(
        OpKind::CondBr {
            then_target: then_idx,
            else_target: else_idx.unwrap_or(merge),
        },
        vec![cond],
        vec![],
    ));
    yield_to_branch(&mut blocks[then_end], merge);
    if let Some(end) = else_end {
        yield_to_branch(&mut blocks[end], merge);
    }
    merge
}

fn drop_trailing_yield(block: &mut Block) {
    if matches!(block.ops.last().map(|o| &o.kind), Some(OpKind::Yield)) {
        block.ops.pop();
    }
}

/// Rewrite a trailing `scf.yield` into a branch to `target`, forwarding
/// the yielded values as block arguments.
fn yield_to_branch(block: &mut Block, target: usize) {
    let operands = match block.ops.last() {
        Some(op) if matches!(op.kind, OpKind::Yield) => block.ops.pop().unwrap().operands,
        _ => Vec::new(),
    };
    block
        .ops
        .push(Op::new(OpKind::Br { target }, operands, vec![]));
}

/// The reduce kind is read off the combiner region's arithmetic op.
fn reduce_kind_of(op: &Op) -> ReduceKind {
    let mut kind = ReduceKind::Sum;
    if let Some(region) = op.regions.first() {
        region.for_each_op(&mut |inner| {
            if let OpKind::Binary(bin) = inner.kind {
                kind = match bin {
                    BinOp::Max => ReduceKind::Max,
                    BinOp::Min => ReduceKind::Min,
                    _ => ReduceKind::Sum,
                };
            }
        });
    }
    kind
}

// ─── Index-type elimination ───────────────────────────────────────

/// Replace the target-independent index type with i64 everywhere.
pub fn eliminate_index_type(func: &mut Function) {
    let ids: Vec<ValueId> = func.types.iter().map(|(id, _)| id).collect();
    for id in ids {
        let ty = match func.types.type_of(id) {
            Type::Scalar(ElemType::Index) => Type::Scalar(ElemType::I64),
            Type::Tensor(t) if t.elem == ElemType::Index => Type::Tensor(TensorType {
                shape: t.shape.clone(),
                elem: ElemType::I64,
                encoding: t.encoding.clone(),
            }),
            _ => continue,
        };
        func.types.set_type(id, ty);
    }
}

// ─── Math-to-extern lowering ──────────────────────────────────────

/// Lower transcendental math ops to calls of external device symbols.
/// Declaring those symbols is what later forces the default math library
/// into the link set.
pub fn lower_math_calls(module: &mut Module) {
    let mut symbols: BTreeSet<String> = BTreeSet::new();
    for func in &mut module.functions {
        let Function { body, types, .. } = func;
        rewrite_math(body, types, &mut symbols);
    }
    for symbol in symbols {
        module.declare_extern(ExternFn {
            name: symbol,
            libname: None,
            libpath: None,
        });
    }
}

fn rewrite_math(region: &mut Region, types: &TypeTable, symbols: &mut BTreeSet<String>) {
    for block in &mut region.blocks {
        for op in &mut block.ops {
            if let OpKind::Math(func) = op.kind {
                let width = types.type_of(op.operands[0]).elem().bit_width();
                let symbol = format!("__tl_{}_f{}", func.name(), width);
                symbols.insert(symbol.clone());
                op.kind = OpKind::Call { callee: symbol };
            }
            for nested in &mut op.regions {
                rewrite_math(nested, types, symbols);
            }
        }
    }
}

// ─── Cleanup: canonicalize, CSE, DCE ──────────────────────────────

/// Constant-fold scalar integer arithmetic and drop identity layout
/// conversions. Purely semantics-preserving.
pub fn canonicalize(func: &mut Function) {
    let Function { body, types, .. } = func;
    let mut replacements: HashMap<ValueId, ValueId> = HashMap::new();
    canonicalize_region(body, types, &mut replacements);
    if !replacements.is_empty() {
        remap_uses(body, &replacements);
    }
}

fn canonicalize_region(
    region: &mut Region,
    types: &mut TypeTable,
    replacements: &mut HashMap<ValueId, ValueId>,
) {
    for block in &mut region.blocks {
        let mut constants: HashMap<ValueId, i64> = HashMap::new();
        let mut kept = Vec::with_capacity(block.ops.len());
        for mut op in block.ops.drain(..) {
            for operand in &mut op.operands {
                if let Some(to) = replacements.get(operand) {
                    *operand = *to;
                }
            }
            match &op.kind {
                OpKind::Constant(ConstValue::Int(v)) => {
                    constants.insert(op.results[0], *v);
                    kept.push(op);
                }
                OpKind::Binary(bin) if op.results.len() == 1 => {
                    let folded = match (
                        constants.get(&op.operands[0]),
                        constants.get(&op.operands[1]),
                    ) {
                        (Some(&a), Some(&b)) => fold_int(*bin, a, b),
                        _ => None,
                    };
                    match folded {
                        Some(v) if matches!(types.type_of(op.results[0]), Type::Scalar(_)) => {
                            constants.insert(op.results[0], v);
                            kept.push(Op::new(
                                OpKind::Constant(ConstValue::Int(v)),
                                vec![],
                                op.results.clone(),
                            ));
                        }
                        _ => kept.push(op),
                    }
                }
                OpKind::ConvertLayout => {
                    let src = op.operands[0];
                    if types.type_of(src) == types.type_of(op.results[0]) {
                        replacements.insert(op.results[0], src);
                    } else {
                        kept.push(op);
                    }
                }
                _ => {
                    for nested in &mut op.regions {
                        canonicalize_region(nested, types, replacements);
                    }
                    kept.push(op);
                }
            }
        }
        block.ops = kept;
    }
}

fn fold_int(op: BinOp, a: i64, b: i64) -> Option<i64> {
    match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => a.checked_div(b),
        BinOp::Rem => a.checked_rem(b),
        BinOp::And => Some(a & b),
        BinOp::Or => Some(a | b),
        BinOp::Xor => Some(a ^ b),
        BinOp::Min => Some(a.min(b)),
        BinOp::Max => Some(a.max(b)),
    }
}

fn remap_uses(region: &mut Region, replacements: &HashMap<ValueId, ValueId>) {
    for block in &mut region.blocks {
        for op in &mut block.ops {
            for operand in &mut op.operands {
                if let Some(to) = replacements.get(operand) {
                    *operand = *to;
                }
            }
            for nested in &mut op.regions {
                remap_uses(nested, replacements);
            }
        }
    }
}

/// Common-subexpression elimination over pure ops, per block.
pub fn cse(func: &mut Function) {
    let Function { body, .. } = func;
    cse_region(body);
}

fn cse_region(region: &mut Region) {
    for block in &mut region.blocks {
        let mut seen: HashMap<String, Vec<ValueId>> = HashMap::new();
        let mut replacements: HashMap<ValueId, ValueId> = HashMap::new();
        let mut kept = Vec::with_capacity(block.ops.len());
        for mut op in block.ops.drain(..) {
            for operand in &mut op.operands {
                if let Some(to) = replacements.get(operand) {
                    *operand = *to;
                }
            }
            for nested in &mut op.regions {
                cse_region(nested);
            }
            if op.kind.is_pure() && op.regions.is_empty() && !op.results.is_empty() {
                let key = format!("{:?}|{:?}", op.kind, op.operands);
                match seen.get(&key) {
                    Some(prior) => {
                        for (old, new) in op.results.iter().zip(prior) {
                            replacements.insert(*old, *new);
                        }
                        continue;
                    }
                    None => {
                        seen.insert(key, op.results.clone());
                    }
                }
            }
            kept.push(op);
        }
        block.ops = kept;
        if !replacements.is_empty() {
            for op in &mut block.ops {
                for operand in &mut op.operands {
                    if let Some(to) = replacements.get(operand) {
                        *operand = *to;
                    }
                }
            }
        }
    }
}

/// Remove pure ops whose results are never used.
pub fn dce(func: &mut Function) {
    loop {
        let mut used: BTreeSet<ValueId> = BTreeSet::new();
        func.for_each_op(&mut |op| {
            for operand in &op.operands {
                used.insert(*operand);
            }
        });
        let before = count_ops(&func.body);
        prune_region(&mut func.body, &used);
        if count_ops(&func.body) == before {
            return;
        }
    }
}

fn count_ops(region: &Region) -> usize {
    let mut n = 0;
    region.for_each_op(&mut |_| n += 1);
    n
}

fn prune_region(region: &mut Region, used: &BTreeSet<ValueId>) {
    for block in &mut region.blocks {
        block.ops.retain_mut(|op| {
            for nested in &mut op.regions {
                prune_region(nested, used);
            }
            if op.kind.is_pure() && op.regions.is_empty() {
                op.results.iter().any(|r| used.contains(r))
            } else {
                true
            }
        });
    }
}

/// Remove non-kernel functions nothing references.
pub fn symbol_dce(module: &mut Module) {
    let mut called: BTreeSet<String> = BTreeSet::new();
    for func in &module.functions {
        func.for_each_op(&mut |op| {
            if let OpKind::Call { callee } = &op.kind {
                called.insert(callee.clone());
            }
        });
    }
    module
        .functions
        .retain(|f| f.is_kernel || called.contains(&f.name));
    module.externs.retain(|e| called.contains(&e.name));
}
