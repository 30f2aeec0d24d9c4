//! Lowering pipeline throughput benchmark.
//!
//! Measures the full pipeline on synthetic kernels of growing size:
//! IR construction excluded, lowering through linking included.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tensile::ir::types::{AddrSpace, ElemType, Type};
use tensile::ir::{BinOp, MathFunc};
use tensile::{lower_module, FunctionBuilder, LowerOptions, Module};

/// A chain of `n` dependent elementwise ops ending in a store.
fn synthetic_kernel(n: usize, with_math: bool) -> Module {
    let mut b = FunctionBuilder::new("bench_kernel").kernel(vec![128]);
    let mut v = b.param(Type::tensor(vec![1024], ElemType::F32));
    let p = b.param(Type::tensor(vec![1024], ElemType::Ptr(AddrSpace::Global)));
    for i in 0..n {
        v = match i % 3 {
            0 => b.binary(BinOp::Add, v, v),
            1 => b.binary(BinOp::Mul, v, v),
            _ if with_math => b.math(MathFunc::Exp, v),
            _ => b.binary(BinOp::Max, v, v),
        };
    }
    b.store(p, v);
    b.ret();
    let mut m = Module::new("bench");
    m.functions.push(b.finish());
    m
}

fn bench_lowering(c: &mut Criterion) {
    let mut group = c.benchmark_group("lower_module");
    for n in [8usize, 64, 256] {
        group.bench_function(format!("elementwise/{}", n), |bench| {
            bench.iter(|| {
                let m = synthetic_kernel(n, false);
                black_box(lower_module(m, &LowerOptions::default()).unwrap())
            })
        });
    }
    group.bench_function("with_mathlib_link/64", |bench| {
        bench.iter(|| {
            let m = synthetic_kernel(64, true);
            black_box(lower_module(m, &LowerOptions::default()).unwrap())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_lowering);
criterion_main!(benches);
