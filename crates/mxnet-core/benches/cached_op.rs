use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mxnet_conformance::fixtures::{MLP_INPUT, MlpWeights, mlp_symbol_json};
use mxnet_core::{CachedOp, NdManager, ParameterSet, Shape, Symbol};

fn bench_invoke(c: &mut Criterion) {
    let manager = NdManager::cpu();
    let symbol = Symbol::from_json(&mlp_symbol_json()).unwrap();
    let mut params = ParameterSet::new();
    for (name, dims, values) in MlpWeights::deterministic().named() {
        params
            .insert(name, manager.from_f32(values, &Shape::new(dims)).unwrap())
            .unwrap();
    }
    let mut op = CachedOp::builder(&symbol, &manager)
        .parameters(&params)
        .build()
        .unwrap();

    let mut group = c.benchmark_group("cached_op_mlp");
    for batch in [1usize, 32, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        let x: Vec<f32> = (0..batch * MLP_INPUT).map(|i| i as f32 * 0.001).collect();
        let input = manager
            .from_f32(&x, &Shape::new(vec![batch as i64, MLP_INPUT as i64]))
            .unwrap();
        group.bench_function(BenchmarkId::new("invoke", batch), |b| {
            b.iter(|| op.invoke(&[&input]).unwrap())
        });
    }
    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let manager = NdManager::cpu();
    let symbol = Symbol::from_json(&mlp_symbol_json()).unwrap();
    c.bench_function("cached_op_build_mlp", |b| {
        b.iter(|| CachedOp::builder(&symbol, &manager).build().unwrap())
    });
}

criterion_group!(benches, bench_invoke, bench_build);
criterion_main!(benches);
