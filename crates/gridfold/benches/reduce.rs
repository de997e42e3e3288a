//! Launch-to-read latency of grid reductions on the CPU engine.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use gridfold::prelude::*;

fn bench_sum(c: &mut Criterion) {
    let engine = CpuEngine::new();
    let data: Arc<Vec<i64>> = Arc::new((0..4096).map(|i| i as i64).collect());

    let mut group = c.benchmark_group("sum_4096_i64");
    for (name, mode) in [("tree", GridMode::Tree), ("atomic", GridMode::Atomic)] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &mode, |b, &mode| {
            b.iter(|| {
                let sum = ReduceSum::with_mode(0i64, mode);
                let data = Arc::clone(&data);
                engine
                    .launch(&LaunchConfig::new(4, 256), &sum, move |ctx, acc| {
                        let mut i = ctx.global_thread_id();
                        while i < data.len() {
                            *acc += data[i];
                            i += ctx.grid_threads();
                        }
                    })
                    .unwrap();
                sum.get().unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sum);
criterion_main!(benches);
