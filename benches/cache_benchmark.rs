use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kcsvm::cache::{Columns, KernelCache};
use kcsvm::{RBFKernel, Sample, SampleKernel, SparseVector, SVMOptimizer};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::Arc;

fn dataset(n: usize, dim: usize) -> Vec<Sample> {
    let mut rng = SmallRng::seed_from_u64(7);
    (0..n)
        .map(|i| {
            let label = if i % 2 == 0 { 1.0 } else { -1.0 };
            let features: Vec<f64> = (0..dim).map(|_| label * 0.3 + rng.gen::<f64>() - 0.5).collect();
            Sample::new(SparseVector::from_dense(&features), label)
        })
        .collect()
}

fn bench_row_fill(c: &mut Criterion) {
    let samples = dataset(2000, 20);
    let kernel = Arc::new(SampleKernel::from_samples(
        Arc::new(RBFKernel::new(0.1)),
        &samples,
    ));
    let batch: Vec<usize> = (0..64).collect();

    let mut group = c.benchmark_group("cache_rows");
    for threads in [1, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &t| {
            b.iter(|| {
                let mut cache = KernelCache::new(Arc::clone(&kernel), 64 * 2000 * 8, false)
                    .and_then(|cache| cache.with_threads(t))
                    .expect("cache");
                black_box(cache.cache_rows(&batch))
            })
        });
    }
    group.finish();
}

fn bench_lru_hits(c: &mut Criterion) {
    let samples = dataset(1000, 10);
    let kernel = Arc::new(SampleKernel::from_samples(
        Arc::new(RBFKernel::new(0.1)),
        &samples,
    ));
    let mut cache = KernelCache::new(kernel, 100 * 1000 * 8, false).expect("cache");
    let mut row = vec![0.0; 1000];

    c.bench_function("get_row_cycle", |b| {
        let mut i = 0;
        b.iter(|| {
            cache.get_row(i % 150, Columns::All, &mut row);
            i += 7;
            black_box(row[0])
        })
    });
}

fn bench_training(c: &mut Criterion) {
    let samples = dataset(300, 10);
    let mut group = c.benchmark_group("train");
    for shrinking in [false, true] {
        group.bench_with_input(
            BenchmarkId::new("shrinking", shrinking),
            &shrinking,
            |b, &s| {
                let optimizer = SVMOptimizer::with_kernel(RBFKernel::new(0.1))
                    .with_shrinking(s)
                    .with_cache_size_mb(1.0);
                b.iter(|| black_box(optimizer.train_samples(&samples).expect("train")))
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_row_fill, bench_lru_hits, bench_training);
criterion_main!(benches);
