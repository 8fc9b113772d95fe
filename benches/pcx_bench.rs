//! Criterion benchmarks for predictive coding training.
//!
//! Run with: `cargo bench --bench pcx_bench`
//!
//! ## Benchmarks
//!
//! 1. **Gradient of the batch energy**: one traced forward + backward pass
//! 2. **Batch training**: pc vs ppc over batch sizes
//! 3. **Partition/merge**: the bookkeeping cost around every transformed call

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pcx::model::normal_init;
use pcx::partition::{merge, partition};
use pcx::training::{energy_loss, initialize, x_filter};
use pcx::transform::grad_and_value;
use pcx::{Activation, PcDecoder, PcMode, RandomKeyGenerator, RelaxConfig, Session, Sgd, Tensor};

/// Create a decoder with gelu activation for benchmarking.
fn bench_decoder(dims: &[usize]) -> PcDecoder {
    let mut rkg = RandomKeyGenerator::new(0);
    PcDecoder::with_dims(dims, Activation::Gelu, Some(normal_init()), &mut rkg)
        .expect("Failed to create benchmark decoder")
}

fn bench_batch(batch: usize, dim: usize) -> Tensor {
    RandomKeyGenerator::new(1).normal(&[batch, dim])
}

fn bench_energy_gradient(c: &mut Criterion) {
    let dims = [2, 32, 32, 16];
    let examples = bench_batch(16, 16);
    let mut model = bench_decoder(&dims);
    let mut rkg = RandomKeyGenerator::new(2);
    initialize(&examples, &mut model, &mut rkg).expect("initialize");
    let grad = grad_and_value(x_filter(), energy_loss::<PcDecoder>());

    c.bench_function("energy_gradient_2_32_32_16_b16", |b| {
        b.iter(|| {
            let params = partition(&model, grad.filter()).expect("partition");
            black_box(
                grad.call_pure(&model, &params, std::slice::from_ref(&examples))
                    .expect("grad"),
            );
        })
    });
}

fn bench_batch_training(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_training");
    group.sample_size(10);

    for mode in [PcMode::Pc, PcMode::Ppc] {
        for batch_size in [4, 16, 64] {
            let examples = bench_batch(batch_size, 16);
            group.bench_with_input(
                BenchmarkId::new(mode.to_string(), batch_size),
                &examples,
                |b, examples| {
                    let relax = RelaxConfig { t: 10, mode };
                    let mut session = Session::new(
                        bench_decoder(&[2, 32, 16]),
                        Sgd::new(0.1),
                        Sgd::new(0.01).momentum(0.9),
                        relax,
                        RandomKeyGenerator::new(3),
                    )
                    .expect("session");
                    b.iter(|| black_box(session.train_batch(examples).expect("train")));
                },
            );
        }
    }
    group.finish();
}

fn bench_partition_merge(c: &mut Criterion) {
    let mut model = bench_decoder(&[2, 64, 64, 64, 32]);
    let filter = x_filter();

    c.bench_function("partition_merge_4_layers", |b| {
        b.iter(|| {
            let parts = partition(&model, &filter).expect("partition");
            merge(&mut model, parts.target, parts.other).expect("merge");
        })
    });
}

criterion_group!(
    benches,
    bench_energy_gradient,
    bench_batch_training,
    bench_partition_merge
);
criterion_main!(benches);
