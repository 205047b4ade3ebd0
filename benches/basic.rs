use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};

use copyspace::{CopiedSpace, SpaceConfig};

fn alloc_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc sizes");

    for size in [8, 16, 32, 64, 128, 256].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_batched_ref(
                || CopiedSpace::new(SpaceConfig::default()),
                |space| black_box(space.try_allocate(size).unwrap()),
                BatchSize::NumIterations(10_000),
            );
        });
    }

    group.finish();
}

fn empty_cycle(c: &mut Criterion) {
    c.bench_function("flip and reclaim 64 blocks", |b| {
        b.iter_batched_ref(
            || {
                let space = CopiedSpace::new(SpaceConfig::default());
                for _ in 0..64 {
                    space.try_allocate(32 * 1024).unwrap();
                }
                space
            },
            |space| {
                space.start_copying();
                space.done_copying().unwrap();
            },
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, alloc_sizes, empty_cycle);
criterion_main!(benches);
