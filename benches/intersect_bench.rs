use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vixdump::extent::{Extent, Intersection};

const S: u64 = 512;

/// Alternating changed/allocated interval lists that overlap on every
/// other block, the worst case for the two-pointer walk.
fn make_lists(blocks: u64) -> (Vec<Extent>, Vec<Extent>) {
    let changed = (0..blocks)
        .map(|i| Extent::new(i * 8 * S, 5 * S))
        .collect();
    let allocated = (0..blocks)
        .map(|i| Extent::new(i * 8 * S + 3 * S, 4 * S))
        .collect();
    (changed, allocated)
}

fn bench_intersection(c: &mut Criterion) {
    let mut group = c.benchmark_group("intersection");

    for blocks in [100u64, 1000, 10000].iter() {
        let (changed, allocated) = make_lists(*blocks);

        group.bench_with_input(BenchmarkId::from_parameter(blocks), blocks, |b, _| {
            b.iter(|| {
                Intersection::new(black_box(&changed), black_box(&allocated))
                    .map(|e| e.length)
                    .sum::<u64>()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_intersection);
criterion_main!(benches);
