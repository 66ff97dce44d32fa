//! Benchmark: uncompressed vs run-length page operations.
//!
//! Both pages hold the same sparse bitmap (one set position every 61) so the
//! numbers compare literal bit access against a run walk.

use bmx_bitmap::{BitPage, BitmapPage, CompressedBitPage};
use bmx_types::PageId;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

const SPAN: u32 = 8000;
const STRIDE: usize = 61;

fn make_pages() -> (BitPage, CompressedBitPage) {
    let mut plain = BitPage::init(PageId(0));
    let mut runs = CompressedBitPage::init(PageId(1));
    for pos in (0..SPAN).step_by(STRIDE) {
        plain.set_bit(pos);
        runs.set_bit(pos);
    }
    (plain, runs)
}

fn bench_check_bit(c: &mut Criterion) {
    let (plain, runs) = make_pages();
    let mut group = c.benchmark_group("check_bit");

    group.bench_function("uncompressed", |b| {
        b.iter(|| black_box(plain.check_bit(black_box(7_000))));
    });

    group.bench_function("compressed", |b| {
        b.iter(|| black_box(runs.check_bit(black_box(7_000))));
    });

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let (plain, runs) = make_pages();
    let mut group = c.benchmark_group("scan_all_set");

    group.bench_function("uncompressed", |b| {
        b.iter(|| {
            let mut from = 0;
            let mut hits = 0_u32;
            while let Some(pos) = plain.next_set_bit(from) {
                hits += 1;
                from = pos + 1;
            }
            black_box(hits)
        });
    });

    group.bench_function("compressed", |b| {
        b.iter(|| {
            let mut from = 0;
            let mut hits = 0_u32;
            while let Some(pos) = runs.next_set_bit(from) {
                hits += 1;
                from = pos + 1;
            }
            black_box(hits)
        });
    });

    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let (_, runs) = make_pages();
    let mut group = c.benchmark_group("set_bit_split");

    group.bench_function("compressed_interior", |b| {
        b.iter_batched(
            || runs.clone(),
            |mut page| black_box(page.set_bit(black_box(4_030))),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_check_bit, bench_scan, bench_split);
criterion_main!(benches);
