//! Benchmarks the hot path of `tao::tools::copy_region`: a full-array copy
//! between two plain (non-shared) arrays of matching and differing element
//! types, across a spread of sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tao::tools::{copy_region, PlainArray};
use tao_common::types::ElementType;
use tao_sync::Deadline;

fn bench_same_type(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_region/same_type");
    for &side in &[16i64, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, &side| {
            let src = PlainArray::new(ElementType::F32, vec![side, side]);
            let mut dst = PlainArray::new(ElementType::F32, vec![side, side]);
            b.iter(|| {
                copy_region(
                    &mut dst,
                    &src,
                    &[0, 0],
                    &[0, 0],
                    &[side, side],
                    2,
                    Deadline::Blocking,
                )
                .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_converting(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_region/converting");
    for &side in &[16i64, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, &side| {
            let src = PlainArray::new(ElementType::U16, vec![side, side]);
            let mut dst = PlainArray::new(ElementType::F64, vec![side, side]);
            b.iter(|| {
                copy_region(
                    &mut dst,
                    &src,
                    &[0, 0],
                    &[0, 0],
                    &[side, side],
                    2,
                    Deadline::Blocking,
                )
                .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_subregion(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_region/subregion");
    let side = 256i64;
    let src = PlainArray::new(ElementType::F32, vec![side, side]);
    let mut dst = PlainArray::new(ElementType::F32, vec![side, side]);
    group.bench_function("quarter", |b| {
        b.iter(|| {
            copy_region(
                &mut dst,
                &src,
                &[0, 0],
                &[side / 2, side / 2],
                &[side / 2, side / 2],
                2,
                Deadline::Blocking,
            )
            .unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_same_type, bench_converting, bench_subregion);
criterion_main!(benches);
