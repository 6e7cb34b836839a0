//! Benchmarks for the pointstore history pipeline
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pointstore::query::decimate;
use pointstore::storage::record::{decode_line, encode_line};
use pointstore::storage::*;
use std::sync::Arc;
use tempfile::tempdir;

fn create_test_samples(count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| Sample::new(i as i64 * 1000, i as f64 * 0.5).raw(i as i32))
        .collect()
}

fn bench_record_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");
    let samples = create_test_samples(1000);
    let lines: Vec<String> = samples.iter().map(encode_line).collect();

    group.throughput(Throughput::Elements(samples.len() as u64));

    group.bench_function("encode_1000", |b| {
        b.iter(|| {
            for sample in &samples {
                black_box(encode_line(black_box(sample)));
            }
        })
    });

    group.bench_function("decode_1000", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(decode_line(black_box(line)).unwrap());
            }
        })
    });

    group.finish();
}

fn bench_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");
    let registry = Arc::new(PointRegistry::new(1000));
    let history = RecentHistory::new(registry);
    let point = PointId::new("bench", "value");

    group.bench_function("record_single", |b| {
        let mut ts = 0i64;
        b.iter(|| {
            ts += 1;
            history.record(&point, black_box(Sample::new(ts, 1.0)))
        })
    });

    group.bench_function("window_100", |b| {
        b.iter(|| {
            let end = history.latest(&point).map_or(0, |s| s.timestamp);
            history.window(&point, TimeRange::new(end - 100, end))
        })
    });

    group.finish();
}

fn bench_decimate(c: &mut Criterion) {
    let mut group = c.benchmark_group("decimate");

    for size in [1000, 10000, 100000] {
        let samples = create_test_samples(size);
        let range = TimeRange::new(0, size as i64 * 1000);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("to_500_from_{}", size), |b| {
            b.iter(|| decimate(black_box(samples.clone()), range, 500))
        });
    }

    group.finish();
}

fn bench_flatfile(c: &mut Criterion) {
    let mut group = c.benchmark_group("flatfile");
    group.sample_size(20);

    let dir = tempdir().unwrap();
    let archive = FlatFileArchive::open(
        FlatFileConfig::new(dir.path().join("archive"))
            .temp_dir(dir.path().join("tmp"))
            .max_segment_size(u64::MAX)
            .max_segment_age(None),
    )
    .unwrap();
    let point = PointId::new("bench", "value");
    let batch = create_test_samples(1000);
    archive.persist(&point, &batch).unwrap();

    group.throughput(Throughput::Elements(batch.len() as u64));

    group.bench_function("extract_1000", |b| {
        b.iter(|| {
            archive
                .extract(&point, black_box(TimeRange::new(0, 1_000_000)))
                .unwrap()
        })
    });

    group.bench_function("persist_100", |b| {
        let mut base = 10_000_000i64;
        b.iter(|| {
            let batch: Vec<Sample> = (0..100).map(|i| Sample::new(base + i, 1.0)).collect();
            base += 100;
            archive.persist(&point, &batch).unwrap()
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_record_codec,
    bench_buffer,
    bench_decimate,
    bench_flatfile
);
criterion_main!(benches);
