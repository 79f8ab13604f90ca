// Write performance benchmarks for HSD

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hsd::{Manifest, Options, Stream, StreamId};
use rand::Rng;
use std::hint::black_box;
use tempfile::TempDir;

const SID: StreamId = StreamId::new([0xBE, 0x0C, 0, 0, 0, 0, 0, 1]);

fn open_stream(dir: &TempDir, manifest: Manifest, sync: bool) -> Stream {
    Stream::init(dir.path(), manifest, Options::default().sync_writes(sync)).unwrap()
}

fn benchmark_sequential_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_append");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                let stream = open_stream(&temp_dir, Manifest::new(SID), false);

                for i in 0..size {
                    let record = format!("record{:08}", i);
                    stream.append(record.as_bytes()).unwrap();
                }

                black_box(&stream);
            });
        });
    }

    group.finish();
}

fn benchmark_record_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_size");

    for size in [16, 256, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes((*size * 100) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut rng = rand::rng();
            let mut record = vec![0u8; size];
            rng.fill(&mut record[..]);

            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                let stream = open_stream(&temp_dir, Manifest::new(SID), false);
                for _ in 0..100 {
                    stream.append(&record).unwrap();
                }
                black_box(&stream);
            });
        });
    }

    group.finish();
}

fn benchmark_block_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_finalize");

    for per_block in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::from_parameter(per_block), per_block, |b, &per_block| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                let stream = open_stream(&temp_dir, Manifest::new(SID), false);
                for i in 0..1000 {
                    stream.append(format!("r{}", i).as_bytes()).unwrap();
                    if (i + 1) % per_block == 0 {
                        stream.finalize_block().unwrap();
                    }
                }
                black_box(&stream);
            });
        });
    }

    group.finish();
}

fn benchmark_file_rotation(c: &mut Criterion) {
    c.bench_function("file_rotation", |b| {
        b.iter(|| {
            let temp_dir = TempDir::new().unwrap();
            let stream = open_stream(&temp_dir, Manifest::new(SID), false);
            for file in 0..10 {
                for block in 0..10 {
                    stream.append(format!("file{}-block{}", file, block).as_bytes()).unwrap();
                    stream.finalize_block().unwrap();
                }
                stream.finalize_file().unwrap();
            }
            black_box(&stream);
        });
    });
}

fn benchmark_synced_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("synced_append");
    group.sample_size(10);

    group.bench_function("100_records", |b| {
        b.iter(|| {
            let temp_dir = TempDir::new().unwrap();
            let stream = open_stream(&temp_dir, Manifest::new(SID), true);
            for i in 0..100 {
                stream.append(format!("record{:08}", i).as_bytes()).unwrap();
            }
            black_box(&stream);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_sequential_append,
    benchmark_record_sizes,
    benchmark_block_finalize,
    benchmark_file_rotation,
    benchmark_synced_append
);
criterion_main!(benches);
