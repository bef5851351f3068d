use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;
use skypart::core::config::IndexerConfig;
use skypart::index::indexer::index;
use skypart::io::writer::BlockWriter;

fn write_catalog(dir: &std::path::Path, lines: usize) -> std::path::PathBuf {
    let mut rng = rand::thread_rng();
    let mut text = String::with_capacity(lines * 32);
    for id in 0..lines {
        let ra: f64 = rng.gen_range(0.0..360.0);
        let dec: f64 = rng.gen_range(-90.0..90.0);
        text.push_str(&format!("{},{:.6},{:.6}\n", id, ra, dec));
    }
    let path = dir.join("catalog.csv");
    std::fs::write(&path, text).unwrap();
    path
}

/// Benchmark the async block writer against small appends
fn bench_block_writer(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let line = vec![b'x'; 128];
    let mut group = c.benchmark_group("block_writer_append");
    for block_size in [64 * 1024, 1024 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(block_size),
            &block_size,
            |b, &block_size| {
                let mut writer =
                    BlockWriter::new(dir.path().join(format!("out-{}", block_size)), block_size)
                        .unwrap();
                b.iter(|| {
                    writer.append(black_box(&line)).unwrap();
                });
                writer.close().unwrap();
            },
        );
    }
    group.finish();
}

/// Benchmark the full external sort over a small synthetic catalog
fn bench_index_job(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let input = write_catalog(dir.path(), 100_000);
    let mut group = c.benchmark_group("index_job");
    group.sample_size(10);
    for arity in [2usize, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(arity), &arity, |b, &arity| {
            let mut run = 0;
            b.iter(|| {
                run += 1;
                let cfg = IndexerConfig {
                    input_files: vec![input.clone()],
                    fields: vec!["id".into(), "ra".into(), "decl".into()],
                    htm_level: 8,
                    merge_arity: arity,
                    num_threads: 4,
                    index_dir: dir.path().join(format!("index-{}-{}", arity, run)),
                    scratch_dir: dir.path().join(format!("scratch-{}-{}", arity, run)),
                    ..IndexerConfig::default()
                };
                black_box(index(&cfg).unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_block_writer, bench_index_job);
criterion_main!(benches);
