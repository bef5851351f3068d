use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;
use skypart::geom::chunker::Chunker;
use skypart::geom::htm::{SphericalTriangle, htm_id, htm_ids_overlapping, htm_level};
use skypart::geom::sphere::{SphericalBox, cartesian};

fn random_positions(n: usize) -> Vec<(f64, f64)> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| {
            let ra = rng.gen_range(0.0..360.0);
            // uniform on the sphere
            let z: f64 = rng.gen_range(-1.0..1.0);
            (ra, z.asin().to_degrees())
        })
        .collect()
}

/// Benchmark HTM id computation across subdivision levels
fn bench_htm_id(c: &mut Criterion) {
    let positions = random_positions(4096);
    let mut group = c.benchmark_group("htm_id");
    for level in [4, 8, 13] {
        group.bench_with_input(BenchmarkId::from_parameter(level), &level, |b, &level| {
            let mut i = 0;
            b.iter(|| {
                let (ra, dec) = positions[i % positions.len()];
                i += 1;
                black_box(htm_id(cartesian(ra, dec), level).unwrap())
            });
        });
    }
    group.finish();
}

/// Benchmark id decoding and trixel construction
fn bench_trixel(c: &mut Criterion) {
    let ids: Vec<u32> = random_positions(1024)
        .iter()
        .map(|&(ra, dec)| htm_id(cartesian(ra, dec), 10).unwrap())
        .collect();
    c.bench_function("htm_level", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            black_box(htm_level(ids[i % ids.len()]))
        });
    });
    c.bench_function("trixel_build", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            black_box(SphericalTriangle::new(ids[i % ids.len()]).unwrap())
        });
    });
}

/// Benchmark chunk location with overlap
fn bench_locate(c: &mut Criterion) {
    let chunker = Chunker::new(0.01667, 85, 12).unwrap();
    let positions = random_positions(4096);
    c.bench_function("chunker_locate", |b| {
        let mut locs = Vec::new();
        let mut i = 0;
        b.iter(|| {
            let (ra, dec) = positions[i % positions.len()];
            i += 1;
            locs.clear();
            chunker.locate(ra, dec, -1, &mut locs);
            black_box(locs.len())
        });
    });
}

/// Benchmark conservative box coverage enumeration
fn bench_box_coverage(c: &mut Criterion) {
    let boxes = [
        SphericalBox::new(10.0, 12.0, -1.0, 1.0),
        SphericalBox::new(350.0, 5.0, 60.0, 70.0),
    ];
    c.bench_function("htm_ids_overlapping", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            black_box(htm_ids_overlapping(&boxes[i % boxes.len()], 8).unwrap().len())
        });
    });
}

criterion_group!(benches, bench_htm_id, bench_trixel, bench_locate, bench_box_coverage);
criterion_main!(benches);
