use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;

use idet::config::GridSpec;
use idet::geometry::Quad;
use idet::nms::{nms, Detection};
use idet::tiling::make_tiles;

fn synthetic_detections(n: usize) -> Vec<Detection> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| {
            let x0 = rng.gen_range(0.0..2000.0);
            let y0 = rng.gen_range(0.0..2000.0);
            let w = rng.gen_range(10.0..80.0);
            let h = rng.gen_range(10.0..80.0);
            let pts: Quad = [(x0, y0), (x0 + w, y0), (x0 + w, y0 + h), (x0, y0 + h)];
            Detection { pts, score: rng.gen_range(0.0..1.0) }
        })
        .collect()
}

fn bench_nms(c: &mut Criterion) {
    let mut group = c.benchmark_group("nms");
    for &n in &[100usize, 1_000, 5_000] {
        let dets = synthetic_detections(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &dets, |b, dets| {
            b.iter(|| nms(dets, 0.3, true));
        });
    }
    group.finish();
}

fn bench_make_tiles(c: &mut Criterion) {
    let mut group = c.benchmark_group("make_tiles");
    for &(rows, cols) in &[(1u32, 1u32), (2, 2), (4, 4)] {
        let grid = GridSpec { rows, cols };
        group.bench_with_input(BenchmarkId::from_parameter(format!("{rows}x{cols}")), &grid, |b, grid| {
            b.iter(|| make_tiles(4000, 3000, *grid, 0.1));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_nms, bench_make_tiles);
criterion_main!(benches);
