//! Benchmark keyframe ingestion and local-area optimization on a corridor
//! trajectory with exactly consistent measurements.

use std::collections::BTreeSet;
use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::DVector;
use setu_rba::{Cartesian2D, NewObservation, OptimizeLocalAreaParams, RbaEngine, RbaParams};

/// Observations of the corridor landmarks (two per column, flanking the x
/// axis) visible from a keyframe at `(x, 0)` with zero heading.
fn corridor_observations(seen: &mut BTreeSet<u64>, x: f64, columns: usize) -> Vec<NewObservation> {
    let mut observations = Vec::new();
    for j in 0..columns {
        let lx = j as f64 + 0.5;
        if (lx - x).abs() > 1.6 {
            continue;
        }
        for (id, ly) in [(2 * j as u64, 1.0), (2 * j as u64 + 1, -1.0)] {
            let z = DVector::from_vec(vec![lx - x, ly]);
            let obs = if seen.insert(id) {
                NewObservation::with_initial_position(id, z.clone(), z)
            } else {
                NewObservation::new(id, z)
            };
            observations.push(obs);
        }
    }
    observations
}

/// Drive a corridor of `num_kfs` keyframes with automatic optimization.
fn built_engine(num_kfs: usize) -> RbaEngine<Cartesian2D> {
    let mut engine = RbaEngine::new(Cartesian2D, RbaParams::default());
    let mut seen = BTreeSet::new();
    for i in 0..num_kfs {
        let obs = corridor_observations(&mut seen, i as f64, num_kfs + 2);
        engine.define_new_keyframe(&obs, true).unwrap();
    }
    engine
}

fn bench_define_new_keyframe(c: &mut Criterion) {
    let mut group = c.benchmark_group("define_new_keyframe");
    for &num_kfs in &[5usize, 10, 20] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_kfs),
            &num_kfs,
            |b, &num_kfs| {
                b.iter(|| black_box(built_engine(num_kfs)));
            },
        );
    }
    group.finish();
}

fn bench_optimize_local_area(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize_local_area");
    for &num_kfs in &[10usize, 20] {
        let mut engine = built_engine(num_kfs);
        let root = engine.graph().num_keyframes() - 1;
        group.bench_with_input(BenchmarkId::from_parameter(num_kfs), &num_kfs, |b, _| {
            b.iter(|| {
                black_box(
                    engine
                        .optimize_local_area(root, 2, &OptimizeLocalAreaParams::default())
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_define_new_keyframe, bench_optimize_local_area);
criterion_main!(benches);
