//! Property tests over randomized data and launch geometries.

use std::sync::Arc;

use gridfold::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn launch_sum(engine: &CpuEngine, mode: GridMode, data: Arc<Vec<i64>>, grid: u32, block: u32) -> i64 {
    let sum = ReduceSum::with_mode(0i64, mode);
    let threads = grid as usize * block as usize;
    assert!(threads >= data.len());

    engine
        .launch(&LaunchConfig::new(grid, block), &sum, move |ctx, acc| {
            let i = ctx.global_thread_id();
            if i < data.len() {
                *acc += data[i];
            }
        })
        .unwrap();

    sum.get().unwrap()
}

#[test]
fn sum_matches_serial_across_geometries() {
    let engine = CpuEngine::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    // Ragged block sizes exercise the guarded shuffle path; multi-block
    // grids exercise the last-block handshake.
    for &(grid, block) in &[
        (1u32, 1u32),
        (1, 17),
        (1, 32),
        (1, 33),
        (2, 64),
        (3, 50),
        (4, 96),
        (5, 31),
        (6, 64),
    ] {
        let n = rng.gen_range(0..=(grid * block) as usize);
        let data: Arc<Vec<i64>> = Arc::new((0..n).map(|_| rng.gen_range(-1000..1000)).collect());
        let expect: i64 = data.iter().sum();

        for mode in [GridMode::Tree, GridMode::Atomic] {
            let got = launch_sum(&engine, mode, Arc::clone(&data), grid, block);
            assert_eq!(got, expect, "grid={grid} block={block} mode={mode:?}");
        }
    }
}

#[test]
fn repeated_launches_publish_exactly_once_each() {
    // A double slot write or a missed one would corrupt the integer sums.
    let engine = CpuEngine::new();
    let mut rng = StdRng::seed_from_u64(42);

    for round in 0..40 {
        let grid = rng.gen_range(1..=5);
        let block = rng.gen_range(1..=80);
        let mode = if round % 2 == 0 { GridMode::Tree } else { GridMode::Atomic };
        let data: Arc<Vec<i64>> =
            Arc::new((0..(grid * block) as usize).map(|_| rng.gen_range(-50..50)).collect());
        let expect: i64 = data.iter().sum();

        let got = launch_sum(&engine, mode, data, grid, block);
        assert_eq!(got, expect, "round={round} grid={grid} block={block}");
    }
}

#[test]
fn min_max_match_serial() {
    let engine = CpuEngine::new();
    let mut rng = StdRng::seed_from_u64(7);

    let data: Arc<Vec<f64>> = Arc::new((0..500).map(|_| rng.gen_range(-1e6..1e6)).collect());
    let serial_min = data.iter().copied().fold(f64::INFINITY, f64::min);
    let serial_max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let min = ReduceMin::new(f64::INFINITY);
    let max = ReduceMax::new(f64::NEG_INFINITY);

    let d = Arc::clone(&data);
    engine
        .launch(&LaunchConfig::new(4, 125), (&min, &max), move |ctx, (lo, hi)| {
            let i = ctx.global_thread_id();
            if i < d.len() {
                lo.min(d[i]);
                hi.max(d[i]);
            }
        })
        .unwrap();

    assert_eq!(min.get().unwrap(), serial_min);
    assert_eq!(max.get().unwrap(), serial_max);
}

#[test]
fn minloc_returns_lowest_extreme_index() {
    let engine = CpuEngine::new();
    let mut rng = StdRng::seed_from_u64(99);

    // Coarse values force plenty of duplicates.
    let data: Arc<Vec<f64>> =
        Arc::new((0..384).map(|_| f64::from(rng.gen_range(-20i32..20))).collect());

    let mut serial = (f64::INFINITY, NO_LOC);
    for (i, &v) in data.iter().enumerate() {
        if v < serial.0 {
            serial = (v, i as i64);
        }
    }

    let minloc = ReduceMinLoc::new(f64::INFINITY, NO_LOC);
    let d = Arc::clone(&data);
    engine
        .launch(&LaunchConfig::new(3, 128), &minloc, move |ctx, acc| {
            let i = ctx.global_thread_id();
            if i < d.len() {
                acc.minloc(d[i], i as i64);
            }
        })
        .unwrap();

    assert_eq!(minloc.get().unwrap(), serial.0);
    assert_eq!(minloc.get_loc().unwrap(), serial.1);
}

#[test]
fn multi_stream_results_fold_into_one_read() {
    let engine = CpuEngine::new();
    let s1 = engine.create_stream();
    let s2 = engine.create_stream();

    let sum = ReduceSum::new(5i64);

    engine
        .launch_on(&s1, &LaunchConfig::new(2, 64), &sum, |_, acc| acc.add(1))
        .unwrap();
    engine
        .launch_on(&s2, &LaunchConfig::new(3, 32), &sum, |_, acc| acc.add(10))
        .unwrap();

    // 5 + 128 * 1 + 96 * 10.
    assert_eq!(sum.get().unwrap(), 5 + 128 + 960);
}

#[test]
fn sequential_launches_accumulate_one_slot_each() {
    let engine = CpuEngine::new();
    let sum = ReduceSum::new(0i64);

    for _ in 0..5 {
        engine
            .launch(&LaunchConfig::new(2, 32), &sum, |_, acc| acc.add(2))
            .unwrap();
    }

    engine.default_stream().synchronize().unwrap();
    assert_eq!(sum.pending_results(), 5);
    assert_eq!(sum.get().unwrap(), 5 * 2 * 64);
    assert_eq!(sum.pending_results(), 0);
}

#[test]
fn read_is_idempotent() {
    let engine = CpuEngine::new();
    let max = ReduceMax::new(i64::MIN);

    engine
        .launch(&LaunchConfig::new(2, 128), &max, |ctx, acc| {
            acc.max(ctx.global_thread_id() as i64);
        })
        .unwrap();

    let first = max.get().unwrap();
    let second = max.get().unwrap();
    assert_eq!(first, 255);
    assert_eq!(first, second);
}

#[test]
fn atomic_path_installs_nonzero_identity_before_combines() {
    // Every input exceeds 5, so any block observing the accumulator as 0
    // instead of the +inf-like identity would drag the minimum to 0.
    let engine = CpuEngine::new();

    for _ in 0..20 {
        let min = ReduceMin::with_mode(i32::MAX, GridMode::Atomic);
        engine
            .launch(&LaunchConfig::new(6, 64), &min, |ctx, acc| {
                acc.min(5 + ctx.global_thread_id() as i32);
            })
            .unwrap();
        assert_eq!(min.get().unwrap(), 5);
    }
}

#[test]
fn atomic_path_handles_bitwise_zero_identity() {
    // Sum's identity is all-zero bytes: the accumulator needs no explicit
    // initialization, but the completion handshake must still select
    // exactly one publishing block.
    let engine = CpuEngine::new();

    for _ in 0..20 {
        let sum = ReduceSum::with_mode(0i64, GridMode::Atomic);
        engine
            .launch(&LaunchConfig::new(5, 64), &sum, |_, acc| acc.add(3))
            .unwrap();
        assert_eq!(sum.get().unwrap(), 3 * 5 * 64);
    }
}

#[test]
fn concurrent_launches_from_host_threads() {
    let engine = Arc::new(CpuEngine::new());
    let sum = Arc::new(ReduceSum::new(0i64));

    std::thread::scope(|s| {
        for _ in 0..4 {
            let engine = Arc::clone(&engine);
            let sum = Arc::clone(&sum);
            s.spawn(move || {
                let stream = engine.create_stream();
                for _ in 0..3 {
                    engine
                        .launch_on(&stream, &LaunchConfig::new(2, 32), &*sum, |_, acc| {
                            acc.add(1)
                        })
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(sum.get().unwrap(), 4 * 3 * 64);
}
