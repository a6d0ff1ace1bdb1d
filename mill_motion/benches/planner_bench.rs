//! Planner benchmarks: block append with back-planning over a zig-zag
//! path, and the trapezoid solver in its common and pathological cases.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use mill_common::config::ResolvedConfig;
use mill_common::consts::AXES;
use mill_motion::planner::buffer::Block;
use mill_motion::planner::zoid::{calculate_trapezoid, target_velocity};
use mill_motion::planner::Planner;

/// Append `n` short zig-zag segments, draining the ring between batches the
/// way the main loop would.
#[inline(never)]
fn append_zigzag(cfg: &ResolvedConfig, n: usize) {
    let mut planner = Planner::new();
    let mut x = 0.0;
    let mut y = 0.0;
    for i in 0..n {
        if planner.buffers_available() <= 8 {
            planner.flush();
            planner.set_position(&[x, y, 0.0, 0.0, 0.0, 0.0]);
        }
        x += 2.0;
        y = if i % 2 == 0 { y + 0.5 } else { y - 0.5 };
        let mut target = [0.0; AXES];
        target[0] = x;
        target[1] = y;
        let length = 2.0f64.hypot(0.5);
        planner
            .append_line(cfg, &target, length / 1500.0, &[0.0; AXES], 0.0, i as u32)
            .expect("append");
    }
}

fn solver_block(length: f64, entry: f64, cruise: f64, exit: f64) -> Block {
    let jerk = 5.0e9;
    let mut bf = Block::new();
    bf.length = length;
    bf.entry_velocity = entry;
    bf.cruise_velocity = cruise;
    bf.cruise_vmax = cruise;
    bf.exit_velocity = exit;
    bf.jerk = jerk;
    bf.recip_jerk = 1.0 / jerk;
    bf.cbrt_jerk = jerk.cbrt();
    bf.delta_vmax = target_velocity(0.0, length, jerk, jerk.cbrt());
    bf
}

fn bench_planner_append(c: &mut Criterion) {
    let cfg = ResolvedConfig::default();
    let mut group = c.benchmark_group("planner_append");
    for n in [16usize, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| append_zigzag(&cfg, n));
        });
    }
    group.finish();
}

fn bench_trapezoid_solver(c: &mut Criterion) {
    let mut group = c.benchmark_group("trapezoid");
    group.bench_function("requested_fit", |b| {
        b.iter(|| {
            let mut bf = solver_block(100.0, 0.0, 3000.0, 0.0);
            calculate_trapezoid(&mut bf);
            bf.cruise_velocity
        });
    });
    group.bench_function("asymmetric_rate_limited", |b| {
        b.iter(|| {
            let mut bf = solver_block(10.0, 3000.0, 30_000.0, 0.0);
            calculate_trapezoid(&mut bf);
            bf.cruise_velocity
        });
    });
    group.bench_function("pathological_short", |b| {
        b.iter(|| {
            let mut bf = solver_block(0.1, 0.0, 6000.0, 0.0);
            calculate_trapezoid(&mut bf);
            bf.cruise_velocity
        });
    });
    group.finish();
}

criterion_group!(benches, bench_planner_append, bench_trapezoid_solver);
criterion_main!(benches);
