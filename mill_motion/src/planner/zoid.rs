//! Trapezoid solver: assigns head/body/tail lengths and velocities to a
//! block from its length and requested entry/cruise/exit velocities.
//!
//! The solver classifies blocks into requested-fit, rate-limited, and
//! degraded-fit cases. The case order is a correctness requirement: the
//! shortest/degenerate cases are tested first, which also minimizes work
//! when streams of pathologically short blocks arrive.
//!
//! Velocity degradation is never an error: a block that cannot honor its
//! requested velocities is folded into a body-only move or slowed until it
//! fits a minimum-time segment.

use mill_common::consts::{
    MIN_SEGMENT_TIME_PLUS_MARGIN, NOM_SEGMENT_TIME, TARGET_VELOCITY_ITERATION_MAX,
    TARGET_VELOCITY_TOLERANCE, TRAPEZOID_ITERATION_ERROR_PERCENT, TRAPEZOID_ITERATION_MAX,
};

use super::buffer::Block;
use crate::math::fp_zero;

// ─── Jerk-Constrained Kinematics ────────────────────────────────────

/// Length needed to move between velocities `v0` and `v1` under the jerk
/// limit: `L = (v0 + v1) · √(|v1 − v0| / Jm)`.
#[inline]
pub fn target_length(v0: f64, v1: f64, recip_jerk: f64) -> f64 {
    (v0 + v1) * ((v1 - v0).abs() * recip_jerk).sqrt()
}

/// Velocity reachable from `v0` over `length` under the jerk limit.
///
/// Starts from the estimate `V ≈ L^(2/3)·∛Jm + v0` and refines with
/// Newton-Raphson on the jerk form `Z(V) = (V − v0)(V + v0)²/L² − Jm`,
/// which converges in a handful of iterations with a good estimate. The
/// iteration cap is a hard stop; the tolerance is the normal exit.
pub fn target_velocity(v0: f64, length: f64, jerk: f64, cbrt_jerk: f64) -> f64 {
    if length <= 0.0 {
        return v0;
    }
    let mut estimate = length.powf(2.0 / 3.0) * cbrt_jerk + v0;

    let l_squared = length * length;
    let v0_squared = v0 * v0;
    for _ in 0..TARGET_VELOCITY_ITERATION_MAX {
        let z = ((estimate - v0) * (estimate + v0) * (estimate + v0)) / l_squared - jerk;
        if z.abs() <= TARGET_VELOCITY_TOLERANCE * jerk {
            break;
        }
        let dz = (2.0 * v0 * estimate - v0_squared + 3.0 * estimate * estimate) / l_squared;
        if dz.abs() < f64::MIN_POSITIVE {
            break;
        }
        estimate -= z / dz;
    }
    estimate.max(v0)
}

// ─── Trapezoid Classification ───────────────────────────────────────

/// Adaptive velocity matching tolerance [mm/min].
#[inline]
fn velocity_tolerance(entry_velocity: f64) -> f64 {
    (entry_velocity / 100.0).max(2.0)
}

/// Compute the head/body/tail partition for a block.
///
/// On entry `length > 0` and `entry ≤ cruise ≥ exit` must hold; the entry
/// velocity must be low enough to decelerate to zero within the block.
/// Lengths are kept exact; velocities may err on the slow side.
pub fn calculate_trapezoid(bf: &mut Block) {
    // Dynamic minimum section lengths for the current velocities: head and
    // tail cover two minimum segments, the body one.
    let min_head = |bf: &Block| MIN_SEGMENT_TIME_PLUS_MARGIN * (bf.cruise_velocity + bf.entry_velocity);
    let min_tail = |bf: &Block| MIN_SEGMENT_TIME_PLUS_MARGIN * (bf.cruise_velocity + bf.exit_velocity);
    let min_body = |bf: &Block| MIN_SEGMENT_TIME_PLUS_MARGIN * bf.cruise_velocity;

    // B"/F cases: block fits a single body segment. Accept the entry
    // velocity, limit the cruise, and take the best exit the velocity slew
    // supports. The jerk value is violated but a single segment never
    // integrates it.
    let mut naiive_move_time = bf.length / bf.cruise_velocity.max(f64::MIN_POSITIVE);
    if naiive_move_time <= NOM_SEGMENT_TIME {
        if naiive_move_time < MIN_SEGMENT_TIME_PLUS_MARGIN {
            naiive_move_time = MIN_SEGMENT_TIME_PLUS_MARGIN;
            bf.cruise_velocity = bf.length / naiive_move_time;
        }
        bf.exit_velocity = (bf.entry_velocity - bf.delta_vmax).min(bf.cruise_velocity).max(0.0);
        bf.body_length = bf.length;
        bf.head_length = 0.0;
        bf.tail_length = 0.0;
        return;
    }

    // B case: velocities all match (or close enough). Frequent in gcode
    // streams full of short colinear lines.
    let tolerance = velocity_tolerance(bf.entry_velocity);
    if (bf.cruise_velocity - bf.entry_velocity) < tolerance
        && (bf.cruise_velocity - bf.exit_velocity) < tolerance
    {
        bf.body_length = bf.length;
        bf.head_length = 0.0;
        bf.tail_length = 0.0;
        return;
    }

    // Head-only and tail-only short-line cases, degraded or requested-fit
    // with the body residual below the minimum.
    bf.body_length = 0.0;
    if bf.length <= min_head(bf) + min_body(bf) + min_tail(bf) {
        if bf.entry_velocity > bf.exit_velocity {
            // Tail-only (short deceleration). Vt = L/t - Vi for T = 2t.
            if bf.length < min_tail(bf) {
                bf.exit_velocity =
                    (bf.length / MIN_SEGMENT_TIME_PLUS_MARGIN - bf.entry_velocity).max(0.0);
            }
            bf.cruise_velocity = bf.entry_velocity;
            bf.tail_length = bf.length;
            bf.head_length = 0.0;
            return;
        }
        if bf.entry_velocity < bf.exit_velocity {
            // Head-only (short acceleration).
            if bf.length < min_head(bf) {
                bf.exit_velocity =
                    (bf.length / MIN_SEGMENT_TIME_PLUS_MARGIN - bf.entry_velocity).max(0.0);
            }
            bf.cruise_velocity = bf.exit_velocity;
            bf.head_length = bf.length;
            bf.tail_length = 0.0;
            return;
        }
    }

    // Ideal section lengths for the requested cruise.
    bf.head_length = target_length(bf.entry_velocity, bf.cruise_velocity, bf.recip_jerk);
    bf.tail_length = target_length(bf.exit_velocity, bf.cruise_velocity, bf.recip_jerk);
    if bf.head_length < min_head(bf) {
        bf.head_length = min_head(bf);
    }
    if bf.tail_length < min_tail(bf) {
        bf.tail_length = min_tail(bf);
    }

    // Rate-limited HT and HT' cases: the length cannot reach the requested
    // cruise velocity.
    if bf.length < bf.head_length + bf.tail_length {
        if (bf.entry_velocity - bf.exit_velocity).abs() < tolerance {
            // Symmetric HT: split the length and compute the cruise.
            bf.head_length = bf.length / 2.0;
            bf.tail_length = bf.head_length;
            bf.cruise_velocity = bf.cruise_vmax.min(target_velocity(
                bf.entry_velocity,
                bf.head_length,
                bf.jerk,
                bf.cbrt_jerk,
            ));

            if bf.head_length < min_head(bf) {
                // Too short even for that: convert to a body-only move at
                // the average of entry and achievable cruise.
                bf.body_length = bf.length;
                bf.head_length = 0.0;
                bf.tail_length = 0.0;
                bf.cruise_velocity = (bf.entry_velocity + bf.cruise_velocity) / 2.0;
                bf.entry_velocity = bf.cruise_velocity;
                bf.exit_velocity = bf.cruise_velocity;
            }
            return;
        }

        // Asymmetric HT': find the achievable cruise by successive
        // approximation, rescaling whichever section dominates.
        let mut computed_velocity = bf.cruise_vmax;
        let mut iterations = 0u8;
        loop {
            bf.cruise_velocity = computed_velocity;
            bf.head_length = target_length(bf.entry_velocity, bf.cruise_velocity, bf.recip_jerk);
            bf.tail_length = target_length(bf.exit_velocity, bf.cruise_velocity, bf.recip_jerk);
            let total = bf.head_length + bf.tail_length;
            if total < f64::MIN_POSITIVE {
                break;
            }
            if bf.head_length > bf.tail_length {
                bf.head_length = (bf.head_length / total) * bf.length;
                computed_velocity =
                    target_velocity(bf.entry_velocity, bf.head_length, bf.jerk, bf.cbrt_jerk);
            } else {
                bf.tail_length = (bf.tail_length / total) * bf.length;
                computed_velocity =
                    target_velocity(bf.exit_velocity, bf.tail_length, bf.jerk, bf.cbrt_jerk);
            }
            iterations += 1;
            let error = (bf.cruise_velocity - computed_velocity).abs()
                / computed_velocity.max(f64::MIN_POSITIVE);
            if error <= TRAPEZOID_ITERATION_ERROR_PERCENT || iterations >= TRAPEZOID_ITERATION_MAX {
                break;
            }
        }

        // Set the velocity and clean up any section that came out too short.
        bf.cruise_velocity = computed_velocity;
        bf.head_length = target_length(bf.entry_velocity, bf.cruise_velocity, bf.recip_jerk);
        bf.tail_length = bf.length - bf.head_length;
        if bf.head_length < min_head(bf) {
            bf.tail_length = bf.length; // adjust the move to be all tail...
            bf.head_length = 0.0;
        }
        if bf.tail_length < min_tail(bf) {
            bf.head_length = bf.length; // ...or all head
            bf.tail_length = 0.0;
        }
        return;
    }

    // Requested-fit cases: HBT, HB, BT, H, T, B.
    bf.body_length = bf.length - bf.head_length - bf.tail_length;

    // A non-zero body below the minimum is distributed into the adjacent
    // sections. This trades small velocity errors for exact distance, which
    // is the invariant that matters.
    if bf.body_length < min_body(bf) && !fp_zero(bf.body_length) {
        if !fp_zero(bf.head_length) {
            if !fp_zero(bf.tail_length) {
                // HBT reduces to HT.
                bf.head_length += bf.body_length / 2.0;
                bf.tail_length += bf.body_length / 2.0;
            } else {
                // HB reduces to H.
                bf.head_length += bf.body_length;
            }
        } else {
            // BT reduces to T.
            bf.tail_length += bf.body_length;
        }
        bf.body_length = 0.0;
    } else if fp_zero(bf.head_length) && fp_zero(bf.tail_length) {
        // Standalone body: snap the cruise to the entry velocity to remove
        // the discontinuity at the cost of top speed.
        bf.cruise_velocity = bf.entry_velocity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mill_common::consts::NOM_SEGMENT_TIME;

    const JERK: f64 = 5.0e9;

    fn line_block(length: f64, entry: f64, cruise: f64, exit: f64) -> Block {
        let mut bf = Block::new();
        bf.length = length;
        bf.entry_velocity = entry;
        bf.cruise_velocity = cruise;
        bf.exit_velocity = exit;
        bf.cruise_vmax = cruise;
        bf.jerk = JERK;
        bf.recip_jerk = 1.0 / JERK;
        bf.cbrt_jerk = JERK.cbrt();
        bf.delta_vmax = target_velocity(0.0, length, JERK, JERK.cbrt());
        bf
    }

    fn assert_partition(bf: &Block) {
        let sum = bf.head_length + bf.body_length + bf.tail_length;
        assert!(
            (sum - bf.length).abs() <= 1e-5 * bf.length,
            "partition {} != length {}",
            sum,
            bf.length
        );
        assert!(bf.head_length >= 0.0 && bf.body_length >= 0.0 && bf.tail_length >= 0.0);
        assert!(
            bf.entry_velocity <= bf.cruise_velocity + 1e-6
                && bf.exit_velocity <= bf.cruise_velocity + 1e-6,
            "velocity ordering violated: {} <= {} >= {}",
            bf.entry_velocity,
            bf.cruise_velocity,
            bf.exit_velocity
        );
        assert!(bf.exit_velocity >= 0.0);
    }

    #[test]
    fn target_length_velocity_are_inverse() {
        let recip = 1.0 / JERK;
        let cbrt = JERK.cbrt();
        for &(v0, v1) in &[(0.0, 600.0), (100.0, 1000.0), (0.0, 10_000.0)] {
            let len = target_length(v0, v1, recip);
            let back = target_velocity(v0, len, JERK, cbrt);
            assert!(
                (back - v1).abs() / v1 < 1e-3,
                "roundtrip {v0}->{v1}: len {len}, back {back}"
            );
        }
    }

    #[test]
    fn target_length_zero_delta() {
        assert_eq!(target_length(600.0, 600.0, 1.0 / JERK), 0.0);
    }

    #[test]
    fn requested_fit_hbt() {
        // Long move: plenty of room for full head, body, tail.
        let mut bf = line_block(100.0, 0.0, 3000.0, 0.0);
        calculate_trapezoid(&mut bf);
        assert_partition(&bf);
        assert!(bf.head_length > 0.0);
        assert!(bf.body_length > 0.0);
        assert!(bf.tail_length > 0.0);
        assert!((bf.cruise_velocity - 3000.0).abs() < 1.0);
    }

    #[test]
    fn matched_velocities_become_body_only() {
        let mut bf = line_block(10.0, 600.0, 600.0, 600.0);
        calculate_trapezoid(&mut bf);
        assert_partition(&bf);
        assert_eq!(bf.body_length, bf.length);
        assert_eq!(bf.head_length, 0.0);
        assert_eq!(bf.tail_length, 0.0);
    }

    #[test]
    fn single_segment_block_degrades_cruise() {
        // Pathologically short block: length/cruise below the minimum
        // segment time forces the cruise down and folds to body-only.
        let cruise = 6000.0;
        let length = cruise * MIN_SEGMENT_TIME_PLUS_MARGIN / 2.0;
        let mut bf = line_block(length, 0.0, cruise, 0.0);
        calculate_trapezoid(&mut bf);
        assert_eq!(bf.body_length, bf.length);
        assert!(bf.cruise_velocity < cruise);
        let expected = length / MIN_SEGMENT_TIME_PLUS_MARGIN;
        assert!((bf.cruise_velocity - expected).abs() < 1e-6);
    }

    #[test]
    fn short_single_segment_keeps_exit_within_slew() {
        // Fits one nominal segment but not rate-limited: exit bounded by
        // entry - delta_vmax.
        let cruise = 1000.0;
        let length = cruise * NOM_SEGMENT_TIME * 0.9;
        let mut bf = line_block(length, 800.0, cruise, 0.0);
        bf.delta_vmax = 100.0;
        calculate_trapezoid(&mut bf);
        assert_eq!(bf.body_length, bf.length);
        assert!((bf.exit_velocity - 700.0).abs() < 1e-9);
    }

    #[test]
    fn tail_only_short_deceleration() {
        // Short block, entry above exit, not body-degenerate.
        let mut bf = line_block(0.2, 1500.0, 1500.0, 0.0);
        calculate_trapezoid(&mut bf);
        assert_partition(&bf);
        assert_eq!(bf.tail_length, bf.length);
        assert_eq!(bf.head_length, 0.0);
        assert_eq!(bf.cruise_velocity, bf.entry_velocity);
    }

    #[test]
    fn head_only_short_acceleration() {
        let mut bf = line_block(0.2, 0.0, 1500.0, 1500.0);
        calculate_trapezoid(&mut bf);
        assert_partition(&bf);
        assert_eq!(bf.head_length, bf.length);
        assert_eq!(bf.tail_length, 0.0);
        assert_eq!(bf.cruise_velocity, bf.exit_velocity);
    }

    #[test]
    fn symmetric_rate_limited_ht() {
        // Entry == exit, length too short to reach the requested cruise:
        // the block splits evenly and the cruise is computed.
        let mut bf = line_block(1.0, 0.0, 8000.0, 0.0);
        calculate_trapezoid(&mut bf);
        assert_partition(&bf);
        assert!(bf.cruise_velocity < 8000.0);
        if bf.body_length == 0.0 {
            assert!((bf.head_length - bf.tail_length).abs() < 1e-9);
        }
    }

    #[test]
    fn asymmetric_rate_limited_ht_converges() {
        // Entry well above exit, length too short for the cruise request.
        let mut bf = line_block(10.0, 3000.0, 30_000.0, 0.0);
        calculate_trapezoid(&mut bf);
        assert_partition(&bf);
        assert!(bf.cruise_velocity < 30_000.0);
        assert!(bf.cruise_velocity >= 3000.0 - 1.0);
    }

    #[test]
    fn thin_body_absorbed_into_head_and_tail() {
        // Tune the length so head + tail almost exactly consume it: the
        // residual body is below MIN_BODY and must be redistributed.
        let cbrt = JERK.cbrt();
        let head = target_length(0.0, 3000.0, 1.0 / JERK);
        let tail = target_length(0.0, 3000.0, 1.0 / JERK);
        let thin = MIN_SEGMENT_TIME_PLUS_MARGIN * 3000.0 * 0.5;
        let mut bf = line_block(head + tail + thin, 0.0, 3000.0, 0.0);
        bf.delta_vmax = target_velocity(0.0, bf.length, JERK, cbrt);
        calculate_trapezoid(&mut bf);
        assert_partition(&bf);
        assert_eq!(bf.body_length, 0.0);
    }
}
