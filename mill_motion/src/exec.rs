//! Move executor runtime.
//!
//! Consumes the promoted planner block and slices it into fixed-duration
//! segments, advancing through the head → body → tail sections. Section
//! velocities follow the jerk-limited two-phase profile (peak jerk
//! `4·Δv/T²`); each call produces exactly one segment of per-axis
//! displacement for the stepper prep layer.
//!
//! The runtime is written and read only by the exec context. The pulse
//! engine never touches it; it consumes the prep segment.

use tracing::trace;

use mill_common::consts::{AXES, NOM_SEGMENT_TIME};

use crate::math::EPSILON;
use crate::planner::buffer::Block;
use crate::planner::zoid;

// ─── Sections ───────────────────────────────────────────────────────

/// Profile section of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Acceleration from entry to cruise.
    Head,
    /// Constant cruise velocity.
    Body,
    /// Deceleration from cruise to exit.
    Tail,
}

/// Progress through one section.
#[derive(Debug, Clone, Copy)]
struct SectionProgress {
    kind: Section,
    /// Velocity entering the section [mm/min].
    v0: f64,
    /// Velocity leaving the section [mm/min].
    v1: f64,
    /// Section duration [min].
    time_total: f64,
    /// Duration of each segment [min].
    seg_time: f64,
    segs_total: u32,
    seg_index: u32,
    /// Distance left in the section [mm].
    remaining: f64,
}

impl SectionProgress {
    fn new(kind: Section, v0: f64, v1: f64, length: f64) -> Self {
        // Body runs at constant velocity; head/tail cover the length at the
        // average of their boundary velocities.
        let time_total = match kind {
            Section::Body => length / v0.max(f64::MIN_POSITIVE),
            _ => 2.0 * length / (v0 + v1).max(f64::MIN_POSITIVE),
        };
        let segs_total = (time_total / NOM_SEGMENT_TIME).ceil().max(1.0) as u32;
        Self {
            kind,
            v0,
            v1,
            time_total,
            seg_time: time_total / segs_total as f64,
            segs_total,
            seg_index: 0,
            remaining: length,
        }
    }
}

/// Velocity at time `t` on the two-phase jerk-limited ramp from `v0` to
/// `v1` over `t_total`. The peak jerk is `4·(v1−v0)/T²`; the profile is
/// concave for the first half and convex for the second.
fn profile_velocity(v0: f64, v1: f64, t_total: f64, t: f64) -> f64 {
    if t_total <= 0.0 {
        return v1;
    }
    let dv = v1 - v0;
    let tt = t_total * t_total;
    if t <= t_total / 2.0 {
        v0 + 2.0 * dv * (t * t) / tt
    } else {
        let r = t_total - t;
        v1 - 2.0 * dv * (r * r) / tt
    }
}

// ─── Runtime ────────────────────────────────────────────────────────

/// One execution step produced by the runtime.
#[derive(Debug)]
pub enum ExecStep {
    /// A segment to hand to the prep layer.
    Segment(Segment),
    /// Feedhold deceleration finished; velocity is zero, position held.
    Hold,
    /// The block is complete.
    Complete,
}

/// One prepared slice of motion.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    /// Per-axis displacement [mm/deg].
    pub delta: [f64; AXES],
    /// Segment duration [min].
    pub time: f64,
}

/// Scratch state for the currently executing block.
#[derive(Debug)]
pub struct Runtime {
    /// Pool index of the running block.
    pub active: Option<usize>,
    pub linenum: u32,
    /// Runtime machine position [mm/deg]. Persists across blocks.
    pub position: [f64; AXES],
    /// Work offset of the running block (reporting).
    pub work_offset: [f64; AXES],
    /// Velocity of the segment last produced [mm/min].
    pub segment_velocity: f64,
    /// Stopped under feedhold with profile work left.
    pub held: bool,

    target: [f64; AXES],
    unit: [f64; AXES],
    pending: [Option<(Section, f64, f64, f64)>; 3],
    pending_next: usize,
    current: Option<SectionProgress>,
    /// Velocity at the last segment boundary [mm/min].
    boundary_velocity: f64,
    /// Hold deceleration profile is active.
    holding: bool,
    /// Length left unexecuted when a hold stopped the block [mm].
    pub(crate) hold_leftover: f64,

    // Block parameters retained for hold replanning.
    pub(crate) cruise_vmax: f64,
    pub(crate) block_exit_velocity: f64,
    pub(crate) jerk: f64,
    pub(crate) recip_jerk: f64,
    pub(crate) cbrt_jerk: f64,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            active: None,
            linenum: 0,
            position: [0.0; AXES],
            work_offset: [0.0; AXES],
            segment_velocity: 0.0,
            held: false,
            target: [0.0; AXES],
            unit: [0.0; AXES],
            pending: [None; 3],
            pending_next: 0,
            current: None,
            boundary_velocity: 0.0,
            holding: false,
            hold_leftover: 0.0,
            cruise_vmax: 0.0,
            block_exit_velocity: 0.0,
            jerk: 0.0,
            recip_jerk: 0.0,
            cbrt_jerk: 0.0,
        }
    }

    /// Take over a freshly promoted block. The trapezoid must be solved.
    pub fn load_block(&mut self, index: usize, bf: &Block) {
        self.active = Some(index);
        self.linenum = bf.linenum;
        self.target = bf.target;
        self.unit = bf.unit;
        self.work_offset = bf.work_offset;
        self.cruise_vmax = bf.cruise_vmax;
        self.block_exit_velocity = bf.exit_velocity;
        self.jerk = bf.jerk;
        self.recip_jerk = bf.recip_jerk;
        self.cbrt_jerk = bf.cbrt_jerk;
        self.holding = false;
        self.held = false;
        self.hold_leftover = 0.0;
        self.boundary_velocity = bf.entry_velocity;
        self.set_profile(
            bf.entry_velocity,
            bf.cruise_velocity,
            bf.exit_velocity,
            bf.head_length,
            bf.body_length,
            bf.tail_length,
        );
        trace!(
            linenum = bf.linenum,
            length = bf.length,
            entry = bf.entry_velocity,
            cruise = bf.cruise_velocity,
            exit = bf.exit_velocity,
            "runtime block loaded"
        );
    }

    fn set_profile(&mut self, entry: f64, cruise: f64, exit: f64, head: f64, body: f64, tail: f64) {
        self.pending = [None; 3];
        self.pending_next = 0;
        self.current = None;
        let mut n = 0;
        if head > EPSILON {
            self.pending[n] = Some((Section::Head, entry, cruise, head));
            n += 1;
        }
        if body > EPSILON {
            self.pending[n] = Some((Section::Body, cruise, cruise, body));
            n += 1;
        }
        if tail > EPSILON {
            self.pending[n] = Some((Section::Tail, cruise, exit, tail));
        }
    }

    fn advance_section(&mut self) -> bool {
        while self.pending_next < self.pending.len() {
            let slot = self.pending[self.pending_next].take();
            self.pending_next += 1;
            if let Some((kind, v0, v1, len)) = slot {
                self.current = Some(SectionProgress::new(kind, v0, v1, len));
                return true;
            }
        }
        false
    }

    /// Produce the next execution step. Exactly one segment per call while
    /// profile work remains.
    pub fn next_step(&mut self) -> ExecStep {
        loop {
            if self.current.is_none() && !self.advance_section() {
                // Profile exhausted.
                if self.holding {
                    self.held = true;
                    self.segment_velocity = 0.0;
                    self.boundary_velocity = 0.0;
                    return ExecStep::Hold;
                }
                // Land exactly on the block target to shed rounding error.
                self.position = self.target;
                return ExecStep::Complete;
            }

            let s = self.current.as_mut().expect("section in progress");
            if s.seg_index >= s.segs_total {
                self.boundary_velocity = s.v1;
                self.current = None;
                continue;
            }

            let t_mid = (s.seg_index as f64 + 0.5) * s.seg_time;
            let v_mid = profile_velocity(s.v0, s.v1, s.time_total, t_mid);
            let last = s.seg_index + 1 == s.segs_total;
            let dist = if last {
                s.remaining
            } else {
                (v_mid * s.seg_time).min(s.remaining)
            }
            .max(0.0);
            s.remaining -= dist;
            s.seg_index += 1;
            let seg_time = s.seg_time;
            let boundary = profile_velocity(s.v0, s.v1, s.time_total, s.seg_index as f64 * seg_time);

            self.segment_velocity = v_mid;
            self.boundary_velocity = boundary;
            let mut delta = [0.0; AXES];
            for i in 0..AXES {
                delta[i] = self.unit[i] * dist;
                self.position[i] += delta[i];
            }
            return ExecStep::Segment(Segment {
                delta,
                time: seg_time,
            });
        }
    }

    /// Replace the remaining profile with a jerk-limited deceleration to
    /// zero, regardless of the current section. Any length the braking
    /// distance cannot cover is retained for the resume.
    pub fn plan_hold_decel(&mut self) {
        let v_now = self.boundary_velocity;
        let mut remaining_total = self.current.map_or(0.0, |s| s.remaining);
        for slot in self.pending.iter().skip(self.pending_next) {
            if let Some((_, _, _, len)) = slot {
                remaining_total += len;
            }
        }

        let braking = zoid::target_length(v_now, 0.0, self.recip_jerk);
        let tail_len = braking.min(remaining_total);
        self.hold_leftover = remaining_total - tail_len;

        self.pending = [None; 3];
        self.pending_next = 0;
        self.current =
            (tail_len > EPSILON).then(|| SectionProgress::new(Section::Tail, v_now, 0.0, tail_len));
        self.holding = true;
        trace!(v_now, tail_len, leftover = self.hold_leftover, "hold deceleration planned");
    }

    /// Resume from a hold with a re-solved profile over the leftover length.
    pub fn resume_from_hold(&mut self, profile: &Block) {
        self.set_profile(
            profile.entry_velocity,
            profile.cruise_velocity,
            profile.exit_velocity,
            profile.head_length,
            profile.body_length,
            profile.tail_length,
        );
        self.boundary_velocity = profile.entry_velocity;
        self.holding = false;
        self.held = false;
        self.hold_leftover = 0.0;
    }

    /// Drop the active block without completing it (queue flush, alarm).
    pub fn abandon(&mut self) {
        self.active = None;
        self.current = None;
        self.pending = [None; 3];
        self.pending_next = 0;
        self.holding = false;
        self.held = false;
        self.hold_leftover = 0.0;
        self.segment_velocity = 0.0;
        self.boundary_velocity = 0.0;
    }

    /// Zero the reported segment velocity (program stop/end bookkeeping).
    pub fn zero_segment_velocity(&mut self) {
        self.segment_velocity = 0.0;
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::zoid::calculate_trapezoid;

    const JERK: f64 = 5.0e9;

    fn solved_block(length: f64, entry: f64, cruise: f64, exit: f64) -> Block {
        let mut bf = Block::new();
        bf.length = length;
        bf.entry_velocity = entry;
        bf.cruise_velocity = cruise;
        bf.cruise_vmax = cruise;
        bf.exit_velocity = exit;
        bf.jerk = JERK;
        bf.recip_jerk = 1.0 / JERK;
        bf.cbrt_jerk = JERK.cbrt();
        bf.delta_vmax = zoid::target_velocity(0.0, length, JERK, JERK.cbrt());
        bf.unit[0] = 1.0;
        bf.target[0] = length;
        calculate_trapezoid(&mut bf);
        bf
    }

    fn run_to_completion(rt: &mut Runtime) -> (f64, u32) {
        let mut total = 0.0;
        let mut segments = 0;
        loop {
            match rt.next_step() {
                ExecStep::Segment(seg) => {
                    total += seg.delta[0];
                    segments += 1;
                    assert!(segments < 1_000_000, "runaway executor");
                }
                ExecStep::Complete => return (total, segments),
                ExecStep::Hold => panic!("unexpected hold"),
            }
        }
    }

    #[test]
    fn block_distance_is_exact() {
        let bf = solved_block(10.0, 0.0, 600.0, 0.0);
        let mut rt = Runtime::new();
        rt.load_block(0, &bf);
        let (total, segments) = run_to_completion(&mut rt);
        assert!((total - 10.0).abs() < 1e-9, "total {total}");
        assert!(segments > 1);
        // Runtime landed exactly on the target.
        assert_eq!(rt.position[0], 10.0);
    }

    #[test]
    fn segment_velocities_ramp_monotonically_in_head() {
        let bf = solved_block(50.0, 0.0, 3000.0, 3000.0);
        assert!(bf.head_length > 0.0);
        let mut rt = Runtime::new();
        rt.load_block(0, &bf);

        let mut last_v = -1.0;
        // Walk the head section only.
        let head_time = 2.0 * bf.head_length / (bf.entry_velocity + bf.cruise_velocity);
        let head_segs = (head_time / NOM_SEGMENT_TIME).ceil() as u32;
        for _ in 0..head_segs {
            match rt.next_step() {
                ExecStep::Segment(_) => {
                    assert!(rt.segment_velocity >= last_v - 1e-9);
                    last_v = rt.segment_velocity;
                }
                other => panic!("expected segment, got {other:?}"),
            }
        }
    }

    #[test]
    fn hold_decelerates_and_leaves_leftover() {
        let bf = solved_block(100.0, 0.0, 3000.0, 0.0);
        let mut rt = Runtime::new();
        rt.load_block(0, &bf);

        // Run some segments into the move, then request a hold.
        for _ in 0..40 {
            match rt.next_step() {
                ExecStep::Segment(_) => {}
                other => panic!("expected segment, got {other:?}"),
            }
        }
        let travelled_before_hold = rt.position[0];
        rt.plan_hold_decel();

        let mut travelled = travelled_before_hold;
        loop {
            match rt.next_step() {
                ExecStep::Segment(seg) => travelled += seg.delta[0],
                ExecStep::Hold => break,
                ExecStep::Complete => panic!("should hold, not complete"),
            }
        }
        assert!(rt.held);
        assert_eq!(rt.segment_velocity, 0.0);
        // Halted before the end of the move; leftover accounts for the rest.
        assert!(travelled < 100.0);
        assert!((travelled + rt.hold_leftover - 100.0).abs() < 1e-6);
    }

    #[test]
    fn resume_completes_the_block_exactly() {
        let bf = solved_block(100.0, 0.0, 3000.0, 0.0);
        let mut rt = Runtime::new();
        rt.load_block(0, &bf);
        for _ in 0..40 {
            let _ = rt.next_step();
        }
        rt.plan_hold_decel();
        loop {
            match rt.next_step() {
                ExecStep::Hold => break,
                ExecStep::Segment(_) => {}
                ExecStep::Complete => panic!("should hold first"),
            }
        }

        // Re-solve the leftover length from standstill.
        let mut scratch = Block::new();
        scratch.length = rt.hold_leftover;
        scratch.entry_velocity = 0.0;
        scratch.cruise_velocity = rt.cruise_vmax;
        scratch.cruise_vmax = rt.cruise_vmax;
        scratch.exit_velocity = 0.0;
        scratch.jerk = rt.jerk;
        scratch.recip_jerk = rt.recip_jerk;
        scratch.cbrt_jerk = rt.cbrt_jerk;
        scratch.delta_vmax = zoid::target_velocity(0.0, scratch.length, rt.jerk, rt.cbrt_jerk);
        calculate_trapezoid(&mut scratch);
        rt.resume_from_hold(&scratch);

        loop {
            match rt.next_step() {
                ExecStep::Segment(_) => {}
                ExecStep::Complete => break,
                ExecStep::Hold => panic!("unexpected second hold"),
            }
        }
        assert_eq!(rt.position[0], 100.0);
        assert!(!rt.held);
    }
}
