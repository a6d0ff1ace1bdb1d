//! Look-ahead line planner.
//!
//! Owns the block ring and joins newly appended lines to their neighbors:
//! junction velocity limits at the corners, then a backward pass over the
//! still-replannable blocks to tighten entry velocities against successor
//! constraints. Forward planning is implicit in the executor, which runs
//! the trapezoid solver once when it promotes a block.

pub mod buffer;
pub mod zoid;

use tracing::{debug, trace};

use mill_common::config::ResolvedConfig;
use mill_common::consts::{AXES, JERK_MATCH_PRECISION, MIN_LINE_LENGTH, PLANNER_BUFFER_HEADROOM};
use mill_common::error::MotionFault;

use crate::math::{vector_distance, EPSILON};
use self::buffer::{Block, BlockState, BufferPool, MoveType, QueuedCommand};

/// Cosine threshold beyond which two unit vectors count as colinear.
const JUNCTION_COLINEAR_COS: f64 = -0.99;
/// Cosine threshold beyond which a corner counts as a full reversal.
const JUNCTION_REVERSAL_COS: f64 = 0.99;

// ─── Planner ────────────────────────────────────────────────────────

/// Planner ring plus the move-master planning position.
pub struct Planner {
    pool: BufferPool,
    /// Final position of the last appended move [mm/deg].
    position: [f64; AXES],
    // Jerk terms cached from the previous move; recomputing the cube root
    // is skipped when consecutive jerks match within precision.
    prev_jerk: f64,
    prev_recip_jerk: f64,
    prev_cbrt_jerk: f64,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            pool: BufferPool::new(),
            position: [0.0; AXES],
            prev_jerk: 0.0,
            prev_recip_jerk: 0.0,
            prev_cbrt_jerk: 0.0,
        }
    }

    // ── Position ────────────────────────────────────────────────────

    #[inline]
    pub fn position(&self) -> &[f64; AXES] {
        &self.position
    }

    pub fn set_position(&mut self, position: &[f64; AXES]) {
        self.position = *position;
    }

    pub fn set_axis_position(&mut self, axis: usize, value: f64) {
        self.position[axis] = value;
    }

    // ── Pool access ─────────────────────────────────────────────────

    #[inline]
    pub fn buffers_available(&self) -> usize {
        self.pool.available()
    }

    /// True when no block is queued, running, or awaiting release.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    #[inline]
    pub fn block(&self, index: usize) -> &Block {
        self.pool.block(index)
    }

    #[inline]
    pub fn block_mut(&mut self, index: usize) -> &mut Block {
        self.pool.block_mut(index)
    }

    #[inline]
    pub fn first_runnable(&self) -> Option<usize> {
        self.pool.first_runnable()
    }

    /// Release finalized blocks. Main-context, before each allocation round.
    pub fn reap_finalized(&mut self) {
        self.pool.reap_finalized();
    }

    /// Mark a block done. Executor-context; the main context reaps it.
    pub fn finalize(&self, index: usize) {
        self.pool.block(index).set_state(BlockState::Final);
    }

    /// Drain the ring entirely. The caller resyncs positions.
    pub fn flush(&mut self) {
        debug!("planner flush");
        self.pool.reset();
    }

    // ── Appends (main context) ──────────────────────────────────────

    /// Queue a deferred command block.
    pub fn append_command(&mut self, command: QueuedCommand, linenum: u32) -> Result<(), MotionFault> {
        self.pool.reap_finalized();
        let idx = self.pool.get_write().ok_or(MotionFault::BufferFull)?;
        {
            let b = self.pool.block_mut(idx);
            b.move_type = MoveType::Command;
            b.command = Some(command);
            b.linenum = linenum;
        }
        self.pool.commit_write(idx);
        trace!(linenum, ?command, "queued command block");
        Ok(())
    }

    /// Queue a dwell block.
    pub fn append_dwell(&mut self, seconds: f64, linenum: u32) -> Result<(), MotionFault> {
        self.pool.reap_finalized();
        let idx = self.pool.get_write().ok_or(MotionFault::BufferFull)?;
        {
            let b = self.pool.block_mut(idx);
            b.move_type = MoveType::Dwell;
            b.seconds = seconds;
            b.linenum = linenum;
        }
        self.pool.commit_write(idx);
        trace!(linenum, seconds, "queued dwell block");
        Ok(())
    }

    /// Queue a jerk-limited straight move ending at `target`, then back-plan
    /// the queue.
    ///
    /// `time` is the optimal move duration [min]; `min_time` the
    /// rate-limited minimum [min]. Targets closer than `MIN_LINE_LENGTH`
    /// are rejected so the caller can accumulate them.
    pub fn append_line(
        &mut self,
        cfg: &ResolvedConfig,
        target: &[f64; AXES],
        time: f64,
        work_offset: &[f64; AXES],
        min_time: f64,
        linenum: u32,
    ) -> Result<(), MotionFault> {
        let length = vector_distance(target, &self.position);
        if length < MIN_LINE_LENGTH {
            return Err(MotionFault::MinimumLengthMove);
        }

        self.pool.reap_finalized();
        if self.pool.available() <= PLANNER_BUFFER_HEADROOM {
            return Err(MotionFault::BufferFull);
        }

        // Unit vector and the along-path limits it implies.
        let mut unit = [0.0; AXES];
        let mut jerk = f64::INFINITY;
        let mut junction_deviation = f64::INFINITY;
        for i in 0..AXES {
            unit[i] = (target[i] - self.position[i]) / length;
            let component = unit[i].abs();
            if component > EPSILON {
                jerk = jerk.min(cfg.axis(i).jerk_max / component);
                junction_deviation = junction_deviation.min(cfg.axis(i).junction_deviation);
            }
        }

        if (jerk - self.prev_jerk).abs() > JERK_MATCH_PRECISION {
            self.prev_jerk = jerk;
            self.prev_recip_jerk = 1.0 / jerk;
            self.prev_cbrt_jerk = jerk.cbrt();
        }
        let (recip_jerk, cbrt_jerk) = (self.prev_recip_jerk, self.prev_cbrt_jerk);

        // Junction limit against the predecessor, if it is a line.
        let junction_vmax = match self.newest_line() {
            Some(prev_idx) => {
                let prev_unit = self.pool.block(prev_idx).unit;
                junction_velocity(
                    &prev_unit,
                    &unit,
                    junction_deviation,
                    cfg.machine.junction_acceleration,
                )
            }
            // Starting from standstill (or after a command/dwell barrier).
            None => 0.0,
        };

        let idx = self.pool.get_write().ok_or(MotionFault::BufferFull)?;
        {
            let time = time.max(EPSILON);
            let b = self.pool.block_mut(idx);
            b.move_type = MoveType::Line;
            b.replannable = true;
            b.linenum = linenum;
            b.target = *target;
            b.unit = unit;
            b.work_offset = *work_offset;
            b.time = time;
            b.min_time = min_time;
            b.length = length;
            b.jerk = jerk;
            b.recip_jerk = recip_jerk;
            b.cbrt_jerk = cbrt_jerk;

            b.cruise_vmax = length / time;
            b.entry_vmax = b.cruise_vmax.min(junction_vmax);
            b.delta_vmax = zoid::target_velocity(0.0, length, jerk, cbrt_jerk);
            b.exit_vmax = b.cruise_vmax.min(b.entry_vmax + b.delta_vmax);
            b.braking_velocity = b.delta_vmax;

            b.entry_velocity = 0.0;
            b.cruise_velocity = b.cruise_vmax;
            b.exit_velocity = 0.0;
        }
        self.position = *target;
        self.pool.commit_write(idx);
        trace!(linenum, length, "queued line block");

        self.back_plan(idx);
        Ok(())
    }

    // ── Back-planning ───────────────────────────────────────────────

    /// Walk backward from the newest block, tightening entry velocities to
    /// meet successor constraints. Stops at the first non-replannable block
    /// or once an entry velocity no longer decreases.
    fn back_plan(&mut self, newest: usize) {
        let mut succ_entry = 0.0; // the queue tail exits at zero
        let mut idx = newest;
        loop {
            {
                let b = self.pool.block(idx);
                if b.move_type != MoveType::Line
                    || b.state() != BlockState::Queued
                    || !b.replannable
                {
                    break;
                }
            }

            // What the predecessor can hand over.
            let pred_cap = match self.pred_index(idx) {
                None => f64::INFINITY,
                Some(p) => {
                    let pb = self.pool.block(p);
                    match (pb.move_type, pb.state()) {
                        (MoveType::Line, BlockState::Queued) if pb.replannable => {
                            pb.cruise_vmax.min(pb.exit_vmax)
                        }
                        // Running or already planned: its exit is fixed.
                        (MoveType::Line, BlockState::Run | BlockState::Final) => pb.exit_velocity,
                        // Commands and dwells are motion barriers.
                        _ => 0.0,
                    }
                }
            };

            let b = self.pool.block_mut(idx);
            let exit = b.cruise_vmax.min(b.exit_vmax).min(succ_entry);
            let reachable = zoid::target_velocity(exit, b.length, b.jerk, b.cbrt_jerk);
            let entry = b.entry_vmax.min(reachable).min(pred_cap);

            let old_entry = b.entry_velocity;
            b.exit_velocity = exit;
            b.entry_velocity = entry;
            let converged = b.planned && entry >= old_entry - EPSILON;
            b.planned = true;
            if converged {
                break;
            }

            succ_entry = entry;
            match self.pred_index(idx) {
                Some(p) => idx = p,
                None => break,
            }
        }
    }

    /// Ring predecessor within the occupied range.
    fn pred_index(&self, index: usize) -> Option<usize> {
        if index == self.pool.head_index() {
            None
        } else {
            Some(self.pool.prev_index(index))
        }
    }

    /// Newest committed block if it is a line (junction predecessor).
    fn newest_line(&self) -> Option<usize> {
        let idx = self.pool.newest_committed()?;
        let b = self.pool.block(idx);
        (b.move_type == MoveType::Line
            && matches!(b.state(), BlockState::Queued | BlockState::Run))
        .then_some(idx)
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Junction Velocity ──────────────────────────────────────────────

/// Permissible corner velocity between two unit vectors.
///
/// Colinear vectors allow full cruise (unbounded here, clamped by the
/// caller); a reversal clamps to zero. In between, the corner is treated as
/// an arc of radius derived from the junction deviation and half-angle, and
/// the velocity is bounded by the centripetal acceleration budget:
/// `v = √(r · a_junction)`.
pub fn junction_velocity(
    prev_unit: &[f64; AXES],
    unit: &[f64; AXES],
    junction_deviation: f64,
    junction_acceleration: f64,
) -> f64 {
    let mut costheta = 0.0;
    for i in 0..AXES {
        costheta -= prev_unit[i] * unit[i];
    }
    if costheta < JUNCTION_COLINEAR_COS {
        return f64::INFINITY;
    }
    if costheta > JUNCTION_REVERSAL_COS {
        return 0.0;
    }
    let sintheta_over2 = ((1.0 - costheta) / 2.0).sqrt();
    if (1.0 - sintheta_over2) < EPSILON {
        return f64::INFINITY;
    }
    let radius = junction_deviation * sintheta_over2 / (1.0 - sintheta_over2);
    (radius * junction_acceleration).sqrt()
}
