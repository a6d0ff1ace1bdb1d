//! Segment prep, segment loader, DDA pulse engine, and motor power
//! management.
//!
//! The prep segment is a two-slot mailbox between the exec context (which
//! fills it) and the loader/DDA context (which consumes it). Ownership is a
//! single atomic word flipped with release/acquire ordering; the owner
//! writes the rest of the struct before flipping.
//!
//! The DDA accumulates `substep_increment` per motor per tick and emits a
//! step each time the accumulator crosses zero, subtracting the segment
//! threshold `dda_ticks × DDA_SUBSTEPS`. The residual phase is carried
//! across segment boundaries so pulse trains stay phase-continuous; it is
//! discarded only on a fresh start or when the anti-stall reset trips.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::{trace, warn};

use mill_common::config::ResolvedConfig;
use mill_common::consts::{
    ACCUMULATOR_RESET_FACTOR, DDA_SUBSTEPS, FREQUENCY_DDA, FREQUENCY_DWELL, MOTORS,
};
use mill_common::error::MotionFault;
use mill_common::hal::StepDriver;
use mill_common::state::{MotorPowerMode, MotorPowerState};

use crate::planner::buffer::MoveType;

// ─── Prep Segment ───────────────────────────────────────────────────

/// Prep mailbox ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrepOwner {
    /// Staged segment ready for the loader.
    Loader = 0,
    /// Exec context may fill the buffer.
    Exec = 1,
}

#[derive(Debug, Clone, Copy, Default)]
struct PrepMotor {
    /// Substeps accumulated per tick over the segment.
    substep_increment: u32,
    /// Direction line state for the segment.
    reversed: bool,
}

/// Double-buffered handoff slot between exec and loader.
#[derive(Debug)]
struct PrepSegment {
    owner: AtomicU8,
    move_type: MoveType,
    /// Tick count for the segment (DDA rate for lines, dwell rate for
    /// dwells).
    ticks: u32,
    /// Step threshold: `ticks × DDA_SUBSTEPS`.
    ticks_x_substeps: u32,
    motors: [PrepMotor; MOTORS],
}

impl PrepSegment {
    fn new() -> Self {
        Self {
            // Exec owns the buffer at startup so the first segment can be
            // staged immediately.
            owner: AtomicU8::new(PrepOwner::Exec as u8),
            move_type: MoveType::Null,
            ticks: 0,
            ticks_x_substeps: 0,
            motors: [PrepMotor::default(); MOTORS],
        }
    }

    #[inline]
    fn owner(&self) -> PrepOwner {
        if self.owner.load(Ordering::Acquire) == PrepOwner::Loader as u8 {
            PrepOwner::Loader
        } else {
            PrepOwner::Exec
        }
    }

    #[inline]
    fn set_owner(&self, owner: PrepOwner) {
        self.owner.store(owner as u8, Ordering::Release);
    }
}

// ─── Run State ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RunMotor {
    /// DDA phase accumulator. Negative between steps.
    substep_accumulator: i64,
    substep_increment: u32,
    power_state: MotorPowerState,
    /// Seconds left before an energized, stopped motor drops to idle.
    idle_timer: f64,
}

impl RunMotor {
    const fn new() -> Self {
        Self {
            substep_accumulator: 0,
            substep_increment: 0,
            power_state: MotorPowerState::Off,
            idle_timer: 0.0,
        }
    }
}

/// Stepper runtime: active segment counters plus per-motor DDA and power
/// state. Owned by the loader/DDA context.
pub struct StepperChannel {
    prep: PrepSegment,
    /// What the engine is currently running.
    active: MoveType,
    ticks_downcount: u32,
    ticks_x_substeps: u32,
    prev_ticks: u32,
    motors: [RunMotor; MOTORS],
    /// Discard carried DDA phase at the next line load.
    phase_reset_pending: bool,
    exec_requested: AtomicBool,
}

impl StepperChannel {
    pub fn new() -> Self {
        Self {
            prep: PrepSegment::new(),
            active: MoveType::Null,
            ticks_downcount: 0,
            ticks_x_substeps: 0,
            prev_ticks: 0,
            motors: [RunMotor::new(); MOTORS],
            phase_reset_pending: true,
            exec_requested: AtomicBool::new(false),
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    /// True while a segment or dwell is being clocked out.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.ticks_downcount > 0
    }

    /// Kind of work the engine is currently clocking.
    #[inline]
    pub fn active_move(&self) -> MoveType {
        self.active
    }

    #[inline]
    pub fn motor_power_state(&self, motor: usize) -> MotorPowerState {
        self.motors[motor].power_state
    }

    // ── Exec request path ───────────────────────────────────────────

    /// Ask the exec context to prepare the next segment. No-op unless the
    /// prep buffer is exec-owned (a staged segment is already waiting
    /// otherwise).
    pub fn request_exec(&self) {
        if self.prep.owner() == PrepOwner::Exec {
            self.exec_requested.store(true, Ordering::Release);
        }
    }

    /// Consume a pending exec request.
    pub fn take_exec_request(&self) -> bool {
        self.exec_requested.swap(false, Ordering::AcqRel)
    }

    /// True when the exec context may fill the prep buffer.
    #[inline]
    pub fn prep_available(&self) -> bool {
        self.prep.owner() == PrepOwner::Exec
    }

    // ── Prep (exec context) ─────────────────────────────────────────

    /// Stage a line segment: signed fractional steps per motor and the
    /// segment duration in microseconds.
    pub fn prep_line(&mut self, steps: &[f64; MOTORS], microseconds: f64) -> Result<(), MotionFault> {
        if self.prep.owner() != PrepOwner::Exec {
            return Err(MotionFault::PrepFault);
        }
        if !microseconds.is_finite() {
            return Err(MotionFault::PrepFault);
        }
        if microseconds < 1.0 {
            return Err(MotionFault::MinimumTimeMove);
        }

        let ticks = ((microseconds / 1_000_000.0) * FREQUENCY_DDA as f64) as u32;
        let ticks = ticks.max(1);
        let ticks_x_substeps = ticks
            .checked_mul(DDA_SUBSTEPS)
            .ok_or(MotionFault::PrepFault)?;

        for (motor, step) in steps.iter().enumerate() {
            if !step.is_finite() {
                return Err(MotionFault::PrepFault);
            }
            let increment = (step.abs() * DDA_SUBSTEPS as f64) as u64;
            if increment > u32::MAX as u64 {
                return Err(MotionFault::PrepFault);
            }
            self.prep.motors[motor] = PrepMotor {
                substep_increment: increment as u32,
                reversed: *step < 0.0,
            };
        }
        self.prep.ticks = ticks;
        self.prep.ticks_x_substeps = ticks_x_substeps;
        self.prep.move_type = MoveType::Line;
        Ok(())
    }

    /// Stage a dwell of the given duration.
    pub fn prep_dwell(&mut self, microseconds: f64) -> Result<(), MotionFault> {
        if self.prep.owner() != PrepOwner::Exec {
            return Err(MotionFault::PrepFault);
        }
        self.prep.ticks = ((microseconds / 1_000_000.0) * FREQUENCY_DWELL as f64).max(1.0) as u32;
        self.prep.move_type = MoveType::Dwell;
        Ok(())
    }

    /// Stage a null segment. Keeps the loader fed across command blocks.
    pub fn prep_null(&mut self) {
        self.prep.move_type = MoveType::Null;
    }

    /// Publish the staged segment to the loader.
    pub fn commit_prep(&self) {
        self.prep.set_owner(PrepOwner::Loader);
    }

    // ── Loader (DDA context, or poked when idle) ────────────────────

    /// Swap the staged segment into the run state. Only effective when the
    /// current segment is exhausted. Re-arms the exec request after every
    /// load so the pipeline keeps pulling.
    pub fn load_segment(&mut self, driver: &mut dyn StepDriver, cfg: &ResolvedConfig) {
        if self.ticks_downcount != 0 {
            return;
        }
        if self.prep.owner() != PrepOwner::Loader {
            // Nothing staged: the engine idles until the exec catches up.
            return;
        }

        match self.prep.move_type {
            MoveType::Line => {
                // Anti-stall: discard carried phase if the tick range shrank
                // too far, otherwise pulses stay phase-continuous.
                let reset = self.phase_reset_pending
                    || (self.prev_ticks > self.prep.ticks.saturating_mul(ACCUMULATOR_RESET_FACTOR));
                self.ticks_downcount = self.prep.ticks;
                self.ticks_x_substeps = self.prep.ticks_x_substeps;
                self.prev_ticks = self.prep.ticks;
                self.phase_reset_pending = false;

                for motor in 0..MOTORS {
                    let staged = self.prep.motors[motor];
                    let run = &mut self.motors[motor];
                    run.substep_increment = staged.substep_increment;
                    if staged.substep_increment != 0 {
                        if reset {
                            run.substep_accumulator = -((self.ticks_x_substeps / 2) as i64);
                        }
                        driver.set_direction(motor, staged.reversed);
                        driver.set_enable(motor, true);
                        run.power_state = MotorPowerState::Running;
                    } else if run.power_state == MotorPowerState::Running {
                        // Motor not in this segment.
                        self.stop_motor(motor, cfg);
                    }
                }
                self.active = MoveType::Line;
            }
            MoveType::Dwell => {
                self.ticks_downcount = self.prep.ticks;
                self.active = MoveType::Dwell;
            }
            MoveType::Null | MoveType::Command => {
                // End of motion: the engine idles.
                self.active = MoveType::Null;
                self.phase_reset_pending = true;
                for motor in 0..MOTORS {
                    if self.motors[motor].power_state == MotorPowerState::Running {
                        self.stop_motor(motor, cfg);
                    }
                }
            }
        }

        self.prep.move_type = MoveType::Null;
        self.prep.set_owner(PrepOwner::Exec);
        self.exec_requested.store(true, Ordering::Release);
    }

    /// One DDA timer tick: advance accumulators, emit pulses, and load the
    /// next segment when this one is exhausted.
    pub fn dda_tick(&mut self, driver: &mut dyn StepDriver, cfg: &ResolvedConfig) {
        if self.active != MoveType::Line || self.ticks_downcount == 0 {
            return;
        }
        let threshold = self.ticks_x_substeps as i64;
        for motor in 0..MOTORS {
            let run = &mut self.motors[motor];
            if run.substep_increment == 0 {
                continue;
            }
            run.substep_accumulator += run.substep_increment as i64;
            if run.substep_accumulator > 0 {
                run.substep_accumulator -= threshold;
                driver.step_pulse(motor);
            }
        }
        self.ticks_downcount -= 1;
        if self.ticks_downcount == 0 {
            self.load_segment(driver, cfg);
        }
    }

    /// One dwell timer tick.
    pub fn dwell_tick(&mut self, driver: &mut dyn StepDriver, cfg: &ResolvedConfig) {
        if self.active != MoveType::Dwell || self.ticks_downcount == 0 {
            return;
        }
        self.ticks_downcount -= 1;
        if self.ticks_downcount == 0 {
            self.active = MoveType::Null;
            self.load_segment(driver, cfg);
        }
    }

    // ── Motor power management ──────────────────────────────────────

    fn stop_motor(&mut self, motor: usize, cfg: &ResolvedConfig) {
        let run = &mut self.motors[motor];
        run.power_state = MotorPowerState::Stopped;
        if cfg.motor(motor).power_mode == MotorPowerMode::IdleWhenStopped {
            run.idle_timer = cfg.machine.motor_idle_timeout;
        }
    }

    /// Periodic power callback: count down idle timers and drop stopped
    /// motors to idle per their power policy. `dt` is seconds since the
    /// previous call, bounded by the idle timeout clamp at config time.
    pub fn motor_power_callback(
        &mut self,
        dt: f64,
        driver: &mut dyn StepDriver,
        cfg: &ResolvedConfig,
    ) {
        for motor in 0..MOTORS {
            let mode = cfg.motor(motor).power_mode;
            let run = &mut self.motors[motor];
            if run.power_state == MotorPowerState::Stopped && mode == MotorPowerMode::IdleWhenStopped
            {
                run.idle_timer -= dt;
                if run.idle_timer <= 0.0 {
                    run.power_state = MotorPowerState::Idle;
                    driver.set_enable(motor, false);
                    trace!(motor, "motor idled after timeout");
                }
            }
        }
    }

    /// Cycle has ended: de-energize motors powered only during cycles and
    /// start the idle countdown for the rest.
    pub fn end_cycle(&mut self, driver: &mut dyn StepDriver, cfg: &ResolvedConfig) {
        for motor in 0..MOTORS {
            match cfg.motor(motor).power_mode {
                MotorPowerMode::EnergizedDuringCycle => {
                    if self.motors[motor].power_state.is_energized() {
                        self.motors[motor].power_state = MotorPowerState::Off;
                        driver.set_enable(motor, false);
                    }
                }
                MotorPowerMode::IdleWhenStopped => {
                    if self.motors[motor].power_state == MotorPowerState::Running {
                        self.stop_motor(motor, cfg);
                    }
                }
                _ => {}
            }
        }
    }

    /// Energize every motor (cycle start, manual command).
    pub fn energize_motors(&mut self, driver: &mut dyn StepDriver) {
        for motor in 0..MOTORS {
            driver.set_enable(motor, true);
            if !self.motors[motor].power_state.is_energized() {
                self.motors[motor].power_state = MotorPowerState::Stopped;
            }
        }
    }

    /// Emergency stop: kill the active segment, drop the prep handshake
    /// back to exec, and de-energize everything.
    pub fn reset(&mut self, driver: &mut dyn StepDriver) {
        warn!("stepper reset: pulse train halted");
        self.ticks_downcount = 0;
        self.ticks_x_substeps = 0;
        self.prev_ticks = 0;
        self.active = MoveType::Null;
        self.phase_reset_pending = true;
        self.prep.move_type = MoveType::Null;
        self.prep.set_owner(PrepOwner::Exec);
        self.exec_requested.store(false, Ordering::Release);
        for motor in 0..MOTORS {
            let run = &mut self.motors[motor];
            run.substep_accumulator = 0;
            run.substep_increment = 0;
            run.power_state = MotorPowerState::Off;
            driver.set_enable(motor, false);
        }
    }
}

impl Default for StepperChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mill_common::config::MachineConfig;

    /// Minimal recording driver for channel-level tests.
    #[derive(Default)]
    struct TestDriver {
        steps: [i64; MOTORS],
        direction: [bool; MOTORS],
        enabled: [bool; MOTORS],
    }

    impl StepDriver for TestDriver {
        fn step_pulse(&mut self, motor: usize) {
            self.steps[motor] += if self.direction[motor] { -1 } else { 1 };
        }
        fn set_direction(&mut self, motor: usize, reversed: bool) {
            self.direction[motor] = reversed;
        }
        fn set_enable(&mut self, motor: usize, enabled: bool) {
            self.enabled[motor] = enabled;
        }
    }

    fn cfg() -> ResolvedConfig {
        MachineConfig::default().resolve()
    }

    fn run_segment(ch: &mut StepperChannel, drv: &mut TestDriver, cfg: &ResolvedConfig) {
        let mut guard = 0;
        while ch.is_busy() {
            ch.dda_tick(drv, cfg);
            guard += 1;
            assert!(guard < 10_000_000, "runaway DDA");
        }
    }

    #[test]
    fn prep_handshake_protocol() {
        let mut ch = StepperChannel::new();
        assert!(ch.prep_available());

        let steps = [10.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        ch.prep_line(&steps, 5000.0).unwrap();
        ch.commit_prep();
        assert!(!ch.prep_available());
        // Double-prep while loader-owned is a protocol fault.
        assert_eq!(ch.prep_line(&steps, 5000.0), Err(MotionFault::PrepFault));
    }

    #[test]
    fn segment_emits_exact_step_count() {
        let cfg = cfg();
        let mut ch = StepperChannel::new();
        let mut drv = TestDriver::default();

        let steps = [64.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        ch.prep_line(&steps, 5000.0).unwrap();
        ch.commit_prep();
        ch.load_segment(&mut drv, &cfg);
        assert!(ch.is_busy());
        assert!(drv.enabled[0]);

        run_segment(&mut ch, &mut drv, &cfg);
        assert_eq!(drv.steps[0], 64);
        assert_eq!(drv.steps[1], 0);
    }

    #[test]
    fn negative_steps_set_direction() {
        let cfg = cfg();
        let mut ch = StepperChannel::new();
        let mut drv = TestDriver::default();

        let steps = [-32.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        ch.prep_line(&steps, 5000.0).unwrap();
        ch.commit_prep();
        ch.load_segment(&mut drv, &cfg);
        run_segment(&mut ch, &mut drv, &cfg);
        assert_eq!(drv.steps[0], -32);
    }

    #[test]
    fn fractional_steps_carry_phase_across_segments() {
        let cfg = cfg();
        let mut ch = StepperChannel::new();
        let mut drv = TestDriver::default();

        // 10.5 steps per segment: the half step must carry, not vanish.
        for _ in 0..4 {
            let steps = [10.5, 0.0, 0.0, 0.0, 0.0, 0.0];
            ch.prep_line(&steps, 5000.0).unwrap();
            ch.commit_prep();
            ch.load_segment(&mut drv, &cfg);
            run_segment(&mut ch, &mut drv, &cfg);
        }
        // 4 × 10.5 = 42 exactly.
        assert_eq!(drv.steps[0], 42);
    }

    #[test]
    fn load_rearms_exec_request() {
        let cfg = cfg();
        let mut ch = StepperChannel::new();
        let mut drv = TestDriver::default();

        ch.prep_line(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0], 5000.0).unwrap();
        ch.commit_prep();
        ch.load_segment(&mut drv, &cfg);
        assert!(ch.take_exec_request());
        assert!(!ch.take_exec_request());
    }

    #[test]
    fn dwell_counts_down_without_pulses() {
        let cfg = cfg();
        let mut ch = StepperChannel::new();
        let mut drv = TestDriver::default();

        ch.prep_dwell(10_000.0).unwrap(); // 10 ms → 10 dwell ticks
        ch.commit_prep();
        ch.load_segment(&mut drv, &cfg);
        assert_eq!(ch.active_move(), MoveType::Dwell);
        let mut ticks = 0;
        while ch.is_busy() {
            ch.dwell_tick(&mut drv, &cfg);
            ticks += 1;
        }
        assert_eq!(ticks, 10);
        assert_eq!(drv.steps[0], 0);
    }

    #[test]
    fn idle_when_stopped_motor_times_out() {
        let mut raw = MachineConfig::default();
        let mut motor = mill_common::config::MotorConfig::default_for(0);
        motor.power_mode = MotorPowerMode::IdleWhenStopped;
        raw.motors = vec![motor];
        let cfg = raw.resolve();

        let mut ch = StepperChannel::new();
        let mut drv = TestDriver::default();

        ch.prep_line(&[8.0, 0.0, 0.0, 0.0, 0.0, 0.0], 5000.0).unwrap();
        ch.commit_prep();
        ch.load_segment(&mut drv, &cfg);
        run_segment(&mut ch, &mut drv, &cfg);
        // Stage the end of motion the way the exec context would.
        ch.prep_null();
        ch.commit_prep();
        ch.load_segment(&mut drv, &cfg);
        assert_eq!(ch.motor_power_state(0), MotorPowerState::Stopped);
        assert!(drv.enabled[0]);

        // Exceed the idle timeout.
        ch.motor_power_callback(cfg.machine.motor_idle_timeout + 0.1, &mut drv, &cfg);
        assert_eq!(ch.motor_power_state(0), MotorPowerState::Idle);
        assert!(!drv.enabled[0]);
    }

    #[test]
    fn reset_halts_and_deenergizes() {
        let cfg = cfg();
        let mut ch = StepperChannel::new();
        let mut drv = TestDriver::default();

        ch.prep_line(&[100.0, 0.0, 0.0, 0.0, 0.0, 0.0], 5000.0).unwrap();
        ch.commit_prep();
        ch.load_segment(&mut drv, &cfg);
        assert!(ch.is_busy());
        ch.reset(&mut drv);
        assert!(!ch.is_busy());
        assert!(ch.prep_available());
        assert!(!drv.enabled[0]);
        assert_eq!(ch.motor_power_state(0), MotorPowerState::Off);
    }
}
