//! Simulation step driver.
//!
//! Records every emitted pulse as a `(motor, direction, tick)` tuple and
//! integrates signed step counts per motor. The tick counter is advanced by
//! the harness in lockstep with the DDA tick it drives, so two runs of the
//! same command stream produce byte-comparable pulse logs.

use mill_common::consts::MOTORS;
use mill_common::hal::StepDriver;
use tracing::trace;

/// One recorded step pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseRecord {
    pub motor: u8,
    /// Direction line state at pulse time (`true` = reversed sense).
    pub reversed: bool,
    /// DDA tick index at which the pulse fired.
    pub tick: u64,
}

/// Step driver backed by in-memory recording.
#[derive(Debug, Default)]
pub struct SimStepDriver {
    /// Current DDA tick, advanced by the harness.
    pub now: u64,
    direction: [bool; MOTORS],
    enabled: [bool; MOTORS],
    steps: [i64; MOTORS],
    pulses: Vec<PulseRecord>,
}

impl SimStepDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the simulated clock by one DDA tick.
    #[inline]
    pub fn advance_tick(&mut self) {
        self.now += 1;
    }

    /// Signed accumulated step count for a motor.
    #[inline]
    pub fn steps(&self, motor: usize) -> i64 {
        self.steps[motor]
    }

    /// Whether the enable line is currently asserted.
    #[inline]
    pub fn is_enabled(&self, motor: usize) -> bool {
        self.enabled[motor]
    }

    /// Full pulse log.
    pub fn pulses(&self) -> &[PulseRecord] {
        &self.pulses
    }

    /// Clear the pulse log, keeping positions and line states.
    pub fn clear_pulses(&mut self) {
        self.pulses.clear();
    }
}

impl StepDriver for SimStepDriver {
    fn step_pulse(&mut self, motor: usize) {
        let reversed = self.direction[motor];
        self.steps[motor] += if reversed { -1 } else { 1 };
        self.pulses.push(PulseRecord {
            motor: motor as u8,
            reversed,
            tick: self.now,
        });
    }

    fn set_direction(&mut self, motor: usize, reversed: bool) {
        self.direction[motor] = reversed;
    }

    fn set_enable(&mut self, motor: usize, enabled: bool) {
        if self.enabled[motor] != enabled {
            trace!(motor, enabled, "motor enable change");
        }
        self.enabled[motor] = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_signed_steps_and_pulses() {
        let mut drv = SimStepDriver::new();
        drv.set_direction(0, false);
        drv.step_pulse(0);
        drv.advance_tick();
        drv.set_direction(0, true);
        drv.step_pulse(0);

        assert_eq!(drv.steps(0), 0);
        assert_eq!(drv.pulses().len(), 2);
        assert_eq!(
            drv.pulses()[1],
            PulseRecord {
                motor: 0,
                reversed: true,
                tick: 1
            }
        );
    }

    #[test]
    fn enable_line_shadowed() {
        let mut drv = SimStepDriver::new();
        assert!(!drv.is_enabled(2));
        drv.set_enable(2, true);
        assert!(drv.is_enabled(2));
    }
}
