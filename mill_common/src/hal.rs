//! Hardware-facing traits.
//!
//! The motion core is hardware-agnostic: the DDA engine drives a
//! [`StepDriver`], and significant transitions are surfaced through a
//! [`StatusReporter`] upcall. Timer sources are abstract — the embedding
//! layer calls the engine's tick entry points at the configured rates.

use crate::error::AlarmCause;
use crate::state::{HoldState, MachineState, MotionState};

// ─── Step Driver ────────────────────────────────────────────────────

/// Low-level stepper interface, one implementation per board (or simulator).
///
/// Called from the highest-priority context; implementations must not block.
pub trait StepDriver {
    /// Emit one step pulse on a motor.
    fn step_pulse(&mut self, motor: usize);

    /// Set the direction line for a motor. `true` is the reversed sense.
    fn set_direction(&mut self, motor: usize, reversed: bool);

    /// Assert or drop the enable line for a motor.
    fn set_enable(&mut self, motor: usize, enabled: bool);
}

// ─── Status Reporting ───────────────────────────────────────────────

/// Events surfaced to the reporting layer. Formatting is out of scope;
/// consumers receive the kind and a scalar payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReportEvent {
    /// Machine lifecycle state changed.
    MachineState(MachineState),
    /// Motion state changed.
    MotionState(MotionState),
    /// Feedhold sequencing state changed.
    HoldState(HoldState),
    /// A planner block started executing (payload: line number).
    BlockStart(u32),
    /// A planner block finished executing (payload: line number).
    BlockEnd(u32),
    /// Spindle speed commanded [rpm].
    SpindleSpeed(f64),
    /// An alarm latched.
    Alarm(AlarmCause),
    /// The planner queue was flushed.
    QueueFlush,
}

/// Upcall for significant machine transitions.
pub trait StatusReporter {
    fn report(&mut self, event: ReportEvent);
}

/// Reporter that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl StatusReporter for NullReporter {
    fn report(&mut self, _event: ReportEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reporter_accepts_events() {
        let mut r = NullReporter;
        r.report(ReportEvent::MachineState(MachineState::Ready));
        r.report(ReportEvent::BlockStart(42));
    }
}
