//! Fault types for the motion core.
//!
//! Synchronous faults (`MotionFault`) are returned to the caller and never
//! advance machine position. Alarm causes (`AlarmCause`) are bitflags; any
//! CRITICAL flag stops the steppers, cancels the spindle, and latches
//! `MachineState::Alarm` until explicitly cleared.

use bitflags::bitflags;
use thiserror::Error;

// ─── Synchronous Faults ─────────────────────────────────────────────

/// Errors returned synchronously from canonical-machine and planner calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MotionFault {
    /// Feed rate is zero in units-per-minute mode.
    #[error("feed rate is zero in units/min mode")]
    ZeroFeedRate,

    /// Coordinate system index outside G54..G59.
    #[error("coordinate system out of range")]
    CoordSystemOutOfRange,

    /// Planner ring has no free block.
    #[error("planner buffer pool exhausted")]
    BufferFull,

    /// Line is shorter than the minimum plannable length. The endpoint is
    /// not promoted, so sub-threshold increments accumulate.
    #[error("line shorter than minimum plannable length")]
    MinimumLengthMove,

    /// Segment time below the minimum executable duration.
    #[error("segment time below minimum")]
    MinimumTimeMove,

    /// Segment handed to the prep buffer while it was not exec-owned, or a
    /// non-finite parameter reached the stepper layer.
    #[error("stepper prep protocol violation")]
    PrepFault,

    /// Command rejected because the machine is in alarm.
    #[error("machine is in alarm state")]
    InAlarm,
}

// ─── Alarm Causes ───────────────────────────────────────────────────

bitflags! {
    /// Runtime alarm causes.
    ///
    /// CRITICAL flags (→ machine ALARM): HARD_LIMIT, PLANNER_FAULT,
    /// STEPPER_FAULT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AlarmCause: u8 {
        /// Hardware limit switch fired during motion. **CRITICAL**.
        const HARD_LIMIT    = 0x01;
        /// Software travel limit exceeded.
        const SOFT_LIMIT    = 0x02;
        /// Planner internal invariant breach. **CRITICAL**.
        const PLANNER_FAULT = 0x04;
        /// Stepper/DDA internal invariant breach. **CRITICAL**.
        const STEPPER_FAULT = 0x08;
        /// Operator-commanded emergency stop.
        const USER_REQUEST  = 0x10;
    }
}

impl AlarmCause {
    /// Mask of all CRITICAL flags.
    pub const CRITICAL_MASK: Self = Self::from_bits_truncate(
        Self::HARD_LIMIT.bits() | Self::PLANNER_FAULT.bits() | Self::STEPPER_FAULT.bits(),
    );

    /// Returns true if any CRITICAL flag is set.
    #[inline]
    pub const fn has_critical(&self) -> bool {
        self.intersects(Self::CRITICAL_MASK)
    }
}

impl Default for AlarmCause {
    fn default() -> Self {
        Self::empty()
    }
}
