//! Lifecycle state enums for the motion controller.
//!
//! All enums use `#[repr(u8)]` for compact layout and stable wire values.
//! Global state (MachineState, CycleState) nests per-motion state
//! (MotionState, HoldState) and per-motor power state.

use serde::{Deserialize, Serialize};

// ─── Machine Lifecycle ──────────────────────────────────────────────

/// Global machine lifecycle state.
///
/// Only one `MachineState` is active at any time. `Alarm` exits only via an
/// explicit alarm-clear command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MachineState {
    /// Initial state while subsystems initialize.
    Initializing = 0,
    /// Ready for commands, no cycle active.
    Ready = 1,
    /// Critical fault — steppers stopped, spindle off. Requires explicit clear.
    Alarm = 2,
    /// Program stop reached (M0/M1/M60).
    ProgramStop = 3,
    /// Program end reached (M2/M30) — modal state reset.
    ProgramEnd = 4,
    /// A machining cycle is active.
    Cycle = 5,
}

impl MachineState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initializing),
            1 => Some(Self::Ready),
            2 => Some(Self::Alarm),
            3 => Some(Self::ProgramStop),
            4 => Some(Self::ProgramEnd),
            5 => Some(Self::Cycle),
            _ => None,
        }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::Initializing
    }
}

/// Cycle state — whether a machining cycle is running inside `MachineState::Cycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CycleState {
    /// No cycle active.
    Off = 0,
    /// A machining cycle has started.
    Started = 1,
    /// A homing cycle is running.
    Homing = 2,
}

impl CycleState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Started),
            2 => Some(Self::Homing),
            _ => None,
        }
    }
}

impl Default for CycleState {
    fn default() -> Self {
        Self::Off
    }
}

/// Motion state of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotionState {
    /// No motion in progress.
    Stop = 0,
    /// Motion running.
    Run = 1,
    /// Motion suspended by a feedhold.
    Hold = 2,
}

impl MotionState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Stop),
            1 => Some(Self::Run),
            2 => Some(Self::Hold),
            _ => None,
        }
    }
}

impl Default for MotionState {
    fn default() -> Self {
        Self::Stop
    }
}

/// Feedhold sequencing state.
///
/// A feedhold is a cooperative two-phase cancel: the request latches, the
/// sequencing callback arms `Sync`, the executor decelerates under jerk and
/// promotes to `Hold`, and a cycle start releases via `EndHold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HoldState {
    /// No hold in progress.
    Off = 0,
    /// Hold armed — executor will replace the profile with a deceleration.
    Sync = 1,
    /// Deceleration to zero in progress.
    Decel = 2,
    /// Held at zero velocity; position preserved.
    Hold = 3,
    /// Hold released — motion resumes from the held position.
    EndHold = 4,
}

impl HoldState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Sync),
            2 => Some(Self::Decel),
            3 => Some(Self::Hold),
            4 => Some(Self::EndHold),
            _ => None,
        }
    }

    /// Returns true while a hold is being sequenced or held.
    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Sync | Self::Decel | Self::Hold)
    }
}

impl Default for HoldState {
    fn default() -> Self {
        Self::Off
    }
}

/// Per-axis homing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HomingState {
    /// Axis position has not been referenced.
    NotHomed = 0,
    /// Axis position is referenced to machine zero.
    Homed = 1,
}

impl HomingState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NotHomed),
            1 => Some(Self::Homed),
            _ => None,
        }
    }
}

impl Default for HomingState {
    fn default() -> Self {
        Self::NotHomed
    }
}

// ─── Motor Power ────────────────────────────────────────────────────

/// Per-motor power state.
///
/// `Idle` is distinct from `Off` to leave room for torque-maintaining
/// reduced-current idling; currently both drop the enable line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotorPowerState {
    /// Stopped and de-energized.
    Off = 0,
    /// Stopped, possibly partially energized for torque maintenance.
    Idle = 1,
    /// Stopped and fully energized, idle countdown running.
    Stopped = 2,
    /// Running and fully energized.
    Running = 3,
}

impl MotorPowerState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Idle),
            2 => Some(Self::Stopped),
            3 => Some(Self::Running),
            _ => None,
        }
    }

    /// Returns true if the enable line should be asserted in this state.
    #[inline]
    pub const fn is_energized(&self) -> bool {
        matches!(self, Self::Stopped | Self::Running)
    }
}

impl Default for MotorPowerState {
    fn default() -> Self {
        Self::Off
    }
}

/// Per-motor power management policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum MotorPowerMode {
    /// Fully powered whenever a cycle is active; off at cycle end.
    EnergizedDuringCycle = 0,
    /// Powered while moving; idled after a timeout once stopped.
    IdleWhenStopped = 1,
    /// Reserved: reduced-current idle.
    PowerReducedWhenIdle = 2,
    /// Reserved: current scaled with velocity.
    Dynamic = 3,
}

impl MotorPowerMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::EnergizedDuringCycle),
            1 => Some(Self::IdleWhenStopped),
            2 => Some(Self::PowerReducedWhenIdle),
            3 => Some(Self::Dynamic),
            _ => None,
        }
    }
}

impl Default for MotorPowerMode {
    fn default() -> Self {
        Self::EnergizedDuringCycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_state_roundtrip() {
        for v in 0..=5u8 {
            let state = MachineState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(MachineState::from_u8(6).is_none());
        assert!(MachineState::from_u8(255).is_none());
    }

    #[test]
    fn cycle_state_roundtrip() {
        for v in 0..=2u8 {
            let state = CycleState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(CycleState::from_u8(3).is_none());
    }

    #[test]
    fn motion_state_roundtrip() {
        for v in 0..=2u8 {
            let state = MotionState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(MotionState::from_u8(3).is_none());
    }

    #[test]
    fn hold_state_roundtrip() {
        for v in 0..=4u8 {
            let state = HoldState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(HoldState::from_u8(5).is_none());
    }

    #[test]
    fn hold_state_is_active() {
        assert!(!HoldState::Off.is_active());
        assert!(HoldState::Sync.is_active());
        assert!(HoldState::Decel.is_active());
        assert!(HoldState::Hold.is_active());
        assert!(!HoldState::EndHold.is_active());
    }

    #[test]
    fn motor_power_state_roundtrip() {
        for v in 0..=3u8 {
            let state = MotorPowerState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(MotorPowerState::from_u8(4).is_none());
    }

    #[test]
    fn motor_power_state_energized() {
        assert!(!MotorPowerState::Off.is_energized());
        assert!(!MotorPowerState::Idle.is_energized());
        assert!(MotorPowerState::Stopped.is_energized());
        assert!(MotorPowerState::Running.is_energized());
    }

    #[test]
    fn motor_power_mode_roundtrip() {
        for v in 0..=3u8 {
            let mode = MotorPowerMode::from_u8(v).unwrap();
            assert_eq!(mode as u8, v);
        }
        assert!(MotorPowerMode::from_u8(4).is_none());
    }

    #[test]
    fn homing_state_roundtrip() {
        for v in 0..=1u8 {
            let state = HomingState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(HomingState::from_u8(2).is_none());
    }
}
