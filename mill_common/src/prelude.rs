//! Common re-exports for consumers of the millcore type set.
//!
//! ```rust
//! use mill_common::prelude::*;
//! ```

pub use crate::config::{AxisConfig, MachineConfig, MotorConfig, ResolvedConfig};
pub use crate::consts::{AXES, MOTORS};
pub use crate::error::{AlarmCause, MotionFault};
pub use crate::gcode::{
    AxisMode, CoordSystem, DistanceMode, FeedRateMode, MotionMode, PathControl, Plane, SpindleMode,
    Units,
};
pub use crate::hal::{NullReporter, ReportEvent, StatusReporter, StepDriver};
pub use crate::state::{
    CycleState, HoldState, HomingState, MachineState, MotionState, MotorPowerMode, MotorPowerState,
};
