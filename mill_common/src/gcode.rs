//! Gcode modal state enums.
//!
//! These mirror the RS274/NGC modal groups the canonical machine tracks:
//! units, distance mode, coordinate system, plane, path control, motion
//! mode, feed-rate mode, and spindle mode. Config-facing enums derive
//! serde with kebab-case names so they read naturally in TOML.

use serde::{Deserialize, Serialize};

use crate::consts::{AXIS_X, AXIS_Y, AXIS_Z};

// ─── Units and Distance ─────────────────────────────────────────────

/// Linear input units (G20/G21). Internal state is always millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Units {
    /// G20 — inches.
    Inches = 0,
    /// G21 — millimetres.
    Millimetres = 1,
}

impl Units {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Inches),
            1 => Some(Self::Millimetres),
            _ => None,
        }
    }
}

impl Default for Units {
    fn default() -> Self {
        Self::Millimetres
    }
}

/// Distance mode (G90/G91).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum DistanceMode {
    /// G90 — targets are absolute work coordinates.
    Absolute = 0,
    /// G91 — targets are increments from the current position.
    Incremental = 1,
}

impl DistanceMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Absolute),
            1 => Some(Self::Incremental),
            _ => None,
        }
    }
}

impl Default for DistanceMode {
    fn default() -> Self {
        Self::Absolute
    }
}

/// Feed-rate interpretation (G93/G94).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum FeedRateMode {
    /// G94 — F is units per minute.
    UnitsPerMinute = 0,
    /// G93 — F is inverse time (min⁻¹), effective for the current block only.
    InverseTime = 1,
}

impl FeedRateMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::UnitsPerMinute),
            1 => Some(Self::InverseTime),
            _ => None,
        }
    }
}

impl Default for FeedRateMode {
    fn default() -> Self {
        Self::UnitsPerMinute
    }
}

// ─── Coordinate Systems ─────────────────────────────────────────────

/// Work coordinate system selection.
///
/// `Absolute` is G53 machine coordinates — not selectable as a modal system,
/// only as a one-shot override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CoordSystem {
    /// G54 (default work system).
    G54 = 0,
    G55 = 1,
    G56 = 2,
    G57 = 3,
    G58 = 4,
    G59 = 5,
}

impl CoordSystem {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::G54),
            1 => Some(Self::G55),
            2 => Some(Self::G56),
            3 => Some(Self::G57),
            4 => Some(Self::G58),
            5 => Some(Self::G59),
            _ => None,
        }
    }

    /// Index into the coordinate offset table.
    #[inline]
    pub const fn index(&self) -> usize {
        *self as usize
    }
}

impl Default for CoordSystem {
    fn default() -> Self {
        Self::G54
    }
}

// ─── Plane Selection ────────────────────────────────────────────────

/// Arc plane selection (G17/G18/G19).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Plane {
    /// G17 — XY plane.
    Xy = 0,
    /// G18 — XZ plane.
    Xz = 1,
    /// G19 — YZ plane.
    Yz = 2,
}

impl Plane {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Xy),
            1 => Some(Self::Xz),
            2 => Some(Self::Yz),
            _ => None,
        }
    }

    /// Derived plane axes `(axis_0, axis_1, axis_2)` where axis_2 is normal
    /// to the selected plane.
    #[inline]
    pub const fn axes(&self) -> (usize, usize, usize) {
        match self {
            Self::Xy => (AXIS_X, AXIS_Y, AXIS_Z),
            Self::Xz => (AXIS_X, AXIS_Z, AXIS_Y),
            Self::Yz => (AXIS_Y, AXIS_Z, AXIS_X),
        }
    }
}

impl Default for Plane {
    fn default() -> Self {
        Self::Xy
    }
}

// ─── Path Control and Motion ────────────────────────────────────────

/// Path control mode (G61/G61.1/G64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum PathControl {
    /// G61 — exact path.
    ExactPath = 0,
    /// G61.1 — exact stop at block boundaries.
    ExactStop = 1,
    /// G64 — continuous blending (default).
    Continuous = 2,
}

impl PathControl {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ExactPath),
            1 => Some(Self::ExactStop),
            2 => Some(Self::Continuous),
            _ => None,
        }
    }
}

impl Default for PathControl {
    fn default() -> Self {
        Self::Continuous
    }
}

/// Active motion mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotionMode {
    /// G0 — straight traverse.
    StraightTraverse = 0,
    /// G1 — straight feed.
    StraightFeed = 1,
    /// G2/G3 — arc feed (tessellated upstream into straight feeds).
    ArcFeed = 2,
    /// G80 — motion mode cancelled.
    Cancel = 3,
}

impl MotionMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::StraightTraverse),
            1 => Some(Self::StraightFeed),
            2 => Some(Self::ArcFeed),
            3 => Some(Self::Cancel),
            _ => None,
        }
    }
}

impl Default for MotionMode {
    fn default() -> Self {
        Self::Cancel
    }
}

/// Spindle state (M3/M4/M5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum SpindleMode {
    /// M5 — spindle off.
    Off = 0,
    /// M3 — clockwise.
    Cw = 1,
    /// M4 — counter-clockwise.
    Ccw = 2,
}

impl SpindleMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Cw),
            2 => Some(Self::Ccw),
            _ => None,
        }
    }
}

impl Default for SpindleMode {
    fn default() -> Self {
        Self::Off
    }
}

// ─── Axis Modes ─────────────────────────────────────────────────────

/// Per-axis interpretation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum AxisMode {
    /// Axis inputs are ignored; axis does not move.
    Disabled = 0,
    /// Normal operation: XYZ in length units, ABC in degrees.
    Standard = 1,
    /// Processed like `Standard` but the axis is not driven.
    Inhibited = 2,
    /// Rotary only: input is a linear arc length on a circle of the
    /// configured radius, converted to degrees.
    Radius = 3,
}

impl AxisMode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Disabled),
            1 => Some(Self::Standard),
            2 => Some(Self::Inhibited),
            3 => Some(Self::Radius),
            _ => None,
        }
    }

    /// Returns true if targets on this axis participate in planning.
    #[inline]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl Default for AxisMode {
    fn default() -> Self {
        Self::Standard
    }
}
