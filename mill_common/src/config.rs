//! Machine configuration structures.
//!
//! `MachineConfig` is the serde-facing shape: sparse per-axis and per-motor
//! entry lists over built-in defaults, plus the coordinate-system offset
//! table and gcode power-on defaults. `resolve()` produces the dense
//! [`ResolvedConfig`] the motion core runs against.
//!
//! Validation returns plain `String` reasons; the loader in the motion
//! crate wraps them into its config error type.

use serde::{Deserialize, Serialize};

use crate::consts::{
    AXES, AXIS_Z, COORDS, IDLE_TIMEOUT_SECONDS_MAX, IDLE_TIMEOUT_SECONDS_MIN, MOTORS,
};
use crate::gcode::{AxisMode, CoordSystem, DistanceMode, PathControl, Plane, Units};
use crate::state::MotorPowerMode;

// ─── Per-Axis Configuration ─────────────────────────────────────────

/// Per-axis kinematic configuration.
///
/// Linear axes (XYZ) are in mm; rotary axes (ABC) are in degrees, except in
/// `Radius` mode where inputs arrive as arc length in length units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Axis index this entry applies to [0=X, 1=Y, 2=Z, 3=A, 4=B, 5=C].
    pub axis_id: u8,
    /// Interpretation mode for this axis.
    #[serde(default)]
    pub axis_mode: AxisMode,
    /// Maximum traverse velocity [units/min].
    #[serde(default = "default_velocity_max")]
    pub velocity_max: f64,
    /// Maximum feed velocity [units/min].
    #[serde(default = "default_feedrate_max")]
    pub feedrate_max: f64,
    /// Maximum jerk [units/min³].
    #[serde(default = "default_jerk_max")]
    pub jerk_max: f64,
    /// Cornering tolerance used by the junction velocity limit [units].
    #[serde(default = "default_junction_deviation")]
    pub junction_deviation: f64,
    /// Effective circle radius for `Radius` mode rotary axes [mm].
    #[serde(default = "default_radius")]
    pub radius: f64,
}

fn default_velocity_max() -> f64 {
    10_000.0
}
fn default_feedrate_max() -> f64 {
    10_000.0
}
fn default_jerk_max() -> f64 {
    5.0e9
}
fn default_junction_deviation() -> f64 {
    0.05
}
fn default_radius() -> f64 {
    1.0
}

impl AxisConfig {
    /// Built-in default for an axis index: linear for XYZ, rotary (degree
    /// units, higher ceiling) for ABC.
    pub fn default_for(axis_id: u8) -> Self {
        let rotary = axis_id as usize > AXIS_Z;
        Self {
            axis_id,
            axis_mode: AxisMode::Standard,
            velocity_max: if rotary { 36_000.0 } else { 10_000.0 },
            feedrate_max: if rotary { 36_000.0 } else { 10_000.0 },
            jerk_max: if rotary { 2.0e10 } else { 5.0e9 },
            junction_deviation: 0.05,
            radius: 1.0,
        }
    }
}

// ─── Per-Motor Configuration ────────────────────────────────────────

/// Per-motor drive configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Motor index this entry applies to [0..=5].
    pub motor_id: u8,
    /// Axis this motor drives [0=X ... 5=C]. Several motors may share an
    /// axis (dual-motor gantries).
    pub axis: u8,
    /// Full step angle [deg].
    #[serde(default = "default_step_angle")]
    pub step_angle: f64,
    /// Travel per motor revolution [units].
    #[serde(default = "default_travel_per_rev")]
    pub travel_per_rev: f64,
    /// Microsteps per full step.
    #[serde(default = "default_microsteps")]
    pub microsteps: u8,
    /// Reverse the direction signal.
    #[serde(default)]
    pub polarity_reversed: bool,
    /// Power management policy.
    #[serde(default)]
    pub power_mode: MotorPowerMode,
}

fn default_step_angle() -> f64 {
    1.8
}
fn default_travel_per_rev() -> f64 {
    5.0
}
fn default_microsteps() -> u8 {
    8
}

impl MotorConfig {
    /// Built-in default for a motor index: motor N drives axis N.
    pub fn default_for(motor_id: u8) -> Self {
        let rotary = motor_id as usize > AXIS_Z;
        Self {
            motor_id,
            axis: motor_id,
            step_angle: 1.8,
            // Rotary axes are direct-drive in degrees.
            travel_per_rev: if rotary { 360.0 } else { 5.0 },
            microsteps: 8,
            polarity_reversed: false,
            power_mode: MotorPowerMode::EnergizedDuringCycle,
        }
    }

    /// Steps per configured unit (mm or deg), derived from the step angle,
    /// microstepping, and travel per revolution.
    #[inline]
    pub fn steps_per_unit(&self) -> f64 {
        360.0 / (self.step_angle / self.microsteps as f64) / self.travel_per_rev
    }
}

// ─── Global Sections ────────────────────────────────────────────────

/// Machine-wide tuning values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MachineSection {
    /// Centripetal acceleration budget for cornering [units/min²].
    #[serde(default = "default_junction_acceleration")]
    pub junction_acceleration: f64,
    /// Seconds of standstill before `idle-when-stopped` motors drop to idle.
    #[serde(default = "default_motor_idle_timeout")]
    pub motor_idle_timeout: f64,
}

fn default_junction_acceleration() -> f64 {
    2.0e6
}
fn default_motor_idle_timeout() -> f64 {
    2.0
}

impl Default for MachineSection {
    fn default() -> Self {
        Self {
            junction_acceleration: default_junction_acceleration(),
            motor_idle_timeout: default_motor_idle_timeout(),
        }
    }
}

/// Gcode modal defaults applied at power-on and at program end (M2/M30).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GcodeDefaults {
    #[serde(default)]
    pub units: Units,
    #[serde(default)]
    pub plane: Plane,
    #[serde(default)]
    pub distance_mode: DistanceMode,
    #[serde(default)]
    pub path_control: PathControl,
    #[serde(default)]
    pub coord_system: CoordSystem,
}

// ─── Top-Level Configuration ────────────────────────────────────────

/// Serde-facing machine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub machine: MachineSection,
    #[serde(default)]
    pub gcode: GcodeDefaults,
    /// Sparse axis overrides; unlisted axes use `AxisConfig::default_for`.
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
    /// Sparse motor overrides; unlisted motors use `MotorConfig::default_for`.
    #[serde(default)]
    pub motors: Vec<MotorConfig>,
    /// Work coordinate system offsets [G54..G59][X..C], in mm/deg.
    #[serde(default)]
    pub coord_offsets: [[f64; AXES]; COORDS],
}

impl MachineConfig {
    /// Validate entry ranges and uniqueness. Returns the first violation.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen_axes = [false; AXES];
        for ax in &self.axes {
            let id = ax.axis_id as usize;
            if id >= AXES {
                return Err(format!("axis_id {} out of range [0, {}]", ax.axis_id, AXES - 1));
            }
            if seen_axes[id] {
                return Err(format!("duplicate axis_id {}", ax.axis_id));
            }
            seen_axes[id] = true;

            if ax.axis_mode.is_active() {
                if ax.velocity_max <= 0.0 {
                    return Err(format!("axis {}: velocity_max must be > 0", ax.axis_id));
                }
                if ax.feedrate_max <= 0.0 {
                    return Err(format!("axis {}: feedrate_max must be > 0", ax.axis_id));
                }
                if ax.jerk_max <= 0.0 {
                    return Err(format!("axis {}: jerk_max must be > 0", ax.axis_id));
                }
                if ax.junction_deviation < 0.0 {
                    return Err(format!("axis {}: junction_deviation must be >= 0", ax.axis_id));
                }
            }
            if ax.axis_mode == AxisMode::Radius {
                if id <= AXIS_Z {
                    return Err(format!("axis {}: radius mode is rotary-only", ax.axis_id));
                }
                if ax.radius <= 0.0 {
                    return Err(format!("axis {}: radius must be > 0 in radius mode", ax.axis_id));
                }
            }
        }

        let mut seen_motors = [false; MOTORS];
        for m in &self.motors {
            let id = m.motor_id as usize;
            if id >= MOTORS {
                return Err(format!("motor_id {} out of range [0, {}]", m.motor_id, MOTORS - 1));
            }
            if seen_motors[id] {
                return Err(format!("duplicate motor_id {}", m.motor_id));
            }
            seen_motors[id] = true;

            if m.axis as usize >= AXES {
                return Err(format!("motor {}: axis {} out of range", m.motor_id, m.axis));
            }
            if m.step_angle <= 0.0 || m.travel_per_rev <= 0.0 {
                return Err(format!(
                    "motor {}: step_angle and travel_per_rev must be > 0",
                    m.motor_id
                ));
            }
            if m.microsteps == 0 {
                return Err(format!("motor {}: microsteps must be >= 1", m.motor_id));
            }
        }

        if self.machine.junction_acceleration <= 0.0 {
            return Err("junction_acceleration must be > 0".to_string());
        }
        Ok(())
    }

    /// Expand sparse entries over the built-in defaults into dense tables.
    ///
    /// Call `validate()` first; `resolve` assumes in-range ids.
    pub fn resolve(&self) -> ResolvedConfig {
        let mut axes = [AxisConfig::default_for(0); AXES];
        for (i, slot) in axes.iter_mut().enumerate() {
            *slot = AxisConfig::default_for(i as u8);
        }
        for ax in &self.axes {
            axes[ax.axis_id as usize] = *ax;
        }

        let mut motors = [MotorConfig::default_for(0); MOTORS];
        for (i, slot) in motors.iter_mut().enumerate() {
            *slot = MotorConfig::default_for(i as u8);
        }
        for m in &self.motors {
            motors[m.motor_id as usize] = *m;
        }

        let mut motor_map = MotorMap::default();
        for m in &motors {
            // Capacity equals MOTORS, so pushes cannot fail.
            let _ = motor_map.by_axis[m.axis as usize].push(m.motor_id);
        }

        let idle_timeout = self
            .machine
            .motor_idle_timeout
            .clamp(IDLE_TIMEOUT_SECONDS_MIN, IDLE_TIMEOUT_SECONDS_MAX);

        ResolvedConfig {
            machine: MachineSection {
                motor_idle_timeout: idle_timeout,
                ..self.machine
            },
            gcode: self.gcode,
            axes,
            motors,
            coord_offsets: self.coord_offsets,
            motor_map,
        }
    }
}

/// Motors grouped by the axis they drive.
#[derive(Debug, Clone, Default)]
pub struct MotorMap {
    pub by_axis: [heapless::Vec<u8, MOTORS>; AXES],
}

/// Dense, validated configuration the motion core runs against.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub machine: MachineSection,
    pub gcode: GcodeDefaults,
    pub axes: [AxisConfig; AXES],
    pub motors: [MotorConfig; MOTORS],
    pub coord_offsets: [[f64; AXES]; COORDS],
    pub motor_map: MotorMap,
}

impl ResolvedConfig {
    #[inline]
    pub fn axis(&self, axis: usize) -> &AxisConfig {
        &self.axes[axis]
    }

    #[inline]
    pub fn motor(&self, motor: usize) -> &MotorConfig {
        &self.motors[motor]
    }

    /// Active coordinate offset component from the offset table.
    #[inline]
    pub fn coord_offset(&self, coord: CoordSystem, axis: usize) -> f64 {
        self.coord_offsets[coord.index()][axis]
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        MachineConfig::default().resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_and_resolves() {
        let cfg = MachineConfig::default();
        cfg.validate().expect("defaults must validate");
        let resolved = cfg.resolve();
        assert_eq!(resolved.axes[0].axis_id, 0);
        assert_eq!(resolved.motors[5].axis, 5);
        // Motor map: one motor per axis by default.
        for axis in 0..AXES {
            assert_eq!(resolved.motor_map.by_axis[axis].len(), 1);
            assert_eq!(resolved.motor_map.by_axis[axis][0], axis as u8);
        }
    }

    #[test]
    fn steps_per_unit_from_drive_geometry() {
        let m = MotorConfig::default_for(0);
        // 1.8° step, 8 microsteps, 5 mm/rev → 320 steps/mm.
        assert!((m.steps_per_unit() - 320.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_axis_rejected() {
        let cfg = MachineConfig {
            axes: vec![AxisConfig::default_for(1), AxisConfig::default_for(1)],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("duplicate axis_id"), "{err}");
    }

    #[test]
    fn radius_mode_linear_axis_rejected() {
        let mut ax = AxisConfig::default_for(0);
        ax.axis_mode = AxisMode::Radius;
        let cfg = MachineConfig {
            axes: vec![ax],
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("rotary-only"), "{err}");
    }

    #[test]
    fn motor_axis_out_of_range_rejected() {
        let mut m = MotorConfig::default_for(0);
        m.axis = 9;
        let cfg = MachineConfig {
            motors: vec![m],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn idle_timeout_clamped_on_resolve() {
        let cfg = MachineConfig {
            machine: MachineSection {
                motor_idle_timeout: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let resolved = cfg.resolve();
        assert_eq!(resolved.machine.motor_idle_timeout, IDLE_TIMEOUT_SECONDS_MIN);
    }

    #[test]
    fn dual_motor_axis_maps_both_motors() {
        let mut m3 = MotorConfig::default_for(3);
        m3.axis = 1; // second Y motor
        let cfg = MachineConfig {
            motors: vec![m3],
            ..Default::default()
        };
        cfg.validate().unwrap();
        let resolved = cfg.resolve();
        assert_eq!(resolved.motor_map.by_axis[1].len(), 2);
        assert!(resolved.motor_map.by_axis[3].is_empty());
    }
}
