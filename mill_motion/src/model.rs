//! Canonical gcode model state.
//!
//! `GcodeModel` holds the modal interpreter state in canonical form:
//! millimetres (degrees for rotary axes), absolute machine coordinates.
//! It is mutated only from the main context and from command-block
//! callbacks whose inputs were written before the block was committed.

use mill_common::config::GcodeDefaults;
use mill_common::consts::AXES;
use mill_common::gcode::{
    CoordSystem, DistanceMode, FeedRateMode, MotionMode, PathControl, Plane, SpindleMode, Units,
};

/// Modal gcode state in canonical units.
#[derive(Debug, Clone)]
pub struct GcodeModel {
    /// Model position after the last successfully enqueued move [mm/deg].
    pub position: [f64; AXES],
    /// Target of the move being assembled [mm/deg].
    pub target: [f64; AXES],
    /// Work offsets captured for the current move (reporting).
    pub work_offset: [f64; AXES],

    /// Feed rate [mm/min], canonical.
    pub feed_rate: f64,
    /// Inverse-time F word [min⁻¹], consumed by the next feed block.
    pub inverse_feed_rate: f64,
    /// G93/G94.
    pub feed_rate_mode: FeedRateMode,

    pub units: Units,
    pub distance_mode: DistanceMode,
    pub coord_system: CoordSystem,
    /// G92 offset components [mm/deg].
    pub origin_offset: [f64; AXES],
    /// G92 offsets active.
    pub origin_offset_enable: bool,
    /// G53 one-shot: suppress all offsets for the current block.
    pub absolute_override: bool,

    pub motion_mode: MotionMode,
    pub path_control: PathControl,
    pub plane: Plane,

    pub spindle_mode: SpindleMode,
    /// Commanded spindle speed [rpm].
    pub spindle_speed: f64,
    pub tool: u8,
    pub mist_coolant: bool,
    pub flood_coolant: bool,

    pub feed_override_enable: bool,
    /// Feed override factor (1.0 = 100%).
    pub feed_override_factor: f64,
    pub traverse_override_enable: bool,
    pub traverse_override_factor: f64,
    pub spindle_override_enable: bool,
    pub spindle_override_factor: f64,

    /// Gcode line number of the block being assembled.
    pub linenum: u32,
    /// Minimum move time of the block being assembled [min].
    pub min_time: f64,

    /// IJK arc offsets [mm] (arc tessellation is upstream).
    pub arc_offset: [f64; 3],
    /// R-word arc radius [mm].
    pub arc_radius: f64,

    /// Stored G28 reference position [mm/deg].
    pub g28_position: [f64; AXES],
    /// Stored G30 reference position [mm/deg].
    pub g30_position: [f64; AXES],
}

impl GcodeModel {
    /// Model initialized from power-on defaults. Never starts in a motion
    /// mode.
    pub fn new(defaults: &GcodeDefaults) -> Self {
        Self {
            position: [0.0; AXES],
            target: [0.0; AXES],
            work_offset: [0.0; AXES],
            feed_rate: 0.0,
            inverse_feed_rate: 0.0,
            feed_rate_mode: FeedRateMode::UnitsPerMinute,
            units: defaults.units,
            distance_mode: defaults.distance_mode,
            coord_system: defaults.coord_system,
            origin_offset: [0.0; AXES],
            origin_offset_enable: false,
            absolute_override: false,
            motion_mode: MotionMode::Cancel,
            path_control: defaults.path_control,
            plane: defaults.plane,
            spindle_mode: SpindleMode::Off,
            spindle_speed: 0.0,
            tool: 0,
            mist_coolant: false,
            flood_coolant: false,
            feed_override_enable: false,
            feed_override_factor: 1.0,
            traverse_override_enable: false,
            traverse_override_factor: 1.0,
            spindle_override_enable: false,
            spindle_override_factor: 1.0,
            linenum: 0,
            min_time: 0.0,
            arc_offset: [0.0; 3],
            arc_radius: 0.0,
            g28_position: [0.0; AXES],
            g30_position: [0.0; AXES],
        }
    }

    /// Derived plane axes for the active plane selection.
    #[inline]
    pub fn plane_axes(&self) -> (usize, usize, usize) {
        self.plane.axes()
    }
}
