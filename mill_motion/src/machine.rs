//! Canonical machine.
//!
//! Translates RS274/NGC-level operations into canonical moves and modal
//! updates, and owns the three-context pipeline: main-context calls mutate
//! the model and append planner blocks; the exec context promotes blocks,
//! runs the trapezoid solver and slices segments; the loader/DDA context
//! clocks pulses out of the prep mailbox.
//!
//! Operations fall into three temporal classes: model-only (applied
//! immediately), planner-queued (deferred command blocks, executed in
//! queue order), and runtime requests (feedhold, queue flush, cycle start),
//! which are latched and sequenced by a callback.

use std::f64::consts::PI;

use tracing::{debug, info, warn};

use mill_common::config::ResolvedConfig;
use mill_common::consts::{
    AXES, AXIS_A, AXIS_X, AXIS_Z, MICROSECONDS_PER_MINUTE, MM_PER_INCH, MOTORS,
};
use mill_common::error::{AlarmCause, MotionFault};
use mill_common::gcode::{
    AxisMode, CoordSystem, DistanceMode, FeedRateMode, MotionMode, PathControl, Plane, SpindleMode,
    Units,
};
use mill_common::hal::{NullReporter, ReportEvent, StatusReporter, StepDriver};
use mill_common::state::{CycleState, HoldState, HomingState, MachineState, MotionState};

use crate::exec::{ExecStep, Runtime};
use crate::math::{fp_zero, max4, vector_equal, EPSILON};
use crate::model::GcodeModel;
use crate::planner::buffer::{Block, BlockState, MoveType, QueuedCommand};
use crate::planner::{zoid, Planner};
use crate::stepper::StepperChannel;

/// Per-axis update flags for target-setting operations.
pub type AxisFlags = [bool; AXES];

/// Convenience: all axes flagged.
pub const ALL_AXES: AxisFlags = [true; AXES];

// ─── Machine ────────────────────────────────────────────────────────

/// The canonical machine and its motion pipeline.
pub struct Machine {
    cfg: ResolvedConfig,
    gm: GcodeModel,

    machine_state: MachineState,
    cycle_state: CycleState,
    motion_state: MotionState,
    hold_state: HoldState,
    homed: [HomingState; AXES],
    alarm_flags: AlarmCause,

    feedhold_requested: bool,
    queue_flush_requested: bool,
    cycle_start_requested: bool,

    planner: Planner,
    runtime: Runtime,
    stepper: StepperChannel,
    reporter: Box<dyn StatusReporter>,
}

impl Machine {
    pub fn new(cfg: ResolvedConfig) -> Self {
        Self::with_reporter(cfg, Box::new(NullReporter))
    }

    pub fn with_reporter(cfg: ResolvedConfig, reporter: Box<dyn StatusReporter>) -> Self {
        let gm = GcodeModel::new(&cfg.gcode);
        info!("canonical machine initialized");
        Self {
            gm,
            cfg,
            machine_state: MachineState::Ready,
            cycle_state: CycleState::Off,
            motion_state: MotionState::Stop,
            hold_state: HoldState::Off,
            homed: [HomingState::NotHomed; AXES],
            alarm_flags: AlarmCause::empty(),
            feedhold_requested: false,
            queue_flush_requested: false,
            cycle_start_requested: false,
            planner: Planner::new(),
            runtime: Runtime::new(),
            stepper: StepperChannel::new(),
            reporter,
        }
    }

    // ── State access ────────────────────────────────────────────────

    #[inline]
    pub fn config(&self) -> &ResolvedConfig {
        &self.cfg
    }

    #[inline]
    pub fn model(&self) -> &GcodeModel {
        &self.gm
    }

    #[inline]
    pub fn machine_state(&self) -> MachineState {
        self.machine_state
    }

    #[inline]
    pub fn cycle_state(&self) -> CycleState {
        self.cycle_state
    }

    #[inline]
    pub fn motion_state(&self) -> MotionState {
        self.motion_state
    }

    #[inline]
    pub fn hold_state(&self) -> HoldState {
        self.hold_state
    }

    #[inline]
    pub fn homing_state(&self, axis: usize) -> HomingState {
        self.homed[axis]
    }

    #[inline]
    pub fn alarm_flags(&self) -> AlarmCause {
        self.alarm_flags
    }

    /// Free planner blocks.
    #[inline]
    pub fn planner_buffers_available(&self) -> usize {
        self.planner.buffers_available()
    }

    /// True when no motion work remains anywhere in the pipeline.
    pub fn is_idle(&self) -> bool {
        self.planner.is_empty() && self.runtime.active.is_none() && !self.stepper.is_busy()
    }

    /// Kind of work the pulse engine is clocking.
    #[inline]
    pub fn stepper_active(&self) -> MoveType {
        self.stepper.active_move()
    }

    #[inline]
    pub fn stepper_busy(&self) -> bool {
        self.stepper.is_busy()
    }

    // ── Position and offset getters ─────────────────────────────────

    /// Factor dividing canonical mm into display units for linear axes.
    fn linear_units_factor(&self) -> f64 {
        match self.gm.units {
            Units::Inches => MM_PER_INCH,
            Units::Millimetres => 1.0,
        }
    }

    /// Currently active coordinate offset for an axis: the G5x component
    /// plus the G92 component when enabled. Zero under G53 override.
    pub fn coord_offset(&self, axis: usize) -> f64 {
        if self.gm.absolute_override {
            return 0.0;
        }
        let mut offset = self.cfg.coord_offset(self.gm.coord_system, axis);
        if self.gm.origin_offset_enable {
            offset += self.gm.origin_offset[axis];
        }
        offset
    }

    fn coord_offset_vector(&self) -> [f64; AXES] {
        let mut v = [0.0; AXES];
        for (axis, slot) in v.iter_mut().enumerate() {
            *slot = self.coord_offset(axis);
        }
        v
    }

    /// Model work position in the modal display units.
    pub fn work_position(&self, axis: usize) -> f64 {
        let mm = self.gm.position[axis] - self.coord_offset(axis);
        if axis <= AXIS_Z {
            mm / self.linear_units_factor()
        } else {
            mm
        }
    }

    /// Model target in canonical form (mm, absolute).
    #[inline]
    pub fn canonical_target(&self, axis: usize) -> f64 {
        self.gm.target[axis]
    }

    /// Model position in canonical form.
    #[inline]
    pub fn canonical_position(&self) -> [f64; AXES] {
        self.gm.position
    }

    /// Runtime (executor) machine position in canonical form.
    #[inline]
    pub fn runtime_machine_position(&self, axis: usize) -> f64 {
        self.runtime.position[axis]
    }

    /// Runtime work position in the modal display units.
    pub fn runtime_work_position(&self, axis: usize) -> f64 {
        let mm = self.runtime.position[axis] - self.runtime.work_offset[axis];
        if axis <= AXIS_Z {
            mm / self.linear_units_factor()
        } else {
            mm
        }
    }

    /// Velocity of the most recent runtime segment [mm/min].
    #[inline]
    pub fn runtime_velocity(&self) -> f64 {
        self.runtime.segment_velocity
    }

    // ── Unit conversion and target setting ──────────────────────────

    fn to_millimetres(&self, value: f64) -> f64 {
        match self.gm.units {
            Units::Inches => value * MM_PER_INCH,
            Units::Millimetres => value,
        }
    }

    /// Rotary-axis input in canonical degrees: standard/inhibited axes take
    /// degrees directly; radius-mode axes take a linear arc length on the
    /// configured circle.
    fn rotary_input(&self, axis: usize, value: f64) -> f64 {
        match self.cfg.axis(axis).axis_mode {
            AxisMode::Radius => {
                self.to_millimetres(value) * 360.0 / (2.0 * PI * self.cfg.axis(axis).radius)
            }
            _ => value,
        }
    }

    /// Core coordinate transform: convert flagged inputs to canonical mm,
    /// resolve distance mode, and apply work offsets into `gm.target`.
    fn set_target(&mut self, target: &[f64; AXES], flags: &AxisFlags) {
        for axis in AXIS_X..=AXIS_Z {
            if !flags[axis] || self.cfg.axis(axis).axis_mode == AxisMode::Disabled {
                continue;
            }
            let value = self.to_millimetres(target[axis]);
            match self.gm.distance_mode {
                DistanceMode::Absolute => {
                    self.gm.target[axis] = self.coord_offset(axis) + value;
                }
                DistanceMode::Incremental => self.gm.target[axis] += value,
            }
        }
        for axis in AXIS_A..AXES {
            if !flags[axis] || self.cfg.axis(axis).axis_mode == AxisMode::Disabled {
                continue;
            }
            let value = self.rotary_input(axis, target[axis]);
            match self.gm.distance_mode {
                DistanceMode::Absolute => {
                    self.gm.target[axis] = self.coord_offset(axis) + value;
                }
                DistanceMode::Incremental => self.gm.target[axis] += value,
            }
        }
    }

    // ── Move-time selection ─────────────────────────────────────────

    /// Compute the optimal and minimum move times [min] for the model's
    /// current position→target pair.
    ///
    /// Feed semantics follow NIST RS274NGC 2.1.2.5: feed applies to the XYZ
    /// path; pure-rotary feed applies to the Euclidean degree-norm of ABC.
    /// Inverse-time mode uses `1/F` as the duration. The longest of the
    /// candidate times wins; the per-axis rate limits always apply.
    fn move_times(&self) -> (f64, f64) {
        let mut inv_time = 0.0;
        let mut xyz_time = 0.0;
        let mut abc_time = 0.0;
        let mut max_time: f64 = 0.0;
        let mut min_time = f64::MAX;

        if self.gm.motion_mode == MotionMode::StraightFeed {
            if self.gm.feed_rate_mode == FeedRateMode::InverseTime {
                inv_time = 1.0 / self.gm.inverse_feed_rate;
            } else {
                let feed = self.effective_feed_rate();
                let mut xyz_sq = 0.0;
                for axis in AXIS_X..=AXIS_Z {
                    let d = self.gm.target[axis] - self.gm.position[axis];
                    xyz_sq += d * d;
                }
                xyz_time = xyz_sq.sqrt() / feed;
                if fp_zero(xyz_time) {
                    let mut abc_sq = 0.0;
                    for axis in AXIS_A..AXES {
                        let d = self.gm.target[axis] - self.gm.position[axis];
                        abc_sq += d * d;
                    }
                    abc_time = abc_sq.sqrt() / feed;
                }
            }
        }

        for axis in 0..AXES {
            let rate = if self.gm.motion_mode == MotionMode::StraightFeed {
                self.cfg.axis(axis).feedrate_max
            } else {
                self.cfg.axis(axis).velocity_max * self.effective_traverse_factor()
            };
            let tmp = (self.gm.target[axis] - self.gm.position[axis]).abs() / rate;
            max_time = max_time.max(tmp);
            min_time = min_time.min(tmp);
        }
        (max4(inv_time, max_time, xyz_time, abc_time), min_time)
    }

    fn effective_feed_rate(&self) -> f64 {
        if self.gm.feed_override_enable {
            self.gm.feed_rate * self.gm.feed_override_factor
        } else {
            self.gm.feed_rate
        }
    }

    fn effective_traverse_factor(&self) -> f64 {
        if self.gm.traverse_override_enable {
            self.gm.traverse_override_factor.min(1.0)
        } else {
            1.0
        }
    }

    // ── Model-only operations ───────────────────────────────────────

    pub fn set_units(&mut self, units: Units) {
        self.gm.units = units;
    }

    pub fn set_distance_mode(&mut self, mode: DistanceMode) {
        self.gm.distance_mode = mode;
    }

    pub fn select_plane(&mut self, plane: Plane) {
        self.gm.plane = plane;
    }

    pub fn set_path_control(&mut self, mode: PathControl) {
        self.gm.path_control = mode;
    }

    /// F word: feed rate in the current units, or the inverse-time rate
    /// when G93 is active (for the next block only).
    pub fn set_feed_rate(&mut self, feed_rate: f64) {
        if self.gm.feed_rate_mode == FeedRateMode::InverseTime {
            self.gm.inverse_feed_rate = feed_rate;
        } else {
            self.gm.feed_rate = self.to_millimetres(feed_rate);
        }
    }

    pub fn set_feed_rate_mode(&mut self, mode: FeedRateMode) {
        self.gm.feed_rate_mode = mode;
    }

    /// G53 one-shot: suppress work offsets for the current block.
    pub fn set_absolute_override(&mut self, on: bool) {
        self.gm.absolute_override = on;
    }

    pub fn set_model_linenum(&mut self, linenum: u32) {
        self.gm.linenum = linenum;
    }

    pub fn set_arc_offset(&mut self, i: f64, j: f64, k: f64) {
        self.gm.arc_offset = [
            self.to_millimetres(i),
            self.to_millimetres(j),
            self.to_millimetres(k),
        ];
    }

    pub fn set_arc_radius(&mut self, radius: f64) {
        self.gm.arc_radius = self.to_millimetres(radius);
    }

    /// M48/M49: master override enable.
    pub fn override_enables(&mut self, enable: bool) {
        self.gm.feed_override_enable = enable;
        self.gm.traverse_override_enable = enable;
        self.gm.spindle_override_enable = enable;
    }

    /// M50 with a factor: enable and set the feed override. Applies to
    /// blocks enqueued after the change.
    pub fn set_feed_override(&mut self, enable: bool, factor: f64) {
        self.gm.feed_override_enable = enable;
        if factor > 0.0 {
            self.gm.feed_override_factor = factor;
        }
    }

    /// M50.2/M50.3 equivalents for traverses.
    pub fn set_traverse_override(&mut self, enable: bool, factor: f64) {
        self.gm.traverse_override_enable = enable;
        if factor > 0.0 {
            self.gm.traverse_override_factor = factor;
        }
    }

    /// M51 with a factor.
    pub fn set_spindle_override(&mut self, enable: bool, factor: f64) {
        self.gm.spindle_override_enable = enable;
        if factor > 0.0 {
            self.gm.spindle_override_factor = factor;
        }
    }

    // ── Coordinate systems and offsets ──────────────────────────────

    /// G54..G59: activate a work coordinate system. The model updates
    /// immediately; the runtime offset updates in queue order.
    pub fn set_coord_system(&mut self, coord: CoordSystem) -> Result<(), MotionFault> {
        self.gm.coord_system = coord;
        self.planner
            .append_command(QueuedCommand::SyncWorkOffsets(coord), self.gm.linenum)?;
        self.stepper.request_exec();
        Ok(())
    }

    /// G10 L2 Pn: set coordinate-system offsets (0-based index, G54 = 0).
    /// Values are taken in the current units for linear axes.
    pub fn set_coord_offsets(
        &mut self,
        coord: u8,
        offset: &[f64; AXES],
        flags: &AxisFlags,
    ) -> Result<(), MotionFault> {
        let coord = CoordSystem::from_u8(coord).ok_or(MotionFault::CoordSystemOutOfRange)?;
        for axis in 0..AXES {
            if flags[axis] {
                let value = if axis <= AXIS_Z {
                    self.to_millimetres(offset[axis])
                } else {
                    offset[axis]
                };
                self.cfg.coord_offsets[coord.index()][axis] = value;
            }
        }
        Ok(())
    }

    /// G92: bias the work coordinate system so the current position reads
    /// as the given values.
    pub fn set_origin_offsets(
        &mut self,
        offset: &[f64; AXES],
        flags: &AxisFlags,
    ) -> Result<(), MotionFault> {
        self.gm.origin_offset_enable = true;
        for axis in 0..AXES {
            if flags[axis] {
                let value = if axis <= AXIS_Z {
                    self.to_millimetres(offset[axis])
                } else {
                    self.rotary_input(axis, offset[axis])
                };
                self.gm.origin_offset[axis] = self.gm.position[axis]
                    - self.cfg.coord_offset(self.gm.coord_system, axis)
                    - value;
            }
        }
        self.queue_offset_sync()
    }

    /// G92.1: reset and clear the origin offsets.
    pub fn reset_origin_offsets(&mut self) -> Result<(), MotionFault> {
        self.gm.origin_offset_enable = false;
        self.gm.origin_offset = [0.0; AXES];
        self.queue_offset_sync()
    }

    /// G92.2: suspend origin offsets without clearing them.
    pub fn suspend_origin_offsets(&mut self) -> Result<(), MotionFault> {
        self.gm.origin_offset_enable = false;
        self.queue_offset_sync()
    }

    /// G92.3: resume previously suspended origin offsets.
    pub fn resume_origin_offsets(&mut self) -> Result<(), MotionFault> {
        self.gm.origin_offset_enable = true;
        self.queue_offset_sync()
    }

    fn queue_offset_sync(&mut self) -> Result<(), MotionFault> {
        self.planner.append_command(
            QueuedCommand::SyncWorkOffsets(self.gm.coord_system),
            self.gm.linenum,
        )?;
        self.stepper.request_exec();
        Ok(())
    }

    /// Set a single axis position across all contexts (model, planner,
    /// runtime). Used by homing-style operations.
    pub fn set_machine_axis_position(&mut self, axis: usize, position: f64) {
        self.gm.position[axis] = position;
        self.gm.target[axis] = position;
        self.planner.set_axis_position(axis, position);
        self.runtime.position[axis] = position;
    }

    /// G28.3: declare flagged axes to be at the given work values and mark
    /// them referenced.
    pub fn set_absolute_origin(&mut self, origin: &[f64; AXES], flags: &AxisFlags) {
        for axis in 0..AXES {
            if flags[axis] {
                let position = self.cfg.coord_offset(self.gm.coord_system, axis)
                    + self.to_millimetres(origin[axis]);
                self.set_machine_axis_position(axis, position);
                self.homed[axis] = HomingState::Homed;
            }
        }
    }

    // ── G28 / G30 reference positions ───────────────────────────────

    /// G28.1: store the current position as the G28 reference.
    pub fn set_g28_position(&mut self) {
        self.gm.g28_position = self.gm.position;
    }

    /// G28: traverse through the optional intermediate point, then to the
    /// stored reference, both in machine coordinates.
    pub fn goto_g28_position(
        &mut self,
        target: &[f64; AXES],
        flags: &AxisFlags,
    ) -> Result<(), MotionFault> {
        self.set_absolute_override(true);
        self.straight_traverse(target, flags)?;
        self.set_absolute_override(true);
        let reference = self.gm.g28_position;
        self.straight_traverse(&reference, &ALL_AXES)
    }

    /// G30.1: store the current position as the G30 reference.
    pub fn set_g30_position(&mut self) {
        self.gm.g30_position = self.gm.position;
    }

    /// G30: like G28 for the second reference position.
    pub fn goto_g30_position(
        &mut self,
        target: &[f64; AXES],
        flags: &AxisFlags,
    ) -> Result<(), MotionFault> {
        self.set_absolute_override(true);
        self.straight_traverse(target, flags)?;
        self.set_absolute_override(true);
        let reference = self.gm.g30_position;
        self.straight_traverse(&reference, &ALL_AXES)
    }

    // ── Motion commands ─────────────────────────────────────────────

    /// G0: straight traverse to the flagged target coordinates.
    pub fn straight_traverse(
        &mut self,
        target: &[f64; AXES],
        flags: &AxisFlags,
    ) -> Result<(), MotionFault> {
        if self.machine_state == MachineState::Alarm {
            return Err(MotionFault::InAlarm);
        }
        self.gm.motion_mode = MotionMode::StraightTraverse;
        self.set_target(target, flags);
        self.enqueue_line()
    }

    /// G1: straight feed to the flagged target coordinates.
    pub fn straight_feed(
        &mut self,
        target: &[f64; AXES],
        flags: &AxisFlags,
    ) -> Result<(), MotionFault> {
        if self.machine_state == MachineState::Alarm {
            return Err(MotionFault::InAlarm);
        }
        match self.gm.feed_rate_mode {
            FeedRateMode::UnitsPerMinute if fp_zero(self.gm.feed_rate) => {
                return Err(MotionFault::ZeroFeedRate);
            }
            FeedRateMode::InverseTime if self.gm.inverse_feed_rate <= 0.0 => {
                return Err(MotionFault::ZeroFeedRate);
            }
            _ => {}
        }
        self.gm.motion_mode = MotionMode::StraightFeed;
        self.set_target(target, flags);
        self.enqueue_line()
    }

    /// Common tail of the motion commands: skip zero-length targets, queue
    /// the line, and promote the endpoint only on success so sub-threshold
    /// increments accumulate.
    fn enqueue_line(&mut self) -> Result<(), MotionFault> {
        if vector_equal(&self.gm.target, &self.gm.position) {
            self.gm.absolute_override = false;
            return Ok(());
        }
        self.cycle_start();
        self.gm.work_offset = self.coord_offset_vector();
        let (time, min_time) = self.move_times();
        self.gm.min_time = min_time;

        let target = self.gm.target;
        let work_offset = self.gm.work_offset;
        let result = self.planner.append_line(
            &self.cfg,
            &target,
            time,
            &work_offset,
            min_time,
            self.gm.linenum,
        );
        self.gm.absolute_override = false;
        match result {
            Ok(()) => {
                self.gm.position = self.gm.target;
                self.stepper.request_exec();
                Ok(())
            }
            Err(fault) => Err(fault),
        }
    }

    /// G2/G3 endpoint: arcs are tessellated upstream into short straight
    /// moves, so the core records the arc words and routes the endpoint
    /// through the feed path.
    #[allow(clippy::too_many_arguments)]
    pub fn arc_feed(
        &mut self,
        target: &[f64; AXES],
        flags: &AxisFlags,
        offset_i: f64,
        offset_j: f64,
        offset_k: f64,
        radius: f64,
    ) -> Result<(), MotionFault> {
        self.set_arc_offset(offset_i, offset_j, offset_k);
        self.set_arc_radius(radius);
        let result = self.straight_feed(target, flags);
        if result.is_ok() {
            self.gm.motion_mode = MotionMode::ArcFeed;
        }
        result
    }

    /// G4: dwell for the given seconds, synchronous with motion.
    pub fn dwell(&mut self, seconds: f64) -> Result<(), MotionFault> {
        if self.machine_state == MachineState::Alarm {
            return Err(MotionFault::InAlarm);
        }
        self.planner.append_dwell(seconds, self.gm.linenum)?;
        self.stepper.request_exec();
        Ok(())
    }

    // ── Planner-queued auxiliary commands ───────────────────────────

    /// M3/M4/M5: spindle control, synchronized with motion.
    pub fn spindle_control(&mut self, mode: SpindleMode) -> Result<(), MotionFault> {
        self.planner
            .append_command(QueuedCommand::SpindleMode(mode), self.gm.linenum)?;
        self.stepper.request_exec();
        Ok(())
    }

    /// S word: commanded spindle speed, pass-through in queue order.
    pub fn set_spindle_speed(&mut self, speed: f64) -> Result<(), MotionFault> {
        self.planner
            .append_command(QueuedCommand::SpindleSpeed(speed), self.gm.linenum)?;
        self.stepper.request_exec();
        Ok(())
    }

    /// M6: change to the selected tool.
    pub fn change_tool(&mut self, tool: u8) -> Result<(), MotionFault> {
        self.planner
            .append_command(QueuedCommand::ChangeTool(tool), self.gm.linenum)?;
        self.stepper.request_exec();
        Ok(())
    }

    /// T word: preselect a tool.
    pub fn select_tool(&mut self, tool: u8) -> Result<(), MotionFault> {
        self.planner
            .append_command(QueuedCommand::SelectTool(tool), self.gm.linenum)?;
        self.stepper.request_exec();
        Ok(())
    }

    /// M7 (on) / part of M9 (off).
    pub fn mist_coolant_control(&mut self, on: bool) -> Result<(), MotionFault> {
        self.planner
            .append_command(QueuedCommand::MistCoolant(on), self.gm.linenum)?;
        self.stepper.request_exec();
        Ok(())
    }

    /// M8 (on) / M9 (off; also clears mist when it executes).
    pub fn flood_coolant_control(&mut self, on: bool) -> Result<(), MotionFault> {
        self.planner
            .append_command(QueuedCommand::FloodCoolant(on), self.gm.linenum)?;
        self.stepper.request_exec();
        Ok(())
    }

    /// M0/M60: queue a program stop behind the current motion.
    pub fn program_stop(&mut self) -> Result<(), MotionFault> {
        self.planner.append_command(
            QueuedCommand::ProgramFinalize(MachineState::ProgramStop),
            self.gm.linenum,
        )?;
        self.stepper.request_exec();
        Ok(())
    }

    /// M1: optional stop (treated as a stop; the optional-stop switch is a
    /// front-end concern).
    pub fn optional_program_stop(&mut self) -> Result<(), MotionFault> {
        self.program_stop()
    }

    /// M2/M30: program end. Resets modal state per NIST 3.6.1, then queues
    /// the finalize behind the current motion.
    pub fn program_end(&mut self) -> Result<(), MotionFault> {
        self.reset_origin_offsets()?;
        self.set_coord_system(self.cfg.gcode.coord_system)?;
        self.select_plane(self.cfg.gcode.plane);
        self.set_distance_mode(self.cfg.gcode.distance_mode);
        self.set_units(self.cfg.gcode.units);
        self.spindle_control(SpindleMode::Off)?;
        self.flood_coolant_control(false)?;
        self.set_feed_rate_mode(FeedRateMode::UnitsPerMinute);
        self.gm.motion_mode = MotionMode::Cancel;
        self.planner.append_command(
            QueuedCommand::ProgramFinalize(MachineState::ProgramEnd),
            self.gm.linenum,
        )?;
        self.stepper.request_exec();
        Ok(())
    }

    // ── Runtime requests ────────────────────────────────────────────

    pub fn request_feedhold(&mut self) {
        self.feedhold_requested = true;
    }

    pub fn request_queue_flush(&mut self) {
        self.queue_flush_requested = true;
    }

    pub fn request_cycle_start(&mut self) {
        self.cycle_start_requested = true;
    }

    /// Sequence latched feedhold / queue-flush / cycle-start requests.
    ///
    /// A feedhold is honored only while motion runs and no hold is in
    /// progress. A queue flush waits for a motion stop or a completed hold
    /// (and is honored in alarm). A cycle start is ignored while running,
    /// deferred until a hold completes, and honored from a stop.
    fn feedhold_sequencing_callback(&mut self) {
        if self.feedhold_requested {
            if self.motion_state == MotionState::Run && self.hold_state == HoldState::Off {
                self.set_motion_state(MotionState::Hold);
                self.set_hold_state(HoldState::Sync);
            }
            self.feedhold_requested = false;
        }
        if self.queue_flush_requested {
            let stopped = self.motion_state == MotionState::Stop
                || self.machine_state == MachineState::Alarm
                || (self.motion_state == MotionState::Hold && self.hold_state == HoldState::Hold);
            if stopped {
                self.queue_flush_requested = false;
                self.flush_planner();
            }
        }
        if self.cycle_start_requested && !self.queue_flush_requested {
            if self.machine_state == MachineState::Alarm {
                self.cycle_start_requested = false;
            } else {
                match self.motion_state {
                    MotionState::Run => self.cycle_start_requested = false,
                    MotionState::Hold => {
                        if self.hold_state == HoldState::Hold {
                            self.cycle_start_requested = false;
                            self.end_hold();
                        }
                        // Otherwise deferred until the hold completes.
                    }
                    MotionState::Stop => {
                        self.cycle_start_requested = false;
                        self.cycle_start();
                        self.stepper.request_exec();
                    }
                }
            }
        }
    }

    /// Release a completed hold: re-plan the remaining profile from zero
    /// velocity and resume, or fall through to the queue.
    fn end_hold(&mut self) {
        self.set_hold_state(HoldState::EndHold);
        if self.runtime.held && self.runtime.hold_leftover > EPSILON {
            let mut profile = Block::new();
            profile.length = self.runtime.hold_leftover;
            profile.entry_velocity = 0.0;
            profile.cruise_velocity = self.runtime.cruise_vmax;
            profile.cruise_vmax = self.runtime.cruise_vmax;
            profile.jerk = self.runtime.jerk;
            profile.recip_jerk = self.runtime.recip_jerk;
            profile.cbrt_jerk = self.runtime.cbrt_jerk;
            profile.delta_vmax = zoid::target_velocity(
                0.0,
                profile.length,
                self.runtime.jerk,
                self.runtime.cbrt_jerk,
            );
            profile.exit_velocity = self.runtime.block_exit_velocity.min(profile.delta_vmax);
            zoid::calculate_trapezoid(&mut profile);
            self.runtime.resume_from_hold(&profile);
            self.set_hold_state(HoldState::Off);
            self.set_motion_state(MotionState::Run);
            self.cycle_start();
            self.stepper.request_exec();
            debug!(leftover = profile.length, "resuming from feedhold");
        } else {
            // Nothing left of the held block (or no block at all).
            if let Some(index) = self.runtime.active.take() {
                self.planner.finalize(index);
                self.reporter.report(ReportEvent::BlockEnd(self.runtime.linenum));
                self.runtime.abandon();
            }
            self.set_hold_state(HoldState::Off);
            self.set_motion_state(MotionState::Stop);
            self.cycle_start();
            self.stepper.request_exec();
        }
    }

    /// Atomically drain the planner and resync the model and planning
    /// positions from the runtime's actual position.
    pub fn flush_planner(&mut self) {
        self.planner.flush();
        self.runtime.abandon();
        for axis in 0..AXES {
            let position = self.runtime.position[axis];
            self.planner.set_axis_position(axis, position);
            self.gm.position[axis] = position;
            self.gm.target[axis] = position;
        }
        // Nothing is left to hold once the queue is drained.
        if self.hold_state.is_active() {
            self.set_hold_state(HoldState::Off);
            self.set_motion_state(MotionState::Stop);
        }
        self.reporter.report(ReportEvent::QueueFlush);
    }

    /// Start (or continue) a machining cycle.
    pub fn cycle_start(&mut self) {
        if self.machine_state == MachineState::Alarm {
            return;
        }
        self.set_machine_state(MachineState::Cycle);
        if self.cycle_state == CycleState::Off {
            self.cycle_state = CycleState::Started;
        }
    }

    fn cycle_end(&mut self, driver: &mut dyn StepDriver) {
        if self.cycle_state == CycleState::Started {
            self.program_finalize(MachineState::ProgramStop);
            self.stepper.end_cycle(driver, &self.cfg);
        }
    }

    fn program_finalize(&mut self, machine_state: MachineState) {
        self.set_machine_state(machine_state);
        self.cycle_state = CycleState::Off;
        self.set_motion_state(MotionState::Stop);
        self.set_hold_state(HoldState::Off);
        self.cycle_start_requested = false;
        self.runtime.zero_segment_velocity();
    }

    // ── Alarm handling ──────────────────────────────────────────────

    /// Runtime alarm: stop the steppers immediately, cancel the spindle,
    /// and latch the alarm state until explicitly cleared.
    pub fn alarm(&mut self, cause: AlarmCause, driver: &mut dyn StepDriver) {
        warn!(?cause, "machine alarm");
        self.alarm_flags |= cause;
        self.stepper.reset(driver);
        self.runtime.abandon();
        self.gm.spindle_mode = SpindleMode::Off;
        self.set_machine_state(MachineState::Alarm);
        self.cycle_state = CycleState::Off;
        self.set_motion_state(MotionState::Stop);
        self.set_hold_state(HoldState::Off);
        self.reporter.report(ReportEvent::Alarm(cause));
    }

    /// Explicit un-alarm command.
    pub fn clear_alarm(&mut self) {
        if self.machine_state == MachineState::Alarm {
            self.alarm_flags = AlarmCause::empty();
            self.set_machine_state(MachineState::Ready);
        }
    }

    // ── Pipeline service entry points ───────────────────────────────

    /// Main-loop service: sequence runtime requests, release finalized
    /// blocks, and run the exec context for any pending requests.
    pub fn service(&mut self, driver: &mut dyn StepDriver) {
        self.feedhold_sequencing_callback();
        self.planner.reap_finalized();

        let mut rounds = 0;
        while self.stepper.take_exec_request() {
            self.exec_move(driver);
            rounds += 1;
            if rounds > 4 {
                break;
            }
        }

        // A hold armed with nothing left to decelerate settles directly.
        if self.hold_state == HoldState::Sync
            && self.runtime.active.is_none()
            && self.planner.first_runnable().is_none()
        {
            self.set_hold_state(HoldState::Hold);
        }

        if self.cycle_state == CycleState::Started && self.is_idle() && !self.hold_state.is_active()
        {
            self.cycle_end(driver);
        }
    }

    /// DDA timer tick (FREQUENCY_DDA).
    pub fn dda_tick(&mut self, driver: &mut dyn StepDriver) {
        self.stepper.dda_tick(driver, &self.cfg);
    }

    /// Dwell timer tick (FREQUENCY_DWELL).
    pub fn dwell_tick(&mut self, driver: &mut dyn StepDriver) {
        self.stepper.dwell_tick(driver, &self.cfg);
    }

    /// Periodic motor power callback; `dt` in seconds since the last call.
    pub fn motor_power_tick(&mut self, dt: f64, driver: &mut dyn StepDriver) {
        self.stepper.motor_power_callback(dt, driver, &self.cfg);
    }

    // ── Exec context ────────────────────────────────────────────────

    /// Exec-context body: promote the next block when none is running,
    /// produce exactly one segment of the active block, and hand it to the
    /// prep mailbox.
    fn exec_move(&mut self, driver: &mut dyn StepDriver) {
        if !self.stepper.prep_available() {
            return;
        }
        // A held block resumes only through cycle start.
        if self.runtime.held {
            return;
        }
        let mut rounds = 0;
        loop {
            rounds += 1;
            if rounds > 64 {
                self.alarm(AlarmCause::PLANNER_FAULT, driver);
                return;
            }

            if self.runtime.active.is_none() {
                let Some(index) = self.planner.first_runnable() else {
                    // Queue is empty: nothing staged, the engine idles.
                    return;
                };
                match self.planner.block(index).move_type {
                    MoveType::Command => {
                        let command = self.planner.block(index).command;
                        self.planner.block(index).set_state(BlockState::Run);
                        if let Some(command) = command {
                            self.exec_command(command, driver);
                        }
                        self.planner.finalize(index);
                        self.stepper.prep_null();
                        self.stepper.commit_prep();
                        self.stepper.load_segment(driver, &self.cfg);
                        return;
                    }
                    MoveType::Dwell => {
                        let seconds = self.planner.block(index).seconds;
                        self.planner.block(index).set_state(BlockState::Run);
                        self.planner.finalize(index);
                        if self.stepper.prep_dwell(seconds * 1e6).is_ok() {
                            self.stepper.commit_prep();
                            self.stepper.load_segment(driver, &self.cfg);
                        }
                        return;
                    }
                    MoveType::Line => {
                        let linenum = {
                            let block = self.planner.block_mut(index);
                            block.replannable = false;
                            block.cruise_velocity = block.cruise_vmax;
                            zoid::calculate_trapezoid(block);
                            block.set_state(BlockState::Run);
                            block.linenum
                        };
                        self.runtime.load_block(index, self.planner.block(index));
                        self.set_motion_state(MotionState::Run);
                        self.reporter.report(ReportEvent::BlockStart(linenum));
                    }
                    MoveType::Null => {
                        self.planner.finalize(index);
                        continue;
                    }
                }
            }

            // Arm a requested hold before slicing the next segment.
            if self.hold_state == HoldState::Sync {
                self.runtime.plan_hold_decel();
                self.set_hold_state(HoldState::Decel);
            }

            match self.runtime.next_step() {
                ExecStep::Segment(segment) => {
                    let mut steps = [0.0; MOTORS];
                    for axis in 0..AXES {
                        if segment.delta[axis] == 0.0
                            || self.cfg.axis(axis).axis_mode == AxisMode::Inhibited
                        {
                            continue;
                        }
                        for &motor in self.cfg.motor_map.by_axis[axis].iter() {
                            let m = motor as usize;
                            let mut s = segment.delta[axis] * self.cfg.motor(m).steps_per_unit();
                            if self.cfg.motor(m).polarity_reversed {
                                s = -s;
                            }
                            steps[m] = s;
                        }
                    }
                    let microseconds = segment.time * MICROSECONDS_PER_MINUTE;
                    match self.stepper.prep_line(&steps, microseconds) {
                        Ok(()) => {
                            self.stepper.commit_prep();
                            self.stepper.load_segment(driver, &self.cfg);
                        }
                        Err(fault) => {
                            warn!(%fault, "segment prep failed");
                            self.alarm(AlarmCause::STEPPER_FAULT, driver);
                        }
                    }
                    return;
                }
                ExecStep::Hold => {
                    self.set_hold_state(HoldState::Hold);
                    self.set_motion_state(MotionState::Hold);
                    self.stepper.prep_null();
                    self.stepper.commit_prep();
                    self.stepper.load_segment(driver, &self.cfg);
                    return;
                }
                ExecStep::Complete => {
                    let index = self.runtime.active.take().expect("active block");
                    self.planner.finalize(index);
                    self.reporter
                        .report(ReportEvent::BlockEnd(self.runtime.linenum));
                    // Promote the next block in the same pass.
                    continue;
                }
            }
        }
    }

    /// Dispatch a command block in the exec context. Model fields read here
    /// were written before the block was committed.
    fn exec_command(&mut self, command: QueuedCommand, driver: &mut dyn StepDriver) {
        match command {
            QueuedCommand::SyncWorkOffsets(coord) => {
                let mut offsets = [0.0; AXES];
                for (axis, slot) in offsets.iter_mut().enumerate() {
                    *slot = self.cfg.coord_offset(coord, axis)
                        + if self.gm.origin_offset_enable {
                            self.gm.origin_offset[axis]
                        } else {
                            0.0
                        };
                }
                self.runtime.work_offset = offsets;
            }
            QueuedCommand::ChangeTool(tool) | QueuedCommand::SelectTool(tool) => {
                self.gm.tool = tool;
            }
            QueuedCommand::MistCoolant(on) => self.gm.mist_coolant = on,
            QueuedCommand::FloodCoolant(on) => {
                self.gm.flood_coolant = on;
                if !on {
                    self.gm.mist_coolant = false;
                }
            }
            QueuedCommand::SpindleMode(mode) => self.gm.spindle_mode = mode,
            QueuedCommand::SpindleSpeed(speed) => {
                self.gm.spindle_speed = speed;
                self.reporter.report(ReportEvent::SpindleSpeed(speed));
            }
            QueuedCommand::ProgramFinalize(state) => {
                self.program_finalize(state);
                self.stepper.end_cycle(driver, &self.cfg);
            }
        }
    }

    // ── State transition helpers ────────────────────────────────────

    fn set_machine_state(&mut self, state: MachineState) {
        if self.machine_state != state {
            debug!(from = ?self.machine_state, to = ?state, "machine state");
            self.machine_state = state;
            self.reporter.report(ReportEvent::MachineState(state));
        }
    }

    fn set_motion_state(&mut self, state: MotionState) {
        if self.motion_state != state {
            self.motion_state = state;
            self.reporter.report(ReportEvent::MotionState(state));
        }
    }

    fn set_hold_state(&mut self, state: HoldState) {
        if self.hold_state != state {
            self.hold_state = state;
            self.reporter.report(ReportEvent::HoldState(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mill_common::config::{AxisConfig, MachineConfig};
    use mill_common::consts::AXIS_Y;

    fn machine() -> Machine {
        Machine::new(ResolvedConfig::default())
    }

    fn machine_with_radius_a(radius: f64) -> Machine {
        let mut ax = AxisConfig::default_for(AXIS_A as u8);
        ax.axis_mode = AxisMode::Radius;
        ax.radius = radius;
        let cfg = MachineConfig {
            axes: vec![ax],
            ..Default::default()
        };
        cfg.validate().unwrap();
        Machine::new(cfg.resolve())
    }

    fn flags(axes: &[usize]) -> AxisFlags {
        let mut f = [false; AXES];
        for &a in axes {
            f[a] = true;
        }
        f
    }

    #[test]
    fn inch_units_convert_to_canonical_mm() {
        let mut m = machine();
        m.set_units(Units::Inches);
        let mut target = [0.0; AXES];
        target[AXIS_X] = 1.0;
        m.set_target(&target, &flags(&[AXIS_X]));
        assert!((m.canonical_target(AXIS_X) - MM_PER_INCH).abs() < 1e-9);

        // Querying work position back in mm mode yields 25.4.
        m.gm.position = m.gm.target;
        m.set_units(Units::Millimetres);
        assert!((m.work_position(AXIS_X) - 25.4).abs() < 1e-6);
    }

    #[test]
    fn incremental_mode_accumulates() {
        let mut m = machine();
        m.set_distance_mode(DistanceMode::Incremental);
        let mut target = [0.0; AXES];
        target[AXIS_X] = 5.0;
        m.set_target(&target, &flags(&[AXIS_X]));
        m.set_target(&target, &flags(&[AXIS_X]));
        assert!((m.canonical_target(AXIS_X) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn coord_offset_applies_in_absolute_mode() {
        let mut m = machine();
        m.cfg.coord_offsets[CoordSystem::G54.index()][AXIS_X] = 10.0;
        let mut target = [0.0; AXES];
        target[AXIS_X] = 5.0;
        m.set_target(&target, &flags(&[AXIS_X]));
        assert!((m.canonical_target(AXIS_X) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn absolute_override_suppresses_offsets() {
        let mut m = machine();
        m.cfg.coord_offsets[CoordSystem::G54.index()][AXIS_X] = 10.0;
        m.set_absolute_override(true);
        let mut target = [0.0; AXES];
        target[AXIS_X] = 5.0;
        m.set_target(&target, &flags(&[AXIS_X]));
        assert!((m.canonical_target(AXIS_X) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn radius_mode_converts_arc_length_to_degrees() {
        let mut m = machine_with_radius_a(10.0);
        let mut target = [0.0; AXES];
        target[AXIS_A] = 31.4159265;
        m.set_target(&target, &flags(&[AXIS_A]));
        // 31.4159 mm of arc on a 10 mm circle is half a turn.
        assert!((m.canonical_target(AXIS_A) - 180.0).abs() < 1e-4);
    }

    #[test]
    fn rotary_standard_takes_degrees_without_unit_conversion() {
        let mut m = machine();
        m.set_units(Units::Inches);
        let mut target = [0.0; AXES];
        target[AXIS_A] = 90.0;
        m.set_target(&target, &flags(&[AXIS_A]));
        assert!((m.canonical_target(AXIS_A) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_axis_is_ignored() {
        let mut ax = AxisConfig::default_for(AXIS_Y as u8);
        ax.axis_mode = AxisMode::Disabled;
        let cfg = MachineConfig {
            axes: vec![ax],
            ..Default::default()
        };
        let mut m = Machine::new(cfg.resolve());
        let mut target = [0.0; AXES];
        target[AXIS_Y] = 50.0;
        m.set_target(&target, &flags(&[AXIS_Y]));
        assert_eq!(m.canonical_target(AXIS_Y), 0.0);
    }

    #[test]
    fn zero_feed_rate_is_rejected() {
        let mut m = machine();
        let mut target = [0.0; AXES];
        target[AXIS_X] = 10.0;
        let err = m.straight_feed(&target, &flags(&[AXIS_X])).unwrap_err();
        assert_eq!(err, MotionFault::ZeroFeedRate);
        assert_eq!(m.canonical_position()[AXIS_X], 0.0);
    }

    #[test]
    fn zero_length_move_is_ok_without_enqueue() {
        let mut m = machine();
        m.set_feed_rate(600.0);
        let target = [0.0; AXES];
        m.straight_feed(&target, &ALL_AXES).unwrap();
        assert!(m.is_idle());
        assert_eq!(m.planner_buffers_available(), 28);
    }

    #[test]
    fn move_time_for_feed_follows_xyz_path() {
        let mut m = machine();
        m.set_feed_rate(600.0);
        m.gm.motion_mode = MotionMode::StraightFeed;
        m.gm.target[AXIS_X] = 10.0;
        let (optimal, _) = m.move_times();
        // 10 mm at 600 mm/min is 1/60 min.
        assert!((optimal - 10.0 / 600.0).abs() < 1e-9);
    }

    #[test]
    fn move_time_inverse_mode_uses_reciprocal() {
        let mut m = machine();
        m.set_feed_rate_mode(FeedRateMode::InverseTime);
        m.set_feed_rate(60.0); // stored as the inverse rate
        m.gm.motion_mode = MotionMode::StraightFeed;
        m.gm.target[AXIS_X] = 10.0;
        let (optimal, _) = m.move_times();
        // F60 in G93: the move takes 1/60 min = 1 s.
        assert!((optimal - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn move_time_pure_rotary_uses_degree_norm() {
        let mut m = machine();
        m.set_feed_rate(600.0);
        m.gm.motion_mode = MotionMode::StraightFeed;
        m.gm.target[AXIS_A] = 90.0;
        let (optimal, _) = m.move_times();
        assert!((optimal - 90.0 / 600.0).abs() < 1e-9);
    }

    #[test]
    fn traverse_is_limited_by_slowest_axis() {
        let mut m = machine();
        m.gm.motion_mode = MotionMode::StraightTraverse;
        m.gm.target[AXIS_X] = 100.0;
        let (optimal, _) = m.move_times();
        let vmax = m.cfg.axis(AXIS_X).velocity_max;
        assert!((optimal - 100.0 / vmax).abs() < 1e-9);
    }

    #[test]
    fn feed_override_scales_enqueued_moves() {
        let mut m = machine();
        m.set_feed_rate(600.0);
        m.set_feed_override(true, 0.5);
        m.gm.motion_mode = MotionMode::StraightFeed;
        m.gm.target[AXIS_X] = 10.0;
        let (optimal, _) = m.move_times();
        assert!((optimal - 10.0 / 300.0).abs() < 1e-9);
    }

    #[test]
    fn g92_offsets_shift_work_position() {
        let mut m = machine();
        m.gm.position[AXIS_X] = 30.0;
        m.gm.target[AXIS_X] = 30.0;
        let mut offset = [0.0; AXES];
        offset[AXIS_X] = 10.0;
        m.set_origin_offsets(&offset, &flags(&[AXIS_X])).unwrap();
        // Position 30 should now read as work 10.
        assert!((m.work_position(AXIS_X) - 10.0).abs() < 1e-9);

        m.reset_origin_offsets().unwrap();
        assert!((m.work_position(AXIS_X) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn suspend_and_resume_origin_offsets() {
        let mut m = machine();
        m.gm.position[AXIS_X] = 30.0;
        let mut offset = [0.0; AXES];
        offset[AXIS_X] = 10.0;
        m.set_origin_offsets(&offset, &flags(&[AXIS_X])).unwrap();
        m.suspend_origin_offsets().unwrap();
        assert!((m.work_position(AXIS_X) - 30.0).abs() < 1e-9);
        m.resume_origin_offsets().unwrap();
        assert!((m.work_position(AXIS_X) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn g10_rejects_bad_coord_system() {
        let mut m = machine();
        let offset = [0.0; AXES];
        let err = m.set_coord_offsets(9, &offset, &ALL_AXES).unwrap_err();
        assert_eq!(err, MotionFault::CoordSystemOutOfRange);
    }

    #[test]
    fn program_end_resets_modal_state() {
        let mut m = machine();
        m.set_units(Units::Inches);
        m.set_distance_mode(DistanceMode::Incremental);
        m.set_feed_rate_mode(FeedRateMode::InverseTime);
        m.gm.origin_offset_enable = true;

        m.program_end().unwrap();
        assert_eq!(m.gm.units, Units::Millimetres);
        assert_eq!(m.gm.distance_mode, DistanceMode::Absolute);
        assert_eq!(m.gm.feed_rate_mode, FeedRateMode::UnitsPerMinute);
        assert_eq!(m.gm.motion_mode, MotionMode::Cancel);
        assert!(!m.gm.origin_offset_enable);
    }

    #[test]
    fn set_absolute_origin_homes_axes() {
        let mut m = machine();
        let mut origin = [0.0; AXES];
        origin[AXIS_X] = 0.0;
        m.set_absolute_origin(&origin, &flags(&[AXIS_X]));
        assert_eq!(m.homing_state(AXIS_X), HomingState::Homed);
        assert_eq!(m.homing_state(AXIS_Y), HomingState::NotHomed);
    }

    #[test]
    fn feedhold_request_ignored_when_stopped() {
        let mut m = machine();
        m.request_feedhold();
        m.feedhold_sequencing_callback();
        assert_eq!(m.hold_state(), HoldState::Off);
        assert!(!m.feedhold_requested);
    }

    #[test]
    fn queue_flush_honored_when_stopped() {
        let mut m = machine();
        m.set_feed_rate(600.0);
        let mut target = [0.0; AXES];
        target[AXIS_X] = 10.0;
        m.straight_feed(&target, &flags(&[AXIS_X])).unwrap();
        assert!(!m.planner.is_empty());

        m.request_queue_flush();
        m.feedhold_sequencing_callback();
        assert!(m.planner.is_empty());
        // Model position resynced to the runtime position (still at zero —
        // nothing executed).
        assert_eq!(m.canonical_position()[AXIS_X], 0.0);
    }

    #[test]
    fn alarm_rejects_motion_and_requires_clear() {
        struct NoopDriver;
        impl StepDriver for NoopDriver {
            fn step_pulse(&mut self, _motor: usize) {}
            fn set_direction(&mut self, _motor: usize, _reversed: bool) {}
            fn set_enable(&mut self, _motor: usize, _enabled: bool) {}
        }
        let mut m = machine();
        let mut drv = NoopDriver;
        m.alarm(AlarmCause::HARD_LIMIT, &mut drv);
        assert_eq!(m.machine_state(), MachineState::Alarm);
        assert!(m.alarm_flags().has_critical());

        m.set_feed_rate(600.0);
        let mut target = [0.0; AXES];
        target[AXIS_X] = 10.0;
        assert_eq!(
            m.straight_feed(&target, &flags(&[AXIS_X])),
            Err(MotionFault::InAlarm)
        );

        m.clear_alarm();
        assert_eq!(m.machine_state(), MachineState::Ready);
        assert!(m.straight_feed(&target, &flags(&[AXIS_X])).is_ok());
    }

    #[test]
    fn short_line_residual_accumulates() {
        let mut m = machine();
        m.set_feed_rate(600.0);
        m.set_distance_mode(DistanceMode::Incremental);
        let mut step = [0.0; AXES];
        step[AXIS_X] = 0.05; // below MIN_LINE_LENGTH

        // First sub-threshold increment fails but preserves the target.
        assert_eq!(
            m.straight_feed(&step, &flags(&[AXIS_X])),
            Err(MotionFault::MinimumLengthMove)
        );
        assert_eq!(m.canonical_position()[AXIS_X], 0.0);

        // The second accumulates past the threshold and enqueues.
        m.straight_feed(&step, &flags(&[AXIS_X])).unwrap();
        assert!((m.canonical_position()[AXIS_X] - 0.1).abs() < 1e-9);
    }
}
