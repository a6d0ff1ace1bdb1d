//! Machine-wide constants: axis geometry, planner pool sizing, segment
//! timing, and DDA scaling.
//!
//! Velocities are mm/min, lengths are mm, and times are minutes throughout
//! the motion core (feed rates arrive in units/min, so minutes keep the
//! arithmetic conversion-free). The stepper layer converts to microseconds
//! and integer DDA ticks at prep time.

use static_assertions::const_assert;

// ─── Axes and Motors ────────────────────────────────────────────────

/// Number of logical axes: X, Y, Z, A, B, C.
pub const AXES: usize = 6;

/// Maximum number of stepper motors. Motor→axis mapping is configurable.
pub const MOTORS: usize = 6;

/// Axis indices into `[f64; AXES]` vectors.
pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;
pub const AXIS_Z: usize = 2;
pub const AXIS_A: usize = 3;
pub const AXIS_B: usize = 4;
pub const AXIS_C: usize = 5;

/// Number of work coordinate systems (G54..G59).
pub const COORDS: usize = 6;

// ─── Unit Conversion ────────────────────────────────────────────────

pub const MM_PER_INCH: f64 = 25.4;
pub const MICROSECONDS_PER_MINUTE: f64 = 60_000_000.0;

// ─── Planner Pool ───────────────────────────────────────────────────

/// Number of blocks in the planner ring. Must cover optimal planning of
/// bursts of very short lines (arc segments arrive as short lines).
pub const PLANNER_BUFFER_POOL_SIZE: usize = 28;

/// Blocks held back before accepting a new input line, so the back-planner
/// always has room to work.
pub const PLANNER_BUFFER_HEADROOM: usize = 4;

/// Smallest line the planner will accept [mm]. Shorter targets are rejected
/// so the canonical machine can accumulate them into a longer line.
pub const MIN_LINE_LENGTH: f64 = 0.08;

/// Precision to which two jerk values are considered the same, allowing the
/// cached reciprocal and cube root to be reused between blocks.
pub const JERK_MATCH_PRECISION: f64 = 1000.0;

// ─── Segment Timing ─────────────────────────────────────────────────

/// Nominal execution segment time [µs]. Each planned line is sliced into
/// segments of roughly this duration.
pub const NOM_SEGMENT_USEC: f64 = 5000.0;

/// Minimum execution segment time [µs].
pub const MIN_SEGMENT_USEC: f64 = 2500.0;

/// Nominal segment time [min].
pub const NOM_SEGMENT_TIME: f64 = NOM_SEGMENT_USEC / MICROSECONDS_PER_MINUTE;

/// Minimum segment time [min].
pub const MIN_SEGMENT_TIME: f64 = MIN_SEGMENT_USEC / MICROSECONDS_PER_MINUTE;

/// Minimum segment time plus a safety margin [min]. The trapezoid solver
/// sizes its degenerate cases against this value.
pub const MIN_SEGMENT_TIME_PLUS_MARGIN: f64 = MIN_SEGMENT_TIME * 1.01;

// ─── Trapezoid Solver ───────────────────────────────────────────────

/// Iteration cap for the asymmetric rate-limited (HT') convergence loop.
pub const TRAPEZOID_ITERATION_MAX: u8 = 8;

/// Convergence tolerance for the HT' loop, as a fraction of cruise velocity.
pub const TRAPEZOID_ITERATION_ERROR_PERCENT: f64 = 0.10;

/// Iteration cap for the Newton-Raphson refinement in `target_velocity`.
pub const TARGET_VELOCITY_ITERATION_MAX: u8 = 20;

/// Residual tolerance for the Newton-Raphson refinement, as a fraction of
/// the jerk term being zeroed.
pub const TARGET_VELOCITY_TOLERANCE: f64 = 1e-4;

// ─── Stepper / DDA ──────────────────────────────────────────────────

/// DDA timer tick rate [Hz]. Each tick advances every motor accumulator.
pub const FREQUENCY_DDA: u32 = 100_000;

/// Dwell timer tick rate [Hz].
pub const FREQUENCY_DWELL: u32 = 1_000;

/// Software-interrupt latency class [Hz]: an exec request fires within
/// one period of this rate (≤ 5 µs).
pub const FREQUENCY_SGI: u32 = 200_000;

/// Substep scaling for DDA fractional-step accumulation. One step is
/// emitted per `dda_ticks * DDA_SUBSTEPS` of accumulated substeps.
pub const DDA_SUBSTEPS: u32 = 100_000;

/// Accumulator anti-stall reset: if the tick count of the incoming segment
/// shrinks by more than this factor, the carried DDA phase is discarded.
pub const ACCUMULATOR_RESET_FACTOR: u32 = 2;

// ─── Motor Power Management ─────────────────────────────────────────

/// Lower bound on the motor idle timeout [s]. Never zero: motors must stay
/// energized through the inertial stop.
pub const IDLE_TIMEOUT_SECONDS_MIN: f64 = 0.1;

/// Upper bound on the motor idle timeout [s].
pub const IDLE_TIMEOUT_SECONDS_MAX: f64 = 4_294_967.0;

/// Default idle timeout [s] for `idle-when-stopped` power mode.
pub const IDLE_TIMEOUT_SECONDS: f64 = 0.1;

// A nominal 5 ms segment is 500 DDA ticks; scaled by the substep factor the
// overflow threshold must stay inside u32 accumulator arithmetic.
const_assert!(500u64 * DDA_SUBSTEPS as u64 <= u32::MAX as u64);
const_assert!(PLANNER_BUFFER_POOL_SIZE > PLANNER_BUFFER_HEADROOM);
const_assert!(AXES == 6 && MOTORS <= AXES);
