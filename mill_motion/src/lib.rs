//! # Millcore Motion Library
//!
//! The motion core of the millcore CNC controller: a staged pipeline that
//! converts canonical machining commands into a phase-continuous stepper
//! pulse train under jerk-limited, look-ahead planning.
//!
//! ## Pipeline Stages
//!
//! 1. **Canonical machine** — modal gcode state, coordinate transforms,
//!    move-time selection; appends blocks into the planner (main context).
//! 2. **Planner** — fixed ring of blocks joined by back-planning; junction
//!    velocity limits at corners.
//! 3. **Executor** — promotes blocks, solves the head/body/tail trapezoid,
//!    slices ~5 ms segments (exec context).
//! 4. **Stepper** — prep mailbox handoff and the DDA pulse engine driving a
//!    [`mill_common::hal::StepDriver`] (loader/DDA context).
//!
//! ## Zero-Allocation Runtime
//!
//! All runtime state is pre-allocated at construction: the block ring, the
//! runtime scratch block, and the prep mailbox. Context boundaries publish
//! through single atomic words with release/acquire ordering.

pub mod config;
pub mod exec;
pub mod machine;
pub mod math;
pub mod model;
pub mod planner;
pub mod stepper;

pub use machine::{Machine, AxisFlags, ALL_AXES};
