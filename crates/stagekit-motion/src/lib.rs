//! # StageKit Motion
//!
//! Motion abstraction for the microscope stage:
//! - [`MotionDriver`]: device-level contract implemented by concrete controllers
//! - [`CoordinateModifier`] chain: soft limits, backlash and axis scaling
//! - [`MotionHal`]: user-unit moves, jogs and capability queries
//! - [`MotionCommandThread`]: the single worker that owns the HAL
//! - [`SimulatedStage`]: in-process device for dry runs and tests

pub mod command;
pub mod command_thread;
pub mod driver;
pub mod hal;
pub mod modifier;
pub mod simulated;

pub use command::{CommandOutput, CommandResult, Completion, Envelope, MotionCommand};
pub use command_thread::{
    fractions_to_jog, HalFactory, MotionCommandThread, MotionHandle, MotionResult, JOG_UNDERDRIVE,
    WORKER_THREAD_NAME,
};
pub use driver::MotionDriver;
pub use hal::MotionHal;
pub use modifier::{
    BacklashModifier, CoordinateModifier, ModifierContext, ModifierKind, MovePlan, ScalarModifier,
    SoftLimitModifier,
};
pub use simulated::SimulatedStage;
