//! Motion device driver contract
//!
//! A driver speaks device coordinates only. It knows nothing about backlash,
//! soft limits or user scaling; the [`MotionHal`](crate::MotionHal) layers
//! those on top through its modifier chain.
//!
//! Drivers report unrecoverable transport failures as
//! [`MotionError::MotionCritical`](stagekit_core::MotionError::MotionCritical);
//! the command thread closes the device when it sees one.

use stagekit_core::{AxisMap, AxisRange, AxisSet, Position, Result};

/// Device-level motion operations
pub trait MotionDriver: Send {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Axes the device moves
    fn axes(&self) -> AxisSet;

    /// Move to an absolute device position and block until motion stops
    fn move_absolute(&mut self, target: &Position) -> Result<()>;

    /// Query the current device position
    fn position(&mut self) -> Result<Position>;

    /// Start a non-blocking relative move at `rate` (device units per second)
    fn jog_relative(&mut self, delta: &Position, rate: f64) -> Result<()>;

    /// Abort any jog in progress
    fn jog_cancel(&mut self) -> Result<()>;

    /// Whether a jog is still executing
    fn jog_active(&mut self) -> Result<bool>;

    /// Maximum velocity per axis (device units per second)
    fn max_velocities(&self) -> AxisMap<f64>;

    /// Maximum acceleration per axis (device units per second squared)
    fn max_accelerations(&self) -> AxisMap<f64>;

    /// Travel range per axis in device units
    fn machine_limits(&self) -> AxisMap<AxisRange>;

    /// Motor steps per device unit
    fn steps_per_mm(&self) -> AxisMap<f64>;

    /// Run the homing cycle
    fn home(&mut self) -> Result<()>;

    /// Decelerate to a controlled stop
    fn stop(&mut self) -> Result<()>;

    /// Halt immediately
    fn estop(&mut self) -> Result<()>;

    /// Energize motors
    fn on(&mut self) -> Result<()>;

    /// De-energize motors
    fn off(&mut self) -> Result<()>;

    /// Release the device
    fn close(&mut self) -> Result<()>;
}
