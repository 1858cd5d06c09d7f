//! # StageKit Core
//!
//! Core types, errors, and events for StageKit.
//! Provides the axis/position data model, the error taxonomy shared by the
//! motion and planning layers, and the broadcast event dispatcher.

pub mod core;
pub mod data;
pub mod error;
pub mod types;

pub use core::{EventDispatcher, MotionEvent, ScanEvent, ScanState};

pub use data::{Axis, AxisMap, AxisRange, AxisSet, Position};

pub use error::{ConfigurationError, Error, ImagerError, MotionError, Result, ScanError};

pub use types::{thread_safe, thread_safe_rw, ConfirmCallback, ThreadSafe, ThreadSafeRw};
