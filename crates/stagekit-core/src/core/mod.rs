//! Core event plumbing shared by the motion worker and the scan planner

pub mod event;

pub use event::{EventDispatcher, MotionEvent, ScanEvent, ScanState};
