//! # StageKit Planner
//!
//! Scan planning and execution:
//! - [`geometry`]: image counts, step sizes and the visiting order of a mosaic
//! - [`pipeline`]: composable capture stages driven depth-first
//! - [`planner`]: the scan lifecycle, metadata output and the scan thread
//!
//! The camera is an external collaborator behind the [`Imager`] trait.

pub mod control;
pub mod geometry;
pub mod imager;
pub mod metadata;
pub mod pipeline;
pub mod planner;

pub use control::ScanControl;
pub use geometry::{
    images_actual, images_ideal, step_size, AxisDescriptor, FieldOfView, GridPoint, ScanGeometry,
};
pub use imager::{shared_imager, Frame, Imager, SharedImager, SimulatedImager};
pub use metadata::{FileRecord, ScanMetadata, ScanResult, StageSummary};
pub use pipeline::{ScanStage, SharedMover, StageMover, StepState};
pub use planner::{ScanHandle, ScanOutcome, ScanPipeline, SCAN_THREAD_NAME};
