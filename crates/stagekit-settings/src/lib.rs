//! StageKit Settings Crate
//!
//! Handles the configuration document shared by the motion core, the scan
//! planner and the command line front end.

pub mod config;

pub use config::{
    CompensationDirection, Config, ConnectionSettings, DriverKind, ExclusionZone, HdrSettings,
    ImagerSettings, KinematicsSettings, ModifierFlags, MotionSettings, OutputSettings,
    PropertyMap, RebootSettings, ScanBounds, ScanSettings, StackSettings,
};
