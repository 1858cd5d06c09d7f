//! # StageKit
//!
//! Motion and scan planning core for motorized microscope stages:
//! - Backlash, soft-limit and scaling aware motion through one worker thread
//! - Two-corner serpentine and three-corner skewed mosaics
//! - Composable capture pipelines (focus stacks, HDR brackets)
//!
//! ## Architecture
//!
//! StageKit is organized as a workspace with multiple crates:
//!
//! 1. **stagekit-core** - Axis/position model, errors, events
//! 2. **stagekit-settings** - Configuration document (TOML/JSON)
//! 3. **stagekit-motion** - HAL, coordinate modifiers, command thread
//! 4. **stagekit-communication** - Serial transport and the GRBL driver
//! 5. **stagekit-planner** - Scan geometry, capture pipeline, scan lifecycle
//! 6. **stagekit** - This crate: wiring and the command line front end

pub use stagekit_communication::{list_ports, GrblDriver, SerialPortInfo};
pub use stagekit_core::{
    Axis, AxisMap, AxisRange, AxisSet, ConfigurationError, ConfirmCallback, Error,
    EventDispatcher, ImagerError, MotionError, MotionEvent, Position, Result, ScanError,
    ScanEvent, ScanState,
};
pub use stagekit_motion::{HalFactory, MotionCommandThread, MotionHal, MotionHandle, SimulatedStage};
pub use stagekit_planner::{
    shared_imager, FieldOfView, Imager, ScanGeometry, ScanHandle, ScanMetadata, ScanOutcome,
    ScanPipeline, SharedMover, SimulatedImager,
};
pub use stagekit_settings::{Config, DriverKind, ScanBounds, ScanSettings};

use std::sync::Arc;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output with pretty formatting
/// - RUST_LOG environment variable support
/// - Thread names, so motion worker and scan thread lines can be told apart
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// Factory that opens the configured motion device and wraps it in a HAL
///
/// The motion worker calls it once at start and again on every reboot
/// attempt after a critical fault.
pub fn hal_factory(config: &Config) -> HalFactory {
    let connection = config.connection.clone();
    let motion = config.motion.clone();
    match connection.driver {
        DriverKind::Simulated => {
            let stage = SimulatedStage::new(motion.axes.iter().copied().collect());
            Box::new(move || MotionHal::new(Box::new(stage.clone()), &motion))
        }
        DriverKind::Grbl => Box::new(move || {
            let driver = GrblDriver::open(&connection)?;
            tracing::info!("Connected to GRBL on {}", connection.port);
            MotionHal::new(Box::new(driver), &motion)
        }),
    }
}

/// Build the scan pipeline for `config` on top of a running motion worker
pub fn build_scan(
    config: &Config,
    motion: &MotionCommandThread,
    imager: impl Imager + 'static,
) -> Result<ScanPipeline> {
    let mover: SharedMover = Arc::new(motion.handle());
    ScanPipeline::from_settings(&config.scan, &config.imager, mover, shared_imager(imager))
}

/// Plan the scan of `config` without touching any device
pub fn plan_scan(config: &Config) -> Result<ScanGeometry> {
    let fov = FieldOfView::from_settings(&config.imager)?;
    ScanGeometry::from_settings(&config.scan, &fov)
}
