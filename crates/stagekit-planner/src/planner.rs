//! # Scan Planner
//!
//! [`ScanPipeline`] owns the stage list of one scan and runs it through the
//! lifecycle `Idle → Running → {Paused ⇄ Running} → Completed | Stopped | Failed`.
//!
//! Per-step failures never escape as panics or bare errors: [`ScanPipeline::run`]
//! always returns a [`ScanOutcome`] and, once the stages have started, always
//! writes the metadata record.

use crate::control::ScanControl;
use crate::geometry::{FieldOfView, ScanGeometry};
use crate::imager::SharedImager;
use crate::metadata::{ScanMetadata, ScanResult};
use crate::pipeline::{
    images_expected, keys, run_pipeline, CaptureStage, DriftTracker, FocusStacker, HdrStage,
    KinematicsStage, PointGenerator, SaveStage, ScanStage, SettleClock, SharedMover,
    StackDriftStage, StepState,
};
use serde::Serialize;
use stagekit_core::{
    thread_safe_rw, ConfirmCallback, Error, EventDispatcher, MotionError, Result, ScanError,
    ScanEvent, ScanState, ThreadSafeRw,
};
use stagekit_settings::{ImagerSettings, OutputSettings, ScanSettings};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;

/// Name of the thread started by [`ScanPipeline::spawn`]
pub const SCAN_THREAD_NAME: &str = "stagekit-scan";

/// Structured result of one scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanOutcome {
    /// ok, stopped or exception
    pub result: ScanResult,
    /// Terminal lifecycle state
    pub state: ScanState,
    /// Images the pipeline expected
    pub images_expected: usize,
    /// Images captured and saved
    pub images_captured: usize,
    /// Failure message
    pub message: Option<String>,
    /// Where the metadata record was written
    pub metadata_path: Option<PathBuf>,
}

impl ScanOutcome {
    /// Whether every step finished
    pub fn is_ok(&self) -> bool {
        self.result == ScanResult::Ok
    }
}

/// Lifecycle state shared with [`ScanHandle`]
#[derive(Clone)]
struct Lifecycle {
    state: ThreadSafeRw<ScanState>,
    events: EventDispatcher<ScanEvent>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: thread_safe_rw(ScanState::Idle),
            events: EventDispatcher::default(),
        }
    }

    fn get(&self) -> ScanState {
        *self.state.read()
    }

    fn set(&self, next: ScanState) {
        *self.state.write() = next;
        tracing::info!("Scan {}", next);
        self.events.publish(ScanEvent::StateChanged(next));
    }

    /// Move to `next` only from `from`
    fn transition(&self, from: ScanState, next: ScanState) -> bool {
        {
            let mut state = self.state.write();
            if *state != from {
                return false;
            }
            *state = next;
        }
        tracing::info!("Scan {}", next);
        self.events.publish(ScanEvent::StateChanged(next));
        true
    }
}

/// Runs an ordered stage list as one scan
pub struct ScanPipeline {
    stages: Vec<Box<dyn ScanStage>>,
    mover: SharedMover,
    control: ScanControl,
    lifecycle: Lifecycle,
    output: OutputSettings,
    home_before_scan: bool,
    confirm_home: Option<ConfirmCallback>,
    tolerate_count_mismatch: bool,
}

impl ScanPipeline {
    /// Pipeline over explicit stages; `stages[0]` is the outermost
    pub fn new(stages: Vec<Box<dyn ScanStage>>, mover: SharedMover, output: OutputSettings) -> Self {
        Self {
            stages,
            mover,
            control: ScanControl::new(),
            lifecycle: Lifecycle::new(),
            output,
            home_before_scan: false,
            confirm_home: None,
            tolerate_count_mismatch: false,
        }
    }

    /// Standard pipeline for a scan configuration
    ///
    /// Stage order: points, focus stack, HDR, kinematics, capture, drift
    /// scoring, save. Stages the configuration does not enable are left out.
    pub fn from_settings(
        scan: &ScanSettings,
        imager_settings: &ImagerSettings,
        mover: SharedMover,
        imager: SharedImager,
    ) -> Result<Self> {
        let fov = FieldOfView::from_settings(imager_settings)?;
        let geometry = ScanGeometry::from_settings(scan, &fov)?;
        let tracks_z = geometry.tracks_z();
        let has_exclusions = geometry.has_exclusions();

        let control = ScanControl::new();
        let clock = SettleClock::new();
        let mut stages: Vec<Box<dyn ScanStage>> = vec![Box::new(PointGenerator::new(
            geometry,
            mover.clone(),
            clock.clone(),
        ))];

        let mut drift = None;
        if let Some(stacking) = &scan.stacking {
            let mut stacker = FocusStacker::new(stacking, mover.clone(), clock.clone(), tracks_z)?;
            if stacking.drift_correction && stacking.images > 1 {
                let tracker = DriftTracker::new(stacker.step());
                stacker = stacker.with_drift(tracker.clone());
                drift = Some(tracker);
            }
            stages.push(Box::new(stacker));
        }
        if let Some(hdr) = &scan.hdr {
            stages.push(Box::new(HdrStage::new(
                hdr.properties.clone(),
                imager.clone(),
                clock.clone(),
            )));
        }
        stages.push(Box::new(KinematicsStage::new(
            &scan.kinematics,
            Duration::from_millis(imager_settings.capture_timeout_ms),
            clock,
            control.clone(),
            imager.clone(),
        )));
        stages.push(Box::new(CaptureStage::new(
            imager_settings,
            imager,
            control.clone(),
        )));
        if let Some(tracker) = drift {
            stages.push(Box::new(StackDriftStage::new(tracker)));
        }
        stages.push(Box::new(SaveStage::new(&scan.output)));

        let mut pipeline = Self::new(stages, mover, scan.output.clone());
        pipeline.control = control;
        pipeline.home_before_scan = scan.home_before_scan;
        pipeline.tolerate_count_mismatch = has_exclusions;
        Ok(pipeline)
    }

    /// Home before the first move, asking `confirm` first
    pub fn with_homing(mut self, confirm: Option<ConfirmCallback>) -> Self {
        self.home_before_scan = true;
        self.confirm_home = confirm;
        self
    }

    /// Log instead of fail when fewer images than expected were captured
    pub fn tolerate_count_mismatch(mut self, tolerate: bool) -> Self {
        self.tolerate_count_mismatch = tolerate;
        self
    }

    /// The stop/pause token
    pub fn control(&self) -> ScanControl {
        self.control.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ScanState {
        self.lifecycle.get()
    }

    /// Subscribe to state changes and progress
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.lifecycle.events.subscribe()
    }

    /// Product of the stage multipliers
    pub fn images_expected(&self) -> usize {
        images_expected(&self.stages)
    }

    /// Names of the stages, outermost first
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Run the scan to completion on the calling thread
    pub fn run(&mut self) -> ScanOutcome {
        let expected = self.images_expected();
        if !self.lifecycle.transition(ScanState::Idle, ScanState::Running) {
            return ScanOutcome {
                result: ScanResult::Exception,
                state: self.lifecycle.get(),
                images_expected: expected,
                images_captured: 0,
                message: Some("Scan pipeline has already run".to_string()),
                metadata_path: None,
            };
        }
        tracing::info!(
            "Starting scan: {} images through [{}]",
            expected,
            self.stage_names().join(", ")
        );

        if let Err(e) = self.home_if_requested() {
            tracing::error!("Scan could not start: {}", e);
            self.lifecycle.set(ScanState::Failed);
            return ScanOutcome {
                result: ScanResult::Exception,
                state: ScanState::Failed,
                images_expected: expected,
                images_captured: 0,
                message: Some(e.to_string()),
                metadata_path: None,
            };
        }

        let mut metadata = ScanMetadata::new();
        metadata.images_expected = expected;

        let mut captured = 0usize;
        let mut begun = 0usize;
        let mut result = self.begin_stages(&mut metadata, &mut begun);
        if result.is_ok() {
            result = self.drive(expected, &mut captured);
        }
        for stage in self.stages[..begun].iter_mut().rev() {
            if let Err(e) = stage.scan_end(&mut metadata) {
                tracing::warn!("Stage '{}' failed to finish: {}", stage.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        if result.is_ok() && captured != expected {
            result = self.count_mismatch(expected, captured);
        }

        let (scan_result, state, message) = match &result {
            Ok(()) => (ScanResult::Ok, ScanState::Completed, None),
            Err(e) if e.is_stopped() => (ScanResult::Stopped, ScanState::Stopped, None),
            Err(e) => (ScanResult::Exception, ScanState::Failed, Some(e.to_string())),
        };
        metadata.finished_at = Some(chrono::Utc::now());
        metadata.images_captured = captured;
        metadata.result = Some(scan_result);
        metadata.message = message.clone();

        let mut outcome = ScanOutcome {
            result: scan_result,
            state,
            images_expected: expected,
            images_captured: captured,
            message,
            metadata_path: None,
        };
        match metadata.write_to(&self.output.directory, &self.output.metadata_file) {
            Ok(path) => outcome.metadata_path = Some(path),
            Err(e) => {
                tracing::error!("Failed to write scan metadata: {}", e);
                if outcome.result == ScanResult::Ok {
                    outcome.result = ScanResult::Exception;
                    outcome.state = ScanState::Failed;
                    outcome.message = Some(e.to_string());
                }
            }
        }

        match outcome.result {
            ScanResult::Ok => tracing::info!("Scan completed: {} images", captured),
            ScanResult::Stopped => tracing::info!("Scan stopped after {} images", captured),
            ScanResult::Exception => tracing::error!(
                "Scan failed after {} images: {}",
                captured,
                outcome.message.as_deref().unwrap_or("unknown error")
            ),
        }
        self.lifecycle.set(outcome.state);
        outcome
    }

    /// Run the scan on a named thread
    pub fn spawn(mut self) -> Result<ScanHandle> {
        let control = self.control.clone();
        let lifecycle = self.lifecycle.clone();
        let join = std::thread::Builder::new()
            .name(SCAN_THREAD_NAME.to_string())
            .spawn(move || self.run())?;
        Ok(ScanHandle {
            control,
            lifecycle,
            join,
        })
    }

    fn home_if_requested(&self) -> Result<()> {
        if !self.home_before_scan {
            return Ok(());
        }
        if let Some(confirm) = &self.confirm_home {
            if !confirm() {
                return Err(MotionError::HomingAborted.into());
            }
        }
        tracing::info!("Homing before scan");
        self.mover.home()
    }

    fn begin_stages(&mut self, metadata: &mut ScanMetadata, begun: &mut usize) -> Result<()> {
        for stage in self.stages.iter_mut() {
            stage.scan_begin(metadata)?;
            *begun += 1;
        }
        Ok(())
    }

    fn drive(&mut self, expected: usize, captured: &mut usize) -> Result<()> {
        let events = self.lifecycle.events.clone();
        run_pipeline(
            &mut self.stages,
            StepState::new(),
            &self.control,
            &mut |leaf| {
                *captured += 1;
                events.publish(ScanEvent::Progress {
                    captured: *captured,
                    expected,
                    filename: leaf.text(keys::FILENAME).map(str::to_string),
                });
                Ok(())
            },
        )
    }

    fn count_mismatch(&self, expected: usize, actual: usize) -> Result<()> {
        if self.tolerate_count_mismatch {
            let message = format!(
                "Captured {} of {} images; exclusions are configured",
                actual, expected
            );
            tracing::warn!("{}", message);
            self.lifecycle.events.publish(ScanEvent::Warning(message));
            Ok(())
        } else {
            Err(Error::from(ScanError::CountMismatch { expected, actual }))
        }
    }
}

/// Control surface of a scan running on its own thread
pub struct ScanHandle {
    control: ScanControl,
    lifecycle: Lifecycle,
    join: JoinHandle<ScanOutcome>,
}

impl ScanHandle {
    /// Request a stop at the next checkpoint
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Hold the scan at its next checkpoint
    pub fn pause(&self) {
        self.control.pause();
        self.lifecycle.transition(ScanState::Running, ScanState::Paused);
    }

    /// Release a paused scan
    pub fn resume(&self) {
        self.control.resume();
        self.lifecycle.transition(ScanState::Paused, ScanState::Running);
    }

    /// Current lifecycle state
    pub fn state(&self) -> ScanState {
        self.lifecycle.get()
    }

    /// Subscribe to state changes and progress
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.lifecycle.events.subscribe()
    }

    /// Whether the scan thread has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the scan to end
    pub fn join(self) -> Result<ScanOutcome> {
        self.join
            .join()
            .map_err(|_| Error::other("Scan thread panicked"))
    }
}
