//! Kinematics wait: lets the stage and the imager settle before capture

use super::state::{StageItem, StepState};
use super::{OncePerBranch, ScanStage};
use crate::control::ScanControl;
use crate::imager::SharedImager;
use crate::metadata::{ScanMetadata, StageSummary};
use parking_lot::Mutex;
use stagekit_core::Result;
use stagekit_settings::KinematicsSettings;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Marks {
    motion: Option<Instant>,
    property: Option<Instant>,
}

/// When the stage last moved and the imager last changed properties
#[derive(Debug, Clone, Default)]
pub struct SettleClock {
    marks: Arc<Mutex<Marks>>,
}

impl SettleClock {
    /// Clock with nothing recorded
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed move
    pub fn mark_motion(&self) {
        self.marks.lock().motion = Some(Instant::now());
    }

    /// Record a property change
    pub fn mark_property(&self) {
        self.marks.lock().property = Some(Instant::now());
    }

    /// Time left until both settle periods have elapsed
    pub fn remaining(&self, motion_settle: Duration, property_settle: Duration) -> Duration {
        let marks = self.marks.lock();
        let now = Instant::now();
        let left = |mark: Option<Instant>, settle: Duration| {
            mark.map(|m| (m + settle).saturating_duration_since(now))
                .unwrap_or_default()
        };
        left(marks.motion, motion_settle).max(left(marks.property, property_settle))
    }
}

/// Waits out settle times and optionally flushes the imager with a dummy frame
pub struct KinematicsStage {
    motion_settle: Duration,
    property_settle: Duration,
    dummy_capture: bool,
    capture_timeout: Duration,
    clock: SettleClock,
    control: ScanControl,
    imager: SharedImager,
    once: OncePerBranch,
    waited: Duration,
}

impl KinematicsStage {
    /// Build from the kinematics settings
    pub fn new(
        settings: &KinematicsSettings,
        capture_timeout: Duration,
        clock: SettleClock,
        control: ScanControl,
        imager: SharedImager,
    ) -> Self {
        Self {
            motion_settle: Duration::from_millis(settings.motion_settle_ms),
            property_settle: Duration::from_millis(settings.property_settle_ms),
            dummy_capture: settings.dummy_capture,
            capture_timeout,
            clock,
            control,
            imager,
            once: OncePerBranch::default(),
            waited: Duration::ZERO,
        }
    }
}

impl ScanStage for KinematicsStage {
    fn name(&self) -> &str {
        "kinematics"
    }

    fn scan_end(&mut self, metadata: &mut ScanMetadata) -> Result<()> {
        metadata.set_stage(StageSummary {
            stage: self.name().to_string(),
            images_expected: None,
            details: serde_json::json!({
                "motion_settle_ms": self.motion_settle.as_millis() as u64,
                "property_settle_ms": self.property_settle.as_millis() as u64,
                "dummy_capture": self.dummy_capture,
                "total_wait_ms": self.waited.as_millis() as u64,
            }),
        });
        Ok(())
    }

    fn produce(&mut self, _state: &StepState) -> Result<()> {
        self.once.reset();
        Ok(())
    }

    fn next_item(&mut self, _state: &StepState) -> Result<Option<StageItem>> {
        if !self.once.take() {
            return Ok(None);
        }

        let wait = self.clock.remaining(self.motion_settle, self.property_settle);
        if !wait.is_zero() {
            self.control.sleep(wait)?;
            self.waited += wait;
        }

        if self.dummy_capture {
            // The frame in flight may predate the last move
            let frame = self.imager.lock().get(self.capture_timeout)?;
            tracing::trace!("Discarded {}x{} sync frame", frame.width(), frame.height());
        }
        Ok(Some(StageItem::new()))
    }
}
