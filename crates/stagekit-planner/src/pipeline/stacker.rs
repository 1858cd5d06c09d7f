//! Focus stacker: `N` Z planes centered on the Z found at branch start
//!
//! The reference Z is read once per branch. Planes run from
//! `center - distance/2` to `center + distance/2` and the stage returns to
//! the reference after the last plane, so the next branch starts from the
//! same focus. With drift correction the center is `reference + offset`.

use super::drift::DriftTracker;
use super::kinematics::SettleClock;
use super::state::{keys, StageItem, StepState, StepValue};
use super::{ScanStage, SharedMover};
use crate::metadata::{ScanMetadata, StageSummary};
use stagekit_core::{Axis, ConfigurationError, MotionError, Position, Result};
use stagekit_settings::StackSettings;

/// Captures a focus stack per branch
pub struct FocusStacker {
    images: usize,
    distance: f64,
    mover: SharedMover,
    clock: SettleClock,
    drift: Option<DriftTracker>,
    restore_z: bool,
    initial_z: Option<f64>,
    reference: f64,
    center: f64,
    cursor: usize,
    returned: bool,
}

impl FocusStacker {
    /// Stack per `settings`; `tracks_z` disables the scan-end Z restore
    pub fn new(
        settings: &StackSettings,
        mover: SharedMover,
        clock: SettleClock,
        tracks_z: bool,
    ) -> Result<Self> {
        if settings.images == 0 {
            return Err(
                ConfigurationError::invalid("scan.stacking.images", "must be at least 1").into(),
            );
        }
        if !settings.distance.is_finite() || settings.distance < 0.0 {
            return Err(ConfigurationError::invalid(
                "scan.stacking.distance",
                "must be a non-negative distance",
            )
            .into());
        }
        Ok(Self {
            images: settings.images,
            distance: settings.distance,
            mover,
            clock,
            drift: None,
            restore_z: !tracks_z,
            initial_z: None,
            reference: 0.0,
            center: 0.0,
            cursor: 0,
            returned: false,
        })
    }

    /// Center later stacks on the tracker's offset
    pub fn with_drift(mut self, tracker: DriftTracker) -> Self {
        self.drift = Some(tracker);
        self
    }

    /// Distance between adjacent planes
    pub fn step(&self) -> f64 {
        if self.images > 1 {
            self.distance / (self.images - 1) as f64
        } else {
            0.0
        }
    }

    /// Z of plane `index` around the current center
    pub fn plane_z(&self, index: usize) -> f64 {
        if self.images > 1 {
            self.center - self.distance / 2.0 + index as f64 * self.step()
        } else {
            self.center
        }
    }

    fn current_z(&self) -> Result<f64> {
        self.mover
            .position()?
            .get(Axis::Z)
            .ok_or_else(|| MotionError::invalid_state("focus stacking needs a Z axis").into())
    }

    fn move_z(&self, z: f64) -> Result<()> {
        self.mover.move_to(&Position::new().with(Axis::Z, z))?;
        self.clock.mark_motion();
        Ok(())
    }
}

impl ScanStage for FocusStacker {
    fn name(&self) -> &str {
        "stacker"
    }

    fn images_expected(&self) -> Option<usize> {
        Some(self.images)
    }

    fn scan_begin(&mut self, _metadata: &mut ScanMetadata) -> Result<()> {
        self.initial_z = Some(self.current_z()?);
        Ok(())
    }

    fn scan_end(&mut self, metadata: &mut ScanMetadata) -> Result<()> {
        if self.restore_z {
            if let Some(z) = self.initial_z.take() {
                tracing::debug!("Restoring focus to Z {:.4}", z);
                self.move_z(z)?;
            }
        }
        let drift = self.drift.as_ref().map(|tracker| tracker.offset());
        metadata.set_stage(StageSummary {
            stage: self.name().to_string(),
            images_expected: self.images_expected(),
            details: serde_json::json!({
                "distance": self.distance,
                "step": self.step(),
                "restore_z": self.restore_z,
                "drift_offset": drift,
            }),
        });
        Ok(())
    }

    fn produce(&mut self, _state: &StepState) -> Result<()> {
        self.reference = self.current_z()?;
        let offset = match &self.drift {
            Some(tracker) => tracker.finish_stack(),
            None => 0.0,
        };
        self.center = self.reference + offset;
        if let Some(tracker) = &self.drift {
            tracker.begin_stack(self.center);
        }
        self.cursor = 0;
        self.returned = false;
        Ok(())
    }

    fn next_item(&mut self, _state: &StepState) -> Result<Option<StageItem>> {
        if self.cursor >= self.images {
            if !self.returned {
                self.returned = true;
                self.move_z(self.reference)?;
            }
            return Ok(None);
        }
        let index = self.cursor;
        self.cursor += 1;

        let z = self.plane_z(index);
        self.move_z(z)?;

        Ok(Some(
            StageItem::new()
                .with(keys::STACK_INDEX, StepValue::Index(index))
                .with(keys::Z, StepValue::Number(z))
                .fragment(format!("z{:02}", index)),
        ))
    }
}
