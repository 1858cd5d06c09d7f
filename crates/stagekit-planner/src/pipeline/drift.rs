//! Focus drift tracking across stacks
//!
//! [`StackDriftStage`] sits after capture and scores every frame of a
//! stack. When the focus stacker starts its next stack it asks the
//! [`DriftTracker`] to close the previous one: the persistent offset moves
//! by at most one plane spacing toward the sharpest plane.

use super::state::{keys, StageItem, StepState};
use super::{OncePerBranch, ScanStage};
use crate::imager::Frame;
use crate::metadata::{ScanMetadata, StageSummary};
use image::imageops;
use parking_lot::Mutex;
use stagekit_core::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Gradient energy of a frame's luma; larger is sharper
pub fn sharpness(frame: &Frame) -> f64 {
    let luma = imageops::grayscale(frame);
    let (width, height) = luma.dimensions();
    if width < 2 || height < 2 {
        return 0.0;
    }
    let mut energy = 0.0;
    for y in 0..height - 1 {
        for x in 0..width - 1 {
            let v = luma.get_pixel(x, y).0[0] as f64;
            let dx = luma.get_pixel(x + 1, y).0[0] as f64 - v;
            let dy = luma.get_pixel(x, y + 1).0[0] as f64 - v;
            energy += dx * dx + dy * dy;
        }
    }
    energy / ((width - 1) * (height - 1)) as f64
}

#[derive(Debug, Default)]
struct DriftState {
    spacing: f64,
    center: Option<f64>,
    /// Best score and its Z per plane index of the open stack
    planes: BTreeMap<usize, (f64, f64)>,
    offset: f64,
    history: Vec<f64>,
}

/// Persistent focus offset shared by the stacker and the drift stage
#[derive(Debug, Clone, Default)]
pub struct DriftTracker {
    state: Arc<Mutex<DriftState>>,
}

impl DriftTracker {
    /// Tracker for stacks whose planes are `spacing` apart
    pub fn new(spacing: f64) -> Self {
        let tracker = Self::default();
        tracker.state.lock().spacing = spacing.abs();
        tracker
    }

    /// Current offset to apply to the stack center
    pub fn offset(&self) -> f64 {
        self.state.lock().offset
    }

    /// Offsets after each closed stack
    pub fn history(&self) -> Vec<f64> {
        self.state.lock().history.clone()
    }

    /// Open a stack centered on `center`
    pub fn begin_stack(&self, center: f64) {
        let mut state = self.state.lock();
        state.center = Some(center);
        state.planes.clear();
    }

    /// Score one captured plane; repeated captures keep the best score
    pub fn record(&self, plane: usize, z: f64, score: f64) {
        let mut state = self.state.lock();
        let entry = state.planes.entry(plane).or_insert((f64::MIN, z));
        if score > entry.0 {
            *entry = (score, z);
        }
    }

    /// Close the open stack and return the updated offset
    pub fn finish_stack(&self) -> f64 {
        let mut state = self.state.lock();
        let Some(center) = state.center.take() else {
            return state.offset;
        };
        if state.planes.len() >= 2 {
            let best = state
                .planes
                .values()
                .copied()
                .fold(None::<(f64, f64)>, |best, plane| match best {
                    Some(b) if b.0 >= plane.0 => Some(b),
                    _ => Some(plane),
                });
            if let Some((_, best_z)) = best {
                let nudge = (best_z - center).clamp(-state.spacing, state.spacing);
                state.offset += nudge;
                let offset = state.offset;
                state.history.push(offset);
                if nudge != 0.0 {
                    tracing::debug!("Focus drift nudged by {:.4} to {:.4}", nudge, offset);
                }
            }
        }
        state.planes.clear();
        state.offset
    }
}

/// Scores each captured plane for the drift tracker
pub struct StackDriftStage {
    tracker: DriftTracker,
    once: OncePerBranch,
}

impl StackDriftStage {
    /// Feed scores into `tracker`
    pub fn new(tracker: DriftTracker) -> Self {
        Self {
            tracker,
            once: OncePerBranch::default(),
        }
    }
}

impl ScanStage for StackDriftStage {
    fn name(&self) -> &str {
        "stack_drift"
    }

    fn scan_end(&mut self, metadata: &mut ScanMetadata) -> Result<()> {
        let offset = self.tracker.finish_stack();
        metadata.set_stage(StageSummary {
            stage: self.name().to_string(),
            images_expected: None,
            details: serde_json::json!({
                "offset": offset,
                "history": self.tracker.history(),
            }),
        });
        Ok(())
    }

    fn produce(&mut self, _state: &StepState) -> Result<()> {
        self.once.reset();
        Ok(())
    }

    fn next_item(&mut self, state: &StepState) -> Result<Option<StageItem>> {
        if !self.once.take() {
            return Ok(None);
        }
        let frame = state.require_frame(self.name())?;
        if let (Some(plane), Some(z)) = (state.index(keys::STACK_INDEX), state.number(keys::Z)) {
            self.tracker.record(plane, z, sharpness(frame));
        }
        Ok(Some(StageItem::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_sharpness_prefers_edges() {
        let flat = RgbImage::from_pixel(8, 8, Rgb([100, 100, 100]));
        let checker = RgbImage::from_fn(8, 8, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        assert_eq!(sharpness(&flat), 0.0);
        assert!(sharpness(&checker) > 1000.0);
    }

    #[test]
    fn test_nudge_is_bounded_by_spacing() {
        let tracker = DriftTracker::new(0.1);
        tracker.begin_stack(5.0);
        tracker.record(0, 4.8, 1.0);
        tracker.record(1, 4.9, 2.0);
        tracker.record(2, 5.0, 3.0);
        tracker.record(3, 5.1, 4.0);
        tracker.record(4, 5.2, 9.0);
        // Best plane is two spacings up; only one is applied
        assert!((tracker.finish_stack() - 0.1).abs() < 1e-12);

        tracker.begin_stack(5.1);
        tracker.record(0, 4.9, 1.0);
        tracker.record(1, 5.1, 5.0);
        tracker.record(2, 5.3, 1.0);
        assert!((tracker.finish_stack() - 0.1).abs() < 1e-12);
        assert_eq!(tracker.history().len(), 2);
    }

    #[test]
    fn test_finish_without_stack_keeps_offset() {
        let tracker = DriftTracker::new(0.1);
        assert_eq!(tracker.finish_stack(), 0.0);
    }
}
