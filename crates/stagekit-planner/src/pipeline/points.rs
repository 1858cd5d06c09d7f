//! Point generator: the outermost stage, one branch per grid cell

use super::kinematics::SettleClock;
use super::state::{keys, StageItem, StepState, StepValue};
use super::{ScanStage, SharedMover};
use crate::geometry::{GridPoint, ScanGeometry};
use crate::metadata::{ScanMetadata, StageSummary};
use stagekit_core::Result;

/// Moves to each grid cell in turn
pub struct PointGenerator {
    geometry: ScanGeometry,
    points: Vec<GridPoint>,
    cursor: usize,
    mover: SharedMover,
    clock: SettleClock,
}

impl PointGenerator {
    /// Visit the cells of `geometry` with `mover`
    pub fn new(geometry: ScanGeometry, mover: SharedMover, clock: SettleClock) -> Self {
        let points = geometry.points();
        Self {
            geometry,
            points,
            cursor: 0,
            mover,
            clock,
        }
    }

    /// The planned geometry
    pub fn geometry(&self) -> &ScanGeometry {
        &self.geometry
    }
}

impl ScanStage for PointGenerator {
    fn name(&self) -> &str {
        "points"
    }

    fn images_expected(&self) -> Option<usize> {
        Some(self.geometry.images_expected())
    }

    fn scan_begin(&mut self, metadata: &mut ScanMetadata) -> Result<()> {
        metadata.axes = self.geometry.descriptors();
        metadata.points = self.points.clone();
        metadata.set_stage(StageSummary {
            stage: self.name().to_string(),
            images_expected: self.images_expected(),
            details: serde_json::json!({
                "visited": self.points.len(),
                "tracks_z": self.geometry.tracks_z(),
            }),
        });
        tracing::info!(
            "Scanning {} x {} grid ({} cells to visit)",
            self.geometry.columns().images_actual,
            self.geometry.rows().images_actual,
            self.points.len()
        );
        Ok(())
    }

    fn produce(&mut self, _state: &StepState) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_item(&mut self, _state: &StepState) -> Result<Option<StageItem>> {
        let Some(point) = self.points.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;

        tracing::debug!("Moving to cell c{}/r{} at {}", point.col, point.row, point.position);
        self.mover.move_to(&point.position)?;
        self.clock.mark_motion();

        Ok(Some(
            StageItem::new()
                .with(keys::ROW, StepValue::Index(point.row))
                .with(keys::COL, StepValue::Index(point.col))
                .with(keys::POSITION, StepValue::Position(point.position))
                .fragment(format!("c{:03}_r{:03}", point.col, point.row)),
        ))
    }
}
