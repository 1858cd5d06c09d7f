//! HDR bracket: one branch per configured imager property set

use super::kinematics::SettleClock;
use super::state::{keys, StageItem, StepState, StepValue};
use super::ScanStage;
use crate::imager::SharedImager;
use crate::metadata::{ScanMetadata, StageSummary};
use stagekit_core::Result;
use stagekit_settings::PropertyMap;

/// Applies each property set before the stages nested beneath it
pub struct HdrStage {
    exposures: Vec<PropertyMap>,
    imager: SharedImager,
    clock: SettleClock,
    original: Option<PropertyMap>,
    cursor: usize,
}

impl HdrStage {
    /// Bracket over `exposures`, restoring the imager's properties at scan end
    pub fn new(exposures: Vec<PropertyMap>, imager: SharedImager, clock: SettleClock) -> Self {
        Self {
            exposures,
            imager,
            clock,
            original: None,
            cursor: 0,
        }
    }
}

impl ScanStage for HdrStage {
    fn name(&self) -> &str {
        "hdr"
    }

    fn images_expected(&self) -> Option<usize> {
        Some(self.exposures.len())
    }

    fn scan_begin(&mut self, _metadata: &mut ScanMetadata) -> Result<()> {
        self.original = Some(self.imager.lock().get_properties()?);
        Ok(())
    }

    fn scan_end(&mut self, metadata: &mut ScanMetadata) -> Result<()> {
        let restored = match self.original.take() {
            Some(original) => {
                // Only the keys this bracket touched
                let touched: PropertyMap = original
                    .into_iter()
                    .filter(|(key, _)| self.exposures.iter().any(|e| e.contains_key(key)))
                    .collect();
                self.imager.lock().set_properties(&touched)?;
                self.clock.mark_property();
                tracing::debug!("Restored imager properties {:?}", touched.keys());
                true
            }
            None => false,
        };
        metadata.set_stage(StageSummary {
            stage: self.name().to_string(),
            images_expected: self.images_expected(),
            details: serde_json::json!({
                "exposures": self.exposures,
                "restored": restored,
            }),
        });
        Ok(())
    }

    fn produce(&mut self, _state: &StepState) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_item(&mut self, _state: &StepState) -> Result<Option<StageItem>> {
        let Some(properties) = self.exposures.get(self.cursor).cloned() else {
            return Ok(None);
        };
        let index = self.cursor;
        self.cursor += 1;

        self.imager.lock().set_properties(&properties)?;
        self.clock.mark_property();

        Ok(Some(
            StageItem::new()
                .with(keys::HDR_INDEX, StepValue::Index(index))
                .with(keys::PROPERTIES, StepValue::Properties(properties))
                .fragment(format!("h{:02}", index)),
        ))
    }
}
