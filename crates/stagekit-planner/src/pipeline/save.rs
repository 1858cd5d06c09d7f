//! Save: writes each captured frame under a name built from the fragments

use super::state::{keys, StageItem, StepState, StepValue};
use super::{OncePerBranch, ScanStage};
use crate::metadata::{FileRecord, ScanMetadata, StageSummary};
use chrono::Utc;
use stagekit_core::{Axis, Error, Position, Result};
use stagekit_settings::OutputSettings;
use std::collections::HashSet;
use std::path::PathBuf;

/// Writes one image per leaf and records it for the metadata
pub struct SaveStage {
    directory: PathBuf,
    prefix: String,
    extension: String,
    write_images: bool,
    once: OncePerBranch,
    records: Vec<FileRecord>,
    seen: HashSet<String>,
}

impl SaveStage {
    /// Save per the output settings
    pub fn new(output: &OutputSettings) -> Self {
        Self {
            directory: output.directory.clone(),
            prefix: output.prefix.clone(),
            extension: output.extension.clone(),
            write_images: output.write_images,
            once: OncePerBranch::default(),
            records: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Records of the files saved so far
    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }
}

impl ScanStage for SaveStage {
    fn name(&self) -> &str {
        "save"
    }

    fn scan_begin(&mut self, _metadata: &mut ScanMetadata) -> Result<()> {
        if self.write_images {
            std::fs::create_dir_all(&self.directory)?;
        }
        self.records.clear();
        self.seen.clear();
        Ok(())
    }

    fn scan_end(&mut self, metadata: &mut ScanMetadata) -> Result<()> {
        metadata.files.append(&mut self.records);
        metadata.set_stage(StageSummary {
            stage: self.name().to_string(),
            images_expected: None,
            details: serde_json::json!({
                "directory": self.directory,
                "write_images": self.write_images,
                "saved": metadata.files.len(),
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
        let filename = state.filename(&self.prefix, &self.extension);
        if !self.seen.insert(filename.clone()) {
            tracing::warn!("Overwriting {} written earlier in this scan", filename);
        }

        if self.write_images {
            let path = self.directory.join(&filename);
            frame
                .save(&path)
                .map_err(|e| Error::other(format!("Failed to write {:?}: {}", path, e)))?;
            tracing::debug!("Saved {:?}", path);
        }

        self.records.push(FileRecord {
            filename: filename.clone(),
            row: state.index(keys::ROW),
            col: state.index(keys::COL),
            stack_index: state.index(keys::STACK_INDEX),
            hdr_index: state.index(keys::HDR_INDEX),
            position: captured_position(state),
            properties: state.properties(keys::PROPERTIES).cloned(),
            captured_at: Utc::now(),
        });
        Ok(Some(
            StageItem::new().with(keys::FILENAME, StepValue::Text(filename)),
        ))
    }
}

/// Where the frame was taken: the grid cell with the focus plane's Z applied
fn captured_position(state: &StepState) -> Option<Position> {
    let cell = state.position(keys::POSITION).cloned();
    match state.number(keys::Z) {
        Some(z) => Some(cell.unwrap_or_default().with(Axis::Z, z)),
        None => cell,
    }
}
