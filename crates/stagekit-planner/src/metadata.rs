//! Scan metadata record
//!
//! Filled in by the stages' begin/end hooks and written once as JSON when
//! the scan finishes, for downstream stitching tools.

use crate::geometry::{AxisDescriptor, GridPoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagekit_core::{ConfigurationError, Position, Result};
use stagekit_settings::PropertyMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What one stage asked for and what it did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Stage name
    pub stage: String,
    /// Image multiplier, if the stage has one
    pub images_expected: Option<usize>,
    /// Stage specific details
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// One written image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File name relative to the output directory
    pub filename: String,
    /// Grid row
    pub row: Option<usize>,
    /// Grid column
    pub col: Option<usize>,
    /// Focus plane index
    pub stack_index: Option<usize>,
    /// Exposure set index
    pub hdr_index: Option<usize>,
    /// Stage position at capture
    pub position: Option<Position>,
    /// Imager properties used
    pub properties: Option<PropertyMap>,
    /// Capture time
    pub captured_at: DateTime<Utc>,
}

/// Outcome of a scan as recorded in the metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanResult {
    /// Every step finished
    Ok,
    /// Stopped on request
    Stopped,
    /// A step failed
    Exception,
}

/// Complete scan record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMetadata {
    /// Unique id of this scan
    pub scan_id: Uuid,
    /// Version of the software that ran the scan
    pub version: String,
    /// Scan start
    pub started_at: DateTime<Utc>,
    /// Scan end
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-axis geometry
    pub axes: Vec<AxisDescriptor>,
    /// Grid cells in visiting order
    pub points: Vec<GridPoint>,
    /// Stage summaries in pipeline order
    pub stages: Vec<StageSummary>,
    /// Written images
    pub files: Vec<FileRecord>,
    /// Images the pipeline expected
    pub images_expected: usize,
    /// Images captured
    pub images_captured: usize,
    /// Final result
    pub result: Option<ScanResult>,
    /// Failure message, if any
    pub message: Option<String>,
}

impl ScanMetadata {
    /// Empty record stamped with the current time
    pub fn new() -> Self {
        Self {
            scan_id: Uuid::new_v4(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
            finished_at: None,
            axes: Vec::new(),
            points: Vec::new(),
            stages: Vec::new(),
            files: Vec::new(),
            images_expected: 0,
            images_captured: 0,
            result: None,
            message: None,
        }
    }

    /// Record (or replace) a stage summary
    pub fn set_stage(&mut self, summary: StageSummary) {
        match self.stages.iter_mut().find(|s| s.stage == summary.stage) {
            Some(existing) => *existing = summary,
            None => self.stages.push(summary),
        }
    }

    /// Summary of a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Write pretty JSON to `dir/name`, creating the directory
    pub fn write_to(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigurationError::Parse {
            reason: format!("Failed to serialize scan metadata: {}", e),
        })?;
        std::fs::write(&path, content)?;
        tracing::info!("Scan metadata written to {:?}", path);
        Ok(path)
    }

    /// Read a record written by [`write_to`](Self::write_to)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            ConfigurationError::Parse {
                reason: format!("Invalid scan metadata {:?}: {}", path, e),
            }
            .into()
        })
    }
}

impl Default for ScanMetadata {
    fn default() -> Self {
        Self::new()
    }
}
