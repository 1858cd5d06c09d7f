//! Per-step state accumulated through nested stages

use crate::imager::Frame;
use stagekit_core::{Position, Result, ScanError};
use stagekit_settings::PropertyMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Well-known step state keys
pub mod keys {
    /// Grid row (point generator)
    pub const ROW: &str = "row";
    /// Grid column (point generator)
    pub const COL: &str = "col";
    /// Commanded stage position (point generator)
    pub const POSITION: &str = "position";
    /// Focus plane index (focus stacker)
    pub const STACK_INDEX: &str = "stack_index";
    /// Focus plane Z (focus stacker)
    pub const Z: &str = "z";
    /// Exposure set index (HDR bracket)
    pub const HDR_INDEX: &str = "hdr_index";
    /// Properties applied for the exposure (HDR bracket)
    pub const PROPERTIES: &str = "properties";
    /// Captured frame (capture)
    pub const FRAME: &str = "frame";
    /// Written file name (save)
    pub const FILENAME: &str = "filename";
}

/// A value stored in the step state
#[derive(Debug, Clone, PartialEq)]
pub enum StepValue {
    /// An index (row, column, plane, exposure)
    Index(usize),
    /// A real number
    Number(f64),
    /// Text
    Text(String),
    /// A stage position
    Position(Position),
    /// Imager properties
    Properties(PropertyMap),
    /// A captured frame
    Frame(Arc<Frame>),
}

/// One item yielded by a stage: overrides plus an optional file name fragment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageItem {
    /// Keys added or replaced in the derived state
    pub overrides: Vec<(String, StepValue)>,
    /// Appended to the output file name
    pub fragment: Option<String>,
}

impl StageItem {
    /// An item that changes nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a key
    pub fn with(mut self, key: &str, value: StepValue) -> Self {
        self.overrides.push((key.to_string(), value));
        self
    }

    /// Append a file name fragment
    pub fn fragment(mut self, fragment: impl Into<String>) -> Self {
        self.fragment = Some(fragment.into());
        self
    }
}

/// Append-only state of one pipeline branch
///
/// Each nested stage derives a new state from its parent; keys can be added
/// or overridden but never removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepState {
    values: BTreeMap<String, StepValue>,
    fragments: Vec<String>,
}

impl StepState {
    /// Empty root state
    pub fn new() -> Self {
        Self::default()
    }

    /// Child state with `item` merged in
    pub fn derive(&self, item: StageItem) -> StepState {
        let mut child = self.clone();
        for (key, value) in item.overrides {
            child.values.insert(key, value);
        }
        if let Some(fragment) = item.fragment {
            child.fragments.push(fragment);
        }
        child
    }

    /// Raw value of a key
    pub fn get(&self, key: &str) -> Option<&StepValue> {
        self.values.get(key)
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Index value of a key
    pub fn index(&self, key: &str) -> Option<usize> {
        match self.get(key)? {
            StepValue::Index(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value of a key
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            StepValue::Number(v) => Some(*v),
            StepValue::Index(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Text value of a key
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            StepValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Position value of a key
    pub fn position(&self, key: &str) -> Option<&Position> {
        match self.get(key)? {
            StepValue::Position(p) => Some(p),
            _ => None,
        }
    }

    /// Properties value of a key
    pub fn properties(&self, key: &str) -> Option<&PropertyMap> {
        match self.get(key)? {
            StepValue::Properties(p) => Some(p),
            _ => None,
        }
    }

    /// Frame value of a key
    pub fn frame(&self, key: &str) -> Option<&Arc<Frame>> {
        match self.get(key)? {
            StepValue::Frame(f) => Some(f),
            _ => None,
        }
    }

    /// Frame that an earlier stage must have captured
    pub fn require_frame(&self, stage: &str) -> Result<&Arc<Frame>> {
        self.frame(keys::FRAME).ok_or_else(|| {
            ScanError::MissingState {
                stage: stage.to_string(),
                key: keys::FRAME.to_string(),
            }
            .into()
        })
    }

    /// File name fragments in nesting order
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Output file name from the prefix, the fragments and the extension
    pub fn filename(&self, prefix: &str, extension: &str) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.fragments.len() + 1);
        if !prefix.is_empty() {
            parts.push(prefix);
        }
        parts.extend(self.fragments.iter().map(String::as_str));
        let stem = if parts.is_empty() {
            "image".to_string()
        } else {
            parts.join("_")
        };
        format!("{}.{}", stem, extension.trim_start_matches('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_overrides_and_appends() {
        let root = StepState::new();
        let point = root.derive(
            StageItem::new()
                .with(keys::ROW, StepValue::Index(1))
                .with(keys::COL, StepValue::Index(2))
                .fragment("c002_r001"),
        );
        let plane = point.derive(
            StageItem::new()
                .with(keys::ROW, StepValue::Index(5))
                .fragment("z03"),
        );

        assert_eq!(plane.index(keys::ROW), Some(5));
        assert_eq!(plane.index(keys::COL), Some(2));
        assert_eq!(point.index(keys::ROW), Some(1));
        assert_eq!(plane.filename("scan", "png"), "scan_c002_r001_z03.png");
        assert!(root.fragments().is_empty());
    }

    #[test]
    fn test_missing_frame_is_reported() {
        let err = StepState::new().require_frame("save").unwrap_err();
        assert!(matches!(
            err,
            stagekit_core::Error::Scan(ScanError::MissingState { .. })
        ));
    }

    #[test]
    fn test_filename_without_fragments() {
        assert_eq!(StepState::new().filename("", ".tif"), "image.tif");
    }
}
