//! Capture: exactly one imager request per leaf, retried on timeout

use super::state::{keys, StageItem, StepState, StepValue};
use super::{OncePerBranch, ScanStage};
use crate::control::ScanControl;
use crate::imager::SharedImager;
use crate::metadata::{ScanMetadata, StageSummary};
use stagekit_core::{Error, ImagerError, Result, ScanError};
use stagekit_settings::ImagerSettings;
use std::sync::Arc;
use std::time::Duration;

/// Captures one frame per leaf
pub struct CaptureStage {
    imager: SharedImager,
    control: ScanControl,
    timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
    expected_size: Option<(u32, u32)>,
    once: OncePerBranch,
    captured: usize,
    retries: usize,
}

impl CaptureStage {
    /// Capture with the timeouts and size check from the imager settings
    pub fn new(settings: &ImagerSettings, imager: SharedImager, control: ScanControl) -> Self {
        Self {
            imager,
            control,
            timeout: Duration::from_millis(settings.capture_timeout_ms),
            max_attempts: settings.max_capture_attempts.max(1),
            backoff: Duration::from_millis(settings.retry_backoff_ms),
            expected_size: settings
                .check_size
                .then(|| crate::imager::scaled_size(settings)),
            once: OncePerBranch::default(),
            captured: 0,
            retries: 0,
        }
    }

    fn capture(&mut self) -> Result<crate::imager::Frame> {
        let mut backoff = self.backoff;
        for attempt in 1..=self.max_attempts {
            let result = self.imager.lock().get(self.timeout);
            match result {
                Ok(frame) => return Ok(frame),
                Err(Error::Imager(ImagerError::Timeout { timeout_ms })) => {
                    tracing::warn!(
                        "Capture attempt {}/{} timed out after {}ms",
                        attempt,
                        self.max_attempts,
                        timeout_ms
                    );
                    if attempt < self.max_attempts {
                        self.retries += 1;
                        self.control.sleep(backoff)?;
                        backoff *= 2;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(ScanError::ImageTimeout {
            attempts: self.max_attempts,
        }
        .into())
    }
}

impl ScanStage for CaptureStage {
    fn name(&self) -> &str {
        "capture"
    }

    fn scan_end(&mut self, metadata: &mut ScanMetadata) -> Result<()> {
        metadata.set_stage(StageSummary {
            stage: self.name().to_string(),
            images_expected: None,
            details: serde_json::json!({
                "captured": self.captured,
                "retries": self.retries,
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

        let frame = self.capture()?;
        if let Some(expected) = self.expected_size {
            let actual = frame.dimensions();
            if actual != expected {
                return Err(ImagerError::SizeMismatch { expected, actual }.into());
            }
        }
        self.captured += 1;
        Ok(Some(
            StageItem::new().with(keys::FRAME, StepValue::Frame(Arc::new(frame))),
        ))
    }
}
