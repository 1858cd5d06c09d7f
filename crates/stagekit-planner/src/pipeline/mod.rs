//! # Capture Pipeline
//!
//! A scan is an ordered list of stages driven depth-first. Each stage yields
//! a finite sequence of items per branch; every item is merged into a
//! derived [`StepState`] and the remaining stages run to completion beneath
//! it before the stage yields again. With an empty stage list the state is a
//! leaf: one captured and saved image.
//!
//! Each stage therefore multiplies the work of all stages after it:
//! `points × planes × exposures` leaves.

pub mod capture;
pub mod drift;
pub mod hdr;
pub mod kinematics;
pub mod points;
pub mod save;
pub mod stacker;
pub mod state;

pub use capture::CaptureStage;
pub use drift::{sharpness, DriftTracker, StackDriftStage};
pub use hdr::HdrStage;
pub use kinematics::{KinematicsStage, SettleClock};
pub use points::PointGenerator;
pub use save::SaveStage;
pub use stacker::FocusStacker;
pub use state::{keys, StageItem, StepState, StepValue};

use crate::control::ScanControl;
use crate::metadata::ScanMetadata;
use stagekit_core::{Error, Position, Result, ScanError};
use stagekit_motion::MotionHandle;
use std::sync::Arc;

/// One stage of the capture pipeline
pub trait ScanStage: Send {
    /// Stable name used in logs and metadata
    fn name(&self) -> &str;

    /// Items yielded per branch, or `None` for stages that do not multiply
    fn images_expected(&self) -> Option<usize> {
        None
    }

    /// One-time setup before the first branch
    fn scan_begin(&mut self, _metadata: &mut ScanMetadata) -> Result<()> {
        Ok(())
    }

    /// One-time teardown; runs even when the scan failed
    fn scan_end(&mut self, _metadata: &mut ScanMetadata) -> Result<()> {
        Ok(())
    }

    /// Start a new branch under `state`
    fn produce(&mut self, state: &StepState) -> Result<()>;

    /// Next item of the current branch, `None` once exhausted
    fn next_item(&mut self, state: &StepState) -> Result<Option<StageItem>>;
}

/// Stage movement as seen by the pipeline
pub trait StageMover: Send + Sync {
    /// Blocking absolute move; axes not named keep their position
    fn move_to(&self, target: &Position) -> Result<()>;

    /// Current stage position
    fn position(&self) -> Result<Position>;

    /// Run the homing cycle
    fn home(&self) -> Result<()>;
}

impl StageMover for MotionHandle {
    fn move_to(&self, target: &Position) -> Result<()> {
        Ok(self.move_absolute(target)?)
    }

    fn position(&self) -> Result<Position> {
        Ok(self.query_position()?)
    }

    fn home(&self) -> Result<()> {
        Ok(MotionHandle::home(self)?)
    }
}

/// Mover shared by the stages of one pipeline
pub type SharedMover = Arc<dyn StageMover>;

/// Product of the stage multipliers
pub fn images_expected(stages: &[Box<dyn ScanStage>]) -> usize {
    stages
        .iter()
        .filter_map(|stage| stage.images_expected())
        .product()
}

/// Drive `stages` depth-first under `state`, calling `leaf` once per image
///
/// The control token is checked before every item. A stage that yields
/// nothing for a branch fails the scan with [`ScanError::EmptyStage`].
pub fn run_pipeline(
    stages: &mut [Box<dyn ScanStage>],
    state: StepState,
    control: &ScanControl,
    leaf: &mut dyn FnMut(StepState) -> Result<()>,
) -> Result<()> {
    let Some((head, rest)) = stages.split_first_mut() else {
        return leaf(state);
    };

    head.produce(&state)?;
    let mut produced = 0usize;
    loop {
        control.checkpoint()?;
        let Some(item) = head.next_item(&state)? else {
            break;
        };
        produced += 1;
        run_pipeline(rest, state.derive(item), control, leaf)?;
    }

    if produced == 0 {
        return Err(Error::from(ScanError::EmptyStage {
            stage: head.name().to_string(),
        }));
    }
    Ok(())
}

/// Yields exactly one item per branch; for stages that act once per leaf
#[derive(Debug, Default)]
pub(crate) struct OncePerBranch {
    done: bool,
}

impl OncePerBranch {
    pub(crate) fn reset(&mut self) {
        self.done = false;
    }

    /// True the first time it is called after a reset
    pub(crate) fn take(&mut self) -> bool {
        !std::mem::replace(&mut self.done, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields `count` indexed items per branch and logs what it sees
    struct Counter {
        name: String,
        count: usize,
        cursor: usize,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl Counter {
        fn boxed(
            name: &str,
            count: usize,
            log: &Arc<parking_lot::Mutex<Vec<String>>>,
        ) -> Box<dyn ScanStage> {
            Box::new(Self {
                name: name.to_string(),
                count,
                cursor: 0,
                log: log.clone(),
            })
        }
    }

    impl ScanStage for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        fn images_expected(&self) -> Option<usize> {
            Some(self.count)
        }

        fn produce(&mut self, _state: &StepState) -> Result<()> {
            self.cursor = 0;
            Ok(())
        }

        fn next_item(&mut self, _state: &StepState) -> Result<Option<StageItem>> {
            if self.cursor >= self.count {
                return Ok(None);
            }
            let i = self.cursor;
            self.cursor += 1;
            self.log.lock().push(format!("{}{}", self.name, i));
            Ok(Some(
                StageItem::new()
                    .with(&self.name, StepValue::Index(i))
                    .fragment(format!("{}{}", self.name, i)),
            ))
        }
    }

    #[test]
    fn test_depth_first_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut stages = vec![Counter::boxed("p", 2, &log), Counter::boxed("z", 2, &log)];
        let mut leaves = Vec::new();
        run_pipeline(
            &mut stages,
            StepState::new(),
            &ScanControl::new(),
            &mut |state| {
                leaves.push(state.filename("", "png"));
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(*log.lock(), vec!["p0", "z0", "z1", "p1", "z0", "z1"]);
        assert_eq!(
            leaves,
            vec!["p0_z0.png", "p0_z1.png", "p1_z0.png", "p1_z1.png"]
        );
    }

    #[test]
    fn test_multiplicity_is_product() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut stages = vec![
            Counter::boxed("p", 6, &log),
            Counter::boxed("z", 5, &log),
            Counter::boxed("h", 3, &log),
        ];
        assert_eq!(images_expected(&stages), 90);

        let mut leaves = 0;
        run_pipeline(
            &mut stages,
            StepState::new(),
            &ScanControl::new(),
            &mut |_| {
                leaves += 1;
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(leaves, 90);
    }

    #[test]
    fn test_empty_stage_is_an_error() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut stages = vec![Counter::boxed("p", 2, &log), Counter::boxed("z", 0, &log)];
        let err = run_pipeline(
            &mut stages,
            StepState::new(),
            &ScanControl::new(),
            &mut |_| Ok(()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Scan(ScanError::EmptyStage { ref stage }) if stage == "z"
        ));
    }

    #[test]
    fn test_stop_checked_between_items() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut stages = vec![Counter::boxed("p", 4, &log)];
        let control = ScanControl::new();
        let mut leaves = 0;
        let err = run_pipeline(&mut stages, StepState::new(), &control, &mut |_| {
            leaves += 1;
            if leaves == 2 {
                control.stop();
            }
            Ok(())
        })
        .unwrap_err();
        assert!(err.is_stopped());
        assert_eq!(leaves, 2);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_once_per_branch() {
        let mut once = OncePerBranch::default();
        assert!(once.take());
        assert!(!once.take());
        once.reset();
        assert!(once.take());
    }
}
