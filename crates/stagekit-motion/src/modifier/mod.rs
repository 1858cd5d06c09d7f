//! Coordinate modifier chain
//!
//! A modifier sits between the user and the device driver and may rewrite a
//! move target, add a prelude move, trim a jog or transform reported
//! positions. The HAL owns the chain in a fixed order:
//!
//! ```text
//! user -> SoftLimit -> Backlash -> Scalar -> driver
//! ```
//!
//! Pre-move hooks run front to back and post-move hooks back to front. A
//! prelude move issued by one modifier passes through every modifier behind
//! it before it reaches the driver.

pub mod backlash;
pub mod scalar;
pub mod soft_limit;

pub use backlash::BacklashModifier;
pub use scalar::ScalarModifier;
pub use soft_limit::SoftLimitModifier;

use serde::{Deserialize, Serialize};
use stagekit_core::{Axis, AxisMap, AxisRange, Position, Result};
use stagekit_settings::{ModifierFlags, MotionSettings};
use std::fmt;

/// Identifies a modifier in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierKind {
    /// Software travel limits
    SoftLimit,
    /// Backlash compensation
    Backlash,
    /// Per-axis scaling
    Scalar,
}

impl ModifierKind {
    /// Chain order
    pub const CHAIN: [ModifierKind; 3] = [
        ModifierKind::SoftLimit,
        ModifierKind::Backlash,
        ModifierKind::Scalar,
    ];

    /// Whether this modifier is enabled in `flags`
    pub fn enabled_in(&self, flags: &ModifierFlags) -> bool {
        match self {
            ModifierKind::SoftLimit => flags.soft_limits,
            ModifierKind::Backlash => flags.backlash,
            ModifierKind::Scalar => flags.scalar,
        }
    }

    /// Enable or disable this modifier in `flags`
    pub fn set_in(&self, flags: &mut ModifierFlags, enabled: bool) {
        match self {
            ModifierKind::SoftLimit => flags.soft_limits = enabled,
            ModifierKind::Backlash => flags.backlash = enabled,
            ModifierKind::Scalar => flags.scalar = enabled,
        }
    }
}

impl fmt::Display for ModifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifierKind::SoftLimit => write!(f, "soft_limit"),
            ModifierKind::Backlash => write!(f, "backlash"),
            ModifierKind::Scalar => write!(f, "scalar"),
        }
    }
}

/// What a modifier sees of the HAL while running a hook
#[derive(Debug, Clone, Copy)]
pub struct ModifierContext<'a> {
    /// Position in this modifier's input frame
    pub current: &'a Position,
    /// Smallest distinguishable move per axis, in user units
    pub epsilon: &'a AxisMap<f64>,
    /// Active software travel limits; prelude moves must stay inside them
    pub limits: Option<&'a AxisMap<AxisRange>>,
}

impl ModifierContext<'_> {
    /// Epsilon for one axis
    pub fn epsilon(&self, axis: Axis) -> f64 {
        self.epsilon.get(&axis).copied().unwrap_or(DEFAULT_EPSILON)
    }

    /// Travel limit for one axis, if soft limits are active
    pub fn limit(&self, axis: Axis) -> Option<AxisRange> {
        self.limits.and_then(|limits| limits.get(&axis).copied())
    }
}

/// Epsilon used when the device does not report a step resolution
pub const DEFAULT_EPSILON: f64 = 1e-4;

/// Result of a pre-move hook
#[derive(Debug, Clone, PartialEq)]
pub struct MovePlan {
    /// Moves to run first, in the modifier's output frame
    pub prelude: Vec<Position>,
    /// The final target in the modifier's output frame
    pub target: Position,
}

impl MovePlan {
    /// A plan with no prelude
    pub fn direct(target: Position) -> Self {
        Self {
            prelude: Vec::new(),
            target,
        }
    }
}

/// One link of the modifier chain
pub trait CoordinateModifier: Send {
    /// Which modifier this is
    fn kind(&self) -> ModifierKind;

    /// Rewrite an absolute move, possibly adding prelude moves
    fn move_pre(&mut self, ctx: &ModifierContext<'_>, target: &Position) -> Result<MovePlan>;

    /// Called after the move (and its prelude) finished or failed
    fn move_post(&mut self, _target: &Position, _succeeded: bool) {}

    /// Rewrite a relative jog and its rate
    fn jog_pre(
        &mut self,
        ctx: &ModifierContext<'_>,
        delta: &Position,
        rate: f64,
    ) -> Result<(Position, f64)>;

    /// Called after a jog was accepted by the layers below
    fn jog_post(&mut self, _delta: &Position) {}

    /// Map a position from the output frame back into the input frame
    fn pos_out(&self, position: &Position) -> Position {
        position.clone()
    }

    /// Map a distance-like per-axis quantity from the output frame back into
    /// the input frame (velocities, accelerations, epsilons)
    fn magnitude_out(&self, _axis: Axis, value: f64) -> f64 {
        value
    }

    /// Forget tracked state (after homing, estop or re-enabling)
    fn reset(&mut self) {}
}

/// Build the full chain from settings in its fixed order
///
/// Every modifier is present even if disabled so it can be toggled later.
pub fn build_chain(settings: &MotionSettings) -> Vec<Box<dyn CoordinateModifier>> {
    ModifierKind::CHAIN
        .iter()
        .map(|kind| -> Box<dyn CoordinateModifier> {
            match kind {
                ModifierKind::SoftLimit => {
                    Box::new(SoftLimitModifier::new(settings.soft_limits.clone()))
                }
                ModifierKind::Backlash => Box::new(BacklashModifier::from_settings(settings)),
                ModifierKind::Scalar => Box::new(ScalarModifier::new(settings.scalars.clone())),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order_is_fixed() {
        let chain = build_chain(&MotionSettings::default());
        let kinds: Vec<_> = chain.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, ModifierKind::CHAIN.to_vec());
    }

    #[test]
    fn test_flags_toggle() {
        let mut flags = ModifierFlags::default();
        ModifierKind::Backlash.set_in(&mut flags, false);
        assert!(!ModifierKind::Backlash.enabled_in(&flags));
        assert!(ModifierKind::Scalar.enabled_in(&flags));
    }
}
