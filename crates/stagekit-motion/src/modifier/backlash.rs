//! Backlash compensation
//!
//! Each compensated axis has a slack distance `b` and an approach direction
//! `d`. A move only lands precisely when its final travel is in `d` and at
//! least `b` long, or when the slack has already been taken up by a previous
//! move in `d`. Any other move is preceded by an overshoot to `target - d*b`.
//! The overshoot never leaves the active travel limits; an axis whose
//! overshoot had to be clamped is left uncompensated.

use super::{CoordinateModifier, ModifierContext, ModifierKind, MovePlan};
use stagekit_core::{Axis, AxisMap, AxisSet, Position, Result};
use stagekit_settings::{CompensationDirection, MotionSettings};

/// Slack configuration for one axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BacklashAxis {
    /// Slack distance in user units
    pub distance: f64,
    /// Approach direction
    pub direction: CompensationDirection,
}

/// Backlash modifier
#[derive(Debug, Clone, Default)]
pub struct BacklashModifier {
    axes: AxisMap<BacklashAxis>,
    compensated: AxisMap<bool>,
    pending: AxisSet,
    clamped: AxisSet,
}

impl BacklashModifier {
    /// Create from per-axis slack settings
    pub fn new(axes: AxisMap<BacklashAxis>) -> Self {
        Self {
            axes,
            compensated: AxisMap::new(),
            pending: AxisSet::new(),
            clamped: AxisSet::new(),
        }
    }

    /// Create from the motion settings section; axes without a distance are skipped
    pub fn from_settings(settings: &MotionSettings) -> Self {
        let axes = settings
            .backlash
            .iter()
            .filter(|(_, distance)| **distance > 0.0)
            .map(|(axis, distance)| {
                let direction = settings
                    .backlash_compensation
                    .get(axis)
                    .copied()
                    .unwrap_or_default();
                (
                    *axis,
                    BacklashAxis {
                        distance: *distance,
                        direction,
                    },
                )
            })
            .collect();
        Self::new(axes)
    }

    /// Whether the slack on `axis` is known to be taken up
    pub fn is_compensated(&self, axis: Axis) -> bool {
        self.compensated.get(&axis).copied().unwrap_or(false)
    }
}

impl CoordinateModifier for BacklashModifier {
    fn kind(&self) -> ModifierKind {
        ModifierKind::Backlash
    }

    fn move_pre(&mut self, ctx: &ModifierContext<'_>, target: &Position) -> Result<MovePlan> {
        self.pending.clear();
        self.clamped.clear();
        let mut overshoot = target.clone();
        let mut needs_prelude = false;

        for (axis, value) in target.iter() {
            let Some(slack) = self.axes.get(&axis) else {
                continue;
            };
            let Some(current) = ctx.current.get(axis) else {
                continue;
            };
            let eps = ctx.epsilon(axis);
            let delta = value - current;
            if delta.abs() <= eps {
                continue;
            }
            self.pending.insert(axis);

            let sign = slack.direction.sign();
            let with_direction = delta * sign > 0.0;
            if with_direction && (self.is_compensated(axis) || delta.abs() >= slack.distance) {
                continue;
            }
            let wanted = value - sign * slack.distance;
            let reachable = match ctx.limit(axis) {
                Some(range) => range.clamp(wanted),
                None => wanted,
            };
            if (reachable - wanted).abs() > eps {
                tracing::debug!(
                    "Backlash overshoot on {} clamped to {:.4} by travel limits",
                    axis,
                    reachable
                );
                self.clamped.insert(axis);
            }
            if (reachable - value).abs() <= eps || (reachable - current).abs() <= eps {
                continue;
            }
            overshoot.set(axis, reachable);
            needs_prelude = true;
        }

        if needs_prelude {
            tracing::debug!("Backlash prelude move to {}", overshoot);
            Ok(MovePlan {
                prelude: vec![overshoot],
                target: target.clone(),
            })
        } else {
            Ok(MovePlan::direct(target.clone()))
        }
    }

    fn move_post(&mut self, _target: &Position, succeeded: bool) {
        let clamped = std::mem::take(&mut self.clamped);
        for axis in std::mem::take(&mut self.pending) {
            self.compensated
                .insert(axis, succeeded && !clamped.contains(&axis));
        }
    }

    fn jog_pre(
        &mut self,
        _ctx: &ModifierContext<'_>,
        delta: &Position,
        rate: f64,
    ) -> Result<(Position, f64)> {
        Ok((delta.clone(), rate))
    }

    fn jog_post(&mut self, delta: &Position) {
        for (axis, d) in delta.iter() {
            let Some(slack) = self.axes.get(&axis) else {
                continue;
            };
            if d * slack.direction.sign() < 0.0 {
                self.compensated.insert(axis, false);
            } else if d.abs() >= slack.distance {
                self.compensated.insert(axis, true);
            }
        }
    }

    fn reset(&mut self) {
        self.compensated.clear();
        self.pending.clear();
        self.clamped.clear();
    }
}
