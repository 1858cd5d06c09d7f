//! Software travel limits
//!
//! Absolute moves that would leave the permitted range are rejected unless
//! they bring an axis that is already outside closer to legality. Jogs are
//! trimmed instead of rejected so a held jog key converges on the limit.

use super::{CoordinateModifier, ModifierContext, ModifierKind, MovePlan};
use stagekit_core::{AxisMap, AxisRange, MotionError, Position, Result};

/// Soft limit modifier
#[derive(Debug, Clone, Default)]
pub struct SoftLimitModifier {
    limits: AxisMap<AxisRange>,
}

impl SoftLimitModifier {
    /// Create with per-axis ranges; axes without a range are unrestricted
    pub fn new(limits: AxisMap<AxisRange>) -> Self {
        Self { limits }
    }

    /// Configured ranges
    pub fn limits(&self) -> &AxisMap<AxisRange> {
        &self.limits
    }
}

impl CoordinateModifier for SoftLimitModifier {
    fn kind(&self) -> ModifierKind {
        ModifierKind::SoftLimit
    }

    fn move_pre(&mut self, ctx: &ModifierContext<'_>, target: &Position) -> Result<MovePlan> {
        for (axis, value) in target.iter() {
            let Some(range) = self.limits.get(&axis) else {
                continue;
            };
            let eps = ctx.epsilon(axis);
            if range.contains(value, eps) {
                continue;
            }
            let now = ctx
                .current
                .get(axis)
                .map(|c| range.violation(c))
                .unwrap_or(0.0);
            if range.violation(value) > now + eps {
                tracing::warn!(
                    "Soft limit rejects {}={:.4} (allowed [{:.4}, {:.4}])",
                    axis,
                    value,
                    range.min,
                    range.max
                );
                return Err(MotionError::AxisExceeded {
                    axis,
                    value,
                    min: range.min,
                    max: range.max,
                }
                .into());
            }
        }
        Ok(MovePlan::direct(target.clone()))
    }

    fn jog_pre(
        &mut self,
        ctx: &ModifierContext<'_>,
        delta: &Position,
        rate: f64,
    ) -> Result<(Position, f64)> {
        let mut trimmed = Position::new();
        let mut dropped = None;
        for (axis, d) in delta.iter() {
            let Some(range) = self.limits.get(&axis) else {
                trimmed.set(axis, d);
                continue;
            };
            let eps = ctx.epsilon(axis);
            let Some(current) = ctx.current.get(axis) else {
                trimmed.set(axis, d);
                continue;
            };
            let end = current + d;

            if range.contains(end, eps) || range.violation(end) <= range.violation(current) {
                trimmed.set(axis, d);
            } else if range.violation(current) <= eps {
                let clipped = range.clamp(end) - current;
                if clipped.abs() > eps {
                    tracing::debug!("Soft limit trims {} jog {:.4} -> {:.4}", axis, d, clipped);
                    trimmed.set(axis, clipped);
                } else {
                    tracing::debug!("Soft limit drops {} jog at bound", axis);
                    dropped.get_or_insert((axis, end, *range));
                }
            } else {
                tracing::debug!(
                    "Soft limit drops {} jog that would worsen a violation",
                    axis
                );
                dropped.get_or_insert((axis, end, *range));
            }
        }

        if let (true, Some((axis, value, range))) = (trimmed.is_empty(), dropped) {
            return Err(MotionError::AxisExceeded {
                axis,
                value,
                min: range.min,
                max: range.max,
            }
            .into());
        }
        Ok((trimmed, rate))
    }
}
