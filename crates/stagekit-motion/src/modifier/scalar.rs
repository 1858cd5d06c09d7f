//! Per-axis scaling between user and device units

use super::{CoordinateModifier, ModifierContext, ModifierKind, MovePlan};
use stagekit_core::{Axis, AxisMap, Position, Result};

/// Scalar modifier: `device = user * scalar`
#[derive(Debug, Clone, Default)]
pub struct ScalarModifier {
    scalars: AxisMap<f64>,
}

impl ScalarModifier {
    /// Create from a scalar table; missing axes scale by 1
    pub fn new(scalars: AxisMap<f64>) -> Self {
        Self { scalars }
    }

    /// Scalar for one axis
    pub fn scalar(&self, axis: Axis) -> f64 {
        self.scalars.get(&axis).copied().unwrap_or(1.0)
    }

    fn to_device(&self, position: &Position) -> Position {
        position.map_values(|axis, v| v * self.scalar(axis))
    }
}

impl CoordinateModifier for ScalarModifier {
    fn kind(&self) -> ModifierKind {
        ModifierKind::Scalar
    }

    fn move_pre(&mut self, _ctx: &ModifierContext<'_>, target: &Position) -> Result<MovePlan> {
        Ok(MovePlan::direct(self.to_device(target)))
    }

    fn jog_pre(
        &mut self,
        _ctx: &ModifierContext<'_>,
        delta: &Position,
        rate: f64,
    ) -> Result<(Position, f64)> {
        let factor = delta
            .iter()
            .map(|(axis, _)| self.scalar(axis).abs())
            .fold(f64::INFINITY, f64::min);
        let factor = if factor.is_finite() { factor } else { 1.0 };
        Ok((self.to_device(delta), rate * factor))
    }

    fn pos_out(&self, position: &Position) -> Position {
        position.map_values(|axis, v| v / self.scalar(axis))
    }

    fn magnitude_out(&self, axis: Axis, value: f64) -> f64 {
        value / self.scalar(axis).abs()
    }
}
