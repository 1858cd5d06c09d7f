//! GRBL `$$` settings
//!
//! Numeric settings read back from the controller at connect time. The
//! per-axis kinematic limits come from the `$100`-`$132` blocks.

use serde::{Deserialize, Serialize};
use stagekit_core::{Axis, AxisMap, AxisRange, AxisSet};
use std::collections::BTreeMap;

/// Base setting numbers for the per-axis blocks
const STEPS_PER_MM: u16 = 100;
const MAX_RATE: u16 = 110;
const ACCELERATION: u16 = 120;
const MAX_TRAVEL: u16 = 130;

/// Settings reported by `$$`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrblSettings {
    values: BTreeMap<u16, String>,
}

impl GrblSettings {
    /// Create an empty settings table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `$n=value` pair
    pub fn insert(&mut self, number: u16, value: impl Into<String>) {
        self.values.insert(number, value.into());
    }

    /// Raw value of a setting
    pub fn get(&self, number: u16) -> Option<&str> {
        self.values.get(&number).map(String::as_str)
    }

    /// Numeric value of a setting
    pub fn numeric(&self, number: u16) -> Option<f64> {
        self.get(number)?.trim().parse().ok()
    }

    /// Number of settings recorded
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Axes with a steps-per-mm entry
    pub fn axes(&self) -> AxisSet {
        Axis::ALL
            .iter()
            .copied()
            .filter(|axis| self.numeric(STEPS_PER_MM + axis.index() as u16).is_some())
            .collect()
    }

    /// `$100+i`: motor steps per millimetre
    pub fn steps_per_mm(&self) -> AxisMap<f64> {
        self.per_axis(STEPS_PER_MM, |v| v)
    }

    /// `$110+i`: maximum rate, converted from mm/min to mm/s
    pub fn max_velocities(&self) -> AxisMap<f64> {
        self.per_axis(MAX_RATE, |v| v / 60.0)
    }

    /// `$120+i`: acceleration in mm/s²
    pub fn max_accelerations(&self) -> AxisMap<f64> {
        self.per_axis(ACCELERATION, |v| v)
    }

    /// `$130+i`: maximum travel; GRBL homes to the positive end so
    /// machine coordinates span `[-travel, 0]`
    pub fn machine_limits(&self) -> AxisMap<AxisRange> {
        self.per_axis(MAX_TRAVEL, |v| AxisRange::new(-v.abs(), 0.0))
    }

    fn per_axis<T>(&self, base: u16, f: impl Fn(f64) -> T) -> AxisMap<T> {
        self.axes()
            .into_iter()
            .filter_map(|axis| {
                self.numeric(base + axis.index() as u16)
                    .map(|value| (axis, f(value)))
            })
            .collect()
    }
}
