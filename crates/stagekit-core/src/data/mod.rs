//! Data models for axes and positions
//!
//! This module provides:
//! - The closed set of stage axes (X, Y, Z, A, B, C)
//! - Positions as axis-keyed maps in user units (millimeters)
//! - Per-axis ranges used for soft and machine limits

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// A stage axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Axis {
    /// X axis (columns of a mosaic)
    X,
    /// Y axis (rows of a mosaic)
    Y,
    /// Z axis (focus)
    Z,
    /// A axis (4th axis)
    A,
    /// B axis (5th axis)
    B,
    /// C axis (6th axis)
    C,
}

impl Axis {
    /// All axes in canonical order
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C];

    /// Lowercase axis name
    pub fn name(&self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
            Axis::A => "a",
            Axis::B => "b",
            Axis::C => "c",
        }
    }

    /// Uppercase G-code letter for this axis
    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::A => 'A',
            Axis::B => 'B',
            Axis::C => 'C',
        }
    }

    /// Index of the axis in controller reports (X=0 .. C=5)
    pub fn index(&self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::A => 3,
            Axis::B => 4,
            Axis::C => 5,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            "a" => Ok(Axis::A),
            "b" => Ok(Axis::B),
            "c" => Ok(Axis::C),
            other => Err(format!("unknown axis '{}'", other)),
        }
    }
}

// Axes travel as plain strings so they work as map keys in both JSON and TOML.
impl Serialize for Axis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Axis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Set of axes declared by a motion device
pub type AxisSet = BTreeSet<Axis>;

/// Per-axis table (limits, scalars, steps per mm)
pub type AxisMap<T> = BTreeMap<Axis, T>;

/// Position in user units, keyed by axis
///
/// A position produced by the motion core always holds exactly one entry per
/// axis of the active HAL. Requests (moves, jogs) may name a subset of axes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(BTreeMap<Axis, f64>);

impl Position {
    /// Create an empty position
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Create a position from (axis, value) pairs
    pub fn from_pairs<I: IntoIterator<Item = (Axis, f64)>>(pairs: I) -> Self {
        Self(pairs.into_iter().collect())
    }

    /// Create an X/Y position
    pub fn xy(x: f64, y: f64) -> Self {
        Self::from_pairs([(Axis::X, x), (Axis::Y, y)])
    }

    /// Create an X/Y/Z position
    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self::from_pairs([(Axis::X, x), (Axis::Y, y), (Axis::Z, z)])
    }

    /// Position with every axis of `axes` at zero
    pub fn zero(axes: &AxisSet) -> Self {
        Self::from_pairs(axes.iter().map(|a| (*a, 0.0)))
    }

    /// Value for an axis
    pub fn get(&self, axis: Axis) -> Option<f64> {
        self.0.get(&axis).copied()
    }

    /// Set the value for an axis, returning self for chaining
    pub fn with(mut self, axis: Axis, value: f64) -> Self {
        self.set(axis, value);
        self
    }

    /// Set the value for an axis
    pub fn set(&mut self, axis: Axis, value: f64) {
        debug_assert!(value.is_finite(), "position value must be finite: {axis}={value}");
        self.0.insert(axis, value);
    }

    /// Drop an axis from a request
    pub fn remove(&mut self, axis: Axis) -> Option<f64> {
        self.0.remove(&axis)
    }

    /// Whether the axis is present
    pub fn contains(&self, axis: Axis) -> bool {
        self.0.contains_key(&axis)
    }

    /// Number of axes present
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no axis is present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Axes present in this position
    pub fn axes(&self) -> AxisSet {
        self.0.keys().copied().collect()
    }

    /// Iterate (axis, value) pairs in axis order
    pub fn iter(&self) -> impl Iterator<Item = (Axis, f64)> + '_ {
        self.0.iter().map(|(a, v)| (*a, *v))
    }

    /// Mutable iteration over values
    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, Axis, f64> {
        self.0.iter_mut()
    }

    /// Overlay `other` on top of this position
    pub fn merged(&self, other: &Position) -> Position {
        let mut out = self.clone();
        for (axis, value) in other.iter() {
            out.set(axis, value);
        }
        out
    }

    /// Add `delta` to the axes it names; axes missing here are taken as zero
    pub fn offset_by(&self, delta: &Position) -> Position {
        let mut out = self.clone();
        for (axis, d) in delta.iter() {
            let base = self.get(axis).unwrap_or(0.0);
            out.set(axis, base + d);
        }
        out
    }

    /// Component-wise difference `self - other` over the axes of `self`
    pub fn delta_from(&self, other: &Position) -> Position {
        Position::from_pairs(
            self.iter()
                .map(|(axis, v)| (axis, v - other.get(axis).unwrap_or(0.0))),
        )
    }

    /// Apply a function to every value
    pub fn map_values(&self, mut f: impl FnMut(Axis, f64) -> f64) -> Position {
        Position::from_pairs(self.iter().map(|(a, v)| (a, f(a, v))))
    }

    /// Restrict to the given axes
    pub fn restricted_to(&self, axes: &AxisSet) -> Position {
        Position::from_pairs(self.iter().filter(|(a, _)| axes.contains(a)))
    }

    /// Whether the two positions agree on every axis of `self` within `epsilon`
    pub fn approx_eq(&self, other: &Position, epsilon: f64) -> bool {
        self.iter().all(|(axis, v)| {
            other
                .get(axis)
                .is_some_and(|o| (o - v).abs() <= epsilon)
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (axis, value) in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}:{:.4}", axis, value)?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<(Axis, f64)> for Position {
    fn from_iter<T: IntoIterator<Item = (Axis, f64)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}

/// Closed interval on one axis, in user units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// Lower bound
    pub min: f64,
    /// Upper bound
    pub max: f64,
}

impl AxisRange {
    /// Create a range
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Whether `value` lies inside the range, allowing `epsilon` of slack
    pub fn contains(&self, value: f64, epsilon: f64) -> bool {
        value >= self.min - epsilon && value <= self.max + epsilon
    }

    /// Distance by which `value` lies outside the range (0 when inside)
    pub fn violation(&self, value: f64) -> f64 {
        if value > self.max {
            value - self.max
        } else if value < self.min {
            self.min - value
        } else {
            0.0
        }
    }

    /// Clamp a value into the range
    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}
