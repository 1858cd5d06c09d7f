//! GRBL status report parsing
//!
//! Parses the body of a `<...>` real-time status report: machine state,
//! machine and work positions, work coordinate offset and feed rate.

use serde::{Deserialize, Serialize};
use stagekit_core::{Axis, AxisSet, Position};
use std::fmt;

/// Controller state reported first in every status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    /// Ready for commands
    Idle,
    /// Executing motion
    Run,
    /// Feed hold
    Hold,
    /// Executing a jog
    Jog,
    /// Locked by an alarm
    Alarm,
    /// Safety door open
    Door,
    /// Check mode
    Check,
    /// Homing cycle
    Home,
    /// Sleep mode
    Sleep,
    /// Anything else
    Unknown(String),
}

impl MachineState {
    /// Parse the state field (sub-states like `Hold:0` are ignored)
    pub fn parse(field: &str) -> Self {
        let name = field.split(':').next().unwrap_or("").trim();
        match name {
            "Idle" => Self::Idle,
            "Run" => Self::Run,
            "Hold" => Self::Hold,
            "Jog" => Self::Jog,
            "Alarm" => Self::Alarm,
            "Door" => Self::Door,
            "Check" => Self::Check,
            "Home" => Self::Home,
            "Sleep" => Self::Sleep,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether motion is in progress
    pub fn is_moving(&self) -> bool {
        matches!(self, Self::Run | Self::Jog | Self::Home)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(s) => write!(f, "{}", s),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Parsed status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Machine state
    pub state: MachineState,
    /// Machine position coordinates in report order (X, Y, Z, A, B, C)
    pub machine_pos: Option<Vec<f64>>,
    /// Work position coordinates
    pub work_pos: Option<Vec<f64>>,
    /// Work coordinate offset, sent periodically
    pub work_coord_offset: Option<Vec<f64>>,
    /// Current feed rate (mm/min)
    pub feed_rate: Option<f64>,
}

impl StatusReport {
    /// Parse a report body (without the angle brackets)
    pub fn parse(body: &str) -> Option<Self> {
        let mut parts = body.split('|');
        let state = MachineState::parse(parts.next()?);

        let mut report = Self {
            state,
            machine_pos: None,
            work_pos: None,
            work_coord_offset: None,
            feed_rate: None,
        };

        for part in parts {
            let part = part.trim();
            if let Some(pos) = part.strip_prefix("MPos:") {
                report.machine_pos = Some(parse_coords(pos)?);
            } else if let Some(pos) = part.strip_prefix("WPos:") {
                report.work_pos = Some(parse_coords(pos)?);
            } else if let Some(offset) = part.strip_prefix("WCO:") {
                report.work_coord_offset = parse_coords(offset);
            } else if let Some(fs) = part.strip_prefix("FS:") {
                report.feed_rate = fs.split(',').next().and_then(|f| f.trim().parse().ok());
            } else if let Some(f) = part.strip_prefix("F:") {
                report.feed_rate = f.trim().parse().ok();
            }
        }

        Some(report)
    }

    /// Machine position for `axes`, deriving it from WPos + WCO when needed
    pub fn machine_position(&self, axes: &AxisSet, last_wco: Option<&[f64]>) -> Option<Position> {
        let coords: Vec<f64> = match (&self.machine_pos, &self.work_pos) {
            (Some(mpos), _) => mpos.clone(),
            (None, Some(wpos)) => {
                let wco = self.work_coord_offset.as_deref().or(last_wco)?;
                wpos.iter()
                    .zip(wco.iter().chain(std::iter::repeat(&0.0)))
                    .map(|(w, o)| w + o)
                    .collect()
            }
            (None, None) => return None,
        };
        to_position(&coords, axes)
    }
}

/// Map report-ordered coordinates onto axes
pub fn to_position(coords: &[f64], axes: &AxisSet) -> Option<Position> {
    let mut position = Position::new();
    for axis in axes {
        position.set(*axis, *coords.get(axis.index())?);
    }
    Some(position)
}

fn parse_coords(text: &str) -> Option<Vec<f64>> {
    let coords: Vec<f64> = text
        .split(',')
        .map(|s| s.trim().parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    if coords.is_empty() || coords.len() > Axis::ALL.len() {
        return None;
    }
    Some(coords)
}
