//! Configuration for StageKit
//!
//! One explicit document built once at startup and handed by reference to the
//! motion HAL, the command thread, the scan geometry and the pipeline stages.
//! Supports JSON and TOML file formats; every section has serde defaults so a
//! document only needs to name what it changes.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (driver kind, port, protocol timeouts)
//! - Motion settings (axes, backlash, soft limits, scalars, worker timing)
//! - Imager settings (field of view, capture timeouts)
//! - Scan settings (bounds, overlap, stacking, HDR, settle times, output)

use serde::{Deserialize, Serialize};
use stagekit_core::{Axis, AxisRange, ConfigurationError, Position, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Imager property values keyed by property name (e.g. `exposure_us`)
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

/// Which motion device driver to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-process simulated stage
    #[default]
    Simulated,
    /// GRBL controller on a serial port
    Grbl,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Grbl => write!(f, "grbl"),
        }
    }
}

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Motion driver kind
    pub driver: DriverKind,
    /// Serial port name (e.g. "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Response timeout for a single controller command in milliseconds
    pub timeout_ms: u64,
    /// How long to wait for the boot banner after a reset
    pub resync_timeout_ms: u64,
    /// How long a blocking move may take before it is considered lost
    pub move_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            driver: DriverKind::Simulated,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            timeout_ms: 2000,
            resync_timeout_ms: 5000,
            move_timeout_ms: 120_000,
        }
    }
}

/// Direction from which backlash compensated moves approach their target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompensationDirection {
    /// Final approach travels toward +infinity
    #[default]
    Positive,
    /// Final approach travels toward -infinity
    Negative,
}

impl CompensationDirection {
    /// +1.0 or -1.0
    pub fn sign(&self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }
}

/// Which coordinate modifiers are active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModifierFlags {
    /// Soft limit checking and jog trimming
    pub soft_limits: bool,
    /// Backlash compensation
    pub backlash: bool,
    /// Per-axis user/device scaling
    pub scalar: bool,
}

impl Default for ModifierFlags {
    fn default() -> Self {
        Self {
            soft_limits: true,
            backlash: true,
            scalar: true,
        }
    }
}

/// Automatic device re-initialization after a critical fault
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootSettings {
    /// Try to re-create the device after `MotionCritical`
    pub enabled: bool,
    /// Delay between attempts in milliseconds
    pub period_ms: u64,
}

impl Default for RebootSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            period_ms: 5000,
        }
    }
}

/// Motion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    /// Axes the stage declares
    pub axes: Vec<Axis>,
    /// Backlash distance per axis in mm
    pub backlash: BTreeMap<Axis, f64>,
    /// Approach direction per axis for backlash compensation
    pub backlash_compensation: BTreeMap<Axis, CompensationDirection>,
    /// Software travel limits per axis
    pub soft_limits: BTreeMap<Axis, AxisRange>,
    /// User-to-device multiplier per axis
    pub scalars: BTreeMap<Axis, f64>,
    /// Enabled modifiers
    pub modifiers: ModifierFlags,
    /// Equivalence threshold in device steps
    pub epsilon_steps: f64,
    /// Status polling period of the motion worker in milliseconds
    pub status_period_ms: u64,
    /// Cadence at which fractional jogs are expected to be re-issued
    pub jog_period_ms: u64,
    /// How long a caller waits for a queued command to complete
    pub command_timeout_ms: u64,
    /// Re-initialization after device loss
    pub reboot: RebootSettings,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            axes: vec![Axis::X, Axis::Y, Axis::Z],
            backlash: BTreeMap::new(),
            backlash_compensation: BTreeMap::new(),
            soft_limits: BTreeMap::new(),
            scalars: BTreeMap::new(),
            modifiers: ModifierFlags::default(),
            epsilon_steps: 0.5,
            status_period_ms: 200,
            jog_period_ms: 200,
            command_timeout_ms: 120_000,
            reboot: RebootSettings::default(),
        }
    }
}

/// Imager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagerSettings {
    /// Field of view along X in mm; Y follows from the sensor aspect ratio
    pub view_x_mm: f64,
    /// Sensor width in pixels (simulated imager and offline planning)
    pub width_px: u32,
    /// Sensor height in pixels (simulated imager and offline planning)
    pub height_px: u32,
    /// Size of delivered frames relative to the sensor size
    pub scale: f64,
    /// Verify captured frames against the scaled sensor size
    pub check_size: bool,
    /// Timeout for one capture in milliseconds
    pub capture_timeout_ms: u64,
    /// Attempts before a capture timeout fails the scan
    pub max_capture_attempts: u32,
    /// Initial retry backoff, doubled after every timeout
    pub retry_backoff_ms: u64,
}

impl Default for ImagerSettings {
    fn default() -> Self {
        Self {
            view_x_mm: 1.0,
            width_px: 640,
            height_px: 480,
            scale: 1.0,
            check_size: false,
            capture_timeout_ms: 5000,
            max_capture_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

/// Requested scan area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanBounds {
    /// Rectangle given by two opposite corners
    Contour {
        /// First corner
        start: Position,
        /// Opposite corner
        end: Position,
    },
    /// Skewed grid from three reference image positions (optionally with Z)
    ThreeCorner {
        /// Lower-left image position
        ll: Position,
        /// Upper-left image position
        ul: Position,
        /// Lower-right image position
        lr: Position,
    },
}

impl Default for ScanBounds {
    fn default() -> Self {
        ScanBounds::Contour {
            start: Position::xy(0.0, 0.0),
            end: Position::xy(0.0, 0.0),
        }
    }
}

/// Inclusive row/column rectangle skipped during a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionZone {
    /// First excluded row
    pub row_min: usize,
    /// Last excluded row
    pub row_max: usize,
    /// First excluded column
    pub col_min: usize,
    /// Last excluded column
    pub col_max: usize,
}

impl ExclusionZone {
    /// Whether the cell lies inside the zone
    pub fn contains(&self, row: usize, col: usize) -> bool {
        (self.row_min..=self.row_max).contains(&row) && (self.col_min..=self.col_max).contains(&col)
    }
}

/// Focus stacking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackSettings {
    /// Number of focal planes
    pub images: usize,
    /// Total Z distance covered by the stack in mm
    pub distance: f64,
    /// Track focus drift from stack sharpness
    pub drift_correction: bool,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            images: 1,
            distance: 0.0,
            drift_correction: false,
        }
    }
}

/// HDR bracketing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HdrSettings {
    /// Property sets applied in order, one capture each
    pub properties: Vec<PropertyMap>,
}

/// Settle times before capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KinematicsSettings {
    /// Time after the last move before capturing
    pub motion_settle_ms: u64,
    /// Time after the last imager property change before capturing
    pub property_settle_ms: u64,
    /// Take and discard one frame to flush the imager pipeline
    pub dummy_capture: bool,
}

impl Default for KinematicsSettings {
    fn default() -> Self {
        Self {
            motion_settle_ms: 100,
            property_settle_ms: 0,
            dummy_capture: false,
        }
    }
}

/// Where and how images are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Output directory
    pub directory: PathBuf,
    /// Prefix for every image file name
    pub prefix: String,
    /// Image file extension (selects the encoder)
    pub extension: String,
    /// Write image files (metadata is always written)
    pub write_images: bool,
    /// Metadata file name inside `directory`
    pub metadata_file: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("scan"),
            prefix: String::new(),
            extension: "png".to_string(),
            write_images: true,
            metadata_file: "scan.json".to_string(),
        }
    }
}

/// Scan settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Area to cover
    pub bounds: ScanBounds,
    /// Fraction of each image shared with its neighbour, in [0, 1)
    pub overlap: f64,
    /// Extra margin added on every side of a contour, in mm
    pub border: f64,
    /// Reverse every other row
    pub serpentine: bool,
    /// Cells to skip
    pub exclusions: Vec<ExclusionZone>,
    /// Focus stacking, if any
    pub stacking: Option<StackSettings>,
    /// HDR bracketing, if any
    pub hdr: Option<HdrSettings>,
    /// Settle times
    pub kinematics: KinematicsSettings,
    /// Output
    pub output: OutputSettings,
    /// Ask for and run a homing cycle before the first move
    pub home_before_scan: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            bounds: ScanBounds::default(),
            overlap: 0.3,
            border: 0.0,
            serpentine: true,
            exclusions: Vec::new(),
            stacking: None,
            hdr: None,
            kinematics: KinematicsSettings::default(),
            output: OutputSettings::default(),
            home_before_scan: false,
        }
    }
}

/// Main configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device connection
    pub connection: ConnectionSettings,
    /// Motion core
    pub motion: MotionSettings,
    /// Imager
    pub imager: ImagerSettings,
    /// Scan plan
    pub scan: ScanSettings,
}

impl Config {
    /// Create default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform default location: `<config dir>/stagekit/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stagekit").join("config.toml"))
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigurationError::Parse {
            reason: format!("Invalid TOML config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document and validate it
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigurationError::Parse {
                reason: format!("Invalid JSON config: {}", e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        tracing::debug!("Loading config from {}", path.display());

        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&content)
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&content)
        } else {
            Err(ConfigurationError::UnsupportedFormat(path.display().to_string()).into())
        }
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self).map_err(|e| ConfigurationError::Parse {
                reason: format!("Failed to serialize config: {}", e),
            })?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigurationError::Parse {
                reason: format!("Failed to serialize config: {}", e),
            })?
        } else {
            return Err(ConfigurationError::UnsupportedFormat(path.display().to_string()).into());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        tracing::info!("Saved config to {}", path.display());

        Ok(())
    }

    /// Validate every section, reporting the first offending field
    pub fn validate(&self) -> Result<()> {
        self.validate_connection()?;
        self.validate_motion()?;
        self.validate_imager()?;
        self.validate_scan()?;
        Ok(())
    }

    fn validate_connection(&self) -> Result<()> {
        let c = &self.connection;
        if c.driver == DriverKind::Grbl && c.port.trim().is_empty() {
            return Err(invalid("connection.port", "required for the grbl driver"));
        }
        if c.baud_rate == 0 {
            return Err(invalid("connection.baud_rate", "must be > 0"));
        }
        if c.timeout_ms == 0 {
            return Err(invalid("connection.timeout_ms", "must be > 0"));
        }
        if c.resync_timeout_ms == 0 {
            return Err(invalid("connection.resync_timeout_ms", "must be > 0"));
        }
        Ok(())
    }

    fn validate_motion(&self) -> Result<()> {
        let m = &self.motion;
        if m.axes.is_empty() {
            return Err(invalid("motion.axes", "at least one axis is required"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for axis in &m.axes {
            if !seen.insert(*axis) {
                return Err(invalid("motion.axes", format!("axis {} listed twice", axis)));
            }
        }

        let declared = |section: &str, axis: &Axis| -> Result<()> {
            if seen.contains(axis) {
                Ok(())
            } else {
                Err(invalid(
                    format!("motion.{}.{}", section, axis),
                    "axis is not declared in motion.axes",
                ))
            }
        };

        for (axis, distance) in &m.backlash {
            declared("backlash", axis)?;
            if !distance.is_finite() || *distance < 0.0 {
                return Err(invalid(
                    format!("motion.backlash.{}", axis),
                    "must be a finite distance >= 0",
                ));
            }
        }
        for axis in m.backlash_compensation.keys() {
            declared("backlash_compensation", axis)?;
        }
        for (axis, range) in &m.soft_limits {
            declared("soft_limits", axis)?;
            if !range.min.is_finite() || !range.max.is_finite() || range.min > range.max {
                return Err(invalid(
                    format!("motion.soft_limits.{}", axis),
                    "min must be <= max",
                ));
            }
        }
        for (axis, scalar) in &m.scalars {
            declared("scalars", axis)?;
            if !scalar.is_finite() || *scalar == 0.0 {
                return Err(invalid(
                    format!("motion.scalars.{}", axis),
                    "must be finite and non-zero",
                ));
            }
        }
        if !(m.epsilon_steps > 0.0 && m.epsilon_steps.is_finite()) {
            return Err(invalid("motion.epsilon_steps", "must be > 0"));
        }
        if m.status_period_ms == 0 {
            return Err(invalid("motion.status_period_ms", "must be > 0"));
        }
        if m.jog_period_ms == 0 {
            return Err(invalid("motion.jog_period_ms", "must be > 0"));
        }
        if m.command_timeout_ms == 0 {
            return Err(invalid("motion.command_timeout_ms", "must be > 0"));
        }
        if m.reboot.enabled && m.reboot.period_ms == 0 {
            return Err(invalid("motion.reboot.period_ms", "must be > 0"));
        }
        Ok(())
    }

    fn validate_imager(&self) -> Result<()> {
        let i = &self.imager;
        if !(i.view_x_mm > 0.0 && i.view_x_mm.is_finite()) {
            return Err(invalid("imager.view_x_mm", "must be > 0"));
        }
        if i.width_px == 0 || i.height_px == 0 {
            return Err(invalid("imager.width_px", "sensor dimensions must be > 0"));
        }
        if !(i.scale > 0.0 && i.scale.is_finite()) {
            return Err(invalid("imager.scale", "must be > 0"));
        }
        if i.capture_timeout_ms == 0 {
            return Err(invalid("imager.capture_timeout_ms", "must be > 0"));
        }
        if i.max_capture_attempts == 0 {
            return Err(invalid("imager.max_capture_attempts", "must be >= 1"));
        }
        Ok(())
    }

    fn validate_scan(&self) -> Result<()> {
        let s = &self.scan;
        if !(0.0..1.0).contains(&s.overlap) {
            return Err(invalid("scan.overlap", "must be in [0, 1)"));
        }
        if !(s.border >= 0.0 && s.border.is_finite()) {
            return Err(invalid("scan.border", "must be >= 0"));
        }

        match &s.bounds {
            ScanBounds::Contour { start, end } => {
                for (name, pos) in [("start", start), ("end", end)] {
                    for axis in [Axis::X, Axis::Y] {
                        if pos.get(axis).is_none() {
                            return Err(invalid(
                                format!("scan.bounds.{}.{}", name, axis),
                                "contour corners need x and y",
                            ));
                        }
                    }
                }
            }
            ScanBounds::ThreeCorner { ll, ul, lr } => {
                for (name, pos) in [("ll", ll), ("ul", ul), ("lr", lr)] {
                    for axis in [Axis::X, Axis::Y] {
                        if pos.get(axis).is_none() {
                            return Err(invalid(
                                format!("scan.bounds.{}.{}", name, axis),
                                "corners need x and y",
                            ));
                        }
                    }
                }
            }
        }

        for (i, zone) in s.exclusions.iter().enumerate() {
            if zone.row_min > zone.row_max || zone.col_min > zone.col_max {
                return Err(invalid(
                    format!("scan.exclusions[{}]", i),
                    "min must be <= max",
                ));
            }
        }

        if let Some(stack) = &s.stacking {
            if stack.images == 0 {
                return Err(invalid("scan.stacking.images", "must be >= 1"));
            }
            if !(stack.distance >= 0.0 && stack.distance.is_finite()) {
                return Err(invalid("scan.stacking.distance", "must be >= 0"));
            }
            if stack.images > 1 && stack.distance == 0.0 {
                return Err(invalid(
                    "scan.stacking.distance",
                    "must be > 0 when stacking more than one image",
                ));
            }
            if !self.motion.axes.contains(&Axis::Z) {
                return Err(invalid("scan.stacking", "requires a z axis"));
            }
        }

        if let Some(hdr) = &s.hdr {
            if hdr.properties.is_empty() {
                return Err(invalid("scan.hdr.properties", "at least one property set"));
            }
        }

        if s.output.extension.trim().is_empty() {
            return Err(invalid("scan.output.extension", "must not be empty"));
        }
        if s.output.metadata_file.trim().is_empty() {
            return Err(invalid("scan.output.metadata_file", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(key: impl Into<String>, reason: impl Into<String>) -> stagekit_core::Error {
    ConfigurationError::invalid(key, reason).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_overlap_out_of_range() {
        let mut config = Config::default();
        config.scan.overlap = 1.0;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid setting 'scan.overlap': must be in [0, 1)"
        );
    }

    #[test]
    fn test_modifier_axes_must_be_declared() {
        let mut config = Config::default();
        config.motion.backlash.insert(Axis::A, 0.05);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("motion.backlash.a"));
    }

    #[test]
    fn test_zero_scalar_rejected() {
        let mut config = Config::default();
        config.motion.scalars.insert(Axis::Z, 0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stacking_requires_distance() {
        let mut config = Config::default();
        config.scan.stacking = Some(StackSettings {
            images: 3,
            distance: 0.0,
            drift_correction: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exclusion_contains() {
        let zone = ExclusionZone {
            row_min: 1,
            row_max: 2,
            col_min: 0,
            col_max: 0,
        };
        assert!(zone.contains(1, 0));
        assert!(zone.contains(2, 0));
        assert!(!zone.contains(3, 0));
        assert!(!zone.contains(1, 1));
    }
}
