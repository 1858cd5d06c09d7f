//! GRBL motion driver
//!
//! Drives a GRBL 1.1 controller over a line-oriented serial connection.
//! Every command is sent synchronously and waits for its `ok`; blocking
//! moves are followed by `G4 P0`, which GRBL only acknowledges once the
//! planner buffer has drained.
//!
//! A command that receives no terminal response is recovered with a soft
//! reset. If the controller answers with its banner the command fails with
//! a timeout; if it stays silent the device is reported as lost.

use super::error_decoder::{format_alarm, format_error};
use super::response_parser::{GrblResponse, GrblResponseParser};
use super::settings::GrblSettings;
use super::status_parser::{MachineState, StatusReport};
use crate::communication::serial::{LineReader, RealSerialPort, SerialPort};
use stagekit_core::{AxisMap, AxisRange, AxisSet, Error, MotionError, Position, Result};
use stagekit_motion::MotionDriver;
use stagekit_settings::ConnectionSettings;
use std::time::{Duration, Instant};

/// Real-time soft reset (ctrl-x)
const SOFT_RESET: u8 = 0x18;
/// Real-time status query
const STATUS_QUERY: u8 = b'?';
/// Real-time feed hold
const FEED_HOLD: u8 = b'!';
/// Real-time jog cancel
const JOG_CANCEL: u8 = 0x85;

/// Status queries tried before giving up on a position
const MAX_STATUS_QUERIES: usize = 30;

/// Motion driver for GRBL controllers
pub struct GrblDriver {
    name: String,
    port: Box<dyn SerialPort>,
    reader: LineReader,
    parser: GrblResponseParser,
    settings: GrblSettings,
    axes: AxisSet,
    timeout: Duration,
    resync_timeout: Duration,
    move_timeout: Duration,
    last_wco: Option<Vec<f64>>,
}

impl GrblDriver {
    /// Open the serial port named in `settings` and synchronize with GRBL
    pub fn open(settings: &ConnectionSettings) -> Result<Self> {
        let port = RealSerialPort::open(settings)?;
        Self::with_port(Box::new(port), settings)
    }

    /// Synchronize with GRBL on an already open port and read `$$`
    pub fn with_port(port: Box<dyn SerialPort>, settings: &ConnectionSettings) -> Result<Self> {
        let mut driver = Self {
            name: format!("grbl:{}", port.name()),
            port,
            reader: LineReader::new(),
            parser: GrblResponseParser::new(),
            settings: GrblSettings::new(),
            axes: AxisSet::new(),
            timeout: Duration::from_millis(settings.timeout_ms),
            resync_timeout: Duration::from_millis(settings.resync_timeout_ms),
            move_timeout: Duration::from_millis(settings.move_timeout_ms),
            last_wco: None,
        };

        driver.resync()?;
        driver.load_settings()?;

        if driver.axes.is_empty() {
            return Err(MotionError::critical(format!(
                "{} reported no axis settings",
                driver.name
            ))
            .into());
        }

        tracing::info!(
            "Connected to {} with axes {:?} ({} settings)",
            driver.name,
            driver.axes,
            driver.settings.len()
        );
        Ok(driver)
    }

    /// Settings read at connect time
    pub fn settings(&self) -> &GrblSettings {
        &self.settings
    }

    fn load_settings(&mut self) -> Result<()> {
        let mut settings = GrblSettings::new();
        for response in self.transact("$$", self.timeout)? {
            if let GrblResponse::Setting { number, value } = response {
                settings.insert(number, value);
            }
        }
        self.axes = settings.axes();
        self.settings = settings;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write(data).map_err(|e| {
            tracing::error!("Write to {} failed: {}", self.name, e);
            Error::from(MotionError::critical(format!(
                "write to {} failed: {}",
                self.name, e
            )))
        })?;
        Ok(())
    }

    fn next_response(&mut self, deadline: Instant) -> Result<Option<GrblResponse>> {
        loop {
            let line = self
                .reader
                .read_line(self.port.as_mut(), deadline)
                .map_err(|e| {
                    MotionError::critical(format!("read from {} failed: {}", self.name, e))
                })?;
            let Some(line) = line else {
                return Ok(None);
            };
            tracing::trace!("{} <- {}", self.name, line);
            if let Some(response) = self.parser.parse(&line) {
                return Ok(Some(response));
            }
        }
    }

    /// Send one line and collect everything received before its `ok`
    fn transact(&mut self, line: &str, timeout: Duration) -> Result<Vec<GrblResponse>> {
        tracing::debug!("{} -> {}", self.name, line);
        self.write(format!("{}\n", line).as_bytes())?;

        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        loop {
            match self.next_response(deadline)? {
                Some(GrblResponse::Ok) => return Ok(collected),
                Some(GrblResponse::Error(code)) => {
                    tracing::warn!("{} rejected '{}': {}", self.name, line, format_error(code));
                    return Err(MotionError::invalid_state(format_error(code)).into());
                }
                Some(GrblResponse::Alarm(code)) => {
                    tracing::warn!("{} raised {} during '{}'", self.name, format_alarm(code), line);
                    return Err(MotionError::invalid_state(format_alarm(code)).into());
                }
                Some(GrblResponse::Status(report)) => self.note_status(&report),
                Some(other) => collected.push(other),
                None => return Err(self.recover(line, timeout)),
            }
        }
    }

    fn command(&mut self, line: &str, timeout: Duration) -> Result<()> {
        self.transact(line, timeout).map(|_| ())
    }

    /// Reset after a lost response; the result is the error for the command
    fn recover(&mut self, line: &str, timeout: Duration) -> Error {
        tracing::warn!(
            "{} did not answer '{}' within {:?}, resetting",
            self.name,
            line,
            timeout
        );
        match self.resync() {
            Ok(()) => MotionError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into(),
            Err(e) => e,
        }
    }

    /// Soft reset and wait for the startup banner
    fn resync(&mut self) -> Result<()> {
        self.reader.clear();
        self.write(&[SOFT_RESET])?;

        let deadline = Instant::now() + self.resync_timeout;
        loop {
            match self.next_response(deadline)? {
                Some(GrblResponse::Version(banner)) => {
                    tracing::debug!("{} reset: {}", self.name, banner);
                    self.last_wco = None;
                    return Ok(());
                }
                Some(other) => tracing::trace!("{} discarded {} while resyncing", self.name, other),
                None => {
                    tracing::error!("{} did not come back after reset", self.name);
                    return Err(MotionError::critical(format!(
                        "{} did not respond to reset",
                        self.name
                    ))
                    .into());
                }
            }
        }
    }

    fn note_status(&mut self, report: &StatusReport) {
        if let Some(wco) = &report.work_coord_offset {
            self.last_wco = Some(wco.clone());
        }
    }

    fn status(&mut self) -> Result<StatusReport> {
        self.write(&[STATUS_QUERY])?;
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.next_response(deadline)? {
                Some(GrblResponse::Status(report)) => {
                    self.note_status(&report);
                    return Ok(report);
                }
                Some(GrblResponse::Alarm(code)) => {
                    tracing::warn!("{} raised {}", self.name, format_alarm(code));
                }
                Some(other) => tracing::trace!("{} ignored {} awaiting status", self.name, other),
                None => return Err(self.recover("?", self.timeout)),
            }
        }
    }

    /// Poll status until the machine leaves a moving state
    fn wait_until_still(&mut self, timeout: Duration) -> Result<MachineState> {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.status()?;
            if !report.state.is_moving() {
                return Ok(report.state);
            }
            if Instant::now() >= deadline {
                return Err(MotionError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn axis_words(position: &Position) -> String {
        position
            .iter()
            .map(|(axis, value)| format!("{}{:.4}", axis.letter(), value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl MotionDriver for GrblDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn axes(&self) -> AxisSet {
        self.axes.clone()
    }

    fn move_absolute(&mut self, target: &Position) -> Result<()> {
        if target.is_empty() {
            return Ok(());
        }
        let line = format!("G90 G21 G0 {}", Self::axis_words(target));
        self.command(&line, self.timeout)?;
        self.command("G4 P0", self.move_timeout)
    }

    fn position(&mut self) -> Result<Position> {
        for _ in 0..MAX_STATUS_QUERIES {
            let report = self.status()?;
            if let Some(position) = report.machine_position(&self.axes, self.last_wco.as_deref()) {
                return Ok(position);
            }
            // WPos reports only carry WCO periodically
            std::thread::sleep(Duration::from_millis(10));
        }
        Err(MotionError::invalid_state(format!(
            "{} never reported a machine position",
            self.name
        ))
        .into())
    }

    fn jog_relative(&mut self, delta: &Position, rate: f64) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let line = format!(
            "$J=G91 G21 {} F{:.3}",
            Self::axis_words(delta),
            rate * 60.0
        );
        self.command(&line, self.timeout)
    }

    fn jog_cancel(&mut self) -> Result<()> {
        self.write(&[JOG_CANCEL])?;
        self.wait_until_still(self.timeout).map(|_| ())
    }

    fn jog_active(&mut self) -> Result<bool> {
        Ok(self.status()?.state == MachineState::Jog)
    }

    fn max_velocities(&self) -> AxisMap<f64> {
        self.settings.max_velocities()
    }

    fn max_accelerations(&self) -> AxisMap<f64> {
        self.settings.max_accelerations()
    }

    fn machine_limits(&self) -> AxisMap<AxisRange> {
        self.settings.machine_limits()
    }

    fn steps_per_mm(&self) -> AxisMap<f64> {
        self.settings.steps_per_mm()
    }

    fn home(&mut self) -> Result<()> {
        self.command("$H", self.move_timeout)
    }

    fn stop(&mut self) -> Result<()> {
        self.write(&[FEED_HOLD])?;
        let state = self.wait_until_still(self.timeout)?;
        tracing::debug!("{} held in state {}", self.name, state);
        self.resync()
    }

    fn estop(&mut self) -> Result<()> {
        self.resync()
    }

    fn on(&mut self) -> Result<()> {
        self.command("$X", self.timeout)
    }

    fn off(&mut self) -> Result<()> {
        self.command("$SLP", self.timeout)
    }

    fn close(&mut self) -> Result<()> {
        tracing::info!("Closing {}", self.name);
        self.port.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagekit_core::Axis;

    #[test]
    fn test_axis_words_use_letters() {
        let words = GrblDriver::axis_words(&Position::xy(1.5, -2.0));
        assert_eq!(words, "X1.5000 Y-2.0000");
        assert_eq!(
            GrblDriver::axis_words(&Position::new().with(Axis::Z, 0.25)),
            "Z0.2500"
        );
    }
}
