//! GRBL driver against an in-memory controller

use parking_lot::Mutex;
use stagekit_communication::{GrblDriver, SerialPort};
use stagekit_core::{Axis, AxisRange, Error, MotionError, Position};
use stagekit_motion::MotionDriver;
use stagekit_settings::ConnectionSettings;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const BANNER: &str = "\r\nGrbl 1.1h ['$' for help]\r\n";

#[derive(Default)]
struct MockState {
    output: VecDeque<u8>,
    line: Vec<u8>,
    lines: Vec<String>,
    position: [f64; 3],
    jogging: bool,
    held: bool,
    resets: usize,
    report_wpos: bool,
    wco_sent: bool,
    silent: bool,
    drop_next: bool,
    reject_next: Option<u8>,
    closed: bool,
}

impl MockState {
    fn reply(&mut self, text: &str) {
        self.output.extend(text.as_bytes());
        self.output.extend(b"\r\n");
    }

    fn status(&mut self) {
        let state = if self.held {
            "Hold:0"
        } else if self.jogging {
            "Jog"
        } else {
            "Idle"
        };
        let [x, y, z] = self.position;
        let report = if self.report_wpos {
            // Work offset of (10, 0, 0), sent only with the first report
            let wco = if self.wco_sent {
                String::new()
            } else {
                self.wco_sent = true;
                "|WCO:10.000,0.000,0.000".to_string()
            };
            format!(
                "<{}|WPos:{:.3},{:.3},{:.3}|FS:0,0{}>",
                state,
                x - 10.0,
                y,
                z,
                wco
            )
        } else {
            format!("<{}|MPos:{:.3},{:.3},{:.3}|FS:0,0>", state, x, y, z)
        };
        self.reply(&report);
    }

    fn axis_words(line: &str) -> Vec<(usize, f64)> {
        line.split_whitespace()
            .filter_map(|word| {
                let (letter, value) = word.split_at(1);
                let index = match letter {
                    "X" => 0,
                    "Y" => 1,
                    "Z" => 2,
                    _ => return None,
                };
                value.parse().ok().map(|v| (index, v))
            })
            .collect()
    }

    fn handle_line(&mut self, line: String) {
        self.lines.push(line.clone());
        if self.drop_next {
            self.drop_next = false;
            return;
        }
        if let Some(code) = self.reject_next.take() {
            self.reply(&format!("error:{}", code));
            return;
        }
        match line.as_str() {
            "$$" => {
                for setting in [
                    "$100=800.000",
                    "$101=800.000",
                    "$102=400.000",
                    "$110=600.000",
                    "$111=600.000",
                    "$112=300.000",
                    "$120=10.000",
                    "$121=10.000",
                    "$122=5.000",
                    "$130=200.000",
                    "$131=150.000",
                    "$132=50.000",
                ] {
                    self.reply(setting);
                }
                self.reply("ok");
            }
            "G4 P0" | "$X" | "$SLP" => self.reply("ok"),
            "$H" => {
                self.position = [0.0; 3];
                self.reply("ok");
            }
            l if l.starts_with("G90 G21 G0 ") => {
                for (i, v) in Self::axis_words(l) {
                    self.position[i] = v;
                }
                self.reply("ok");
            }
            l if l.starts_with("$J=G91 G21 ") => {
                for (i, v) in Self::axis_words(&l["$J=".len()..]) {
                    self.position[i] += v;
                }
                self.jogging = true;
                self.reply("ok");
            }
            _ => self.reply("error:20"),
        }
    }

    fn receive(&mut self, byte: u8) {
        match byte {
            0x18 => {
                self.resets += 1;
                self.line.clear();
                self.jogging = false;
                self.held = false;
                self.wco_sent = false;
                self.output.clear();
                self.output.extend(BANNER.as_bytes());
            }
            0x85 => self.jogging = false,
            b'?' => self.status(),
            b'!' => {
                self.jogging = false;
                self.held = true;
            }
            b'\n' => {
                let line = String::from_utf8_lossy(&self.line).trim().to_string();
                self.line.clear();
                if !line.is_empty() {
                    self.handle_line(line);
                }
            }
            b => self.line.push(b),
        }
    }
}

#[derive(Clone, Default)]
struct MockGrbl {
    state: Arc<Mutex<MockState>>,
}

impl SerialPort for MockGrbl {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        if state.silent {
            return Ok(data.len());
        }
        for byte in data {
            state.receive(*byte);
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.output.is_empty() {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.output.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.output.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn name(&self) -> String {
        "mock".to_string()
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

fn connection() -> ConnectionSettings {
    ConnectionSettings {
        timeout_ms: 100,
        resync_timeout_ms: 200,
        move_timeout_ms: 500,
        ..ConnectionSettings::default()
    }
}

fn connect() -> (GrblDriver, MockGrbl) {
    let mock = MockGrbl::default();
    let driver = GrblDriver::with_port(Box::new(mock.clone()), &connection()).unwrap();
    (driver, mock)
}

#[test]
fn test_connect_reads_settings() {
    let (driver, mock) = connect();
    assert_eq!(driver.name(), "grbl:mock");
    assert_eq!(driver.axes().len(), 3);
    assert_eq!(driver.max_velocities().get(&Axis::X), Some(&10.0));
    assert_eq!(driver.steps_per_mm().get(&Axis::Z), Some(&400.0));
    assert_eq!(
        driver.machine_limits().get(&Axis::X),
        Some(&AxisRange::new(-200.0, 0.0))
    );
    assert_eq!(mock.state.lock().resets, 1);
}

#[test]
fn test_move_waits_for_planner_drain() {
    let (mut driver, mock) = connect();
    driver.move_absolute(&Position::xy(-5.0, -2.5)).unwrap();

    let lines = mock.state.lock().lines.clone();
    assert_eq!(
        &lines[lines.len() - 2..],
        &["G90 G21 G0 X-5.0000 Y-2.5000".to_string(), "G4 P0".to_string()]
    );
    assert_eq!(driver.position().unwrap(), Position::xyz(-5.0, -2.5, 0.0));
}

#[test]
fn test_position_from_work_coordinates() {
    let (mut driver, mock) = connect();
    mock.state.lock().report_wpos = true;
    driver.move_absolute(&Position::xy(-20.0, -1.0)).unwrap();
    assert_eq!(driver.position().unwrap(), Position::xyz(-20.0, -1.0, 0.0));
    // The cached offset still applies once WCO is no longer sent
    assert_eq!(driver.position().unwrap(), Position::xyz(-20.0, -1.0, 0.0));
}

#[test]
fn test_jog_and_cancel() {
    let (mut driver, mock) = connect();
    driver
        .jog_relative(&Position::new().with(Axis::X, -1.0), 2.0)
        .unwrap();
    assert_eq!(
        mock.state.lock().lines.last().cloned(),
        Some("$J=G91 G21 X-1.0000 F120.000".to_string())
    );
    assert!(driver.jog_active().unwrap());

    driver.jog_cancel().unwrap();
    assert!(!driver.jog_active().unwrap());
}

#[test]
fn test_error_response_is_invalid_state() {
    let (mut driver, mock) = connect();
    mock.state.lock().reject_next = Some(15);
    let err = driver
        .jog_relative(&Position::new().with(Axis::X, -500.0), 2.0)
        .unwrap_err();
    match err {
        Error::Motion(MotionError::InvalidState { reason }) => {
            assert!(reason.contains("travel"), "{}", reason)
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_lost_response_recovers_with_timeout() {
    let (mut driver, mock) = connect();
    mock.state.lock().drop_next = true;
    let err = driver.move_absolute(&Position::xy(-1.0, -1.0)).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(mock.state.lock().resets, 2);

    // The controller is usable again
    driver.move_absolute(&Position::xy(-2.0, -1.0)).unwrap();
}

#[test]
fn test_silent_controller_is_critical() {
    let (mut driver, mock) = connect();
    mock.state.lock().silent = true;
    let err = driver.move_absolute(&Position::xy(-1.0, -1.0)).unwrap_err();
    match err {
        Error::Motion(e) => assert!(e.is_critical()),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_stop_holds_then_resets() {
    let (mut driver, mock) = connect();
    driver
        .jog_relative(&Position::new().with(Axis::Y, -3.0), 1.0)
        .unwrap();
    driver.stop().unwrap();
    let state = mock.state.lock();
    assert_eq!(state.resets, 2);
    assert!(!state.jogging);
}

#[test]
fn test_home_and_power_commands() {
    let (mut driver, mock) = connect();
    driver.on().unwrap();
    driver.home().unwrap();
    driver.off().unwrap();
    driver.close().unwrap();

    let state = mock.state.lock();
    assert!(state.lines.ends_with(&[
        "$X".to_string(),
        "$H".to_string(),
        "$SLP".to_string()
    ]));
    assert!(state.closed);
}

#[test]
fn test_no_banner_fails_to_connect() {
    let mock = MockGrbl::default();
    mock.state.lock().silent = true;
    let Err(err) = GrblDriver::with_port(Box::new(mock), &connection()) else {
        panic!("connected without a banner");
    };
    assert!(matches!(err, Error::Motion(MotionError::MotionCritical { .. })));
}
