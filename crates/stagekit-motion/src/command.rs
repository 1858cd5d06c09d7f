//! Motion commands and their completion signals
//!
//! Every request handed to the motion worker is one [`MotionCommand`]. The
//! submitter may attach a [`Completion`], which the worker resolves exactly
//! once with the command's outcome. Commands flushed by stop or estop are
//! resolved with [`MotionError::Cancelled`].

use crate::modifier::ModifierKind;
use parking_lot::{Condvar, Mutex};
use stagekit_core::{AxisMap, MotionError, Position};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A queued motion request
#[derive(Debug, Clone, PartialEq)]
pub enum MotionCommand {
    /// Blocking move to an absolute user position
    MoveAbsolute(Position),
    /// Blocking move by a user-space delta
    MoveRelative(Position),
    /// Non-blocking relative jog at a rate in user units per second
    JogRelative {
        /// Distance per axis
        delta: Position,
        /// Path rate
        rate: f64,
    },
    /// Non-blocking jog toward an absolute user position
    JogAbsolute {
        /// Destination
        target: Position,
        /// Path rate
        rate: f64,
    },
    /// Jog at a fraction (-1..=1) of each axis' maximum velocity
    JogFractions(AxisMap<f64>),
    /// Abort the jog in flight
    JogCancel,
    /// Run the homing cycle
    Home,
    /// Energize motors
    On,
    /// De-energize motors
    Off,
    /// Query the position from the device
    QueryPosition,
    /// Enable or disable a coordinate modifier
    SetModifier {
        /// Which modifier
        kind: ModifierKind,
        /// New state
        enabled: bool,
    },
}

impl MotionCommand {
    /// Short verb used in logs
    pub fn verb(&self) -> &'static str {
        match self {
            MotionCommand::MoveAbsolute(_) => "move_absolute",
            MotionCommand::MoveRelative(_) => "move_relative",
            MotionCommand::JogRelative { .. } => "jog_relative",
            MotionCommand::JogAbsolute { .. } => "jog_absolute",
            MotionCommand::JogFractions(_) => "jog_fractions",
            MotionCommand::JogCancel => "jog_cancel",
            MotionCommand::Home => "home",
            MotionCommand::On => "on",
            MotionCommand::Off => "off",
            MotionCommand::QueryPosition => "position",
            MotionCommand::SetModifier { .. } => "set_modifier",
        }
    }
}

impl fmt::Display for MotionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionCommand::MoveAbsolute(p) | MotionCommand::MoveRelative(p) => {
                write!(f, "{} {}", self.verb(), p)
            }
            MotionCommand::JogRelative { delta, rate } => {
                write!(f, "{} {} @ {:.3}", self.verb(), delta, rate)
            }
            MotionCommand::JogAbsolute { target, rate } => {
                write!(f, "{} {} @ {:.3}", self.verb(), target, rate)
            }
            MotionCommand::SetModifier { kind, enabled } => {
                write!(f, "{} {}={}", self.verb(), kind, enabled)
            }
            _ => write!(f, "{}", self.verb()),
        }
    }
}

/// What a successful command produced
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// Nothing to report
    Done,
    /// A fresh position
    Position(Position),
}

/// Outcome delivered through a [`Completion`]
pub type CommandResult = std::result::Result<CommandOutput, MotionError>;

struct Slot {
    value: Mutex<Option<CommandResult>>,
    ready: Condvar,
}

/// One-shot completion signal shared between submitter and worker
#[derive(Clone)]
pub struct Completion {
    slot: Arc<Slot>,
}

impl Completion {
    /// Create an unresolved completion
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                value: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Resolve with `result`; returns false if already resolved
    pub fn resolve(&self, result: CommandResult) -> bool {
        let mut value = self.slot.value.lock();
        if value.is_some() {
            return false;
        }
        *value = Some(result);
        self.slot.ready.notify_all();
        true
    }

    /// Whether a result is available
    pub fn is_resolved(&self) -> bool {
        self.slot.value.lock().is_some()
    }

    /// The result, if available
    pub fn try_result(&self) -> Option<CommandResult> {
        self.slot.value.lock().clone()
    }

    /// Block until resolved or until `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> CommandResult {
        let deadline = Instant::now() + timeout;
        let mut value = self.slot.value.lock();
        while value.is_none() {
            if self.slot.ready.wait_until(&mut value, deadline).timed_out() {
                break;
            }
        }
        value.clone().unwrap_or(Err(MotionError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }))
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A command plus its optional completion
#[derive(Debug)]
pub struct Envelope {
    /// The request
    pub command: MotionCommand,
    /// Signal resolved when the command finished
    pub completion: Option<Completion>,
}

impl Envelope {
    /// Resolve the completion, if any
    pub fn resolve(&self, result: CommandResult) {
        if let Some(completion) = &self.completion {
            completion.resolve(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_resolves_once() {
        let completion = Completion::new();
        assert!(completion.resolve(Ok(CommandOutput::Done)));
        assert!(!completion.resolve(Err(MotionError::Cancelled)));
        assert_eq!(
            completion.wait(Duration::from_millis(1)),
            Ok(CommandOutput::Done)
        );
    }

    #[test]
    fn test_completion_wait_times_out() {
        let completion = Completion::new();
        let result = completion.wait(Duration::from_millis(10));
        assert_eq!(result, Err(MotionError::Timeout { timeout_ms: 10 }));
        assert!(!completion.is_resolved());
    }

    #[test]
    fn test_completion_across_threads() {
        let completion = Completion::new();
        let worker = completion.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            worker.resolve(Err(MotionError::Cancelled));
        });
        assert_eq!(
            completion.wait(Duration::from_secs(5)),
            Err(MotionError::Cancelled)
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_command_display() {
        let cmd = MotionCommand::MoveAbsolute(Position::xy(1.0, 2.0));
        assert_eq!(cmd.to_string(), "move_absolute x:1.0000 y:2.0000");
        assert_eq!(MotionCommand::Home.to_string(), "home");
    }
}
