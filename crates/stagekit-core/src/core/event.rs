//! Event system for motion and scan progress
//!
//! Provides:
//! - Event types for motion worker and scan state changes
//! - A generic broadcast dispatcher for publishing events to subscribers

use crate::data::Position;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Scan pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    /// Constructed, not started
    Idle,
    /// Executing pipeline steps
    Running,
    /// Blocked at a checkpoint until resumed
    Paused,
    /// Every step finished and metadata was written
    Completed,
    /// Stopped at a checkpoint by request
    Stopped,
    /// A step failed
    Failed,
}

impl ScanState {
    /// Whether the scan can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Stopped | ScanState::Failed
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanState::Idle => "idle",
            ScanState::Running => "running",
            ScanState::Paused => "paused",
            ScanState::Completed => "completed",
            ScanState::Stopped => "stopped",
            ScanState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Scan event types
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Scan state changed
    StateChanged(ScanState),
    /// A leaf step (one saved image) completed
    Progress {
        /// Images captured so far
        captured: usize,
        /// Images the pipeline expects in total
        expected: usize,
        /// Output file name of the step, if saved
        filename: Option<String>,
    },
    /// A recoverable problem was logged during the scan
    Warning(String),
}

impl fmt::Display for ScanEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanEvent::StateChanged(state) => write!(f, "Scan state: {}", state),
            ScanEvent::Progress {
                captured, expected, ..
            } => write!(f, "Scan progress: {}/{}", captured, expected),
            ScanEvent::Warning(msg) => write!(f, "Scan warning: {}", msg),
        }
    }
}

/// Motion worker event types
#[derive(Debug, Clone)]
pub enum MotionEvent {
    /// Status poll refreshed the cached position
    PositionChanged(Position),
    /// The command queue drained
    Idle,
    /// The device failed and was closed
    DeviceLost(String),
    /// The device was re-initialized after a failure
    DeviceRecovered,
}

impl fmt::Display for MotionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionEvent::PositionChanged(pos) => write!(f, "Position: {}", pos),
            MotionEvent::Idle => write!(f, "Motion idle"),
            MotionEvent::DeviceLost(reason) => write!(f, "Device lost: {}", reason),
            MotionEvent::DeviceRecovered => write!(f, "Device recovered"),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher<E: Clone> {
    /// Broadcast sender channel
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventDispatcher<E> {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 100)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Create a new event dispatcher with default buffer size
    pub fn default_with_buffer() -> Self {
        Self::new(100)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of receivers; publishing with no subscriber is not an error.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::default_with_buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let dispatcher: EventDispatcher<ScanEvent> = EventDispatcher::default();
        assert_eq!(dispatcher.publish(ScanEvent::StateChanged(ScanState::Running)), 0);
    }

    #[test]
    fn test_subscriber_receives_events() {
        let dispatcher: EventDispatcher<ScanEvent> = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();
        dispatcher.publish(ScanEvent::Progress {
            captured: 1,
            expected: 4,
            filename: None,
        });
        match rx.try_recv() {
            Ok(ScanEvent::Progress {
                captured, expected, ..
            }) => {
                assert_eq!(captured, 1);
                assert_eq!(expected, 4);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(ScanState::Completed.is_terminal());
        assert!(ScanState::Stopped.is_terminal());
        assert!(!ScanState::Paused.is_terminal());
    }
}
