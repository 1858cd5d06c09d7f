//! Cooperative stop/pause token for a running scan
//!
//! The pipeline calls [`ScanControl::checkpoint`] between the items each
//! stage yields. A stop request makes the next checkpoint fail with
//! [`ScanError::Stopped`]; a pause request blocks it until resumed or stopped.

use parking_lot::{Condvar, Mutex};
use stagekit_core::{Result, ScanError};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Flags {
    stop: bool,
    pause: bool,
}

#[derive(Debug, Default)]
struct Inner {
    flags: Mutex<Flags>,
    changed: Condvar,
}

/// Shared stop/pause token
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    inner: Arc<Inner>,
}

impl ScanControl {
    /// Create a token in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; wakes paused checkpoints
    pub fn stop(&self) {
        self.inner.flags.lock().stop = true;
        self.inner.changed.notify_all();
    }

    /// Hold the scan at its next checkpoint
    pub fn pause(&self) {
        self.inner.flags.lock().pause = true;
    }

    /// Release a paused scan
    pub fn resume(&self) {
        self.inner.flags.lock().pause = false;
        self.inner.changed.notify_all();
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.inner.flags.lock().stop
    }

    /// Whether a pause is in effect
    pub fn is_paused(&self) -> bool {
        self.inner.flags.lock().pause
    }

    /// Block while paused, then fail if a stop was requested
    pub fn checkpoint(&self) -> Result<()> {
        let mut flags = self.inner.flags.lock();
        while flags.pause && !flags.stop {
            self.inner.changed.wait(&mut flags);
        }
        if flags.stop {
            return Err(ScanError::Stopped.into());
        }
        Ok(())
    }

    /// Sleep for `duration`, returning early with an error on stop
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut flags = self.inner.flags.lock();
        while !flags.stop {
            if self
                .inner
                .changed
                .wait_until(&mut flags, deadline)
                .timed_out()
            {
                break;
            }
        }
        if flags.stop {
            return Err(ScanError::Stopped.into());
        }
        Ok(())
    }
}
