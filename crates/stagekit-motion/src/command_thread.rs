//! Motion command thread
//!
//! One named worker thread owns the [`MotionHal`]. Every other thread talks
//! to it through a [`MotionHandle`]: commands go into a FIFO queue, results
//! come back through [`Completion`]s, and the last polled position is kept in
//! a shared read-only cache.
//!
//! Stop and estop do not queue. They raise a flag and flush the queue in the
//! caller's thread, and the worker services them before dequeuing anything
//! else. A critical device failure closes the HAL; depending on settings the
//! worker then halts or keeps re-creating the HAL through its factory.

use crate::command::{CommandOutput, CommandResult, Completion, Envelope, MotionCommand};
use crate::hal::MotionHal;
use crate::modifier::ModifierKind;
use parking_lot::{Condvar, Mutex};
use stagekit_core::{
    thread_safe_rw, AxisMap, Error, EventDispatcher, MotionError, MotionEvent, Position, Result,
    ThreadSafeRw,
};
use stagekit_settings::MotionSettings;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Name of the worker thread
pub const WORKER_THREAD_NAME: &str = "stagekit-motion";

/// Share of a jog period a fraction jog covers, so the next jog arrives before the last one ends
pub const JOG_UNDERDRIVE: f64 = 0.8;

/// Result type of handle operations
pub type MotionResult<T> = std::result::Result<T, MotionError>;

/// Creates a fresh HAL (initially and after a device loss)
pub type HalFactory = Box<dyn Fn() -> Result<MotionHal> + Send>;

#[derive(Debug, Clone, Copy)]
struct WorkerTiming {
    status_period: Duration,
    jog_period: Duration,
    command_timeout: Duration,
    reboot_period: Option<Duration>,
}

impl WorkerTiming {
    fn from_settings(settings: &MotionSettings) -> Self {
        Self {
            status_period: Duration::from_millis(settings.status_period_ms),
            jog_period: Duration::from_millis(settings.jog_period_ms),
            command_timeout: Duration::from_millis(settings.command_timeout_ms),
            reboot_period: settings
                .reboot
                .enabled
                .then(|| Duration::from_millis(settings.reboot.period_ms)),
        }
    }
}

#[derive(Default)]
struct WorkQueue {
    pending: VecDeque<Envelope>,
    executing: bool,
    stop_requested: bool,
    estop_requested: bool,
    shutdown: bool,
    halted: bool,
}

impl WorkQueue {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.executing && !self.stop_requested && !self.estop_requested
    }

    fn flush(&mut self, reason: &MotionError) -> usize {
        let flushed = self.pending.len();
        for envelope in self.pending.drain(..) {
            envelope.resolve(Err(reason.clone()));
        }
        flushed
    }
}

struct Shared {
    queue: Mutex<WorkQueue>,
    wake: Condvar,
    idle: Condvar,
    position: ThreadSafeRw<Option<Position>>,
    events: EventDispatcher<MotionEvent>,
    timing: WorkerTiming,
}

/// Cloneable access to the motion worker
#[derive(Clone)]
pub struct MotionHandle {
    shared: Arc<Shared>,
}

impl MotionHandle {
    /// Queue a command and return its completion
    pub fn submit(&self, command: MotionCommand) -> Completion {
        let completion = Completion::new();
        self.enqueue(Envelope {
            command,
            completion: Some(completion.clone()),
        });
        completion
    }

    /// Queue a command nobody waits for
    pub fn post(&self, command: MotionCommand) {
        self.enqueue(Envelope {
            command,
            completion: None,
        });
    }

    /// Queue a command and wait for it within the configured command timeout
    pub fn execute(&self, command: MotionCommand) -> CommandResult {
        self.submit(command)
            .wait(self.shared.timing.command_timeout)
    }

    /// Blocking absolute move
    pub fn move_absolute(&self, target: &Position) -> MotionResult<()> {
        self.execute(MotionCommand::MoveAbsolute(target.clone()))
            .map(|_| ())
    }

    /// Blocking relative move
    pub fn move_relative(&self, delta: &Position) -> MotionResult<()> {
        self.execute(MotionCommand::MoveRelative(delta.clone()))
            .map(|_| ())
    }

    /// Start a relative jog
    pub fn jog_relative(&self, delta: &Position, rate: f64) -> MotionResult<()> {
        self.execute(MotionCommand::JogRelative {
            delta: delta.clone(),
            rate,
        })
        .map(|_| ())
    }

    /// Start a jog toward an absolute position
    pub fn jog_absolute(&self, target: &Position, rate: f64) -> MotionResult<()> {
        self.execute(MotionCommand::JogAbsolute {
            target: target.clone(),
            rate,
        })
        .map(|_| ())
    }

    /// Jog at a fraction of each axis' maximum velocity
    ///
    /// Meant to be called at the jog period while a control is held. A
    /// fraction jog still waiting in the queue is replaced instead of adding
    /// another one.
    pub fn jog_fractions(&self, fractions: AxisMap<f64>) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown || queue.halted {
                return;
            }
            if let Some(envelope) = queue
                .pending
                .iter_mut()
                .find(|e| matches!(e.command, MotionCommand::JogFractions(_)))
            {
                tracing::trace!("Coalescing pending fraction jog");
                envelope.command = MotionCommand::JogFractions(fractions);
                return;
            }
            queue.pending.push_back(Envelope {
                command: MotionCommand::JogFractions(fractions),
                completion: None,
            });
        }
        self.shared.wake.notify_all();
    }

    /// Cancel the jog in flight
    pub fn jog_cancel(&self) -> MotionResult<()> {
        self.execute(MotionCommand::JogCancel).map(|_| ())
    }

    /// Run the homing cycle
    pub fn home(&self) -> MotionResult<()> {
        self.execute(MotionCommand::Home).map(|_| ())
    }

    /// Energize motors
    pub fn on(&self) -> MotionResult<()> {
        self.execute(MotionCommand::On).map(|_| ())
    }

    /// De-energize motors
    pub fn off(&self) -> MotionResult<()> {
        self.execute(MotionCommand::Off).map(|_| ())
    }

    /// Enable or disable a coordinate modifier
    pub fn set_modifier_enabled(&self, kind: ModifierKind, enabled: bool) -> MotionResult<()> {
        self.execute(MotionCommand::SetModifier { kind, enabled })
            .map(|_| ())
    }

    /// Ask the device for its position
    pub fn query_position(&self) -> MotionResult<Position> {
        match self.execute(MotionCommand::QueryPosition)? {
            CommandOutput::Position(position) => Ok(position),
            CommandOutput::Done => Err(MotionError::invalid_state(
                "position query returned nothing",
            )),
        }
    }

    /// Last polled position, or a fresh query if nothing is cached
    pub fn position(&self) -> MotionResult<Position> {
        match self.cached_position() {
            Some(position) => Ok(position),
            None => self.query_position(),
        }
    }

    /// Last polled position
    pub fn cached_position(&self) -> Option<Position> {
        self.shared.position.read().clone()
    }

    /// Controlled stop: flush the queue and stop the device
    pub fn stop(&self) {
        let flushed = {
            let mut queue = self.shared.queue.lock();
            queue.stop_requested = true;
            queue.flush(&MotionError::Cancelled)
        };
        self.shared.wake.notify_all();
        tracing::info!("Stop requested, {} queued commands cancelled", flushed);
    }

    /// Emergency stop: flush the queue and halt the device immediately
    pub fn estop(&self) {
        let flushed = {
            let mut queue = self.shared.queue.lock();
            queue.estop_requested = true;
            queue.flush(&MotionError::Cancelled)
        };
        self.shared.wake.notify_all();
        tracing::warn!(
            "Emergency stop requested, {} queued commands cancelled",
            flushed
        );
    }

    /// Whether nothing is queued or executing
    pub fn is_idle(&self) -> bool {
        self.shared.queue.lock().is_idle()
    }

    /// Block until the worker is idle; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while !queue.is_idle() {
            if self
                .shared
                .idle
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return queue.is_idle();
            }
        }
        true
    }

    /// Number of queued commands
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Whether the worker lost its device and gave up
    pub fn is_halted(&self) -> bool {
        self.shared.queue.lock().halted
    }

    /// Subscribe to motion events
    pub fn subscribe(&self) -> broadcast::Receiver<MotionEvent> {
        self.shared.events.subscribe()
    }

    fn enqueue(&self, envelope: Envelope) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown || queue.halted {
                envelope.resolve(Err(MotionError::WorkerStopped));
                return;
            }
            tracing::trace!("Queued {}", envelope.command);
            queue.pending.push_back(envelope);
        }
        self.shared.wake.notify_all();
    }
}

/// Owner of the motion worker thread
pub struct MotionCommandThread {
    handle: MotionHandle,
    worker: Option<JoinHandle<()>>,
}

impl MotionCommandThread {
    /// Create the HAL through `factory` and start the worker
    pub fn spawn(factory: HalFactory, settings: &MotionSettings) -> Result<Self> {
        let hal = factory()?;
        let shared = Arc::new(Shared {
            queue: Mutex::new(WorkQueue::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
            position: thread_safe_rw(None),
            events: EventDispatcher::default(),
            timing: WorkerTiming::from_settings(settings),
        });

        let worker = Worker {
            shared: shared.clone(),
            hal: Some(hal),
            factory,
            last_poll: None,
            next_reboot: None,
            announced_idle: false,
        };
        let join = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            handle: MotionHandle { shared },
            worker: Some(join),
        })
    }

    /// A handle for other threads
    pub fn handle(&self) -> MotionHandle {
        self.handle.clone()
    }

    /// Stop the worker, cancel queued commands and close the device
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        {
            let mut queue = self.handle.shared.queue.lock();
            queue.shutdown = true;
            queue.flush(&MotionError::WorkerStopped);
        }
        self.handle.shared.wake.notify_all();
        if let Some(join) = self.worker.take() {
            if join.join().is_err() {
                tracing::error!("Motion worker panicked");
            }
        }
    }
}

impl std::ops::Deref for MotionCommandThread {
    type Target = MotionHandle;

    fn deref(&self) -> &MotionHandle {
        &self.handle
    }
}

impl Drop for MotionCommandThread {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

enum Work {
    Command(Envelope),
    Stop,
    Estop,
    Poll,
    Reboot,
    Shutdown,
}

struct Worker {
    shared: Arc<Shared>,
    hal: Option<MotionHal>,
    factory: HalFactory,
    last_poll: Option<Instant>,
    next_reboot: Option<Instant>,
    announced_idle: bool,
}

impl Worker {
    fn run(mut self) {
        tracing::info!("Motion worker started");
        loop {
            match self.next_work() {
                Work::Shutdown => break,
                Work::Estop => self.safety_stop(true),
                Work::Stop => self.safety_stop(false),
                Work::Poll => self.poll_status(),
                Work::Reboot => self.reboot(),
                Work::Command(envelope) => self.execute(envelope),
            }
            self.finish_work();
        }

        if let Some(mut hal) = self.hal.take() {
            if let Err(e) = hal.close() {
                tracing::warn!("Failed to close motion device: {}", e);
            }
        }
        self.shared.idle.notify_all();
        tracing::info!("Motion worker stopped");
    }

    fn next_work(&mut self) -> Work {
        let shared = self.shared.clone();
        let mut queue = shared.queue.lock();
        loop {
            if queue.shutdown {
                return Work::Shutdown;
            }
            if queue.estop_requested {
                queue.estop_requested = false;
                queue.stop_requested = false;
                queue.executing = true;
                return Work::Estop;
            }
            if queue.stop_requested {
                queue.stop_requested = false;
                queue.executing = true;
                return Work::Stop;
            }

            if self.hal.is_none() {
                let reason = if queue.halted {
                    MotionError::WorkerStopped
                } else {
                    MotionError::critical("motion device unavailable")
                };
                queue.flush(&reason);
                shared.idle.notify_all();
                match self.next_reboot {
                    Some(at) if !queue.halted => {
                        if Instant::now() >= at {
                            queue.executing = true;
                            return Work::Reboot;
                        }
                        shared.wake.wait_until(&mut queue, at);
                    }
                    _ => shared.wake.wait(&mut queue),
                }
                continue;
            }

            if let Some(envelope) = queue.pending.pop_front() {
                queue.executing = true;
                self.announced_idle = false;
                return Work::Command(envelope);
            }

            if !self.announced_idle {
                self.announced_idle = true;
                shared.idle.notify_all();
                shared.events.publish(MotionEvent::Idle);
            }
            let due = self
                .last_poll
                .map(|t| t + shared.timing.status_period)
                .unwrap_or_else(Instant::now);
            if Instant::now() >= due {
                return Work::Poll;
            }
            shared.wake.wait_until(&mut queue, due);
        }
    }

    fn finish_work(&mut self) {
        let mut queue = self.shared.queue.lock();
        queue.executing = false;
        if queue.is_idle() {
            self.shared.idle.notify_all();
        }
    }

    fn execute(&mut self, envelope: Envelope) {
        let Some(hal) = self.hal.as_mut() else {
            envelope.resolve(Err(MotionError::critical("motion device unavailable")));
            return;
        };

        tracing::debug!("Executing {}", envelope.command);
        let result = run_command(hal, &envelope.command, self.shared.timing.jog_period);
        match &result {
            Ok(CommandOutput::Position(position)) => self.update_position(position.clone()),
            Ok(CommandOutput::Done) => self.last_poll = None,
            Err(e) if e.is_axis_exceeded() => {
                tracing::warn!("{} rejected: {}", envelope.command.verb(), e)
            }
            Err(e) if e.is_critical() => self.lose_device(e.to_string()),
            Err(e) => tracing::warn!("{} failed: {}", envelope.command.verb(), e),
        }
        envelope.resolve(result);
    }

    fn safety_stop(&mut self, emergency: bool) {
        let flushed = self.shared.queue.lock().flush(&MotionError::Cancelled);
        if flushed > 0 {
            tracing::debug!("Flushed {} commands queued during stop", flushed);
        }
        let Some(hal) = self.hal.as_mut() else {
            return;
        };
        let result = if emergency { hal.estop() } else { hal.stop() };
        self.last_poll = None;
        if let Err(e) = result {
            let e = into_motion_error(e);
            if e.is_critical() {
                self.lose_device(e.to_string());
            } else {
                tracing::error!("Device refused stop: {}", e);
            }
        }
    }

    fn poll_status(&mut self) {
        self.last_poll = Some(Instant::now());
        let Some(hal) = self.hal.as_mut() else {
            return;
        };
        match hal.position() {
            Ok(position) => self.update_position(position),
            Err(e) => {
                let e = into_motion_error(e);
                if e.is_critical() {
                    self.lose_device(e.to_string());
                } else {
                    tracing::warn!("Status poll failed: {}", e);
                }
            }
        }
    }

    fn update_position(&mut self, position: Position) {
        self.last_poll = Some(Instant::now());
        let changed = {
            let mut cache = self.shared.position.write();
            let changed = cache.as_ref() != Some(&position);
            *cache = Some(position.clone());
            changed
        };
        if changed {
            self.shared
                .events
                .publish(MotionEvent::PositionChanged(position));
        }
    }

    fn lose_device(&mut self, reason: String) {
        tracing::error!("Motion device lost: {}", reason);
        if let Some(mut hal) = self.hal.take() {
            if let Err(e) = hal.close() {
                tracing::warn!("Failed to close motion device: {}", e);
            }
        }
        *self.shared.position.write() = None;
        self.shared.events.publish(MotionEvent::DeviceLost(reason));

        match self.shared.timing.reboot_period {
            Some(period) => {
                tracing::info!("Re-initializing motion device in {:?}", period);
                self.next_reboot = Some(Instant::now() + period);
            }
            None => {
                tracing::error!("Motion worker halted; no reboot configured");
                self.shared.queue.lock().halted = true;
            }
        }
    }

    fn reboot(&mut self) {
        match (self.factory)() {
            Ok(hal) => {
                tracing::info!("Motion device re-initialized on '{}'", hal.driver_name());
                self.hal = Some(hal);
                self.next_reboot = None;
                self.last_poll = None;
                self.shared.events.publish(MotionEvent::DeviceRecovered);
            }
            Err(e) => {
                let period = self
                    .shared
                    .timing
                    .reboot_period
                    .unwrap_or(self.shared.timing.status_period);
                tracing::warn!("Motion device re-initialization failed: {}", e);
                self.next_reboot = Some(Instant::now() + period);
            }
        }
    }
}

fn run_command(
    hal: &mut MotionHal,
    command: &MotionCommand,
    jog_period: Duration,
) -> CommandResult {
    let done = |_| CommandOutput::Done;
    let outcome = match command {
        MotionCommand::MoveAbsolute(target) => hal.move_absolute(target).map(done),
        MotionCommand::MoveRelative(delta) => hal.move_relative(delta).map(done),
        MotionCommand::JogRelative { delta, rate } => hal.jog_relative(delta, *rate).map(done),
        MotionCommand::JogAbsolute { target, rate } => hal.jog_absolute(target, *rate).map(done),
        MotionCommand::JogFractions(fractions) => {
            match fractions_to_jog(fractions, &hal.velocity_limits(), jog_period) {
                Some((delta, rate)) => hal.jog_relative(&delta, rate).map(done),
                None => hal.jog_cancel().map(done),
            }
        }
        MotionCommand::JogCancel => hal.jog_cancel().map(done),
        MotionCommand::Home => hal.home().map(done),
        MotionCommand::On => hal.on().map(done),
        MotionCommand::Off => hal.off().map(done),
        MotionCommand::QueryPosition => hal.position().map(CommandOutput::Position),
        MotionCommand::SetModifier { kind, enabled } => {
            hal.set_modifier_enabled(*kind, *enabled);
            Ok(CommandOutput::Done)
        }
    };
    outcome.map_err(into_motion_error)
}

/// Convert per-axis velocity fractions into one jog shorter than a jog period
///
/// The rate is the requested speed; the distance covers `JOG_UNDERDRIVE` of the
/// period at that speed. Returns `None` when every fraction is zero (the caller
/// cancels instead).
pub fn fractions_to_jog(
    fractions: &AxisMap<f64>,
    max_velocities: &AxisMap<f64>,
    period: Duration,
) -> Option<(Position, f64)> {
    let seconds = period.as_secs_f64();
    let mut delta = Position::new();
    let mut speed_sq = 0.0;
    for (axis, fraction) in fractions {
        let fraction = fraction.clamp(-1.0, 1.0);
        if fraction.abs() < 1e-6 {
            continue;
        }
        let Some(vmax) = max_velocities.get(axis) else {
            continue;
        };
        let speed = fraction.abs() * vmax;
        delta.set(*axis, fraction.signum() * speed * seconds * JOG_UNDERDRIVE);
        speed_sq += speed * speed;
    }
    if delta.is_empty() || speed_sq <= 0.0 {
        return None;
    }
    Some((delta, speed_sq.sqrt()))
}

fn into_motion_error(error: Error) -> MotionError {
    match error {
        Error::Motion(e) => e,
        Error::Io(e) => MotionError::critical(e.to_string()),
        other => MotionError::invalid_state(other.to_string()),
    }
}
