//! In-process simulated stage
//!
//! Implements [`MotionDriver`] against an in-memory position. Clones share
//! state, so a test can keep one handle to inspect recorded traffic while the
//! HAL owns another.

use crate::driver::MotionDriver;
use stagekit_core::{
    thread_safe, Axis, AxisMap, AxisRange, AxisSet, MotionError, Position, Result, ThreadSafe,
};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct SimState {
    position: Position,
    moves: Vec<Position>,
    jogs: Vec<(Position, f64)>,
    jog_until: Option<Instant>,
    homed: usize,
    stops: usize,
    estops: usize,
    powered: bool,
    closed: bool,
    fail_next: Option<MotionError>,
}

/// Simulated motion device
#[derive(Debug, Clone)]
pub struct SimulatedStage {
    axes: AxisSet,
    steps_per_mm: f64,
    max_velocity: f64,
    max_acceleration: f64,
    travel: AxisRange,
    move_delay: Duration,
    state: ThreadSafe<SimState>,
}

impl SimulatedStage {
    /// Stage with the given axes, all starting at zero
    pub fn new(axes: AxisSet) -> Self {
        let position = Position::zero(&axes);
        Self {
            axes,
            steps_per_mm: 1000.0,
            max_velocity: 10.0,
            max_acceleration: 100.0,
            travel: AxisRange::new(-1000.0, 1000.0),
            move_delay: Duration::ZERO,
            state: thread_safe(SimState {
                position,
                moves: Vec::new(),
                jogs: Vec::new(),
                jog_until: None,
                homed: 0,
                stops: 0,
                estops: 0,
                powered: true,
                closed: false,
                fail_next: None,
            }),
        }
    }

    /// Three-axis X/Y/Z stage
    pub fn xyz() -> Self {
        Self::new([Axis::X, Axis::Y, Axis::Z].into_iter().collect())
    }

    /// Set the step resolution for every axis
    pub fn with_steps_per_mm(mut self, steps: f64) -> Self {
        self.steps_per_mm = steps;
        self
    }

    /// Set the maximum velocity for every axis
    pub fn with_max_velocity(mut self, velocity: f64) -> Self {
        self.max_velocity = velocity;
        self
    }

    /// Set the travel range for every axis
    pub fn with_travel(mut self, travel: AxisRange) -> Self {
        self.travel = travel;
        self
    }

    /// Sleep this long inside every absolute move
    pub fn with_move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }

    /// Make the next absolute move fail with `error`
    pub fn fail_next_move(&self, error: MotionError) {
        self.state.lock().fail_next = Some(error);
    }

    /// Every absolute move the device executed, in device units
    pub fn moves(&self) -> Vec<Position> {
        self.state.lock().moves.clone()
    }

    /// Every accepted jog (delta, rate)
    pub fn jogs(&self) -> Vec<(Position, f64)> {
        self.state.lock().jogs.clone()
    }

    /// Current device position
    pub fn device_position(&self) -> Position {
        self.state.lock().position.clone()
    }

    /// Number of homing cycles
    pub fn home_count(&self) -> usize {
        self.state.lock().homed
    }

    /// Number of stop calls
    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }

    /// Number of estop calls
    pub fn estop_count(&self) -> usize {
        self.state.lock().estops
    }

    /// Whether the motors are energized
    pub fn is_powered(&self) -> bool {
        self.state.lock().powered
    }

    /// Whether the device has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_fault(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(MotionError::critical("simulated stage is closed").into());
        }
        Ok(())
    }

    fn per_axis<T: Copy>(&self, value: T) -> AxisMap<T> {
        self.axes.iter().map(|a| (*a, value)).collect()
    }
}

impl MotionDriver for SimulatedStage {
    fn name(&self) -> &str {
        "simulated"
    }

    fn axes(&self) -> AxisSet {
        self.axes.clone()
    }

    fn move_absolute(&mut self, target: &Position) -> Result<()> {
        self.check_fault()?;
        if let Some(error) = self.state.lock().fail_next.take() {
            return Err(error.into());
        }
        for (axis, value) in target.iter() {
            if !self.travel.contains(value, 0.0) {
                return Err(MotionError::invalid_state(format!(
                    "{}={:.4} is outside machine travel",
                    axis, value
                ))
                .into());
            }
        }
        if !self.move_delay.is_zero() {
            std::thread::sleep(self.move_delay);
        }
        let mut state = self.state.lock();
        state.position = state.position.merged(target);
        state.moves.push(target.clone());
        state.jog_until = None;
        Ok(())
    }

    fn position(&mut self) -> Result<Position> {
        self.check_fault()?;
        Ok(self.state.lock().position.clone())
    }

    fn jog_relative(&mut self, delta: &Position, rate: f64) -> Result<()> {
        self.check_fault()?;
        let mut state = self.state.lock();
        let end = state.position.offset_by(delta);
        let distance = delta.iter().map(|(_, d)| d * d).sum::<f64>().sqrt();
        let duration = Duration::from_secs_f64((distance / rate.max(1e-9)).min(3600.0));
        let until = state
            .jog_until
            .unwrap_or_else(Instant::now)
            .max(Instant::now())
            + duration;
        state.position = end;
        state.jogs.push((delta.clone(), rate));
        state.jog_until = Some(until);
        Ok(())
    }

    fn jog_cancel(&mut self) -> Result<()> {
        self.check_fault()?;
        self.state.lock().jog_until = None;
        Ok(())
    }

    fn jog_active(&mut self) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.jog_until.is_some_and(|t| Instant::now() < t))
    }

    fn max_velocities(&self) -> AxisMap<f64> {
        self.per_axis(self.max_velocity)
    }

    fn max_accelerations(&self) -> AxisMap<f64> {
        self.per_axis(self.max_acceleration)
    }

    fn machine_limits(&self) -> AxisMap<AxisRange> {
        self.per_axis(self.travel)
    }

    fn steps_per_mm(&self) -> AxisMap<f64> {
        self.per_axis(self.steps_per_mm)
    }

    fn home(&mut self) -> Result<()> {
        self.check_fault()?;
        let mut state = self.state.lock();
        state.position = Position::zero(&self.axes);
        state.homed += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.stops += 1;
        state.jog_until = None;
        Ok(())
    }

    fn estop(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.estops += 1;
        state.jog_until = None;
        Ok(())
    }

    fn on(&mut self) -> Result<()> {
        self.check_fault()?;
        self.state.lock().powered = true;
        Ok(())
    }

    fn off(&mut self) -> Result<()> {
        self.check_fault()?;
        self.state.lock().powered = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().closed = true;
        tracing::debug!("Simulated stage closed");
        Ok(())
    }
}
