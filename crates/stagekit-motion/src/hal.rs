//! Motion hardware abstraction layer
//!
//! [`MotionHal`] wraps a [`MotionDriver`] with the coordinate modifier chain
//! and exposes everything in user units. Every position it reports holds
//! exactly the axes the driver declares; move and jog requests may name a
//! subset and are completed from a position snapshot taken at entry.
//!
//! Frames are numbered by chain depth: frame 0 is the user frame, frame `i`
//! is what modifier `i` receives and frame `n` is the device frame.

use crate::driver::MotionDriver;
use crate::modifier::{
    build_chain, CoordinateModifier, ModifierContext, ModifierKind, DEFAULT_EPSILON,
};
use stagekit_core::{
    Axis, AxisMap, AxisRange, AxisSet, ConfigurationError, MotionError, Position, Result,
};
use stagekit_settings::{ModifierFlags, MotionSettings};

/// Motion HAL: driver plus modifier chain
pub struct MotionHal {
    driver: Box<dyn MotionDriver>,
    chain: Vec<Box<dyn CoordinateModifier>>,
    flags: ModifierFlags,
    axes: AxisSet,
    epsilon_steps: f64,
    epsilon: AxisMap<f64>,
    soft_limits: AxisMap<AxisRange>,
    /// Estimated end of the jog in flight, one entry per frame
    jog_end: Option<Vec<Position>>,
}

impl MotionHal {
    /// Wrap a driver using the modifier tables and flags from `settings`
    pub fn new(driver: Box<dyn MotionDriver>, settings: &MotionSettings) -> Result<Self> {
        let axes = driver.axes();
        let tables = settings
            .backlash
            .keys()
            .map(|a| ("backlash", a))
            .chain(settings.soft_limits.keys().map(|a| ("soft_limits", a)))
            .chain(settings.scalars.keys().map(|a| ("scalars", a)));
        for (table, axis) in tables {
            if !axes.contains(axis) {
                return Err(ConfigurationError::invalid(
                    format!("motion.{}.{}", table, axis),
                    format!("driver '{}' has no {} axis", driver.name(), axis),
                )
                .into());
            }
        }

        let mut hal = Self {
            driver,
            chain: build_chain(settings),
            flags: settings.modifiers,
            axes,
            epsilon_steps: settings.epsilon_steps,
            epsilon: AxisMap::new(),
            soft_limits: settings.soft_limits.clone(),
            jog_end: None,
        };
        hal.refresh_epsilon();
        tracing::info!(
            "Motion HAL ready on '{}' with axes {:?}",
            hal.driver.name(),
            hal.axes
        );
        Ok(hal)
    }

    /// Declared axes
    pub fn axes(&self) -> &AxisSet {
        &self.axes
    }

    /// Name of the underlying driver
    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Smallest distinguishable move per axis in user units
    pub fn epsilon(&self) -> &AxisMap<f64> {
        &self.epsilon
    }

    /// Whether a modifier is active
    pub fn modifier_enabled(&self, kind: ModifierKind) -> bool {
        kind.enabled_in(&self.flags)
    }

    /// Enable or disable a modifier; its tracked state is reset
    pub fn set_modifier_enabled(&mut self, kind: ModifierKind, enabled: bool) {
        if kind.enabled_in(&self.flags) == enabled {
            return;
        }
        kind.set_in(&mut self.flags, enabled);
        for modifier in self.chain.iter_mut().filter(|m| m.kind() == kind) {
            modifier.reset();
        }
        self.jog_end = None;
        self.refresh_epsilon();
        tracing::info!(
            "Modifier {} {}",
            kind,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Current position in user units
    pub fn position(&mut self) -> Result<Position> {
        let frames = self.frame_positions()?;
        Ok(frames.into_iter().next().unwrap_or_default())
    }

    /// Move to an absolute user position and block until done
    pub fn move_absolute(&mut self, target: &Position) -> Result<()> {
        self.check_axes(target)?;
        if self.jog_end.is_some() {
            if self.driver.jog_active()? {
                return Err(MotionError::invalid_state("move requested while jogging").into());
            }
            self.jog_end = None;
        }

        let mut frames = self.frame_positions()?;
        let target = frames[0].merged(target);
        tracing::debug!("Move to {}", target);
        self.dispatch_move(0, &target, &mut frames)
    }

    /// Move by a user-space delta relative to the position at entry
    pub fn move_relative(&mut self, delta: &Position) -> Result<()> {
        self.check_axes(delta)?;
        let start = self.position()?;
        self.move_absolute(&start.offset_by(delta))
    }

    /// Start a relative jog at `rate` (user units per second)
    pub fn jog_relative(&mut self, delta: &Position, rate: f64) -> Result<()> {
        self.check_axes(delta)?;
        if delta.is_empty() {
            return Err(MotionError::invalid_state("jog without axes").into());
        }
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(MotionError::invalid_state(format!("invalid jog rate {}", rate)).into());
        }

        let jogging = self.jog_end.is_some() && self.driver.jog_active()?;
        let mut frames = match self.jog_end.take() {
            Some(end) if jogging => end,
            _ => self.frame_positions()?,
        };
        // Frames are only advanced once the driver accepted the jog
        let result = self.dispatch_jog(0, delta, rate, &mut frames);
        if result.is_ok() || jogging {
            self.jog_end = Some(frames);
        }
        result
    }

    /// Jog toward an absolute user position at `rate`
    pub fn jog_absolute(&mut self, target: &Position, rate: f64) -> Result<()> {
        self.check_axes(target)?;
        let jogging = self.jog_end.is_some() && self.driver.jog_active()?;
        let base = match self.jog_estimated_end().cloned() {
            Some(end) if jogging => end,
            _ => self.position()?,
        };
        let delta = target.delta_from(&base);
        self.jog_relative(&delta, rate)
    }

    /// Cancel any jog in flight
    pub fn jog_cancel(&mut self) -> Result<()> {
        self.jog_end = None;
        self.driver.jog_cancel()
    }

    /// Whether the device is still jogging
    pub fn jog_active(&mut self) -> Result<bool> {
        self.driver.jog_active()
    }

    /// Estimated user position at the end of the jog in flight
    pub fn jog_estimated_end(&self) -> Option<&Position> {
        self.jog_end.as_ref().and_then(|frames| frames.first())
    }

    /// Run the homing cycle
    pub fn home(&mut self) -> Result<()> {
        self.forget_state();
        self.driver.home()
    }

    /// Controlled stop
    pub fn stop(&mut self) -> Result<()> {
        self.jog_end = None;
        self.driver.stop()
    }

    /// Immediate halt, bypassing the modifier chain
    pub fn estop(&mut self) -> Result<()> {
        self.forget_state();
        self.driver.estop()
    }

    /// Energize motors
    pub fn on(&mut self) -> Result<()> {
        self.driver.on()
    }

    /// De-energize motors; compensation state is no longer trustworthy
    pub fn off(&mut self) -> Result<()> {
        self.forget_state();
        self.driver.off()
    }

    /// Release the device
    pub fn close(&mut self) -> Result<()> {
        self.jog_end = None;
        self.driver.close()
    }

    /// Maximum velocity per axis in user units per second
    pub fn velocity_limits(&self) -> AxisMap<f64> {
        let device = self.driver.max_velocities();
        self.magnitudes_out(device)
    }

    /// Maximum acceleration per axis in user units per second squared
    pub fn acceleration_limits(&self) -> AxisMap<f64> {
        let device = self.driver.max_accelerations();
        self.magnitudes_out(device)
    }

    /// Machine travel range per axis in user units
    pub fn machine_limits(&self) -> AxisMap<AxisRange> {
        let device = self.driver.machine_limits();
        let lo = Position::from_pairs(device.iter().map(|(a, r)| (*a, r.min)));
        let hi = Position::from_pairs(device.iter().map(|(a, r)| (*a, r.max)));
        let (lo, hi) = (self.to_user(lo), self.to_user(hi));
        lo.iter()
            .filter_map(|(axis, a)| {
                hi.get(axis)
                    .map(|b| (axis, AxisRange::new(a.min(b), a.max(b))))
            })
            .collect()
    }

    /// Steps per user unit
    pub fn steps_per_mm(&self) -> AxisMap<f64> {
        self.driver
            .steps_per_mm()
            .into_iter()
            .map(|(axis, steps)| (axis, steps / self.magnitude_out(axis, 1.0)))
            .collect()
    }

    fn forget_state(&mut self) {
        self.jog_end = None;
        for modifier in self.chain.iter_mut() {
            modifier.reset();
        }
    }

    fn check_axes(&self, request: &Position) -> Result<()> {
        match request.axes().difference(&self.axes).next() {
            Some(axis) => Err(MotionError::invalid_state(format!(
                "axis {} is not declared by '{}'",
                axis,
                self.driver.name()
            ))
            .into()),
            None => Ok(()),
        }
    }

    fn is_active(&self, index: usize) -> bool {
        self.chain[index].kind().enabled_in(&self.flags)
    }

    /// Soft limits as seen by modifier `index`, while its frame is still in user units
    fn limits_for(&self, index: usize) -> Option<&AxisMap<AxisRange>> {
        if !ModifierKind::SoftLimit.enabled_in(&self.flags) {
            return None;
        }
        let rescaled =
            (0..index).any(|i| self.is_active(i) && self.chain[i].kind() == ModifierKind::Scalar);
        (!rescaled).then_some(&self.soft_limits)
    }

    /// Positions in every frame, from one device snapshot
    fn frame_positions(&mut self) -> Result<Vec<Position>> {
        let device = self.driver.position()?.restricted_to(&self.axes);
        let mut frames = vec![device];
        for index in (0..self.chain.len()).rev() {
            let below = frames.last().cloned().unwrap_or_default();
            let above = if self.is_active(index) {
                self.chain[index].pos_out(&below)
            } else {
                below
            };
            frames.push(above);
        }
        frames.reverse();
        Ok(frames)
    }

    fn to_user(&self, device: Position) -> Position {
        (0..self.chain.len()).rev().fold(device, |pos, index| {
            if self.is_active(index) {
                self.chain[index].pos_out(&pos)
            } else {
                pos
            }
        })
    }

    fn magnitude_out(&self, axis: Axis, value: f64) -> f64 {
        (0..self.chain.len()).rev().fold(value, |v, index| {
            if self.is_active(index) {
                self.chain[index].magnitude_out(axis, v)
            } else {
                v
            }
        })
    }

    fn magnitudes_out(&self, device: AxisMap<f64>) -> AxisMap<f64> {
        device
            .into_iter()
            .map(|(axis, v)| (axis, self.magnitude_out(axis, v)))
            .collect()
    }

    fn refresh_epsilon(&mut self) {
        let steps = self.driver.steps_per_mm();
        self.epsilon = self
            .axes
            .iter()
            .map(|axis| {
                let device_eps = match steps.get(axis) {
                    Some(s) if *s > 0.0 => self.epsilon_steps / s,
                    _ => DEFAULT_EPSILON,
                };
                (*axis, self.magnitude_out(*axis, device_eps))
            })
            .collect();
    }

    fn dispatch_move(
        &mut self,
        index: usize,
        target: &Position,
        frames: &mut [Position],
    ) -> Result<()> {
        let result = if index == self.chain.len() {
            self.driver.move_absolute(target)
        } else if !self.is_active(index) {
            self.dispatch_move(index + 1, target, frames)
        } else {
            let plan = {
                let ctx = ModifierContext {
                    current: &frames[index],
                    epsilon: &self.epsilon,
                    limits: self
                        .limits_for(index)
                        .is_some()
                        .then_some(&self.soft_limits),
                };
                self.chain[index].move_pre(&ctx, target)?
            };
            let mut result = Ok(());
            for prelude in &plan.prelude {
                result = self.dispatch_move(index + 1, prelude, frames);
                if result.is_err() {
                    break;
                }
            }
            if result.is_ok() {
                result = self.dispatch_move(index + 1, &plan.target, frames);
            }
            self.chain[index].move_post(target, result.is_ok());
            result
        };

        if result.is_ok() {
            frames[index] = frames[index].merged(target);
        }
        result
    }

    fn dispatch_jog(
        &mut self,
        index: usize,
        delta: &Position,
        rate: f64,
        frames: &mut [Position],
    ) -> Result<()> {
        if index == self.chain.len() {
            self.driver.jog_relative(delta, rate)?;
            frames[index] = frames[index].offset_by(delta);
            return Ok(());
        }
        if !self.is_active(index) {
            self.dispatch_jog(index + 1, delta, rate, frames)?;
            frames[index] = frames[index + 1].clone();
            return Ok(());
        }

        let (next_delta, next_rate) = {
            let ctx = ModifierContext {
                current: &frames[index],
                epsilon: &self.epsilon,
                limits: self
                    .limits_for(index)
                    .is_some()
                    .then_some(&self.soft_limits),
            };
            self.chain[index].jog_pre(&ctx, delta, rate)?
        };
        self.dispatch_jog(index + 1, &next_delta, next_rate, frames)?;
        self.chain[index].jog_post(&next_delta);
        frames[index] = self.chain[index].pos_out(&frames[index + 1]);
        Ok(())
    }
}
