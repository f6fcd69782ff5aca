//! Per-servo motion state machine.
//!
//! A servo is `Idle` while `position == target` and `Moving` otherwise. Moving
//! servos own a stepper thread that advances `position` toward `target` at the
//! configured speed, paced by a [`StepLimiter`]. Settling wakes every waiter.

use crate::calibration::Calibration;
use crate::dispatcher::{DispatcherHandle, OutputSource};
use crate::error::ServoError;
use crate::flags::{clamp_position, Flags, MIN_POSITION};
use crate::rate::StepLimiter;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Full-speed rate in units per second (0.19s per 60 units).
pub const MAX_SPEED: f64 = 315.7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub channel: u32,
    pub name: Option<String>,
    #[serde(flatten)]
    pub calibration: Calibration,
    /// Starting position in the raw [0, 180] domain, written on connect.
    /// Without it the servo assumes 0 and stays silent until commanded.
    pub initial_position: Option<f64>,
    /// Fraction of [`MAX_SPEED`], clamped to [0, 1].
    pub speed: f64,
    pub centered: bool,
    pub normalized: bool,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            name: None,
            calibration: Calibration::default(),
            initial_position: None,
            speed: 1.0,
            centered: false,
            normalized: false,
        }
    }
}

impl ServoConfig {
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            ..Default::default()
        }
    }

    pub fn flags(&self) -> Flags {
        let mut flags = Flags::NONE;
        if self.centered {
            flags |= Flags::CENTERED;
        }
        if self.normalized {
            flags |= Flags::NORMALIZED;
        }
        flags
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Motion {
    pub(crate) position: f64,
    pub(crate) target: f64,
    pub(crate) speed: f64,
    pub(crate) flags: Flags,
    pub(crate) settled: bool,
    stepping: bool,
    dirty: bool,
    closed: bool,
}

impl Motion {
    pub(crate) fn at(position: f64, speed: f64, flags: Flags) -> Self {
        let position = if position.is_nan() {
            MIN_POSITION
        } else {
            clamp_position(position)
        };
        Self {
            position,
            target: position,
            speed: if speed.is_nan() { 1.0 } else { speed.clamp(0.0, 1.0) },
            flags,
            settled: true,
            stepping: false,
            dirty: false,
            closed: false,
        }
    }

    /// Sets a new raw target. Returns `true` if this settled a moving servo.
    pub(crate) fn retarget(&mut self, raw: f64) -> bool {
        self.target = if self.speed > 0.0 {
            clamp_position(raw)
        } else {
            self.position
        };
        if self.target == self.position {
            let was_moving = !self.settled;
            self.settled = true;
            return was_moving;
        }
        self.settled = false;
        false
    }

    /// Advances by `dt` seconds toward the target. Returns `true` when this step settled.
    pub(crate) fn step(&mut self, dt: f64) -> bool {
        if self.settled {
            return false;
        }
        if self.speed <= 0.0 {
            self.target = self.position;
            self.settled = true;
            return true;
        }

        let reach = MAX_SPEED * self.speed * dt.max(0.0);
        let delta = self.target - self.position;
        self.dirty = true;
        if delta.abs() <= reach {
            self.position = self.target;
            self.settled = true;
            true
        } else {
            self.position += reach.copysign(delta);
            false
        }
    }

    /// Holds position where it is. Returns `true` if the servo was moving.
    pub(crate) fn halt(&mut self) -> bool {
        self.target = self.position;
        let was_moving = !self.settled;
        self.settled = true;
        was_moving
    }
}

fn initial_motion(config: &ServoConfig, flags: Flags) -> Motion {
    let mut motion = Motion::at(
        config.initial_position.unwrap_or(MIN_POSITION),
        config.speed,
        flags,
    );
    motion.dirty = config.initial_position.is_some();
    motion
}

#[derive(Debug)]
struct ServoShared {
    channel: u32,
    name: String,
    calibration: Calibration,
    motion: Mutex<Motion>,
    settled: Condvar,
    limiter: StepLimiter,
    stepper: Mutex<Option<JoinHandle<()>>>,
}

impl ServoShared {
    fn run_stepper(&self) {
        let mut last = Instant::now();
        loop {
            self.limiter.until_ready();
            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64();
            last = now;

            let mut motion = self.motion.lock();
            if motion.closed || motion.settled {
                motion.stepping = false;
                return;
            }
            if motion.step(dt) {
                motion.stepping = false;
                self.settled.notify_all();
                return;
            }
        }
    }
}

impl OutputSource for ServoShared {
    fn channel(&self) -> u32 {
        self.channel
    }

    fn sample(&self) -> Option<f64> {
        let mut motion = self.motion.lock();
        if motion.closed || (motion.settled && !motion.dirty) {
            return None;
        }
        motion.dirty = false;
        Some(self.calibration.to_output(motion.position))
    }
}

/// A servo on one output channel.
///
/// All methods take `&self`; share it across threads with `Arc`.
#[derive(Debug)]
pub struct Servo {
    shared: Arc<ServoShared>,
    dispatcher: DispatcherHandle,
}

impl Servo {
    /// Connects a servo with default calibration at position 0.
    pub fn connect(dispatcher: &DispatcherHandle, channel: u32) -> Result<Self, ServoError> {
        Self::connect_with(dispatcher, ServoConfig::new(channel))
    }

    pub fn connect_with(dispatcher: &DispatcherHandle, config: ServoConfig) -> Result<Self, ServoError> {
        let channel = config.channel;
        let flags = config.flags();
        let motion = initial_motion(&config, flags);
        let shared = Arc::new(ServoShared {
            channel,
            name: config.name.unwrap_or_else(|| format!("Servo{}", channel)),
            calibration: config.calibration,
            motion: Mutex::new(motion),
            settled: Condvar::new(),
            limiter: StepLimiter::default(),
            stepper: Mutex::new(None),
        });

        let source: Arc<dyn OutputSource> = shared.clone();
        dispatcher
            .subscribe(source)
            .map_err(|source| ServoError::Register { channel, source })?;

        debug!("Connected servo {:?} on channel {}", shared.name, channel);
        Ok(Self {
            shared,
            dispatcher: dispatcher.clone(),
        })
    }

    pub fn channel(&self) -> u32 {
        self.shared.channel
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn calibration(&self) -> Calibration {
        self.shared.calibration
    }

    pub fn flags(&self) -> Flags {
        self.shared.motion.lock().flags
    }

    pub fn set_flags(&self, flags: Flags) {
        self.shared.motion.lock().flags = flags;
    }

    /// Current position in the flagged domain.
    pub fn position(&self) -> f64 {
        let motion = self.shared.motion.lock();
        motion.flags.apply(motion.position)
    }

    /// Current target in the flagged domain.
    pub fn target(&self) -> f64 {
        let motion = self.shared.motion.lock();
        motion.flags.apply(motion.target)
    }

    pub fn is_settled(&self) -> bool {
        self.shared.motion.lock().settled
    }

    /// Calibrated output for the current position.
    pub fn output(&self) -> f64 {
        let position = self.shared.motion.lock().position;
        self.shared.calibration.to_output(position)
    }

    /// Current speed as a fraction of [`MAX_SPEED`].
    pub fn speed(&self) -> f64 {
        self.shared.motion.lock().speed
    }

    /// Sets a new target in the flagged domain and starts moving if needed.
    ///
    /// Out-of-range targets are clamped; NaN is ignored. Non-blocking; chain
    /// [`Servo::wait`] to block until the target is reached.
    pub fn move_to(&self, value: f64) -> &Self {
        if value.is_nan() {
            debug!("Servo {} ignoring NaN target", self.shared.channel);
            return self;
        }

        let mut motion = self.shared.motion.lock();
        if motion.closed {
            return self;
        }
        let raw = motion.flags.invert(value);
        if motion.retarget(raw) {
            self.shared.settled.notify_all();
        }
        if motion.settled || motion.stepping {
            return self;
        }

        motion.stepping = true;
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("servo-{}", self.shared.channel))
            .spawn(move || shared.run_stepper());

        match spawned {
            Ok(handle) => {
                let previous = self.shared.stepper.lock().replace(handle);
                drop(motion);
                if let Some(previous) = previous {
                    // Already flagged as not stepping, so it is on its way out.
                    let _ = previous.join();
                }
            }
            Err(e) => {
                error!(
                    "Servo {} could not start stepping: {}",
                    self.shared.channel, e
                );
                motion.stepping = false;
                motion.halt();
                self.shared.settled.notify_all();
            }
        }
        self
    }

    /// Holds the current position. Wakes waiters even if already idle.
    pub fn stop(&self) {
        let mut motion = self.shared.motion.lock();
        motion.halt();
        self.shared.settled.notify_all();
    }

    /// Sets the speed as a fraction of [`MAX_SPEED`], clamped to [0, 1].
    /// Applies from the next step.
    pub fn set_speed(&self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        self.shared.motion.lock().speed = fraction.clamp(0.0, 1.0);
    }

    /// Jumps to `value` (flagged domain) without interpolation.
    pub fn set_position(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let mut motion = self.shared.motion.lock();
        if motion.closed {
            return;
        }
        let raw = clamp_position(motion.flags.invert(value));
        motion.position = raw;
        motion.target = raw;
        motion.settled = true;
        motion.dirty = true;
        self.shared.settled.notify_all();
    }

    /// Blocks until the servo is settled.
    pub fn wait(&self) {
        let mut motion = self.shared.motion.lock();
        while !motion.settled {
            self.shared.settled.wait(&mut motion);
        }
    }

    /// Deregisters the servo, which turns its channel off, and stops its stepper.
    /// Later calls are no-ops.
    pub fn close(&self) {
        {
            let mut motion = self.shared.motion.lock();
            if motion.closed {
                return;
            }
            motion.closed = true;
            motion.halt();
            self.shared.settled.notify_all();
        }

        let source: Arc<dyn OutputSource> = self.shared.clone();
        if let Err(e) = self.dispatcher.unsubscribe(source) {
            debug!("Servo {} closed after dispatcher: {}", self.shared.channel, e);
        }
        let stepper = self.shared.stepper.lock().take();
        if let Some(stepper) = stepper {
            let _ = stepper.join();
        }
        debug!("Closed servo on channel {}", self.shared.channel);
    }
}

impl Drop for Servo {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Servo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "servo {:?} connected to channel({}) [flags: {}]",
            self.shared.name,
            self.shared.channel,
            self.flags()
        )
    }
}
