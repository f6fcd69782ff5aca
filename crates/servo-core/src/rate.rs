use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::thread;
use std::time::Duration;

/// Stepper period: roughly 0.19s per 60 units at full speed.
pub const STEP_PERIOD: Duration = Duration::from_millis(3);

const SAMPLE_BASE_MS: f64 = 3.0;
const SAMPLE_LOG_SCALE_MS: f64 = 10.0;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket that caps how often a single stepper may advance.
pub struct StepLimiter {
    limiter: DirectLimiter,
    clock: DefaultClock,
}

impl StepLimiter {
    /// One token per `period`, burst of one. Zero periods fall back to [`STEP_PERIOD`].
    pub fn new(period: Duration) -> Self {
        let quota = Quota::with_period(period)
            .or_else(|| Quota::with_period(STEP_PERIOD))
            .expect("STEP_PERIOD is non-zero");
        Self {
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
        }
    }

    /// Blocks the calling thread until a token is available.
    pub fn until_ready(&self) {
        while let Err(not_until) = self.limiter.check() {
            thread::sleep(not_until.wait_time_from(self.clock.now()));
        }
    }
}

impl Default for StepLimiter {
    fn default() -> Self {
        Self::new(STEP_PERIOD)
    }
}

impl std::fmt::Debug for StepLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepLimiter").finish_non_exhaustive()
    }
}

/// Dispatcher sampling period for `active` registered servos.
///
/// Grows with log10 of the fleet size so total sampling work stays bounded.
pub fn sample_interval(active: usize) -> Duration {
    let ms = SAMPLE_BASE_MS + SAMPLE_LOG_SCALE_MS * ((active as f64) + 1.0).log10();
    Duration::from_micros((ms * 1000.0).round() as u64)
}
