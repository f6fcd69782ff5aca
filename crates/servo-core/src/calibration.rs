use crate::flags::{MAX_POSITION, MIN_POSITION};
use serde::{Deserialize, Serialize};

/// Value written for a channel that is switched off.
pub const NEUTRAL_OUTPUT: f64 = 0.0;

/// Affine map from the [0, 180] logical domain to the physical output range.
///
/// Defaults are pi-blaster duty fractions for a 50Hz servo (1ms..5ms of 20ms).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    pub min_output: f64,
    pub max_output: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            min_output: 0.05,
            max_output: 0.25,
        }
    }
}

impl Calibration {
    pub fn new(min_output: f64, max_output: f64) -> Self {
        Self {
            min_output,
            max_output,
        }
    }

    pub fn to_output(&self, position: f64) -> f64 {
        let span = MAX_POSITION - MIN_POSITION;
        self.min_output + (position - MIN_POSITION) * (self.max_output - self.min_output) / span
    }

    /// Inverse of [`Calibration::to_output`]. A degenerate range maps everything to 0.
    pub fn to_position(&self, output: f64) -> f64 {
        let range = self.max_output - self.min_output;
        if range == 0.0 {
            return MIN_POSITION;
        }
        MIN_POSITION + (output - self.min_output) * (MAX_POSITION - MIN_POSITION) / range
    }
}
