use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Logical domain of a servo before any flag transform.
pub const MIN_POSITION: f64 = 0.0;
pub const MAX_POSITION: f64 = 180.0;

const HALF_RANGE: f64 = 90.0;

/// Display/input transforms applied on top of the [0, 180] domain.
///
/// `CENTERED` shifts the range to [-90, 90], `NORMALIZED` scales it to [0, 2].
/// Together they give [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const CENTERED: Flags = Flags(1 << 0);
    pub const NORMALIZED: Flags = Flags(1 << 1);

    pub fn contains(self, other: Flags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Maps a raw position into the flagged domain (centered first, then normalized).
    pub fn apply(self, raw: f64) -> f64 {
        let mut value = raw;
        if self.contains(Flags::CENTERED) {
            value -= HALF_RANGE;
        }
        if self.contains(Flags::NORMALIZED) {
            value /= HALF_RANGE;
        }
        value
    }

    /// Maps a flagged value back to the raw domain. Not clamped.
    pub fn invert(self, value: f64) -> f64 {
        let mut raw = value;
        if self.contains(Flags::NORMALIZED) {
            raw *= HALF_RANGE;
        }
        if self.contains(Flags::CENTERED) {
            raw += HALF_RANGE;
        }
        raw
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("( NONE )");
        }
        f.write_str("(")?;
        if self.contains(Flags::CENTERED) {
            f.write_str(" Centered")?;
        }
        if self.contains(Flags::NORMALIZED) {
            f.write_str(" Normalized")?;
        }
        f.write_str(" )")
    }
}

/// Clamps into the raw domain. NaN is passed through for the caller to reject.
pub fn clamp_position(raw: f64) -> f64 {
    raw.clamp(MIN_POSITION, MAX_POSITION)
}
