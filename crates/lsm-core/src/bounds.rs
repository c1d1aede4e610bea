//! Channel bounds and affine calibration functions.

use serde::{Deserialize, Serialize};

use crate::error::{LsmError, LsmResult};

/// Closed range a DOF value must stay within.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelBounds {
    /// Lower bound (inclusive).
    pub min: f64,
    /// Upper bound (inclusive).
    pub max: f64,
}

impl ChannelBounds {
    /// Create bounds.
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Bounds accepting every finite value.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self::new(f64::MIN, f64::MAX)
    }

    /// Whether `value` lies inside the bounds. NaN never does.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Reject `value` with [`LsmError::OutOfBounds`] if it lies outside.
    pub fn check(&self, dof: impl Into<String>, value: f64) -> LsmResult<f64> {
        if self.contains(value) {
            Ok(value)
        } else {
            Err(LsmError::OutOfBounds {
                dof: dof.into(),
                value,
                min: self.min,
                max: self.max,
            })
        }
    }

    /// Width of the range.
    #[must_use]
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Clamp `value` into the bounds.
    #[must_use]
    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }

    /// Whether `min <= max`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }
}

impl Default for ChannelBounds {
    fn default() -> Self {
        Self::new(-1.0, 1.0)
    }
}

/// Maps a DOF value in physical units onto a control voltage:
/// `slope * x + constant`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineFunction {
    /// Gain.
    pub slope: f64,
    /// Offset.
    pub constant: f64,
}

impl AffineFunction {
    /// Create a function.
    #[must_use]
    pub const fn new(slope: f64, constant: f64) -> Self {
        Self { slope, constant }
    }

    /// `f(x) = x`.
    #[must_use]
    pub const fn identity() -> Self {
        Self::new(1.0, 0.0)
    }

    /// Evaluate at `x`.
    #[inline]
    #[must_use]
    pub fn value(&self, x: f64) -> f64 {
        self.slope * x + self.constant
    }
}

impl Default for AffineFunction {
    fn default() -> Self {
        Self::identity()
    }
}
