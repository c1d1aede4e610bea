//! Single-channel waveforms.
//!
//! A [`Stave`] maps normalized time `t ∈ [0, 1]` within a movement onto an
//! output value. The set of waveform shapes is closed, so it is modelled as
//! the [`StaveKind`] sum type dispatched by [`Stave::evaluate`].
//!
//! Evaluation is pure and total: degenerate parameters (an empty ramp window,
//! a non-positive exponent) resolve to a defined value instead of dividing by
//! zero. Times outside `[0, 1]` are not clamped; callers keep `t` in range.

use std::mem::discriminant;

use serde::{Deserialize, Serialize};

/// Parameters of a ramp, optionally stepped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ramp {
    /// Start of the ramp window.
    pub sync_start: f64,
    /// End of the ramp window.
    pub sync_stop: f64,
    /// Value at `sync_start`.
    pub start_value: f64,
    /// Value at `sync_stop`.
    pub stop_value: f64,
    /// Easing exponent applied to the normalized ramp position.
    pub exponent: f64,
    /// Quantize onto a staircase of `step_height`.
    pub stepping: bool,
    /// Staircase step; `<= 0` keeps the ramp continuous.
    pub step_height: f64,
    /// Value outside the window.
    pub outside_value: f64,
    /// Hold the nearest endpoint outside the window instead of `outside_value`.
    pub no_jump: bool,
}

impl Default for Ramp {
    fn default() -> Self {
        Self {
            sync_start: 0.0,
            sync_stop: 1.0,
            start_value: 0.0,
            stop_value: 0.0,
            exponent: 1.0,
            stepping: false,
            step_height: 0.0,
            outside_value: 0.0,
            no_jump: false,
        }
    }
}

impl Ramp {
    fn evaluate(&self, t: f64) -> f64 {
        let (start, stop) = (self.sync_start, self.sync_stop);

        if t.is_nan() {
            return self.outside_value;
        }

        // Empty window: a step at `sync_start`.
        if stop <= start {
            return if t < start {
                self.before_value()
            } else {
                self.stop_value
            };
        }

        if t == start {
            return self.start_value;
        }
        if t == stop {
            return self.stop_value;
        }
        if t < start {
            return self.before_value();
        }
        if t > stop {
            return if self.no_jump {
                self.stop_value
            } else {
                self.outside_value
            };
        }

        let u = (t - start) / (stop - start);
        let exponent = if self.exponent.is_finite() && self.exponent > 0.0 {
            self.exponent
        } else {
            1.0
        };
        let delta = self.stop_value - self.start_value;
        let value = self.start_value + delta * u.powf(exponent);

        if self.stepping && self.step_height > 0.0 {
            let steps = ((value - self.start_value).abs() / self.step_height).floor();
            self.start_value + delta.signum() * steps * self.step_height
        } else {
            value
        }
    }

    fn before_value(&self) -> f64 {
        if self.no_jump {
            self.start_value
        } else {
            self.outside_value
        }
    }
}

/// Waveform shape of a stave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StaveKind {
    /// Fixed value.
    Constant {
        /// Output value.
        value: f64,
    },
    /// `before` for `t < edge`, `after` from `edge` on. One-shot triggers.
    Edge {
        /// Edge position.
        edge: f64,
        /// Value before the edge.
        before: f64,
        /// Value from the edge on.
        after: f64,
    },
    /// `inside` on `[start, stop]`, `outside` elsewhere. Pulsed triggers.
    Interval {
        /// Window start.
        start: f64,
        /// Window stop.
        stop: f64,
        /// Value inside the window.
        inside: f64,
        /// Value outside the window.
        outside: f64,
    },
    /// Continuous or stepped ramp.
    RampStepping(Ramp),
}

/// Single-channel waveform for one movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stave {
    name: String,
    enabled: bool,
    kind: StaveKind,
}

impl Stave {
    /// Create an enabled stave.
    pub fn new(name: impl Into<String>, kind: StaveKind) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            kind,
        }
    }

    /// Constant stave.
    pub fn constant(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, StaveKind::Constant { value })
    }

    /// Edge stave.
    pub fn edge(name: impl Into<String>, edge: f64, before: f64, after: f64) -> Self {
        Self::new(
            name,
            StaveKind::Edge {
                edge,
                before,
                after,
            },
        )
    }

    /// Interval stave.
    pub fn interval(name: impl Into<String>, start: f64, stop: f64, inside: f64, outside: f64) -> Self {
        Self::new(
            name,
            StaveKind::Interval {
                start,
                stop,
                inside,
                outside,
            },
        )
    }

    /// Ramp stave with a full `[0, 1]` window from 0 to 0.
    pub fn ramp(name: impl Into<String>) -> Self {
        Self::new(name, StaveKind::RampStepping(Ramp::default()))
    }

    /// Evaluate at normalized time `t`. Disabled staves output `0.0`.
    #[must_use]
    pub fn evaluate(&self, t: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        match &self.kind {
            StaveKind::Constant { value } => *value,
            StaveKind::Edge {
                edge,
                before,
                after,
            } => {
                if t < *edge {
                    *before
                } else {
                    *after
                }
            }
            StaveKind::Interval {
                start,
                stop,
                inside,
                outside,
            } => {
                if t >= *start && t <= *stop {
                    *inside
                } else {
                    *outside
                }
            }
            StaveKind::RampStepping(ramp) => ramp.evaluate(t),
        }
    }

    /// Stave name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the stave drives its channel.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the stave.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Waveform shape.
    #[must_use]
    pub fn kind(&self) -> &StaveKind {
        &self.kind
    }

    /// Mutable waveform shape.
    pub fn kind_mut(&mut self) -> &mut StaveKind {
        &mut self.kind
    }

    /// Whether both staves have the same waveform shape (parameters aside).
    #[must_use]
    pub fn same_variant(&self, other: &Stave) -> bool {
        discriminant(&self.kind) == discriminant(&other.kind)
    }

    /// Set the value of a constant stave. No effect on other shapes.
    pub fn set_value(&mut self, new_value: f64) {
        if let StaveKind::Constant { value } = &mut self.kind {
            *value = new_value;
        }
    }

    /// Set the window of an interval stave. No effect on other shapes.
    pub fn set_window(&mut self, new_start: f64, new_stop: f64) {
        if let StaveKind::Interval { start, stop, .. } = &mut self.kind {
            *start = new_start;
            *stop = new_stop;
        }
    }

    /// Ramp parameters, if this is a ramp.
    pub fn as_ramp_mut(&mut self) -> Option<&mut Ramp> {
        match &mut self.kind {
            StaveKind::RampStepping(ramp) => Some(ramp),
            _ => None,
        }
    }

    /// Ramp parameters, if this is a ramp.
    #[must_use]
    pub fn as_ramp(&self) -> Option<&Ramp> {
        match &self.kind {
            StaveKind::RampStepping(ramp) => Some(ramp),
            _ => None,
        }
    }
}
