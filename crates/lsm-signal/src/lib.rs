//! Signal generation: waveforms, time slots and playback timelines.
//!
//! - [`Stave`]: one channel's waveform over a normalized time slot
//! - [`Movement`]: a fixed-duration slot with one stave per channel
//! - [`Score`]: movements played back to back, compiled with [`Score::render`]
//! - [`SignalGenerator`]: device trait, with [`SimulatedSignalGenerator`]

pub mod generator;
pub mod movement;
pub mod score;
pub mod stave;

pub use generator::{SignalGenerator, SimulatedSignalGenerator, SimulationMode, TriggerEvent};
pub use movement::Movement;
pub use score::{CompiledScore, Score};
pub use stave::{Ramp, Stave, StaveKind};
