//! Playback timelines.
//!
//! A [`Score`] is the ordered list of movements a signal generator plays back
//! to back. It is append-only while a queue builds it and shared read-only
//! (`Arc<Score>`) once handed to a generator.

use std::time::Duration;

use lsm_core::{LsmError, LsmResult};
use serde::{Deserialize, Serialize};

use crate::movement::Movement;

/// Ordered sequence of movements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    name: String,
    movements: Vec<Movement>,
}

impl Score {
    /// Create an empty score.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            movements: Vec::new(),
        }
    }

    /// Score name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a movement. No cross-movement consistency checks.
    pub fn add_movement(&mut self, movement: Movement) {
        self.movements.push(movement);
    }

    /// Movements in playback order.
    #[must_use]
    pub fn movements(&self) -> &[Movement] {
        &self.movements
    }

    /// Number of movements.
    #[must_use]
    pub fn number_of_movements(&self) -> usize {
        self.movements.len()
    }

    /// Whether the score holds no movements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.movements.is_empty()
    }

    /// Remove every movement.
    pub fn clear(&mut self) {
        self.movements.clear();
    }

    /// Total playback duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.movements
            .iter()
            .fold(Duration::ZERO, |total, m| total.saturating_add(m.duration()))
    }

    /// Compile into per-channel sample buffers at `sample_rate_hz`.
    ///
    /// Every movement gets at least one sample. Channel count is the largest
    /// channel capacity among the movements. Fails on a non-positive or
    /// non-finite rate, and when a sample count does not fit in `usize`.
    pub fn render(&self, sample_rate_hz: f64) -> LsmResult<CompiledScore> {
        if !sample_rate_hz.is_finite() || sample_rate_hz <= 0.0 {
            return Err(LsmError::Parameter(format!(
                "sample rate must be positive, got {sample_rate_hz}"
            )));
        }
        let channels = self
            .movements
            .iter()
            .map(Movement::channel_capacity)
            .max()
            .unwrap_or(0);

        let lengths = self
            .movements
            .iter()
            .map(|m| sample_count(m, sample_rate_hz))
            .collect::<LsmResult<Vec<usize>>>()?;
        let total = lengths
            .iter()
            .try_fold(0_usize, |total, &length| total.checked_add(length))
            .ok_or_else(|| LsmError::Parameter(format!("score '{}' has too many samples", self.name)))?;

        let mut offsets = Vec::with_capacity(self.movements.len());
        let mut data = vec![Vec::with_capacity(total); channels];
        let mut offset = 0;
        for (movement, &length) in self.movements.iter().zip(&lengths) {
            offsets.push(offset);
            for (channel, buffer) in data.iter_mut().enumerate() {
                buffer.extend(movement.sample(channel, length));
            }
            offset += length;
        }

        Ok(CompiledScore {
            sample_rate_hz,
            offsets,
            data,
        })
    }
}

fn sample_count(movement: &Movement, sample_rate_hz: f64) -> LsmResult<usize> {
    let samples = (movement.duration().as_secs_f64() * sample_rate_hz).round();
    // usize::MAX as f64 rounds up to 2^64, which is already out of range
    if !samples.is_finite() || samples >= usize::MAX as f64 {
        return Err(LsmError::Parameter(format!(
            "movement '{}' needs {samples} samples at {sample_rate_hz} Hz",
            movement.name()
        )));
    }
    Ok((samples as usize).max(1))
}

/// Hardware-independent sampled form of a score.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledScore {
    /// Samples per second.
    pub sample_rate_hz: f64,
    /// First sample of each movement.
    pub offsets: Vec<usize>,
    /// One buffer per channel, all of equal length.
    pub data: Vec<Vec<f32>>,
}

impl CompiledScore {
    /// Number of samples per channel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    /// Whether nothing was rendered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples of one channel.
    #[must_use]
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.data.get(index).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stave::Stave;

    fn galvo_movement(sync_stop: f64) -> Movement {
        let mut m = Movement::new("sweep", Duration::from_millis(10), 3);
        m.set_stave(0, Stave::interval("camera trigger", 0.2, 0.6, 1.0, 0.0))
            .unwrap();
        let galvo = m.set_stave(1, Stave::ramp("galvo")).unwrap();
        if let Some(r) = galvo.as_ramp_mut() {
            r.sync_start = 0.1;
            r.sync_stop = sync_stop;
            r.stop_value = 1.0;
            r.step_height = 0.02;
        }
        m
    }

    #[test]
    fn test_add_movement_keeps_order() {
        let mut score = Score::new("test");
        let mut template = galvo_movement(0.5);
        for i in 0..10 {
            if let Some(r) = template.stave_mut(1).and_then(Stave::as_ramp_mut) {
                r.sync_stop = 0.5 + 0.03 * f64::from(i);
            }
            score.add_movement(template.copy());
        }

        assert_eq!(score.number_of_movements(), 10);
        let stops: Vec<f64> = score
            .movements()
            .iter()
            .filter_map(|m| m.stave(1).and_then(Stave::as_ramp).map(|r| r.sync_stop))
            .collect();
        assert!(stops.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(score.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_render_layout() {
        let mut score = Score::new("test");
        score.add_movement(galvo_movement(0.7));
        let mut short = Movement::new("short", Duration::from_millis(5), 2);
        short.set_stave(0, Stave::constant("c", 2.0)).unwrap();
        score.add_movement(short);

        let compiled = score.render(1_000.0).unwrap();
        assert_eq!(compiled.offsets, vec![0, 10]);
        assert_eq!(compiled.len(), 15);
        assert_eq!(compiled.data.len(), 3);
        assert!(compiled.data.iter().all(|c| c.len() == 15));
        assert_eq!(compiled.channel(0).unwrap()[12], 2.0);
        // Channel 2 unused by both movements
        assert!(compiled.channel(2).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_render_empty_score() {
        let compiled = Score::new("empty").render(10_000.0).unwrap();
        assert!(compiled.is_empty());
        assert!(compiled.offsets.is_empty());
    }

    #[test]
    fn test_short_movement_gets_one_sample() {
        let mut score = Score::new("test");
        score.add_movement(Movement::new("tiny", Duration::from_nanos(10), 1));
        assert_eq!(score.render(1_000.0).unwrap().len(), 1);
    }

    #[test]
    fn test_render_rejects_unrepresentable_sample_counts() {
        let mut score = Score::new("long");
        score.add_movement(Movement::new("forever", Duration::MAX, 1));
        assert!(matches!(score.render(1e9), Err(LsmError::Parameter(_))));
        score.add_movement(Movement::new("again", Duration::MAX, 1));
        assert_eq!(score.duration(), Duration::MAX);

        let mut score = Score::new("test");
        score.add_movement(galvo_movement(0.5));
        assert!(score.render(f64::NAN).is_err());
        assert!(score.render(f64::INFINITY).is_err());
        assert!(score.render(0.0).is_err());
    }
}
