//! Fixed-duration multi-channel time slots.

use std::collections::BTreeMap;
use std::time::Duration;

use lsm_core::{LsmError, LsmResult};
use serde::{Deserialize, Serialize};

use crate::stave::Stave;

/// Time slot holding at most one stave per output channel.
///
/// All staves share the movement's duration: a stave sees normalized time
/// `t = elapsed / duration`. Channels without a stave output `0.0`.
///
/// `Clone` is a deep copy; [`Movement::copy`] spells it out at call sites
/// that duplicate a template into a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    name: String,
    duration: Duration,
    channels: usize,
    staves: BTreeMap<usize, Stave>,
}

impl Movement {
    /// Create an empty movement with `channels` output slots.
    pub fn new(name: impl Into<String>, duration: Duration, channels: usize) -> Self {
        Self {
            name: name.into(),
            duration,
            channels,
            staves: BTreeMap::new(),
        }
    }

    /// Movement name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Change the slot duration.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Number of output channels.
    #[must_use]
    pub fn channel_capacity(&self) -> usize {
        self.channels
    }

    fn check_index(&self, index: usize) -> LsmResult<()> {
        if index < self.channels {
            Ok(())
        } else {
            Err(LsmError::ChannelOutOfRange {
                index,
                capacity: self.channels,
            })
        }
    }

    /// Install `stave` at `index`, replacing any resident stave.
    pub fn set_stave(&mut self, index: usize, stave: Stave) -> LsmResult<&mut Stave> {
        self.check_index(index)?;
        self.staves.insert(index, stave);
        self.staves
            .get_mut(&index)
            .ok_or(LsmError::ChannelOutOfRange {
                index,
                capacity: self.channels,
            })
    }

    /// Return the stave at `index`, installing `stave` unless the resident one
    /// has the same shape.
    ///
    /// Reusing the resident stave keeps its identity across update cycles; the
    /// caller then rewrites its parameters through the returned reference. The
    /// slot is never left empty.
    pub fn ensure_set_stave(&mut self, index: usize, stave: Stave) -> LsmResult<&mut Stave> {
        self.check_index(index)?;
        let keep = self
            .staves
            .get(&index)
            .is_some_and(|resident| resident.same_variant(&stave));
        if !keep {
            self.staves.insert(index, stave);
        }
        self.staves
            .get_mut(&index)
            .ok_or(LsmError::ChannelOutOfRange {
                index,
                capacity: self.channels,
            })
    }

    /// Stave at `index`.
    #[must_use]
    pub fn stave(&self, index: usize) -> Option<&Stave> {
        self.staves.get(&index)
    }

    /// Mutable stave at `index`.
    pub fn stave_mut(&mut self, index: usize) -> Option<&mut Stave> {
        self.staves.get_mut(&index)
    }

    /// Remove the stave at `index`.
    pub fn remove_stave(&mut self, index: usize) -> Option<Stave> {
        self.staves.remove(&index)
    }

    /// Occupied channels in index order.
    pub fn staves(&self) -> impl Iterator<Item = (usize, &Stave)> {
        self.staves.iter().map(|(i, s)| (*i, s))
    }

    /// Number of occupied channels.
    #[must_use]
    pub fn stave_count(&self) -> usize {
        self.staves.len()
    }

    /// Value of channel `index` at normalized time `t`.
    #[must_use]
    pub fn value_at(&self, index: usize, t: f64) -> f64 {
        self.staves.get(&index).map_or(0.0, |s| s.evaluate(t))
    }

    /// Sample channel `index` at `samples` evenly spaced times covering both
    /// ends of the slot.
    #[must_use]
    pub fn sample(&self, index: usize, samples: usize) -> Vec<f32> {
        let last = samples.saturating_sub(1).max(1) as f64;
        (0..samples)
            .map(|i| self.value_at(index, i as f64 / last) as f32)
            .collect()
    }

    /// Deep copy.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stave::StaveKind;

    fn movement() -> Movement {
        Movement::new("Exposure", Duration::from_millis(10), 16)
    }

    #[test]
    fn test_channel_capacity_enforced() {
        let mut m = movement();
        assert!(m.set_stave(15, Stave::constant("last", 1.0)).is_ok());
        assert!(matches!(
            m.set_stave(16, Stave::constant("beyond", 1.0)),
            Err(LsmError::ChannelOutOfRange { index: 16, capacity: 16 })
        ));
    }

    #[test]
    fn test_ensure_set_stave_reuses_same_shape() {
        let mut m = movement();
        m.set_stave(3, Stave::constant("x", 0.5)).unwrap();

        let resident = m.ensure_set_stave(3, Stave::constant("ignored", 9.0)).unwrap();
        assert_eq!(resident.name(), "x");
        resident.set_value(0.7);

        assert_eq!(m.value_at(3, 0.5), 0.7);
    }

    #[test]
    fn test_ensure_set_stave_replaces_other_shape() {
        let mut m = movement();
        m.set_stave(3, Stave::constant("x", 0.5)).unwrap();

        let installed = m.ensure_set_stave(3, Stave::ramp("y")).unwrap();
        assert!(matches!(installed.kind(), StaveKind::RampStepping(_)));
        assert_eq!(m.stave(3).map(Stave::name), Some("y"));
    }

    #[test]
    fn test_ensure_set_stave_fills_empty_slot() {
        let mut m = movement();
        m.ensure_set_stave(0, Stave::edge("t", 1.0, 1.0, 0.0)).unwrap();
        assert_eq!(m.stave_count(), 1);
        assert_eq!(m.value_at(0, 0.5), 1.0);
    }

    #[test]
    fn test_copy_is_independent() {
        let mut original = movement();
        original.set_stave(1, Stave::constant("x", 1.0)).unwrap();
        let ramp = original.set_stave(2, Stave::ramp("y")).unwrap();
        if let Some(r) = ramp.as_ramp_mut() {
            r.start_value = -1.0;
            r.stop_value = 1.0;
        }

        let mut copy = original.copy();
        for i in 0..=20 {
            let t = f64::from(i) / 20.0;
            for channel in 0..16 {
                assert_eq!(copy.value_at(channel, t), original.value_at(channel, t));
            }
        }

        copy.stave_mut(1).unwrap().set_value(5.0);
        copy.set_duration(Duration::from_secs(1));
        assert_eq!(original.value_at(1, 0.5), 1.0);
        assert_eq!(original.duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_sample_covers_endpoints() {
        let mut m = movement();
        let ramp = m.set_stave(0, Stave::ramp("y")).unwrap();
        if let Some(r) = ramp.as_ramp_mut() {
            r.start_value = 0.0;
            r.stop_value = 1.0;
        }
        let samples = m.sample(0, 5);
        assert_eq!(samples, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(m.sample(7, 3), vec![0.0; 3]);
        assert_eq!(m.sample(0, 1), vec![0.0]);
    }
}
