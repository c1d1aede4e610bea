//! Signal generator devices.
//!
//! A [`SignalGenerator`] plays a finalized score on its output channels and
//! reports whether playback completed. Hardware backends implement the trait;
//! [`SimulatedSignalGenerator`] plays scores in (scaled) real time and
//! publishes the camera trigger pulses it would emit on its digital lines.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lsm_core::{LsmError, LsmResult};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::score::Score;

/// Capacity of the trigger broadcast channel.
pub const TRIGGER_CHANNEL_CAPACITY: usize = 1024;

/// Device that turns scores into output signals.
#[async_trait]
pub trait SignalGenerator: Send + Sync {
    /// Device name.
    fn name(&self) -> &str;

    /// Play `score` to completion.
    ///
    /// Returns `Ok(true)` once every movement was output, `Ok(false)` if the
    /// device reported a failure. May never return if the device hangs;
    /// callers bound it with a timeout.
    async fn play_score(&self, score: Arc<Score>) -> LsmResult<bool>;
}

/// A trigger pulse on a digital line, observed at the start of a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Digital channel that went high.
    pub channel: usize,
    /// Movement index within the score.
    pub movement: usize,
    /// Playback sequence number of the score.
    pub playback: u64,
}

/// Behaviour of the simulated generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    /// Plays every movement and completes.
    #[default]
    Responsive,
    /// Accepts the score and never completes.
    Unresponsive,
    /// Reports failure without playing.
    Failing,
}

/// Simulated signal generator.
///
/// Sleeps through each movement's duration multiplied by `time_scale` and, at
/// the start of a movement, publishes a [`TriggerEvent`] for every watched
/// channel whose stave is high (`> 0.5`) at mid-slot.
#[derive(Debug)]
pub struct SimulatedSignalGenerator {
    name: String,
    mode: SimulationMode,
    time_scale: f64,
    trigger_channels: Vec<usize>,
    triggers: broadcast::Sender<TriggerEvent>,
    playbacks: AtomicU64,
}

impl SimulatedSignalGenerator {
    /// Create a responsive generator watching `trigger_channels`.
    pub fn new(name: impl Into<String>, trigger_channels: Vec<usize>) -> Self {
        let (triggers, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            mode: SimulationMode::Responsive,
            time_scale: 1.0,
            trigger_channels,
            triggers,
            playbacks: AtomicU64::new(0),
        }
    }

    /// Set the simulation mode.
    #[must_use]
    pub fn with_mode(mut self, mode: SimulationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Scale movement durations (0 plays as fast as possible).
    #[must_use]
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = if time_scale.is_finite() {
            time_scale.max(0.0)
        } else {
            1.0
        };
        self
    }

    /// Subscribe to trigger pulses. Subscribe before playback starts to see
    /// every pulse of it.
    pub fn subscribe_triggers(&self) -> broadcast::Receiver<TriggerEvent> {
        self.triggers.subscribe()
    }

    /// The sender side, for devices that subscribe on their own schedule.
    #[must_use]
    pub fn trigger_bus(&self) -> broadcast::Sender<TriggerEvent> {
        self.triggers.clone()
    }

    /// Number of scores played to completion or failure.
    #[must_use]
    pub fn playbacks(&self) -> u64 {
        self.playbacks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SignalGenerator for SimulatedSignalGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn play_score(&self, score: Arc<Score>) -> LsmResult<bool> {
        let playback = self.playbacks.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            SimulationMode::Failing => {
                warn!(generator = %self.name, "Simulated generator failure");
                return Ok(false);
            }
            SimulationMode::Unresponsive => {
                warn!(generator = %self.name, "Simulated generator not responding");
                std::future::pending::<()>().await;
            }
            SimulationMode::Responsive => {}
        }

        info!(
            generator = %self.name,
            score = score.name(),
            movements = score.number_of_movements(),
            duration_ms = score.duration().as_millis(),
            "Playing score"
        );

        for (index, movement) in score.movements().iter().enumerate() {
            let slot = Duration::try_from_secs_f64(movement.duration().as_secs_f64() * self.time_scale)
                .map_err(|e| {
                    LsmError::Parameter(format!(
                        "movement {index} of '{}' cannot be scaled by {}: {e}",
                        score.name(),
                        self.time_scale
                    ))
                })?;
            for &channel in &self.trigger_channels {
                if movement.value_at(channel, 0.5) > 0.5 {
                    // No subscribers is not an error: nobody is acquiring.
                    let _ = self.triggers.send(TriggerEvent {
                        channel,
                        movement: index,
                        playback,
                    });
                }
            }
            if !slot.is_zero() {
                tokio::time::sleep(slot).await;
            } else {
                tokio::task::yield_now().await;
            }
        }

        debug!(generator = %self.name, playback, "Score played");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::Movement;
    use crate::stave::Stave;

    fn score_with_triggers(pattern: &[bool]) -> Arc<Score> {
        let mut score = Score::new("triggers");
        for (i, &high) in pattern.iter().enumerate() {
            let mut m = Movement::new(format!("m{i}"), Duration::from_millis(5), 8);
            m.set_stave(4, Stave::edge("trigger", 1.0, f64::from(u8::from(high)), 0.0))
                .unwrap();
            score.add_movement(m);
        }
        Arc::new(score)
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_follow_staves() {
        let generator = SimulatedSignalGenerator::new("sim", vec![4, 5]);
        let mut rx = generator.subscribe_triggers();

        let done = generator
            .play_score(score_with_triggers(&[true, false, true]))
            .await
            .unwrap();
        assert!(done);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.channel, first.movement), (4, 0));
        assert_eq!((second.channel, second.movement), (4, 2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_takes_scaled_duration() {
        let generator = SimulatedSignalGenerator::new("sim", vec![]).with_time_scale(2.0);
        let start = tokio::time::Instant::now();
        generator
            .play_score(score_with_triggers(&[false; 4]))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40) && elapsed < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unscalable_duration_is_an_error() {
        let generator = SimulatedSignalGenerator::new("sim", vec![4]).with_time_scale(2.0);
        let mut rx = generator.subscribe_triggers();
        let mut score = Score::new("long");
        score.add_movement(Movement::new("forever", Duration::MAX, 8));

        let result = generator.play_score(Arc::new(score)).await;
        assert!(matches!(result, Err(LsmError::Parameter(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let generator =
            SimulatedSignalGenerator::new("sim", vec![4]).with_mode(SimulationMode::Failing);
        assert!(!generator.play_score(score_with_triggers(&[true])).await.unwrap());
        assert_eq!(generator.playbacks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_mode_never_completes() {
        let generator =
            SimulatedSignalGenerator::new("sim", vec![4]).with_mode(SimulationMode::Unresponsive);
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            generator.play_score(score_with_triggers(&[true])),
        )
        .await;
        assert!(result.is_err());
    }
}
