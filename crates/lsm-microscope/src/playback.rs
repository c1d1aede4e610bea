//! Playback coordinator.
//!
//! [`LightSheetMicroscope`] owns the device registry and the stack recyclers
//! and plays finalized queues: cameras are armed first, the signal generator
//! plays the frozen score, and stacks stream to a [`StackSink`] until every
//! expected stack arrived or the deadline passed.
//!
//! Only protocol misuse is an `Err`. Timeouts, generator failures and camera
//! starvation are reported as an unsuccessful [`PlaybackOutcome`] so control
//! loops keep running. Every exit path aborts the camera and generator tasks,
//! so no stack lease outlives a playback unless the sink kept it; dropping
//! the playback future mid-flight aborts them too. Cameras lease from a
//! recycler prewarmed to its `min_available` for their stack descriptor.

use std::sync::Arc;
use std::time::Duration;

use lsm_core::{LsmError, LsmResult, MicroscopeConfig, Observable};
use lsm_pool::{Recycler, RecyclerRegistry};
use lsm_signal::SimulationMode;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::devices::{AcquisitionJob, CameraStack};
use crate::queue::{LightSheetMicroscopeQueue, QueuePhase};
use crate::registry::DeviceRegistry;

/// Recycler used until [`LightSheetMicroscope::use_recycler`] selects another.
pub const DEFAULT_RECYCLER: &str = "default";

/// Consumer of stacks produced during playback.
///
/// Called on the coordinator task; keep it short. Dropping the stack returns
/// it to its recycler, holding it keeps the lease.
pub trait StackSink: Send + Sync {
    /// Take one stack.
    fn consume(&self, stack: CameraStack);
}

impl<F> StackSink for F
where
    F: Fn(CameraStack) + Send + Sync,
{
    fn consume(&self, stack: CameraStack) {
        self(stack);
    }
}

/// Sink that releases every stack immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropSink;

impl StackSink for DropSink {
    fn consume(&self, _stack: CameraStack) {}
}

/// Sink that keeps every stack until taken.
#[derive(Debug, Default)]
pub struct CollectingSink {
    stacks: Mutex<Vec<CameraStack>>,
}

impl CollectingSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the collected stacks.
    pub fn take(&self) -> Vec<CameraStack> {
        std::mem::take(&mut *self.stacks.lock())
    }

    /// Number of stacks held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    /// Whether no stack is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.lock().is_empty()
    }
}

impl StackSink for CollectingSink {
    fn consume(&self, stack: CameraStack) {
        self.stacks.lock().push(stack);
    }
}

/// Result of one playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackOutcome {
    /// Every expected stack arrived before the deadline.
    pub success: bool,
    /// Phase the queue was left in.
    pub phase: QueuePhase,
    /// Stacks received.
    pub received: usize,
    /// Stacks expected.
    pub expected: usize,
    /// Wall time spent, lock wait included.
    pub elapsed: Duration,
}

enum TaskResult {
    Camera { index: usize, result: LsmResult<usize> },
    Generator(LsmResult<bool>),
}

/// Sets the queue phase when playback ends, on every path.
struct PhaseGuard<'a> {
    queue: &'a mut LightSheetMicroscopeQueue,
    phase: QueuePhase,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.queue.end_playback(self.phase);
    }
}

/// A light-sheet microscope: devices, stack recyclers and playback.
pub struct LightSheetMicroscope {
    registry: Arc<DeviceRegistry>,
    recyclers: RecyclerRegistry,
    recycler: Mutex<Arc<Recycler>>,
    sink: RwLock<Arc<dyn StackSink>>,
    playback_lock: tokio::sync::Mutex<()>,
    exposure: Observable<f64>,
}

impl std::fmt::Debug for LightSheetMicroscope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightSheetMicroscope")
            .field("registry", &self.registry)
            .field("recycler", &self.recycler.lock().name())
            .field("exposure", &self.exposure.get())
            .finish_non_exhaustive()
    }
}

impl LightSheetMicroscope {
    /// Wrap a device registry. The default recycler uses the configured
    /// limits.
    #[must_use]
    pub fn new(registry: DeviceRegistry) -> Self {
        let config = registry.config();
        let limits = config.recycler;
        let recyclers = RecyclerRegistry::new();
        let recycler = recyclers.use_recycler(
            DEFAULT_RECYCLER,
            limits.min_available,
            limits.max_available,
            limits.max_live,
        );
        let exposure = Observable::new("exposure", config.playback.default_exposure_s)
            .with_units("s")
            .with_description("Camera exposure of new queues")
            .with_validator(|value: &f64| {
                if value.is_finite() && *value > 0.0 {
                    Ok(())
                } else {
                    Err(LsmError::Parameter(format!("exposure must be positive, got {value}")))
                }
            });

        Self {
            registry: Arc::new(registry),
            recyclers,
            recycler: Mutex::new(recycler),
            sink: RwLock::new(Arc::new(DropSink)),
            playback_lock: tokio::sync::Mutex::new(()),
            exposure,
        }
    }

    /// Microscope with simulated devices.
    pub fn simulated(config: MicroscopeConfig, mode: SimulationMode, time_scale: f64) -> LsmResult<Self> {
        Ok(Self::new(DeviceRegistry::simulated(config, mode, time_scale)?))
    }

    /// Device registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Exposure new queues start with.
    #[must_use]
    pub fn exposure(&self) -> &Observable<f64> {
        &self.exposure
    }

    /// A new queue reading the current device values. Call
    /// [`clear_queue`](LightSheetMicroscopeQueue::clear_queue) before
    /// building it.
    #[must_use]
    pub fn request_queue(&self) -> LightSheetMicroscopeQueue {
        LightSheetMicroscopeQueue::new(Arc::clone(&self.registry), self.exposure.get())
    }

    /// Select (creating or reconfiguring) the recycler playbacks lease
    /// stacks from.
    pub fn use_recycler(
        &self,
        name: &str,
        min_available: usize,
        max_available: usize,
        max_live: usize,
    ) -> Arc<Recycler> {
        let recycler = self
            .recyclers
            .use_recycler(name, min_available, max_available, max_live);
        *self.recycler.lock() = Arc::clone(&recycler);
        recycler
    }

    /// Recycler currently in use.
    #[must_use]
    pub fn recycler(&self) -> Arc<Recycler> {
        Arc::clone(&self.recycler.lock())
    }

    /// Named recyclers.
    #[must_use]
    pub fn recyclers(&self) -> &RecyclerRegistry {
        &self.recyclers
    }

    /// Replace the sink stacks are streamed to.
    pub fn set_stack_sink(&self, sink: Arc<dyn StackSink>) {
        *self.sink.write() = sink;
    }

    /// Timeout for a queue of `queue_length` snapshots: the configured base
    /// plus one second per snapshot.
    #[must_use]
    pub fn playback_timeout(&self, queue_length: usize) -> Duration {
        self.registry.config().playback.base_timeout()
            + Duration::from_secs(u64::try_from(queue_length).unwrap_or(u64::MAX))
    }

    /// Play `queue` and wait for its stacks. `Ok(true)` only if every
    /// expected stack arrived within `timeout`.
    pub async fn play_queue_and_wait_for_stacks(
        &self,
        queue: &mut LightSheetMicroscopeQueue,
        timeout: Duration,
    ) -> LsmResult<bool> {
        Ok(self.play_queue(queue, timeout).await?.success)
    }

    /// Play `queue` into the registered sink.
    pub async fn play_queue(
        &self,
        queue: &mut LightSheetMicroscopeQueue,
        timeout: Duration,
    ) -> LsmResult<PlaybackOutcome> {
        let sink = Arc::clone(&self.sink.read());
        self.play_queue_into(queue, timeout, sink).await
    }

    /// Play `queue` into `sink`.
    ///
    /// Waiting for a playback already in flight counts against `timeout`.
    pub async fn play_queue_into(
        &self,
        queue: &mut LightSheetMicroscopeQueue,
        timeout: Duration,
        sink: Arc<dyn StackSink>,
    ) -> LsmResult<PlaybackOutcome> {
        let started = Instant::now();
        let deadline = started + timeout;

        if !queue.phase().is_playable() {
            return Err(LsmError::StateMisuse {
                operation: "play_queue",
                phase: queue.phase().to_string(),
            });
        }
        if queue.get_queue_length() == 0 {
            return Err(LsmError::EmptyQueue);
        }

        let expected = queue.total_expected_stacks();
        let Ok(_playing) = tokio::time::timeout_at(deadline, self.playback_lock.lock()).await else {
            warn!(
                timeout_ms = timeout.as_millis(),
                "Timed out waiting for the playback in flight"
            );
            return Ok(PlaybackOutcome {
                success: false,
                phase: queue.phase(),
                received: 0,
                expected,
                elapsed: started.elapsed(),
            });
        };

        let score = queue.begin_playback()?;
        let mut guard = PhaseGuard {
            queue,
            phase: QueuePhase::Failed,
        };

        let recycler = self.recycler();
        let stack_timeout = self.registry.config().playback.stack_timeout();
        let (tx, mut rx) = mpsc::channel(expected.max(1));
        let mut tasks = JoinSet::new();

        for (index, camera) in self.registry.cameras().iter().enumerate() {
            let count = guard.queue.expected_stacks(index);
            if count == 0 {
                continue;
            }
            let request = camera.stack_request();
            if let Err(e) = recycler.ensure_preallocated(recycler.limits().min_available, &request) {
                warn!(camera = index, error = %e, "Could not preallocate stacks");
            }
            let job = AcquisitionJob {
                expected: count,
                metadata: guard.queue.camera_metadata(index).cloned().unwrap_or_default(),
                recycler: Arc::clone(&recycler),
                stack_timeout,
                output: tx.clone(),
            };
            let armed = camera.arm(job);
            tasks.spawn(async move {
                TaskResult::Camera {
                    index,
                    result: armed.await,
                }
            });
        }
        drop(tx);

        let generator = Arc::clone(self.registry.generator());
        tasks.spawn(async move { TaskResult::Generator(generator.play_score(score).await) });

        info!(
            queue_length = guard.queue.get_queue_length(),
            expected,
            recycler = recycler.name(),
            timeout_ms = timeout.as_millis(),
            "Playing queue"
        );

        let mut received = 0;
        let mut generator_done = false;
        let phase = loop {
            if generator_done && received >= expected {
                break QueuePhase::Completed;
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    warn!(received, expected, timeout_ms = timeout.as_millis(), "Playback timed out");
                    break QueuePhase::TimedOut;
                }
                Some(stack) = rx.recv() => {
                    received += 1;
                    sink.consume(stack);
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(TaskResult::Generator(Ok(true))) => generator_done = true,
                    Ok(TaskResult::Generator(Ok(false))) => {
                        warn!("Signal generator reported a failed playback");
                        break QueuePhase::Failed;
                    }
                    Ok(TaskResult::Generator(Err(e))) => {
                        warn!(error = %e, "Signal generator error");
                        break QueuePhase::Failed;
                    }
                    Ok(TaskResult::Camera { index, result: Ok(delivered) }) => {
                        debug!(camera = index, delivered, "Camera finished");
                    }
                    Ok(TaskResult::Camera { index, result: Err(e) }) => {
                        warn!(camera = index, error = %e, "Camera failed during playback");
                        break QueuePhase::Failed;
                    }
                    Err(e) => {
                        warn!(error = %e, "Playback task panicked");
                        break QueuePhase::Failed;
                    }
                },
            }
        };

        tasks.shutdown().await;
        // Stacks still queued belong to an unsuccessful playback.
        drop(rx);

        guard.phase = phase;
        let outcome = PlaybackOutcome {
            success: phase == QueuePhase::Completed,
            phase,
            received,
            expected,
            elapsed: started.elapsed(),
        };
        info!(
            success = outcome.success,
            received,
            expected,
            elapsed_ms = outcome.elapsed.as_millis(),
            live = recycler.live(),
            "Playback finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn microscope(mode: SimulationMode) -> LightSheetMicroscope {
        LightSheetMicroscope::simulated(MicroscopeConfig::default(), mode, 0.0).unwrap()
    }

    fn small_config() -> MicroscopeConfig {
        let mut config = MicroscopeConfig::default();
        config.cameras[0].width = 32;
        config.cameras[0].height = 32;
        config
    }

    fn finalized(microscope: &LightSheetMicroscope, snapshots: usize) -> LightSheetMicroscopeQueue {
        let mut queue = microscope.request_queue();
        queue.clear_queue().unwrap();
        for i in 0..snapshots {
            queue.set_iz(0, i as f64).unwrap();
            queue.add_current_state_to_queue().unwrap();
        }
        queue.finalize_queue().unwrap();
        queue
    }

    #[tokio::test]
    async fn test_playback_collects_expected_stacks() {
        let microscope = LightSheetMicroscope::simulated(small_config(), SimulationMode::Responsive, 0.0).unwrap();
        let mut queue = finalized(&microscope, 3);
        let sink = Arc::new(CollectingSink::new());

        let outcome = microscope
            .play_queue_into(&mut queue, Duration::from_secs(5), sink.clone())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.received, 3);
        assert_eq!(queue.phase(), QueuePhase::Completed);

        let stacks = sink.take();
        assert_eq!(stacks.len(), 3);
        assert_eq!(microscope.recycler().live(), 3);
        drop(stacks);
        assert_eq!(microscope.recycler().live(), 0);
    }

    #[tokio::test]
    async fn test_replay_after_completion() {
        let microscope = LightSheetMicroscope::simulated(small_config(), SimulationMode::Responsive, 0.0).unwrap();
        let mut queue = finalized(&microscope, 2);
        for _ in 0..2 {
            assert!(microscope
                .play_queue_and_wait_for_stacks(&mut queue, Duration::from_secs(5))
                .await
                .unwrap());
        }
        assert_eq!(microscope.recycler().live(), 0);
        assert!(microscope.recycler().reuses() >= 2);
    }

    #[tokio::test]
    async fn test_playback_prewarms_recycler() {
        let microscope = LightSheetMicroscope::simulated(small_config(), SimulationMode::Responsive, 0.0).unwrap();
        let recycler = microscope.use_recycler("warm", 3, 4, 4);
        let mut queue = finalized(&microscope, 2);

        assert!(microscope
            .play_queue_and_wait_for_stacks(&mut queue, Duration::from_secs(5))
            .await
            .unwrap());
        // Every stack came from the warmed pool
        assert_eq!(recycler.allocations(), 3);
        assert_eq!(recycler.reuses(), 2);
        assert_eq!(recycler.live(), 0);
    }

    #[tokio::test]
    async fn test_unfinalized_queue_is_misuse() {
        let microscope = microscope(SimulationMode::Responsive);
        let mut queue = microscope.request_queue();
        queue.clear_queue().unwrap();
        queue.add_current_state_to_queue().unwrap();
        let err = microscope
            .play_queue_and_wait_for_stacks(&mut queue, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_misuse());
        assert_eq!(queue.phase(), QueuePhase::Building);
    }

    #[tokio::test]
    async fn test_empty_queue_fails_fast() {
        let microscope = microscope(SimulationMode::Unresponsive);
        let mut queue = finalized(&microscope, 0);
        let result = microscope
            .play_queue_and_wait_for_stacks(&mut queue, Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(LsmError::EmptyQueue)));
    }

    #[tokio::test]
    async fn test_failing_generator_reports_false() {
        let microscope = microscope(SimulationMode::Failing);
        let mut queue = finalized(&microscope, 1);
        let outcome = microscope.play_queue(&mut queue, Duration::from_secs(5)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.phase, QueuePhase::Failed);
        assert_eq!(queue.phase(), QueuePhase::Failed);
        assert_eq!(microscope.recycler().live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_generator_times_out() {
        let microscope = microscope(SimulationMode::Unresponsive);
        let mut queue = finalized(&microscope, 2);
        let outcome = microscope.play_queue(&mut queue, Duration::from_secs(1)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.phase, QueuePhase::TimedOut);
        assert!(outcome.elapsed >= Duration::from_secs(1));
        assert!(outcome.elapsed < Duration::from_millis(1100));
    }

    #[test]
    fn test_playback_timeout_policy() {
        let microscope = microscope(SimulationMode::Responsive);
        assert_eq!(microscope.playback_timeout(5), Duration::from_secs(15));
    }

    #[test]
    fn test_use_recycler_switches_current() {
        let microscope = microscope(SimulationMode::Responsive);
        let recycler = microscope.use_recycler("adaptation", 1, 4, 4);
        assert_eq!(microscope.recycler().name(), "adaptation");
        assert!(Arc::ptr_eq(&recycler, &microscope.recycler()));
        assert_eq!(microscope.recyclers().names(), vec!["adaptation", "default"]);
    }

    #[test]
    fn test_exposure_validated() {
        let microscope = microscope(SimulationMode::Responsive);
        assert!(microscope.exposure().set(-1.0).is_err());
        microscope.exposure().set(0.02).unwrap();
        assert_eq!(microscope.request_queue().get_exp(), 0.02);
    }
}
