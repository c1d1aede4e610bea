//! Stack cameras.
//!
//! A camera is armed once per playback with an [`AcquisitionJob`]: how many
//! stacks to deliver, which recycler to lease them from, and where to send
//! them. Arming subscribes to the trigger source synchronously, so a camera
//! armed before the signal generator starts cannot miss a pulse.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use lsm_core::config::CameraConfig;
use lsm_core::{LsmError, LsmResult};
use lsm_pool::{Recycler, StackLease, StackMetadata, StackRequest};
use lsm_signal::TriggerEvent;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// A stack produced by a camera during playback.
#[derive(Debug)]
pub struct CameraStack {
    /// Producing camera.
    pub camera: usize,
    /// The leased stack; dropping it returns the buffer to its recycler.
    pub stack: StackLease,
}

/// Work order for one camera during one playback.
#[derive(Debug)]
pub struct AcquisitionJob {
    /// Number of stacks to deliver.
    pub expected: usize,
    /// Metadata copied onto every stack.
    pub metadata: StackMetadata,
    /// Pool to lease stacks from.
    pub recycler: Arc<Recycler>,
    /// Maximum wait for a free stack.
    pub stack_timeout: Duration,
    /// Destination of filled stacks.
    pub output: mpsc::Sender<CameraStack>,
}

/// Camera that fills leased stacks on trigger.
pub trait StackCamera: Send + Sync {
    /// Device name.
    fn name(&self) -> &str;

    /// Device index.
    fn index(&self) -> usize;

    /// Descriptor of the stacks this camera produces.
    fn stack_request(&self) -> StackRequest;

    /// Line readout time, sizes the before-exposure movement.
    fn readout_us_per_line(&self) -> f64;

    /// Digital channel carrying this camera's trigger.
    fn trigger_index(&self) -> usize;

    /// Pixel size in sample space.
    fn pixel_size_um(&self) -> f64;

    /// Arm for one playback. The returned future resolves with the number of
    /// stacks delivered once `job.expected` stacks were sent.
    fn arm(&self, job: AcquisitionJob) -> BoxFuture<'static, LsmResult<usize>>;
}

/// Simulated camera driven by a simulated signal generator's trigger bus.
#[derive(Debug)]
pub struct SimulatedCamera {
    index: usize,
    config: CameraConfig,
    triggers: broadcast::Sender<TriggerEvent>,
    frames: Arc<AtomicU64>,
}

impl SimulatedCamera {
    /// Create a camera listening on `triggers`.
    #[must_use]
    pub fn new(index: usize, config: CameraConfig, triggers: broadcast::Sender<TriggerEvent>) -> Self {
        Self {
            index,
            config,
            triggers,
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stacks produced over the camera's lifetime.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl StackCamera for SimulatedCamera {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn index(&self) -> usize {
        self.index
    }

    fn stack_request(&self) -> StackRequest {
        StackRequest::new(self.config.width, self.config.height, 1, self.config.pixel_type)
    }

    fn readout_us_per_line(&self) -> f64 {
        self.config.readout_us_per_line
    }

    fn trigger_index(&self) -> usize {
        self.config.trigger_index
    }

    fn pixel_size_um(&self) -> f64 {
        self.config.pixel_size_um
    }

    fn arm(&self, job: AcquisitionJob) -> BoxFuture<'static, LsmResult<usize>> {
        let mut triggers = self.triggers.subscribe();
        let channel = self.config.trigger_index;
        let request = self.stack_request();
        let camera = self.index;
        let name = self.config.name.clone();
        let frames = Arc::clone(&self.frames);

        Box::pin(async move {
            let mut delivered = 0;
            while delivered < job.expected {
                let event = match triggers.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(camera = %name, missed, "Camera missed trigger pulses");
                        return Err(LsmError::Hardware(format!(
                            "camera '{name}' missed {missed} triggers"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(LsmError::Hardware(format!(
                            "trigger line of camera '{name}' closed"
                        )));
                    }
                };
                if event.channel != channel {
                    continue;
                }

                let mut stack = job.recycler.request(&request, job.stack_timeout).await?;
                stack.data_mut().fill((delivered % 251) as u8);
                stack.index = delivered as u64;
                stack.timestamp_ns = chrono::Utc::now()
                    .timestamp_nanos_opt()
                    .map_or(0, |ns| ns.max(0) as u64);
                stack.metadata.merge(&job.metadata);
                stack.metadata.add_entry("movement", event.movement);

                job.output
                    .send(CameraStack { camera, stack })
                    .await
                    .map_err(|_| LsmError::Hardware(format!("stack consumer of '{name}' is gone")))?;
                frames.fetch_add(1, Ordering::Relaxed);
                delivered += 1;
            }
            debug!(camera = %name, delivered, "Camera job done");
            Ok(delivered)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsm_pool::{PixelType, RecyclerLimits};

    fn config() -> CameraConfig {
        CameraConfig {
            name: "C0".into(),
            width: 16,
            height: 8,
            pixel_type: PixelType::U16,
            readout_us_per_line: 1.0,
            pixel_size_um: 0.5,
            trigger_index: 12,
        }
    }

    #[tokio::test]
    async fn test_camera_delivers_on_matching_triggers() {
        let (bus, _) = broadcast::channel(16);
        let camera = SimulatedCamera::new(0, config(), bus.clone());
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 4, 4));
        let (tx, mut rx) = mpsc::channel(4);

        let mut metadata = StackMetadata::new();
        metadata.add_entry("camera", 0);
        let job = camera.arm(AcquisitionJob {
            expected: 2,
            metadata,
            recycler: Arc::clone(&recycler),
            stack_timeout: Duration::from_millis(100),
            output: tx,
        });

        for (channel, movement) in [(12, 0), (13, 1), (12, 2)] {
            bus.send(TriggerEvent {
                channel,
                movement,
                playback: 0,
            })
            .unwrap();
        }

        assert_eq!(job.await.unwrap(), 2);
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.stack.index, 0);
        assert_eq!(second.stack.index, 1);
        assert_eq!(second.stack.metadata.get_f64("movement"), Some(2.0));
        assert_eq!(first.stack.metadata.get_f64("camera"), Some(0.0));
        assert_eq!(first.stack.size_in_bytes(), 16 * 8 * 2);
        assert_eq!(recycler.live(), 2);
        assert_eq!(camera.frames(), 2);
    }

    #[tokio::test]
    async fn test_camera_fails_when_pool_starved() {
        let (bus, _) = broadcast::channel(16);
        let camera = SimulatedCamera::new(0, config(), bus.clone());
        let recycler = Recycler::new("test", RecyclerLimits::new(0, 1, 1));
        let held = recycler.try_request(&camera.stack_request()).unwrap();
        let (tx, _rx) = mpsc::channel(4);

        let job = camera.arm(AcquisitionJob {
            expected: 1,
            metadata: StackMetadata::new(),
            recycler: Arc::clone(&recycler),
            stack_timeout: Duration::from_millis(20),
            output: tx,
        });
        bus.send(TriggerEvent {
            channel: 12,
            movement: 0,
            playback: 0,
        })
        .unwrap();

        assert!(matches!(job.await, Err(LsmError::Recycler(_))));
        drop(held);
        assert_eq!(recycler.live(), 0);
    }
}
