//! Interactive (live view) acquisition.
//!
//! Repeatedly plays a small queue: in 2D mode two snapshots at a fixed Z
//! built from the current device values, in 3D mode the full stack of an
//! [`AcquisitionState`]. The queue is rebuilt whenever a watched setting or
//! device value changes; with trigger-on-change enabled nothing is played
//! until something changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lsm_core::{CancelFlag, LsmResult, Observable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::acquisition::AcquisitionState;
use crate::devices::LightSheetDof;
use crate::playback::LightSheetMicroscope;
use crate::queue::{AcquisitionType, LightSheetMicroscopeQueue};

/// Recycler of 2D live view.
pub const RECYCLER_2D: &str = "2DInteractive";
/// Recycler of 3D live view.
pub const RECYCLER_3D: &str = "3DInteractive";
const RECYCLER_MIN_AVAILABLE: usize = 60;
const RECYCLER_MAX_AVAILABLE: usize = 60;
const RECYCLER_MAX_LIVE: usize = 60;

/// Deadline of one live-view playback.
pub const PLAYBACK_TIMEOUT: Duration = Duration::from_secs(100);

/// Pause of [`InteractiveAcquisition::run`] while nothing changes.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Live-view mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractiveMode {
    /// Single plane at a fixed Z.
    Acquisition2D,
    /// Full stack of the acquisition state.
    Acquisition3D,
}

/// What one [`InteractiveAcquisition::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A queue was played.
    Played {
        /// Every expected stack arrived.
        success: bool,
    },
    /// Trigger-on-change is set and nothing changed.
    Unchanged,
    /// Live view is not running.
    Stopped,
}

type ChangeCheck = Box<dyn FnMut() -> bool + Send>;

fn change_check<T>(mut receiver: watch::Receiver<T>) -> ChangeCheck
where
    T: Send + Sync + 'static,
{
    Box::new(move || {
        let changed = receiver.has_changed().unwrap_or(false);
        if changed {
            receiver.borrow_and_update();
        }
        changed
    })
}

#[derive(Default)]
struct ChangeTracker {
    checks: Vec<ChangeCheck>,
}

impl ChangeTracker {
    fn watch<T: Clone + Send + Sync + 'static>(&mut self, observable: &Observable<T>) {
        self.checks.push(change_check(observable.subscribe()));
    }

    /// Whether anything changed since the last call. Polls every check.
    fn take_changed(&mut self) -> bool {
        self.checks.iter_mut().fold(false, |changed, check| check() | changed)
    }
}

/// Live-view loop of a microscope.
pub struct InteractiveAcquisition {
    microscope: Arc<LightSheetMicroscope>,
    exposure: Observable<f64>,
    trigger_on_change: Observable<bool>,
    use_current_state: Observable<bool>,
    control_illumination: Observable<bool>,
    control_detection: Observable<bool>,
    z_2d: Observable<f64>,
    active_cameras: Vec<Observable<bool>>,
    counter: Observable<u64>,
    mode: Mutex<Option<InteractiveMode>>,
    state: Mutex<Option<AcquisitionState>>,
    tracker: Mutex<ChangeTracker>,
    rebuild: AtomicBool,
    queue: tokio::sync::Mutex<Option<LightSheetMicroscopeQueue>>,
}

impl std::fmt::Debug for InteractiveAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveAcquisition")
            .field("mode", &*self.mode.lock())
            .field("counter", &self.counter.get())
            .finish_non_exhaustive()
    }
}

impl InteractiveAcquisition {
    /// Live view of `microscope`, stopped.
    #[must_use]
    pub fn new(microscope: Arc<LightSheetMicroscope>) -> Self {
        let registry = Arc::clone(microscope.registry());
        let exposure = Observable::new("interactive.exposure", microscope.exposure().get())
            .with_units("s")
            .with_range(1e-6, 10.0);
        let z_bounds = registry
            .detection_bounds(0)
            .unwrap_or_else(|_| lsm_core::ChannelBounds::unbounded());
        let z_2d = Observable::new("interactive.z", z_bounds.clamp(0.0))
            .with_units("um")
            .with_range(z_bounds.min, z_bounds.max);
        let active_cameras = registry
            .cameras()
            .iter()
            .map(|c| Observable::new(format!("interactive.{}.active", c.name()), true))
            .collect::<Vec<_>>();

        let this = Self {
            exposure,
            trigger_on_change: Observable::new("interactive.trigger_on_change", false),
            use_current_state: Observable::new("interactive.use_current_state", false),
            control_illumination: Observable::new("interactive.control_illumination", true),
            control_detection: Observable::new("interactive.control_detection", true),
            z_2d,
            active_cameras,
            counter: Observable::new("interactive.counter", 0_u64).read_only(),
            mode: Mutex::new(None),
            state: Mutex::new(None),
            tracker: Mutex::new(ChangeTracker::default()),
            rebuild: AtomicBool::new(true),
            queue: tokio::sync::Mutex::new(None),
            microscope,
        };

        {
            let mut tracker = this.tracker.lock();
            tracker.watch(&this.exposure);
            tracker.watch(&this.use_current_state);
            tracker.watch(&this.control_illumination);
            tracker.watch(&this.control_detection);
            tracker.watch(&this.z_2d);
            for camera in &this.active_cameras {
                tracker.watch(camera);
            }
            for ls in registry.lightsheets() {
                for dof in LightSheetDof::ALL {
                    tracker.watch(ls.dof(dof));
                }
                tracker.watch(ls.on());
                for laser in ls.lasers() {
                    tracker.watch(laser);
                }
            }
            for arm in registry.detection_arms() {
                tracker.watch(arm.z());
            }
        }
        this
    }

    /// Exposure of live-view queues.
    #[must_use]
    pub fn exposure(&self) -> &Observable<f64> {
        &self.exposure
    }

    /// Only play when something changed.
    #[must_use]
    pub fn trigger_on_change(&self) -> &Observable<bool> {
        &self.trigger_on_change
    }

    /// In 2D mode, take settings from the acquisition state instead of the
    /// devices.
    #[must_use]
    pub fn use_current_state(&self) -> &Observable<bool> {
        &self.use_current_state
    }

    /// In 2D mode, move the light sheets that are on to the 2D plane.
    #[must_use]
    pub fn control_illumination(&self) -> &Observable<bool> {
        &self.control_illumination
    }

    /// In 2D mode, move the detection focus to the 2D plane.
    #[must_use]
    pub fn control_detection(&self) -> &Observable<bool> {
        &self.control_detection
    }

    /// Plane of 2D mode.
    #[must_use]
    pub fn z_2d(&self) -> &Observable<f64> {
        &self.z_2d
    }

    /// Per-camera enable of 2D mode.
    #[must_use]
    pub fn active_cameras(&self) -> &[Observable<bool>] {
        &self.active_cameras
    }

    /// Successful playbacks.
    #[must_use]
    pub fn counter(&self) -> &Observable<u64> {
        &self.counter
    }

    /// Current mode, `None` when stopped.
    #[must_use]
    pub fn mode(&self) -> Option<InteractiveMode> {
        *self.mode.lock()
    }

    /// Start 2D live view.
    pub fn start_2d(&self) {
        info!("Starting 2D interactive acquisition");
        self.start(InteractiveMode::Acquisition2D);
    }

    /// Start 3D live view of `state`.
    pub fn start_3d(&self, state: AcquisitionState) {
        info!(state = state.name(), "Starting 3D interactive acquisition");
        *self.state.lock() = Some(state);
        self.start(InteractiveMode::Acquisition3D);
    }

    /// Set the acquisition state used by 3D mode and by 2D mode with
    /// `use_current_state`.
    pub fn set_acquisition_state(&self, state: AcquisitionState) {
        *self.state.lock() = Some(state);
        self.invalidate();
    }

    fn start(&self, mode: InteractiveMode) {
        *self.mode.lock() = Some(mode);
        self.invalidate();
    }

    /// Stop live view. A playback in flight completes.
    pub fn stop(&self) {
        if self.mode.lock().take().is_some() {
            info!(acquisitions = self.counter.get(), "Stopped interactive acquisition");
        }
    }

    fn invalidate(&self) {
        self.rebuild.store(true, Ordering::Release);
    }

    /// Rebuild the queue if needed and play it once.
    pub async fn step(&self) -> LsmResult<Step> {
        let Some(mode) = self.mode() else {
            return Ok(Step::Stopped);
        };

        let changed = self.tracker.lock().take_changed();
        let mut slot = self.queue.lock().await;
        let stale = self.rebuild.swap(false, Ordering::AcqRel)
            || slot.as_ref().map_or(true, |q| q.get_queue_length() == 0);

        if !changed && !stale && self.trigger_on_change.get() {
            return Ok(Step::Unchanged);
        }
        if changed || stale {
            let built = match mode {
                InteractiveMode::Acquisition2D => self.build_2d(),
                InteractiveMode::Acquisition3D => self.build_3d(),
            };
            match built {
                Ok(queue) => *slot = queue,
                Err(e) => {
                    // The slot still holds the previous queue; force a rebuild next step
                    self.invalidate();
                    return Err(e);
                }
            }
        }

        let Some(queue) = slot.as_mut().filter(|q| q.get_queue_length() > 0) else {
            warn!("Interactive acquisition queue is empty, stopping");
            self.stop();
            return Ok(Step::Stopped);
        };

        let success = self
            .microscope
            .play_queue_and_wait_for_stacks(queue, PLAYBACK_TIMEOUT)
            .await?;
        if success {
            self.counter.increment();
        } else {
            warn!("Interactive playback did not complete");
        }
        Ok(Step::Played { success })
    }

    /// Step until stopped or cancelled. Returns the counter.
    pub async fn run(&self, cancel: &CancelFlag) -> LsmResult<u64> {
        while !cancel.is_cancelled() {
            match self.step().await? {
                Step::Stopped => break,
                Step::Unchanged => tokio::time::sleep(IDLE_POLL).await,
                Step::Played { .. } => tokio::task::yield_now().await,
            }
        }
        Ok(self.counter.get())
    }

    fn build_2d(&self) -> LsmResult<Option<LightSheetMicroscopeQueue>> {
        self.microscope.use_recycler(
            RECYCLER_2D,
            RECYCLER_MIN_AVAILABLE,
            RECYCLER_MAX_AVAILABLE,
            RECYCLER_MAX_LIVE,
        );
        let z = self.z_2d.get();
        let mut queue = self.microscope.request_queue();
        queue.clear_queue()?;
        queue.set_acquisition_type(AcquisitionType::Interactive)?;
        queue.add_voxel_dim_metadata(1.0)?;
        queue.set_exp(self.exposure.get())?;

        let state = self.state.lock();
        match state.as_ref().filter(|_| self.use_current_state.get()) {
            Some(state) => {
                state.apply_at_z(&mut queue, z)?;
                queue.add_current_state_to_queue()?;
            }
            None => {
                for (c, active) in self.active_cameras.iter().enumerate() {
                    queue.set_c(c, active.get())?;
                    if self.control_detection.get() {
                        queue.set_dz(c, z)?;
                    }
                }
                if self.control_illumination.get() {
                    for l in 0..self.microscope.registry().number_of_lightsheets() {
                        if queue.get_i(l)? {
                            queue.set_iz(l, z)?;
                        }
                    }
                }
                queue.add_current_state_to_queue()?;
                queue.add_current_state_to_queue()?;
            }
        }
        queue.finalize_queue()?;
        debug!(z, queue_length = queue.get_queue_length(), "Built 2D interactive queue");
        Ok(Some(queue))
    }

    fn build_3d(&self) -> LsmResult<Option<LightSheetMicroscopeQueue>> {
        self.microscope.use_recycler(
            RECYCLER_3D,
            RECYCLER_MIN_AVAILABLE,
            RECYCLER_MAX_AVAILABLE,
            RECYCLER_MAX_LIVE,
        );
        let Some(mut state) = self.state.lock().clone() else {
            return Ok(None);
        };
        state.set_exposure_s(self.exposure.get());
        let queue = state.build_queue(&self.microscope, AcquisitionType::Interactive)?;
        Ok(Some(queue))
    }
}
