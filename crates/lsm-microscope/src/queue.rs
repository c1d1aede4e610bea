//! Acquisition queue.
//!
//! A queue accumulates device-state snapshots into a [`Score`]. Its
//! lifecycle is an explicit phase machine:
//!
//! ```text
//! Idle --clear/zero--> Building --finalize--> Finalized --play--> Submitted
//!                          ^                                         |
//!                          +------- clear/zero ---- Completed | TimedOut | Failed
//! ```
//!
//! Setters and `add_current_state_to_queue` are only accepted while
//! `Building`. A finalized queue is read-only; its score is frozen into an
//! `Arc` that playback and visualization share. A queue that finished playing
//! may be played again as is.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lsm_core::{LsmError, LsmResult};
use lsm_pool::StackMetadata;
use lsm_signal::{Movement, Score};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::devices::LightSheetDof;
use crate::registry::DeviceRegistry;
use crate::staves::{update_movements, ExposureTiming};
use crate::state::MicroscopeState;

/// Lifecycle phase of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePhase {
    /// Freshly requested, not cleared yet.
    Idle,
    /// Accepting setters and snapshots.
    Building,
    /// Frozen, ready to play.
    Finalized,
    /// Playing.
    Submitted,
    /// Last playback delivered every expected stack.
    Completed,
    /// Last playback hit its deadline.
    TimedOut,
    /// Last playback failed.
    Failed,
}

impl QueuePhase {
    /// Whether a queue in this phase can be played.
    #[must_use]
    pub fn is_playable(self) -> bool {
        matches!(
            self,
            Self::Finalized | Self::Completed | Self::TimedOut | Self::Failed
        )
    }
}

impl fmt::Display for QueuePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::Finalized => "finalized",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
            Self::TimedOut => "timed out",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What an acquisition is for, recorded in stack metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionType {
    /// Live view.
    Interactive,
    /// Time-lapse volume.
    TimeLapse,
    /// Calibration or adaptation sweep.
    Calibration,
    /// Not tagged.
    #[default]
    Unspecified,
}

impl AcquisitionType {
    /// Metadata tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::TimeLapse => "time_lapse",
            Self::Calibration => "calibration",
            Self::Unspecified => "unspecified",
        }
    }
}

/// Builder of one acquisition timeline.
///
/// Obtained from [`LightSheetMicroscope::request_queue`] and owned by a single
/// caller.
///
/// [`LightSheetMicroscope::request_queue`]: crate::playback::LightSheetMicroscope::request_queue
#[derive(Debug)]
pub struct LightSheetMicroscopeQueue {
    registry: Arc<DeviceRegistry>,
    phase: QueuePhase,
    state: MicroscopeState,
    before_exposure: Movement,
    exposure: Movement,
    score: Score,
    frozen: Option<Arc<Score>>,
    length: usize,
    expected: Vec<usize>,
    lightsheets_used: Vec<bool>,
    metadata: StackMetadata,
    acquisition_type: AcquisitionType,
    voxel_depth_um: Option<f64>,
    camera_metadata: Vec<StackMetadata>,
    timing: Option<ExposureTiming>,
}

impl LightSheetMicroscopeQueue {
    pub(crate) fn new(registry: Arc<DeviceRegistry>, exposure_s: f64) -> Self {
        let channels = registry.config().signal.channels;
        let state = MicroscopeState::from_devices(&registry, exposure_s);
        Self {
            phase: QueuePhase::Idle,
            before_exposure: Movement::new("BeforeExposure", Duration::ZERO, channels),
            exposure: Movement::new("Exposure", Duration::ZERO, channels),
            score: Score::new("queue"),
            frozen: None,
            length: 0,
            expected: vec![0; registry.number_of_cameras()],
            lightsheets_used: vec![false; registry.number_of_lightsheets()],
            metadata: StackMetadata::new(),
            acquisition_type: AcquisitionType::Unspecified,
            voxel_depth_um: None,
            camera_metadata: Vec::new(),
            timing: None,
            state,
            registry,
        }
    }

    fn require(&self, operation: &'static str, allowed: impl Fn(QueuePhase) -> bool) -> LsmResult<()> {
        if allowed(self.phase) {
            Ok(())
        } else {
            Err(LsmError::StateMisuse {
                operation,
                phase: self.phase.to_string(),
            })
        }
    }

    fn require_building(&self, operation: &'static str) -> LsmResult<()> {
        self.require(operation, |p| p == QueuePhase::Building)
    }

    fn reset(&mut self, operation: &'static str) -> LsmResult<()> {
        self.require(operation, |p| p != QueuePhase::Submitted)?;
        self.score.clear();
        self.frozen = None;
        self.length = 0;
        self.expected.iter_mut().for_each(|e| *e = 0);
        self.lightsheets_used.iter_mut().for_each(|u| *u = false);
        self.metadata.clear();
        self.acquisition_type = AcquisitionType::Unspecified;
        self.voxel_depth_um = None;
        self.camera_metadata.clear();
        self.timing = None;
        self.phase = QueuePhase::Building;
        Ok(())
    }

    /// Discard accumulated snapshots and metadata and re-read the device
    /// values. Rejected while the queue is playing.
    pub fn clear_queue(&mut self) -> LsmResult<()> {
        self.reset("clear_queue")?;
        let exposure_s = self.state.exposure_s;
        self.state = MicroscopeState::from_devices(&self.registry, exposure_s);
        Ok(())
    }

    /// Like [`clear_queue`](Self::clear_queue), but every DOF is set to zero
    /// (clamped into its bounds), light sheets off and no camera keeping
    /// images.
    pub fn zero(&mut self) -> LsmResult<()> {
        self.reset("zero")?;
        self.state.zero(&self.registry)
    }

    // ------------------------------------------------------------------
    // Light sheets
    // ------------------------------------------------------------------

    /// Set a numeric light-sheet DOF, checked against its bounds.
    pub fn set_lightsheet(&mut self, lightsheet: usize, dof: LightSheetDof, value: f64) -> LsmResult<()> {
        self.require_building("set_lightsheet")?;
        let bounds = self.registry.lightsheet_bounds(lightsheet, dof)?;
        let value = bounds.check(format!("lightsheet[{lightsheet}].{dof}"), value)?;
        if let Some(ls) = self.state.lightsheets.get_mut(lightsheet) {
            ls.set(dof, value);
        }
        Ok(())
    }

    /// Numeric light-sheet DOF.
    pub fn get_lightsheet(&self, lightsheet: usize, dof: LightSheetDof) -> LsmResult<f64> {
        self.state
            .lightsheets
            .get(lightsheet)
            .map(|ls| ls.get(dof))
            .ok_or(LsmError::DeviceNotFound {
                kind: "light sheet",
                index: lightsheet,
            })
    }

    /// Illumination focus.
    pub fn set_ix(&mut self, lightsheet: usize, value: f64) -> LsmResult<()> {
        self.set_lightsheet(lightsheet, LightSheetDof::X, value)
    }

    /// Vertical position.
    pub fn set_iy(&mut self, lightsheet: usize, value: f64) -> LsmResult<()> {
        self.set_lightsheet(lightsheet, LightSheetDof::Y, value)
    }

    /// Axial position.
    pub fn set_iz(&mut self, lightsheet: usize, value: f64) -> LsmResult<()> {
        self.set_lightsheet(lightsheet, LightSheetDof::Z, value)
    }

    /// Sheet width.
    pub fn set_iw(&mut self, lightsheet: usize, value: f64) -> LsmResult<()> {
        self.set_lightsheet(lightsheet, LightSheetDof::Width, value)
    }

    /// Sheet height.
    pub fn set_ih(&mut self, lightsheet: usize, value: f64) -> LsmResult<()> {
        self.set_lightsheet(lightsheet, LightSheetDof::Height, value)
    }

    /// In-plane angle, degrees.
    pub fn set_ia(&mut self, lightsheet: usize, value: f64) -> LsmResult<()> {
        self.set_lightsheet(lightsheet, LightSheetDof::Alpha, value)
    }

    /// Out-of-plane angle, degrees.
    pub fn set_ib(&mut self, lightsheet: usize, value: f64) -> LsmResult<()> {
        self.set_lightsheet(lightsheet, LightSheetDof::Beta, value)
    }

    /// Relative laser power.
    pub fn set_ip(&mut self, lightsheet: usize, value: f64) -> LsmResult<()> {
        self.set_lightsheet(lightsheet, LightSheetDof::Power, value)
    }

    /// Illumination focus.
    pub fn get_ix(&self, lightsheet: usize) -> LsmResult<f64> {
        self.get_lightsheet(lightsheet, LightSheetDof::X)
    }

    /// Vertical position.
    pub fn get_iy(&self, lightsheet: usize) -> LsmResult<f64> {
        self.get_lightsheet(lightsheet, LightSheetDof::Y)
    }

    /// Axial position.
    pub fn get_iz(&self, lightsheet: usize) -> LsmResult<f64> {
        self.get_lightsheet(lightsheet, LightSheetDof::Z)
    }

    /// Sheet width.
    pub fn get_iw(&self, lightsheet: usize) -> LsmResult<f64> {
        self.get_lightsheet(lightsheet, LightSheetDof::Width)
    }

    /// Sheet height.
    pub fn get_ih(&self, lightsheet: usize) -> LsmResult<f64> {
        self.get_lightsheet(lightsheet, LightSheetDof::Height)
    }

    /// In-plane angle.
    pub fn get_ia(&self, lightsheet: usize) -> LsmResult<f64> {
        self.get_lightsheet(lightsheet, LightSheetDof::Alpha)
    }

    /// Out-of-plane angle.
    pub fn get_ib(&self, lightsheet: usize) -> LsmResult<f64> {
        self.get_lightsheet(lightsheet, LightSheetDof::Beta)
    }

    /// Relative laser power.
    pub fn get_ip(&self, lightsheet: usize) -> LsmResult<f64> {
        self.get_lightsheet(lightsheet, LightSheetDof::Power)
    }

    /// Switch a light sheet on or off.
    pub fn set_i(&mut self, lightsheet: usize, on: bool) -> LsmResult<()> {
        self.require_building("set_i")?;
        self.lightsheet_state_mut(lightsheet)?.on = on;
        Ok(())
    }

    /// Switch `lightsheet` on and every other light sheet off.
    pub fn select_i(&mut self, lightsheet: usize) -> LsmResult<()> {
        self.require_building("select_i")?;
        self.lightsheet_state_mut(lightsheet)?;
        for (i, ls) in self.state.lightsheets.iter_mut().enumerate() {
            ls.on = i == lightsheet;
        }
        Ok(())
    }

    /// Whether a light sheet is on.
    pub fn get_i(&self, lightsheet: usize) -> LsmResult<bool> {
        self.state
            .lightsheets
            .get(lightsheet)
            .map(|ls| ls.on)
            .ok_or(LsmError::DeviceNotFound {
                kind: "light sheet",
                index: lightsheet,
            })
    }

    /// Switch one laser of a light sheet on or off.
    pub fn set_ilo(&mut self, lightsheet: usize, laser: usize, on: bool) -> LsmResult<()> {
        self.require_building("set_ilo")?;
        let ls = self.lightsheet_state_mut(lightsheet)?;
        let slot = ls
            .lasers
            .get_mut(laser)
            .ok_or(LsmError::DeviceNotFound { kind: "laser", index: laser })?;
        *slot = on;
        Ok(())
    }

    /// Whether a laser of a light sheet is on.
    pub fn get_ilo(&self, lightsheet: usize, laser: usize) -> LsmResult<bool> {
        self.state
            .lightsheets
            .get(lightsheet)
            .ok_or(LsmError::DeviceNotFound {
                kind: "light sheet",
                index: lightsheet,
            })?
            .lasers
            .get(laser)
            .copied()
            .ok_or(LsmError::DeviceNotFound { kind: "laser", index: laser })
    }

    fn lightsheet_state_mut(&mut self, lightsheet: usize) -> LsmResult<&mut crate::state::LightSheetState> {
        self.state
            .lightsheets
            .get_mut(lightsheet)
            .ok_or(LsmError::DeviceNotFound {
                kind: "light sheet",
                index: lightsheet,
            })
    }

    // ------------------------------------------------------------------
    // Detection and cameras
    // ------------------------------------------------------------------

    /// Detection focus, checked against its bounds.
    pub fn set_dz(&mut self, arm: usize, value: f64) -> LsmResult<()> {
        self.require_building("set_dz")?;
        let bounds = self.registry.detection_bounds(arm)?;
        let value = bounds.check(format!("detection[{arm}].z"), value)?;
        if let Some(state) = self.state.detection.get_mut(arm) {
            state.z = value;
        }
        Ok(())
    }

    /// Detection focus.
    pub fn get_dz(&self, arm: usize) -> LsmResult<f64> {
        self.state
            .detection
            .get(arm)
            .map(|d| d.z)
            .ok_or(LsmError::DeviceNotFound {
                kind: "detection arm",
                index: arm,
            })
    }

    /// Keep (`true`) or discard the image a camera acquires per snapshot.
    pub fn set_c(&mut self, camera: usize, acquire: bool) -> LsmResult<()> {
        self.require_building("set_c")?;
        let state = self
            .state
            .cameras
            .get_mut(camera)
            .ok_or(LsmError::DeviceNotFound { kind: "camera", index: camera })?;
        state.acquire = acquire;
        Ok(())
    }

    /// Whether a camera keeps its images.
    pub fn get_c(&self, camera: usize) -> LsmResult<bool> {
        self.state
            .cameras
            .get(camera)
            .map(|c| c.acquire)
            .ok_or(LsmError::DeviceNotFound { kind: "camera", index: camera })
    }

    /// Exposure in seconds.
    pub fn set_exp(&mut self, exposure_s: f64) -> LsmResult<()> {
        self.require_building("set_exp")?;
        if !(exposure_s.is_finite() && exposure_s > 0.0) {
            return Err(LsmError::Parameter(format!(
                "exposure must be positive, got {exposure_s}"
            )));
        }
        self.state.exposure_s = exposure_s;
        Ok(())
    }

    /// Exposure in seconds.
    #[must_use]
    pub fn get_exp(&self) -> f64 {
        self.state.exposure_s
    }

    /// Current settings.
    #[must_use]
    pub fn state(&self) -> &MicroscopeState {
        &self.state
    }

    // ------------------------------------------------------------------
    // Timeline
    // ------------------------------------------------------------------

    /// Append the current settings as one snapshot (two movements).
    pub fn add_current_state_to_queue(&mut self) -> LsmResult<()> {
        self.require_building("add_current_state_to_queue")?;
        let timing = update_movements(
            &self.registry,
            &self.state,
            &mut self.before_exposure,
            &mut self.exposure,
        )?;
        self.score.add_movement(self.before_exposure.copy());
        self.score.add_movement(self.exposure.copy());
        self.length += 1;
        self.timing = Some(timing);

        for (expected, camera) in self.expected.iter_mut().zip(&self.state.cameras) {
            if camera.acquire {
                *expected += 1;
            }
        }
        for (used, ls) in self.lightsheets_used.iter_mut().zip(&self.state.lightsheets) {
            *used |= ls.on;
        }
        trace!(queue_length = self.length, "Snapshot added");
        Ok(())
    }

    /// Record the stack's Z step. X/Y come from each camera's pixel size.
    pub fn add_voxel_dim_metadata(&mut self, voxel_depth_um: f64) -> LsmResult<()> {
        self.require_building("add_voxel_dim_metadata")?;
        self.voxel_depth_um = Some(voxel_depth_um);
        Ok(())
    }

    /// Attach a metadata entry to every camera's stacks.
    pub fn add_metadata_entry(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> LsmResult<()> {
        self.require_building("add_metadata_entry")?;
        self.metadata.add_entry(key, value);
        Ok(())
    }

    /// Tag the acquisition.
    pub fn set_acquisition_type(&mut self, acquisition_type: AcquisitionType) -> LsmResult<()> {
        self.require_building("set_acquisition_type")?;
        self.acquisition_type = acquisition_type;
        Ok(())
    }

    /// Freeze the score and build each camera's stack metadata.
    pub fn finalize_queue(&mut self) -> LsmResult<()> {
        self.require_building("finalize_queue")?;

        self.camera_metadata = self
            .registry
            .cameras()
            .iter()
            .enumerate()
            .map(|(index, camera)| {
                let mut metadata = self.metadata.clone();
                metadata.add_entry("camera", index);
                metadata.add_entry("camera_name", camera.name());
                for (l, used) in self.lightsheets_used.iter().enumerate() {
                    metadata.add_entry(format!("lightsheet_{l}"), *used);
                }
                metadata.add_entry("acquisition_type", self.acquisition_type.as_str());
                metadata.add_entry("exposure_s", self.state.exposure_s);
                metadata.add_entry("expected_stacks", self.expected.get(index).copied().unwrap_or(0));
                if let Some(depth) = self.voxel_depth_um {
                    metadata.add_entry("voxel_dim_x", camera.pixel_size_um());
                    metadata.add_entry("voxel_dim_y", camera.pixel_size_um());
                    metadata.add_entry("voxel_dim_z", depth);
                }
                metadata
            })
            .collect();

        let score = std::mem::replace(&mut self.score, Score::new("queue"));
        self.frozen = Some(Arc::new(score));
        self.phase = QueuePhase::Finalized;
        debug!(
            queue_length = self.length,
            expected = self.total_expected_stacks(),
            acquisition_type = self.acquisition_type.as_str(),
            "Queue finalized"
        );
        Ok(())
    }

    /// Number of snapshots.
    #[must_use]
    pub fn get_queue_length(&self) -> usize {
        self.length
    }

    /// Stacks camera `camera` delivers per playback.
    #[must_use]
    pub fn expected_stacks(&self, camera: usize) -> usize {
        self.expected.get(camera).copied().unwrap_or(0)
    }

    /// Stacks all cameras deliver per playback.
    #[must_use]
    pub fn total_expected_stacks(&self) -> usize {
        self.expected.iter().sum()
    }

    /// The frozen score, once finalized.
    #[must_use]
    pub fn score(&self) -> Option<Arc<Score>> {
        self.frozen.clone()
    }

    /// Movements accumulated so far, or the frozen score after finalize.
    #[must_use]
    pub fn number_of_movements(&self) -> usize {
        self.frozen
            .as_ref()
            .map_or(self.score.number_of_movements(), |s| s.number_of_movements())
    }

    /// Stack metadata of a camera, once finalized.
    #[must_use]
    pub fn camera_metadata(&self, camera: usize) -> Option<&StackMetadata> {
        self.camera_metadata.get(camera)
    }

    /// Movement durations of the last snapshot.
    #[must_use]
    pub fn timing(&self) -> Option<ExposureTiming> {
        self.timing
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> QueuePhase {
        self.phase
    }

    /// Registry the queue was built against.
    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub(crate) fn begin_playback(&mut self) -> LsmResult<Arc<Score>> {
        self.require("play_queue", QueuePhase::is_playable)?;
        if self.length == 0 {
            return Err(LsmError::EmptyQueue);
        }
        let score = self.frozen.clone().ok_or(LsmError::StateMisuse {
            operation: "play_queue",
            phase: self.phase.to_string(),
        })?;
        self.phase = QueuePhase::Submitted;
        Ok(score)
    }

    pub(crate) fn end_playback(&mut self, phase: QueuePhase) {
        self.phase = phase;
    }
}
