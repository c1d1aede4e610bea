//! Calibration sweep of a light-sheet DOF.
//!
//! For every light sheet, one queue sweeps the DOF across its bounds. Each
//! sample value is held for a number of settling snapshots whose images are
//! discarded, followed by one kept snapshot. A caller-supplied metric scores
//! each kept image as it arrives; the image is released right after. The
//! value with the highest score is the calibration result, which can be
//! written to the devices or into a control plane of an acquisition state.

use std::sync::Arc;
use std::time::Duration;

use lsm_core::{CancelFlag, LsmError, LsmResult};
use lsm_pool::StackLease;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::acquisition::{AcquisitionState, TableColumn};
use crate::devices::{CameraStack, LightSheetDof};
use crate::playback::{LightSheetMicroscope, StackSink};
use crate::queue::{AcquisitionType, LightSheetMicroscopeQueue, QueuePhase};
use crate::registry::DeviceRegistry;

/// Recycler of calibration playbacks.
pub const CALIBRATION_RECYCLER: &str = "adaptation";

/// Score of one image; higher is better.
pub type PlaneMetric = Arc<dyn Fn(&StackLease) -> f64 + Send + Sync>;

/// Sweep parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Swept DOF.
    pub dof: LightSheetDof,
    /// Intervals across the DOF's bounds; `samples + 1` values are tried.
    pub samples: usize,
    /// Discarded snapshots before each kept one.
    pub settle_snapshots: usize,
    /// Detection arm (and camera) imaging the sweep.
    pub detection_arm: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            dof: LightSheetDof::Width,
            samples: 3,
            settle_snapshots: 10,
            detection_arm: 0,
        }
    }
}

/// Sweep result of one light sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    /// Light sheet index.
    pub lightsheet: usize,
    /// Swept DOF.
    pub dof: LightSheetDof,
    /// Values tried.
    pub values: Vec<f64>,
    /// Metric of each value.
    pub metrics: Vec<f64>,
}

impl SweepResult {
    /// Value with the highest metric.
    #[must_use]
    pub fn best_value(&self) -> Option<f64> {
        self.values
            .iter()
            .zip(&self.metrics)
            .filter(|(_, m)| m.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(v, _)| *v)
    }

    /// Set the light sheet's DOF to the best value.
    pub fn apply_to_devices(&self, registry: &DeviceRegistry) -> LsmResult<()> {
        let value = self.best()?;
        registry.lightsheet(self.lightsheet)?.dof(self.dof).set(value)
    }

    /// Write the best value into one control plane of `state`.
    pub fn apply_to_state(&self, state: &mut AcquisitionState, control_plane: usize) -> LsmResult<()> {
        let value = self.best()?;
        let column = TableColumn::LightSheet {
            index: self.lightsheet,
            dof: self.dof,
        };
        state.table_mut().set(column, control_plane, value)
    }

    fn best(&self) -> LsmResult<f64> {
        self.best_value().ok_or_else(|| {
            LsmError::Parameter(format!(
                "no usable {} metric for light sheet {}",
                self.dof, self.lightsheet
            ))
        })
    }
}

struct MetricSink {
    camera: usize,
    metric: PlaneMetric,
    scores: Mutex<Vec<f64>>,
}

impl StackSink for MetricSink {
    fn consume(&self, stack: CameraStack) {
        if stack.camera == self.camera {
            let score = (self.metric)(&stack.stack);
            self.scores.lock().push(score);
        }
    }
}

/// Sweeps a light-sheet DOF and scores the images.
pub struct CalibrationSweep {
    microscope: Arc<LightSheetMicroscope>,
    config: SweepConfig,
    metric: PlaneMetric,
}

impl std::fmt::Debug for CalibrationSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationSweep")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CalibrationSweep {
    /// Sweep on `microscope` scored by `metric`.
    pub fn new(microscope: Arc<LightSheetMicroscope>, config: SweepConfig, metric: PlaneMetric) -> Self {
        Self {
            microscope,
            config,
            metric,
        }
    }

    /// Values tried for a light sheet: `samples + 1` evenly spaced points
    /// over the DOF's bounds.
    pub fn sample_values(&self, lightsheet: usize) -> LsmResult<Vec<f64>> {
        let bounds = self
            .microscope
            .registry()
            .lightsheet_bounds(lightsheet, self.config.dof)?;
        let samples = self.config.samples.max(1);
        let step = bounds.span() / samples as f64;
        Ok((0..=samples).map(|i| bounds.min + step * i as f64).collect())
    }

    /// Sweep every light sheet, stopping with [`LsmError::Cancelled`] once
    /// `cancel` is set.
    pub async fn run(&self, cancel: &CancelFlag) -> LsmResult<Vec<SweepResult>> {
        let mut results = Vec::new();
        for lightsheet in 0..self.microscope.registry().number_of_lightsheets() {
            results.push(self.calibrate(lightsheet, cancel).await?);
        }
        Ok(results)
    }

    /// Sweep one light sheet.
    ///
    /// A playback that times out is a [`LsmError::Timeout`], one that fails
    /// a [`LsmError::Hardware`] error. Setting `cancel` aborts the playback
    /// in flight; its stacks go back to the recycler.
    pub async fn calibrate(&self, lightsheet: usize, cancel: &CancelFlag) -> LsmResult<SweepResult> {
        let values = self.sample_values(lightsheet)?;
        let mut queue = self.build_queue(lightsheet, &values)?;
        if cancel.is_cancelled() {
            info!(lightsheet, "Calibration cancelled");
            return Err(LsmError::Cancelled);
        }

        self.microscope.use_recycler(CALIBRATION_RECYCLER, 1, 4, 4);
        let sink = Arc::new(MetricSink {
            camera: self.config.detection_arm,
            metric: Arc::clone(&self.metric),
            scores: Mutex::new(Vec::with_capacity(values.len())),
        });
        let timeout = Duration::from_secs(queue.get_queue_length() as u64);
        let outcome = tokio::select! {
            outcome = self.microscope.play_queue_into(&mut queue, timeout, Arc::clone(&sink) as Arc<dyn StackSink>) => outcome?,
            () = cancel.cancelled() => {
                info!(lightsheet, "Calibration cancelled during playback");
                return Err(LsmError::Cancelled);
            }
        };

        match outcome.phase {
            QueuePhase::Completed => {}
            QueuePhase::TimedOut => {
                warn!(lightsheet, received = outcome.received, "Calibration sweep timed out");
                return Err(LsmError::Timeout {
                    operation: format!("{} sweep of light sheet {lightsheet}", self.config.dof),
                    timeout,
                });
            }
            phase => {
                return Err(LsmError::Hardware(format!(
                    "{} sweep of light sheet {lightsheet} ended {phase}",
                    self.config.dof
                )));
            }
        }

        let metrics = std::mem::take(&mut *sink.scores.lock());
        info!(
            lightsheet,
            dof = %self.config.dof,
            samples = values.len(),
            "Calibration sweep done"
        );
        Ok(SweepResult {
            lightsheet,
            dof: self.config.dof,
            values,
            metrics,
        })
    }

    fn build_queue(&self, lightsheet: usize, values: &[f64]) -> LsmResult<LightSheetMicroscopeQueue> {
        let dof = self.config.dof;
        let arm = self.config.detection_arm;
        let mut queue = self.microscope.request_queue();
        queue.clear_queue()?;
        queue.zero()?;
        queue.set_acquisition_type(AcquisitionType::Calibration)?;

        queue.select_i(lightsheet)?;
        for fixed in [LightSheetDof::X, LightSheetDof::Y, LightSheetDof::Z, LightSheetDof::Height] {
            queue.set_lightsheet(lightsheet, fixed, 0.0)?;
        }
        queue.set_dz(arm, 0.0)?;
        queue.set_c(arm, false)?;

        if let Some(&first) = values.first() {
            queue.set_lightsheet(lightsheet, dof, first)?;
            queue.add_current_state_to_queue()?;
        }
        for &value in values {
            queue.set_lightsheet(lightsheet, dof, value)?;
            queue.set_c(arm, false)?;
            for _ in 0..self.config.settle_snapshots {
                queue.add_current_state_to_queue()?;
            }
            queue.set_c(arm, true)?;
            queue.add_current_state_to_queue()?;
        }

        queue.add_voxel_dim_metadata(10.0)?;
        queue.finalize_queue()?;
        Ok(queue)
    }
}
