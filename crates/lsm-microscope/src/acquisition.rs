//! Acquisition state: a z-stack with per-plane device corrections.
//!
//! Control planes are anchor positions along the stack's Z axis. At each one
//! the state stores a value for every light-sheet DOF and detection focus;
//! between control planes values are interpolated linearly, beyond the
//! outermost planes the nearest plane's value holds. Light-sheet Z and
//! detection Z are stored as offsets from the plane position, every other
//! DOF as an absolute value.

use lsm_core::{LsmError, LsmResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::devices::LightSheetDof;
use crate::playback::LightSheetMicroscope;
use crate::queue::{AcquisitionType, LightSheetMicroscopeQueue};
use crate::registry::DeviceRegistry;

/// A column of the interpolation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum TableColumn {
    /// A numeric DOF of a light sheet.
    LightSheet {
        /// Light sheet index.
        index: usize,
        /// DOF.
        dof: LightSheetDof,
    },
    /// Focus offset of a detection arm.
    DetectionZ {
        /// Detection arm index.
        index: usize,
    },
}

impl TableColumn {
    /// Whether values are offsets from the plane position.
    #[must_use]
    pub fn is_z_offset(self) -> bool {
        matches!(
            self,
            Self::DetectionZ { .. }
                | Self::LightSheet {
                    dof: LightSheetDof::Z,
                    ..
                }
        )
    }
}

/// One control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlane {
    /// Position along the stack.
    pub z: f64,
    /// One value per table column.
    pub values: Vec<f64>,
}

/// Per-plane values of a set of columns, linearly interpolated along Z.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolationTable {
    columns: Vec<TableColumn>,
    defaults: Vec<f64>,
    planes: Vec<ControlPlane>,
}

impl InterpolationTable {
    /// Table with no control planes. `defaults` apply until a plane exists.
    pub fn new(columns: Vec<(TableColumn, f64)>) -> Self {
        let (columns, defaults): (Vec<_>, Vec<_>) = columns.into_iter().unzip();
        Self {
            columns,
            defaults,
            planes: Vec::new(),
        }
    }

    /// Columns in storage order.
    #[must_use]
    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    fn column(&self, column: TableColumn) -> LsmResult<usize> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .ok_or_else(|| LsmError::Parameter(format!("no table column {column:?}")))
    }

    fn plane_mut(&mut self, plane: usize) -> LsmResult<&mut ControlPlane> {
        self.planes
            .get_mut(plane)
            .ok_or(LsmError::DeviceNotFound {
                kind: "control plane",
                index: plane,
            })
    }

    /// Insert a control plane at `z`, seeded with the values interpolated
    /// there. Returns its index; planes stay sorted by Z.
    pub fn add_control_plane(&mut self, z: f64) -> LsmResult<usize> {
        if !z.is_finite() {
            return Err(LsmError::Parameter(format!("control plane at {z}")));
        }
        let values = (0..self.columns.len()).map(|c| self.interpolate(c, z)).collect();
        let index = self.planes.partition_point(|p| p.z < z);
        self.planes.insert(index, ControlPlane { z, values });
        Ok(index)
    }

    /// Number of control planes.
    #[must_use]
    pub fn number_of_control_planes(&self) -> usize {
        self.planes.len()
    }

    /// Control planes, sorted by Z.
    #[must_use]
    pub fn control_planes(&self) -> &[ControlPlane] {
        &self.planes
    }

    /// Set a column's value at one control plane.
    pub fn set(&mut self, column: TableColumn, plane: usize, value: f64) -> LsmResult<()> {
        let c = self.column(column)?;
        self.plane_mut(plane)?.values[c] = value;
        Ok(())
    }

    /// Add `delta` to a column's value at one control plane.
    pub fn add(&mut self, column: TableColumn, plane: usize, delta: f64) -> LsmResult<()> {
        let c = self.column(column)?;
        self.plane_mut(plane)?.values[c] += delta;
        Ok(())
    }

    /// Set a column to `value` at every control plane and as its default.
    pub fn set_uniform(&mut self, column: TableColumn, value: f64) -> LsmResult<()> {
        let c = self.column(column)?;
        self.defaults[c] = value;
        for plane in &mut self.planes {
            plane.values[c] = value;
        }
        Ok(())
    }

    /// Value of a column at one control plane.
    pub fn get(&self, column: TableColumn, plane: usize) -> LsmResult<f64> {
        let c = self.column(column)?;
        self.planes
            .get(plane)
            .map(|p| p.values[c])
            .ok_or(LsmError::DeviceNotFound {
                kind: "control plane",
                index: plane,
            })
    }

    /// Value of a column at `z`.
    pub fn interpolated(&self, column: TableColumn, z: f64) -> LsmResult<f64> {
        Ok(self.interpolate(self.column(column)?, z))
    }

    fn interpolate(&self, c: usize, z: f64) -> f64 {
        let (Some(first), Some(last)) = (self.planes.first(), self.planes.last()) else {
            return self.defaults[c];
        };
        if z <= first.z {
            return first.values[c];
        }
        if z >= last.z {
            return last.values[c];
        }
        let upper = self.planes.partition_point(|p| p.z <= z);
        let (a, b) = (&self.planes[upper - 1], &self.planes[upper]);
        if b.z == a.z {
            return a.values[c];
        }
        let u = (z - a.z) / (b.z - a.z);
        a.values[c] + (b.values[c] - a.values[c]) * u
    }
}

/// A z-stack: range, plane count, active devices and control-plane table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionState {
    name: String,
    start_z: f64,
    stop_z: f64,
    planes: usize,
    exposure_s: f64,
    lightsheets_on: Vec<bool>,
    cameras_on: Vec<bool>,
    table: InterpolationTable,
}

impl AcquisitionState {
    /// State seeded from the current device values: a single plane at zero,
    /// the devices' on flags, every camera acquiring.
    #[must_use]
    pub fn from_devices(name: impl Into<String>, registry: &DeviceRegistry, exposure_s: f64) -> Self {
        let mut columns = Vec::new();
        for arm in registry.detection_arms() {
            columns.push((TableColumn::DetectionZ { index: arm.index() }, 0.0));
        }
        for ls in registry.lightsheets() {
            for dof in LightSheetDof::ALL {
                let default = if dof == LightSheetDof::Z { 0.0 } else { ls.dof(dof).get() };
                columns.push((TableColumn::LightSheet { index: ls.index(), dof }, default));
            }
        }
        Self {
            name: name.into(),
            start_z: 0.0,
            stop_z: 0.0,
            planes: 1,
            exposure_s,
            lightsheets_on: registry.lightsheets().iter().map(|ls| ls.on().get()).collect(),
            cameras_on: vec![true; registry.number_of_cameras()],
            table: InterpolationTable::new(columns),
        }
    }

    /// State name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the stack range and number of planes.
    pub fn set_stack(&mut self, start_z: f64, stop_z: f64, planes: usize) -> LsmResult<()> {
        if planes == 0 || !start_z.is_finite() || !stop_z.is_finite() {
            return Err(LsmError::Parameter(format!(
                "invalid stack {start_z}..{stop_z} with {planes} planes"
            )));
        }
        self.start_z = start_z;
        self.stop_z = stop_z;
        self.planes = planes;
        Ok(())
    }

    /// Number of planes.
    #[must_use]
    pub fn planes(&self) -> usize {
        self.planes
    }

    /// Distance between planes.
    #[must_use]
    pub fn step_z(&self) -> f64 {
        if self.planes > 1 {
            (self.stop_z - self.start_z) / (self.planes - 1) as f64
        } else {
            0.0
        }
    }

    /// Position of plane `plane`.
    #[must_use]
    pub fn z_at(&self, plane: usize) -> f64 {
        self.start_z + self.step_z() * plane as f64
    }

    /// Exposure in seconds.
    #[must_use]
    pub fn exposure_s(&self) -> f64 {
        self.exposure_s
    }

    /// Set the exposure.
    pub fn set_exposure_s(&mut self, exposure_s: f64) {
        self.exposure_s = exposure_s;
    }

    /// Switch a light sheet on or off for the whole stack.
    pub fn set_lightsheet_on(&mut self, lightsheet: usize, on: bool) -> LsmResult<()> {
        let slot = self.lightsheets_on.get_mut(lightsheet).ok_or(LsmError::DeviceNotFound {
            kind: "light sheet",
            index: lightsheet,
        })?;
        *slot = on;
        Ok(())
    }

    /// Enable or disable a camera for the whole stack.
    pub fn set_camera_on(&mut self, camera: usize, on: bool) -> LsmResult<()> {
        let slot = self
            .cameras_on
            .get_mut(camera)
            .ok_or(LsmError::DeviceNotFound { kind: "camera", index: camera })?;
        *slot = on;
        Ok(())
    }

    /// Control-plane table.
    #[must_use]
    pub fn table(&self) -> &InterpolationTable {
        &self.table
    }

    /// Mutable control-plane table.
    pub fn table_mut(&mut self) -> &mut InterpolationTable {
        &mut self.table
    }

    /// Write the settings interpolated at `z` into a building queue.
    pub fn apply_at_z(&self, queue: &mut LightSheetMicroscopeQueue, z: f64) -> LsmResult<()> {
        for &column in self.table.columns() {
            let mut value = self.table.interpolated(column, z)?;
            if column.is_z_offset() {
                value += z;
            }
            match column {
                TableColumn::DetectionZ { index } => queue.set_dz(index, value)?,
                TableColumn::LightSheet { index, dof } => queue.set_lightsheet(index, dof, value)?,
            }
        }
        for (l, &on) in self.lightsheets_on.iter().enumerate() {
            queue.set_i(l, on)?;
        }
        for (c, &on) in self.cameras_on.iter().enumerate() {
            queue.set_c(c, on)?;
        }
        Ok(())
    }

    /// A finalized queue holding one snapshot per plane.
    pub fn build_queue(
        &self,
        microscope: &LightSheetMicroscope,
        acquisition_type: AcquisitionType,
    ) -> LsmResult<LightSheetMicroscopeQueue> {
        let mut queue = microscope.request_queue();
        queue.clear_queue()?;
        queue.set_exp(self.exposure_s)?;
        queue.set_acquisition_type(acquisition_type)?;
        queue.add_voxel_dim_metadata(self.step_z().abs())?;
        queue.add_metadata_entry("acquisition_state", self.name.as_str())?;
        for plane in 0..self.planes {
            self.apply_at_z(&mut queue, self.z_at(plane))?;
            queue.add_current_state_to_queue()?;
        }
        queue.finalize_queue()?;
        debug!(
            state = %self.name,
            planes = self.planes,
            step_z = self.step_z(),
            "Built queue from acquisition state"
        );
        Ok(queue)
    }
}
