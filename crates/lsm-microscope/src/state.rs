//! Snapshot of every device setting a queue can change.

use lsm_core::LsmResult;
use serde::{Deserialize, Serialize};

use crate::devices::LightSheetDof;
use crate::registry::DeviceRegistry;

/// Settings of one light sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSheetState {
    /// Illumination focus.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Axial position.
    pub z: f64,
    /// Sheet width.
    pub width: f64,
    /// Sheet height.
    pub height: f64,
    /// In-plane angle, degrees.
    pub alpha: f64,
    /// Out-of-plane angle, degrees.
    pub beta: f64,
    /// Relative laser power.
    pub power: f64,
    /// Light sheet switched on.
    pub on: bool,
    /// Per-laser on/off.
    pub lasers: Vec<bool>,
}

impl LightSheetState {
    /// Value of a numeric DOF.
    #[must_use]
    pub fn get(&self, dof: LightSheetDof) -> f64 {
        match dof {
            LightSheetDof::X => self.x,
            LightSheetDof::Y => self.y,
            LightSheetDof::Z => self.z,
            LightSheetDof::Width => self.width,
            LightSheetDof::Height => self.height,
            LightSheetDof::Alpha => self.alpha,
            LightSheetDof::Beta => self.beta,
            LightSheetDof::Power => self.power,
        }
    }

    /// Overwrite a numeric DOF. Bounds are checked by the caller.
    pub fn set(&mut self, dof: LightSheetDof, value: f64) {
        let slot = match dof {
            LightSheetDof::X => &mut self.x,
            LightSheetDof::Y => &mut self.y,
            LightSheetDof::Z => &mut self.z,
            LightSheetDof::Width => &mut self.width,
            LightSheetDof::Height => &mut self.height,
            LightSheetDof::Alpha => &mut self.alpha,
            LightSheetDof::Beta => &mut self.beta,
            LightSheetDof::Power => &mut self.power,
        };
        *slot = value;
    }
}

/// Settings of one detection arm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionState {
    /// Detection focus.
    pub z: f64,
}

/// Settings of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    /// Keep the image acquired during a snapshot (the C flag).
    pub acquire: bool,
}

/// All queue-controlled settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroscopeState {
    /// Light sheets, by index.
    pub lightsheets: Vec<LightSheetState>,
    /// Detection arms, by index.
    pub detection: Vec<DetectionState>,
    /// Cameras, by index.
    pub cameras: Vec<CameraState>,
    /// Exposure in seconds, shared by all cameras.
    pub exposure_s: f64,
}

impl MicroscopeState {
    /// Read the current device values. Every camera starts acquiring.
    #[must_use]
    pub fn from_devices(registry: &DeviceRegistry, exposure_s: f64) -> Self {
        let lightsheets = registry
            .lightsheets()
            .iter()
            .map(|ls| LightSheetState {
                x: ls.dof(LightSheetDof::X).get(),
                y: ls.dof(LightSheetDof::Y).get(),
                z: ls.dof(LightSheetDof::Z).get(),
                width: ls.dof(LightSheetDof::Width).get(),
                height: ls.dof(LightSheetDof::Height).get(),
                alpha: ls.dof(LightSheetDof::Alpha).get(),
                beta: ls.dof(LightSheetDof::Beta).get(),
                power: ls.dof(LightSheetDof::Power).get(),
                on: ls.on().get(),
                lasers: ls.lasers().iter().map(|l| l.get()).collect(),
            })
            .collect();
        let detection = registry
            .detection_arms()
            .iter()
            .map(|arm| DetectionState { z: arm.z().get() })
            .collect();
        let cameras = vec![CameraState { acquire: true }; registry.number_of_cameras()];
        Self {
            lightsheets,
            detection,
            cameras,
            exposure_s,
        }
    }

    /// Move every numeric DOF to zero, or to the bound nearest zero when
    /// zero lies outside its range. Light sheets are switched off and no
    /// camera keeps images. Laser flags and exposure are left alone.
    pub fn zero(&mut self, registry: &DeviceRegistry) -> LsmResult<()> {
        for (index, ls) in self.lightsheets.iter_mut().enumerate() {
            for dof in LightSheetDof::ALL {
                ls.set(dof, registry.lightsheet_bounds(index, dof)?.clamp(0.0));
            }
            ls.on = false;
        }
        for (index, arm) in self.detection.iter_mut().enumerate() {
            arm.z = registry.detection_bounds(index)?.clamp(0.0);
        }
        for camera in &mut self.cameras {
            camera.acquire = false;
        }
        Ok(())
    }

    /// Indices of light sheets that are on.
    #[must_use]
    pub fn active_lightsheets(&self) -> Vec<usize> {
        self.lightsheets
            .iter()
            .enumerate()
            .filter_map(|(i, ls)| ls.on.then_some(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsm_core::MicroscopeConfig;
    use lsm_signal::SimulationMode;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::simulated(MicroscopeConfig::default(), SimulationMode::Responsive, 0.0).unwrap()
    }

    #[test]
    fn test_snapshot_reads_devices() {
        let registry = registry();
        registry.lightsheet(0).unwrap().dof(LightSheetDof::Z).set(12.5).unwrap();
        registry.detection_arm(0).unwrap().z().set(-3.0).unwrap();

        let state = MicroscopeState::from_devices(&registry, 0.02);
        assert_eq!(state.lightsheets[0].z, 12.5);
        assert_eq!(state.lightsheets[0].height, 1.0);
        assert!(state.lightsheets[0].on);
        assert_eq!(state.detection[0].z, -3.0);
        assert!(state.cameras[0].acquire);
        assert_eq!(state.active_lightsheets(), vec![0]);
    }

    #[test]
    fn test_zero_keeps_lasers_and_exposure() {
        let registry = registry();
        let mut state = MicroscopeState::from_devices(&registry, 0.02);
        state.lightsheets[0].power = 0.7;
        state.zero(&registry).unwrap();
        assert_eq!(state.lightsheets[0].power, 0.0);
        assert_eq!(state.lightsheets[0].height, 0.0);
        assert!(!state.lightsheets[0].on);
        assert_eq!(state.lightsheets[0].lasers, vec![true]);
        assert!(!state.cameras[0].acquire);
        assert_eq!(state.exposure_s, 0.02);
    }

    #[test]
    fn test_zero_stays_within_bounds() {
        let mut config = MicroscopeConfig::default();
        config.lightsheets[0].bounds.width = lsm_core::ChannelBounds::new(0.2, 1.0);
        config.detection_arms[0].z_bounds = lsm_core::ChannelBounds::new(-50.0, -10.0);
        let registry = DeviceRegistry::simulated(config, SimulationMode::Responsive, 0.0).unwrap();

        let mut state = MicroscopeState::from_devices(&registry, 0.01);
        state.zero(&registry).unwrap();
        assert_eq!(state.lightsheets[0].width, 0.2);
        assert_eq!(state.lightsheets[0].x, 0.0);
        assert_eq!(state.detection[0].z, -10.0);
    }

    #[test]
    fn test_get_set_by_dof() {
        let mut state = MicroscopeState::from_devices(&registry(), 0.01);
        for (i, dof) in LightSheetDof::ALL.into_iter().enumerate() {
            state.lightsheets[0].set(dof, i as f64);
        }
        assert_eq!(state.lightsheets[0].get(LightSheetDof::Alpha), 5.0);
        assert_eq!(state.lightsheets[0].beta, 6.0);
    }
}
