//! Device registry of one microscope.
//!
//! Holds the configuration and every device built from it. The registry is
//! immutable once built; device values change through their observables.

use std::sync::Arc;

use lsm_core::{ChannelBounds, LsmError, LsmResult, MicroscopeConfig};
use lsm_signal::{SignalGenerator, SimulatedSignalGenerator, SimulationMode};
use tracing::info;

use crate::devices::{DetectionArm, LightSheet, LightSheetDof, SimulatedCamera, StackCamera};

/// Devices of a microscope, indexed as in the configuration.
pub struct DeviceRegistry {
    config: MicroscopeConfig,
    lightsheets: Vec<LightSheet>,
    detection_arms: Vec<DetectionArm>,
    cameras: Vec<Arc<dyn StackCamera>>,
    generator: Arc<dyn SignalGenerator>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("lightsheets", &self.lightsheets.len())
            .field("detection_arms", &self.detection_arms.len())
            .field("cameras", &self.cameras.len())
            .field("generator", &self.generator.name())
            .finish()
    }
}

impl DeviceRegistry {
    /// Build a registry around a signal generator and cameras.
    ///
    /// Light sheets and detection arms are created from `config`. The camera
    /// count must match the configuration.
    pub fn new(
        config: MicroscopeConfig,
        generator: Arc<dyn SignalGenerator>,
        cameras: Vec<Arc<dyn StackCamera>>,
    ) -> LsmResult<Self> {
        config.validate()?;
        if cameras.len() != config.cameras.len() {
            return Err(LsmError::Parameter(format!(
                "{} cameras supplied for {} configured",
                cameras.len(),
                config.cameras.len()
            )));
        }

        let lightsheets = config
            .lightsheets
            .iter()
            .enumerate()
            .map(|(i, c)| LightSheet::new(i, c.clone()))
            .collect();
        let detection_arms = config
            .detection_arms
            .iter()
            .enumerate()
            .map(|(i, c)| DetectionArm::new(i, c.clone()))
            .collect();

        info!(
            microscope = %config.application.name,
            lightsheets = config.lightsheets.len(),
            detection_arms = config.detection_arms.len(),
            cameras = cameras.len(),
            generator = generator.name(),
            "Device registry ready"
        );

        Ok(Self {
            config,
            lightsheets,
            detection_arms,
            cameras,
            generator,
        })
    }

    /// Registry with a simulated generator and simulated cameras triggered
    /// by it.
    pub fn simulated(config: MicroscopeConfig, mode: SimulationMode, time_scale: f64) -> LsmResult<Self> {
        let triggers = config.cameras.iter().map(|c| c.trigger_index).collect();
        let generator = SimulatedSignalGenerator::new("SimulatedSignalGenerator", triggers)
            .with_mode(mode)
            .with_time_scale(time_scale);
        let bus = generator.trigger_bus();
        let cameras = config
            .cameras
            .iter()
            .enumerate()
            .map(|(i, c)| Arc::new(SimulatedCamera::new(i, c.clone(), bus.clone())) as Arc<dyn StackCamera>)
            .collect();
        Self::new(config, Arc::new(generator), cameras)
    }

    /// Configuration the registry was built from.
    #[must_use]
    pub fn config(&self) -> &MicroscopeConfig {
        &self.config
    }

    /// Light sheets.
    #[must_use]
    pub fn lightsheets(&self) -> &[LightSheet] {
        &self.lightsheets
    }

    /// Light sheet `index`.
    pub fn lightsheet(&self, index: usize) -> LsmResult<&LightSheet> {
        self.lightsheets.get(index).ok_or(LsmError::DeviceNotFound {
            kind: "light sheet",
            index,
        })
    }

    /// Detection arms.
    #[must_use]
    pub fn detection_arms(&self) -> &[DetectionArm] {
        &self.detection_arms
    }

    /// Detection arm `index`.
    pub fn detection_arm(&self, index: usize) -> LsmResult<&DetectionArm> {
        self.detection_arms.get(index).ok_or(LsmError::DeviceNotFound {
            kind: "detection arm",
            index,
        })
    }

    /// Cameras.
    #[must_use]
    pub fn cameras(&self) -> &[Arc<dyn StackCamera>] {
        &self.cameras
    }

    /// Camera `index`.
    pub fn camera(&self, index: usize) -> LsmResult<&Arc<dyn StackCamera>> {
        self.cameras.get(index).ok_or(LsmError::DeviceNotFound {
            kind: "camera",
            index,
        })
    }

    /// The signal generator.
    #[must_use]
    pub fn generator(&self) -> &Arc<dyn SignalGenerator> {
        &self.generator
    }

    /// Number of light sheets.
    #[must_use]
    pub fn number_of_lightsheets(&self) -> usize {
        self.lightsheets.len()
    }

    /// Number of detection arms.
    #[must_use]
    pub fn number_of_detection_arms(&self) -> usize {
        self.detection_arms.len()
    }

    /// Number of cameras.
    #[must_use]
    pub fn number_of_cameras(&self) -> usize {
        self.cameras.len()
    }

    /// Bounds of a light-sheet DOF.
    pub fn lightsheet_bounds(&self, index: usize, dof: LightSheetDof) -> LsmResult<ChannelBounds> {
        Ok(self.lightsheet(index)?.bounds(dof))
    }

    /// Bounds of a detection arm's focus.
    pub fn detection_bounds(&self, index: usize) -> LsmResult<ChannelBounds> {
        Ok(self.detection_arm(index)?.z_bounds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsm_core::config::{CameraConfig, DetectionArmConfig};

    fn two_arm_config() -> MicroscopeConfig {
        let mut config = MicroscopeConfig::default();
        let mut arm = config.detection_arms[0].clone();
        arm.name = "D1".into();
        arm.z_index = 1;
        config.detection_arms.push(arm);
        config.cameras.push(CameraConfig {
            name: "C1".into(),
            trigger_index: 13,
            ..config.cameras[0].clone()
        });
        config
    }

    #[test]
    fn test_simulated_registry_enumerates_devices() {
        let registry = DeviceRegistry::simulated(two_arm_config(), SimulationMode::Responsive, 0.0).unwrap();
        assert_eq!(registry.number_of_lightsheets(), 1);
        assert_eq!(registry.number_of_detection_arms(), 2);
        assert_eq!(registry.number_of_cameras(), 2);
        assert_eq!(registry.camera(1).unwrap().trigger_index(), 13);
        assert_eq!(registry.detection_arm(1).unwrap().name(), "D1");
    }

    #[test]
    fn test_missing_device_is_reported() {
        let registry = DeviceRegistry::simulated(MicroscopeConfig::default(), SimulationMode::Responsive, 0.0).unwrap();
        assert!(matches!(
            registry.lightsheet(3),
            Err(LsmError::DeviceNotFound { kind: "light sheet", index: 3 })
        ));
        assert!(registry.detection_bounds(1).is_err());
    }

    #[test]
    fn test_camera_count_must_match() {
        let generator = Arc::new(SimulatedSignalGenerator::new("g", vec![]));
        let result = DeviceRegistry::new(MicroscopeConfig::default(), generator, Vec::new());
        assert!(matches!(result, Err(LsmError::Parameter(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = MicroscopeConfig::default();
        config.detection_arms.push(DetectionArmConfig {
            name: "D1".into(),
            ..config.detection_arms[0].clone()
        });
        let result = DeviceRegistry::simulated(config, SimulationMode::Responsive, 0.0);
        assert!(matches!(result, Err(LsmError::Config(_))));
    }
}
