use lsm_core::config::DetectionArmConfig;
use lsm_core::{ChannelBounds, Observable};

/// A detection arm: objective focus along Z.
#[derive(Debug, Clone)]
pub struct DetectionArm {
    index: usize,
    config: DetectionArmConfig,
    z: Observable<f64>,
}

impl DetectionArm {
    /// Create from configuration, focused at zero (clamped into bounds).
    #[must_use]
    pub fn new(index: usize, config: DetectionArmConfig) -> Self {
        let bounds = config.z_bounds;
        let z = Observable::new(format!("{}.z", config.name), bounds.clamp(0.0))
            .with_units("um")
            .with_range(bounds.min, bounds.max);
        Self { index, config, z }
    }

    /// Device index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &DetectionArmConfig {
        &self.config
    }

    /// Live focus value.
    #[must_use]
    pub fn z(&self) -> &Observable<f64> {
        &self.z
    }

    /// Focus bounds.
    #[must_use]
    pub fn z_bounds(&self) -> ChannelBounds {
        self.config.z_bounds
    }
}
