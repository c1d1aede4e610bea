//! Microscope configuration using Figment.
//!
//! Configuration is merged from, lowest to highest precedence:
//! 1. built-in defaults (one light sheet, one detection arm, one camera)
//! 2. a TOML file
//! 3. environment variables prefixed with `LSM_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by `__`:
//!
//! ```text
//! LSM_APPLICATION__LOG_LEVEL=debug
//! LSM_PLAYBACK__BASE_TIMEOUT_SECS=30
//! LSM_RECYCLER__MAX_LIVE=16
//! ```
//!
//! # Example
//!
//! ```no_run
//! use lsm_core::config::MicroscopeConfig;
//!
//! let config = MicroscopeConfig::load_from("config/microscope.toml")?;
//! println!("{} light sheets", config.lightsheets.len());
//! # Ok::<(), lsm_core::config::ConfigError>(())
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use lsm_pool::{PixelType, RecyclerLimits};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bounds::{AffineFunction, ChannelBounds};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Parsing or merging failed.
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
    /// Values parsed but are inconsistent.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level microscope configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroscopeConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Signal generator settings
    pub signal: SignalConfig,
    /// Playback timing
    pub playback: PlaybackConfig,
    /// Default stack recycler limits
    pub recycler: RecyclerLimits,
    /// Light sheets, in device index order
    pub lightsheets: Vec<LightSheetConfig>,
    /// Detection arms, in device index order
    pub detection_arms: Vec<DetectionArmConfig>,
    /// Cameras, in device index order
    pub cameras: Vec<CameraConfig>,
    /// Optional optical switch selecting light sheets with digital lines
    #[serde(default)]
    pub optical_switch: Option<OpticalSwitchConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Instrument name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Signal generator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Number of output channels per movement
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Sample rate used when compiling scores
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
    /// Galvo staircase step height, used when stepping is enabled
    #[serde(default = "default_step_height")]
    pub galvo_step_height: f64,
}

/// Playback timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Fixed part of the playback timeout, one second per snapshot is added
    #[serde(default = "default_base_timeout")]
    pub base_timeout_secs: u64,
    /// How long a camera waits for a free stack before failing
    #[serde(default = "default_stack_timeout")]
    pub stack_timeout_ms: u64,
    /// Default exposure in seconds
    #[serde(default = "default_exposure")]
    pub default_exposure_s: f64,
}

impl PlaybackConfig {
    /// Fixed part of the playback timeout.
    #[must_use]
    pub fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.base_timeout_secs)
    }

    /// Camera stack wait.
    #[must_use]
    pub fn stack_timeout(&self) -> Duration {
        Duration::from_millis(self.stack_timeout_ms)
    }
}

/// Output channel indices of one light sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSheetChannels {
    /// Illumination focus (X)
    pub x: usize,
    /// Galvo Y
    pub y: usize,
    /// Galvo Z
    pub z: usize,
    /// Beta angle
    pub beta: usize,
    /// Width (iris)
    pub width: usize,
    /// Laser analog modulation
    pub laser_analog: usize,
    /// Trigger out line
    pub trigger: usize,
    /// Laser digital on/off lines, one per laser
    pub laser_digital: Vec<usize>,
}

impl Default for LightSheetChannels {
    fn default() -> Self {
        Self {
            x: 2,
            y: 3,
            z: 4,
            beta: 5,
            width: 6,
            laser_analog: 7,
            trigger: 15,
            laser_digital: vec![8],
        }
    }
}

/// Bounds of every light-sheet DOF
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSheetBounds {
    /// X bounds
    pub x: ChannelBounds,
    /// Y bounds
    pub y: ChannelBounds,
    /// Z bounds
    pub z: ChannelBounds,
    /// Width bounds
    pub width: ChannelBounds,
    /// Height bounds
    pub height: ChannelBounds,
    /// Alpha bounds (degrees)
    pub alpha: ChannelBounds,
    /// Beta bounds (degrees)
    pub beta: ChannelBounds,
    /// Power bounds (relative)
    pub power: ChannelBounds,
}

impl Default for LightSheetBounds {
    fn default() -> Self {
        Self {
            x: ChannelBounds::new(-100.0, 100.0),
            y: ChannelBounds::new(-100.0, 100.0),
            z: ChannelBounds::new(-100.0, 100.0),
            width: ChannelBounds::new(0.0, 1.0),
            height: ChannelBounds::new(0.0, 1.0),
            alpha: ChannelBounds::new(-45.0, 45.0),
            beta: ChannelBounds::new(-45.0, 45.0),
            power: ChannelBounds::new(0.0, 1.0),
        }
    }
}

/// Value-to-voltage functions of a light sheet
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LightSheetFunctions {
    /// X function
    pub x: AffineFunction,
    /// Y function
    pub y: AffineFunction,
    /// Z function
    pub z: AffineFunction,
    /// Width function
    pub width: AffineFunction,
    /// Height function
    pub height: AffineFunction,
    /// Alpha function
    pub alpha: AffineFunction,
    /// Beta function
    pub beta: AffineFunction,
    /// Power function
    pub power: AffineFunction,
    /// Power correction factor as a function of width
    pub width_power: AffineFunction,
    /// Power correction factor as a function of height
    pub height_power: AffineFunction,
}

/// One light sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSheetConfig {
    /// Device name
    pub name: String,
    /// Galvo overscan factor (>= 1)
    #[serde(default = "default_overscan")]
    pub overscan: f64,
    /// Scale power with width and height
    #[serde(default)]
    pub adapt_power_to_width_height: bool,
    /// Output channel indices
    #[serde(default)]
    pub channels: LightSheetChannels,
    /// DOF bounds
    #[serde(default)]
    pub bounds: LightSheetBounds,
    /// DOF functions
    #[serde(default)]
    pub functions: LightSheetFunctions,
}

impl LightSheetConfig {
    /// Default light sheet with the given name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overscan: default_overscan(),
            adapt_power_to_width_height: false,
            channels: LightSheetChannels::default(),
            bounds: LightSheetBounds::default(),
            functions: LightSheetFunctions::default(),
        }
    }

    /// Number of lasers (digital lines) of this light sheet.
    #[must_use]
    pub fn lasers(&self) -> usize {
        self.channels.laser_digital.len()
    }
}

/// One detection arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionArmConfig {
    /// Device name
    pub name: String,
    /// Detection focus channel
    pub z_index: usize,
    /// Detection focus bounds
    #[serde(default = "default_detection_bounds")]
    pub z_bounds: ChannelBounds,
    /// Detection focus function
    #[serde(default)]
    pub z_function: AffineFunction,
}

/// One camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device name
    pub name: String,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Pixel type
    #[serde(default = "default_pixel_type")]
    pub pixel_type: PixelType,
    /// Line readout time
    #[serde(default = "default_readout")]
    pub readout_us_per_line: f64,
    /// Pixel size in sample space
    #[serde(default = "default_pixel_size")]
    pub pixel_size_um: f64,
    /// Digital channel carrying this camera's trigger
    pub trigger_index: usize,
}

/// Optical switch: one digital line per light sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpticalSwitchConfig {
    /// Device name
    pub name: String,
    /// Channel of light sheet `i` is `first_index + i`
    pub first_index: usize,
}

fn default_channels() -> usize {
    32
}

fn default_sample_rate() -> f64 {
    100_000.0
}

fn default_step_height() -> f64 {
    0.0
}

fn default_base_timeout() -> u64 {
    10
}

fn default_stack_timeout() -> u64 {
    1000
}

fn default_exposure() -> f64 {
    0.010
}

fn default_overscan() -> f64 {
    1.2
}

fn default_detection_bounds() -> ChannelBounds {
    ChannelBounds::new(-100.0, 100.0)
}

fn default_pixel_type() -> PixelType {
    PixelType::U16
}

fn default_readout() -> f64 {
    3.9
}

fn default_pixel_size() -> f64 {
    0.406
}

impl Default for MicroscopeConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig {
                name: "lightsheet".to_string(),
                log_level: "info".to_string(),
            },
            signal: SignalConfig {
                channels: default_channels(),
                sample_rate_hz: default_sample_rate(),
                galvo_step_height: default_step_height(),
            },
            playback: PlaybackConfig {
                base_timeout_secs: default_base_timeout(),
                stack_timeout_ms: default_stack_timeout(),
                default_exposure_s: default_exposure(),
            },
            recycler: RecyclerLimits::default(),
            lightsheets: vec![LightSheetConfig::named("I0")],
            detection_arms: vec![DetectionArmConfig {
                name: "D0".to_string(),
                z_index: 0,
                z_bounds: default_detection_bounds(),
                z_function: AffineFunction::identity(),
            }],
            cameras: vec![CameraConfig {
                name: "C0".to_string(),
                width: 512,
                height: 512,
                pixel_type: default_pixel_type(),
                readout_us_per_line: default_readout(),
                pixel_size_um: default_pixel_size(),
                trigger_index: 12,
            }],
            optical_switch: None,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl MicroscopeConfig {
    /// Load configuration from a TOML file layered over the defaults, then
    /// apply `LSM_` environment overrides and validate.
    ///
    /// A missing file is not an error: defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::figment(path).extract_config()
    }

    /// Defaults plus environment overrides, validated.
    pub fn load_defaults() -> Result<Self, ConfigError> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("LSM_").split("__"))
            .extract_config()
    }

    /// The provider stack used by [`MicroscopeConfig::load_from`].
    #[must_use]
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LSM_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Channel indices fit the channel count and do not collide
    /// - Bounds are ordered, overscan >= 1
    /// - At least one light sheet, detection arm and camera; one camera per arm
    /// - Recycler limits are consistent
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.signal.channels == 0 {
            return Err(ConfigError::Validation(
                "signal.channels must be greater than 0".into(),
            ));
        }
        if !(self.signal.sample_rate_hz > 0.0) {
            return Err(ConfigError::Validation(format!(
                "Invalid sample_rate_hz {}. Must be positive",
                self.signal.sample_rate_hz
            )));
        }
        if !(self.playback.default_exposure_s > 0.0) {
            return Err(ConfigError::Validation(format!(
                "Invalid default_exposure_s {}. Must be positive",
                self.playback.default_exposure_s
            )));
        }

        self.recycler
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.lightsheets.is_empty() || self.detection_arms.is_empty() || self.cameras.is_empty() {
            return Err(ConfigError::Validation(
                "At least one light sheet, detection arm and camera is required".into(),
            ));
        }
        if self.cameras.len() != self.detection_arms.len() {
            return Err(ConfigError::Validation(format!(
                "{} cameras for {} detection arms. Each arm needs exactly one camera",
                self.cameras.len(),
                self.detection_arms.len()
            )));
        }

        for lightsheet in &self.lightsheets {
            self.validate_lightsheet(lightsheet)?;
        }

        for arm in &self.detection_arms {
            if !arm.z_bounds.is_valid() {
                return Err(ConfigError::Validation(format!(
                    "Detection arm '{}' has inverted z bounds",
                    arm.name
                )));
            }
        }

        for camera in &self.cameras {
            if camera.width == 0 || camera.height == 0 {
                return Err(ConfigError::Validation(format!(
                    "Camera '{}' has an empty image size",
                    camera.name
                )));
            }
            if !(camera.pixel_size_um > 0.0) {
                return Err(ConfigError::Validation(format!(
                    "Camera '{}' pixel size must be positive",
                    camera.name
                )));
            }
            if !(camera.readout_us_per_line >= 0.0) {
                return Err(ConfigError::Validation(format!(
                    "Camera '{}' has a negative readout time",
                    camera.name
                )));
            }
        }

        self.validate_channel_map()
    }

    fn validate_lightsheet(&self, lightsheet: &LightSheetConfig) -> Result<(), ConfigError> {
        if !(lightsheet.overscan >= 1.0) {
            return Err(ConfigError::Validation(format!(
                "Light sheet '{}' overscan {} must be >= 1",
                lightsheet.name, lightsheet.overscan
            )));
        }
        let b = &lightsheet.bounds;
        let all = [
            ("x", b.x),
            ("y", b.y),
            ("z", b.z),
            ("width", b.width),
            ("height", b.height),
            ("alpha", b.alpha),
            ("beta", b.beta),
            ("power", b.power),
        ];
        if let Some((dof, _)) = all.iter().find(|(_, bounds)| !bounds.is_valid()) {
            return Err(ConfigError::Validation(format!(
                "Light sheet '{}' has inverted {dof} bounds",
                lightsheet.name
            )));
        }
        Ok(())
    }

    /// Every output channel is driven by exactly one DOF.
    ///
    /// Light sheets may share analog lines (a single galvo pair fed through an
    /// optical switch), so collisions are only checked between device kinds.
    fn validate_channel_map(&self) -> Result<(), ConfigError> {
        let capacity = self.signal.channels;
        let check = |owner: &str, index: usize| {
            if index >= capacity {
                Err(ConfigError::Validation(format!(
                    "{owner} uses channel {index} but only {capacity} channels are configured"
                )))
            } else {
                Ok(())
            }
        };

        let mut lightsheet_channels = HashSet::new();
        for ls in &self.lightsheets {
            let c = &ls.channels;
            for index in [c.x, c.y, c.z, c.beta, c.width, c.laser_analog, c.trigger]
                .into_iter()
                .chain(c.laser_digital.iter().copied())
            {
                check(&ls.name, index)?;
                lightsheet_channels.insert(index);
            }
        }

        let mut others = HashSet::new();
        let mut claim = |owner: &str, index: usize| -> Result<(), ConfigError> {
            check(owner, index)?;
            if lightsheet_channels.contains(&index) || !others.insert(index) {
                return Err(ConfigError::Validation(format!(
                    "{owner} channel {index} is already in use"
                )));
            }
            Ok(())
        };

        for arm in &self.detection_arms {
            claim(&arm.name, arm.z_index)?;
        }
        for camera in &self.cameras {
            claim(&camera.name, camera.trigger_index)?;
        }
        if let Some(switch) = &self.optical_switch {
            for i in 0..self.lightsheets.len() {
                claim(&switch.name, switch.first_index + i)?;
            }
        }
        Ok(())
    }

    /// Total number of lasers across light sheets.
    #[must_use]
    pub fn total_lasers(&self) -> usize {
        self.lightsheets.iter().map(LightSheetConfig::lasers).sum()
    }
}

trait ExtractConfig {
    fn extract_config(self) -> Result<MicroscopeConfig, ConfigError>;
}

impl ExtractConfig for Figment {
    fn extract_config(self) -> Result<MicroscopeConfig, ConfigError> {
        let config: MicroscopeConfig = self.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = MicroscopeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signal.channels, 32);
        assert_eq!(config.recycler, RecyclerLimits::new(60, 60, 60));
        assert_eq!(config.playback.base_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = MicroscopeConfig::default();
        config.application.log_level = "loud".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_channel_out_of_capacity() {
        let mut config = MicroscopeConfig::default();
        config.cameras[0].trigger_index = 40;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("only 32 channels"));
    }

    #[test]
    fn test_channel_collision() {
        let mut config = MicroscopeConfig::default();
        config.detection_arms[0].z_index = 3; // galvo Y
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn test_overscan_below_one_rejected() {
        let mut config = MicroscopeConfig::default();
        config.lightsheets[0].overscan = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camera_arm_mismatch_rejected() {
        let mut config = MicroscopeConfig::default();
        config.cameras.push(CameraConfig {
            name: "C1".into(),
            width: 64,
            height: 64,
            pixel_type: PixelType::U16,
            readout_us_per_line: 1.0,
            pixel_size_um: 0.5,
            trigger_index: 13,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Each arm needs exactly one camera"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "bench"
log_level = "debug"

[recycler]
min_available = 2
max_available = 4
max_live = 4

[[cameras]]
name = "C0"
width = 128
height = 64
trigger_index = 12
"#
        )
        .unwrap();

        let config = MicroscopeConfig::figment(file.path())
            .extract::<MicroscopeConfig>()
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.recycler.max_live, 4);
        assert_eq!(config.cameras[0].width, 128);
        assert_eq!(config.cameras[0].pixel_type, PixelType::U16);
        // Untouched sections keep their defaults
        assert_eq!(config.lightsheets.len(), 1);
        assert_eq!(config.lightsheets[0].channels.y, 3);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = MicroscopeConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: MicroscopeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
