use std::fmt;

use lsm_core::config::LightSheetConfig;
use lsm_core::{ChannelBounds, Observable};
use serde::{Deserialize, Serialize};

/// Numeric DOF of a light sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightSheetDof {
    /// Illumination focus.
    X,
    /// Vertical position.
    Y,
    /// Axial position.
    Z,
    /// Sheet width (iris).
    Width,
    /// Sheet height (galvo amplitude).
    Height,
    /// In-plane rotation, degrees.
    Alpha,
    /// Out-of-plane rotation, degrees.
    Beta,
    /// Laser power, relative.
    Power,
}

impl LightSheetDof {
    /// Every DOF, in setter order.
    pub const ALL: [Self; 8] = [
        Self::X,
        Self::Y,
        Self::Z,
        Self::Width,
        Self::Height,
        Self::Alpha,
        Self::Beta,
        Self::Power,
    ];

    /// Short name used in DOF paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
            Self::Width => "width",
            Self::Height => "height",
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Power => "power",
        }
    }

    /// Configured bounds of this DOF.
    #[must_use]
    pub fn bounds(self, config: &LightSheetConfig) -> ChannelBounds {
        let b = &config.bounds;
        match self {
            Self::X => b.x,
            Self::Y => b.y,
            Self::Z => b.z,
            Self::Width => b.width,
            Self::Height => b.height,
            Self::Alpha => b.alpha,
            Self::Beta => b.beta,
            Self::Power => b.power,
        }
    }

    fn initial_value(self, bounds: ChannelBounds) -> f64 {
        let preferred = match self {
            Self::Height | Self::Power => 1.0,
            _ => 0.0,
        };
        bounds.clamp(preferred)
    }
}

impl fmt::Display for LightSheetDof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A light sheet and its live DOF values.
#[derive(Debug, Clone)]
pub struct LightSheet {
    index: usize,
    config: LightSheetConfig,
    dofs: Vec<(LightSheetDof, Observable<f64>)>,
    on: Observable<bool>,
    lasers: Vec<Observable<bool>>,
}

impl LightSheet {
    /// Create from configuration. Light sheet 0 starts switched on.
    #[must_use]
    pub fn new(index: usize, config: LightSheetConfig) -> Self {
        let dofs = LightSheetDof::ALL
            .iter()
            .map(|&dof| {
                let bounds = dof.bounds(&config);
                let observable =
                    Observable::new(format!("{}.{}", config.name, dof), dof.initial_value(bounds))
                        .with_range(bounds.min, bounds.max);
                (dof, observable)
            })
            .collect();
        let lasers = (0..config.lasers())
            .map(|i| Observable::new(format!("{}.laser{i}", config.name), true))
            .collect();
        Self {
            index,
            on: Observable::new(format!("{}.on", config.name), index == 0),
            config,
            dofs,
            lasers,
        }
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
    pub fn config(&self) -> &LightSheetConfig {
        &self.config
    }

    /// Live value of `dof`.
    #[must_use]
    pub fn dof(&self, dof: LightSheetDof) -> &Observable<f64> {
        // DOFs are created from `ALL` in order.
        &self.dofs[dof as usize].1
    }

    /// Bounds of `dof`.
    #[must_use]
    pub fn bounds(&self, dof: LightSheetDof) -> ChannelBounds {
        dof.bounds(&self.config)
    }

    /// On/off flag.
    #[must_use]
    pub fn on(&self) -> &Observable<bool> {
        &self.on
    }

    /// Laser on/off flags.
    #[must_use]
    pub fn lasers(&self) -> &[Observable<bool>] {
        &self.lasers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dof_lookup_matches_order() {
        let ls = LightSheet::new(0, LightSheetConfig::named("I0"));
        for dof in LightSheetDof::ALL {
            assert_eq!(ls.dof(dof).name(), format!("I0.{dof}"));
        }
    }

    #[test]
    fn test_initial_values_within_bounds() {
        let ls = LightSheet::new(1, LightSheetConfig::named("I1"));
        assert_eq!(ls.dof(LightSheetDof::Height).get(), 1.0);
        assert_eq!(ls.dof(LightSheetDof::Z).get(), 0.0);
        assert!(!ls.on().get());
        assert_eq!(ls.lasers().len(), 1);
    }

    #[test]
    fn test_dof_range_enforced() {
        let ls = LightSheet::new(0, LightSheetConfig::named("I0"));
        assert!(ls.dof(LightSheetDof::Power).set(2.0).is_err());
        assert!(ls.dof(LightSheetDof::Power).set(0.5).is_ok());
    }
}
