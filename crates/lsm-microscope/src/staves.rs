//! Translation of device settings into staves.
//!
//! Every snapshot is played as two movements: a before-exposure movement that
//! covers the camera readout (galvos fly back, cameras are triggered) and an
//! exposure movement during which the light sheet is swept and the lasers are
//! gated on. The functions here rewrite the staves of both template
//! movements in place from a [`MicroscopeState`].

use std::time::Duration;

use lsm_core::config::{CameraConfig, DetectionArmConfig, LightSheetConfig, OpticalSwitchConfig};
use lsm_core::LsmResult;
use lsm_signal::{Movement, Ramp, Stave, StaveKind};
use serde::{Deserialize, Serialize};

use crate::registry::DeviceRegistry;
use crate::state::{CameraState, DetectionState, LightSheetState, MicroscopeState};

/// Exponent of the galvo fly-back ramp.
const FLY_BACK_EXPONENT: f64 = 0.2;

/// Durations of the two movements of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureTiming {
    /// Camera readout, spent before the exposure.
    pub before_exposure: Duration,
    /// Exposure.
    pub exposure: Duration,
}

impl ExposureTiming {
    /// Timing for `exposure_s` with the slowest camera's half-frame readout.
    #[must_use]
    pub fn new(cameras: &[CameraConfig], exposure_s: f64) -> Self {
        let readout_us = cameras
            .iter()
            .map(|c| c.readout_us_per_line * f64::from(c.height) / 2.0)
            .fold(0.0_f64, f64::max);
        Self {
            before_exposure: micros(readout_us),
            exposure: micros(exposure_s * 1e6),
        }
    }

    /// Duration of one snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Duration {
        self.before_exposure + self.exposure
    }
}

fn micros(us: f64) -> Duration {
    // NaN and negative durations collapse to zero.
    Duration::from_micros(us.max(0.0).round() as u64)
}

/// Install `kind` at `index`, reusing the resident stave of the same shape.
fn write(movement: &mut Movement, index: usize, name: &str, kind: StaveKind, enabled: bool) -> LsmResult<()> {
    let stave = movement.ensure_set_stave(index, Stave::new(name, kind.clone()))?;
    *stave.kind_mut() = kind;
    stave.set_enabled(enabled);
    Ok(())
}

fn constant(movement: &mut Movement, index: usize, name: &str, value: f64) -> LsmResult<()> {
    write(movement, index, name, StaveKind::Constant { value }, true)
}

/// Rewrite the staves of every device for one snapshot and set both
/// movement durations.
///
/// Light sheets commonly share their analog lines, so only light sheets that
/// are on write their staves. With every light sheet off, light sheet 0
/// writes its staves with the lasers gated off.
pub fn update_movements(
    registry: &DeviceRegistry,
    state: &MicroscopeState,
    before: &mut Movement,
    exposure: &mut Movement,
) -> LsmResult<ExposureTiming> {
    let config = registry.config();
    let timing = ExposureTiming::new(&config.cameras, state.exposure_s);
    before.set_duration(timing.before_exposure);
    exposure.set_duration(timing.exposure);

    let step_height = config.signal.galvo_step_height;
    let active = state.active_lightsheets();
    if active.is_empty() {
        if let (Some(ls), Some(ls_config)) = (state.lightsheets.first(), config.lightsheets.first()) {
            let mut dark = ls.clone();
            dark.lasers.iter_mut().for_each(|l| *l = false);
            lightsheet_staves(ls_config, &dark, timing, step_height, before, exposure)?;
        }
    }
    for index in active {
        if let (Some(ls), Some(ls_config)) = (state.lightsheets.get(index), config.lightsheets.get(index)) {
            lightsheet_staves(ls_config, ls, timing, step_height, before, exposure)?;
        }
    }

    for (arm, arm_state) in config.detection_arms.iter().zip(&state.detection) {
        detection_staves(arm, arm_state, before, exposure)?;
    }
    for (camera, camera_state) in config.cameras.iter().zip(&state.cameras) {
        camera_staves(camera, camera_state, before, exposure)?;
    }
    if let Some(switch) = &config.optical_switch {
        optical_switch_staves(switch, state, before, exposure)?;
    }
    Ok(timing)
}

/// Galvo sweep, focus, width, beta, laser power and laser gating of one
/// light sheet.
pub fn lightsheet_staves(
    config: &LightSheetConfig,
    state: &LightSheetState,
    timing: ExposureTiming,
    step_height: f64,
    before: &mut Movement,
    exposure: &mut Movement,
) -> LsmResult<()> {
    let f = &config.functions;
    let ch = &config.channels;
    let overscan = config.overscan;

    let alpha = f.alpha.value(state.alpha).to_radians();
    let (sin, cos) = alpha.sin_cos();
    let rotate = |y: f64, z: f64| (y * cos - z * sin, y * sin + z * cos);

    let (y_offset, z_offset) = rotate(state.y, state.z);
    let height = f.height.value(state.height) * overscan;
    let (y_amplitude, z_amplitude) = rotate(height, 0.0);

    let y_low = f.y.value(y_offset - y_amplitude);
    let y_high = f.y.value(y_offset + y_amplitude);
    let z_low = f.z.value(z_offset - z_amplitude);
    let z_high = f.z.value(z_offset + z_amplitude);

    let stepping = step_height > 0.0;
    let fly_back = |start_value: f64, stop_value: f64| Ramp {
        start_value,
        stop_value,
        exponent: FLY_BACK_EXPONENT,
        stepping,
        step_height,
        ..Ramp::default()
    };
    let sweep = |start_value: f64, stop_value: f64| Ramp {
        start_value,
        stop_value,
        outside_value: stop_value,
        no_jump: true,
        stepping,
        step_height,
        ..Ramp::default()
    };

    write(before, ch.y, "lightsheet.y.be", StaveKind::RampStepping(fly_back(y_high, y_low)), true)?;
    write(before, ch.z, "lightsheet.z.be", StaveKind::RampStepping(fly_back(z_high, z_low)), true)?;
    write(exposure, ch.y, "lightsheet.y.e", StaveKind::RampStepping(sweep(y_low, y_high)), true)?;
    write(exposure, ch.z, "lightsheet.z.e", StaveKind::RampStepping(sweep(z_low, z_high)), true)?;

    let x = f.x.value(state.x);
    let beta = f.beta.value(state.beta);
    let width = f.width.value(state.width);
    for (movement, phase) in [(&mut *before, "be"), (&mut *exposure, "e")] {
        constant(movement, ch.x, &format!("lightsheet.x.{phase}"), x)?;
        constant(movement, ch.beta, &format!("lightsheet.b.{phase}"), beta)?;
        constant(movement, ch.width, &format!("lightsheet.w.{phase}"), width)?;
    }

    let exposure_us = timing.exposure.as_secs_f64() * 1e6;
    let margin_us = (overscan - 1.0) / (2.0 * overscan) * exposure_us;
    let margin = if exposure_us > 0.0 { margin_us / exposure_us } else { 0.0 };

    for (laser, &line) in ch.laser_digital.iter().enumerate() {
        let enabled = state.on && state.lasers.get(laser).copied().unwrap_or(false);
        constant(before, line, "laser.digital.be", 0.0)?;
        write(
            exposure,
            line,
            "trigger.out",
            StaveKind::Interval {
                start: margin,
                stop: 1.0 - margin,
                inside: 1.0,
                outside: 0.0,
            },
            enabled,
        )?;
    }

    let mut power = f.power.value(state.power);
    if config.adapt_power_to_width_height {
        power *= f.width_power.value(width) * f.height_power.value(height / overscan);
    }
    constant(before, ch.laser_analog, "laser.analog.be", 0.0)?;
    constant(exposure, ch.laser_analog, "laser.analog.e", power)?;

    write(
        before,
        ch.trigger,
        "trigger.out.be",
        StaveKind::Edge {
            edge: 1.0,
            before: 1.0,
            after: 0.0,
        },
        true,
    )?;
    write(
        exposure,
        ch.trigger,
        "trigger.out.e",
        StaveKind::Edge {
            edge: 1.0,
            before: 0.0,
            after: 0.0,
        },
        true,
    )
}

/// Detection focus, held through both movements.
pub fn detection_staves(
    config: &DetectionArmConfig,
    state: &DetectionState,
    before: &mut Movement,
    exposure: &mut Movement,
) -> LsmResult<()> {
    let z = config.z_function.value(state.z);
    constant(before, config.z_index, "detection.z.be", z)?;
    constant(exposure, config.z_index, "detection.z.e", z)
}

/// Camera trigger: high through the readout movement when the camera keeps
/// its image, low during exposure.
pub fn camera_staves(
    config: &CameraConfig,
    state: &CameraState,
    before: &mut Movement,
    exposure: &mut Movement,
) -> LsmResult<()> {
    write(
        before,
        config.trigger_index,
        "camera.trigger.be",
        StaveKind::Edge {
            edge: 1.0,
            before: 1.0,
            after: 0.0,
        },
        state.acquire,
    )?;
    write(
        exposure,
        config.trigger_index,
        "camera.trigger.e",
        StaveKind::Edge {
            edge: 1.0,
            before: 0.0,
            after: 0.0,
        },
        true,
    )
}

/// One digital line per light sheet, high while it is on.
pub fn optical_switch_staves(
    config: &OpticalSwitchConfig,
    state: &MicroscopeState,
    before: &mut Movement,
    exposure: &mut Movement,
) -> LsmResult<()> {
    for (i, ls) in state.lightsheets.iter().enumerate() {
        let value = if ls.on { 1.0 } else { 0.0 };
        let line = config.first_index + i;
        constant(before, line, "switch.be", value)?;
        constant(exposure, line, "switch.e", value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsm_core::{AffineFunction, MicroscopeConfig};
    use lsm_signal::SimulationMode;

    const EPS: f64 = 1e-9;

    fn movements() -> (Movement, Movement) {
        (
            Movement::new("BeforeExposure", Duration::ZERO, 32),
            Movement::new("Exposure", Duration::ZERO, 32),
        )
    }

    fn state(y: f64, z: f64, height: f64, alpha: f64) -> LightSheetState {
        LightSheetState {
            x: 0.25,
            y,
            z,
            width: 0.5,
            height,
            alpha,
            beta: 0.0,
            power: 0.8,
            on: true,
            lasers: vec![true],
        }
    }

    fn timing() -> ExposureTiming {
        ExposureTiming {
            before_exposure: Duration::from_micros(1000),
            exposure: Duration::from_micros(10_000),
        }
    }

    #[test]
    fn test_timing_uses_slowest_camera() {
        let config = MicroscopeConfig::default();
        let timing = ExposureTiming::new(&config.cameras, 0.01);
        // 3.9 us/line * 512 lines / 2
        assert_eq!(timing.before_exposure, Duration::from_micros(998));
        assert_eq!(timing.exposure, Duration::from_millis(10));
        assert_eq!(timing.snapshot(), Duration::from_micros(10_998));
    }

    #[test]
    fn test_galvo_sweep_without_rotation() {
        let config = LightSheetConfig::named("I0");
        let (mut before, mut exposure) = movements();
        lightsheet_staves(&config, &state(0.0, 10.0, 0.5, 0.0), timing(), 0.0, &mut before, &mut exposure).unwrap();

        let ch = &config.channels;
        // height 0.5 * overscan 1.2
        assert!((exposure.value_at(ch.y, 0.0) + 0.6).abs() < EPS);
        assert!((exposure.value_at(ch.y, 1.0) - 0.6).abs() < EPS);
        assert!((before.value_at(ch.y, 0.0) - 0.6).abs() < EPS);
        assert!((before.value_at(ch.y, 1.0) + 0.6).abs() < EPS);
        assert!((exposure.value_at(ch.z, 0.3) - 10.0).abs() < EPS);
        assert!((before.value_at(ch.x, 0.5) - 0.25).abs() < EPS);
        assert!((exposure.value_at(ch.width, 0.5) - 0.5).abs() < EPS);
        assert_eq!(
            before.stave(ch.y).and_then(Stave::as_ramp).map(|r| r.exponent),
            Some(FLY_BACK_EXPONENT)
        );
    }

    #[test]
    fn test_alpha_rotates_sweep_into_z() {
        let config = LightSheetConfig::named("I0");
        let (mut before, mut exposure) = movements();
        lightsheet_staves(&config, &state(0.0, 0.0, 1.0, 90.0 / 2.0), timing(), 0.0, &mut before, &mut exposure)
            .unwrap();
        let amplitude = 1.2 * std::f64::consts::FRAC_1_SQRT_2;
        let ch = &config.channels;
        assert!((exposure.value_at(ch.y, 1.0) - amplitude).abs() < 1e-9);
        assert!((exposure.value_at(ch.z, 1.0) - amplitude).abs() < 1e-9);
    }

    #[test]
    fn test_laser_gate_respects_overscan_margin() {
        let config = LightSheetConfig::named("I0");
        let (mut before, mut exposure) = movements();
        lightsheet_staves(&config, &state(0.0, 0.0, 1.0, 0.0), timing(), 0.0, &mut before, &mut exposure).unwrap();

        let line = config.channels.laser_digital[0];
        let margin = 0.2 / 2.4;
        assert_eq!(exposure.value_at(line, margin - 0.01), 0.0);
        assert_eq!(exposure.value_at(line, 0.5), 1.0);
        assert_eq!(exposure.value_at(line, 1.0 - margin + 0.01), 0.0);
        assert_eq!(before.value_at(line, 0.5), 0.0);

        let analog = config.channels.laser_analog;
        assert_eq!(before.value_at(analog, 0.5), 0.0);
        assert!((exposure.value_at(analog, 0.5) - 0.8).abs() < EPS);
    }

    #[test]
    fn test_laser_off_disables_gate() {
        let config = LightSheetConfig::named("I0");
        let (mut before, mut exposure) = movements();
        let mut s = state(0.0, 0.0, 1.0, 0.0);
        s.lasers[0] = false;
        lightsheet_staves(&config, &s, timing(), 0.0, &mut before, &mut exposure).unwrap();
        assert_eq!(exposure.value_at(config.channels.laser_digital[0], 0.5), 0.0);
    }

    #[test]
    fn test_power_adapts_to_width_and_height() {
        let mut config = LightSheetConfig::named("I0");
        config.adapt_power_to_width_height = true;
        config.functions.width_power = AffineFunction::new(2.0, 0.0);
        config.functions.height_power = AffineFunction::new(0.0, 0.5);
        let (mut before, mut exposure) = movements();
        lightsheet_staves(&config, &state(0.0, 0.0, 1.0, 0.0), timing(), 0.0, &mut before, &mut exposure).unwrap();
        // 0.8 * (2 * 0.5) * 0.5
        assert!((exposure.value_at(config.channels.laser_analog, 0.5) - 0.4).abs() < EPS);
    }

    #[test]
    fn test_update_keeps_stave_identity_and_rewrites_values() {
        let config = LightSheetConfig::named("I0");
        let (mut before, mut exposure) = movements();
        lightsheet_staves(&config, &state(0.0, 1.0, 1.0, 0.0), timing(), 0.0, &mut before, &mut exposure).unwrap();
        let count = exposure.stave_count();
        lightsheet_staves(&config, &state(0.0, 2.0, 1.0, 0.0), timing(), 0.0, &mut before, &mut exposure).unwrap();
        assert_eq!(exposure.stave_count(), count);
        assert!((exposure.value_at(config.channels.z, 0.5) - 2.0).abs() < EPS);
    }

    #[test]
    fn test_full_update_triggers_only_acquiring_cameras() {
        let registry =
            DeviceRegistry::simulated(MicroscopeConfig::default(), SimulationMode::Responsive, 0.0).unwrap();
        let mut state = MicroscopeState::from_devices(&registry, 0.005);
        let (mut before, mut exposure) = movements();
        let trigger = registry.config().cameras[0].trigger_index;

        let timing = update_movements(&registry, &state, &mut before, &mut exposure).unwrap();
        assert_eq!(exposure.duration(), Duration::from_millis(5));
        assert_eq!(before.duration(), timing.before_exposure);
        assert_eq!(before.value_at(trigger, 0.5), 1.0);
        assert_eq!(exposure.value_at(trigger, 0.5), 0.0);

        state.cameras[0].acquire = false;
        update_movements(&registry, &state, &mut before, &mut exposure).unwrap();
        assert_eq!(before.value_at(trigger, 0.5), 0.0);
    }

    #[test]
    fn test_dark_snapshot_gates_lasers_off() {
        let registry =
            DeviceRegistry::simulated(MicroscopeConfig::default(), SimulationMode::Responsive, 0.0).unwrap();
        let mut state = MicroscopeState::from_devices(&registry, 0.005);
        state.lightsheets[0].on = false;
        let (mut before, mut exposure) = movements();
        update_movements(&registry, &state, &mut before, &mut exposure).unwrap();
        let line = registry.config().lightsheets[0].channels.laser_digital[0];
        assert_eq!(exposure.value_at(line, 0.5), 0.0);
        assert!(exposure.stave(registry.config().lightsheets[0].channels.y).is_some());
    }

    #[test]
    fn test_optical_switch_lines() {
        let mut config = MicroscopeConfig::default();
        config.lightsheets.push(LightSheetConfig::named("I1"));
        config.optical_switch = Some(OpticalSwitchConfig {
            name: "switch".into(),
            first_index: 20,
        });
        let registry = DeviceRegistry::simulated(config, SimulationMode::Responsive, 0.0).unwrap();
        let mut state = MicroscopeState::from_devices(&registry, 0.005);
        state.lightsheets[1].on = true;
        state.lightsheets[0].on = false;
        let (mut before, mut exposure) = movements();
        update_movements(&registry, &state, &mut before, &mut exposure).unwrap();
        assert_eq!(exposure.value_at(20, 0.5), 0.0);
        assert_eq!(exposure.value_at(21, 0.5), 1.0);
        assert_eq!(before.value_at(21, 0.5), 1.0);
    }

    #[test]
    fn test_detection_focus_function() {
        let arm = DetectionArmConfig {
            name: "D0".into(),
            z_index: 0,
            z_bounds: lsm_core::ChannelBounds::new(-100.0, 100.0),
            z_function: AffineFunction::new(0.01, 0.5),
        };
        let (mut before, mut exposure) = movements();
        detection_staves(&arm, &DetectionState { z: 50.0 }, &mut before, &mut exposure).unwrap();
        assert!((before.value_at(0, 0.0) - 1.0).abs() < EPS);
        assert!((exposure.value_at(0, 1.0) - 1.0).abs() < EPS);
    }
}
