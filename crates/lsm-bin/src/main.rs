//! `lsm` - run acquisitions on a simulated light-sheet microscope.
//!
//! # Commands
//!
//! - `lsm acquire` - record one z-stack and report the stacks received
//! - `lsm live` - run the interactive 2D loop for a while
//! - `lsm calibrate` - sweep a light-sheet DOF and print the best values
//!
//! Logging honours `RUST_LOG` and falls back to `application.log_level`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lsm_core::{CancelFlag, MicroscopeConfig};
use lsm_microscope::{
    AcquisitionState, AcquisitionType, CalibrationSweep, DropSink, InteractiveAcquisition, LightSheetDof,
    LightSheetMicroscope, PlaneMetric, SweepConfig,
};
use lsm_pool::StackLease;
use lsm_signal::SimulationMode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Simulated light-sheet microscope runner
#[derive(Parser)]
#[command(name = "lsm")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); `LSM_` environment variables override it
    #[arg(short, long, default_value = "config/microscope.toml")]
    config: PathBuf,

    /// Real-time factor of the simulated generator (0 plays instantly)
    #[arg(long, default_value_t = 1.0)]
    time_scale: f64,

    /// Simulated hardware behaviour
    #[arg(long, value_enum, default_value_t = Hardware::Responsive)]
    hardware: Hardware,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record one z-stack
    Acquire {
        /// First plane (µm)
        #[arg(long, default_value_t = -10.0)]
        start_z: f64,
        /// Last plane (µm)
        #[arg(long, default_value_t = 10.0)]
        stop_z: f64,
        /// Number of planes
        #[arg(long, default_value_t = 21)]
        planes: usize,
    },
    /// Run the interactive 2D loop
    Live {
        /// How long to run (seconds); Ctrl-C stops earlier
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Sweep a light-sheet DOF on every light sheet
    Calibrate {
        /// Swept DOF
        #[arg(long, value_enum, default_value_t = Dof::Width)]
        dof: Dof,
        /// Sweep intervals
        #[arg(long, default_value_t = 3)]
        samples: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Hardware {
    Responsive,
    Unresponsive,
    Failing,
}

impl From<Hardware> for SimulationMode {
    fn from(hardware: Hardware) -> Self {
        match hardware {
            Hardware::Responsive => SimulationMode::Responsive,
            Hardware::Unresponsive => SimulationMode::Unresponsive,
            Hardware::Failing => SimulationMode::Failing,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Dof {
    X,
    Y,
    Z,
    Width,
    Height,
    Alpha,
    Beta,
    Power,
}

impl From<Dof> for LightSheetDof {
    fn from(dof: Dof) -> Self {
        match dof {
            Dof::X => LightSheetDof::X,
            Dof::Y => LightSheetDof::Y,
            Dof::Z => LightSheetDof::Z,
            Dof::Width => LightSheetDof::Width,
            Dof::Height => LightSheetDof::Height,
            Dof::Alpha => LightSheetDof::Alpha,
            Dof::Beta => LightSheetDof::Beta,
            Dof::Power => LightSheetDof::Power,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MicroscopeConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        microscope = %config.application.name,
        lightsheets = config.lightsheets.len(),
        cameras = config.cameras.len(),
        "Starting simulated microscope"
    );
    let microscope = Arc::new(LightSheetMicroscope::simulated(
        config,
        cli.hardware.into(),
        cli.time_scale,
    )?);

    match cli.command {
        Command::Acquire {
            start_z,
            stop_z,
            planes,
        } => acquire(&microscope, start_z, stop_z, planes).await,
        Command::Live { seconds } => live(microscope, Duration::from_secs(seconds)).await,
        Command::Calibrate { dof, samples } => calibrate(microscope, dof.into(), samples).await,
    }
}

async fn acquire(microscope: &LightSheetMicroscope, start_z: f64, stop_z: f64, planes: usize) -> Result<()> {
    let exposure_s = microscope.exposure().get();
    let mut state = AcquisitionState::from_devices("z-stack", microscope.registry(), exposure_s);
    state.set_stack(start_z, stop_z, planes)?;

    let mut queue = state.build_queue(microscope, AcquisitionType::TimeLapse)?;
    microscope.set_stack_sink(Arc::new(DropSink));
    let timeout = microscope.playback_timeout(queue.get_queue_length());
    let outcome = microscope.play_queue(&mut queue, timeout).await?;

    info!(
        success = outcome.success,
        phase = %outcome.phase,
        received = outcome.received,
        expected = outcome.expected,
        elapsed_ms = outcome.elapsed.as_millis(),
        "Acquisition finished"
    );
    if !outcome.success {
        anyhow::bail!("acquisition ended {}", outcome.phase);
    }
    Ok(())
}

async fn live(microscope: Arc<LightSheetMicroscope>, duration: Duration) -> Result<()> {
    let live = InteractiveAcquisition::new(microscope);
    let cancel = CancelFlag::new();

    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = tokio::signal::ctrl_c() => warn!("Interrupted"),
            }
            cancel.cancel();
        })
    };

    live.start_2d();
    let acquisitions = live.run(&cancel).await;
    live.stop();
    stopper.abort();

    info!(acquisitions = acquisitions?, "Live session over");
    Ok(())
}

async fn calibrate(microscope: Arc<LightSheetMicroscope>, dof: LightSheetDof, samples: usize) -> Result<()> {
    let config = SweepConfig {
        dof,
        samples,
        ..SweepConfig::default()
    };
    let metric: PlaneMetric = Arc::new(mean_intensity);

    let sweep = CalibrationSweep::new(Arc::clone(&microscope), config, metric);
    let cancel = CancelFlag::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted");
                cancel.cancel();
            }
        })
    };
    let results = sweep.run(&cancel).await;
    interrupt.abort();

    for result in results? {
        match result.best_value() {
            Some(best) => {
                result.apply_to_devices(microscope.registry())?;
                info!(lightsheet = result.lightsheet, %dof, best, "Calibrated");
            }
            None => warn!(lightsheet = result.lightsheet, %dof, "No usable metric"),
        }
    }
    Ok(())
}

fn mean_intensity(stack: &StackLease) -> f64 {
    let data = stack.data();
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&b| f64::from(b)).sum::<f64>() / data.len() as f64
}
