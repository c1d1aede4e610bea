//! Light-sheet microscope acquisition engine.
//!
//! A [`LightSheetMicroscopeQueue`] records snapshots of the microscope state.
//! Each snapshot is translated by [`staves`] into two movements of analog and
//! digital staves (before exposure, then exposure). A finalized queue is
//! played by [`LightSheetMicroscope`]: the signal generator plays the score
//! while the cameras deliver image stacks leased from a
//! [`Recycler`](lsm_pool::Recycler).
//!
//! On top of the queue sit the acquisition drivers:
//!
//! - [`acquisition`]: z-stacks driven by an interpolation table of control planes
//! - [`interactive`]: the live 2D/3D preview loop
//! - [`calibration`]: DOF sweeps scored by an image metric

pub mod acquisition;
pub mod calibration;
pub mod devices;
pub mod interactive;
pub mod playback;
pub mod queue;
pub mod registry;
pub mod staves;
pub mod state;

pub use acquisition::{AcquisitionState, ControlPlane, InterpolationTable, TableColumn};
pub use calibration::{CalibrationSweep, PlaneMetric, SweepConfig, SweepResult};
pub use devices::{CameraStack, DetectionArm, LightSheet, LightSheetDof, SimulatedCamera, StackCamera};
pub use interactive::{InteractiveAcquisition, InteractiveMode, Step};
pub use playback::{CollectingSink, DropSink, LightSheetMicroscope, PlaybackOutcome, StackSink};
pub use queue::{AcquisitionType, LightSheetMicroscopeQueue, QueuePhase};
pub use registry::DeviceRegistry;
pub use staves::ExposureTiming;
pub use state::MicroscopeState;
