//! Devices of a light-sheet microscope.
//!
//! Light sheets and detection arms expose their DOFs as [`Observable`]s that
//! queues read as the current state. Cameras implement [`StackCamera`].
//!
//! [`Observable`]: lsm_core::Observable

pub mod camera;
pub mod detection;
pub mod lightsheet;

pub use camera::{AcquisitionJob, CameraStack, SimulatedCamera, StackCamera};
pub use detection::DetectionArm;
pub use lightsheet::{LightSheet, LightSheetDof};
