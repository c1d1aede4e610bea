//! Core types shared by the light-sheet acquisition engine.
//!
//! - [`error`]: the [`LsmError`] taxonomy and [`LsmResult`] alias
//! - [`config`]: figment-based [`MicroscopeConfig`]
//! - [`observable`]: reactive device values with cycle-safe propagation
//! - [`bounds`]: DOF bounds and affine value-to-voltage functions
//! - [`cancel`]: cancellation flag for long sweeps

pub mod bounds;
pub mod cancel;
pub mod config;
pub mod error;
pub mod observable;

pub use bounds::{AffineFunction, ChannelBounds};
pub use cancel::CancelFlag;
pub use config::{ConfigError, MicroscopeConfig};
pub use error::{LsmError, LsmResult};
pub use observable::Observable;
