//! Async command/telemetry client for Arduino boards running the
//! Telemetrix4Arduino firmware.
//!
//! The crate is layered bottom-up:
//!
//! - [`protocol`]: frame encoding and decoding
//! - [`session`]: the serial link, a serialized writer and a background
//!   reader that routes reports to registered handlers
//! - [`registry`]: per-channel mode and last-value state
//! - [`coordinator`]: blocking round trips with per-resource exclusivity
//!   and timeouts
//! - [`controller`]: the actuator/sensor operations a host calls
//! - [`blocking`]: the same operations for synchronous hosts
//!
//! Configuration lives in [`config`], subscriber setup in [`logging`].

pub mod blocking;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod session;

pub use blocking::BlockingController;
pub use config::ControllerConfig;
pub use controller::{AxisId, AxisState, Controller};
pub use coordinator::BusyPolicy;
pub use error::{ControllerError, ControllerResult};
pub use registry::{ChannelId, PinMode};
pub use session::{ConnectionDescriptor, Session};
