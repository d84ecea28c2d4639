//! Telemetrix4Arduino wire protocol.
//!
//! Protocol Overview:
//! - Format: `[Length][Id][Payload...]`, binary, length counts id + payload
//! - Commands flow host → board, reports flow board → host
//! - Timing: fully asynchronous; a command produces zero or one correlated
//!   report, possibly interleaved with unrelated telemetry

pub mod command;
pub mod frame;
pub mod report;

pub use command::{Command, CommandId, ReportingChange, WireMode};
pub use frame::FrameDecoder;
pub use report::{FrameKind, Report, BOARD_CHANNEL};
