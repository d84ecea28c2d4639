//! Board → host telemetry reports.

use crate::error::{ControllerError, ControllerResult};

/// Kind of an inbound frame. Together with a channel index this is the key
/// the session routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum FrameKind {
    DigitalReport,
    AnalogReport,
    FirmwareReport,
    IAmHere,
    I2cReadReport,
    StepperPosition,
    StepperRunComplete,
    DebugPrint,
    Unknown,
}

/// Channel index used for reports that are not tied to a pin or motor.
pub const BOARD_CHANNEL: u8 = 0;

/// A decoded telemetry report.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Report {
    Digital { pin: u8, level: bool },
    Analog { pin: u8, value: u16 },
    Firmware { major: u8, minor: u8 },
    IAmHere { instance_id: u8 },
    I2cRead { port: u8, address: u8, register: u8, data: Vec<u8> },
    StepperPosition { motor: u8, position: i32 },
    StepperRunComplete { motor: u8 },
    DebugPrint { id: u8, value: u16 },
    Unknown { id: u8, payload: Vec<u8> },
}

impl Report {
    /// Decode the body of a frame (everything after the length prefix).
    pub fn decode(body: &[u8]) -> ControllerResult<Report> {
        let (&id, payload) = body
            .split_first()
            .ok_or_else(|| ControllerError::Protocol("empty report frame".into()))?;

        let need = |n: usize| -> ControllerResult<()> {
            if payload.len() < n {
                Err(ControllerError::Protocol(format!(
                    "report {} needs {} payload bytes, got {}",
                    id,
                    n,
                    payload.len()
                )))
            } else {
                Ok(())
            }
        };

        let report = match id {
            2 => {
                need(2)?;
                Report::Digital {
                    pin: payload[0],
                    level: payload[1] != 0,
                }
            }
            3 => {
                need(3)?;
                Report::Analog {
                    pin: payload[0],
                    value: u16::from_be_bytes([payload[1], payload[2]]),
                }
            }
            5 => {
                need(2)?;
                Report::Firmware {
                    major: payload[0],
                    minor: payload[1],
                }
            }
            6 => {
                need(1)?;
                Report::IAmHere {
                    instance_id: payload[0],
                }
            }
            10 => {
                need(4)?;
                let count = payload[1] as usize;
                need(4 + count)?;
                Report::I2cRead {
                    port: payload[0],
                    address: payload[2],
                    register: payload[3],
                    data: payload[4..4 + count].to_vec(),
                }
            }
            17 => {
                need(5)?;
                Report::StepperPosition {
                    motor: payload[0],
                    position: i32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]),
                }
            }
            19 => {
                need(1)?;
                Report::StepperRunComplete { motor: payload[0] }
            }
            99 => {
                need(3)?;
                Report::DebugPrint {
                    id: payload[0],
                    value: u16::from_be_bytes([payload[1], payload[2]]),
                }
            }
            other => Report::Unknown {
                id: other,
                payload: payload.to_vec(),
            },
        };
        Ok(report)
    }

    /// Encode into a complete frame. The simulated firmware in the tests uses
    /// this to emit telemetry.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Report::Digital { pin, level } => body.extend_from_slice(&[2, *pin, u8::from(*level)]),
            Report::Analog { pin, value } => {
                body.extend_from_slice(&[3, *pin]);
                body.extend_from_slice(&value.to_be_bytes());
            }
            Report::Firmware { major, minor } => body.extend_from_slice(&[5, *major, *minor]),
            Report::IAmHere { instance_id } => body.extend_from_slice(&[6, *instance_id]),
            Report::I2cRead {
                port,
                address,
                register,
                data,
            } => {
                body.extend_from_slice(&[10, *port, data.len() as u8, *address, *register]);
                body.extend_from_slice(data);
            }
            Report::StepperPosition { motor, position } => {
                body.extend_from_slice(&[17, *motor]);
                body.extend_from_slice(&position.to_be_bytes());
            }
            Report::StepperRunComplete { motor } => body.extend_from_slice(&[19, *motor]),
            Report::DebugPrint { id, value } => {
                body.extend_from_slice(&[99, *id]);
                body.extend_from_slice(&value.to_be_bytes());
            }
            Report::Unknown { id, payload } => {
                body.push(*id);
                body.extend_from_slice(payload);
            }
        }
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(body.len() as u8);
        frame.extend_from_slice(&body);
        frame
    }

    /// Routing key of this report.
    pub fn route(&self) -> (FrameKind, u8) {
        match self {
            Report::Digital { pin, .. } => (FrameKind::DigitalReport, *pin),
            Report::Analog { pin, .. } => (FrameKind::AnalogReport, *pin),
            Report::Firmware { .. } => (FrameKind::FirmwareReport, BOARD_CHANNEL),
            Report::IAmHere { .. } => (FrameKind::IAmHere, BOARD_CHANNEL),
            Report::I2cRead { port, .. } => (FrameKind::I2cReadReport, *port),
            Report::StepperPosition { motor, .. } => (FrameKind::StepperPosition, *motor),
            Report::StepperRunComplete { motor } => (FrameKind::StepperRunComplete, *motor),
            Report::DebugPrint { .. } => (FrameKind::DebugPrint, BOARD_CHANNEL),
            Report::Unknown { id, .. } => (FrameKind::Unknown, *id),
        }
    }
}
