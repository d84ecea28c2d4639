//! Host → board command frames.
//!
//! Each command encodes to `[len, id, payload...]`; `len` counts the id byte
//! and the payload. Multi-byte values are big-endian. Signed stepper
//! positions travel as a 4-byte magnitude followed by a polarity byte
//! (1 = negative), matching the firmware's decoder.

/// Command identifiers understood by the Telemetrix4Arduino firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CommandId {
    SetPinMode = 1,
    DigitalWrite = 2,
    AnalogWrite = 3,
    ModifyReporting = 4,
    GetFirmwareVersion = 5,
    AreYouThere = 6,
    I2cBegin = 10,
    I2cWrite = 12,
    StopAllReports = 15,
    SetAnalogScanningInterval = 16,
    EnableAllReports = 17,
    SetPinModeStepper = 32,
    StepperMoveTo = 33,
    StepperRun = 35,
    StepperSetMaxSpeed = 37,
    StepperSetAcceleration = 38,
    StepperSetCurrentPosition = 40,
    StepperGetCurrentPosition = 50,
}

/// Pin modes as numbered by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum WireMode {
    Input = 0,
    Output = 1,
    InputPullup = 2,
    Analog = 3,
}

/// `ModifyReporting` sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ReportingChange {
    DisableAll = 0,
    DisableOne = 1,
    EnableOne = 2,
}

/// Stepper driver wiring. Only the two-wire step/direction driver is used
/// here; the firmware calls it interface 1.
pub const STEPPER_INTERFACE_DRIVER: u8 = 1;

/// A typed command, encoded on demand by [`Command::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Command {
    SetPinMode { pin: u8, mode: WireMode, report: bool },
    DigitalWrite { pin: u8, level: bool },
    AnalogWrite { pin: u8, value: u16 },
    ModifyReporting { change: ReportingChange, pin: u8 },
    GetFirmwareVersion,
    AreYouThere,
    I2cBegin { port: u8 },
    I2cWrite { port: u8, address: u8, data: Vec<u8> },
    StopAllReports,
    SetAnalogScanningInterval { interval_ms: u8 },
    EnableAllReports,
    SetPinModeStepper { motor: u8, pulse_pin: u8, direction_pin: u8, enable: bool },
    StepperMoveTo { motor: u8, position: i32 },
    StepperRun { motor: u8 },
    StepperSetMaxSpeed { motor: u8, steps_per_sec: u16 },
    StepperSetAcceleration { motor: u8, steps_per_sec2: u16 },
    StepperSetCurrentPosition { motor: u8, position: i32 },
    StepperGetCurrentPosition { motor: u8 },
}

impl Command {
    /// Identifier byte of this command.
    pub fn id(&self) -> CommandId {
        match self {
            Command::SetPinMode { .. } => CommandId::SetPinMode,
            Command::DigitalWrite { .. } => CommandId::DigitalWrite,
            Command::AnalogWrite { .. } => CommandId::AnalogWrite,
            Command::ModifyReporting { .. } => CommandId::ModifyReporting,
            Command::GetFirmwareVersion => CommandId::GetFirmwareVersion,
            Command::AreYouThere => CommandId::AreYouThere,
            Command::I2cBegin { .. } => CommandId::I2cBegin,
            Command::I2cWrite { .. } => CommandId::I2cWrite,
            Command::StopAllReports => CommandId::StopAllReports,
            Command::SetAnalogScanningInterval { .. } => CommandId::SetAnalogScanningInterval,
            Command::EnableAllReports => CommandId::EnableAllReports,
            Command::SetPinModeStepper { .. } => CommandId::SetPinModeStepper,
            Command::StepperMoveTo { .. } => CommandId::StepperMoveTo,
            Command::StepperRun { .. } => CommandId::StepperRun,
            Command::StepperSetMaxSpeed { .. } => CommandId::StepperSetMaxSpeed,
            Command::StepperSetAcceleration { .. } => CommandId::StepperSetAcceleration,
            Command::StepperSetCurrentPosition { .. } => CommandId::StepperSetCurrentPosition,
            Command::StepperGetCurrentPosition { .. } => CommandId::StepperGetCurrentPosition,
        }
    }

    /// Encode into a complete length-prefixed frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = vec![self.id() as u8];
        match self {
            Command::SetPinMode { pin, mode, report } => {
                body.push(*pin);
                body.push(*mode as u8);
                if *mode == WireMode::Analog {
                    // differential threshold, unused
                    body.extend_from_slice(&[0, 0]);
                }
                if *mode != WireMode::Output {
                    body.push(u8::from(*report));
                }
            }
            Command::DigitalWrite { pin, level } => {
                body.push(*pin);
                body.push(u8::from(*level));
            }
            Command::AnalogWrite { pin, value } => {
                body.push(*pin);
                body.extend_from_slice(&value.to_be_bytes());
            }
            Command::ModifyReporting { change, pin } => {
                body.push(*change as u8);
                body.push(*pin);
            }
            Command::GetFirmwareVersion
            | Command::AreYouThere
            | Command::StopAllReports
            | Command::EnableAllReports => {}
            Command::I2cBegin { port } => body.push(*port),
            Command::I2cWrite { port, address, data } => {
                body.push(data.len() as u8);
                body.push(*port);
                body.push(*address);
                body.extend_from_slice(data);
            }
            Command::SetAnalogScanningInterval { interval_ms } => body.push(*interval_ms),
            Command::SetPinModeStepper {
                motor,
                pulse_pin,
                direction_pin,
                enable,
            } => {
                body.push(*motor);
                body.push(STEPPER_INTERFACE_DRIVER);
                body.extend_from_slice(&[*pulse_pin, *direction_pin, 0, 0]);
                body.push(u8::from(*enable));
            }
            Command::StepperMoveTo { motor, position }
            | Command::StepperSetCurrentPosition { motor, position } => {
                body.push(*motor);
                push_signed_position(&mut body, *position);
            }
            Command::StepperRun { motor } | Command::StepperGetCurrentPosition { motor } => {
                body.push(*motor);
            }
            Command::StepperSetMaxSpeed {
                motor,
                steps_per_sec: value,
            }
            | Command::StepperSetAcceleration {
                motor,
                steps_per_sec2: value,
            } => {
                body.push(*motor);
                body.extend_from_slice(&value.to_be_bytes());
            }
        }

        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(body.len() as u8);
        frame.extend_from_slice(&body);
        frame
    }
}

fn push_signed_position(body: &mut Vec<u8>, position: i32) {
    body.extend_from_slice(&position.unsigned_abs().to_be_bytes());
    body.push(u8::from(position < 0));
}
