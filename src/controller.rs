//! Actuator/Sensor Facade
//!
//! The operation set a host adapter calls: stepper motion, servo, analog and
//! digital I/O, I2C. Built from the session (wire), the registry (state) and
//! the coordinator (blocking round trips).
//!
//! ## Stepper lifecycle
//!
//! ```text
//! Uninitialized --initialize_stepper--> Idle --move_stepper_to--> Moving
//!                                        ^                          |
//!                                        +--- completion / timeout -+
//! ```
//!
//! The driver enable pin is asserted only between the start of a motion and
//! its completion (or timeout). Enable polarity comes from the stepper
//! configuration; most step/dir drivers are active-low.
//!
//! # Example
//!
//! ```no_run
//! use arduino_daq::config::ControllerConfig;
//! use arduino_daq::controller::Controller;
//!
//! #[tokio::main]
//! async fn main() -> arduino_daq::ControllerResult<()> {
//!     let mut config = ControllerConfig::default();
//!     config.connection.port = "/dev/ttyACM0".into();
//!
//!     let controller = Controller::connect(&config).await?;
//!     let axis = controller.initialize_stepper(8, 9, 7).await?;
//!     controller.move_stepper_to(axis, 2000, 400, 800).await?;
//!     println!("at {}", controller.get_stepper_position(axis).await?);
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, StepperConfig};
use crate::coordinator::{Coordinator, ResourceSlot};
use crate::error::{ControllerError, ControllerResult};
use crate::protocol::{Command, FrameKind, Report, WireMode, BOARD_CHANNEL};
use crate::registry::{clamp_output, ChannelId, ChannelRegistry, PinMode};
use crate::session::Session;

/// Steppers the firmware can drive at once.
pub const MAX_STEPPERS: usize = 4;

/// Largest analog reading (10-bit ADC).
pub const ANALOG_INPUT_MAX: u16 = 1023;

/// Largest I2C payload the firmware's Wire buffer accepts in one write.
pub const I2C_MAX_PAYLOAD: usize = 30;

/// Map a servo angle in degrees onto the 0–255 pulse-width scale.
///
/// `round(d * 255 / 180)`, ties away from zero, so 90° maps to 128. The
/// angle itself is not validated; results outside the scale saturate.
pub fn servo_pulse_value(degrees: f64) -> u8 {
    clamp_output(degrees * 255.0 / 180.0)
}

/// Handle to an initialized stepper axis (the firmware motor id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AxisId(pub u8);

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stepper axis {}", self.0)
    }
}

/// Motion state of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    /// No `initialize_stepper` yet
    Uninitialized,
    /// Ready for a motion
    Idle,
    /// A motion is executing
    Moving,
}

/// Last motion parameters sent to an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionParams {
    /// Steps per second
    pub max_speed: u16,
    /// Steps per second squared
    pub acceleration: u16,
}

struct StepperAxis {
    id: AxisId,
    pulse_pin: u8,
    direction_pin: u8,
    enable_pin: u8,
    slot: ResourceSlot,
    state: Mutex<AxisState>,
    params: Mutex<Option<MotionParams>>,
}

impl StepperAxis {
    fn set_state(&self, state: AxisState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> AxisState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Puts an axis back to `Idle` and de-asserts its enable pin when a motion
/// future is dropped before it finished.
struct MotionGuard {
    session: Session,
    registry: Arc<ChannelRegistry>,
    axis: Arc<StepperAxis>,
    release_level: bool,
    armed: bool,
}

impl MotionGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for MotionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.axis.set_state(AxisState::Idle);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pin = self.axis.enable_pin;
        let level = self.release_level;
        let session = self.session.clone();
        let registry = self.registry.clone();
        warn!(axis = self.axis.id.0, enable_pin = pin, "motion cancelled, releasing stepper enable");
        runtime.spawn(async move {
            match session.send(&Command::DigitalWrite { pin, level }).await {
                Ok(()) => registry.memorize_output(ChannelId::Digital(pin), u8::from(level)),
                Err(e) => warn!(enable_pin = pin, error = %e, "failed to de-assert stepper enable"),
            }
        });
    }
}

/// Async facade over one board.
pub struct Controller {
    session: Session,
    coordinator: Coordinator,
    registry: Arc<ChannelRegistry>,
    axes: RwLock<Vec<Arc<StepperAxis>>>,
    axis_init: tokio::sync::Mutex<()>,
    board_slot: ResourceSlot,
    stepper_defaults: StepperConfig,
    analog_scan_interval_ms: u8,
}

impl Controller {
    /// Open the configured serial port and build a controller on it.
    pub async fn connect(config: &ControllerConfig) -> ControllerResult<Self> {
        let descriptor = config
            .descriptor()
            .map_err(|e| ControllerError::Configuration(e.to_string()))?;
        let session = Session::open(&descriptor).await?;
        Ok(Self::new(session, config))
    }

    /// Build a controller on an open session.
    pub fn new(session: Session, config: &ControllerConfig) -> Self {
        let coordinator = Coordinator::new(
            session.clone(),
            config.stepper.busy_policy,
            config.timing.operation_timeout(),
        );
        let board_slot = coordinator.slot("board query");

        session.register_handler(FrameKind::DebugPrint, BOARD_CHANNEL, |report| {
            debug!(?report, "firmware debug print");
        });

        Self {
            session,
            coordinator,
            registry: Arc::new(ChannelRegistry::new()),
            axes: RwLock::new(Vec::new()),
            axis_init: tokio::sync::Mutex::new(()),
            board_slot,
            stepper_defaults: config.stepper.clone(),
            analog_scan_interval_ms: config.timing.analog_scan_interval_ms,
        }
    }

    /// Underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Shared channel state.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Stepper
    // ------------------------------------------------------------------

    /// Configure a step/direction driver and return its axis handle.
    ///
    /// The enable pin becomes a digital output and is de-asserted; the
    /// position reference is zeroed.
    pub async fn initialize_stepper(
        &self,
        pulse_pin: u8,
        direction_pin: u8,
        enable_pin: u8,
    ) -> ControllerResult<AxisId> {
        let _init = self.axis_init.lock().await;

        let motor = self.axes.read().unwrap_or_else(PoisonError::into_inner).len();
        if motor >= MAX_STEPPERS {
            return Err(ControllerError::Configuration(format!(
                "firmware supports at most {} steppers",
                MAX_STEPPERS
            )));
        }
        let motor = motor as u8;

        let claims = [
            (ChannelId::Digital(pulse_pin), PinMode::Stepper),
            (ChannelId::Digital(direction_pin), PinMode::Stepper),
            (ChannelId::Digital(enable_pin), PinMode::Digital),
        ];
        let mut claimed = Vec::with_capacity(claims.len());
        for (channel, mode) in claims {
            match self.registry.set_mode(channel, mode) {
                Ok(true) => claimed.push(channel),
                outcome => {
                    self.release_claims(&claimed);
                    return Err(match outcome {
                        Err(e) => e,
                        // already configured for something else in the same mode
                        _ => ControllerError::InvalidTransition {
                            channel,
                            current: mode,
                            requested: mode,
                        },
                    });
                }
            }
        }

        if let Err(e) = self
            .configure_stepper(motor, pulse_pin, direction_pin, enable_pin)
            .await
        {
            self.release_claims(&claimed);
            return Err(e);
        }

        let channel = ChannelId::Axis(motor);
        self.registry.reconfigure(channel, PinMode::Stepper);
        self.registry.record_input(channel, 0);

        let registry = self.registry.clone();
        self.session
            .register_handler(FrameKind::StepperPosition, motor, move |report| {
                if let Report::StepperPosition { motor, position } = report {
                    registry.record_input(ChannelId::Axis(*motor), *position);
                }
            });

        let id = AxisId(motor);
        let axis = Arc::new(StepperAxis {
            id,
            pulse_pin,
            direction_pin,
            enable_pin,
            slot: self.coordinator.slot(&id.to_string()),
            state: Mutex::new(AxisState::Idle),
            params: Mutex::new(None),
        });
        self.axes.write().unwrap_or_else(PoisonError::into_inner).push(axis);

        info!(axis = motor, pulse_pin, direction_pin, enable_pin, "stepper initialized");
        Ok(id)
    }

    /// Move to an absolute position and wait for the firmware to report the
    /// motion complete.
    ///
    /// The enable pin is de-asserted afterwards whatever the outcome. On
    /// `Timeout` the axis stays reserved until the completion finally arrives.
    pub async fn move_stepper_to(
        &self,
        axis: AxisId,
        position: i32,
        max_speed: u16,
        acceleration: u16,
    ) -> ControllerResult<()> {
        let axis = self.axis(axis)?;
        let mut op = self
            .coordinator
            .begin(&axis.slot, FrameKind::StepperRunComplete, axis.id.0)
            .await?;

        // declared after `op` so it drops first when the caller cancels
        let guard = MotionGuard {
            session: self.session.clone(),
            registry: self.registry.clone(),
            axis: axis.clone(),
            release_level: self.enable_level(false),
            armed: true,
        };

        let params = MotionParams {
            max_speed,
            acceleration,
        };
        if let Err(e) = self.start_motion(&axis, position, params).await {
            self.release_enable(&axis).await;
            guard.disarm();
            op.abandon();
            return Err(e);
        }

        axis.set_state(AxisState::Moving);
        debug!(axis = axis.id.0, position, max_speed, acceleration, "motion started");
        let outcome = op.wait().await;
        axis.set_state(AxisState::Idle);
        self.release_enable(&axis).await;
        guard.disarm();
        drop(op);

        outcome?;
        self.registry.record_input(ChannelId::Axis(axis.id.0), position);
        info!(axis = axis.id.0, position, "motion complete");
        Ok(())
    }

    /// [`Controller::move_stepper_to`] with the configured default speed and
    /// acceleration.
    pub async fn move_stepper_to_default(&self, axis: AxisId, position: i32) -> ControllerResult<()> {
        self.move_stepper_to(
            axis,
            position,
            self.stepper_defaults.max_speed,
            self.stepper_defaults.acceleration,
        )
        .await
    }

    /// Ask the firmware for the axis position and wait for the answer.
    pub async fn get_stepper_position(&self, axis: AxisId) -> ControllerResult<i32> {
        let axis = self.axis(axis)?;
        let motor = axis.id.0;
        let report = self
            .coordinator
            .run_blocking(&axis.slot, FrameKind::StepperPosition, motor, |session| async move {
                session.send(&Command::StepperGetCurrentPosition { motor }).await
            })
            .await?;

        match report {
            Report::StepperPosition { position, .. } => Ok(position),
            other => Err(ControllerError::Protocol(format!(
                "expected position report for axis {}, got {:?}",
                motor, other
            ))),
        }
    }

    /// Last position known without asking the board.
    pub fn last_known_position(&self, axis: AxisId) -> ControllerResult<i32> {
        let axis = self.axis(axis)?;
        Ok(self.registry.read_last(ChannelId::Axis(axis.id.0)))
    }

    /// Current motion state.
    pub fn stepper_state(&self, axis: AxisId) -> AxisState {
        self.axis(axis)
            .map(|a| a.state())
            .unwrap_or(AxisState::Uninitialized)
    }

    /// Parameters of the most recent motion, if any.
    pub fn motion_params(&self, axis: AxisId) -> Option<MotionParams> {
        let axis = self.axis(axis).ok()?;
        let params = axis.params.lock().unwrap_or_else(PoisonError::into_inner);
        *params
    }

    fn axis(&self, id: AxisId) -> ControllerResult<Arc<StepperAxis>> {
        self.axes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| ControllerError::NotInitialized(id.to_string()))
    }

    async fn start_motion(
        &self,
        axis: &StepperAxis,
        position: i32,
        params: MotionParams,
    ) -> ControllerResult<()> {
        let motor = axis.id.0;
        self.session
            .send(&Command::StepperSetMaxSpeed {
                motor,
                steps_per_sec: params.max_speed,
            })
            .await?;
        self.session
            .send(&Command::StepperSetAcceleration {
                motor,
                steps_per_sec2: params.acceleration,
            })
            .await?;
        *axis.params.lock().unwrap_or_else(PoisonError::into_inner) = Some(params);

        self.session
            .send(&Command::StepperMoveTo { motor, position })
            .await?;
        self.write_enable(axis.enable_pin, true).await?;
        self.session.send(&Command::StepperRun { motor }).await
    }

    /// De-assert the driver enable, logging instead of failing.
    async fn release_enable(&self, axis: &StepperAxis) {
        if let Err(e) = self.write_enable(axis.enable_pin, false).await {
            warn!(axis = axis.id.0, enable_pin = axis.enable_pin, error = %e, "failed to de-assert stepper enable");
        }
    }

    /// Wire level that (de-)asserts a driver enable input.
    fn enable_level(&self, asserted: bool) -> bool {
        asserted != self.stepper_defaults.enable_active_low
    }

    async fn write_enable(&self, pin: u8, asserted: bool) -> ControllerResult<()> {
        let level = self.enable_level(asserted);
        self.session.send(&Command::DigitalWrite { pin, level }).await?;
        self.registry
            .memorize_output(ChannelId::Digital(pin), u8::from(level));
        Ok(())
    }

    async fn configure_stepper(
        &self,
        motor: u8,
        pulse_pin: u8,
        direction_pin: u8,
        enable_pin: u8,
    ) -> ControllerResult<()> {
        self.session
            .send(&Command::SetPinModeStepper {
                motor,
                pulse_pin,
                direction_pin,
                enable: true,
            })
            .await?;
        self.session
            .send(&Command::SetPinMode {
                pin: enable_pin,
                mode: WireMode::Output,
                report: false,
            })
            .await?;
        self.write_enable(enable_pin, false).await?;
        self.session
            .send(&Command::StepperSetCurrentPosition { motor, position: 0 })
            .await
    }

    fn release_claims(&self, claimed: &[ChannelId]) {
        for channel in claimed {
            self.registry.release(*channel);
        }
    }

    // ------------------------------------------------------------------
    // Analog input
    // ------------------------------------------------------------------

    /// Start continuous sampling of an analog pin. Reports update the
    /// registry in the background.
    pub async fn configure_analog_input(&self, channel: u8) -> ControllerResult<()> {
        let id = ChannelId::Analog(channel);
        self.registry.set_mode(id, PinMode::Analog)?;

        let registry = self.registry.clone();
        self.session
            .register_handler(FrameKind::AnalogReport, channel, move |report| {
                if let Report::Analog { pin, value } = report {
                    registry.record_input(ChannelId::Analog(*pin), i32::from(*value));
                }
            });

        self.session
            .send(&Command::SetAnalogScanningInterval {
                interval_ms: self.analog_scan_interval_ms,
            })
            .await?;
        self.session
            .send(&Command::SetPinMode {
                pin: channel,
                mode: WireMode::Analog,
                report: true,
            })
            .await?;

        info!(channel, interval_ms = self.analog_scan_interval_ms, "analog input armed");
        Ok(())
    }

    /// Latest raw reading (0–1023) of an analog pin, 0 before the first report.
    pub fn read_analog_input(&self, channel: u8) -> u16 {
        let raw = self.registry.read_last(ChannelId::Analog(channel));
        raw.clamp(0, i32::from(ANALOG_INPUT_MAX)) as u16
    }

    // ------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------

    /// Write a servo angle, mapped onto the 0–255 pulse-width scale.
    /// Returns the value sent.
    pub async fn write_servo_angle(&self, pin: u8, degrees: f64) -> ControllerResult<u8> {
        self.claim_output(pin, PinMode::Servo).await?;
        let value = self
            .write_and_memorize(pin, f64::from(servo_pulse_value(degrees)))
            .await?;
        debug!(pin, degrees, value, "servo written");
        Ok(value)
    }

    /// Drive a digital output high or low.
    pub async fn write_digital_output(&self, pin: u8, level: bool) -> ControllerResult<()> {
        self.claim_output(pin, PinMode::Digital).await?;
        self.session.send(&Command::DigitalWrite { pin, level }).await?;
        self.registry
            .memorize_output(ChannelId::Digital(pin), u8::from(level));
        Ok(())
    }

    /// Write a PWM value, clamped to 0–255. Returns the value sent.
    pub async fn write_analog_output(&self, pin: u8, value: f64) -> ControllerResult<u8> {
        self.claim_output(pin, PinMode::Digital).await?;
        self.write_and_memorize(pin, value).await
    }

    /// Last value written to an output pin.
    pub fn output_value(&self, pin: u8) -> Option<u8> {
        self.registry.output_value(ChannelId::Digital(pin))
    }

    /// Explicitly move a pin to another mode, discarding its memorized state.
    pub async fn reconfigure_pin(&self, pin: u8, mode: PinMode) -> ControllerResult<()> {
        let channel = ChannelId::Digital(pin);
        if matches!(mode, PinMode::Digital | PinMode::Servo) {
            self.session
                .send(&Command::SetPinMode {
                    pin,
                    mode: WireMode::Output,
                    report: false,
                })
                .await?;
        }
        self.registry.reconfigure(channel, mode);
        Ok(())
    }

    async fn claim_output(&self, pin: u8, mode: PinMode) -> ControllerResult<()> {
        let channel = ChannelId::Digital(pin);
        if !self.registry.set_mode(channel, mode)? {
            return Ok(());
        }
        let result = self
            .session
            .send(&Command::SetPinMode {
                pin,
                mode: WireMode::Output,
                report: false,
            })
            .await;
        if result.is_err() {
            self.registry.reconfigure(channel, PinMode::Unset);
        }
        result
    }

    async fn write_and_memorize(&self, pin: u8, value: f64) -> ControllerResult<u8> {
        let clamped = clamp_output(value);
        self.session
            .send(&Command::AnalogWrite {
                pin,
                value: u16::from(clamped),
            })
            .await?;
        Ok(self.registry.write_and_memorize(ChannelId::Digital(pin), value))
    }

    // ------------------------------------------------------------------
    // I2C
    // ------------------------------------------------------------------

    /// Start the I2C bridge on `port`.
    pub async fn configure_i2c(&self, port: u8) -> ControllerResult<()> {
        let channel = ChannelId::I2cBus(port);
        if self.registry.set_mode(channel, PinMode::I2c)? {
            if let Err(e) = self.session.send(&Command::I2cBegin { port }).await {
                self.registry.reconfigure(channel, PinMode::Unset);
                return Err(e);
            }
            info!(port, "I2C bus started");
        }
        Ok(())
    }

    /// Write bytes to an I2C device. No acknowledgement is awaited.
    pub async fn i2c_write(&self, port: u8, address: u8, data: &[u8]) -> ControllerResult<()> {
        if self.registry.mode(ChannelId::I2cBus(port)) != PinMode::I2c {
            return Err(ControllerError::NotInitialized(format!("I2C port {}", port)));
        }
        if data.len() > I2C_MAX_PAYLOAD {
            return Err(ControllerError::Protocol(format!(
                "I2C payload of {} bytes exceeds {}",
                data.len(),
                I2C_MAX_PAYLOAD
            )));
        }
        self.session
            .send(&Command::I2cWrite {
                port,
                address,
                data: data.to_vec(),
            })
            .await
    }

    // ------------------------------------------------------------------
    // Board
    // ------------------------------------------------------------------

    /// Query the firmware version.
    pub async fn firmware_version(&self) -> ControllerResult<(u8, u8)> {
        let report = self
            .coordinator
            .run_blocking(&self.board_slot, FrameKind::FirmwareReport, BOARD_CHANNEL, |session| async move {
                session.send(&Command::GetFirmwareVersion).await
            })
            .await?;
        match report {
            Report::Firmware { major, minor } => Ok((major, minor)),
            other => Err(ControllerError::Protocol(format!(
                "expected firmware report, got {:?}",
                other
            ))),
        }
    }

    /// Stop all telemetry reporting.
    pub async fn stop_all_reports(&self) -> ControllerResult<()> {
        self.session.send(&Command::StopAllReports).await
    }

    /// Resume telemetry reporting.
    pub async fn enable_all_reports(&self) -> ControllerResult<()> {
        self.session.send(&Command::EnableAllReports).await
    }

    /// Disable every driver, stop reporting and close the session. Pending
    /// operations fail with `Aborted`.
    pub async fn shutdown(&self) {
        if !self.session.is_closed() {
            let axes: Vec<_> = self
                .axes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for axis in &axes {
                self.release_enable(axis).await;
            }
            if let Err(e) = self.stop_all_reports().await {
                debug!(error = %e, "stop reports on shutdown failed");
            }
        }
        self.session.shutdown().await;
    }
}

impl fmt::Debug for StepperAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepperAxis")
            .field("id", &self.id)
            .field("pulse_pin", &self.pulse_pin)
            .field("direction_pin", &self.direction_pin)
            .field("enable_pin", &self.enable_pin)
            .field("state", &self.state())
            .finish()
    }
}
