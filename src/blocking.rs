//! Synchronous wrapper for hosts without an async runtime.
//!
//! [`BlockingController`] owns a small multi-threaded Tokio runtime; the
//! session's reader task keeps running on it between calls, so analog
//! telemetry stays current while the host thread is idle.
//!
//! Do not create or drop a `BlockingController` from inside an async
//! context: the wrapper blocks the calling thread.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::config::ControllerConfig;
use crate::controller::{AxisId, AxisState, Controller};
use crate::error::{ControllerError, ControllerResult};
use crate::registry::PinMode;
use crate::session::Session;

const WORKER_THREADS: usize = 2;

fn build_runtime() -> ControllerResult<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(WORKER_THREADS)
        .thread_name("arduino-daq")
        .enable_all()
        .build()
        .map_err(ControllerError::Transport)
}

/// Blocking facade over [`Controller`].
pub struct BlockingController {
    runtime: Runtime,
    controller: Controller,
    closed: bool,
}

impl BlockingController {
    /// Open the configured serial port.
    pub fn connect(config: &ControllerConfig) -> ControllerResult<Self> {
        let runtime = build_runtime()?;
        let controller = runtime.block_on(Controller::connect(config))?;
        Ok(Self {
            runtime,
            controller,
            closed: false,
        })
    }

    /// Run over an already-open byte stream.
    pub fn from_stream<S>(name: &str, stream: S, config: &ControllerConfig) -> ControllerResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let runtime = build_runtime()?;
        let controller = runtime.block_on(async {
            let session = Session::from_stream(name, stream);
            Controller::new(session, config)
        });
        Ok(Self {
            runtime,
            controller,
            closed: false,
        })
    }

    /// The async controller, for callers that hold their own runtime handle.
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// See [`Controller::initialize_stepper`].
    pub fn initialize_stepper(&self, pulse_pin: u8, direction_pin: u8, enable_pin: u8) -> ControllerResult<AxisId> {
        self.runtime
            .block_on(self.controller.initialize_stepper(pulse_pin, direction_pin, enable_pin))
    }

    /// See [`Controller::move_stepper_to`].
    pub fn move_stepper_to(&self, axis: AxisId, position: i32, max_speed: u16, acceleration: u16) -> ControllerResult<()> {
        self.runtime
            .block_on(self.controller.move_stepper_to(axis, position, max_speed, acceleration))
    }

    /// See [`Controller::move_stepper_to_default`].
    pub fn move_stepper_to_default(&self, axis: AxisId, position: i32) -> ControllerResult<()> {
        self.runtime
            .block_on(self.controller.move_stepper_to_default(axis, position))
    }

    /// See [`Controller::get_stepper_position`].
    pub fn get_stepper_position(&self, axis: AxisId) -> ControllerResult<i32> {
        self.runtime.block_on(self.controller.get_stepper_position(axis))
    }

    /// See [`Controller::stepper_state`].
    pub fn stepper_state(&self, axis: AxisId) -> AxisState {
        self.controller.stepper_state(axis)
    }

    /// See [`Controller::configure_analog_input`].
    pub fn configure_analog_input(&self, channel: u8) -> ControllerResult<()> {
        self.runtime.block_on(self.controller.configure_analog_input(channel))
    }

    /// See [`Controller::read_analog_input`].
    pub fn read_analog_input(&self, channel: u8) -> u16 {
        self.controller.read_analog_input(channel)
    }

    /// See [`Controller::write_servo_angle`].
    pub fn write_servo_angle(&self, pin: u8, degrees: f64) -> ControllerResult<u8> {
        self.runtime.block_on(self.controller.write_servo_angle(pin, degrees))
    }

    /// See [`Controller::write_digital_output`].
    pub fn write_digital_output(&self, pin: u8, level: bool) -> ControllerResult<()> {
        self.runtime.block_on(self.controller.write_digital_output(pin, level))
    }

    /// See [`Controller::write_analog_output`].
    pub fn write_analog_output(&self, pin: u8, value: f64) -> ControllerResult<u8> {
        self.runtime.block_on(self.controller.write_analog_output(pin, value))
    }

    /// See [`Controller::output_value`].
    pub fn output_value(&self, pin: u8) -> Option<u8> {
        self.controller.output_value(pin)
    }

    /// See [`Controller::reconfigure_pin`].
    pub fn reconfigure_pin(&self, pin: u8, mode: PinMode) -> ControllerResult<()> {
        self.runtime.block_on(self.controller.reconfigure_pin(pin, mode))
    }

    /// See [`Controller::configure_i2c`].
    pub fn configure_i2c(&self, port: u8) -> ControllerResult<()> {
        self.runtime.block_on(self.controller.configure_i2c(port))
    }

    /// See [`Controller::i2c_write`].
    pub fn i2c_write(&self, port: u8, address: u8, data: &[u8]) -> ControllerResult<()> {
        self.runtime.block_on(self.controller.i2c_write(port, address, data))
    }

    /// See [`Controller::firmware_version`].
    pub fn firmware_version(&self) -> ControllerResult<(u8, u8)> {
        self.runtime.block_on(self.controller.firmware_version())
    }

    /// Shut the controller down and stop the runtime.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.runtime.block_on(self.controller.shutdown());
        debug!("blocking controller closed");
    }
}

impl Drop for BlockingController {
    fn drop(&mut self) {
        // dropping from an async context is unsupported: tokio panics when the
        // owned runtime is dropped there, so only shut down gracefully outside one
        if tokio::runtime::Handle::try_current().is_err() {
            self.close();
        }
    }
}
