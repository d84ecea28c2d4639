//! Simulated Telemetrix firmware for integration tests.
//!
//! The board side of a `tokio::io::duplex` pair. It records every command
//! body it receives, answers firmware and position queries, and completes
//! stepper runs after a configurable delay (or never).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arduino_daq::config::ControllerConfig;
use arduino_daq::protocol::{Command, FrameDecoder, Report};
use arduino_daq::{Controller, Session};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone)]
pub struct BoardOptions {
    /// Delay before a run completes; `None` never completes
    pub run_delay: Option<Duration>,
    /// Emit unrelated telemetry ahead of every reply
    pub noise: bool,
}

impl Default for BoardOptions {
    fn default() -> Self {
        Self {
            run_delay: Some(Duration::from_millis(30)),
            noise: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Motor {
    current: i32,
    target: i32,
}

pub struct SimBoard {
    log: Arc<Mutex<Vec<Vec<u8>>>>,
    writer: Arc<AsyncMutex<WriteHalf<DuplexStream>>>,
}

pub fn config(timeout_ms: u64) -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.timing.operation_timeout_ms = timeout_ms;
    config
}

/// Controller wired to a fresh simulated board.
pub fn controller(options: BoardOptions, config: &ControllerConfig) -> (Controller, SimBoard) {
    let (host, board) = spawn_board(options);
    let session = Session::from_stream("sim", host);
    (Controller::new(session, config), board)
}

pub fn spawn_board(options: BoardOptions) -> (DuplexStream, SimBoard) {
    let (host, device) = duplex(4096);
    let (mut reader, writer) = tokio::io::split(device);

    let log = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::new(AsyncMutex::new(writer));
    let motors = Arc::new(Mutex::new(HashMap::<u8, Motor>::new()));

    let board = SimBoard {
        log: log.clone(),
        writer: writer.clone(),
    };

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            decoder.extend(&buf[..n]);
            while let Some(body) = decoder.next_frame() {
                log.lock().unwrap().push(body.clone());
                respond(&body, &options, &motors, &writer).await;
            }
        }
    });

    (host, board)
}

fn signed_position(bytes: &[u8]) -> i32 {
    let magnitude = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i32;
    if bytes[4] == 1 {
        -magnitude
    } else {
        magnitude
    }
}

async fn emit(writer: &AsyncMutex<WriteHalf<DuplexStream>>, options: &BoardOptions, motor: u8, report: Report) {
    let mut writer = writer.lock().await;
    if options.noise {
        let other = (motor + 1) % 4;
        let _ = writer
            .write_all(&Report::StepperPosition { motor: other, position: -7 }.encode())
            .await;
        let _ = writer
            .write_all(&Report::StepperRunComplete { motor: other }.encode())
            .await;
        let _ = writer.write_all(&Report::Analog { pin: 0, value: 11 }.encode()).await;
    }
    let _ = writer.write_all(&report.encode()).await;
}

async fn respond(
    body: &[u8],
    options: &BoardOptions,
    motors: &Arc<Mutex<HashMap<u8, Motor>>>,
    writer: &Arc<AsyncMutex<WriteHalf<DuplexStream>>>,
) {
    match body[0] {
        5 => emit(writer, options, 0, Report::Firmware { major: 5, minor: 4 }).await,
        33 => {
            let target = signed_position(&body[2..7]);
            motors.lock().unwrap().entry(body[1]).or_default().target = target;
        }
        35 => {
            let motor = body[1];
            let Some(delay) = options.run_delay else {
                return;
            };
            let motors = motors.clone();
            let writer = writer.clone();
            let options = options.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                {
                    let mut motors = motors.lock().unwrap();
                    let state = motors.entry(motor).or_default();
                    state.current = state.target;
                }
                emit(&writer, &options, motor, Report::StepperRunComplete { motor }).await;
            });
        }
        40 => {
            let position = signed_position(&body[2..7]);
            let mut motors = motors.lock().unwrap();
            let state = motors.entry(body[1]).or_default();
            state.current = position;
            state.target = position;
        }
        50 => {
            let motor = body[1];
            let position = motors.lock().unwrap().get(&motor).map(|m| m.current).unwrap_or(0);
            emit(writer, options, motor, Report::StepperPosition { motor, position }).await;
        }
        _ => {}
    }
}

impl SimBoard {
    /// Push an unsolicited report to the host.
    pub async fn inject(&self, report: Report) {
        self.writer.lock().await.write_all(&report.encode()).await.unwrap();
    }

    /// Command bodies received so far, in order.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.log.lock().unwrap().clone()
    }

    /// Position of `command` in the log.
    pub fn position_of(&self, command: &Command) -> Option<usize> {
        let body = command.encode()[1..].to_vec();
        self.commands().iter().position(|c| *c == body)
    }

    pub fn count(&self, command: &Command) -> usize {
        let body = command.encode()[1..].to_vec();
        self.commands().iter().filter(|c| **c == body).count()
    }

    /// Level of the last digital write to `pin`.
    pub fn last_level(&self, pin: u8) -> Option<bool> {
        self.commands()
            .iter()
            .rev()
            .find(|c| c.len() == 3 && c[0] == 2 && c[1] == pin)
            .map(|c| c[2] != 0)
    }

    /// Poll until `check` holds or a second elapses.
    pub async fn wait_until<F>(&self, check: F) -> bool
    where
        F: Fn(&SimBoard) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !check(self) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}
