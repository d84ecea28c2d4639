//! Transport Session
//!
//! Owns the single connection to the board. Outbound commands are written
//! under an async mutex so concurrent callers never interleave partial
//! frames. Inbound bytes are consumed by one background reader task which
//! reassembles frames and routes each report to the handlers registered for
//! its `(FrameKind, channel)` pair:
//!
//! - one-shot receivers (FIFO per key) wake a single pending operation
//! - persistent handlers see every matching report
//!
//! Reports nobody asked for are dropped with a debug diagnostic.
//!
//! # Example
//!
//! ```no_run
//! use arduino_daq::protocol::{Command, FrameKind};
//! use arduino_daq::session::{ConnectionDescriptor, Session};
//!
//! #[tokio::main]
//! async fn main() -> arduino_daq::ControllerResult<()> {
//!     let session = Session::open(&ConnectionDescriptor::new("/dev/ttyACM0")).await?;
//!     session.register_handler(FrameKind::AnalogReport, 2, |report| println!("{:?}", report));
//!     session.send(&Command::GetFirmwareVersion).await?;
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::protocol::{Command, FrameDecoder, FrameKind, Report};

/// Telemetrix4Arduino default link speed.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Boards reset when the port opens; the firmware needs this long to boot.
pub const DEFAULT_RESET_WAIT: Duration = Duration::from_millis(4000);

/// Where to find the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Serial device path or alias (e.g., "/dev/ttyACM0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Delay after opening before the first command
    pub reset_wait: Duration,
}

impl ConnectionDescriptor {
    /// Descriptor with default baud rate and reset delay.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            reset_wait: DEFAULT_RESET_WAIT,
        }
    }

    /// Override the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Override the post-open reset delay.
    pub fn with_reset_wait(mut self, reset_wait: Duration) -> Self {
        self.reset_wait = reset_wait;
        self
    }
}

/// Callback invoked from the reader task for every matching report.
pub type ReportHandler = Arc<dyn Fn(&Report) + Send + Sync>;

type RouteKey = (FrameKind, u8);
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct Routes {
    persistent: HashMap<RouteKey, ReportHandler>,
    once: HashMap<RouteKey, VecDeque<oneshot::Sender<Report>>>,
    closed: bool,
}

struct SessionInner {
    name: String,
    writer: tokio::sync::Mutex<Option<Writer>>,
    routes: Mutex<Routes>,
    slots: Mutex<Vec<Arc<Semaphore>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionInner {
    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, body: &[u8]) {
        let report = match Report::decode(body) {
            Ok(report) => report,
            Err(e) => {
                warn!(session = %self.name, error = %e, "dropping malformed frame");
                return;
            }
        };
        let key = report.route();

        let persistent = self.routes().persistent.get(&key).cloned();
        let mut delivered = false;
        if let Some(handler) = persistent {
            handler(&report);
            delivered = true;
        }

        loop {
            let waiter = self.routes().once.get_mut(&key).and_then(VecDeque::pop_front);
            match waiter {
                Some(tx) => {
                    if tx.send(report.clone()).is_ok() {
                        delivered = true;
                        break;
                    }
                }
                None => break,
            }
        }

        if !delivered {
            debug!(session = %self.name, kind = ?key.0, channel = key.1, "dropping unrouted frame");
        }
    }

    /// Drop every pending one-shot and close every slot so waiters abort.
    fn close_routes(&self) {
        {
            let mut routes = self.routes();
            routes.closed = true;
            let pending: usize = routes.once.values().map(VecDeque::len).sum();
            if pending > 0 {
                info!(session = %self.name, pending, "aborting pending operations");
            }
            routes.once.clear();
            routes.persistent.clear();
        }
        for slot in self.slots.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            slot.close();
        }
    }
}

/// Handle to one open connection. Clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open the serial port named by `descriptor` and start the reader task.
    #[cfg(feature = "tokio_serial")]
    pub async fn open(descriptor: &ConnectionDescriptor) -> ControllerResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(&descriptor.port, descriptor.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ControllerError::Connection {
                port: descriptor.port.clone(),
                reason: e.to_string(),
            })?;

        info!(port = %descriptor.port, baud = descriptor.baud_rate, "serial port opened, waiting for board reset");
        tokio::time::sleep(descriptor.reset_wait).await;

        Ok(Self::from_stream(descriptor.port.clone(), port))
    }

    /// Open the serial port named by `descriptor` (unavailable in this build).
    #[cfg(not(feature = "tokio_serial"))]
    pub async fn open(descriptor: &ConnectionDescriptor) -> ControllerResult<Self> {
        warn!(port = %descriptor.port, "serial transport not compiled in");
        Err(ControllerError::SerialFeatureDisabled)
    }

    /// Wrap an already-open byte stream. Must be called inside a Tokio runtime.
    pub fn from_stream<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(SessionInner {
            name: name.clone(),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            routes: Mutex::new(Routes::default()),
            slots: Mutex::new(Vec::new()),
            reader: Mutex::new(None),
            shutdown_tx,
        });

        let handle = tokio::spawn(read_loop(reader, Arc::downgrade(&inner), shutdown_rx));
        *inner.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(session = %name, "session started");

        Self { inner }
    }

    /// Name of the underlying endpoint.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Write one command frame.
    pub async fn send(&self, command: &Command) -> ControllerResult<()> {
        let frame = command.encode();
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| ControllerError::Connection {
            port: self.inner.name.clone(),
            reason: "session is shut down".into(),
        })?;

        writer.write_all(&frame).await.map_err(ControllerError::Transport)?;
        writer.flush().await.map_err(ControllerError::Transport)?;

        debug!(session = %self.inner.name, command = ?command.id(), bytes = frame.len(), "command sent");
        Ok(())
    }

    /// Install (or replace) the persistent handler for a route.
    pub fn register_handler<F>(&self, kind: FrameKind, channel: u8, handler: F)
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        let mut routes = self.inner.routes();
        if routes.closed {
            warn!(session = %self.inner.name, ?kind, channel, "handler registered on closed session ignored");
            return;
        }
        routes.persistent.insert((kind, channel), Arc::new(handler));
    }

    /// Remove the persistent handler for a route.
    pub fn unregister_handler(&self, kind: FrameKind, channel: u8) -> bool {
        self.inner.routes().persistent.remove(&(kind, channel)).is_some()
    }

    /// Receive the next report on a route exactly once.
    ///
    /// On a closed session the receiver resolves immediately with an error.
    pub fn register_once(&self, kind: FrameKind, channel: u8) -> oneshot::Receiver<Report> {
        let (tx, rx) = oneshot::channel();
        let mut routes = self.inner.routes();
        if !routes.closed {
            routes.once.entry((kind, channel)).or_default().push_back(tx);
        }
        rx
    }

    /// Track a resource-slot semaphore so shutdown can close it.
    pub(crate) fn track_slot(&self, semaphore: Arc<Semaphore>) {
        if self.is_closed() {
            semaphore.close();
        }
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(semaphore);
    }

    /// True once the session was shut down or the link dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.routes().closed
    }

    /// Release the connection and abort every pending operation.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.close_routes();

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(session = %self.inner.name, error = %e, "writer shutdown failed");
            }
        }

        let handle = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!(session = %self.inner.name, "session shut down");
        }
    }
}

async fn read_loop<R>(mut reader: R, inner: Weak<SessionInner>, mut shutdown_rx: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 256];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let Some(inner) = inner.upgrade() else { break };
                match read {
                    Ok(0) => {
                        warn!(session = %inner.name, "link closed by peer");
                        inner.close_routes();
                        break;
                    }
                    Ok(n) => {
                        decoder.extend(&buf[..n]);
                        while let Some(body) = decoder.next_frame() {
                            inner.dispatch(&body);
                        }
                    }
                    Err(e) => {
                        warn!(session = %inner.name, error = %e, "read failed, closing session");
                        inner.close_routes();
                        break;
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_send_writes_whole_frame() {
        let (host, mut board) = duplex(256);
        let session = Session::from_stream("test", host);

        session
            .send(&Command::DigitalWrite { pin: 7, level: true })
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        board.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [3, 2, 7, 1]);
        session.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_do_not_interleave() {
        // a tiny pipe forces every frame to be written in several pieces
        let (host, mut board) = duplex(8);
        let session = Session::from_stream("test", host);

        let mut expected = Vec::new();
        let mut senders = Vec::new();
        for n in 0..8u8 {
            let commands = vec![
                Command::StepperMoveTo {
                    motor: n % 4,
                    position: -1000 * i32::from(n) - 7,
                },
                Command::I2cWrite {
                    port: 0,
                    address: 0x20 + n,
                    data: vec![n; 12],
                },
            ];
            expected.extend(commands.iter().map(|c| c.encode()[1..].to_vec()));
            let session = session.clone();
            senders.push(tokio::spawn(async move {
                for command in &commands {
                    session.send(command).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            let mut buf = [0u8; 5];
            while frames.len() < 16 {
                let n = board.read(&mut buf).await.unwrap();
                assert!(n > 0, "link closed early");
                decoder.extend(&buf[..n]);
                while let Some(body) = decoder.next_frame() {
                    frames.push(body);
                }
            }
            (frames, decoder.pending())
        });

        for sender in senders {
            sender.await.unwrap();
        }
        let (mut frames, leftover) = reader.await.unwrap();
        assert_eq!(leftover, 0);

        frames.sort();
        expected.sort();
        assert_eq!(frames, expected);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_persistent_and_once_routing() {
        let (host, mut board) = duplex(256);
        let session = Session::from_stream("test", host);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        session.register_handler(FrameKind::AnalogReport, 2, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let once = session.register_once(FrameKind::AnalogReport, 2);

        board
            .write_all(&Report::Analog { pin: 2, value: 300 }.encode())
            .await
            .unwrap();
        board
            .write_all(&Report::Analog { pin: 2, value: 301 }.encode())
            .await
            .unwrap();

        let first = once.await.unwrap();
        assert_eq!(first, Report::Analog { pin: 2, value: 300 });

        tokio::time::timeout(Duration::from_secs(1), async {
            while hits.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("persistent handler saw both reports");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrouted_and_garbage_frames_do_not_kill_reader() {
        let (host, mut board) = duplex(256);
        let session = Session::from_stream("test", host);

        // unknown report id, truncated position report, then a real one
        board.write_all(&[3, 42, 1, 2]).await.unwrap();
        board.write_all(&[3, 17, 0, 1]).await.unwrap();
        let once = session.register_once(FrameKind::StepperRunComplete, 1);
        board
            .write_all(&Report::StepperRunComplete { motor: 1 }.encode())
            .await
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(1), once)
            .await
            .expect("reader still alive")
            .unwrap();
        assert_eq!(report, Report::StepperRunComplete { motor: 1 });
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_and_blocks_sends() {
        let (host, _board) = duplex(256);
        let session = Session::from_stream("test", host);
        let pending = session.register_once(FrameKind::StepperPosition, 0);

        session.shutdown().await;
        assert!(pending.await.is_err());
        assert!(session.is_closed());

        let err = session.send(&Command::StepperRun { motor: 0 }).await.unwrap_err();
        assert!(matches!(err, ControllerError::Connection { .. }));

        // second shutdown is a no-op
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_routes() {
        let (host, board) = duplex(256);
        let session = Session::from_stream("test", host);
        let pending = session.register_once(FrameKind::StepperRunComplete, 0);

        drop(board);
        assert!(pending.await.is_err());
        assert!(session.is_closed());
    }

    #[cfg(not(feature = "tokio_serial"))]
    #[tokio::test]
    async fn test_open_without_serial_feature() {
        let result = Session::open(&ConnectionDescriptor::new("/dev/ttyACM0")).await;
        assert!(matches!(result, Err(ControllerError::SerialFeatureDisabled)));
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = ConnectionDescriptor::new("COM3")
            .with_baud_rate(57_600)
            .with_reset_wait(Duration::ZERO);
        assert_eq!(descriptor.port, "COM3");
        assert_eq!(descriptor.baud_rate, 57_600);
        assert_eq!(descriptor.reset_wait, Duration::ZERO);
    }
}
