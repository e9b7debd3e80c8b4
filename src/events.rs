//! Progress events, event streams, and cancellation handles.
//!
//! Each test produces a lazy single-subscriber sequence of [`TestEvent`]s
//! ending in exactly one terminal variant; the server produces the
//! analogous [`ServerEvent`] sequence. Delivery rides an unbounded mpsc
//! channel, so the protocol never blocks on a slow consumer and terminal
//! events are never lost.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TestConfig;
use crate::measurements::{IntervalSample, TestResult};

/// Progress events of a client test, in emission order.
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// No test activity yet.
    Idle,

    /// Control connect in flight.
    Connecting { host: String, port: u16 },

    /// Control connection established and cookie written.
    Connected {
        server_version: Option<String>,
        cookie: String,
    },

    /// Transfer phase opened.
    Started {
        config: Box<TestConfig>,
        started_at: SystemTime,
    },

    /// One reporting slice of one stream.
    Interval {
        sample: IntervalSample,
        elapsed: Duration,
        /// Fraction of the test completed, clamped to `0.0..=1.0`.
        progress: f64,
    },

    /// Terminal: the test ran to completion.
    Complete { result: Box<TestResult> },

    /// Terminal: the test failed; any samples collected so far ride along.
    Error {
        message: String,
        partial: Option<Box<TestResult>>,
    },

    /// Terminal: the caller aborted the test.
    Cancelled { partial: Option<Box<TestResult>> },
}

impl TestEvent {
    /// True for the three variants that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestEvent::Complete { .. } | TestEvent::Error { .. } | TestEvent::Cancelled { .. }
        )
    }
}

/// Observable state of the server component.
#[derive(Debug, Clone, Default)]
pub struct ServerStatus {
    pub running: bool,
    pub port: u16,
    pub active_sessions: usize,
    pub total_bytes: u64,
    pub last_client: Option<SocketAddr>,
    pub last_error: Option<String>,
}

/// Progress events of the server role.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Starting { port: u16 },

    /// Listener bound and accepting.
    Ready { status: ServerStatus },

    ClientConnected { addr: SocketAddr },

    /// One reporting slice of an active session's transfer.
    TestRunning { sample: IntervalSample },

    TestComplete { total_bytes: u64, duration: Duration },

    ClientDisconnected { addr: SocketAddr },

    /// A session failed; the listener keeps accepting.
    SessionError { message: String },

    /// Terminal: the listener failed.
    Error { message: String },

    /// Terminal: the server was stopped.
    Stopped,
}

/// Receiving end of an event sequence.
///
/// # Examples
///
/// ```no_run
/// use netgauge::{Client, TestConfig, TestEvent};
///
/// # async fn example() -> netgauge::Result<()> {
/// let client = Client::new();
/// let (mut events, _handle) = client.start(TestConfig::new("10.0.0.1", 5201))?;
/// while let Some(event) = events.recv().await {
///     if let TestEvent::Interval { sample, .. } = &event {
///         println!("{:.1} Mbps", sample.bits_per_second / 1e6);
///     }
///     if event.is_terminal() {
///         break;
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> EventStream<E> {
    /// Waits for the next event. `None` once the producer is gone and the
    /// buffer is drained, which is only after a terminal event.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

/// Sending side; cloned into the driver and its stream tasks.
pub(crate) struct EventTx<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventTx<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventTx<E> {
    /// Emits an event; a consumer that dropped its stream is not an error.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

pub(crate) fn event_channel<E>() -> (EventTx<E>, EventStream<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventTx { tx }, EventStream { rx })
}

/// Handle for aborting a running client test.
///
/// Cancellation sets the flag the transfer loops poll and wakes every
/// suspended I/O operation; the stream then ends with a `Cancelled` event
/// carrying whatever samples were collected.
#[derive(Clone, Debug)]
pub struct TestHandle {
    pub(crate) token: CancellationToken,
}

impl TestHandle {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Requests the abort. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Handle for stopping a running server and observing its status.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    pub(crate) token: CancellationToken,
    pub(crate) status: Arc<parking_lot::RwLock<ServerStatus>>,
}

impl ServerHandle {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            status: Arc::new(parking_lot::RwLock::new(ServerStatus::default())),
        }
    }

    /// Requests shutdown; the accept loop exits at its next poll.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Snapshot of the current server status.
    pub fn status(&self) -> ServerStatus {
        self.status.read().clone()
    }
}
