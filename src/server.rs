//! Server driver for the iperf3 protocol.
//!
//! The accept loop polls the listener so a stop request is seen within
//! one accept-timeout period. Every accepted connection starts with a
//! 37-byte cookie; an unknown cookie opens a new session on that control
//! connection, a known one is routed to its session as a data stream.
//! Session failures are reported and the listener keeps accepting; only
//! listener failures take the server down.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::events::{event_channel, EventStream, EventTx, ServerEvent, ServerHandle};
use crate::measurements::IntervalSample;
use crate::pacer::Pacer;
use crate::params::TestParams;
use crate::protocol::{self, State};
use crate::results::WireResults;
use crate::transport::{self, Listener};

/// Deadline for individual control-channel reads.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a session waits for all declared data streams to connect.
const STREAM_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll period while waiting for data streams.
const STREAM_POLL: Duration = Duration::from_millis(50);

/// Grace past the declared duration before the mirror loop gives up.
const TRANSFER_GRACE: Duration = Duration::from_secs(2);

/// Cap on byte-count tests, which carry no duration of their own.
const BYTE_MODE_CAP: Duration = Duration::from_secs(3600);

/// Server-side protocol engine.
///
/// # Examples
///
/// ```no_run
/// use netgauge::{Server, ServerConfig, ServerEvent};
///
/// # #[tokio::main]
/// # async fn main() -> netgauge::Result<()> {
/// let server = Server::new();
/// let (mut events, handle) = server.start(ServerConfig::new(5201))?;
/// while let Some(event) = events.recv().await {
///     if let ServerEvent::TestComplete { total_bytes, .. } = event {
///         println!("session moved {} bytes", total_bytes);
///     }
/// }
/// # let _ = handle;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    running: Arc<AtomicBool>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Binds the listener and launches the accept loop.
    ///
    /// # Errors
    ///
    /// `Error::AlreadyRunning` when the server is active, or the bind
    /// failure when the port cannot be taken. Neither produces events.
    pub fn start(
        &self,
        config: ServerConfig,
    ) -> Result<(EventStream<ServerEvent>, ServerHandle)> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning("the server is already running".into()));
        }

        let listener = match Listener::bind(&config) {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (tx, stream) = event_channel();
        let handle = ServerHandle::new();
        {
            let mut status = handle.status.write();
            status.running = true;
            status.port = listener.local_addr().port();
        }

        let ctx = ServerCtx {
            config,
            tx,
            token: handle.token.clone(),
            status: handle.status.clone(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        };

        let running = self.running.clone();
        tokio::spawn(async move {
            ctx.accept_loop(listener).await;
            running.store(false, Ordering::SeqCst);
        });

        Ok((stream, handle))
    }
}

/// Shared state of one session, reachable from the accept loop so data
/// connections can be routed to it by cookie.
struct SessionShared {
    data_streams: Mutex<Vec<TcpStream>>,
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<SessionShared>>>>;

struct ServerCtx {
    config: ServerConfig,
    tx: EventTx<ServerEvent>,
    token: CancellationToken,
    status: Arc<parking_lot::RwLock<crate::events::ServerStatus>>,
    sessions: SessionMap,
}

impl ServerCtx {
    async fn accept_loop(self, listener: Listener) {
        let port = listener.local_addr().port();
        self.tx.emit(ServerEvent::Starting { port });
        info!("server listening on {}", listener.local_addr());
        self.tx.emit(ServerEvent::Ready {
            status: self.status.read().clone(),
        });

        loop {
            if self.token.is_cancelled() {
                break;
            }
            match listener.accept().await {
                // Poll period elapsed; re-check the stop flag.
                Ok(None) => continue,
                Ok(Some((stream, addr))) => self.route_connection(stream, addr),
                Err(e) => {
                    warn!("listener failed: {}", e);
                    {
                        let mut status = self.status.write();
                        status.running = false;
                        status.last_error = Some(e.to_string());
                    }
                    self.tx.emit(ServerEvent::Error {
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }

        self.status.write().running = false;
        info!("server stopped");
        self.tx.emit(ServerEvent::Stopped);
    }

    /// Reads the leading cookie off a fresh connection and either attaches
    /// it to its session or starts a new one.
    fn route_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let sessions = self.sessions.clone();
        let tx = self.tx.clone();
        let status = self.status.clone();
        let token = self.token.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let cookie =
                match time::timeout(CONTROL_TIMEOUT, protocol::read_cookie(&mut stream)).await {
                    Ok(Ok(cookie)) => cookie,
                    Ok(Err(e)) => {
                        debug!("dropping {}: bad cookie ({})", addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("dropping {}: no cookie within deadline", addr);
                        return;
                    }
                };

            // Data stream for an existing session? Cookie equality is the
            // association; an unknown cookie opens a session instead.
            {
                let sessions = sessions.lock();
                if let Some(shared) = sessions.get(&cookie) {
                    debug!("data stream for session {} from {}", cookie, addr);
                    shared.data_streams.lock().push(stream);
                    return;
                }
            }

            info!("new session {} from {}", cookie, addr);
            let shared = Arc::new(SessionShared {
                data_streams: Mutex::new(Vec::new()),
            });
            sessions.lock().insert(cookie.clone(), shared.clone());
            {
                let mut status = status.write();
                status.active_sessions += 1;
                status.last_client = Some(addr);
            }
            tx.emit(ServerEvent::ClientConnected { addr });

            let session = Session {
                control: stream,
                addr,
                shared,
                reporting_interval: config.reporting_interval,
                tx: tx.clone(),
                stop: token.child_token(),
            };
            let outcome = session.run().await;

            sessions.lock().remove(&cookie);
            match outcome {
                Ok((total_bytes, duration)) => {
                    {
                        let mut status = status.write();
                        status.active_sessions = status.active_sessions.saturating_sub(1);
                        status.total_bytes += total_bytes;
                    }
                    tx.emit(ServerEvent::TestComplete {
                        total_bytes,
                        duration,
                    });
                }
                Err(e) => {
                    warn!("session {} failed: {}", addr, e);
                    {
                        let mut status = status.write();
                        status.active_sessions = status.active_sessions.saturating_sub(1);
                        status.last_error = Some(e.to_string());
                    }
                    tx.emit(ServerEvent::SessionError {
                        message: e.to_string(),
                    });
                }
            }
            tx.emit(ServerEvent::ClientDisconnected { addr });
        });
    }
}

/// One client session on its control connection.
struct Session {
    control: TcpStream,
    addr: SocketAddr,
    shared: Arc<SessionShared>,
    reporting_interval: Duration,
    tx: EventTx<ServerEvent>,
    stop: CancellationToken,
}

impl Session {
    /// Drives the server half of the state machine. Returns the bytes
    /// moved and the transfer duration.
    async fn run(mut self) -> Result<(u64, Duration)> {
        // Parameter exchange.
        ctrl(protocol::write_state(&mut self.control, State::ParamExchange)).await?;
        let params: TestParams = ctrl(protocol::read_json(&mut self.control)).await?;
        debug!("session {} params: {:?}", self.addr, params);
        if params.udp {
            // Refuse rather than mis-serve: the data path is TCP only.
            let _ = protocol::write_state(&mut self.control, State::ServerError).await;
            return Err(ProtocolError::Other("UDP test requested".into()).into());
        }

        // Let the client open its data streams and wait for all of them.
        ctrl(protocol::write_state(&mut self.control, State::CreateStreams)).await?;
        let expected = params.parallel.max(1) as usize;
        let wait_start = Instant::now();
        while self.shared.data_streams.lock().len() < expected {
            if wait_start.elapsed() > STREAM_WAIT_TIMEOUT {
                return Err(ProtocolError::Other(format!(
                    "only {} of {} data streams connected",
                    self.shared.data_streams.lock().len(),
                    expected
                ))
                .into());
            }
            if self.stop.is_cancelled() {
                return Err(Error::Cancelled);
            }
            time::sleep(STREAM_POLL).await;
        }
        let streams = std::mem::take(&mut *self.shared.data_streams.lock());

        // Transfer phase.
        ctrl(protocol::write_state(&mut self.control, State::TestStart)).await?;
        ctrl(protocol::write_state(&mut self.control, State::TestRunning)).await?;

        let deadline = if params.time > 0 {
            params.duration() + TRANSFER_GRACE
        } else {
            BYTE_MODE_CAP
        };
        let pacer = Arc::new(Pacer::new(if params.reverse { params.bandwidth } else { 0 }));
        let pool = Arc::new(BufferPool::new(params.len.max(1) as usize, streams.len() * 2));
        let samples = Arc::new(Mutex::new(Vec::new()));
        let total_bytes = Arc::new(AtomicU64::new(0));
        let transfer_stop = self.stop.child_token();

        let started = Instant::now();
        let mut tasks = Vec::with_capacity(streams.len());
        for (index, stream) in streams.into_iter().enumerate() {
            let ctx = MirrorCtx {
                stream_id: protocol::stream_id_for_index(index),
                send: params.reverse,
                deadline,
                target_bytes: params.num,
                reporting_interval: self.reporting_interval,
                pacer: pacer.clone(),
                pool: pool.clone(),
                samples: samples.clone(),
                total_bytes: total_bytes.clone(),
                tx: self.tx.clone(),
                stop: transfer_stop.clone(),
            };
            tasks.push(tokio::spawn(ctx.run(stream)));
        }

        // The client announces the end of the data phase on the control
        // connection; EOF there means the same thing.
        let end_read = time::timeout(deadline + CONTROL_TIMEOUT, async {
            protocol::read_state_code(&mut self.control).await
        })
        .await;
        match end_read {
            Ok(Ok(code)) if State::from_code(code) == Some(State::TestEnd) => {
                debug!("session {}: TEST_END", self.addr)
            }
            Ok(Ok(code)) => debug!("session {}: state {} instead of TEST_END", self.addr, code),
            Ok(Err(e)) => debug!("session {}: control closed before TEST_END: {}", self.addr, e),
            Err(_) => warn!("session {}: no TEST_END within deadline", self.addr),
        }
        transfer_stop.cancel();
        for task in tasks {
            let _ = task.await;
        }
        let duration = started.elapsed();
        let total = total_bytes.load(Ordering::Relaxed);

        // Results exchange. The client's document comes first, as in the
        // reference implementation; reading it is best effort.
        ctrl(protocol::write_state(&mut self.control, State::ExchangeResults)).await?;
        match ctrl(protocol::read_json_raw(&mut self.control)).await {
            Ok(raw) => debug!("session {}: client results ({} bytes)", self.addr, raw.len()),
            Err(e) => debug!("session {}: no client results: {}", self.addr, e),
        }
        let samples = samples.lock().clone();
        let results = WireResults::build(
            &params,
            &samples,
            total,
            duration.as_secs_f64(),
            params.reverse,
        );
        ctrl(protocol::write_json(&mut self.control, &results)).await?;

        // Closing cues: cue the client to render, collect its IPERF_DONE,
        // and answer in kind. The client may already be gone.
        if let Err(e) = protocol::write_state(&mut self.control, State::DisplayResults).await {
            debug!("session {}: could not send DISPLAY_RESULTS: {}", self.addr, e);
        }
        match time::timeout(
            Duration::from_secs(5),
            protocol::read_state_code(&mut self.control),
        )
        .await
        {
            Ok(Ok(code)) => debug!("session {}: closing state {}", self.addr, code),
            Ok(Err(e)) => debug!("session {}: client closed early: {}", self.addr, e),
            Err(_) => debug!("session {}: no IPERF_DONE from client", self.addr),
        }
        if let Err(e) = protocol::write_state(&mut self.control, State::IperfDone).await {
            debug!("session {}: could not send IPERF_DONE: {}", self.addr, e);
        }
        let _ = self.control.shutdown().await;

        info!(
            "session {} finished: {} bytes in {:.1}s",
            self.addr,
            total,
            duration.as_secs_f64()
        );
        Ok((total, duration))
    }
}

/// Wraps a control operation in the standard deadline.
async fn ctrl<T>(op: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match time::timeout(CONTROL_TIMEOUT, op).await {
        Ok(inner) => inner,
        Err(_) => Err(Error::Timeout(
            "control channel operation exceeded its deadline".into(),
        )),
    }
}

/// Mirror half of one data stream: sends when the client asked for
/// reverse mode, receives otherwise.
struct MirrorCtx {
    stream_id: i32,
    send: bool,
    deadline: Duration,
    /// Byte target; zero means the duration governs.
    target_bytes: u64,
    reporting_interval: Duration,
    pacer: Arc<Pacer>,
    pool: Arc<BufferPool>,
    samples: Arc<Mutex<Vec<IntervalSample>>>,
    total_bytes: Arc<AtomicU64>,
    tx: EventTx<ServerEvent>,
    stop: CancellationToken,
}

impl MirrorCtx {
    async fn run(self, stream: TcpStream) {
        if let Err(e) = transport::configure_stream(&stream, true, None, None) {
            debug!("stream {}: could not set options: {}", self.stream_id, e);
        }
        if self.send {
            self.send_loop(stream).await;
        } else {
            self.receive_loop(stream).await;
        }
    }

    fn target_reached(&self) -> bool {
        self.target_bytes > 0 && self.total_bytes.load(Ordering::Relaxed) >= self.target_bytes
    }

    fn emit_sample(&self, start_secs: f64, elapsed: Duration, bytes: u64) {
        let sample = IntervalSample::new(self.stream_id, start_secs, elapsed.as_secs_f64(), bytes);
        let mut samples = self.samples.lock();
        samples.push(sample.clone());
        self.tx.emit(ServerEvent::TestRunning { sample });
    }

    async fn send_loop(self, mut stream: TcpStream) {
        let buffer = self.pool.get();
        let start = Instant::now();
        let mut interval_bytes = 0u64;
        let mut interval_start = 0.0f64;
        let mut next_boundary = self.reporting_interval;

        loop {
            let elapsed = start.elapsed();
            if self.stop.is_cancelled() || elapsed >= self.deadline || self.target_reached() {
                break;
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.pacer.acquire(buffer.len()) => {}
            }

            let written = tokio::select! {
                _ = self.stop.cancelled() => break,
                result = stream.write(&buffer) => match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("stream {}: send ended: {}", self.stream_id, e);
                        break;
                    }
                },
            };
            interval_bytes += written as u64;
            self.total_bytes.fetch_add(written as u64, Ordering::Relaxed);

            let elapsed = start.elapsed();
            if elapsed >= next_boundary {
                self.emit_sample(interval_start, elapsed, interval_bytes);
                interval_bytes = 0;
                interval_start = elapsed.as_secs_f64();
                let periods = (elapsed.as_secs_f64() / self.reporting_interval.as_secs_f64())
                    .floor() as u32
                    + 1;
                next_boundary = self.reporting_interval * periods;
            }
        }

        let elapsed = start.elapsed();
        if interval_bytes > 0 && elapsed.as_secs_f64() > interval_start {
            self.emit_sample(interval_start, elapsed, interval_bytes);
        }
        let _ = stream.flush().await;
        self.pool.put(buffer);
    }

    async fn receive_loop(self, mut stream: TcpStream) {
        let mut buffer = self.pool.get();
        let start = Instant::now();
        let mut interval_bytes = 0u64;
        let mut interval_start = 0.0f64;
        let mut next_boundary = self.reporting_interval;

        loop {
            let elapsed = start.elapsed();
            if self.stop.is_cancelled() || elapsed >= self.deadline || self.target_reached() {
                break;
            }

            let received = tokio::select! {
                _ = self.stop.cancelled() => break,
                result = stream.read(&mut buffer) => match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("stream {}: receive ended: {}", self.stream_id, e);
                        break;
                    }
                },
            };
            interval_bytes += received as u64;
            self.total_bytes.fetch_add(received as u64, Ordering::Relaxed);

            let elapsed = start.elapsed();
            if elapsed >= next_boundary {
                self.emit_sample(interval_start, elapsed, interval_bytes);
                interval_bytes = 0;
                interval_start = elapsed.as_secs_f64();
                let periods = (elapsed.as_secs_f64() / self.reporting_interval.as_secs_f64())
                    .floor() as u32
                    + 1;
                next_boundary = self.reporting_interval * periods;
            }
        }

        let elapsed = start.elapsed();
        if interval_bytes > 0 && elapsed.as_secs_f64() > interval_start {
            self.emit_sample(interval_start, elapsed, interval_bytes);
        }
        self.pool.put(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;

    fn loopback_config() -> ServerConfig {
        let mut config = ServerConfig::new(0);
        config.bind_addr = Some("127.0.0.1".parse().unwrap());
        config.accept_timeout = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let server = Server::new();
        let (mut events, handle) = server.start(loopback_config()).unwrap();
        assert!(server.is_running());

        let first = events.recv().await.unwrap();
        assert!(matches!(first, ServerEvent::Starting { .. }));
        let second = events.recv().await.unwrap();
        match second {
            ServerEvent::Ready { status } => {
                assert!(status.running);
                assert_ne!(status.port, 0);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        handle.stop();
        loop {
            match events.recv().await {
                Some(ServerEvent::Stopped) => break,
                Some(_) => continue,
                None => panic!("stream ended without Stopped"),
            }
        }
        assert!(!handle.status().running);
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let server = Server::new();
        let (_events, handle) = server.start(loopback_config()).unwrap();
        let err = server.start(loopback_config()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
        handle.stop();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_synchronous() {
        let server_a = Server::new();
        let (_events, handle) = server_a.start(loopback_config()).unwrap();
        let port = handle.status().port;

        let server_b = Server::new();
        let mut config = loopback_config();
        config.port = port;
        let err = server_b.start(config).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!server_b.is_running());
        handle.stop();
    }

    #[tokio::test]
    async fn test_connection_without_cookie_is_dropped() {
        let server = Server::new();
        let (mut events, handle) = server.start(loopback_config()).unwrap();
        let port = handle.status().port;

        // Connect and close without sending a cookie; the server must keep
        // accepting afterwards.
        let sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drop(sock);
        time::sleep(Duration::from_millis(100)).await;

        let sock = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drop(sock);

        handle.stop();
        let mut stopped = false;
        while let Some(event) = events.recv().await {
            if matches!(event, ServerEvent::Stopped) {
                stopped = true;
            }
        }
        assert!(stopped);
    }
}
