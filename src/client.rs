//! Client driver for the iperf3 protocol.
//!
//! One pass of [`Client::start`] runs the full bilateral state machine:
//! control handshake, parameter exchange, data-stream setup, the timed
//! transfer with one task per stream, and the final results exchange.
//! Progress is reported through the returned [`EventStream`]; the
//! [`TestHandle`] aborts the test from any other task.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::config::TestConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::events::{event_channel, EventStream, EventTx, TestEvent, TestHandle};
use crate::measurements::{aggregate, IntervalSample, QualityScorer};
use crate::pacer::Pacer;
use crate::params::TestParams;
use crate::protocol::{self, State};
use crate::results::WireResults;
use crate::transport;

/// Deadline for individual control-channel reads.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace added to the configured duration for receive-mode data reads.
const RECEIVE_GRACE: Duration = Duration::from_secs(5);

/// Client-side protocol engine.
///
/// The engine is a value owned by its caller and runs at most one test at
/// a time; starting a second while one is in flight fails synchronously.
///
/// # Examples
///
/// ```no_run
/// use netgauge::{Client, TestConfig, TestEvent};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> netgauge::Result<()> {
/// let client = Client::new();
/// let config = TestConfig::new("192.168.1.10", 5201)
///     .with_duration(Duration::from_secs(10));
///
/// let (mut events, handle) = client.start(config)?;
/// while let Some(event) = events.recv().await {
///     match event {
///         TestEvent::Complete { result } => {
///             println!("{:.1} Mbps", result.avg_bandwidth / 1e6);
///         }
///         TestEvent::Error { message, .. } => eprintln!("failed: {}", message),
///         _ => {}
///     }
/// }
/// # let _ = handle;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    running: Arc<AtomicBool>,
    scorer: Option<Arc<dyn QualityScorer>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            scorer: None,
        }
    }

    /// Attaches a quality scorer consulted when building the final result.
    pub fn with_scorer<S: QualityScorer + 'static>(mut self, scorer: S) -> Self {
        self.scorer = Some(Arc::new(scorer));
        self
    }

    /// Whether a test is currently in flight on this engine.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validates the configuration and launches the test.
    ///
    /// Returns the event stream and the cancellation handle. The driver
    /// runs on a spawned task; the stream ends with exactly one terminal
    /// event.
    ///
    /// # Errors
    ///
    /// `Error::Config` when validation fails and `Error::AlreadyRunning`
    /// when a test is already in flight; neither produces any event.
    pub fn start(&self, config: TestConfig) -> Result<(EventStream<TestEvent>, TestHandle)> {
        config.validate()?;

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning(
                "a client test is already in flight".into(),
            ));
        }

        let (tx, stream) = event_channel();
        let handle = TestHandle::new();
        let driver = Driver {
            config,
            tx,
            token: handle.token.clone(),
            samples: Arc::new(Mutex::new(Vec::new())),
            total_bytes: Arc::new(AtomicU64::new(0)),
            scorer: self.scorer.clone(),
        };

        let running = self.running.clone();
        tokio::spawn(async move {
            driver.drive().await;
            running.store(false, Ordering::SeqCst);
        });

        Ok((stream, handle))
    }
}

struct Driver {
    config: TestConfig,
    tx: EventTx<TestEvent>,
    token: CancellationToken,
    samples: Arc<Mutex<Vec<IntervalSample>>>,
    total_bytes: Arc<AtomicU64>,
    scorer: Option<Arc<dyn QualityScorer>>,
}

impl Driver {
    /// Runs the state machine and emits the one terminal event.
    async fn drive(self) {
        let outcome = self.run().await;

        let samples = std::mem::take(&mut *self.samples.lock());
        let scorer = self.scorer.as_deref();

        match outcome {
            Ok(raw_json) => {
                let result = aggregate(&self.config, samples, raw_json, true, scorer);
                info!(
                    "test complete: {} bytes, {:.2} Mbps",
                    result.total_bytes,
                    result.avg_bandwidth / 1e6
                );
                self.tx.emit(TestEvent::Complete {
                    result: Box::new(result),
                });
            }
            Err(Error::Cancelled) => {
                info!("test cancelled");
                let partial = if samples.is_empty() {
                    None
                } else {
                    Some(Box::new(aggregate(
                        &self.config,
                        samples,
                        None,
                        false,
                        scorer,
                    )))
                };
                self.tx.emit(TestEvent::Cancelled { partial });
            }
            Err(e) => {
                warn!("test failed: {}", e);
                let partial = if samples.is_empty() {
                    None
                } else {
                    Some(Box::new(aggregate(
                        &self.config,
                        samples,
                        None,
                        false,
                        scorer,
                    )))
                };
                self.tx.emit(TestEvent::Error {
                    message: e.to_string(),
                    partial,
                });
            }
        }
    }

    async fn run(&self) -> Result<Option<String>> {
        let config = &self.config;

        // Control connect.
        self.tx.emit(TestEvent::Connecting {
            host: config.server_host.clone(),
            port: config.server_port,
        });
        let mut control = self
            .cancellable(transport::connect(
                &config.server_host,
                config.server_port,
                config.timeout,
            ))
            .await?;
        transport::configure_stream(&control, true, config.window_size, None)?;

        // Cookie first, before any other traffic.
        let cookie = protocol::generate_cookie();
        self.control_op(protocol::write_cookie(&mut control, &cookie))
            .await?;
        self.tx.emit(TestEvent::Connected {
            server_version: None,
            cookie: cookie.clone(),
        });

        // Parameter exchange.
        self.expect_state(&mut control, State::ParamExchange).await?;
        let params = TestParams::from_config(config);
        self.control_op(protocol::write_json(&mut control, &params))
            .await?;

        // Data streams.
        self.expect_state(&mut control, State::CreateStreams).await?;
        let mut data_streams = Vec::with_capacity(config.num_streams);
        for _ in 0..config.num_streams {
            let mut stream = self
                .cancellable(transport::connect(
                    &config.server_host,
                    config.server_port,
                    config.timeout,
                ))
                .await?;
            transport::configure_stream(&stream, config.no_delay, config.window_size, config.mss)?;
            self.control_op(protocol::write_cookie(&mut stream, &cookie))
                .await?;
            data_streams.push(stream);
        }

        self.expect_state(&mut control, State::TestStart).await?;
        self.tx.emit(TestEvent::Started {
            config: Box::new(config.clone()),
            started_at: SystemTime::now(),
        });
        self.expect_state(&mut control, State::TestRunning).await?;

        // Transfer phase: one task per stream sharing the pacer, the
        // buffer pool, and the sample list.
        let pacer = Arc::new(Pacer::new(config.bandwidth.unwrap_or(0)));
        let pool = Arc::new(BufferPool::new(config.buffer_len, config.num_streams * 2));
        let mut tasks = Vec::with_capacity(data_streams.len());
        for (index, stream) in data_streams.into_iter().enumerate() {
            let ctx = StreamCtx {
                stream_id: protocol::stream_id_for_index(index),
                receive: config.reverse,
                duration: config.duration,
                target_bytes: config.bytes_to_transfer,
                reporting_interval: config.reporting_interval,
                pacer: pacer.clone(),
                pool: pool.clone(),
                samples: self.samples.clone(),
                total_bytes: self.total_bytes.clone(),
                tx: self.tx.clone(),
                token: self.token.clone(),
            };
            tasks.push(tokio::spawn(ctx.run(stream)));
        }

        let mut failure: Option<Error> = None;
        for task in tasks {
            let joined = task.await.unwrap_or_else(|e| {
                Err(Error::Protocol(ProtocolError::Other(format!(
                    "stream task failed: {}",
                    e
                ))))
            });
            if let Err(e) = joined {
                if e.is_cancelled() || failure.is_none() {
                    let cancelled = e.is_cancelled();
                    failure = Some(e);
                    if cancelled {
                        break;
                    }
                }
            }
        }
        if let Some(e) = failure {
            if e.is_cancelled() {
                // Best-effort courtesy to the peer before tearing down.
                let _ = time::timeout(
                    Duration::from_millis(200),
                    protocol::write_state(&mut control, State::ClientTerminate),
                )
                .await;
            }
            return Err(e);
        }

        // Announce the end of the data phase.
        self.control_op(protocol::write_state(&mut control, State::TestEnd))
            .await?;

        // Results exchange. The reference implementation has the client
        // send its document first and the server answer with its own;
        // deviating deadlocks both peers in a blocking read.
        self.expect_state(&mut control, State::ExchangeResults)
            .await?;
        let samples = self.samples.lock().clone();
        let total = self.total_bytes.load(Ordering::Relaxed);
        let duration_secs = samples.iter().map(|s| s.end_secs).fold(0.0f64, f64::max);
        let mine = WireResults::build(&params, &samples, total, duration_secs, !config.reverse);
        if let Err(e) = self.control_op(protocol::write_json(&mut control, &mine)).await {
            debug!("could not send results document: {}", e);
        }

        let raw = self
            .control_op(protocol::read_json_raw(&mut control))
            .await?;
        let raw_json = match serde_json::from_slice::<serde_json::Value>(&raw) {
            Ok(_) => String::from_utf8_lossy(&raw).into_owned(),
            Err(e) => {
                debug!("peer sent malformed results ({}), substituting empty", e);
                "{}".to_string()
            }
        };

        // The session is semantically complete; everything past here is
        // tolerated if missing. The server cues DISPLAY_RESULTS, we answer
        // IPERF_DONE, and a well-behaved server echoes it before closing.
        match self
            .control_op(protocol::read_state_code(&mut control))
            .await
        {
            Ok(code) => {
                debug!("post-exchange state {}", code);
                if let Err(e) = self
                    .control_op(protocol::write_state(&mut control, State::IperfDone))
                    .await
                {
                    debug!("could not send IPERF_DONE: {}", e);
                } else if let Ok(code) = self
                    .control_op(protocol::read_state_code(&mut control))
                    .await
                {
                    debug!("closing state {}", code);
                }
            }
            Err(e) => debug!("missing DISPLAY_RESULTS from server: {}", e),
        }

        Ok(Some(raw_json))
    }

    /// Races a future against cancellation.
    async fn cancellable<T>(
        &self,
        op: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = self.token.cancelled() => Err(Error::Cancelled),
            result = op => result,
        }
    }

    /// A control-channel operation: cancellable with a 30 s deadline.
    async fn control_op<T>(
        &self,
        op: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = self.token.cancelled() => Err(Error::Cancelled),
            result = time::timeout(CONTROL_TIMEOUT, op) => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout(
                    "control channel read exceeded its deadline".into(),
                )),
            },
        }
    }

    /// Reads one state byte and requires it to be `expected`, mapping the
    /// peer's refusal codes onto distinct errors.
    async fn expect_state(&self, control: &mut TcpStream, expected: State) -> Result<()> {
        let code = self
            .control_op(protocol::read_state_code(control))
            .await?;
        match State::from_code(code) {
            Some(state) if state == expected => Ok(()),
            Some(State::AccessDenied) => Err(ProtocolError::AccessDenied.into()),
            Some(State::ServerError) => Err(ProtocolError::ServerError.into()),
            Some(State::ServerTerminate) => Err(ProtocolError::ServerTerminate.into()),
            Some(other) => Err(Error::unexpected_state(other)),
            None => Err(Error::unexpected_state(format!("code {}", code))),
        }
    }
}

/// Everything one data-stream task needs.
struct StreamCtx {
    stream_id: i32,
    receive: bool,
    duration: Duration,
    target_bytes: Option<u64>,
    reporting_interval: Duration,
    pacer: Arc<Pacer>,
    pool: Arc<BufferPool>,
    samples: Arc<Mutex<Vec<IntervalSample>>>,
    total_bytes: Arc<AtomicU64>,
    tx: EventTx<TestEvent>,
    token: CancellationToken,
}

impl StreamCtx {
    async fn run(self, stream: TcpStream) -> Result<()> {
        if self.receive {
            self.receive_loop(stream).await
        } else {
            self.send_loop(stream).await
        }
    }

    fn done(&self, elapsed: Duration) -> bool {
        match self.target_bytes {
            Some(target) => self.total_bytes.load(Ordering::Relaxed) >= target,
            None => elapsed >= self.duration,
        }
    }

    fn progress(&self, elapsed: Duration) -> f64 {
        match self.target_bytes {
            Some(target) => {
                (self.total_bytes.load(Ordering::Relaxed) as f64 / target as f64).clamp(0.0, 1.0)
            }
            None => (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0),
        }
    }

    /// Records and emits one interval slice.
    fn emit_sample(&self, start_secs: f64, elapsed: Duration, bytes: u64) {
        let sample = IntervalSample::new(self.stream_id, start_secs, elapsed.as_secs_f64(), bytes);
        // Lock spans the push and the emit so the stored order and the
        // emitted order are the same list.
        let mut samples = self.samples.lock();
        samples.push(sample.clone());
        self.tx.emit(TestEvent::Interval {
            sample,
            elapsed,
            progress: self.progress(elapsed),
        });
    }

    async fn send_loop(self, mut stream: TcpStream) -> Result<()> {
        let buffer = self.pool.get();
        let start = Instant::now();
        let mut interval_bytes = 0u64;
        let mut interval_start = 0.0f64;
        let mut next_boundary = self.reporting_interval;

        loop {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let elapsed = start.elapsed();
            if self.done(elapsed) {
                break;
            }

            // Lenient deadline policy: the pacer wait may carry one write
            // past the end of the test.
            tokio::select! {
                _ = self.token.cancelled() => return Err(Error::Cancelled),
                _ = self.pacer.acquire(buffer.len()) => {}
            }

            let written = tokio::select! {
                _ = self.token.cancelled() => return Err(Error::Cancelled),
                result = stream.write(&buffer) => result?,
            };
            if written == 0 {
                break;
            }
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

        stream.flush().await?;
        self.pool.put(buffer);
        Ok(())
    }

    async fn receive_loop(self, mut stream: TcpStream) -> Result<()> {
        let mut buffer = self.pool.get();
        let read_timeout = self.duration + RECEIVE_GRACE;
        let start = Instant::now();
        let mut interval_bytes = 0u64;
        let mut interval_start = 0.0f64;
        let mut next_boundary = self.reporting_interval;

        loop {
            if self.token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let elapsed = start.elapsed();
            if self.done(elapsed) {
                break;
            }

            let read = tokio::select! {
                _ = self.token.cancelled() => return Err(Error::Cancelled),
                result = time::timeout(read_timeout, stream.read(&mut buffer)) => result,
            };
            let received = match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    debug!("stream {} read timed out, ending receive", self.stream_id);
                    break;
                }
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
        Ok(())
    }
}
