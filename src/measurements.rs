//! Interval samples and end-of-test aggregation.
//!
//! The transfer loops emit one [`IntervalSample`] per reporting slice per
//! stream; when the test reaches a terminal state the accumulated samples
//! are folded into a single [`TestResult`].

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::TestConfig;

/// Stream id marking an aggregate across all streams.
pub const AGGREGATE_STREAM_ID: i32 = -1;

/// TCP statistics attached to a sample when the platform exposes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TcpSampleStats {
    pub retransmits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_window: Option<u64>,
}

/// UDP statistics attached to a sample. Present for the data model only;
/// the transfer engine does not drive UDP yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UdpSampleStats {
    pub jitter_ms: f64,
    pub packets: u64,
    pub lost_packets: u64,
    pub out_of_order_packets: u64,
}

/// A single reporting slice for one stream.
///
/// Times are seconds relative to the start of the transfer phase, with
/// `start_secs < end_secs`. A `stream_id` of [`AGGREGATE_STREAM_ID`] marks
/// a slice summed across streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntervalSample {
    pub stream_id: i32,
    pub start_secs: f64,
    pub end_secs: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpSampleStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpSampleStats>,
}

impl IntervalSample {
    /// Creates a sample, deriving the rate from bytes over the slice span.
    pub fn new(stream_id: i32, start_secs: f64, end_secs: f64, bytes: u64) -> Self {
        let seconds = end_secs - start_secs;
        let bits_per_second = if seconds > 0.0 {
            bytes as f64 * 8.0 / seconds
        } else {
            0.0
        };
        Self {
            stream_id,
            start_secs,
            end_secs,
            bytes,
            bits_per_second,
            tcp: None,
            udp: None,
        }
    }

    pub fn with_tcp(mut self, tcp: TcpSampleStats) -> Self {
        self.tcp = Some(tcp);
        self
    }
}

/// Aggregate TCP statistics over a whole test.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TcpAggregate {
    pub retransmits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_congestion_window: Option<u64>,
}

/// Aggregate UDP statistics over a whole test.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UdpAggregate {
    pub jitter_ms: f64,
    pub packets: u64,
    pub lost_packets: u64,
    pub out_of_order_packets: u64,
}

/// Terminal record of one test.
///
/// Created exactly once, in the `Complete`, `Error`, or `Cancelled`
/// transition (the latter two carry it as a partial result).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Free-form label, empty unless the caller set a title.
    pub name: String,

    pub host: String,
    pub port: u16,

    /// Unix seconds when the result was produced.
    pub timestamp: i64,

    pub protocol: crate::Protocol,
    pub reverse: bool,
    pub bidirectional: bool,

    /// Whether the test ran to normal completion.
    pub success: bool,

    /// Sum of bytes over all interval samples.
    pub total_bytes: u64,

    /// Span from first to last observed interval; the configured duration
    /// when no samples were collected.
    pub duration: Duration,

    /// Mean of per-sample rates, bits per second.
    pub avg_bandwidth: f64,
    pub min_bandwidth: f64,
    pub max_bandwidth: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpAggregate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpAggregate>,

    /// Derived 0..100 score; 0 when no scorer was supplied.
    pub quality_score: u8,

    /// Every emitted sample, in emission order.
    pub intervals: Vec<IntervalSample>,

    /// The peer's results document verbatim, for fidelity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_json: Option<String>,
}

/// Computes a 0..100 quality score from a finished result.
///
/// Scoring is policy, so the engine treats it as a pluggable collaborator;
/// any closure with the right shape qualifies.
///
/// # Examples
///
/// ```
/// use netgauge::measurements::{QualityScorer, TestResult};
///
/// let scorer = |result: &TestResult| {
///     if result.min_bandwidth > 0.8 * result.avg_bandwidth { 100 } else { 50 }
/// };
/// let _: &dyn QualityScorer = &scorer;
/// ```
pub trait QualityScorer: Send + Sync {
    fn score(&self, result: &TestResult) -> u8;
}

impl<F> QualityScorer for F
where
    F: Fn(&TestResult) -> u8 + Send + Sync,
{
    fn score(&self, result: &TestResult) -> u8 {
        self(result)
    }
}

/// Folds the emitted samples into the terminal [`TestResult`].
///
/// Totals sum over all samples; bandwidth statistics are taken across the
/// per-sample rates; the duration spans the first to the last observed
/// interval and falls back to the configured duration for an empty list.
pub fn aggregate(
    config: &TestConfig,
    intervals: Vec<IntervalSample>,
    raw_json: Option<String>,
    success: bool,
    scorer: Option<&dyn QualityScorer>,
) -> TestResult {
    let total_bytes: u64 = intervals.iter().map(|s| s.bytes).sum();

    let (avg, min, max) = if intervals.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let sum: f64 = intervals.iter().map(|s| s.bits_per_second).sum();
        let min = intervals
            .iter()
            .map(|s| s.bits_per_second)
            .fold(f64::INFINITY, f64::min);
        let max = intervals
            .iter()
            .map(|s| s.bits_per_second)
            .fold(0.0f64, f64::max);
        (sum / intervals.len() as f64, min, max)
    };

    let duration = if intervals.is_empty() {
        config.duration
    } else {
        let first = intervals
            .iter()
            .map(|s| s.start_secs)
            .fold(f64::INFINITY, f64::min);
        let last = intervals.iter().map(|s| s.end_secs).fold(0.0f64, f64::max);
        Duration::from_secs_f64((last - first).max(0.0))
    };

    let retransmits: u64 = intervals
        .iter()
        .filter_map(|s| s.tcp.as_ref())
        .map(|t| t.retransmits)
        .sum();
    let max_cwnd = intervals
        .iter()
        .filter_map(|s| s.tcp.as_ref().and_then(|t| t.congestion_window))
        .max();
    let tcp = if config.protocol == crate::Protocol::Tcp {
        Some(TcpAggregate {
            retransmits,
            max_congestion_window: max_cwnd,
        })
    } else {
        None
    };

    let mut result = TestResult {
        name: String::new(),
        host: config.server_host.clone(),
        port: config.server_port,
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        protocol: config.protocol,
        reverse: config.reverse,
        bidirectional: config.bidirectional,
        success,
        total_bytes,
        duration,
        avg_bandwidth: avg,
        min_bandwidth: min,
        max_bandwidth: max,
        tcp,
        udp: None,
        quality_score: 0,
        intervals,
        raw_json,
    };
    if let Some(scorer) = scorer {
        result.quality_score = scorer.score(&result).min(100);
    }
    result
}
