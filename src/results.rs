//! The iperf3 results document exchanged at end of test.
//!
//! Both peers send one of these during `EXCHANGE_RESULTS`. Peers in the
//! wild produce anything from a bare `{}` to the full document with
//! connection lists and CPU statistics, so every field here is optional or
//! defaulted on parse; what we produce is the minimal document a stock
//! iperf3 can render.

use serde::{Deserialize, Serialize};

use crate::measurements::IntervalSample;
use crate::params::TestParams;

/// Per-stream statistics block, used for intervals and end summaries alike.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireStreamStat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<i32>,

    #[serde(default)]
    pub start: f64,

    #[serde(default)]
    pub end: f64,

    #[serde(default)]
    pub seconds: f64,

    #[serde(default)]
    pub bytes: u64,

    #[serde(default)]
    pub bits_per_second: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snd_cwnd: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lost_percent: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omitted: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<bool>,
}

impl WireStreamStat {
    fn from_span(socket: i32, start: f64, end: f64, bytes: u64, sender: bool) -> Self {
        let seconds = (end - start).max(0.0);
        let bits_per_second = if seconds > 0.0 {
            bytes as f64 * 8.0 / seconds
        } else {
            0.0
        };
        Self {
            socket: Some(socket),
            start,
            end,
            seconds,
            bytes,
            bits_per_second,
            sender: Some(sender),
            ..Default::default()
        }
    }
}

/// One entry of the `connected` list in the start section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireConnected {
    #[serde(default)]
    pub socket: i32,

    #[serde(default)]
    pub local_host: String,

    #[serde(default)]
    pub local_port: u16,

    #[serde(default)]
    pub remote_host: String,

    #[serde(default)]
    pub remote_port: u16,
}

/// `test_start` block inside the start section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireTestStart {
    #[serde(default)]
    pub protocol: String,

    #[serde(default)]
    pub num_streams: u32,

    #[serde(default)]
    pub blksize: u32,

    #[serde(default)]
    pub omit: u32,

    #[serde(default)]
    pub duration: u64,

    #[serde(default)]
    pub bytes: u64,

    #[serde(default)]
    pub blocks: u64,

    #[serde(default)]
    pub reverse: i32,
}

/// Start section of the results document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireStart {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connected: Vec<WireConnected>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_info: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cookie: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_start: Option<WireTestStart>,
}

/// One interval slice: per-stream rows plus their sum.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireInterval {
    #[serde(default)]
    pub streams: Vec<WireStreamStat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<WireStreamStat>,
}

/// Sender/receiver pair for one stream in the end section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEndStream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<WireStreamStat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<WireStreamStat>,
}

/// End section of the results document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEnd {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<WireEndStream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum_sent: Option<WireStreamStat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum_received: Option<WireStreamStat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<WireStreamStat>,
}

/// The complete results document.
///
/// # Examples
///
/// ```
/// use netgauge::results::WireResults;
///
/// // A bare object is a valid, empty document.
/// let empty = WireResults::parse_lossy(b"{}");
/// assert!(empty.intervals.is_empty());
///
/// // Garbage degrades to the same empty document instead of failing.
/// let garbage = WireResults::parse_lossy(b"\xff\xfe not json");
/// assert!(garbage.end.sum_received.is_none());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireResults {
    #[serde(default)]
    pub start: WireStart,

    #[serde(default)]
    pub intervals: Vec<WireInterval>,

    #[serde(default)]
    pub end: WireEnd,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireResults {
    /// Parses a peer's document, degrading to the empty document on any
    /// malformed payload. The exchange is best-effort by then; a peer that
    /// sends garbage should not fail a test that already moved its bytes.
    pub fn parse_lossy(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_default()
    }

    /// Total received bytes claimed by the peer, preferring the explicit
    /// receive sum and falling back to the direction-less `sum`.
    pub fn received_bytes(&self) -> Option<u64> {
        self.end
            .sum_received
            .as_ref()
            .or(self.end.sum.as_ref())
            .map(|s| s.bytes)
    }

    /// Builds the document one side sends for a finished transfer.
    ///
    /// `samples` are that side's per-interval measurements in emission
    /// order; `sender` records which direction this side moved bytes.
    pub fn build(
        params: &TestParams,
        samples: &[IntervalSample],
        total_bytes: u64,
        duration_secs: f64,
        sender: bool,
    ) -> Self {
        let mut intervals = Vec::new();
        for sample in samples {
            let stat = WireStreamStat {
                socket: Some(sample.stream_id),
                start: sample.start_secs,
                end: sample.end_secs,
                seconds: sample.end_secs - sample.start_secs,
                bytes: sample.bytes,
                bits_per_second: sample.bits_per_second,
                retransmits: sample.tcp.as_ref().map(|t| t.retransmits),
                sender: Some(sender),
                omitted: Some(false),
                ..Default::default()
            };
            intervals.push(WireInterval {
                streams: vec![stat.clone()],
                sum: Some(stat),
            });
        }

        let total = WireStreamStat::from_span(
            crate::protocol::DEFAULT_STREAM_ID,
            0.0,
            duration_secs,
            total_bytes,
            sender,
        );

        let end = if sender {
            WireEnd {
                streams: vec![WireEndStream {
                    sender: Some(total.clone()),
                    receiver: None,
                }],
                sum_sent: Some(total.clone()),
                sum_received: None,
                sum: Some(total),
            }
        } else {
            WireEnd {
                streams: vec![WireEndStream {
                    sender: None,
                    receiver: Some(total.clone()),
                }],
                sum_sent: None,
                sum_received: Some(total.clone()),
                sum: Some(total),
            }
        };

        WireResults {
            start: WireStart {
                version: format!("netgauge {}", crate::VERSION),
                test_start: Some(WireTestStart {
                    protocol: if params.udp { "UDP" } else { "TCP" }.into(),
                    num_streams: params.parallel,
                    blksize: params.len,
                    omit: params.omit,
                    duration: params.time,
                    bytes: params.num,
                    blocks: params.blockcount,
                    reverse: params.reverse as i32,
                }),
                ..Default::default()
            },
            intervals,
            end,
            error: None,
        }
    }
}
