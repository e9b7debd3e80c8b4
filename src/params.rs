//! The iperf3 test-parameter document.
//!
//! Sent by the client as the first JSON message of a session, after the
//! server signals `PARAM_EXCHANGE`. Field names are fixed by the reference
//! implementation; a zero value means "use the default". Fields that hold
//! their default are left off the wire, which is what stock iperf3 does
//! and what its cJSON parser expects.

use serde::{Deserialize, Serialize};

use crate::config::TestConfig;

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn default_parallel() -> u32 {
    1
}

fn default_len() -> u32 {
    crate::config::DEFAULT_BUFFER_LEN as u32
}

fn default_pacing_timer() -> u32 {
    1000
}

/// Test parameters exchanged on the control connection.
///
/// # Examples
///
/// ```
/// use netgauge::params::TestParams;
///
/// let json = r#"{"tcp":true,"time":10,"parallel":2,"client_version":"3.16"}"#;
/// let params: TestParams = serde_json::from_str(json).unwrap();
/// assert!(params.tcp);
/// assert_eq!(params.parallel, 2);
/// assert_eq!(params.len, 131072); // absent, so the default applies
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestParams {
    #[serde(default, skip_serializing_if = "is_false")]
    pub tcp: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub udp: bool,

    /// Seconds to omit from the start of the test.
    #[serde(default)]
    pub omit: u32,

    /// Test duration in seconds.
    #[serde(default)]
    pub time: u64,

    /// Bytes to transfer; zero means the duration governs.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub num: u64,

    /// Blocks to transfer; zero means the duration governs.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub blockcount: u64,

    #[serde(rename = "MSS", default, skip_serializing_if = "is_zero_u32")]
    pub mss: u32,

    #[serde(default, skip_serializing_if = "is_false")]
    pub nodelay: bool,

    #[serde(default = "default_parallel")]
    pub parallel: u32,

    #[serde(default, skip_serializing_if = "is_false")]
    pub reverse: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub bidirectional: bool,

    /// Socket buffer (window) size in bytes.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub window: u32,

    /// Read/write block length in bytes.
    #[serde(default = "default_len")]
    pub len: u32,

    /// Target bandwidth in bits per second; zero means unlimited.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub bandwidth: u64,

    /// Fair-queueing rate in bits per second.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub fqrate: u64,

    /// Pacer granularity in milliseconds.
    #[serde(default = "default_pacing_timer")]
    pub pacing_timer: u32,

    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub burst: u32,

    #[serde(rename = "TOS", default, skip_serializing_if = "is_zero_u32")]
    pub tos: u32,

    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub flowlabel: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra_data: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub congestion: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub congestion_used: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub get_server_output: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub udp_counters_64bit: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub repeating_payload: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub zerocopy: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub dont_fragment: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_version: String,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            tcp: true,
            udp: false,
            omit: 0,
            time: 10,
            num: 0,
            blockcount: 0,
            mss: 0,
            nodelay: false,
            parallel: default_parallel(),
            reverse: false,
            bidirectional: false,
            window: 0,
            len: default_len(),
            bandwidth: 0,
            fqrate: 0,
            pacing_timer: default_pacing_timer(),
            burst: 0,
            tos: 0,
            flowlabel: 0,
            title: String::new(),
            extra_data: String::new(),
            congestion: String::new(),
            congestion_used: String::new(),
            get_server_output: false,
            udp_counters_64bit: false,
            repeating_payload: false,
            zerocopy: false,
            dont_fragment: false,
            client_version: crate::VERSION.to_string(),
        }
    }
}

impl TestParams {
    /// Builds the wire document for a validated [`TestConfig`].
    ///
    /// The duration is rounded up to whole seconds, which is the protocol's
    /// granularity; a byte-count test carries `num` and leaves the duration
    /// at its wire default.
    pub fn from_config(config: &TestConfig) -> Self {
        let mut params = TestParams {
            tcp: config.protocol == crate::Protocol::Tcp,
            udp: config.protocol == crate::Protocol::Udp,
            nodelay: config.no_delay,
            parallel: config.num_streams as u32,
            reverse: config.reverse,
            bidirectional: config.bidirectional,
            window: config.window_size.unwrap_or(0) as u32,
            len: config.buffer_len as u32,
            bandwidth: config.bandwidth.unwrap_or(0),
            mss: config.mss.unwrap_or(0),
            ..Default::default()
        };
        match config.bytes_to_transfer {
            Some(num) => params.num = num,
            None => params.time = config.duration.as_secs_f64().ceil() as u64,
        }
        params
    }

    /// Effective transfer duration for the mirror loop on the server side.
    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.time)
    }
}
