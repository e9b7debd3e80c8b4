use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Transport protocol type.
///
/// UDP is recognised by the data model but the transfer engine currently
/// drives TCP only; `validate` rejects UDP configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Default control/data port, matching iperf3.
pub const DEFAULT_PORT: u16 = 5201;

/// Default transfer buffer length (128 KiB, iperf3's TCP default).
pub const DEFAULT_BUFFER_LEN: usize = 128 * 1024;

/// Upper bound on parallel data streams.
pub const MAX_STREAMS: usize = 128;

/// Configuration for a client test.
///
/// Built with the `with_*` methods and checked once by [`validate`] before
/// the engine performs any I/O.
///
/// [`validate`]: TestConfig::validate
///
/// # Examples
///
/// ```
/// use netgauge::{Protocol, TestConfig};
/// use std::time::Duration;
///
/// let config = TestConfig::new("192.168.1.10", 5201)
///     .with_protocol(Protocol::Tcp)
///     .with_duration(Duration::from_secs(10))
///     .with_bandwidth(100_000_000)
///     .with_streams(2);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Target hostname or address.
    pub server_host: String,

    /// Target port.
    pub server_port: u16,

    /// Protocol to use.
    pub protocol: Protocol,

    /// Total transfer duration. Ignored when `bytes_to_transfer` is set.
    pub duration: Duration,

    /// Byte-count alternative to `duration`.
    pub bytes_to_transfer: Option<u64>,

    /// Number of parallel data streams.
    pub num_streams: usize,

    /// Bandwidth cap in bits per second. `None` means unlimited.
    pub bandwidth: Option<u64>,

    /// Reverse mode: server sends, client receives.
    pub reverse: bool,

    /// Simultaneous send and receive. Carried on the wire; the transfer
    /// engine treats it as informative only.
    pub bidirectional: bool,

    /// Wall-clock slice between emitted interval samples.
    pub reporting_interval: Duration,

    /// Read/write buffer length in bytes.
    pub buffer_len: usize,

    /// TCP send/receive buffer size. `None` leaves the OS default.
    pub window_size: Option<usize>,

    /// TCP maximum segment size. `None` leaves the OS default.
    pub mss: Option<u32>,

    /// Disable Nagle's algorithm on data streams.
    pub no_delay: bool,

    /// Connect and control-channel timeout.
    pub timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: DEFAULT_PORT,
            protocol: Protocol::Tcp,
            duration: Duration::from_secs(10),
            bytes_to_transfer: None,
            num_streams: 1,
            bandwidth: None,
            reverse: false,
            bidirectional: false,
            reporting_interval: Duration::from_secs(1),
            buffer_len: DEFAULT_BUFFER_LEN,
            window_size: None,
            mss: None,
            no_delay: false,
            timeout: Duration::from_secs(10),
        }
    }
}

impl TestConfig {
    pub fn new(server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            server_host: server_host.into(),
            server_port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_bytes_to_transfer(mut self, bytes: u64) -> Self {
        self.bytes_to_transfer = Some(bytes);
        self
    }

    pub fn with_streams(mut self, num_streams: usize) -> Self {
        self.num_streams = num_streams;
        self
    }

    pub fn with_bandwidth(mut self, bits_per_second: u64) -> Self {
        self.bandwidth = Some(bits_per_second);
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    pub fn with_reporting_interval(mut self, interval: Duration) -> Self {
        self.reporting_interval = interval;
        self
    }

    pub fn with_buffer_len(mut self, buffer_len: usize) -> Self {
        self.buffer_len = buffer_len;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = Some(window_size);
        self
    }

    pub fn with_mss(mut self, mss: u32) -> Self {
        self.mss = Some(mss);
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violation found.
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.server_host.is_empty() {
            return Err(Error::Config("server host must not be empty".into()));
        }
        if self.server_port == 0 {
            return Err(Error::Config("server port must be non-zero".into()));
        }
        if self.protocol == Protocol::Udp {
            return Err(Error::Config(
                "UDP transfer is not supported yet".into(),
            ));
        }
        match self.bytes_to_transfer {
            Some(0) => {
                return Err(Error::Config(
                    "bytes to transfer must be positive".into(),
                ));
            }
            None if self.duration.is_zero() => {
                return Err(Error::Config(
                    "duration must be positive when no byte count is set".into(),
                ));
            }
            _ => {}
        }
        if self.num_streams == 0 || self.num_streams > MAX_STREAMS {
            return Err(Error::Config(format!(
                "stream count must be between 1 and {}, got {}",
                MAX_STREAMS, self.num_streams
            )));
        }
        if let Some(0) = self.bandwidth {
            return Err(Error::Config("bandwidth cap must be positive".into()));
        }
        if self.reporting_interval.is_zero() {
            return Err(Error::Config("reporting interval must be positive".into()));
        }
        if self.buffer_len == 0 {
            return Err(Error::Config("buffer length must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration for the server role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind. `None` binds all interfaces.
    pub bind_addr: Option<IpAddr>,

    /// Port to listen on.
    pub port: u16,

    /// Listener backlog.
    pub backlog: u32,

    /// Accept poll period; bounds how long shutdown can go unnoticed.
    pub accept_timeout: Duration,

    /// Interval slicing used for the server-side results document.
    pub reporting_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            port: DEFAULT_PORT,
            backlog: 128,
            accept_timeout: Duration::from_secs(1),
            reporting_interval: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn bind_string(&self) -> String {
        format!(
            "{}:{}",
            self.bind_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            self.port
        )
    }
}
