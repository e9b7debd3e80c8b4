//! netgauge - an iperf3-compatible bandwidth measurement engine
//!
//! This library implements both roles of the iperf3 wire protocol: a
//! client that runs tests against any iperf3 server and a server that
//! accepts tests from any iperf3 client. Progress arrives as an event
//! stream; the finished test is folded into a single result record.
//!
//! # Features
//!
//! - Wire-compatible with stock iperf3 (cookie, state bytes,
//!   length-prefixed JSON, parallel data streams)
//! - Token-bucket pacing for bandwidth-capped tests
//! - Reverse mode (server sends, client receives)
//! - Per-interval progress events and end-of-test aggregation
//! - Cancellation handles for both roles
//! - Asynchronous I/O using tokio

pub mod buffer_pool;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod measurements;
pub mod pacer;
pub mod params;
pub mod protocol;
pub mod results;
pub mod server;
pub mod transport;

pub use client::Client;
pub use config::{Protocol, ServerConfig, TestConfig};
pub use error::{Error, ProtocolError, Result};
pub use events::{
    EventStream, ServerEvent, ServerHandle, ServerStatus, TestEvent, TestHandle,
};
pub use measurements::{IntervalSample, TestResult};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
