//! TCP connect and listen plumbing.
//!
//! Thin layer over tokio sockets: outbound connects carry a deadline,
//! socket options come from the test configuration, and the listener's
//! accept is a bounded poll so a shutdown request is observed within one
//! accept-timeout period.

use log::debug;
use socket2::{Domain, SockRef, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Opens an outbound TCP stream to `host:port` within `timeout`.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    match time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            debug!("connected to {}", addr);
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::Timeout(format!(
            "connect to {} timed out after {:?}",
            addr, timeout
        ))),
    }
}

/// Applies per-stream socket options: `TCP_NODELAY`, send/receive buffer
/// sizes, and (on Unix) the maximum segment size.
///
/// Options left `None` keep the OS defaults.
pub fn configure_stream(
    stream: &TcpStream,
    no_delay: bool,
    window_size: Option<usize>,
    mss: Option<u32>,
) -> Result<()> {
    if no_delay {
        stream.set_nodelay(true)?;
    }

    let sock = SockRef::from(stream);
    if let Some(window) = window_size {
        sock.set_send_buffer_size(window)?;
        sock.set_recv_buffer_size(window)?;
        debug!("socket buffers set to {} bytes", window);
    }

    #[cfg(unix)]
    if let Some(mss) = mss {
        sock.set_mss(mss)?;
        debug!("TCP MSS set to {}", mss);
    }
    #[cfg(not(unix))]
    let _ = mss;

    Ok(())
}

/// A bound TCP listener whose `accept` is a periodic poll.
pub struct Listener {
    inner: TcpListener,
    accept_timeout: Duration,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds according to the server configuration, honouring the backlog
    /// and enabling address reuse so quick restarts work.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let addr: SocketAddr = config
            .bind_string()
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog as i32)?;
        socket.set_nonblocking(true)?;

        let inner = TcpListener::from_std(socket.into())?;
        let local_addr = inner.local_addr()?;
        debug!("listening on {}", local_addr);

        Ok(Self {
            inner,
            accept_timeout: config.accept_timeout,
            local_addr,
        })
    }

    /// The bound address, with the concrete port when 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits up to the accept timeout for one connection.
    ///
    /// Returns `Ok(None)` when the period elapses without a connection so
    /// the caller can re-check its shutdown flag and poll again.
    pub async fn accept(&self) -> Result<Option<(TcpStream, SocketAddr)>> {
        match time::timeout(self.accept_timeout, self.inner.accept()).await {
            Ok(Ok((stream, addr))) => Ok(Some((stream, addr))),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> ServerConfig {
        let mut config = ServerConfig::new(0);
        config.bind_addr = Some("127.0.0.1".parse().unwrap());
        config.accept_timeout = Duration::from_millis(50);
        config
    }

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let listener = Listener::bind(&loopback_config()).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_accept_times_out_to_none() {
        let listener = Listener::bind(&loopback_config()).unwrap();
        let accepted = listener.accept().await.unwrap();
        assert!(accepted.is_none());
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let listener = Listener::bind(&loopback_config()).unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            connect("127.0.0.1", addr.port(), Duration::from_secs(1)).await
        });

        let accepted = listener.accept().await.unwrap();
        assert!(accepted.is_some());
        let stream = client.await.unwrap().unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        let listener = Listener::bind(&loopback_config()).unwrap();
        let port = listener.local_addr().port();
        drop(listener);

        let err = connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_stream_options_applied() {
        let listener = Listener::bind(&loopback_config()).unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            connect("127.0.0.1", addr.port(), Duration::from_secs(1)).await
        });
        let _server_side = listener.accept().await.unwrap().unwrap();
        let stream = client.await.unwrap().unwrap();

        configure_stream(&stream, true, Some(64 * 1024), None).unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
