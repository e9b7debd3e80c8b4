//! iperf3 control-channel primitives.
//!
//! Three things travel on the control connection: single-byte state tags,
//! a fixed 37-byte session cookie, and JSON documents carried behind a
//! 4-byte big-endian length prefix. This module owns the encoding and
//! decoding of all three; timeouts are the caller's business.

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// On-wire size of the session cookie: 36 ASCII characters plus a
/// trailing NUL.
pub const COOKIE_LEN: usize = 37;

/// Upper bound on a length-prefixed control message (1 MiB).
pub const MAX_CONTROL_MESSAGE: usize = 1024 * 1024;

/// Default stream id, matching iperf3's numbering.
///
/// iperf3 numbers its streams 5, 7, 9 and so on (socket fds on the
/// reference side); kept here so reports line up with stock output.
pub const DEFAULT_STREAM_ID: i32 = 5;

/// Stream id for the zero-based stream `index`.
pub fn stream_id_for_index(index: usize) -> i32 {
    DEFAULT_STREAM_ID + (index as i32) * 2
}

/// Control-channel states of the iperf3 session state machine.
///
/// Each state is exchanged as one signed byte. Codes outside this set are
/// surfaced to the driver as raw values and handled there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum State {
    TestStart = 1,
    TestRunning = 2,
    TestEnd = 4,
    ParamExchange = 9,
    CreateStreams = 10,
    ServerTerminate = 11,
    ClientTerminate = 12,
    ExchangeResults = 13,
    DisplayResults = 14,
    IperfStart = 15,
    IperfDone = 16,
    AccessDenied = -1,
    ServerError = -2,
}

impl State {
    /// Decodes a signed state code. Unknown codes yield `None`.
    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            1 => Some(State::TestStart),
            2 => Some(State::TestRunning),
            4 => Some(State::TestEnd),
            9 => Some(State::ParamExchange),
            10 => Some(State::CreateStreams),
            11 => Some(State::ServerTerminate),
            12 => Some(State::ClientTerminate),
            13 => Some(State::ExchangeResults),
            14 => Some(State::DisplayResults),
            15 => Some(State::IperfStart),
            16 => Some(State::IperfDone),
            -1 => Some(State::AccessDenied),
            -2 => Some(State::ServerError),
            _ => None,
        }
    }

    pub fn code(self) -> i8 {
        self as i8
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::TestStart => "TEST_START",
            State::TestRunning => "TEST_RUNNING",
            State::TestEnd => "TEST_END",
            State::ParamExchange => "PARAM_EXCHANGE",
            State::CreateStreams => "CREATE_STREAMS",
            State::ServerTerminate => "SERVER_TERMINATE",
            State::ClientTerminate => "CLIENT_TERMINATE",
            State::ExchangeResults => "EXCHANGE_RESULTS",
            State::DisplayResults => "DISPLAY_RESULTS",
            State::IperfStart => "IPERF_START",
            State::IperfDone => "IPERF_DONE",
            State::AccessDenied => "ACCESS_DENIED",
            State::ServerError => "SERVER_ERROR",
        };
        f.write_str(name)
    }
}

/// Generates a fresh 36-character alphanumeric session cookie.
///
/// The client writes the same cookie on the control connection and on every
/// data connection so the server can associate them.
pub fn generate_cookie() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COOKIE_LEN - 1)
        .map(char::from)
        .collect()
}

/// Writes a cookie as exactly [`COOKIE_LEN`] bytes: 36 ASCII characters
/// (padded or truncated) plus a trailing NUL. Flushes.
pub async fn write_cookie<W: AsyncWrite + Unpin>(writer: &mut W, cookie: &str) -> Result<()> {
    let mut buf = [0u8; COOKIE_LEN];
    let bytes = cookie.as_bytes();
    let n = bytes.len().min(COOKIE_LEN - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly [`COOKIE_LEN`] bytes and decodes them as ASCII with
/// trailing NULs stripped.
///
/// # Errors
///
/// A short read surfaces as `Error::Framing`.
pub async fn read_cookie<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut buf = [0u8; COOKIE_LEN];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Framing("short cookie read".into())
        } else {
            Error::Io(e)
        }
    })?;
    Ok(String::from_utf8_lossy(&buf)
        .trim_end_matches('\0')
        .to_string())
}

/// Writes one signed state byte and flushes.
pub async fn write_state<W: AsyncWrite + Unpin>(writer: &mut W, state: State) -> Result<()> {
    writer.write_all(&[state.code() as u8]).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one signed state byte. The raw code is returned so the driver can
/// decide how to treat values outside [`State`].
pub async fn read_state_code<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(buf[0] as i8)
}

/// Writes a serializable value as a length-prefixed JSON message: a 4-byte
/// big-endian length followed by that many bytes of UTF-8 JSON. Flushes.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let body = serde_json::to_vec(value)?;
    write_json_raw(writer, &body).await
}

/// Writes pre-serialized JSON bytes behind the length prefix. Flushes.
pub async fn write_json_raw<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_CONTROL_MESSAGE {
        return Err(Error::Framing(format!(
            "message of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_CONTROL_MESSAGE
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a length-prefixed JSON message and returns the raw body bytes.
///
/// # Errors
///
/// A declared length of zero or above [`MAX_CONTROL_MESSAGE`] is rejected
/// with `Error::Framing` before any body bytes are read.
pub async fn read_json_raw<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 || len > MAX_CONTROL_MESSAGE {
        return Err(Error::Framing(format!(
            "declared message length {} outside 1..={}",
            len, MAX_CONTROL_MESSAGE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Reads a length-prefixed JSON message and deserializes it.
pub async fn read_json<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let body = read_json_raw(reader).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for state in [
            State::TestStart,
            State::TestRunning,
            State::TestEnd,
            State::ParamExchange,
            State::CreateStreams,
            State::ServerTerminate,
            State::ClientTerminate,
            State::ExchangeResults,
            State::DisplayResults,
            State::IperfStart,
            State::IperfDone,
            State::AccessDenied,
            State::ServerError,
        ] {
            assert_eq!(State::from_code(state.code()), Some(state));
        }
    }

    #[test]
    fn test_unknown_state_code() {
        assert_eq!(State::from_code(42), None);
        assert_eq!(State::from_code(0), None);
    }

    #[test]
    fn test_negative_state_codes() {
        assert_eq!(State::from_code(-1), Some(State::AccessDenied));
        assert_eq!(State::from_code(-2), Some(State::ServerError));
        assert_eq!(State::AccessDenied.code(), -1);
    }

    #[test]
    fn test_stream_id_sequence() {
        assert_eq!(stream_id_for_index(0), 5);
        assert_eq!(stream_id_for_index(1), 7);
        assert_eq!(stream_id_for_index(2), 9);
    }

    #[test]
    fn test_generated_cookie_shape() {
        let cookie = generate_cookie();
        assert_eq!(cookie.len(), COOKIE_LEN - 1);
        assert!(cookie.bytes().all(|b| b.is_ascii_alphanumeric()));

        // Two cookies colliding would mean a broken RNG.
        assert_ne!(cookie, generate_cookie());
    }

    #[tokio::test]
    async fn test_cookie_round_trip() {
        let cookie = generate_cookie();
        let mut wire = Vec::new();
        write_cookie(&mut wire, &cookie).await.unwrap();
        assert_eq!(wire.len(), COOKIE_LEN);
        assert_eq!(wire[COOKIE_LEN - 1], 0);

        let decoded = read_cookie(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded, cookie);
    }

    #[tokio::test]
    async fn test_short_cookie_padded() {
        let mut wire = Vec::new();
        write_cookie(&mut wire, "abc").await.unwrap();
        assert_eq!(wire.len(), COOKIE_LEN);

        let decoded = read_cookie(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded, "abc");
    }

    #[tokio::test]
    async fn test_oversized_cookie_truncated() {
        let long = "x".repeat(50);
        let mut wire = Vec::new();
        write_cookie(&mut wire, &long).await.unwrap();
        assert_eq!(wire.len(), COOKIE_LEN);

        let decoded = read_cookie(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded.len(), COOKIE_LEN - 1);
    }

    #[tokio::test]
    async fn test_truncated_cookie_read_is_framing_error() {
        let wire = vec![b'a'; 10];
        let err = read_cookie(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[tokio::test]
    async fn test_state_byte_round_trip() {
        let mut wire = Vec::new();
        write_state(&mut wire, State::ParamExchange).await.unwrap();
        assert_eq!(wire, [9]);

        let code = read_state_code(&mut wire.as_slice()).await.unwrap();
        assert_eq!(code, 9);
    }

    #[tokio::test]
    async fn test_access_denied_on_the_wire() {
        let wire = vec![0xFFu8];
        let code = read_state_code(&mut wire.as_slice()).await.unwrap();
        assert_eq!(code, -1);
        assert_eq!(State::from_code(code), Some(State::AccessDenied));
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let value = serde_json::json!({"time": 10, "parallel": 2});
        let mut wire = Vec::new();
        write_json(&mut wire, &value).await.unwrap();

        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(len, wire.len() - 4);

        let decoded: serde_json::Value = read_json(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded, value);
    }

    #[tokio::test]
    async fn test_json_body_preserved_byte_for_byte() {
        let body = r#"{"k":"é body"}"#.as_bytes().to_vec();
        let mut wire = Vec::new();
        write_json_raw(&mut wire, &body).await.unwrap();

        let decoded = read_json_raw(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn test_zero_length_rejected() {
        let wire = 0u32.to_be_bytes().to_vec();
        let err = read_json_raw(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut wire = 0x7FFF_FFFFu32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"{}");
        let err = read_json_raw(&mut wire.as_slice()).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[tokio::test]
    async fn test_max_length_accepted() {
        let body = vec![b' '; MAX_CONTROL_MESSAGE];
        let mut wire = Vec::new();
        write_json_raw(&mut wire, &body).await.unwrap();
        let decoded = read_json_raw(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded.len(), MAX_CONTROL_MESSAGE);
    }
}
