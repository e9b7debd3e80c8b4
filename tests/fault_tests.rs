//! Fault injection against the client: misbehaving servers, refused
//! sessions, and corrupt framing.

use netgauge::protocol::{self, State};
use netgauge::{Client, Error, TestConfig, TestEvent};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn client_config(port: u16) -> TestConfig {
    TestConfig::new("127.0.0.1", port)
        .with_duration(Duration::from_millis(300))
        .with_buffer_len(8 * 1024)
        .with_reporting_interval(Duration::from_millis(100))
        .with_timeout(Duration::from_secs(5))
}

async fn run_to_terminal(config: TestConfig) -> Vec<TestEvent> {
    let client = Client::new();
    let (mut events, _handle) = client.start(config).unwrap();
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    seen
}

fn error_message(events: &[TestEvent]) -> Option<String> {
    events.iter().find_map(|e| match e {
        TestEvent::Error { message, .. } => Some(message.clone()),
        _ => None,
    })
}

#[tokio::test]
async fn test_immediate_access_denied() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut cookie = [0u8; protocol::COOKIE_LEN];
        sock.read_exact(&mut cookie).await.unwrap();
        sock.write_all(&[State::AccessDenied.code() as u8])
            .await
            .unwrap();
    });

    let events = run_to_terminal(client_config(port)).await;
    assert_eq!(
        error_message(&events).as_deref(),
        Some("Access denied by server")
    );
}

#[tokio::test]
async fn test_server_error_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut cookie = [0u8; protocol::COOKIE_LEN];
        sock.read_exact(&mut cookie).await.unwrap();
        sock.write_all(&[State::ServerError.code() as u8])
            .await
            .unwrap();
    });

    let events = run_to_terminal(client_config(port)).await;
    assert_eq!(error_message(&events).as_deref(), Some("Server error"));
}

#[tokio::test]
async fn test_server_terminate_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut cookie = [0u8; protocol::COOKIE_LEN];
        sock.read_exact(&mut cookie).await.unwrap();
        sock.write_all(&[State::ServerTerminate.code() as u8])
            .await
            .unwrap();
    });

    let events = run_to_terminal(client_config(port)).await;
    assert_eq!(
        error_message(&events).as_deref(),
        Some("Server terminated the connection")
    );
}

/// A minimal hand-rolled server that walks the handshake correctly, then
/// corrupts the results exchange with an absurd length prefix.
async fn corrupt_results_server(listener: TcpListener) {
    let (mut control, _) = listener.accept().await.unwrap();
    let mut cookie = [0u8; protocol::COOKIE_LEN];
    control.read_exact(&mut cookie).await.unwrap();

    // PARAM_EXCHANGE, then swallow the parameter document.
    control
        .write_all(&[State::ParamExchange.code() as u8])
        .await
        .unwrap();
    let mut len_buf = [0u8; 4];
    control.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    control.read_exact(&mut body).await.unwrap();

    // CREATE_STREAMS; accept the one data stream and drain it.
    control
        .write_all(&[State::CreateStreams.code() as u8])
        .await
        .unwrap();
    let (mut data, _) = listener.accept().await.unwrap();
    let mut data_cookie = [0u8; protocol::COOKIE_LEN];
    data.read_exact(&mut data_cookie).await.unwrap();
    assert_eq!(cookie, data_cookie, "data stream must echo the cookie");
    let drain = tokio::spawn(async move {
        let mut sink = vec![0u8; 64 * 1024];
        while let Ok(n) = data.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    });

    // TEST_START, TEST_RUNNING; wait out the transfer until TEST_END.
    control
        .write_all(&[State::TestStart.code() as u8])
        .await
        .unwrap();
    control
        .write_all(&[State::TestRunning.code() as u8])
        .await
        .unwrap();
    let mut end = [0u8; 1];
    control.read_exact(&mut end).await.unwrap();
    assert_eq!(end[0] as i8, State::TestEnd.code());

    // EXCHANGE_RESULTS followed by a poisoned length prefix.
    control
        .write_all(&[State::ExchangeResults.code() as u8])
        .await
        .unwrap();
    control
        .write_all(&0x7FFF_FFFFu32.to_be_bytes())
        .await
        .unwrap();
    control.flush().await.unwrap();
    let _ = drain.await;
    // Hold the socket open long enough for the client to react.
    tokio::time::sleep(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_corrupt_results_length_is_framing_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(corrupt_results_server(listener));

    let events = run_to_terminal(client_config(port)).await;
    let message = error_message(&events).expect("expected an Error event");
    assert!(
        message.starts_with("Framing error"),
        "got message: {}",
        message
    );

    // The transfer ran before the corruption, so the partial rides along.
    let partial = events.iter().find_map(|e| match e {
        TestEvent::Error { partial, .. } => partial.clone(),
        _ => None,
    });
    assert!(partial.is_some());
}

#[tokio::test]
async fn test_malformed_results_json_is_tolerated() {
    // Same handshake, but the results document is syntactically broken;
    // the client substitutes an empty document and completes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut control, _) = listener.accept().await.unwrap();
        let mut cookie = [0u8; protocol::COOKIE_LEN];
        control.read_exact(&mut cookie).await.unwrap();
        control
            .write_all(&[State::ParamExchange.code() as u8])
            .await
            .unwrap();
        let mut len_buf = [0u8; 4];
        control.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        control.read_exact(&mut body).await.unwrap();
        control
            .write_all(&[State::CreateStreams.code() as u8])
            .await
            .unwrap();
        let (mut data, _) = listener.accept().await.unwrap();
        let mut data_cookie = [0u8; protocol::COOKIE_LEN];
        data.read_exact(&mut data_cookie).await.unwrap();
        let drain = tokio::spawn(async move {
            let mut sink = vec![0u8; 64 * 1024];
            while let Ok(n) = data.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        });
        control
            .write_all(&[State::TestStart.code() as u8])
            .await
            .unwrap();
        control
            .write_all(&[State::TestRunning.code() as u8])
            .await
            .unwrap();
        let mut end = [0u8; 1];
        control.read_exact(&mut end).await.unwrap();

        control
            .write_all(&[State::ExchangeResults.code() as u8])
            .await
            .unwrap();
        let garbage = b"this is not json";
        control
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        control.write_all(garbage).await.unwrap();
        control.flush().await.unwrap();

        // Read the client's document, then close without the final cues;
        // the client must tolerate their absence.
        let mut len_buf = [0u8; 4];
        control.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        control.read_exact(&mut body).await.unwrap();
        drop(control);
        let _ = drain.await;
    });

    let events = run_to_terminal(client_config(port)).await;
    let result = events
        .iter()
        .find_map(|e| match e {
            TestEvent::Complete { result } => Some(result.clone()),
            _ => None,
        })
        .expect("malformed results JSON must not fail the test");
    assert_eq!(result.raw_json.as_deref(), Some("{}"));
}

#[tokio::test]
async fn test_connection_refused_reports_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let events = run_to_terminal(client_config(port)).await;
    let message = error_message(&events).expect("expected an Error event");
    assert!(message.starts_with("IO error"), "got message: {}", message);
}

#[tokio::test]
async fn test_config_errors_do_not_reach_the_stream() {
    let client = Client::new();
    let err = client
        .start(TestConfig::new("127.0.0.1", 5201).with_duration(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let err = client
        .start(TestConfig::new("127.0.0.1", 5201).with_streams(129))
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

/// Stock-shaped wire bytes: the exact handshake a reference iperf3 server
/// would see from this client, checked at the byte level.
#[tokio::test]
async fn test_wire_level_handshake_shape() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let inspect = tokio::spawn(async move {
        let (mut control, _) = listener.accept().await.unwrap();

        // Cookie: exactly 37 bytes, NUL-terminated printable ASCII.
        let mut cookie = [0u8; protocol::COOKIE_LEN];
        control.read_exact(&mut cookie).await.unwrap();
        assert_eq!(cookie[36], 0);
        assert!(cookie[..36].iter().all(|b| b.is_ascii_alphanumeric()));

        control
            .write_all(&[State::ParamExchange.code() as u8])
            .await
            .unwrap();

        // Parameter document: length-prefixed JSON with the fixed keys.
        let mut len_buf = [0u8; 4];
        control.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        assert!(len > 0 && len <= protocol::MAX_CONTROL_MESSAGE);
        let mut body = vec![0u8; len];
        control.read_exact(&mut body).await.unwrap();
        let params: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(params["tcp"], true);
        assert_eq!(params["parallel"], 1);
        assert!(params.get("client_version").is_some());

        // Deny from here; the handshake shape is what was under test.
        control
            .write_all(&[State::AccessDenied.code() as u8])
            .await
            .unwrap();
    });

    let events = run_to_terminal(client_config(port)).await;
    inspect.await.unwrap();
    assert!(error_message(&events).is_some());
}
