//! Integration test for graceful WebSocket shutdown of the real binary.
//!
//! Ctrl+C must reach connected clients as a normal close frame, not as a
//! dropped connection.

#![cfg(unix)]

use futures::{SinkExt, StreamExt};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

async fn wait_for_ready(port: u16) {
    let url = format!("http://127.0.0.1:{}/health", port);
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("cosession did not become ready in time");
}

#[tokio::test]
async fn websocket_receives_close_frame_on_ctrl_c() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let child = Command::new(env!("CARGO_BIN_EXE_cosession"))
        .args(["serve", "--bind", &format!("127.0.0.1:{}", port)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn cosession");
    let mut child = KillOnDrop(child);

    wait_for_ready(port).await;

    let url = format!("ws://127.0.0.1:{}/ws?userId=O&userName=Oscar", port);
    let (ws, _) = connect_async(url).await.expect("WebSocket connect should succeed");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let hello = timeout(Duration::from_secs(1), ws_rx.next())
        .await
        .expect("should receive connected message in time")
        .expect("stream should have message")
        .expect("message should be valid");
    assert!(matches!(hello, Message::Text(_)));

    let create = serde_json::json!({"event": "create-session", "data": {}});
    ws_tx
        .send(Message::Text(create.to_string().into()))
        .await
        .expect("should send create-session");

    let status = Command::new("kill")
        .args(["-INT", &child.0.id().to_string()])
        .status()
        .expect("failed to run kill");
    assert!(status.success());

    loop {
        match timeout(SHUTDOWN_TIMEOUT, ws_rx.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => {
                let frame = frame.expect("close frame should carry a code");
                assert_eq!(frame.code, CloseCode::Normal);
                break;
            }
            // session-updated may still be in flight
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("WebSocket error instead of close frame: {:?}", e),
            Ok(None) => panic!("WebSocket stream ended without close frame"),
            Err(_) => panic!("timeout waiting for close frame"),
        }
    }

    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.0.try_wait().expect("try_wait failed") {
            assert!(status.success(), "cosession exited with {:?}", status);
            break;
        }
        if start.elapsed() > SHUTDOWN_TIMEOUT {
            panic!("cosession did not exit in time");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
