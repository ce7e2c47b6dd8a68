#![allow(dead_code)]

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use cosession::{
    api::{self, AppState, RouterConfig},
    gateway::{self, GatewayHandle},
    registry::SessionRegistry,
    shutdown::ShutdownCoordinator,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub gateway: GatewayHandle,
    pub shutdown: ShutdownCoordinator,
}

pub fn create_test_state() -> AppState {
    let (gateway, _task) = gateway::spawn(SessionRegistry::new());
    AppState {
        gateway,
        shutdown: ShutdownCoordinator::new(),
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(RouterConfig::default()).await
}

pub async fn start_server_with(config: RouterConfig) -> TestServer {
    let state = create_test_state();
    let gateway = state.gateway.clone();
    let shutdown = state.shutdown.clone();
    let app = api::router(state, config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        addr,
        gateway,
        shutdown,
    }
}

/// One browser tab: a WebSocket bound to a user identity.
pub struct Client {
    pub user_id: String,
    tx: SplitSink<Ws, Message>,
    rx: SplitStream<Ws>,
}

impl Client {
    /// Connect and consume the `connected` greeting.
    pub async fn connect(addr: SocketAddr, user_id: &str, user_name: &str) -> Self {
        let url = format!("ws://{}/ws?userId={}&userName={}", addr, user_id, user_name);
        let (ws, _) = connect_async(url).await.expect("failed to connect");
        let (tx, rx) = ws.split();
        let mut client = Client {
            user_id: user_id.to_string(),
            tx,
            rx,
        };
        let hello = client.recv().await;
        assert_eq!(hello["event"], "connected");
        assert_eq!(hello["data"]["userId"], user_id);
        client
    }

    pub async fn send(&mut self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data });
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.tx
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("send failed");
    }

    pub async fn recv(&mut self) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), self.rx.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => serde_json::from_str(&text).expect("invalid JSON"),
            other => panic!("expected text message, got {:?}", other),
        }
    }

    /// Receive the next message and assert its event name.
    pub async fn expect(&mut self, event: &str) -> Value {
        let msg = self.recv().await;
        assert_eq!(msg["event"], event, "unexpected message: {msg}");
        msg["data"].clone()
    }

    /// Returns None if nothing arrives within `timeout`.
    pub async fn try_recv(&mut self, timeout: Duration) -> Option<Value> {
        match tokio::time::timeout(timeout, self.rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => Some(serde_json::from_str(&text).unwrap()),
            _ => None,
        }
    }

    pub async fn assert_silent(&mut self) {
        if let Some(msg) = self.try_recv(Duration::from_millis(150)).await {
            panic!("{} received unexpected message: {msg}", self.user_id);
        }
    }

    /// Wait for the next frame of any kind, for close-frame assertions.
    pub async fn next_frame(&mut self) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(2), self.rx.next())
            .await
            .ok()
            .flatten()
            .and_then(Result::ok)
    }

    pub async fn close(mut self) {
        let _ = self.tx.send(Message::Close(None)).await;
    }

    pub async fn create_session(&mut self) -> Value {
        self.send("create-session", json!({})).await;
        self.expect("session-updated").await
    }

    pub async fn join(&mut self, session_id: &str) {
        self.send("join-session", json!({ "sessionId": session_id })).await;
    }
}

pub fn participant<'a>(snapshot: &'a Value, user_id: &str) -> Option<&'a Value> {
    snapshot["participants"]
        .as_array()?
        .iter()
        .find(|p| p["id"] == user_id)
}
