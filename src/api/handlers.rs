use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::gateway::{Identity, OUTBOUND_CAPACITY};
use crate::protocol::ClientMessage;
use crate::session::{SessionSnapshot, SessionSummary};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    active_sessions: usize,
    active_connections: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let stats = state.gateway.stats().await?;
    Ok(Json(HealthResponse {
        status: "OK",
        timestamp: Utc::now(),
        active_sessions: stats.active_sessions,
        active_connections: stats.active_connections,
    }))
}

pub(super) async fn session_list(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let stats = state.gateway.stats().await?;
    Ok(Json(stats.sessions))
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .gateway
        .snapshot(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::SessionNotFound(id))
}

/// Identity asserted in the upgrade query string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HandshakeParams {
    user_id: Option<String>,
    user_name: Option<String>,
}

impl HandshakeParams {
    fn into_identity(self) -> Result<Identity, ApiError> {
        let user_id = self
            .user_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::InvalidRequest("userId is required".into()))?;
        let user_name = self
            .user_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| user_id.clone());
        Ok(Identity::new(user_id, user_name))
    }
}

pub(super) async fn ws_collab(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = params.into_identity()?;
    Ok(ws.on_upgrade(move |socket| handle_ws_collab(socket, state, identity)))
}

async fn handle_ws_collab(socket: WebSocket, state: AppState, identity: Identity) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    if state.shutdown.is_shutting_down() {
        let _ = ws_tx.send(shutdown_close()).await;
        return;
    }

    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let user_id = identity.user_id.clone();
    let conn = match state.gateway.connect(identity, out_tx).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(user = %user_id, %e, "rejecting websocket: gateway unavailable");
            let _ = ws_tx.send(shutdown_close()).await;
            return;
        }
    };

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(message) = outbound else {
                    tracing::debug!(conn = %conn, "gateway released connection");
                    let _ = ws_tx.send(lagged_close()).await;
                    break;
                };
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(conn = %conn, %e, "failed to serialise outbound message");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::parse(text.as_str()) {
                            Ok(message) => {
                                if state.gateway.inbound(conn, message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(conn = %conn, user = %user_id, %e, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(conn = %conn, %e, "websocket receive error");
                        break;
                    }
                    _ => continue,
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(conn = %conn, "websocket received shutdown signal");
                    let _ = ws_tx.send(shutdown_close()).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }

    state.gateway.disconnect(conn).await;
}

fn shutdown_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: "server shutting down".into(),
    }))
}

// The gateway drops a connection whose queue overflows; the client should
// reconnect and rejoin.
fn lagged_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::AGAIN,
        reason: "connection fell behind".into(),
    }))
}
