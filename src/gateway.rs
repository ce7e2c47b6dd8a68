//! Connection gateway: binds connections to identities and routes their
//! operations through the registry.
//!
//! All registry state lives inside a single worker task that drains one
//! command queue. Every command, including the fan-out it causes, is handled
//! to completion before the next one is taken, so observers never see a
//! half-applied operation and concurrent control requests are decided purely
//! by queue order.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{ClientMessage, CollaborativeEvent, ServerMessage};
use crate::registry::{Departure, RegistryError, SessionRegistry};
use crate::session::{SessionId, SessionSnapshot, SessionSummary, UserId};

pub type ConnectionId = Uuid;

/// Outbound queue depth per connection. A connection that falls this far
/// behind loses cursor traffic; anything else overflowing gets it evicted.
pub const OUTBOUND_CAPACITY: usize = 256;

const COMMAND_CAPACITY: usize = 1024;

/// Error text sent when a join targets a missing or inactive session.
pub const SESSION_NOT_FOUND_MESSAGE: &str = "Session not found or inactive";

/// Identity asserted by a client at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub user_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Counters and listing served by the introspection endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub active_sessions: usize,
    pub active_connections: usize,
    pub sessions: Vec<SessionSummary>,
}

/// Work item for the gateway worker.
#[derive(Debug)]
pub enum Command {
    Connect {
        conn: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<ServerMessage>,
    },
    Inbound {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Disconnect {
        conn: ConnectionId,
    },
    Sweep {
        now: DateTime<Utc>,
        max_age: Duration,
        reply: Option<oneshot::Sender<Vec<SessionId>>>,
    },
    Stats {
        reply: oneshot::Sender<GatewayStats>,
    },
    Snapshot {
        session_id: SessionId,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
}

struct Connection {
    identity: Identity,
    outbound: mpsc::Sender<ServerMessage>,
}

/// Gateway state: the registry, live connections and per-session rooms.
///
/// A room holds every live connection whose identity is a participant of
/// the session, so several tabs of one identity all see the same traffic.
pub struct Gateway {
    registry: SessionRegistry,
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<SessionId, HashSet<ConnectionId>>,
    // Connections whose queue overflowed during the current command.
    lagging: Vec<ConnectionId>,
}

impl Gateway {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            connections: HashMap::new(),
            rooms: HashMap::new(),
            lagging: Vec::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections currently subscribed to `session_id`.
    pub fn room(&self, session_id: &str) -> HashSet<ConnectionId> {
        self.rooms.get(session_id).cloned().unwrap_or_default()
    }

    pub fn handle(&mut self, command: Command) {
        match command {
            Command::Connect {
                conn,
                identity,
                outbound,
            } => self.connect(conn, identity, outbound),
            Command::Inbound { conn, message } => self.dispatch(conn, message),
            Command::Disconnect { conn } => self.disconnect(conn),
            Command::Sweep {
                now,
                max_age,
                reply,
            } => {
                let removed = self.sweep(now, max_age);
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Snapshot { session_id, reply } => {
                let _ = reply.send(self.registry.snapshot(&session_id));
            }
        }
        self.evict_lagging();
    }

    // Evicting runs the implicit leave, which can overflow more queues.
    fn evict_lagging(&mut self) {
        while let Some(conn) = self.lagging.pop() {
            if self.connections.contains_key(&conn) {
                tracing::warn!(conn = %conn, "outbound queue full, evicting connection");
                self.disconnect(conn);
            }
        }
    }

    fn connect(&mut self, conn: ConnectionId, identity: Identity, outbound: mpsc::Sender<ServerMessage>) {
        tracing::info!(
            conn = %conn,
            user = %identity.user_id,
            name = %identity.user_name,
            "connection opened"
        );
        let greeting = ServerMessage::Connected {
            user_id: identity.user_id.clone(),
        };
        let session_id = self.registry.session_of(&identity.user_id).map(str::to_string);
        self.connections.insert(conn, Connection { identity, outbound });
        self.send(conn, greeting);
        if let Some(session_id) = session_id {
            tracing::debug!(conn = %conn, session = %session_id, "attaching tab to existing session");
            self.subscribe(&session_id, conn);
        }
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        let user_id = connection.identity.user_id;
        tracing::info!(conn = %conn, user = %user_id, "connection closed");

        for members in self.rooms.values_mut() {
            members.remove(&conn);
        }
        if let Some(session_id) = self.registry.session_of(&user_id).map(str::to_string) {
            if let Some(departure) = self.registry.leave_session(&session_id, &user_id) {
                self.apply_departure(&user_id, departure);
            }
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, message: ClientMessage) {
        let Some(identity) = self.connections.get(&conn).map(|c| c.identity.clone()) else {
            tracing::debug!(conn = %conn, "message from unknown connection dropped");
            return;
        };
        match message {
            ClientMessage::CreateSession => self.on_create(conn, &identity),
            ClientMessage::JoinSession { session_id } => self.on_join(conn, &identity, &session_id),
            ClientMessage::LeaveSession { session_id } => {
                match self.registry.leave_session(&session_id, &identity.user_id) {
                    Some(departure) => self.apply_departure(&identity.user_id, departure),
                    None => tracing::debug!(
                        session = %session_id,
                        user = %identity.user_id,
                        "leave ignored: not a participant"
                    ),
                }
            }
            ClientMessage::RequestControl { session_id } => {
                match self.registry.request_control(&session_id, &identity.user_id) {
                    Some(snapshot) => self.broadcast(&session_id, ServerMessage::SessionUpdated(snapshot)),
                    None => tracing::debug!(
                        session = %session_id,
                        user = %identity.user_id,
                        "control request ignored: not a participant"
                    ),
                }
            }
            ClientMessage::ReleaseControl { session_id } => {
                match self.registry.release_control(&session_id, &identity.user_id) {
                    Some(snapshot) => self.broadcast(&session_id, ServerMessage::SessionUpdated(snapshot)),
                    None => tracing::debug!(
                        session = %session_id,
                        user = %identity.user_id,
                        "control release ignored: not a participant"
                    ),
                }
            }
            ClientMessage::CollaborativeEvent(event) => self.on_event(conn, &identity, event),
        }
    }

    fn on_create(&mut self, conn: ConnectionId, identity: &Identity) {
        let created = self
            .registry
            .create_session(&identity.user_id, &identity.user_name);
        if let Some(departure) = created.departed {
            self.apply_departure(&identity.user_id, departure);
        }
        self.subscribe_identity(&created.session_id, &identity.user_id);
        self.broadcast(&created.session_id, ServerMessage::SessionUpdated(created.snapshot));
    }

    fn on_join(&mut self, conn: ConnectionId, identity: &Identity, session_id: &str) {
        let joined = match self
            .registry
            .join_session(session_id, &identity.user_id, &identity.user_name)
        {
            Ok(joined) => joined,
            Err(RegistryError::NotFound(id)) => {
                tracing::debug!(session = %id, user = %identity.user_id, "join rejected");
                self.send(conn, ServerMessage::error(SESSION_NOT_FOUND_MESSAGE));
                return;
            }
        };
        if let Some(departure) = joined.departed {
            self.apply_departure(&identity.user_id, departure);
        }
        self.subscribe_identity(session_id, &identity.user_id);
        if !joined.initial_state.is_empty() {
            tracing::debug!(
                session = %session_id,
                user = %identity.user_id,
                keys = joined.initial_state.len(),
                "replaying state to joiner"
            );
            self.send(conn, ServerMessage::InitialState(joined.initial_state));
        }
        self.broadcast(session_id, ServerMessage::SessionUpdated(joined.snapshot));
    }

    fn on_event(&mut self, conn: ConnectionId, identity: &Identity, event: CollaborativeEvent) {
        let Some(session_id) = self.registry.session_of(&identity.user_id).map(str::to_string) else {
            return;
        };
        if !self.registry.is_participant(&session_id, &identity.user_id) {
            return;
        }
        self.registry.record_event(&session_id, &event);
        if !event.kind.is_noisy() {
            tracing::debug!(
                session = %session_id,
                user = %identity.user_id,
                kind = %event.kind,
                "relaying collaborative event"
            );
        }
        self.relay(&session_id, conn, ServerMessage::CollaborativeEvent(event));
    }

    // Drop the leaver's connections from the old room, then tell whoever is
    // left. A removed session takes its room with it.
    fn apply_departure(&mut self, user_id: &str, departure: Departure) {
        self.unsubscribe_identity(&departure.session_id, user_id);
        match departure.remaining {
            Some(snapshot) => {
                self.broadcast(&departure.session_id, ServerMessage::SessionUpdated(snapshot));
            }
            None => {
                self.rooms.remove(&departure.session_id);
            }
        }
    }

    fn subscribe(&mut self, session_id: &str, conn: ConnectionId) {
        self.rooms
            .entry(session_id.to_string())
            .or_default()
            .insert(conn);
    }

    fn subscribe_identity(&mut self, session_id: &str, user_id: &str) {
        let tabs: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.identity.user_id == user_id)
            .map(|(id, _)| *id)
            .collect();
        self.rooms
            .entry(session_id.to_string())
            .or_default()
            .extend(tabs);
    }

    fn unsubscribe_identity(&mut self, session_id: &str, user_id: &str) {
        let Some(members) = self.rooms.get_mut(session_id) else {
            return;
        };
        let connections = &self.connections;
        members.retain(|conn| {
            connections
                .get(conn)
                .map(|c| c.identity.user_id != user_id)
                .unwrap_or(false)
        });
        if members.is_empty() {
            self.rooms.remove(session_id);
        }
    }

    fn members(&self, session_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(session_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    fn broadcast(&mut self, session_id: &str, message: ServerMessage) {
        for conn in self.members(session_id) {
            self.send(conn, message.clone());
        }
    }

    // Room-wide fan-out that skips only the sending connection; other tabs
    // of the same identity still get the event.
    fn relay(&mut self, session_id: &str, from: ConnectionId, message: ServerMessage) {
        for conn in self.members(session_id).into_iter().filter(|c| *c != from) {
            self.send(conn, message.clone());
        }
    }

    fn send(&mut self, conn: ConnectionId, message: ServerMessage) {
        let Some(connection) = self.connections.get(&conn) else {
            return;
        };
        match connection.outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) if is_droppable(&message) => {
                tracing::debug!(conn = %conn, "outbound queue full, dropping cursor update");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.lagging.contains(&conn) {
                    self.lagging.push(conn);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(conn = %conn, "outbound queue closed");
            }
        }
    }

    /// Evict stale sessions and forget their rooms. Nobody is notified.
    pub fn sweep(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<SessionId> {
        let removed = self.registry.sweep(now, max_age);
        for id in &removed {
            self.rooms.remove(id);
            tracing::info!(session = %id, "cleaned up stale session");
        }
        removed
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            active_sessions: self.registry.len(),
            active_connections: self.connections.len(),
            sessions: self.registry.summaries(),
        }
    }
}

/// Messages a lagging connection can lose without diverging from the room.
fn is_droppable(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::CollaborativeEvent(e) if e.kind.is_noisy())
}

#[derive(Debug, thiserror::Error)]
#[error("gateway worker is not running")]
pub struct GatewayClosed;

/// Cloneable sender side of the gateway worker's queue.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<Command>,
}

impl GatewayHandle {
    /// Register a connection and return its id. The greeting is queued on
    /// `outbound` before this returns.
    pub async fn connect(
        &self,
        identity: Identity,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<ConnectionId, GatewayClosed> {
        let conn = Uuid::new_v4();
        self.send(Command::Connect {
            conn,
            identity,
            outbound,
        })
        .await?;
        Ok(conn)
    }

    pub async fn inbound(&self, conn: ConnectionId, message: ClientMessage) -> Result<(), GatewayClosed> {
        self.send(Command::Inbound { conn, message }).await
    }

    /// Best-effort implicit leave; a stopped worker has nothing to clean up.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let _ = self.send(Command::Disconnect { conn }).await;
    }

    pub async fn sweep(&self, max_age: Duration) -> Result<Vec<SessionId>, GatewayClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Sweep {
            now: Utc::now(),
            max_age,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| GatewayClosed)
    }

    pub async fn stats(&self) -> Result<GatewayStats, GatewayClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| GatewayClosed)
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>, GatewayClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot {
            session_id: session_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| GatewayClosed)
    }

    async fn send(&self, command: Command) -> Result<(), GatewayClosed> {
        self.tx.send(command).await.map_err(|_| GatewayClosed)
    }
}

/// Spawn the gateway worker. It runs until every [`GatewayHandle`] is dropped.
pub fn spawn(registry: SessionRegistry) -> (GatewayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let task = tokio::spawn(run(Gateway::new(registry), rx));
    (GatewayHandle { tx }, task)
}

async fn run(mut gateway: Gateway, mut rx: mpsc::Receiver<Command>) {
    tracing::debug!("gateway worker started");
    while let Some(command) = rx.recv().await {
        gateway.handle(command);
    }
    tracing::debug!(
        sessions = gateway.registry.len(),
        "gateway worker exiting"
    );
}
