use serde::{Deserialize, Serialize};

use crate::session::{SessionId, SessionSnapshot, StateMap, UserId};

// ── Collaborative events ────────────────────────────────────────

/// Kind tag of a collaborative event.
///
/// Known kinds get their own variant; anything else is kept verbatim in
/// `Other` so newer clients can relay kinds this server has never heard of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    DomChange,
    FormInput,
    Click,
    Scroll,
    CursorMove,
    FormChange,
    SelectionChange,
    Navigation,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::DomChange => "dom-change",
            EventKind::FormInput => "form-input",
            EventKind::Click => "click",
            EventKind::Scroll => "scroll",
            EventKind::CursorMove => "cursor-move",
            EventKind::FormChange => "form-change",
            EventKind::SelectionChange => "selection-change",
            EventKind::Navigation => "navigation",
            EventKind::Other(other) => other,
        }
    }

    /// High-frequency kinds are relayed but kept out of the logs.
    pub fn is_noisy(&self) -> bool {
        matches!(self, EventKind::CursorMove)
    }

    /// The replica entry this event writes, if any.
    ///
    /// Only `form-change` persists: `data.elementId` becomes the key and
    /// `data.value` the value (JSON `null` when absent). Numeric element ids
    /// are stringified; any other shape of `elementId` persists nothing.
    pub fn replica_entry(&self, data: &serde_json::Value) -> Option<(String, serde_json::Value)> {
        if *self != EventKind::FormChange {
            return None;
        }
        let key = match data.get("elementId")? {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let value = data.get("value").cloned().unwrap_or(serde_json::Value::Null);
        Some((key, value))
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "dom-change" => EventKind::DomChange,
            "form-input" => EventKind::FormInput,
            "click" => EventKind::Click,
            "scroll" => EventKind::Scroll,
            "cursor-move" => EventKind::CursorMove,
            "form-change" => EventKind::FormChange,
            "selection-change" => EventKind::SelectionChange,
            "navigation" => EventKind::Navigation,
            _ => EventKind::Other(tag),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An application-defined event relayed between room members.
///
/// Only the kind tag is interpreted. Every other top-level field, including
/// explicit nulls and whatever shape the client gave `userId` or `timestamp`,
/// is kept as-is so the relayed copy matches what the sender produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

static NULL: serde_json::Value = serde_json::Value::Null;

impl CollaborativeEvent {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        let mut fields = serde_json::Map::new();
        fields.insert("data".to_string(), data);
        Self { kind, fields }
    }

    /// The event payload, or `null` when the sender left it out.
    pub fn data(&self) -> &serde_json::Value {
        self.fields.get("data").unwrap_or(&NULL)
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

// ── Inbound frames ──────────────────────────────────────────────

/// Raw inbound frame: `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Payload naming a target session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub session_id: SessionId,
}

/// A parsed client operation. The acting identity is never part of it; the
/// gateway supplies the identity bound at handshake time.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    CreateSession,
    JoinSession { session_id: SessionId },
    LeaveSession { session_id: SessionId },
    RequestControl { session_id: SessionId },
    ReleaseControl { session_id: SessionId },
    CollaborativeEvent(CollaborativeEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[source] serde_json::Error),
    #[error("invalid data for '{event}': {source}")]
    InvalidParams {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
}

/// Parse the frame payload, treating a missing payload as `{}`.
fn parse_params<T: serde::de::DeserializeOwned>(frame: &ClientFrame) -> Result<T, ProtocolError> {
    let data = frame
        .data
        .clone()
        .unwrap_or(serde_json::Value::Object(Default::default()));
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidParams {
        event: frame.event.clone(),
        source,
    })
}

impl ClientMessage {
    /// Parse a text frame into an operation.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: ClientFrame = serde_json::from_str(text).map_err(ProtocolError::InvalidFrame)?;
        Self::from_frame(&frame)
    }

    pub fn from_frame(frame: &ClientFrame) -> Result<Self, ProtocolError> {
        let message = match frame.event.as_str() {
            "create-session" => ClientMessage::CreateSession,
            "join-session" => {
                let p: SessionParams = parse_params(frame)?;
                ClientMessage::JoinSession { session_id: p.session_id }
            }
            "leave-session" => {
                let p: SessionParams = parse_params(frame)?;
                ClientMessage::LeaveSession { session_id: p.session_id }
            }
            "request-control" => {
                let p: SessionParams = parse_params(frame)?;
                ClientMessage::RequestControl { session_id: p.session_id }
            }
            "release-control" => {
                let p: SessionParams = parse_params(frame)?;
                ClientMessage::ReleaseControl { session_id: p.session_id }
            }
            "collaborative-event" => ClientMessage::CollaborativeEvent(parse_params(frame)?),
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(message)
    }

    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::CreateSession => "create-session",
            ClientMessage::JoinSession { .. } => "join-session",
            ClientMessage::LeaveSession { .. } => "leave-session",
            ClientMessage::RequestControl { .. } => "request-control",
            ClientMessage::ReleaseControl { .. } => "release-control",
            ClientMessage::CollaborativeEvent(_) => "collaborative-event",
        }
    }
}

// ── Outbound frames ─────────────────────────────────────────────

/// Message pushed to a connection, serialized as `{"event", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    SessionUpdated(SessionSnapshot),
    InitialState(StateMap),
    CollaborativeEvent(CollaborativeEvent),
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
