use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque session identifier (9 characters of `[0-9A-Z]`).
pub type SessionId = String;

/// Identity asserted by a connecting client.
pub type UserId = String;

/// Last-write-wins key/value replica replayed to late joiners.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// Palette participants are colored from.
pub const PARTICIPANT_COLORS: [&str; 8] = [
    "#ff6b6b", "#4ecdc4", "#45b7d1", "#96ceb4", "#feca57", "#ff9ff3", "#a8e6cf", "#ffd93d",
];

const SESSION_ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SESSION_ID_LEN: usize = 9;

/// Generate a fresh session id. Uniqueness is checked by the registry.
pub fn generate_session_id() -> SessionId {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.gen_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect()
}

/// Pick a random participant color from [`PARTICIPANT_COLORS`].
pub fn random_color() -> &'static str {
    PARTICIPANT_COLORS[rand::thread_rng().gen_range(0..PARTICIPANT_COLORS.len())]
}

/// One identity's membership record within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    pub color: String,
    pub is_owner: bool,
    pub has_control: bool,
    pub joined_at: DateTime<Utc>,
    /// Join order within the session; snapshots list participants by it.
    #[serde(skip)]
    seq: u64,
}

/// Immutable copy of a session, as broadcast in `session-updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub owner_id: UserId,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub state: StateMap,
}

impl SessionSnapshot {
    /// Look up a participant by id.
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == user_id)
    }

    /// Participants currently flagged as holding control.
    pub fn controllers(&self) -> Vec<&Participant> {
        self.participants.iter().filter(|p| p.has_control).collect()
    }
}

/// Row of the `GET /sessions` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub participant_count: usize,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

/// A collaboration session: participants, the control token, and the
/// shared state replica.
///
/// `Session` only guards its own invariants (single controller, single
/// owner). Cross-session bookkeeping such as the identity reverse index is
/// the job of [`SessionRegistry`](crate::registry::SessionRegistry).
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
    participants: HashMap<UserId, Participant>,
    controlling_user_id: UserId,
    state: StateMap,
    active: bool,
    next_seq: u64,
}

impl Session {
    /// Create a session whose only participant is the owner, holding control.
    pub fn new(id: SessionId, owner_id: &str, owner_name: &str) -> Self {
        let mut session = Self {
            id,
            owner_id: owner_id.to_string(),
            created_at: Utc::now(),
            participants: HashMap::new(),
            controlling_user_id: owner_id.to_string(),
            state: StateMap::new(),
            active: true,
            next_seq: 0,
        };
        session.insert_participant(owner_id, owner_name, true, true);
        session
    }

    fn insert_participant(&mut self, user_id: &str, name: &str, is_owner: bool, has_control: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.participants.insert(
            user_id.to_string(),
            Participant {
                id: user_id.to_string(),
                name: name.to_string(),
                color: random_color().to_string(),
                is_owner,
                has_control,
                joined_at: Utc::now(),
                seq,
            },
        );
    }

    /// Add a non-owner, non-controlling participant.
    ///
    /// If `user_id` is already a participant the existing record is kept
    /// (owner and control flags untouched) and only the display name is
    /// refreshed. Returns `true` when a new participant was added.
    pub fn add_participant(&mut self, user_id: &str, name: &str) -> bool {
        if let Some(existing) = self.participants.get_mut(user_id) {
            existing.name = name.to_string();
            return false;
        }
        self.insert_participant(user_id, name, false, false);
        true
    }

    /// Remove a participant. If they held control, control falls back to
    /// the owner. Returns `false` if `user_id` was not a participant.
    pub fn remove_participant(&mut self, user_id: &str) -> bool {
        if self.participants.remove(user_id).is_none() {
            return false;
        }
        if self.controlling_user_id == user_id {
            self.fall_back_to_owner();
        }
        true
    }

    /// Hand the control token to `user_id`. No-op unless they participate.
    pub fn request_control(&mut self, user_id: &str) -> bool {
        if !self.participants.contains_key(user_id) {
            return false;
        }
        if let Some(current) = self.participants.get_mut(&self.controlling_user_id) {
            current.has_control = false;
        }
        self.controlling_user_id = user_id.to_string();
        if let Some(requester) = self.participants.get_mut(user_id) {
            requester.has_control = true;
        }
        true
    }

    /// Give up control. No-op unless `user_id` is the current controller;
    /// otherwise control falls back to the owner. Returns whether anything
    /// changed.
    pub fn release_control(&mut self, user_id: &str) -> bool {
        if self.controlling_user_id != user_id {
            return false;
        }
        if let Some(releaser) = self.participants.get_mut(user_id) {
            releaser.has_control = false;
        }
        self.fall_back_to_owner();
        true
    }

    // The owner may no longer be a participant; the control id still points
    // at them and nobody present holds the flag until someone requests it.
    fn fall_back_to_owner(&mut self) {
        self.controlling_user_id = self.owner_id.clone();
        if let Some(owner) = self.participants.get_mut(&self.owner_id) {
            owner.has_control = true;
        }
    }

    /// Upsert one replica key.
    pub fn update_state(&mut self, key: String, value: serde_json::Value) {
        self.state.insert(key, value);
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn controlling_user_id(&self) -> &str {
        &self.controlling_user_id
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut participants: Vec<Participant> = self.participants.values().cloned().collect();
        participants.sort_by_key(|p| p.seq);
        SessionSnapshot {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            participants,
            created_at: self.created_at,
            is_active: self.active,
            state: self.state.clone(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            participant_count: self.participants.len(),
            created_at: self.created_at,
            is_active: self.active,
        }
    }
}
