use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::protocol::CollaborativeEvent;
use crate::session::{
    generate_session_id, Session, SessionId, SessionSnapshot, SessionSummary, StateMap, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found or inactive: {0}")]
    NotFound(SessionId),
}

/// What became of a session after one of its participants left.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub session_id: SessionId,
    /// Snapshot for the remaining participants, or `None` if the session
    /// was emptied and removed.
    pub remaining: Option<SessionSnapshot>,
}

/// Result of [`SessionRegistry::create_session`].
#[derive(Debug, Clone)]
pub struct Created {
    pub session_id: SessionId,
    pub snapshot: SessionSnapshot,
    /// The creator's previous session, if they had to leave one.
    pub departed: Option<Departure>,
}

/// Result of [`SessionRegistry::join_session`].
#[derive(Debug, Clone)]
pub struct Joined {
    pub snapshot: SessionSnapshot,
    /// Replica contents to replay privately to the joiner.
    pub initial_state: StateMap,
    pub departed: Option<Departure>,
}

/// Process-wide store of sessions plus the identity → session reverse index.
///
/// All methods take `&mut self` or `&self` and never block: the registry is
/// owned by the single gateway worker, which is what serialises mutations.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    user_sessions: HashMap<UserId, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session owned (and controlled) by `owner_id`.
    ///
    /// If the owner currently belongs to another session they leave it
    /// first, so the reverse index keeps a single entry per identity.
    pub fn create_session(&mut self, owner_id: &str, owner_name: &str) -> Created {
        let departed = self.leave_current(owner_id, None);

        let session_id = loop {
            let candidate = generate_session_id();
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Session::new(session_id.clone(), owner_id, owner_name);
        let snapshot = session.snapshot();
        self.sessions.insert(session_id.clone(), session);
        self.user_sessions.insert(owner_id.to_string(), session_id.clone());

        tracing::info!(session = %session_id, user = %owner_id, "session created");

        Created {
            session_id,
            snapshot,
            departed,
        }
    }

    /// Add `user_id` to an active session.
    ///
    /// Fails with [`RegistryError::NotFound`] if the session is missing or
    /// inactive. Membership in any other session is dropped first.
    pub fn join_session(
        &mut self,
        session_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<Joined, RegistryError> {
        match self.sessions.get(session_id) {
            Some(session) if session.is_active() => {}
            _ => return Err(RegistryError::NotFound(session_id.to_string())),
        }

        let departed = self.leave_current(user_id, Some(session_id));

        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        if session.add_participant(user_id, user_name) {
            tracing::info!(session = %session_id, user = %user_id, "participant joined");
        } else {
            tracing::debug!(session = %session_id, user = %user_id, "participant re-joined");
        }
        let snapshot = session.snapshot();
        let initial_state = session.state().clone();
        self.user_sessions
            .insert(user_id.to_string(), session_id.to_string());

        Ok(Joined {
            snapshot,
            initial_state,
            departed,
        })
    }

    /// Remove `user_id` from a session.
    ///
    /// Returns `None` when the session or the participant does not exist.
    /// An emptied session is deactivated and dropped from the registry.
    pub fn leave_session(&mut self, session_id: &str, user_id: &str) -> Option<Departure> {
        let session = self.sessions.get_mut(session_id)?;
        if !session.remove_participant(user_id) {
            return None;
        }
        if self.user_sessions.get(user_id).map(String::as_str) == Some(session_id) {
            self.user_sessions.remove(user_id);
        }
        tracing::info!(session = %session_id, user = %user_id, "participant left");

        let remaining = if session.is_empty() {
            session.deactivate();
            self.sessions.remove(session_id);
            tracing::info!(session = %session_id, "session removed (no participants)");
            None
        } else {
            Some(session.snapshot())
        };

        Some(Departure {
            session_id: session_id.to_string(),
            remaining,
        })
    }

    // Leave whatever session `user_id` is in, unless it is `keep`.
    fn leave_current(&mut self, user_id: &str, keep: Option<&str>) -> Option<Departure> {
        let current = self.user_sessions.get(user_id)?.clone();
        if keep == Some(current.as_str()) {
            return None;
        }
        let departed = self.leave_session(&current, user_id);
        // The index may point at a session that no longer lists the user.
        self.user_sessions.remove(user_id);
        departed
    }

    /// Hand control to `user_id`. Returns the new snapshot, or `None` if
    /// the session does not exist or `user_id` is not a participant.
    pub fn request_control(&mut self, session_id: &str, user_id: &str) -> Option<SessionSnapshot> {
        let session = self.sessions.get_mut(session_id)?;
        if !session.request_control(user_id) {
            return None;
        }
        tracing::info!(session = %session_id, user = %user_id, "control granted");
        Some(session.snapshot())
    }

    /// Release control held by `user_id`.
    ///
    /// Any participant's call is accepted and yields a snapshot; state only
    /// changes when `user_id` actually holds control, in which case it
    /// returns to the owner.
    pub fn release_control(&mut self, session_id: &str, user_id: &str) -> Option<SessionSnapshot> {
        let session = self.sessions.get_mut(session_id)?;
        if !session.contains(user_id) {
            return None;
        }
        if session.release_control(user_id) {
            tracing::info!(
                session = %session_id,
                user = %user_id,
                owner = %session.owner_id,
                "control released to owner"
            );
        }
        Some(session.snapshot())
    }

    /// Persist the replica slice of `event`, if it carries one.
    /// Returns `true` when the replica was written.
    pub fn record_event(&mut self, session_id: &str, event: &CollaborativeEvent) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        match event.kind.replica_entry(event.data()) {
            Some((key, value)) => {
                tracing::debug!(session = %session_id, key = %key, "replica updated");
                session.update_state(key, value);
                true
            }
            None => false,
        }
    }

    /// Remove every session that is inactive or older than `max_age` at
    /// `now`. Returns the removed ids. Participants are not notified.
    pub fn sweep(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| {
                let expired = now
                    .signed_duration_since(session.created_at)
                    .to_std()
                    .map(|age| age > max_age)
                    .unwrap_or(false);
                !session.is_active() || expired
            })
            .map(|session| session.id.clone())
            .collect();

        for id in &stale {
            self.sessions.remove(id);
        }
        self.user_sessions
            .retain(|_, session_id| !stale.contains(session_id));
        stale
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(session_id).map(Session::snapshot)
    }

    /// The session `user_id` currently belongs to.
    pub fn session_of(&self, user_id: &str) -> Option<&str> {
        self.user_sessions.get(user_id).map(String::as_str)
    }

    pub fn is_participant(&self, session_id: &str, user_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.contains(user_id))
            .unwrap_or(false)
    }

    /// Listing rows, oldest session first.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut rows: Vec<SessionSummary> = self.sessions.values().map(Session::summary).collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        rows
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;
    use serde_json::json;

    fn assert_single_controller(registry: &SessionRegistry, session_id: &str) {
        let session = registry.get(session_id).expect("session should exist");
        let snap = session.snapshot();
        let controllers = snap.controllers();
        assert_eq!(controllers.len(), 1, "expected one controller, got {controllers:?}");
        assert_eq!(controllers[0].id, session.controlling_user_id());
    }

    fn assert_single_owner(registry: &SessionRegistry, session_id: &str, owner: &str) {
        let snap = registry.snapshot(session_id).expect("session should exist");
        let owners: Vec<_> = snap.participants.iter().filter(|p| p.is_owner).collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].id, owner);
        assert_eq!(snap.owner_id, owner);
    }

    fn form_change(key: &str, value: serde_json::Value) -> CollaborativeEvent {
        CollaborativeEvent::new(EventKind::FormChange, json!({"elementId": key, "value": value}))
    }

    #[test]
    fn create_session_yields_owner_snapshot() {
        let mut registry = SessionRegistry::new();
        let created = registry.create_session("O", "Oscar");

        assert!(created.departed.is_none());
        assert_eq!(created.snapshot.owner_id, "O");
        assert_eq!(created.snapshot.participants.len(), 1);
        let owner = &created.snapshot.participants[0];
        assert_eq!(owner.id, "O");
        assert!(owner.is_owner);
        assert!(owner.has_control);
        assert_eq!(registry.session_of("O"), Some(created.session_id.as_str()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn control_request_then_leave_returns_control_to_owner() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        registry.join_session(&s, "U", "Uma").unwrap();

        let snap = registry.request_control(&s, "U").expect("participant may request");
        assert!(snap.participant("U").unwrap().has_control);
        assert!(!snap.participant("O").unwrap().has_control);
        assert_single_controller(&registry, &s);

        let departure = registry.leave_session(&s, "U").expect("U was a participant");
        let snap = departure.remaining.expect("session still has the owner");
        assert!(snap.participant("O").unwrap().has_control);
        assert_eq!(snap.participants.len(), 1);
        assert_single_controller(&registry, &s);
        assert_single_owner(&registry, &s, "O");
    }

    #[test]
    fn join_missing_session_is_not_found() {
        let mut registry = SessionRegistry::new();
        let err = registry.join_session("NOPE", "U", "Uma").unwrap_err();
        assert_eq!(err, RegistryError::NotFound("NOPE".into()));
        assert!(registry.session_of("U").is_none());
    }

    #[test]
    fn join_switches_sessions() {
        let mut registry = SessionRegistry::new();
        let a = registry.create_session("A", "Ann").session_id;
        let b = registry.create_session("B", "Bob").session_id;
        registry.join_session(&a, "U", "Uma").unwrap();

        let joined = registry.join_session(&b, "U", "Uma").unwrap();
        let departed = joined.departed.expect("U left session A");
        assert_eq!(departed.session_id, a);
        let remaining = departed.remaining.expect("A still has its owner");
        assert!(remaining.participant("U").is_none());

        assert_eq!(registry.session_of("U"), Some(b.as_str()));
        assert!(!registry.is_participant(&a, "U"));
        assert!(registry.is_participant(&b, "U"));
    }

    #[test]
    fn creating_while_in_a_session_leaves_it() {
        let mut registry = SessionRegistry::new();
        let a = registry.create_session("O", "Oscar").session_id;
        let created = registry.create_session("O", "Oscar");

        let departed = created.departed.expect("owner left their first session");
        assert_eq!(departed.session_id, a);
        assert!(departed.remaining.is_none(), "emptied session is removed");
        assert!(registry.get(&a).is_none());
        assert_eq!(registry.session_of("O"), Some(created.session_id.as_str()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rejoining_current_session_keeps_owner_flags() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        let joined = registry.join_session(&s, "O", "Oscar").unwrap();

        assert!(joined.departed.is_none());
        assert_eq!(joined.snapshot.participants.len(), 1);
        assert_single_owner(&registry, &s, "O");
        assert_single_controller(&registry, &s);
    }

    #[test]
    fn last_leave_removes_session() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;

        let departure = registry.leave_session(&s, "O").unwrap();
        assert!(departure.remaining.is_none());
        assert!(registry.is_empty());
        assert!(registry.session_of("O").is_none());
        assert!(registry.summaries().is_empty());
        assert_eq!(
            registry.join_session(&s, "V", "Vic").unwrap_err(),
            RegistryError::NotFound(s.clone())
        );
    }

    #[test]
    fn leave_by_stranger_is_noop() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        assert!(registry.leave_session(&s, "ghost").is_none());
        assert!(registry.leave_session("NOPE", "O").is_none());
        assert_eq!(registry.get(&s).unwrap().participant_count(), 1);
    }

    #[test]
    fn request_control_requires_membership() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        assert!(registry.request_control(&s, "ghost").is_none());
        assert!(registry.request_control("NOPE", "O").is_none());
        assert_single_controller(&registry, &s);
    }

    #[test]
    fn last_request_processed_wins() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        registry.join_session(&s, "U", "Uma").unwrap();
        registry.join_session(&s, "V", "Vic").unwrap();

        registry.request_control(&s, "U").unwrap();
        let snap = registry.request_control(&s, "V").unwrap();
        assert!(snap.participant("V").unwrap().has_control);
        assert!(!snap.participant("U").unwrap().has_control);
        assert_single_controller(&registry, &s);
    }

    #[test]
    fn release_by_non_controller_is_idempotent() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        registry.join_session(&s, "U", "Uma").unwrap();

        let first = registry.release_control(&s, "U").expect("participant call accepted");
        let second = registry.release_control(&s, "U").expect("participant call accepted");
        assert_eq!(first, second);
        assert!(first.participant("O").unwrap().has_control);
        assert!(registry.release_control(&s, "ghost").is_none());
    }

    #[test]
    fn release_by_controller_returns_to_owner() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        registry.join_session(&s, "U", "Uma").unwrap();
        registry.request_control(&s, "U").unwrap();

        let snap = registry.release_control(&s, "U").unwrap();
        assert!(snap.participant("O").unwrap().has_control);
        assert!(!snap.participant("U").unwrap().has_control);
        assert_single_controller(&registry, &s);
    }

    #[test]
    fn owner_departure_leaves_control_with_absent_owner() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        registry.join_session(&s, "U", "Uma").unwrap();
        registry.join_session(&s, "V", "Vic").unwrap();
        registry.request_control(&s, "U").unwrap();
        registry.leave_session(&s, "O").unwrap();

        let snap = registry.leave_session(&s, "U").unwrap().remaining.unwrap();
        assert_eq!(registry.get(&s).unwrap().controlling_user_id(), "O");
        assert!(snap.controllers().is_empty());
        assert_eq!(snap.owner_id, "O");

        // Anyone remaining can pick the token back up.
        let snap = registry.request_control(&s, "V").unwrap();
        assert!(snap.participant("V").unwrap().has_control);
        assert_single_controller(&registry, &s);
    }

    #[test]
    fn form_change_persists_and_replays_to_joiner() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;

        assert!(registry.record_event(&s, &form_change("x", json!(42))));
        let joined = registry.join_session(&s, "V", "Vic").unwrap();
        assert_eq!(joined.initial_state.get("x"), Some(&json!(42)));
        assert_eq!(joined.snapshot.state.get("x"), Some(&json!(42)));
    }

    #[test]
    fn replica_is_last_write_wins() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        registry.record_event(&s, &form_change("x", json!(1)));
        registry.record_event(&s, &form_change("x", json!(2)));
        assert_eq!(registry.snapshot(&s).unwrap().state.get("x"), Some(&json!(2)));
    }

    #[test]
    fn other_events_do_not_touch_replica() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        let click = CollaborativeEvent::new(EventKind::Click, json!({"elementId": "x", "value": 1}));
        let custom = CollaborativeEvent::new(EventKind::Other("laser".into()), json!({}));
        assert!(!registry.record_event(&s, &click));
        assert!(!registry.record_event(&s, &custom));
        assert!(registry.snapshot(&s).unwrap().state.is_empty());
        assert!(registry.join_session(&s, "V", "Vic").unwrap().initial_state.is_empty());
    }

    #[test]
    fn sweep_evicts_stale_sessions_only() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        let max_age = Duration::from_secs(24 * 60 * 60);

        assert!(registry.sweep(Utc::now(), max_age).is_empty());
        assert_eq!(registry.len(), 1);

        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(registry.sweep(later, max_age), vec![s.clone()]);
        assert!(registry.is_empty());
        assert!(registry.session_of("O").is_none());
    }

    #[test]
    fn summaries_report_participant_counts() {
        let mut registry = SessionRegistry::new();
        let s = registry.create_session("O", "Oscar").session_id;
        registry.join_session(&s, "U", "Uma").unwrap();

        let rows = registry.summaries();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, s);
        assert_eq!(rows[0].participant_count, 2);
        assert!(rows[0].is_active);
        assert_eq!(registry.list(), vec![s]);
    }
}
