use crate::error::RegistryError;
use crate::types::{CallDirection, CallSession, CallStatus, LifecycleEvent};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const LIFECYCLE_CHANNEL_DEPTH: usize = 256;

/// How a caller addresses a session.
#[derive(Clone, Copy, Debug)]
pub enum SessionKey<'a> {
    Id(&'a str),
    CallRef(&'a str),
}

/// Outcome of a successful status update.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusChange {
    pub from: CallStatus,
    pub session: CallSession,
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct CallMetrics {
    pub active_calls: usize,
    pub total_calls: u64,
    pub ended_calls: u64,
}

struct SessionEntry {
    session: CallSession,
    /// Cancelled when the session reaches a terminal status
    cancel: CancellationToken,
}

/// Single source of truth for live call sessions.
///
/// Entries are keyed by the provider's call reference; the map shards its locks so
/// concurrent updates for different calls never contend on one global lock. Every
/// mutation of an entry happens while holding that entry's shard lock, and when both
/// maps are touched the order is always `by_ref` then `by_id`.
pub struct CallRegistry {
    by_ref: DashMap<String, SessionEntry>,
    // session id => external call ref
    by_id: DashMap<String, String>,
    events: broadcast::Sender<LifecycleEvent>,
    total_calls: AtomicU64,
    ended_calls: AtomicU64,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_DEPTH);
        Self {
            by_ref: DashMap::new(),
            by_id: DashMap::new(),
            events,
            total_calls: AtomicU64::new(0),
            ended_calls: AtomicU64::new(0),
        }
    }

    /// Receive lifecycle events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    #[cfg(test)]
    pub fn create(
        &self,
        external_call_ref: &str,
        direction: CallDirection,
    ) -> Result<CallSession, RegistryError> {
        self.create_with_parties(external_call_ref, direction, None, None)
    }

    pub fn create_with_parties(
        &self,
        external_call_ref: &str,
        direction: CallDirection,
        from: Option<String>,
        to: Option<String>,
    ) -> Result<CallSession, RegistryError> {
        if external_call_ref.trim().is_empty() {
            return Err(RegistryError::MissingCallRef);
        }
        let session = CallSession {
            session_id: Uuid::new_v4().to_string(),
            external_call_ref: external_call_ref.to_string(),
            direction,
            status: direction.initial_status(),
            from,
            to,
            started_at: OffsetDateTime::now_utc(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
        };
        let entry = SessionEntry {
            session: session.clone(),
            cancel: CancellationToken::new(),
        };

        match self.by_ref.entry(external_call_ref.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().session.status.is_terminal() {
                    return Err(RegistryError::DuplicateSession(
                        external_call_ref.to_string(),
                    ));
                }
                // An ended session that was never removed gets replaced.
                let stale = occupied.insert(entry);
                self.by_id.remove(&stale.session.session_id);
                self.by_id
                    .insert(session.session_id.clone(), external_call_ref.to_string());
                self.publish(LifecycleEvent::SessionCreated(session.clone()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                self.by_id
                    .insert(session.session_id.clone(), external_call_ref.to_string());
                self.publish(LifecycleEvent::SessionCreated(session.clone()));
            }
        }
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id=%session.session_id,
            call_sid=%session.external_call_ref,
            direction=?session.direction,
            "session created"
        );

        Ok(session)
    }

    pub fn get(&self, key: SessionKey<'_>) -> Result<CallSession, RegistryError> {
        let call_ref = self.resolve(key)?;
        self.by_ref
            .get(&call_ref)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| RegistryError::NotFound(call_ref))
    }

    /// Token that is cancelled once the session reaches a terminal status.
    pub fn cancellation_token(
        &self,
        key: SessionKey<'_>,
    ) -> Result<CancellationToken, RegistryError> {
        let call_ref = self.resolve(key)?;
        self.by_ref
            .get(&call_ref)
            .map(|entry| entry.cancel.clone())
            .ok_or_else(|| RegistryError::NotFound(call_ref))
    }

    pub fn update_status(
        &self,
        key: SessionKey<'_>,
        status: CallStatus,
        end_reason: Option<String>,
    ) -> Result<StatusChange, RegistryError> {
        let call_ref = self.resolve(key)?;
        let mut entry = self
            .by_ref
            .get_mut(&call_ref)
            .ok_or_else(|| RegistryError::NotFound(call_ref.clone()))?;

        let from = entry.session.status;
        if !from.can_transition_to(status) {
            return Err(RegistryError::InvalidTransition { from, to: status });
        }

        let now = OffsetDateTime::now_utc();
        entry.session.status = status;
        if status == CallStatus::InProgress {
            entry.session.answered_at = Some(now);
        }
        if status.is_terminal() {
            entry.session.ended_at = Some(now);
            entry.session.end_reason =
                Some(end_reason.unwrap_or_else(|| status.as_str().to_string()));
            entry.cancel.cancel();
        }
        let session = entry.session.clone();
        self.publish(LifecycleEvent::StatusChanged {
            session_id: session.session_id.clone(),
            external_call_ref: session.external_call_ref.clone(),
            from,
            to: status,
            at: now,
        });
        drop(entry);

        debug!(session_id=%session.session_id, %from, to=%status, "status changed");
        Ok(StatusChange { from, session })
    }

    pub fn remove(&self, session_id: &str) -> Result<CallSession, RegistryError> {
        let call_ref = self.resolve(SessionKey::Id(session_id))?;
        let removed = match self.by_ref.entry(call_ref) {
            Entry::Occupied(occupied) => {
                let session = &occupied.get().session;
                if session.session_id != session_id {
                    return Err(RegistryError::NotFound(session_id.to_string()));
                }
                if !session.status.is_terminal() {
                    return Err(RegistryError::SessionStillActive(session_id.to_string()));
                }
                let (_, entry) = occupied.remove_entry();
                self.by_id.remove(session_id);
                self.publish(LifecycleEvent::SessionEnded(entry.session.clone()));
                entry.session
            }
            Entry::Vacant(_) => return Err(RegistryError::NotFound(session_id.to_string())),
        };
        self.ended_calls.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id=%removed.session_id,
            status=%removed.status,
            reason=?removed.end_reason,
            "session ended"
        );

        Ok(removed)
    }

    pub fn active_sessions(&self) -> Vec<CallSession> {
        let mut sessions: Vec<CallSession> = self
            .by_ref
            .iter()
            .filter(|entry| !entry.session.status.is_terminal())
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn metrics(&self) -> CallMetrics {
        CallMetrics {
            active_calls: self
                .by_ref
                .iter()
                .filter(|entry| !entry.session.status.is_terminal())
                .count(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            ended_calls: self.ended_calls.load(Ordering::Relaxed),
        }
    }

    fn resolve(&self, key: SessionKey<'_>) -> Result<String, RegistryError> {
        match key {
            SessionKey::CallRef(call_ref) => Ok(call_ref.to_string()),
            SessionKey::Id(id) => self
                .by_id
                .get(id)
                .map(|r| r.value().clone())
                .ok_or_else(|| RegistryError::NotFound(id.to_string())),
        }
    }

    fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine; delivery is best-effort.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn outbound_sessions_start_initiated_and_inbound_ringing() {
        let registry = CallRegistry::new();
        let outbound = registry.create("CA1", CallDirection::Outbound).unwrap();
        let inbound = registry.create("CA2", CallDirection::Inbound).unwrap();
        assert_eq!(outbound.status, CallStatus::Initiated);
        assert_eq!(inbound.status, CallStatus::Ringing);
        assert_ne!(outbound.session_id, inbound.session_id);
    }

    #[test]
    fn create_twice_for_a_live_call_is_a_duplicate() {
        let registry = CallRegistry::new();
        registry.create("CA1", CallDirection::Inbound).unwrap();
        assert_eq!(
            registry.create("CA1", CallDirection::Inbound).unwrap_err(),
            RegistryError::DuplicateSession("CA1".into())
        );
    }

    #[test]
    fn create_replaces_an_ended_but_unremoved_session() {
        let registry = CallRegistry::new();
        let first = registry.create("CA1", CallDirection::Inbound).unwrap();
        registry
            .update_status(SessionKey::CallRef("CA1"), CallStatus::Busy, None)
            .unwrap();
        let second = registry.create("CA1", CallDirection::Inbound).unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(matches!(
            registry.get(SessionKey::Id(&first.session_id)),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn empty_call_reference_is_rejected() {
        let registry = CallRegistry::new();
        assert_eq!(
            registry.create("  ", CallDirection::Inbound).unwrap_err(),
            RegistryError::MissingCallRef
        );
    }

    #[test]
    fn get_resolves_both_kinds_of_key() {
        let registry = CallRegistry::new();
        let created = registry.create("CA1", CallDirection::Outbound).unwrap();
        assert_eq!(registry.get(SessionKey::Id(&created.session_id)).unwrap(), created);
        assert_eq!(registry.get(SessionKey::CallRef("CA1")).unwrap(), created);
        assert!(matches!(
            registry.get(SessionKey::CallRef("CA404")),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn backwards_transition_is_invalid() {
        let registry = CallRegistry::new();
        registry.create("CA1", CallDirection::Inbound).unwrap();
        registry
            .update_status(SessionKey::CallRef("CA1"), CallStatus::InProgress, None)
            .unwrap();
        assert_eq!(
            registry
                .update_status(SessionKey::CallRef("CA1"), CallStatus::Ringing, None)
                .unwrap_err(),
            RegistryError::InvalidTransition {
                from: CallStatus::InProgress,
                to: CallStatus::Ringing
            }
        );
    }

    #[test]
    fn terminal_transition_stamps_end_and_cancels_the_session_token() {
        let registry = CallRegistry::new();
        let created = registry.create("CA1", CallDirection::Inbound).unwrap();
        let token = registry
            .cancellation_token(SessionKey::Id(&created.session_id))
            .unwrap();
        let answered = registry
            .update_status(SessionKey::CallRef("CA1"), CallStatus::InProgress, None)
            .unwrap();
        assert!(answered.session.answered_at.is_some());
        assert!(!token.is_cancelled());

        let ended = registry
            .update_status(SessionKey::CallRef("CA1"), CallStatus::Completed, None)
            .unwrap();
        assert_eq!(ended.from, CallStatus::InProgress);
        assert!(ended.session.ended_at.is_some());
        assert_eq!(ended.session.end_reason.as_deref(), Some("completed"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn remove_requires_a_terminal_session() {
        let registry = CallRegistry::new();
        let created = registry.create("CA1", CallDirection::Inbound).unwrap();
        assert_eq!(
            registry.remove(&created.session_id).unwrap_err(),
            RegistryError::SessionStillActive(created.session_id.clone())
        );

        registry
            .update_status(
                SessionKey::Id(&created.session_id),
                CallStatus::Failed,
                Some("carrier_error".into()),
            )
            .unwrap();
        let removed = registry.remove(&created.session_id).unwrap();
        assert_eq!(removed.end_reason.as_deref(), Some("carrier_error"));
        assert!(matches!(
            registry.remove(&created.session_id),
            Err(RegistryError::NotFound(_))
        ));
        assert!(registry.active_sessions().is_empty());
    }

    #[test]
    fn every_mutation_publishes_one_lifecycle_event() {
        let registry = CallRegistry::new();
        let mut rx = registry.subscribe();
        let created = registry.create("CA1", CallDirection::Outbound).unwrap();
        registry
            .update_status(SessionKey::CallRef("CA1"), CallStatus::Ringing, None)
            .unwrap();
        registry
            .update_status(SessionKey::CallRef("CA1"), CallStatus::NoAnswer, None)
            .unwrap();
        registry.remove(&created.session_id).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], LifecycleEvent::SessionCreated(s) if s.session_id == created.session_id));
        assert!(matches!(
            &events[1],
            LifecycleEvent::StatusChanged { from: CallStatus::Initiated, to: CallStatus::Ringing, .. }
        ));
        assert!(matches!(
            &events[2],
            LifecycleEvent::StatusChanged { to: CallStatus::NoAnswer, .. }
        ));
        assert!(matches!(&events[3], LifecycleEvent::SessionEnded(s) if s.status == CallStatus::NoAnswer));
    }

    #[test]
    fn metrics_count_live_and_ended_calls() {
        let registry = CallRegistry::new();
        let a = registry.create("CA1", CallDirection::Inbound).unwrap();
        registry.create("CA2", CallDirection::Outbound).unwrap();
        registry
            .update_status(SessionKey::Id(&a.session_id), CallStatus::Completed, None)
            .unwrap();
        registry.remove(&a.session_id).unwrap();

        assert_eq!(
            registry.metrics(),
            CallMetrics {
                active_calls: 1,
                total_calls: 2,
                ended_calls: 1
            }
        );
    }
}
