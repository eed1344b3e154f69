use crate::error::RegistryError;
use crate::registry::{CallRegistry, SessionKey, StatusChange};
use crate::types::{CallDirection, CallSession, CallStatus};

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const RECENTLY_ENDED_CAPACITY: usize = 1_024;

/// A provider status notification, decoded once at the http boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusEvent {
    pub external_call_ref: String,
    pub status: CallStatus,
    pub direction: Option<CallDirection>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub timestamp: Option<OffsetDateTime>,
}

impl StatusEvent {
    pub fn new(external_call_ref: impl Into<String>, status: CallStatus) -> Self {
        Self {
            external_call_ref: external_call_ref.into(),
            status,
            direction: None,
            from: None,
            to: None,
            timestamp: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    /// First notification for an inbound call; the session now exists
    Created(CallSession),
    Applied(StatusChange),
    /// The call reached a terminal status and left the live registry
    Ended(CallSession),
    /// Redelivery of the status the session already has
    Duplicate,
    /// Would move the session backwards or out of a terminal state
    Stale {
        current: CallStatus,
        requested: CallStatus,
    },
    /// Late notification for a call that already ended
    AlreadyEnded,
    /// Nothing to correlate the notification with
    Unknown,
}

/// Bounded memory of call refs whose sessions already ended.
struct RecentlyEnded {
    order: VecDeque<String>,
    refs: HashSet<String>,
}

impl RecentlyEnded {
    fn insert(&mut self, call_ref: &str) {
        if !self.refs.insert(call_ref.to_string()) {
            return;
        }
        self.order.push_back(call_ref.to_string());
        if self.order.len() > RECENTLY_ENDED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.refs.remove(&oldest);
            }
        }
    }
}

/// Turns at-least-once, possibly reordered status notifications into registry
/// transitions. Redeliveries and backwards transitions are absorbed rather than
/// reported, since the provider only needs an acknowledgment.
pub struct StatusDispatcher {
    registry: Arc<CallRegistry>,
    recently_ended: Mutex<RecentlyEnded>,
}

impl StatusDispatcher {
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self {
            registry,
            recently_ended: Mutex::new(RecentlyEnded {
                order: VecDeque::new(),
                refs: HashSet::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn dispatch(&self, event: &StatusEvent) -> DispatchOutcome {
        debug!(
            call_sid=%event.external_call_ref,
            status=%event.status,
            timestamp=?event.timestamp,
            "dispatching status event"
        );
        if self.has_ended(&event.external_call_ref) {
            debug!(call_sid=%event.external_call_ref, "status event for ended call dropped");
            return DispatchOutcome::AlreadyEnded;
        }
        match self.registry.get(SessionKey::CallRef(&event.external_call_ref)) {
            Ok(_) => self.apply(event),
            Err(_) => self.register_from_event(event),
        }
    }

    /// Register a call we placed ourselves. A status callback may have raced us and
    /// created the session already, in which case that session is returned.
    pub fn register_outbound(
        &self,
        external_call_ref: &str,
        from: Option<String>,
        to: Option<String>,
    ) -> Result<CallSession, RegistryError> {
        match self.registry.create_with_parties(
            external_call_ref,
            CallDirection::Outbound,
            from,
            to,
        ) {
            Err(RegistryError::DuplicateSession(_)) => {
                self.registry.get(SessionKey::CallRef(external_call_ref))
            }
            other => other,
        }
    }

    /// End a live session on our own initiative, e.g. when the turn loop gives up.
    pub fn end_session(
        &self,
        session_id: &str,
        status: CallStatus,
        reason: &str,
    ) -> Result<CallSession, RegistryError> {
        let change =
            self.registry
                .update_status(SessionKey::Id(session_id), status, Some(reason.to_string()))?;
        Ok(self.finish(change.session))
    }

    fn register_from_event(&self, event: &StatusEvent) -> DispatchOutcome {
        if event.status.is_terminal() {
            info!(
                call_sid=%event.external_call_ref,
                status=%event.status,
                "terminal status for untracked call ignored"
            );
            return DispatchOutcome::Unknown;
        }
        let direction = event.direction.unwrap_or(CallDirection::Inbound);
        match self.registry.create_with_parties(
            &event.external_call_ref,
            direction,
            event.from.clone(),
            event.to.clone(),
        ) {
            Ok(session) if session.status.can_transition_to(event.status) => {
                match self.apply(event) {
                    DispatchOutcome::Applied(change) => DispatchOutcome::Created(change.session),
                    other => other,
                }
            }
            Ok(session) => DispatchOutcome::Created(session),
            // Another delivery for the same call won the race to create it.
            Err(RegistryError::DuplicateSession(_)) => self.apply(event),
            Err(e) => {
                warn!(error=%e, call_sid=%event.external_call_ref, "failed to register call");
                DispatchOutcome::Unknown
            }
        }
    }

    fn apply(&self, event: &StatusEvent) -> DispatchOutcome {
        match self.registry.update_status(
            SessionKey::CallRef(&event.external_call_ref),
            event.status,
            None,
        ) {
            Ok(change) if change.session.status.is_terminal() => {
                DispatchOutcome::Ended(self.finish(change.session))
            }
            Ok(change) => DispatchOutcome::Applied(change),
            Err(RegistryError::InvalidTransition { from, to }) if from == to => {
                debug!(call_sid=%event.external_call_ref, status=%to, "duplicate status event");
                DispatchOutcome::Duplicate
            }
            Err(RegistryError::InvalidTransition { from, to }) => {
                warn!(
                    call_sid=%event.external_call_ref,
                    current=%from,
                    requested=%to,
                    "out-of-order status event ignored"
                );
                DispatchOutcome::Stale {
                    current: from,
                    requested: to,
                }
            }
            Err(RegistryError::NotFound(_)) => DispatchOutcome::AlreadyEnded,
            Err(e) => {
                warn!(error=%e, call_sid=%event.external_call_ref, "failed to apply status event");
                DispatchOutcome::Unknown
            }
        }
    }

    /// Retire a session that just turned terminal. Only the caller whose transition
    /// made it terminal gets here, so the session is removed exactly once.
    fn finish(&self, session: CallSession) -> CallSession {
        self.remember_ended(&session.external_call_ref);
        match self.registry.remove(&session.session_id) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error=%e, session_id=%session.session_id, "failed to remove ended session");
                session
            }
        }
    }

    fn has_ended(&self, call_ref: &str) -> bool {
        self.recently_ended
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .refs
            .contains(call_ref)
    }

    fn remember_ended(&self, call_ref: &str) {
        self.recently_ended
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(call_ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LifecycleEvent;
    use proptest::prelude::*;
    use proptest::sample::subsequence;
    use tokio::sync::broadcast;

    fn setup() -> (StatusDispatcher, broadcast::Receiver<LifecycleEvent>) {
        let registry = Arc::new(CallRegistry::new());
        let rx = registry.subscribe();
        (StatusDispatcher::new(registry), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn ended_count(events: &[LifecycleEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::SessionEnded(_)))
            .count()
    }

    #[test]
    fn first_inbound_webhook_creates_the_session() {
        let (dispatcher, _rx) = setup();
        let mut event = StatusEvent::new("CA1", CallStatus::Ringing);
        event.from = Some("+15551230000".into());
        let outcome = dispatcher.dispatch(&event);
        let DispatchOutcome::Created(session) = outcome else {
            panic!("expected a new session, got {outcome:?}");
        };
        assert_eq!(session.direction, CallDirection::Inbound);
        assert_eq!(session.status, CallStatus::Ringing);
        assert_eq!(session.from.as_deref(), Some("+15551230000"));
    }

    #[test]
    fn inbound_call_may_arrive_already_answered() {
        let (dispatcher, _rx) = setup();
        let outcome = dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::InProgress));
        assert!(matches!(
            outcome,
            DispatchOutcome::Created(CallSession { status: CallStatus::InProgress, .. })
        ));
    }

    #[test]
    fn redelivered_status_is_a_silent_duplicate() {
        let (dispatcher, mut rx) = setup();
        dispatcher.register_outbound("CA1", None, None).unwrap();
        let ringing = StatusEvent::new("CA1", CallStatus::Ringing);
        assert!(matches!(dispatcher.dispatch(&ringing), DispatchOutcome::Applied(_)));
        assert_eq!(dispatcher.dispatch(&ringing), DispatchOutcome::Duplicate);

        let changes = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, LifecycleEvent::StatusChanged { .. }))
            .count();
        assert_eq!(changes, 1);
    }

    #[test]
    fn replayed_terminal_webhook_ends_the_session_once() {
        let (dispatcher, mut rx) = setup();
        dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::InProgress));
        let completed = StatusEvent::new("CA1", CallStatus::Completed);
        for _ in 0..5 {
            dispatcher.dispatch(&completed);
        }
        assert_eq!(ended_count(&drain(&mut rx)), 1);
        assert!(dispatcher.registry().active_sessions().is_empty());
    }

    #[test]
    fn late_in_progress_after_completion_is_ignored() {
        let (dispatcher, mut rx) = setup();
        dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::InProgress));
        dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::Completed));
        drain(&mut rx);

        let late = dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::InProgress));
        assert_eq!(late, DispatchOutcome::AlreadyEnded);
        assert!(drain(&mut rx).is_empty());
        assert!(dispatcher.registry().active_sessions().is_empty());
    }

    #[test]
    fn backwards_status_for_live_call_is_stale() {
        let (dispatcher, _rx) = setup();
        dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::InProgress));
        assert_eq!(
            dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::Ringing)),
            DispatchOutcome::Stale {
                current: CallStatus::InProgress,
                requested: CallStatus::Ringing
            }
        );
    }

    #[test]
    fn terminal_status_for_unknown_call_is_not_registered() {
        let (dispatcher, mut rx) = setup();
        assert_eq!(
            dispatcher.dispatch(&StatusEvent::new("CA9", CallStatus::Busy)),
            DispatchOutcome::Unknown
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn status_callback_racing_outbound_registration_is_reconciled() {
        let (dispatcher, _rx) = setup();
        let mut early = StatusEvent::new("CA1", CallStatus::Ringing);
        early.direction = Some(CallDirection::Outbound);
        dispatcher.dispatch(&early);

        let session = dispatcher.register_outbound("CA1", None, None).unwrap();
        assert_eq!(session.status, CallStatus::Ringing);
        assert_eq!(session.direction, CallDirection::Outbound);
    }

    #[test]
    fn forced_end_records_reason_and_blocks_later_webhooks() {
        let (dispatcher, mut rx) = setup();
        let DispatchOutcome::Created(session) =
            dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::InProgress))
        else {
            panic!("session not created");
        };
        let ended = dispatcher
            .end_session(&session.session_id, CallStatus::Completed, "max_duration_exceeded")
            .unwrap();
        assert_eq!(ended.end_reason.as_deref(), Some("max_duration_exceeded"));

        assert_eq!(
            dispatcher.dispatch(&StatusEvent::new("CA1", CallStatus::Completed)),
            DispatchOutcome::AlreadyEnded
        );
        assert_eq!(ended_count(&drain(&mut rx)), 1);
    }

    proptest! {
        #[test]
        fn reordered_and_duplicated_webhooks_converge(
            (expected, deliveries) in subsequence(
                vec![CallStatus::Ringing, CallStatus::InProgress, CallStatus::Completed],
                1..=3,
            )
            .prop_flat_map(|chain| {
                let expected = chain[chain.len() - 1];
                let doubled: Vec<CallStatus> = chain.iter().chain(chain.iter()).copied().collect();
                Just(doubled).prop_shuffle().prop_map(move |d| (expected, d))
            })
        ) {
            let (dispatcher, mut rx) = setup();
            dispatcher.register_outbound("CA1", None, None).unwrap();
            drain(&mut rx);

            for status in &deliveries {
                dispatcher.dispatch(&StatusEvent::new("CA1", *status));
            }

            let events = drain(&mut rx);
            let applied: Vec<CallStatus> = events
                .iter()
                .filter_map(|e| match e {
                    LifecycleEvent::StatusChanged { to, .. } => Some(*to),
                    _ => None,
                })
                .collect();
            prop_assert_eq!(applied.last().copied(), Some(expected));
            let mut unique = applied.clone();
            unique.dedup();
            prop_assert_eq!(unique.len(), applied.len());
            prop_assert_eq!(ended_count(&events), usize::from(expected.is_terminal()));
        }
    }
}
