use crate::config::Config;
use crate::dispatcher::StatusDispatcher;
use crate::registry::CallRegistry;
use crate::responder::Responder;
use crate::speech::{Recognizer, Synthesizer};
use crate::telephony::CallControl;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::Busy
                | CallStatus::NoAnswer
                | CallStatus::Canceled
        )
    }

    /// Position in the forward-only lifecycle. All terminal states share the last rank.
    fn rank(self) -> u8 {
        match self {
            CallStatus::Initiated => 0,
            CallStatus::Ringing => 1,
            CallStatus::InProgress => 2,
            _ => 3,
        }
    }

    /// Whether `next` is reachable from `self`. Intermediate states may be skipped
    /// (providers do not report every step) but nothing ever moves backwards and
    /// nothing leaves a terminal state.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    /// Status a freshly registered session starts in.
    pub fn initial_status(self) -> CallStatus {
        match self {
            CallDirection::Inbound => CallStatus::Ringing,
            CallDirection::Outbound => CallStatus::Initiated,
        }
    }
}

/// One active or completed phone conversation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CallSession {
    pub session_id: String,
    /// Call identifier assigned by the telephony provider
    pub external_call_ref: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub answered_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub end_reason: Option<String>,
}

/// One recognized speech segment.
#[derive(Clone, Debug, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub confidence: f32,
    pub offset_ms: u64,
    pub duration_ms: u64,
    pub is_final: bool,
}

/// Events published by the registry for analytics, billing and logging consumers.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    SessionCreated(CallSession),
    StatusChanged {
        session_id: String,
        external_call_ref: String,
        from: CallStatus,
        to: CallStatus,
        at: OffsetDateTime,
    },
    SessionEnded(CallSession),
}

/// A ConversationTurn represents an exchange of 1) caller inquiry and 2) bot response
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationTurn {
    pub caller_side: String,
    pub bot_side: String,
}

/// External services a call's turn loop talks to.
#[derive(Clone)]
pub struct SpeechServices {
    pub recognizer: Arc<dyn Recognizer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub responder: Arc<dyn Responder>,
}

pub struct AppState {
    pub config: Config,
    pub registry: Arc<CallRegistry>,
    pub dispatcher: Arc<StatusDispatcher>,
    pub speech: SpeechServices,
    pub call_control: Arc<dyn CallControl>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use CallStatus::*;
        assert!(Initiated.can_transition_to(Ringing));
        assert!(Ringing.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Ringing));
        assert!(!Ringing.can_transition_to(Ringing));
        assert!(!Ringing.can_transition_to(Initiated));
    }

    #[test]
    fn every_terminal_state_is_reachable_from_ringing_and_absorbing() {
        use CallStatus::*;
        for terminal in [Completed, Failed, Busy, NoAnswer, Canceled] {
            assert!(Ringing.can_transition_to(terminal));
            for next in [Initiated, Ringing, InProgress, Completed, Failed, Busy, NoAnswer, Canceled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn status_serializes_like_the_provider_strings() {
        assert_eq!(
            serde_json::to_string(&CallStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
        assert_eq!(CallStatus::NoAnswer.to_string(), "no-answer");
    }
}
