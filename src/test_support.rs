//! In-memory stand-ins for the external services, shared by unit tests.

use crate::config::Config;
use crate::dispatcher::StatusDispatcher;
use crate::error::{ResponderError, TelephonyError, TransportError};
use crate::registry::CallRegistry;
use crate::responder::{Responder, SessionContext};
use crate::speech::{AudioOutput, ListenHandle, ListenStream, RecognitionEvent, Recognizer, Synthesizer};
use crate::telephony::CallControl;
use crate::types::{AppState, SpeechServices, Utterance};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

/// What the caller does during one listening window.
#[derive(Clone)]
pub enum Caller {
    Says(&'static str),
    Silent,
    Drops,
}

pub struct ScriptedRecognizer {
    log: Log,
    script: Mutex<VecDeque<Caller>>,
    // Keeps silent streams open.
    open_streams: Mutex<Vec<mpsc::Sender<RecognitionEvent>>>,
}

impl ScriptedRecognizer {
    pub fn new(log: Log, script: Vec<Caller>) -> Self {
        Self {
            log,
            script: Mutex::new(script.into()),
            open_streams: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn start_listening(&self, session_id: &str) -> Result<ListenStream, TransportError> {
        push(&self.log, "listen");
        let (handle, _commands) = ListenHandle::new(session_id, 8);
        let (event_sink, events) = mpsc::channel(8);
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Caller::Silent);
        match next {
            Caller::Says(text) => {
                let partial = Utterance {
                    text: text.split(' ').next().unwrap_or(text).to_string(),
                    confidence: 0.5,
                    offset_ms: 0,
                    duration_ms: 100,
                    is_final: false,
                };
                event_sink.try_send(RecognitionEvent::Partial(partial)).unwrap();
                event_sink
                    .try_send(RecognitionEvent::Final(Utterance {
                        text: text.to_string(),
                        confidence: 0.9,
                        offset_ms: 0,
                        duration_ms: 800,
                        is_final: true,
                    }))
                    .unwrap();
            }
            Caller::Silent => {}
            Caller::Drops => {
                event_sink
                    .try_send(RecognitionEvent::TransportError("socket reset".into()))
                    .unwrap();
            }
        }
        self.open_streams.lock().unwrap().push(event_sink);
        Ok(ListenStream { handle, events })
    }

    async fn stop_listening(&self, handle: &ListenHandle) {
        push(&self.log, "stop");
        handle.stop().await;
    }
}

/// Synthesizes text into its own bytes so playback can be read back.
pub struct EchoSynthesizer {
    log: Log,
    failures_left: Mutex<u32>,
}

impl EchoSynthesizer {
    pub fn new(log: Log) -> Self {
        Self::failing(log, 0)
    }

    pub fn failing(log: Log, failures: u32) -> Self {
        Self {
            log,
            failures_left: Mutex::new(failures),
        }
    }
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TransportError> {
        push(&self.log, format!("synthesize:{text}"));
        let mut failures_left = self.failures_left.lock().unwrap();
        if *failures_left > 0 {
            *failures_left -= 1;
            return Err(TransportError::SynthesisFailed("tts down".into()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

pub enum Reply {
    Text(&'static str),
    Fail,
    Hang,
    /// Signal the test, then never answer
    HangAndNotify(Mutex<Option<oneshot::Sender<()>>>),
}

pub struct ScriptedResponder {
    log: Log,
    replies: Mutex<VecDeque<Reply>>,
    /// Number of earlier turns passed along with each request
    pub contexts: Mutex<Vec<usize>>,
}

impl ScriptedResponder {
    pub fn new(log: Log, replies: Vec<Reply>) -> Self {
        Self {
            log,
            replies: Mutex::new(replies.into()),
            contexts: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn respond(
        &self,
        utterance: &str,
        context: &SessionContext,
    ) -> Result<String, ResponderError> {
        push(&self.log, format!("respond:{utterance}"));
        self.contexts.lock().unwrap().push(context.turns.len());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Text(text)) => Ok(text.to_string()),
            Some(Reply::Fail) | None => Err(ResponderError::Failed("model overloaded".into())),
            Some(Reply::Hang) => std::future::pending().await,
            Some(Reply::HangAndNotify(notify)) => {
                if let Some(notify) = notify.lock().unwrap().take() {
                    let _ = notify.send(());
                }
                std::future::pending().await
            }
        }
    }
}

pub struct RecordingOutput {
    pub log: Log,
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, audio: Vec<u8>) -> Result<(), TransportError> {
        push(&self.log, format!("play:{}", String::from_utf8_lossy(&audio)));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCallControl {
    pub hangups: Mutex<Vec<String>>,
    log: Log,
}

impl RecordingCallControl {
    /// Also record hangups in a shared log, to check them against playback.
    pub fn with_log(log: Log) -> Self {
        Self {
            hangups: Mutex::default(),
            log,
        }
    }
}

#[async_trait]
impl CallControl for RecordingCallControl {
    async fn place_call(&self, _to: &str) -> Result<String, TelephonyError> {
        Ok("CA-outbound".to_string())
    }

    async fn hangup(&self, external_call_ref: &str) -> Result<(), TelephonyError> {
        push(&self.log, format!("hangup:{external_call_ref}"));
        self.hangups.lock().unwrap().push(external_call_ref.to_string());
        Ok(())
    }
}

pub fn entries(log: &Log, prefix: &str) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with(prefix))
        .cloned()
        .collect()
}

pub fn config() -> Config {
    Config::from_lookup(|name| {
        let value = match name {
            "PUBLIC_HOST" => "calls.example.com",
            "TWILIO_ACCOUNT_SID" => "AC123",
            "TWILIO_AUTH_TOKEN" => "secret",
            "TWILIO_PHONE_NUMBER" => "+15550001111",
            "DEEPGRAM_API_KEY" | "OPENAI_API_KEY" | "AZURE_SPEECH_KEY" => "key",
            _ => return None,
        };
        Some(value.to_string())
    })
    .unwrap()
}

/// Application state wired to in-memory services. The call control is returned
/// separately so tests can inspect hangups.
pub fn app_state() -> (Arc<AppState>, Arc<RecordingCallControl>) {
    let log = Log::default();
    let registry = Arc::new(CallRegistry::new());
    let dispatcher = Arc::new(StatusDispatcher::new(registry.clone()));
    let call_control = Arc::new(RecordingCallControl::default());
    let state = AppState {
        config: config(),
        registry,
        dispatcher,
        speech: SpeechServices {
            recognizer: Arc::new(ScriptedRecognizer::new(log.clone(), vec![])),
            synthesizer: Arc::new(EchoSynthesizer::new(log.clone())),
            responder: Arc::new(ScriptedResponder::new(log, vec![])),
        },
        call_control: call_control.clone(),
    };
    (Arc::new(state), call_control)
}
