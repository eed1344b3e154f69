use crate::config::Config;
use crate::dispatcher::StatusDispatcher;
use crate::error::{RegistryError, ResponderError, TransportError};
use crate::registry::SessionKey;
use crate::responder::SessionContext;
use crate::speech::{AudioOutput, ListenHandle, ListenStream, RecognitionEvent};
use crate::telephony::CallControl;
use crate::types::{
    CallDirection, CallSession, CallStatus, ConversationTurn, SpeechServices, Utterance,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const SYNTHESIS_ATTEMPTS: u32 = 2;
const MAX_DURATION_REASON: &str = "max_duration_exceeded";

#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub max_call_duration: Duration,
    /// How long an open listening window may stay silent
    pub silence_timeout: Duration,
    pub responder_timeout: Duration,
    pub synthesis_timeout: Duration,
    /// Bound on opening a recognition stream
    pub listen_timeout: Duration,
    pub playback_timeout: Duration,
    pub hangup_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub fallback_prompt: String,
    pub apology_prompt: String,
    /// Said before hanging up a call that ran out of time
    pub time_limit_goodbye: String,
    /// Said before hanging up a call we could not keep going
    pub failure_goodbye: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_call_duration: Duration::from_secs(3_600),
            silence_timeout: Duration::from_secs(5),
            responder_timeout: Duration::from_secs(10),
            synthesis_timeout: Duration::from_secs(10),
            listen_timeout: Duration::from_secs(5),
            playback_timeout: Duration::from_secs(120),
            hangup_timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
            fallback_prompt: "I didn't catch that. Could you please repeat?".to_string(),
            apology_prompt: "I'm sorry, I'm having trouble answering right now. \
                             Could you say that again?"
                .to_string(),
            time_limit_goodbye: "We've reached the time limit for this call. \
                                 Thank you for calling. Goodbye."
                .to_string(),
            failure_goodbye: "I'm sorry, I'm having technical difficulties. \
                              Please call back later. Goodbye."
                .to_string(),
        }
    }
}

impl From<&Config> for TurnConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_call_duration: config.max_call_duration,
            silence_timeout: config.silence_timeout,
            responder_timeout: config.responder_timeout,
            synthesis_timeout: config.synthesis_timeout,
            ..Default::default()
        }
    }
}

/// Why a turn loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// The session ended elsewhere or the media stream closed
    Cancelled,
    MaxDurationExceeded,
    TooManyFailures { reason: String },
}

enum Heard {
    Utterance(Utterance),
    Silence,
    Broken(String),
}

/// Drives one call: listen for a final utterance, ask the responder, speak the
/// reply, listen again. Turns are strictly sequential and listening is closed
/// while the bot speaks.
pub struct TurnLoop {
    session_id: String,
    external_call_ref: String,
    direction: CallDirection,
    answered_at: Option<OffsetDateTime>,
    dispatcher: Arc<StatusDispatcher>,
    services: SpeechServices,
    output: Arc<dyn AudioOutput>,
    call_control: Arc<dyn CallControl>,
    /// Handle the media task should feed caller audio into, if any
    listening: watch::Sender<Option<ListenHandle>>,
    cancel: CancellationToken,
    config: TurnConfig,
    turns: Vec<ConversationTurn>,
    consecutive_failures: u32,
    prompt_cache: HashMap<String, Vec<u8>>,
}

impl TurnLoop {
    /// Build the loop for a live session. Returns the receiving end of the active
    /// listen handle for the media task.
    pub fn new(
        session: &CallSession,
        dispatcher: Arc<StatusDispatcher>,
        services: SpeechServices,
        output: Arc<dyn AudioOutput>,
        call_control: Arc<dyn CallControl>,
        config: TurnConfig,
    ) -> Result<(Self, watch::Receiver<Option<ListenHandle>>), RegistryError> {
        let cancel = dispatcher
            .registry()
            .cancellation_token(SessionKey::Id(&session.session_id))?
            .child_token();
        let (listening, listen_stream) = watch::channel(None);
        let turn_loop = Self {
            session_id: session.session_id.clone(),
            external_call_ref: session.external_call_ref.clone(),
            direction: session.direction,
            answered_at: session.answered_at,
            dispatcher,
            services,
            output,
            call_control,
            listening,
            cancel,
            config,
            turns: vec![],
            consecutive_failures: 0,
            prompt_cache: HashMap::new(),
        };
        Ok((turn_loop, listen_stream))
    }

    /// Token that stops this loop without ending the session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> LoopExit {
        info!(session_id=%self.session_id, "turn loop started");
        let cancel = self.cancel.clone();
        let max_duration = sleep(self.remaining_call_time());
        tokio::pin!(max_duration);

        let exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => LoopExit::Cancelled,
            _ = &mut max_duration => LoopExit::MaxDurationExceeded,
            exit = self.converse() => exit,
        };
        // Whatever was in flight was dropped with `converse`; close any open stream.
        if let Some(handle) = self.listening.send_replace(None) {
            self.services.recognizer.stop_listening(&handle).await;
        }

        match &exit {
            LoopExit::Cancelled => debug!(session_id=%self.session_id, "turn loop cancelled"),
            LoopExit::MaxDurationExceeded => {
                info!(session_id=%self.session_id, "maximum call duration reached");
                let goodbye = self.config.time_limit_goodbye.clone();
                self.end_call(CallStatus::Completed, MAX_DURATION_REASON, &goodbye)
                    .await;
            }
            LoopExit::TooManyFailures { reason } => {
                warn!(session_id=%self.session_id, reason=%reason, "giving up on call");
                let goodbye = self.config.failure_goodbye.clone();
                self.end_call(CallStatus::Failed, reason, &goodbye).await;
            }
        }
        info!(session_id=%self.session_id, turns=self.turns.len(), ?exit, "turn loop finished");
        exit
    }

    /// Time left before the call hits its maximum duration, counted from when it
    /// was answered.
    fn remaining_call_time(&self) -> Duration {
        // Whole seconds; provider timestamps are no finer.
        let elapsed = self
            .answered_at
            .map(|at| (OffsetDateTime::now_utc() - at).whole_seconds().max(0) as u64)
            .unwrap_or(0);
        self.config
            .max_call_duration
            .saturating_sub(Duration::from_secs(elapsed))
    }

    async fn converse(&mut self) -> LoopExit {
        let mut prompted_for_silence = false;
        loop {
            let ListenStream { handle, mut events } = match self.start_listening().await {
                Ok(stream) => stream,
                Err(e) => {
                    if let Some(exit) =
                        self.record_failure(format!("speech recognition unavailable: {e}"))
                    {
                        return exit;
                    }
                    continue;
                }
            };

            let heard = loop {
                match self.next_final(&mut events).await {
                    Heard::Silence if prompted_for_silence => {
                        trace!(session_id=%self.session_id, "caller still silent");
                    }
                    heard => break heard,
                }
            };
            self.stop_listening(&handle).await;

            match heard {
                Heard::Utterance(utterance) => {
                    prompted_for_silence = false;
                    if let Some(exit) = self.take_turn(utterance).await {
                        return exit;
                    }
                }
                Heard::Silence => {
                    prompted_for_silence = true;
                    debug!(session_id=%self.session_id, "silence timeout; prompting caller");
                    let prompt = self.config.fallback_prompt.clone();
                    if let Err(e) = self.speak_prompt(&prompt).await {
                        warn!(session_id=%self.session_id, error=%e, "failed to speak silence prompt");
                    }
                }
                Heard::Broken(reason) => {
                    warn!(session_id=%self.session_id, reason=%reason, "recognition stream broke; restarting");
                    if let Some(exit) =
                        self.record_failure(format!("speech recognition failed: {reason}"))
                    {
                        return exit;
                    }
                }
            }
        }
    }

    /// One exchange: ask the responder and speak its reply, or apologise.
    async fn take_turn(&mut self, utterance: Utterance) -> Option<LoopExit> {
        info!(session_id=%self.session_id, text=%utterance.text, confidence=utterance.confidence, "caller said");
        let context = self.session_context();
        let reply = match timeout(
            self.config.responder_timeout,
            self.services.responder.respond(&utterance.text, &context),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => Err(ResponderError::Timeout),
        };

        match reply {
            Ok(reply) => {
                self.consecutive_failures = 0;
                self.turns.push(ConversationTurn {
                    caller_side: utterance.text,
                    bot_side: reply.clone(),
                });
                match self.speak(&reply).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(session_id=%self.session_id, error=%e, "failed to speak reply");
                        self.fail_turn(format!("speech synthesis failed: {e}")).await
                    }
                }
            }
            Err(e) => {
                warn!(session_id=%self.session_id, error=%e, "no reply from responder");
                self.turns.push(ConversationTurn {
                    caller_side: utterance.text,
                    bot_side: String::new(),
                });
                self.fail_turn(e.to_string()).await
            }
        }
    }

    /// Count a failed turn and apologise, unless this failure ends the call.
    async fn fail_turn(&mut self, reason: String) -> Option<LoopExit> {
        let exit = self.record_failure(reason);
        if exit.is_none() {
            let apology = self.config.apology_prompt.clone();
            if let Err(e) = self.speak_prompt(&apology).await {
                warn!(session_id=%self.session_id, error=%e, "failed to speak apology");
            }
        }
        exit
    }

    fn record_failure(&mut self, reason: String) -> Option<LoopExit> {
        self.consecutive_failures += 1;
        debug!(
            session_id=%self.session_id,
            failures=self.consecutive_failures,
            reason=%reason,
            "turn failed"
        );
        (self.consecutive_failures >= self.config.max_consecutive_failures)
            .then_some(LoopExit::TooManyFailures { reason })
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            session_id: self.session_id.clone(),
            external_call_ref: self.external_call_ref.clone(),
            direction: self.direction,
            turns: self.turns.clone(),
        }
    }

    async fn start_listening(&self) -> Result<ListenStream, TransportError> {
        let stream = timeout(
            self.config.listen_timeout,
            self.services.recognizer.start_listening(&self.session_id),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        self.listening.send_replace(Some(stream.handle.clone()));
        Ok(stream)
    }

    async fn stop_listening(&self, handle: &ListenHandle) {
        self.listening.send_replace(None);
        self.services.recognizer.stop_listening(handle).await;
    }

    /// Wait for the next final utterance. Partials mean the caller is talking, so
    /// they push the silence deadline out.
    async fn next_final(&self, events: &mut mpsc::Receiver<RecognitionEvent>) -> Heard {
        let mut deadline = Instant::now() + self.config.silence_timeout;
        loop {
            match timeout_at(deadline, events.recv()).await {
                Err(_) => return Heard::Silence,
                Ok(None) => return Heard::Broken("recognition stream ended".to_string()),
                Ok(Some(RecognitionEvent::Partial(partial))) => {
                    trace!(session_id=%self.session_id, text=%partial.text, "partial");
                    deadline = Instant::now() + self.config.silence_timeout;
                }
                Ok(Some(RecognitionEvent::Final(utterance))) if utterance.text.trim().is_empty() => {}
                Ok(Some(RecognitionEvent::Final(utterance))) => return Heard::Utterance(utterance),
                Ok(Some(RecognitionEvent::TransportError(reason))) => return Heard::Broken(reason),
            }
        }
    }

    async fn speak(&self, text: &str) -> Result<(), TransportError> {
        let audio = self.synthesize(text).await?;
        self.play(audio).await
    }

    /// Speak one of the fixed prompts, synthesizing it only the first time.
    async fn speak_prompt(&mut self, prompt: &str) -> Result<(), TransportError> {
        let audio = match self.prompt_cache.get(prompt) {
            Some(audio) => audio.clone(),
            None => {
                let audio = self.synthesize(prompt).await?;
                self.prompt_cache.insert(prompt.to_string(), audio.clone());
                audio
            }
        };
        self.play(audio).await
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TransportError> {
        let mut attempt = 1;
        loop {
            let result = timeout(
                self.config.synthesis_timeout,
                self.services.synthesizer.synthesize(text),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout));
            match result {
                Ok(audio) => return Ok(audio),
                Err(e) if attempt < SYNTHESIS_ATTEMPTS => {
                    warn!(session_id=%self.session_id, error=%e, "synthesis failed; retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn play(&self, audio: Vec<u8>) -> Result<(), TransportError> {
        timeout(self.config.playback_timeout, self.output.play(audio))
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    /// Say goodbye, end the session with our own verdict, then release the phone
    /// line.
    async fn end_call(&mut self, status: CallStatus, reason: &str, goodbye: &str) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session_id=%self.session_id, "caller gone before goodbye");
            }
            res = self.speak_prompt(goodbye) => {
                if let Err(e) = res {
                    warn!(session_id=%self.session_id, error=%e, "failed to say goodbye");
                }
            }
        }
        match self
            .dispatcher
            .end_session(&self.session_id, status, reason)
        {
            Ok(session) => {
                info!(session_id=%session.session_id, status=%session.status, reason=%reason, "ended session")
            }
            // A terminal webhook got there first.
            Err(e) => debug!(session_id=%self.session_id, error=%e, "session already ended"),
        }
        match timeout(
            self.config.hangup_timeout,
            self.call_control.hangup(&self.external_call_ref),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(call_sid=%self.external_call_ref, error=%e, "hangup failed"),
            Err(_) => warn!(call_sid=%self.external_call_ref, "hangup timed out"),
        }
    }
}
