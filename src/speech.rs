use crate::error::TransportError;
use crate::types::Utterance;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events emitted by an open recognition stream.
#[derive(Clone, Debug, PartialEq)]
pub enum RecognitionEvent {
    /// Low-latency, unconfirmed text; may be superseded
    Partial(Utterance),
    Final(Utterance),
    /// The stream broke and is closed; listening has to be restarted
    TransportError(String),
}

/// Message type consumed by a recognizer's audio forwarding task.
#[derive(Debug, PartialEq)]
pub enum AudioCommand {
    Audio(Vec<u8>),
    /// Flush buffered audio and close the remote stream
    Close,
}

/// Push side of an open recognition stream. Cheap to clone and safe to use from the
/// media task while the turn loop stops it.
#[derive(Clone, Debug)]
pub struct ListenHandle {
    session_id: Arc<str>,
    commands: mpsc::Sender<AudioCommand>,
    active: Arc<AtomicBool>,
}

impl ListenHandle {
    pub fn new(session_id: &str, depth: usize) -> (Self, mpsc::Receiver<AudioCommand>) {
        let (commands, command_stream) = mpsc::channel(depth);
        let handle = Self {
            session_id: Arc::from(session_id),
            commands,
            active: Arc::new(AtomicBool::new(true)),
        };
        (handle, command_stream)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Append audio to the stream. Frames that arrive after the stream closed are
    /// dropped with a warning.
    pub async fn feed_audio(&self, audio: Vec<u8>) {
        if !self.is_active() {
            warn!(session_id=%self.session_id, bytes=audio.len(), "audio for inactive stream dropped");
            return;
        }
        if self.commands.send(AudioCommand::Audio(audio)).await.is_err() {
            warn!(session_id=%self.session_id, "recognition stream went away; dropping audio");
            self.mark_closed();
        }
    }

    /// Close the stream. Only the first call does anything.
    pub async fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(session_id=%self.session_id, "stopping recognition stream");
            // The forwarding task may already be gone after a transport error.
            let _ = self.commands.send(AudioCommand::Close).await;
        }
    }

    /// Record that the remote side closed the stream.
    pub fn mark_closed(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

pub struct ListenStream {
    pub handle: ListenHandle,
    pub events: mpsc::Receiver<RecognitionEvent>,
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn start_listening(&self, session_id: &str) -> Result<ListenStream, TransportError>;

    async fn feed_audio(&self, handle: &ListenHandle, audio: Vec<u8>) {
        handle.feed_audio(audio).await
    }

    async fn stop_listening(&self, handle: &ListenHandle) {
        handle.stop().await
    }
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Complete audio for `text`, or `TransportError::SynthesisFailed`.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TransportError>;
}

/// Plays audio to the far end of one call.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Resolves once the audio has been played out.
    async fn play(&self, audio: Vec<u8>) -> Result<(), TransportError>;
}
