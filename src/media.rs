use crate::error::TransportError;
use crate::speech::AudioOutput;
use crate::twilio_types::TwilioOutbound;
use crate::utils::{audio2twilio, mark2twilio};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

// 8kHz, one byte per mu-law sample
const MULAW_BYTES_PER_MILLI: u64 = 8;

/// Plays synthesized audio on a Twilio media stream. Playback is confirmed by a
/// `mark` sent after the audio, which Twilio echoes once everything before it has
/// been played to the caller.
pub struct TwilioMediaOutput {
    stream_sid: String,
    twilio_outbound_sink: mpsc::Sender<TwilioOutbound>,
    pending_marks: Mutex<HashMap<String, oneshot::Sender<()>>>,
    playback_grace: Duration,
}

impl TwilioMediaOutput {
    pub fn new(
        stream_sid: impl Into<String>,
        twilio_outbound_sink: mpsc::Sender<TwilioOutbound>,
        playback_grace: Duration,
    ) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            twilio_outbound_sink,
            pending_marks: Mutex::new(HashMap::new()),
            playback_grace,
        }
    }

    /// Route a mark echo from Twilio to the playback waiting on it. Returns whether
    /// anyone was waiting.
    pub fn mark_received(&self, name: &str) -> bool {
        let waiter = self
            .pending_marks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
        match waiter {
            Some(waiter) => waiter.send(()).is_ok(),
            None => {
                debug!(mark=%name, "mark echo without pending playback");
                false
            }
        }
    }

    fn expected_playback(&self, audio_len: usize) -> Duration {
        Duration::from_millis(audio_len as u64 / MULAW_BYTES_PER_MILLI) + self.playback_grace
    }

    fn forget_mark(&self, name: &str) {
        self.pending_marks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }

    async fn send(&self, message: TwilioOutbound) -> Result<(), TransportError> {
        self.twilio_outbound_sink.send(message).await.map_err(|e| {
            error!(error=%e, "failed to send message to twilio sink task");
            TransportError::Playback("media stream closed".to_string())
        })
    }
}

#[async_trait]
impl AudioOutput for TwilioMediaOutput {
    async fn play(&self, audio: Vec<u8>) -> Result<(), TransportError> {
        let mark = Uuid::new_v4().to_string();
        let (played_sink, played) = oneshot::channel();
        self.pending_marks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(mark.clone(), played_sink);

        let expected = self.expected_playback(audio.len());
        let sent = async {
            self.send(audio2twilio(&audio, &self.stream_sid)).await?;
            self.send(mark2twilio(&mark, &self.stream_sid)).await
        }
        .await;
        if let Err(e) = sent {
            self.forget_mark(&mark);
            return Err(e);
        }

        match timeout(expected, played).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Playback(
                "playback confirmation dropped".to_string(),
            )),
            Err(_) => {
                warn!(mark=%mark, waited=?expected, "no mark echo from twilio");
                self.forget_mark(&mark);
                Err(TransportError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn output(depth: usize) -> (Arc<TwilioMediaOutput>, mpsc::Receiver<TwilioOutbound>) {
        let (sink, stream) = mpsc::channel(depth);
        (
            Arc::new(TwilioMediaOutput::new("MZ1", sink, Duration::from_secs(1))),
            stream,
        )
    }

    #[tokio::test]
    async fn playback_completes_when_the_mark_is_echoed() {
        let (output, mut outbound) = output(4);
        let player = {
            let output = output.clone();
            tokio::spawn(async move { output.play(vec![0xff; 800]).await })
        };

        assert!(matches!(outbound.recv().await, Some(TwilioOutbound::Media { .. })));
        let Some(TwilioOutbound::Mark { mark, .. }) = outbound.recv().await else {
            panic!("expected a mark after the media");
        };
        assert!(output.mark_received(&mark.name));
        assert_eq!(player.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_mark_echo_times_out() {
        let (output, _outbound) = output(4);
        assert_eq!(output.play(vec![0xff; 8_000]).await, Err(TransportError::Timeout));
        assert!(output.pending_marks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_stream_fails_playback() {
        let (output, outbound) = output(4);
        drop(outbound);
        assert!(matches!(
            output.play(vec![0xff; 80]).await,
            Err(TransportError::Playback(_))
        ));
        assert!(!output.mark_received("unknown"));
    }

    #[test]
    fn playback_budget_follows_audio_length() {
        let (sink, _stream) = mpsc::channel(1);
        let output = TwilioMediaOutput::new("MZ1", sink, Duration::from_millis(500));
        assert_eq!(output.expected_playback(16_000), Duration::from_millis(2_500));
    }
}
