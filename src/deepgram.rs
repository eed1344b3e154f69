use crate::deepgram_types::{CloseStream, StreamMessage, StreamingResponse};
use crate::error::TransportError;
use crate::speech::{AudioCommand, ListenHandle, ListenStream, RecognitionEvent, Recognizer};
use crate::types::Utterance;

use async_trait::async_trait;
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

type DgSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
type DgStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

// Twilio media streams carry 8kHz mu-law.
const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen\
                                   ?encoding=mulaw\
                                   &sample_rate=8000\
                                   &interim_results=true\
                                   &endpointing=300\
                                   &utterance_end_ms=1000";
const AUDIO_CHANNEL_DEPTH: usize = 64;
const EVENT_CHANNEL_DEPTH: usize = 32;

/// Streaming recognizer backed by Deepgram's live transcription websocket. Each
/// `start_listening` opens a fresh websocket.
pub struct DeepgramRecognizer {
    api_key: String,
    url: String,
}

impl DeepgramRecognizer {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: DEEPGRAM_LISTEN_URL.to_string(),
        }
    }

    /// Open websocket connection to Deepgram.
    async fn open_dg_stream(&self) -> Result<(DgSink, DgStream), TransportError> {
        trace!("Connecting to DG");
        let mut rq = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let auth = http::header::HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        rq.headers_mut().insert(http::header::AUTHORIZATION, auth);
        let (ws_stream, _) = connect_async(rq).await.map_err(|e| {
            error!(error=%e, "failed to connect to Deepgram");
            TransportError::Connection(e.to_string())
        })?;
        Ok(ws_stream.split())
    }
}

#[async_trait]
impl Recognizer for DeepgramRecognizer {
    async fn start_listening(&self, session_id: &str) -> Result<ListenStream, TransportError> {
        let (dg_sink, dg_stream) = self.open_dg_stream().await?;
        info!(session_id=%session_id, "opened connection to Deepgram");

        let (handle, command_stream) = ListenHandle::new(session_id, AUDIO_CHANNEL_DEPTH);
        let (event_sink, events) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        tokio::spawn(forward_audio_to_deepgram(command_stream, dg_sink));
        tokio::spawn(read_deepgram_results(dg_stream, event_sink, handle.clone()));

        Ok(ListenStream { handle, events })
    }
}

/// Task that streams pushed caller audio to Deepgram until the handle is stopped.
async fn forward_audio_to_deepgram(
    mut command_stream: mpsc::Receiver<AudioCommand>,
    mut dg_sink: DgSink,
) {
    while let Some(command) = command_stream.recv().await {
        match command {
            AudioCommand::Audio(chunk) => {
                if let Err(e) = dg_sink.send(tungstenite::Message::Binary(chunk)).await {
                    warn!(error=%e, "failed to send audio to Deepgram");
                    return;
                }
            }
            AudioCommand::Close => break,
        }
    }
    match serde_json::to_string(&CloseStream::default()) {
        Ok(close) => {
            if let Err(e) = dg_sink.send(tungstenite::Message::Text(close)).await {
                debug!(error=%e, "Deepgram stream already closed");
            }
        }
        Err(e) => error!(error=%e, "failed to serialize CloseStream"),
    }
}

/// Task that turns Deepgram results into recognition events, in arrival order.
async fn read_deepgram_results(
    mut dg_stream: DgStream,
    event_sink: mpsc::Sender<RecognitionEvent>,
    handle: ListenHandle,
) {
    let mut assembler = UtteranceAssembler::default();
    while let Some(res) = dg_stream.next().await {
        match res {
            Ok(tungstenite::Message::Text(msg)) => {
                let stream_message = match serde_json::from_str::<StreamMessage>(&msg) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(msg=%msg, error=%e, "failed to deserialize DG stream message");
                        continue;
                    }
                };
                let event = match stream_message {
                    StreamMessage::StreamingResponse(response) => assembler.push(&response),
                    StreamMessage::UtteranceEnd => assembler.finish(),
                    StreamMessage::StreamingMeta(meta) => {
                        debug!(request_id=%meta.request_id, "dg stream metadata");
                        None
                    }
                    StreamMessage::Other => None,
                };
                if let Some(event) = event {
                    if event_sink.send(event).await.is_err() {
                        debug!("recognition events no longer consumed");
                        break;
                    }
                }
            }
            Ok(tungstenite::Message::Close(_)) => break,
            Ok(_) => (),
            Err(e) => {
                error!(error=%e, "failed to handle DG message");
                if handle.is_active() {
                    let _ = event_sink
                        .send(RecognitionEvent::TransportError(e.to_string()))
                        .await;
                }
                handle.mark_closed();
                return;
            }
        }
    }
    if handle.is_active() {
        warn!(session_id=%handle.session_id(), "dg stream closed by remote");
        let _ = event_sink
            .send(RecognitionEvent::TransportError(
                "recognition stream closed by remote".to_string(),
            ))
            .await;
    }
    handle.mark_closed();
}

/// Collects the segments Deepgram finalizes mid-utterance. Everything heard so far
/// goes out as a partial; one final carries the whole utterance once Deepgram
/// reports the end of speech.
#[derive(Default)]
pub struct UtteranceAssembler {
    segments: Vec<Utterance>,
}

impl UtteranceAssembler {
    /// Map one Deepgram result onto a recognition event. Empty results are
    /// silence and produce nothing unless they close an utterance.
    pub fn push(&mut self, response: &StreamingResponse) -> Option<RecognitionEvent> {
        let speech_final = response.is_final && response.speech_final == Some(true);
        let segment = response
            .channel
            .alternatives
            .first()
            .map(|alternative| (alternative.transcript.trim(), alternative.confidence))
            .filter(|(text, _)| !text.is_empty())
            .map(|(text, confidence)| Utterance {
                text: text.to_string(),
                confidence: confidence.clamp(0.0, 1.0),
                offset_ms: seconds_to_millis(response.start),
                duration_ms: seconds_to_millis(response.duration),
                is_final: false,
            });

        match segment {
            Some(segment) if response.is_final => {
                self.segments.push(segment);
                if speech_final {
                    self.finish()
                } else {
                    Some(RecognitionEvent::Partial(self.joined(&[])))
                }
            }
            Some(interim) => Some(RecognitionEvent::Partial(self.joined(&[interim]))),
            None if speech_final => self.finish(),
            None => None,
        }
    }

    /// Close the current utterance, if anything was heard.
    pub fn finish(&mut self) -> Option<RecognitionEvent> {
        if self.segments.is_empty() {
            return None;
        }
        let mut utterance = self.joined(&[]);
        utterance.is_final = true;
        self.segments.clear();
        Some(RecognitionEvent::Final(utterance))
    }

    fn joined(&self, interim: &[Utterance]) -> Utterance {
        let parts: Vec<&Utterance> = self.segments.iter().chain(interim).collect();
        let text = parts
            .iter()
            .map(|part| part.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let confidence =
            parts.iter().map(|part| part.confidence).sum::<f32>() / parts.len().max(1) as f32;
        let offset_ms = parts.first().map_or(0, |part| part.offset_ms);
        let end_ms = parts
            .last()
            .map_or(0, |part| part.offset_ms + part.duration_ms);
        Utterance {
            text,
            confidence,
            offset_ms,
            duration_ms: end_ms.saturating_sub(offset_ms),
            is_final: false,
        }
    }
}

fn seconds_to_millis(seconds: f32) -> u64 {
    (seconds.max(0.0) * 1_000.0).round() as u64
}
