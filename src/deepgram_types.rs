use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages Deepgram sends over a live transcription websocket.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum StreamMessage {
    #[serde(rename = "Results")]
    StreamingResponse(StreamingResponse),
    #[serde(rename = "Metadata")]
    StreamingMeta(StreamingMeta),
    /// Sent after a gap in speech, closing the utterance in progress
    UtteranceEnd,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StreamingResponse {
    pub channel_index: (u16, u16),
    pub duration: f32,
    pub start: f32,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_final: Option<bool>,
    pub channel: Channel,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StreamingMeta {
    pub request_id: Uuid,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Channel {
    pub alternatives: Vec<Alternative>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Word {
    pub word: String,
    pub start: f32,
    pub end: f32,
    pub confidence: f32,
}

/// Control message asking Deepgram to flush and close the stream.
#[derive(Serialize)]
pub struct CloseStream {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl Default for CloseStream {
    fn default() -> Self {
        Self {
            kind: "CloseStream",
        }
    }
}
