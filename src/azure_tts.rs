use crate::error::TransportError;
use crate::speech::Synthesizer;

use async_trait::async_trait;
use quick_xml::escape::escape;
use tracing::{debug, error};

// Raw 8kHz mu-law can go straight into Twilio media messages.
const OUTPUT_FORMAT: &str = "raw-8khz-8bit-mono-mulaw";
const USER_AGENT: &str = "call-session";

/// One-shot synthesizer using the Azure Speech REST endpoint.
pub struct AzureSynthesizer {
    http_client: reqwest::Client,
    subscription_key: String,
    endpoint: String,
    voice: String,
}

impl AzureSynthesizer {
    pub fn new(
        http_client: reqwest::Client,
        subscription_key: impl Into<String>,
        region: &str,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            subscription_key: subscription_key.into(),
            endpoint: format!("https://{region}.tts.speech.microsoft.com/cognitiveservices/v1"),
            voice: voice.into(),
        }
    }
}

pub fn build_ssml(voice: &str, text: &str) -> String {
    let text = escape(text.as_bytes());
    let voice = escape(voice.as_bytes());
    format!(
        "<speak version=\"1.0\" xml:lang=\"en-US\"><voice name=\"{}\">{}</voice></speak>",
        String::from_utf8_lossy(&voice),
        String::from_utf8_lossy(&text),
    )
}

#[async_trait]
impl Synthesizer for AzureSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TransportError> {
        let resp = self
            .http_client
            .post(&self.endpoint)
            .header("Ocp-Apim-Subscription-Key", &self.subscription_key)
            .header(reqwest::header::CONTENT_TYPE, "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .body(build_ssml(&self.voice, text))
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to Azure TTS");
                TransportError::SynthesisFailed(e.to_string())
            })?;
        let status = resp.status();
        if !status.is_success() {
            error!(status=%status, "Azure TTS rejected synthesis request");
            return Err(TransportError::SynthesisFailed(format!(
                "azure tts returned {status}"
            )));
        }
        let audio = resp.bytes().await.map_err(|e| {
            error!(error=%e, "failed to read Azure TTS audio");
            TransportError::SynthesisFailed(e.to_string())
        })?;
        if audio.is_empty() {
            return Err(TransportError::SynthesisFailed(
                "azure tts returned no audio".to_string(),
            ));
        }
        debug!(bytes = audio.len(), "got azure tts payload");

        Ok(audio.to_vec())
    }
}
