use crate::error::ConfigError;

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_AZURE_REGION: &str = "eastus";
const DEFAULT_AZURE_VOICE: &str = "en-US-JennyNeural";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_MAX_CALL_DURATION_SECS: u64 = 3_600;
const DEFAULT_SILENCE_TIMEOUT_MILLIS: u64 = 5_000;
const DEFAULT_RESPONDER_TIMEOUT_MILLIS: u64 = 10_000;
const DEFAULT_SYNTHESIS_TIMEOUT_MILLIS: u64 = 10_000;

#[derive(Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Host name Twilio reaches us on, used for webhook and websocket urls
    pub public_host: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_phone_number: String,
    pub deepgram_api_key: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub azure_speech_key: String,
    pub azure_speech_region: String,
    pub azure_speech_voice: String,
    pub max_call_duration: Duration,
    pub silence_timeout: Duration,
    pub responder_timeout: Duration,
    pub synthesis_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("public_host", &self.public_host)
            .field("twilio_account_sid", &self.twilio_account_sid)
            .field("twilio_auth_token", &"[REDACTED]")
            .field("twilio_phone_number", &self.twilio_phone_number)
            .field("deepgram_api_key", &"[REDACTED]")
            .field("openai_api_key", &"[REDACTED]")
            .field("openai_model", &self.openai_model)
            .field("azure_speech_key", &"[REDACTED]")
            .field("azure_speech_region", &self.azure_speech_region)
            .field("azure_speech_voice", &self.azure_speech_voice)
            .field("max_call_duration", &self.max_call_duration)
            .field("silence_timeout", &self.silence_timeout)
            .field("responder_timeout", &self.responder_timeout)
            .field("synthesis_timeout", &self.synthesis_timeout)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from any name -> value lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        Ok(Self {
            bind_addr: parse_or(&get, "BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?,
            public_host: required("PUBLIC_HOST")?,
            twilio_account_sid: required("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: required("TWILIO_AUTH_TOKEN")?,
            twilio_phone_number: required("TWILIO_PHONE_NUMBER")?,
            deepgram_api_key: required("DEEPGRAM_API_KEY")?,
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            azure_speech_key: required("AZURE_SPEECH_KEY")?,
            azure_speech_region: get("AZURE_SPEECH_REGION")
                .unwrap_or_else(|| DEFAULT_AZURE_REGION.to_string()),
            azure_speech_voice: get("AZURE_SPEECH_VOICE")
                .unwrap_or_else(|| DEFAULT_AZURE_VOICE.to_string()),
            max_call_duration: Duration::from_secs(parse_or(
                &get,
                "MAX_CALL_DURATION_SECS",
                Some(DEFAULT_MAX_CALL_DURATION_SECS),
            )?),
            silence_timeout: Duration::from_millis(parse_or(
                &get,
                "SILENCE_TIMEOUT_MS",
                Some(DEFAULT_SILENCE_TIMEOUT_MILLIS),
            )?),
            responder_timeout: Duration::from_millis(parse_or(
                &get,
                "RESPONDER_TIMEOUT_MS",
                Some(DEFAULT_RESPONDER_TIMEOUT_MILLIS),
            )?),
            synthesis_timeout: Duration::from_millis(parse_or(
                &get,
                "SYNTHESIS_TIMEOUT_MS",
                Some(DEFAULT_SYNTHESIS_TIMEOUT_MILLIS),
            )?),
        })
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => default.ok_or(ConfigError::Missing(name)),
    }
}
