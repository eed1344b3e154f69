mod azure_tts;
mod config;
mod deepgram;
mod deepgram_types;
mod dispatcher;
mod error;
mod handlers;
mod media;
mod openai_types;
mod registry;
mod responder;
mod speech;
mod tasks;
mod telephony;
#[cfg(test)]
mod test_support;
mod turn_loop;
mod twilio_types;
mod types;
mod utils;

use crate::azure_tts::AzureSynthesizer;
use crate::config::Config;
use crate::deepgram::DeepgramRecognizer;
use crate::dispatcher::StatusDispatcher;
use crate::error::AppError;
use crate::registry::CallRegistry;
use crate::responder::OpenAiResponder;
use crate::telephony::TwilioClient;
use crate::types::{AppState, SpeechServices};

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const APP_GREETING: &str = "Hi.  How may I help you?";
    pub const OUTBOUND_GREETING: &str = "Hi, this is the automated assistant.  How may I help you?";
    pub const UNAVAILABLE_MESSAGE: &str = "Sorry, we can't take your call right now.  Goodbye.";
    pub const PLAYBACK_GRACE_MILLIS: u64 = 1_500;
    pub const TWILIO_OUTBOUND_CHANNEL_DEPTH: usize = 32;
    pub const SHUTDOWN_HANGUP_TIMEOUT_SECS: u64 = 5;
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("no .env loaded: {e}");
    }
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            ("call_session", tracing_subscriber::filter::LevelFilter::DEBUG),
        ]));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| AppError::Internal("failed to install tracing subscriber"))?;

    let config = Config::from_env()?;
    debug!(config=?config, "loaded config");
    let http_client = reqwest::Client::new();

    let registry = Arc::new(CallRegistry::new());
    tokio::spawn(tasks::log_lifecycle_events(registry.subscribe()));
    let dispatcher = Arc::new(StatusDispatcher::new(registry.clone()));
    let speech = SpeechServices {
        recognizer: Arc::new(DeepgramRecognizer::new(config.deepgram_api_key.clone())),
        synthesizer: Arc::new(AzureSynthesizer::new(
            http_client.clone(),
            config.azure_speech_key.clone(),
            &config.azure_speech_region,
            config.azure_speech_voice.clone(),
        )),
        responder: Arc::new(OpenAiResponder::new(
            http_client.clone(),
            config.openai_api_key.clone(),
            config.openai_model.clone(),
        )),
    };
    let call_control = Arc::new(TwilioClient::new(
        http_client,
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
        config.twilio_phone_number.clone(),
        config.public_host.clone(),
    ));

    let bind_addr = config.bind_addr;
    let app_state = Arc::new(AppState {
        config,
        registry,
        dispatcher,
        speech,
        call_control,
    });

    let app = handlers::router(app_state.clone());

    info!(addr=%bind_addr, "listening");
    axum::Server::bind(&bind_addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error=%e, "server error");
            AppError::Internal("http server failed")
        })?;

    hang_up_active_calls(&app_state).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error=%e, "failed to listen for ctrl-c");
    }
    info!("shutting down");
}

/// Release every phone line still in use before the process exits.
async fn hang_up_active_calls(app_state: &AppState) {
    let sessions = app_state.registry.active_sessions();
    if sessions.is_empty() {
        return;
    }
    info!(calls = sessions.len(), "hanging up active calls");
    let hangups = sessions.iter().map(|session| async move {
        let res = timeout(
            Duration::from_secs(consts::SHUTDOWN_HANGUP_TIMEOUT_SECS),
            app_state.call_control.hangup(&session.external_call_ref),
        )
        .await;
        match res {
            Ok(Ok(())) => debug!(session_id=%session.session_id, "hung up"),
            Ok(Err(e)) => warn!(session_id=%session.session_id, error=%e, "hangup failed"),
            Err(_) => warn!(session_id=%session.session_id, "hangup timed out"),
        }
    });
    join_all(hangups).await;
}
