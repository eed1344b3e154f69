use crate::consts::{
    APP_GREETING, OUTBOUND_GREETING, PLAYBACK_GRACE_MILLIS, TWILIO_OUTBOUND_CHANNEL_DEPTH,
    UNAVAILABLE_MESSAGE,
};
use crate::dispatcher::StatusEvent;
use crate::error::{handle_error, AppError};
use crate::media::TwilioMediaOutput;
use crate::registry::{CallMetrics, SessionKey};
use crate::tasks::{pump_twilio_media, send_twilio_ws_messages};
use crate::turn_loop::{TurnConfig, TurnLoop};
use crate::twilio_types::{
    connect_twiml, say_twiml, StartMeta, TwilioCallPayload, TwilioMessage, SESSION_ID_PARAMETER,
};
use crate::types::{AppState, CallSession, CallStatus};
use crate::utils::{is_valid_phone_number, normalize_phone_number};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Host, Path, State,
    },
    http::{header, HeaderName, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{SplitStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

type TwimlResponse = (StatusCode, [(HeaderName, &'static str); 1], String);

const MEDIA_STREAM_CLOSED_REASON: &str = "media_stream_closed";

pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/connect", get(ws_handler))
        .route("/twilio/twiml/start", post(twiml_start_connect))
        .route("/twilio/twiml/outbound", post(twiml_outbound_connect))
        .route("/twilio/status", post(status_callback))
        .route("/calls", get(list_calls).post(place_call))
        .route("/calls/:session_id", get(get_call))
        .route("/calls/:session_id/hangup", post(hangup_call))
        .route("/health", get(health))
        .with_state(app_state)
}

fn decode_call_payload(body: &str) -> Result<TwilioCallPayload, AppError> {
    trace!(body=%body, "twilio request body");
    serde_urlencoded::from_str::<TwilioCallPayload>(body).map_err(|e| {
        error!(error=%e, "failed to deserialize Twilio call payload");
        AppError::BadRequest(e.to_string())
    })
}

fn twiml_response(twiml: String) -> TwimlResponse {
    trace!("twiml: '{}'", twiml);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        twiml,
    )
}

/// Apply the webhook's status and connect the call to our media websocket.
fn connect_call(
    host: &str,
    app_state: &AppState,
    payload: TwilioCallPayload,
    greeting: &str,
) -> TwimlResponse {
    let event = payload.into_event();
    let outcome = app_state.dispatcher.dispatch(&event);
    debug!(call_sid=%event.external_call_ref, ?outcome, "voice webhook dispatched");

    let session = app_state
        .registry
        .get(SessionKey::CallRef(&event.external_call_ref));
    match session {
        Ok(session) => {
            let url = format!("wss://{}/connect", host);
            twiml_response(connect_twiml(greeting, &url, &session.session_id))
        }
        Err(e) => {
            warn!(error=%e, call_sid=%event.external_call_ref, "no live session for call");
            twiml_response(say_twiml(UNAVAILABLE_MESSAGE))
        }
    }
}

/// Voice webhook for inbound calls.
pub async fn twiml_start_connect(
    Host(host): Host,
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> Result<TwimlResponse, AppError> {
    let payload = decode_call_payload(&body)?;
    info!(call_sid=%payload.call_sid, from=?payload.from, "incoming call");
    Ok(connect_call(&host, &app_state, payload, APP_GREETING))
}

/// Voice webhook Twilio fetches once an outbound call is answered.
pub async fn twiml_outbound_connect(
    Host(host): Host,
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> Result<TwimlResponse, AppError> {
    let payload = decode_call_payload(&body)?;
    info!(call_sid=%payload.call_sid, to=?payload.to, "outbound call answered");
    Ok(connect_call(&host, &app_state, payload, OUTBOUND_GREETING))
}

/// Status callback. Anything decodable is acknowledged, whether or not it changed
/// anything, so Twilio stops redelivering it.
pub async fn status_callback(State(app_state): State<Arc<AppState>>, body: String) -> StatusCode {
    let payload = match decode_call_payload(&body) {
        Ok(payload) => payload,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    let event = payload.into_event();
    let outcome = app_state.dispatcher.dispatch(&event);
    debug!(call_sid=%event.external_call_ref, status=%event.status, ?outcome, "status callback");
    StatusCode::OK
}

#[derive(Deserialize, Debug)]
pub struct PlaceCallRequest {
    pub to: String,
}

pub async fn place_call(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<PlaceCallRequest>,
) -> Result<(StatusCode, Json<CallSession>), AppError> {
    if !is_valid_phone_number(&request.to) {
        return Err(AppError::BadRequest(format!(
            "invalid phone number '{}'",
            request.to
        )));
    }
    let to = normalize_phone_number(&request.to);
    let call_sid = app_state.call_control.place_call(&to).await?;
    let session = app_state.dispatcher.register_outbound(
        &call_sid,
        Some(app_state.config.twilio_phone_number.clone()),
        Some(to),
    )?;
    info!(session_id=%session.session_id, call_sid=%call_sid, "outbound call registered");
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Serialize, Debug)]
pub struct CallsOverview {
    pub sessions: Vec<CallSession>,
    pub metrics: CallMetrics,
}

pub async fn list_calls(State(app_state): State<Arc<AppState>>) -> Json<CallsOverview> {
    Json(CallsOverview {
        sessions: app_state.registry.active_sessions(),
        metrics: app_state.registry.metrics(),
    })
}

pub async fn get_call(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<CallSession>, AppError> {
    Ok(Json(app_state.registry.get(SessionKey::Id(&session_id))?))
}

/// Ask the provider to hang up. The session ends when the resulting status
/// callback arrives.
pub async fn hangup_call(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<(StatusCode, Json<CallSession>), AppError> {
    let session = app_state.registry.get(SessionKey::Id(&session_id))?;
    app_state
        .call_control
        .hangup(&session.external_call_ref)
        .await?;
    info!(session_id=%session_id, call_sid=%session.external_call_ref, "hangup requested");
    Ok((StatusCode::ACCEPTED, Json(session)))
}

pub async fn health(State(app_state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_calls": app_state.registry.metrics().active_calls,
    }))
}

/// Capture the Twilio Start media message from the beginning of a Twilio websocket stream for the
/// stream id.
async fn get_twilio_start_meta(
    twilio_stream: &mut SplitStream<WebSocket>,
) -> Result<StartMeta, AppError> {
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Connected { protocol, version } => {
                            trace!("Got connected message with {protocol} and {version}");
                        }
                        TwilioMessage::Start {
                            start: start_meta, ..
                        } => {
                            break Ok(start_meta);
                        }
                        _ => {
                            break Err(AppError::Internal("At this point in a stream, we only expect a Connected message or a Start message.  Any others constitute an error."));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to deserialize Twilio text message");
                        break Err(AppError::BadRequest(e.to_string()));
                    }
                },
                Ok(Message::Ping(_)) => (),
                _ => {
                    break Err(AppError::Internal(
                        "Got unexpected websocket message type from Twilio!",
                    ));
                }
            },
            None => break Err(AppError::Internal("End of stream")),
        }
    }
}

/// Find the session a media stream belongs to. The stream only starts once the
/// call is answered, so this is also where the session goes in-progress.
fn resolve_stream_session(
    app_state: &AppState,
    start_meta: &StartMeta,
) -> Result<CallSession, AppError> {
    let answered = StatusEvent::new(start_meta.call_sid.as_str(), CallStatus::InProgress);
    let outcome = app_state.dispatcher.dispatch(&answered);
    debug!(call_sid=%start_meta.call_sid, ?outcome, "media stream started");

    let session = match start_meta.custom_parameters.get(SESSION_ID_PARAMETER) {
        Some(session_id) => app_state.registry.get(SessionKey::Id(session_id))?,
        None => app_state
            .registry
            .get(SessionKey::CallRef(&start_meta.call_sid))?,
    };
    if session.external_call_ref != start_meta.call_sid {
        return Err(AppError::BadRequest(format!(
            "session {} does not belong to call {}",
            session.session_id, start_meta.call_sid
        )));
    }
    Ok(session)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket_handler(socket, app_state))
}

async fn socket_handler(socket: WebSocket, app_state: Arc<AppState>) {
    let (twilio_sink, mut twilio_stream) = socket.split();
    // Get Twilio stream id
    let start_meta = match get_twilio_start_meta(&mut twilio_stream).await {
        Ok(start_meta) => start_meta,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    debug!(meta = ?start_meta, "got start meta from twilio stream");
    let session = match resolve_stream_session(&app_state, &start_meta) {
        Ok(session) => session,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };

    let (twilio_outbound_sink, twilio_outbound_stream) =
        mpsc::channel(TWILIO_OUTBOUND_CHANNEL_DEPTH);
    let twilio_ws_messages =
        tokio::spawn(send_twilio_ws_messages(twilio_outbound_stream, twilio_sink));
    let output = Arc::new(TwilioMediaOutput::new(
        start_meta.stream_sid.as_str(),
        twilio_outbound_sink,
        Duration::from_millis(PLAYBACK_GRACE_MILLIS),
    ));

    let (turn_loop, listening) = match TurnLoop::new(
        &session,
        app_state.dispatcher.clone(),
        app_state.speech.clone(),
        output.clone(),
        app_state.call_control.clone(),
        TurnConfig::from(&app_state.config),
    ) {
        Ok(created) => created,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    let stop_conversation = turn_loop.cancellation_token();
    let conversation = tokio::spawn(turn_loop.run());

    if let Err(e) = pump_twilio_media(
        twilio_stream,
        listening,
        app_state.speech.recognizer.clone(),
        output.clone(),
    )
    .await
    {
        handle_error(e).await;
    }

    // No more media can arrive, so nothing we say would be heard.
    stop_conversation.cancel();
    match conversation.await {
        Ok(exit) => debug!(session_id=%session.session_id, ?exit, "conversation over"),
        Err(e) => error!(error=%e, "turn loop task failed"),
    }
    end_orphaned_session(&app_state, &session.session_id);
    drop(output);
    match twilio_ws_messages.await {
        Ok(Ok(())) => (),
        Ok(Err(e)) => handle_error(e).await,
        Err(e) => error!(error=%e, "twilio sink task failed"),
    }
}

/// Nobody is left on a call whose media stream has closed. Inbound calls get no
/// completed callback by default, so the session is retired here.
fn end_orphaned_session(app_state: &AppState, session_id: &str) {
    match app_state.dispatcher.end_session(
        session_id,
        CallStatus::Completed,
        MEDIA_STREAM_CLOSED_REASON,
    ) {
        Ok(session) => {
            info!(session_id=%session.session_id, call_sid=%session.external_call_ref, "ended session after media stream closed")
        }
        Err(e) => debug!(session_id=%session_id, error=%e, "session already ended"),
    }
}
