use crate::error::{AppError, TransportError};
use crate::media::TwilioMediaOutput;
use crate::speech::{ListenHandle, Recognizer};
use crate::twilio_types::{TwilioMessage, TwilioOutbound};
use crate::types::LifecycleEvent;
use crate::utils::b64_decode;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, Stream, StreamExt},
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Task that owns the Twilio websocket sink; everything we say to Twilio goes
/// through its channel.
pub async fn send_twilio_ws_messages(
    mut twilio_outbound_stream: mpsc::Receiver<TwilioOutbound>,
    mut twilio_ws_sink: SplitSink<WebSocket, Message>,
) -> Result<(), AppError> {
    while let Some(twilio_outbound) = twilio_outbound_stream.recv().await {
        let json = serde_json::to_string(&twilio_outbound).map_err(|e| {
            error!(error=%e, "failed to serialize Twilio outbound");
            AppError::Internal("Twilio message serialization error")
        })?;
        let message = Message::Text(json);
        twilio_ws_sink.send(message).await.map_err(|e| {
            error!(error=%e, "failed to send message to Twilio");
            AppError::Transport(TransportError::Connection(e.to_string()))
        })?;
    }
    let _ = twilio_ws_sink.close().await;

    Ok(())
}

/// Task that routes inbound Twilio media stream messages: caller audio goes to
/// whichever recognition stream is open, mark echoes go to the audio output.
/// Returns once Twilio stops the stream.
pub async fn pump_twilio_media<S>(
    mut twilio_stream: S,
    listening: watch::Receiver<Option<ListenHandle>>,
    recognizer: Arc<dyn Recognizer>,
    output: Arc<TwilioMediaOutput>,
) -> Result<(), AppError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Media { media, .. } => {
                            let chunk = match b64_decode(&media.payload) {
                                Ok(chunk) => chunk,
                                Err(e) => {
                                    warn!(error=%e, chunk=%media.chunk, "undecodable media payload");
                                    continue;
                                }
                            };
                            // Clone out of the watch so no borrow is held across the await.
                            let handle = listening.borrow().clone();
                            match handle {
                                Some(handle) => recognizer.feed_audio(&handle, chunk).await,
                                None => trace!("not listening; caller audio dropped"),
                            }
                        }
                        TwilioMessage::Mark { mark, .. } => {
                            trace!(mark=%mark.name, "got mark echo");
                            output.mark_received(&mark.name);
                        }
                        TwilioMessage::Stop {
                            sequence_number, ..
                        } => {
                            debug!("Got stop message {sequence_number}");
                            break Ok(());
                        }
                        TwilioMessage::Connected { .. } | TwilioMessage::Start { .. } => {
                            warn!("unexpected Connected or Start message mid-stream");
                        }
                    },
                    Err(e) => {
                        warn!(error=%e, "failed to parse Twilio text message");
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("twilio closed the media stream");
                    break Ok(());
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => (),
                Ok(m) => {
                    warn!(message=?m, "unsupported message type from Twilio");
                }
                Err(e) => {
                    error!(error=%e, "failed to receive message from Twilio");
                    break Err(AppError::Transport(TransportError::Connection(
                        e.to_string(),
                    )));
                }
            },
            None => {
                info!("end of twilio stream");
                break Ok(());
            }
        }
    }
}

/// Task that logs every lifecycle event the registry publishes.
pub async fn log_lifecycle_events(mut events: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::SessionCreated(session)) => info!(
                session_id=%session.session_id,
                call_sid=%session.external_call_ref,
                direction=?session.direction,
                status=%session.status,
                "call session created"
            ),
            Ok(LifecycleEvent::StatusChanged {
                session_id,
                external_call_ref,
                from,
                to,
                at,
            }) => info!(
                session_id=%session_id,
                call_sid=%external_call_ref,
                %from,
                %to,
                %at,
                "call status changed"
            ),
            Ok(LifecycleEvent::SessionEnded(session)) => {
                let duration = session
                    .ended_at
                    .map(|ended_at| (ended_at - session.started_at).whole_seconds());
                info!(
                    session_id=%session.session_id,
                    call_sid=%session.external_call_ref,
                    status=%session.status,
                    reason=?session.end_reason,
                    duration_secs=?duration,
                    "call session ended"
                )
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "lifecycle logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
