pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

/// Custom stream parameter carrying our session id into the media websocket.
pub const SESSION_ID_PARAMETER: &str = "sessionId";

mod twiml {
    use xmlserde::xml_serde_enum;
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Say")]
        Say(SayAction),
        #[xmlserde(name = b"Connect")]
        Connect(ConnectAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct ConnectAction {
        #[xmlserde(ty = "untag")]
        pub connection: Connection,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum Connection {
        #[xmlserde(name = b"Stream")]
        Stream(StreamAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct StreamAction {
        #[xmlserde(name = b"url", ty = "attr")]
        pub url: String,
        #[xmlserde(name = b"track", ty = "attr")]
        pub track: Option<StreamTrack>,
        #[xmlserde(name = b"Parameter", ty = "child")]
        pub parameters: Vec<StreamParameter>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct StreamParameter {
        #[xmlserde(name = b"name", ty = "attr")]
        pub name: String,
        #[xmlserde(name = b"value", ty = "attr")]
        pub value: String,
    }

    xml_serde_enum! {
        #[derive(PartialEq, Eq, Debug)]
        StreamTrack {
            Inbound => "inbound_track",
            Outbound => "outbound_track",
            Both => "both_tracks",
        }
    }
}
pub use twiml::*;

/// TwiML that greets the caller and connects the call to our media websocket.
pub fn connect_twiml(greeting: &str, stream_url: &str, session_id: &str) -> String {
    let say_action = SayAction {
        text: greeting.to_string(),
        ..Default::default()
    };
    let stream_action = StreamAction {
        url: stream_url.to_string(),
        track: Some(StreamTrack::Inbound),
        parameters: vec![StreamParameter {
            name: SESSION_ID_PARAMETER.to_string(),
            value: session_id.to_string(),
        }],
    };
    let response = Response {
        actions: vec![
            ResponseAction::Say(say_action),
            ResponseAction::Connect(ConnectAction {
                connection: Connection::Stream(stream_action),
            }),
        ],
    };
    wrap_twiml(xmlserde::xml_serialize(response))
}

/// TwiML that only speaks, used when no session could be set up for the call.
pub fn say_twiml(text: &str) -> String {
    let response = Response {
        actions: vec![ResponseAction::Say(SayAction {
            text: text.to_string(),
            ..Default::default()
        })],
    };
    wrap_twiml(xmlserde::xml_serialize(response))
}

mod ws {
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct OutboundMarkMeta {
        pub name: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioOutbound {
        Mark {
            mark: OutboundMarkMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Media {
            media: OutboundMediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct OutboundMediaMeta {
        pub payload: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioMessage {
        Connected {
            protocol: String,
            version: String,
        },
        Start {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            start: StartMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Media {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            media: MediaMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Stop {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            stop: StopMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
        Mark {
            #[serde(rename = "sequenceNumber")]
            sequence_number: String,
            mark: MarkMeta,
            #[serde(rename = "streamSid")]
            stream_sid: String,
        },
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct StartMeta {
        #[serde(rename = "streamSid")]
        pub stream_sid: String,
        #[serde(rename = "accountSid")]
        pub account_sid: String,
        #[serde(rename = "callSid")]
        pub call_sid: String,
        #[serde(default)]
        pub tracks: Vec<String>,
        #[serde(rename = "customParameters", default)]
        pub custom_parameters: HashMap<String, String>,
        #[serde(rename = "mediaFormat")]
        pub media_format: MediaFormat,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct MediaFormat {
        pub encoding: String,
        #[serde(rename = "sampleRate")]
        pub sample_rate: u32,
        pub channels: u16,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct MediaMeta {
        #[serde(default)]
        pub track: Option<MediaTrack>,
        pub chunk: String,
        pub timestamp: String,
        pub payload: String,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum MediaTrack {
        Inbound,
        Outbound,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct StopMeta {
        #[serde(rename = "accountSid")]
        pub account_sid: String,
        #[serde(rename = "callSid")]
        pub call_sid: String,
    }

    #[derive(Serialize, Deserialize, Debug)]
    pub struct MarkMeta {
        pub name: String,
    }
}
pub use ws::*;

mod callback {
    use crate::dispatcher::StatusEvent;
    use crate::types::{CallDirection, CallStatus};

    use serde::Deserialize;
    use time::format_description::well_known::Rfc2822;
    use time::OffsetDateTime;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum TwilioCallStatus {
        Queued,
        Initiated,
        Ringing,
        InProgress,
        Completed,
        Busy,
        Failed,
        NoAnswer,
        Canceled,
    }

    impl From<TwilioCallStatus> for CallStatus {
        fn from(status: TwilioCallStatus) -> Self {
            match status {
                TwilioCallStatus::Queued | TwilioCallStatus::Initiated => CallStatus::Initiated,
                TwilioCallStatus::Ringing => CallStatus::Ringing,
                TwilioCallStatus::InProgress => CallStatus::InProgress,
                TwilioCallStatus::Completed => CallStatus::Completed,
                TwilioCallStatus::Busy => CallStatus::Busy,
                TwilioCallStatus::Failed => CallStatus::Failed,
                TwilioCallStatus::NoAnswer => CallStatus::NoAnswer,
                TwilioCallStatus::Canceled => CallStatus::Canceled,
            }
        }
    }

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum TwilioCallDirection {
        Inbound,
        OutboundApi,
        OutboundDial,
    }

    impl From<TwilioCallDirection> for CallDirection {
        fn from(direction: TwilioCallDirection) -> Self {
            match direction {
                TwilioCallDirection::Inbound => CallDirection::Inbound,
                TwilioCallDirection::OutboundApi | TwilioCallDirection::OutboundDial => {
                    CallDirection::Outbound
                }
            }
        }
    }

    /// Form body of Twilio voice webhooks and status callbacks. Only the call sid
    /// and status are required; the rest varies by webhook kind.
    #[allow(dead_code)]
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct TwilioCallPayload {
        pub call_sid: String,
        pub call_status: TwilioCallStatus,
        pub account_sid: Option<String>,
        pub direction: Option<TwilioCallDirection>,
        pub from: Option<String>,
        pub to: Option<String>,
        pub timestamp: Option<String>,
        pub sequence_number: Option<String>,
        pub call_duration: Option<String>,
    }

    impl TwilioCallPayload {
        pub fn into_event(self) -> StatusEvent {
            let timestamp = self
                .timestamp
                .as_deref()
                .and_then(|ts| OffsetDateTime::parse(ts, &Rfc2822).ok());
            StatusEvent {
                external_call_ref: self.call_sid,
                status: self.call_status.into(),
                direction: self.direction.map(CallDirection::from),
                from: self.from.filter(|s| !s.is_empty()),
                to: self.to.filter(|s| !s.is_empty()),
                timestamp,
            }
        }
    }
}
pub use callback::*;
