use crate::error::ResponderError;
use crate::openai_types::{OpenAIBatchResponse, OpenAIMessage, OpenAIPayload};
use crate::types::{CallDirection, ConversationTurn};

use async_trait::async_trait;
use tracing::{debug, error};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const SYSTEM_PROMPT: &str = "You are a friendly and helpful phone receptionist. \
                             Keep answers short enough to be spoken aloud.";
const MAX_REPLY_TOKENS: u32 = 200;

/// What a responder knows about the call it is answering for.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub session_id: String,
    pub external_call_ref: String,
    pub direction: CallDirection,
    /// Completed turns, oldest first
    pub turns: Vec<ConversationTurn>,
}

/// Produces the reply to one caller utterance.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        utterance: &str,
        context: &SessionContext,
    ) -> Result<String, ResponderError>;
}

pub struct OpenAiResponder {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiResponder {
    pub fn new(http_client: reqwest::Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http_client,
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

/// Aggregate conversation up till now; to be sent to OpenAI as context for continuation prompt
pub fn conversation_messages(utterance: &str, context: &SessionContext) -> Vec<OpenAIMessage> {
    let mut conversation = vec![OpenAIMessage::new("system", SYSTEM_PROMPT)];
    for turn in &context.turns {
        if !turn.caller_side.is_empty() {
            conversation.push(OpenAIMessage::new("user", turn.caller_side.as_str()));
        }
        if !turn.bot_side.is_empty() {
            conversation.push(OpenAIMessage::new("assistant", turn.bot_side.as_str()));
        }
    }
    conversation.push(OpenAIMessage::new("user", utterance));
    conversation
}

#[async_trait]
impl Responder for OpenAiResponder {
    async fn respond(
        &self,
        utterance: &str,
        context: &SessionContext,
    ) -> Result<String, ResponderError> {
        let payload = OpenAIPayload {
            model: self.model.clone(),
            messages: conversation_messages(utterance, context),
            max_tokens: Some(MAX_REPLY_TOKENS),
            ..Default::default()
        };
        debug!(
            session_id=%context.session_id,
            call_sid=%context.external_call_ref,
            direction=?context.direction,
            turns=context.turns.len(),
            "sending conversation to openai"
        );
        let resp = self
            .http_client
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to OpenAI");
                ResponderError::Failed(e.to_string())
            })?
            .error_for_status()
            .map_err(|e| {
                error!(error=%e, "OpenAI rejected chat request");
                ResponderError::Failed(e.to_string())
            })?;
        let resp = resp.json::<OpenAIBatchResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize openai chat response");
            ResponderError::Failed(e.to_string())
        })?;
        debug!(id=%resp.id, model=%resp.model, usage=?resp.usage, "openai chat response");
        let reply = resp
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .unwrap_or_default();
        if reply.is_empty() {
            return Err(ResponderError::Failed("empty completion".to_string()));
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_replays_previous_turns_before_the_new_utterance() {
        let context = SessionContext {
            session_id: "s1".into(),
            external_call_ref: "CA1".into(),
            direction: CallDirection::Inbound,
            turns: vec![
                ConversationTurn {
                    caller_side: "Hi".into(),
                    bot_side: "Hello, how can I help?".into(),
                },
                ConversationTurn {
                    caller_side: "Hmm".into(),
                    bot_side: String::new(),
                },
            ],
        };
        let messages = conversation_messages("I need an appointment", &context);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user", "user"]);
        assert_eq!(messages[4].content, "I need an appointment");
    }
}
