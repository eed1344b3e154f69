use crate::error::TelephonyError;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info};

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";
const STATUS_CALLBACK_EVENTS: &[&str] = &["initiated", "ringing", "answered", "completed"];

/// Outbound call control offered by the telephony provider.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Dial `to` and return the provider's call reference.
    async fn place_call(&self, to: &str) -> Result<String, TelephonyError>;

    async fn hangup(&self, external_call_ref: &str) -> Result<(), TelephonyError>;
}

#[derive(Deserialize, Debug)]
struct TwilioCallResource {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

pub struct TwilioClient {
    http_client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    public_host: String,
    api_base: String,
}

impl TwilioClient {
    pub fn new(
        http_client: reqwest::Client,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
        public_host: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
            public_host: public_host.into(),
            api_base: TWILIO_API_BASE.to_string(),
        }
    }

    fn calls_url(&self) -> String {
        format!("{}/Accounts/{}/Calls.json", self.api_base, self.account_sid)
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{}/Accounts/{}/Calls/{call_sid}.json",
            self.api_base, self.account_sid
        )
    }

    /// Form fields for creating an outbound call that reports every status back to us.
    fn place_call_form(&self, to: &str) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("To", to.to_string()),
            ("From", self.from_number.clone()),
            (
                "Url",
                format!("https://{}/twilio/twiml/outbound", self.public_host),
            ),
            (
                "StatusCallback",
                format!("https://{}/twilio/status", self.public_host),
            ),
            ("StatusCallbackMethod", "POST".to_string()),
        ];
        form.extend(
            STATUS_CALLBACK_EVENTS
                .iter()
                .map(|event| ("StatusCallbackEvent", event.to_string())),
        );
        form
    }

    async fn post_form(
        &self,
        url: String,
        form: &[(&'static str, String)],
    ) -> Result<reqwest::Response, TelephonyError> {
        let resp = self
            .http_client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to twilio");
                e
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(status=%status, body=%body, "twilio rejected request");
            return Err(TelephonyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl CallControl for TwilioClient {
    async fn place_call(&self, to: &str) -> Result<String, TelephonyError> {
        let form = self.place_call_form(to);
        let resp = self.post_form(self.calls_url(), &form).await?;
        let call = resp.json::<TwilioCallResource>().await?;
        info!(call_sid=%call.sid, status=?call.status, to=%to, "placed outbound call");
        Ok(call.sid)
    }

    async fn hangup(&self, external_call_ref: &str) -> Result<(), TelephonyError> {
        let form = [("Status", "completed".to_string())];
        self.post_form(self.call_url(external_call_ref), &form)
            .await?;
        debug!(call_sid=%external_call_ref, "requested hangup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TwilioClient {
        TwilioClient::new(
            reqwest::Client::new(),
            "AC123",
            "secret",
            "+15550001111",
            "calls.example.com",
        )
    }

    #[test]
    fn outbound_call_form_points_twilio_back_at_us() {
        let form = client().place_call_form("+15552223333");
        assert!(form.contains(&("To", "+15552223333".to_string())));
        assert!(form.contains(&("From", "+15550001111".to_string())));
        assert!(form.contains(&(
            "Url",
            "https://calls.example.com/twilio/twiml/outbound".to_string()
        )));
        assert!(form.contains(&(
            "StatusCallback",
            "https://calls.example.com/twilio/status".to_string()
        )));
        let events: Vec<&str> = form
            .iter()
            .filter(|(k, _)| *k == "StatusCallbackEvent")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(events, STATUS_CALLBACK_EVENTS);
    }

    #[test]
    fn call_urls_are_scoped_to_the_account() {
        let c = client();
        assert_eq!(
            c.calls_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Calls.json"
        );
        assert_eq!(
            c.call_url("CA9"),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Calls/CA9.json"
        );
    }
}
