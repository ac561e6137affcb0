//! Telephony provider glue: outbound call creation and the connection
//! document handed back from the voice webhook.

use secrecy::{ExposeSecret, SecretString};

pub const TWILIO_API_BASE: &str = "https://api.twilio.com";

#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    #[error("call creation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected call creation ({status}): {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Thin REST client for the provider's call API.
pub struct TwilioClient {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: SecretString,
    from_number: String,
}

#[derive(serde::Deserialize)]
struct CallResource {
    sid: String,
}

impl TwilioClient {
    pub fn new(
        api_base: &str,
        account_sid: &str,
        auth_token: SecretString,
        from_number: &str,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            account_sid: account_sid.to_string(),
            auth_token,
            from_number: from_number.to_string(),
        }
    }

    /// Starts an outbound call. The provider fetches the connection document
    /// from `voice_url` once the callee picks up. A rejection is surfaced
    /// verbatim, body and all.
    pub async fn create_call(&self, to: &str, voice_url: &str) -> Result<String, TwilioError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        );
        let params = [
            ("To", to),
            ("From", self.from_number.as_str()),
            ("Url", voice_url),
        ];
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TwilioError::Rejected { status, body });
        }
        let call: CallResource = response.json().await?;
        Ok(call.sid)
    }
}

/// Renders the document instructing the provider to open the media stream
/// and where to post status callbacks.
pub fn voice_document(greeting: &str, stream_url: &str, callback_url: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            "<Response>",
            r#"<Say voice="Polly.Joanna">{greeting}</Say>"#,
            "<Start>",
            r#"<Stream url="{stream}" statusCallback="{callback}" statusCallbackEvent="start error end"/>"#,
            "</Start>",
            "</Response>",
        ),
        greeting = xml_escape(greeting),
        stream = xml_escape(stream_url),
        callback = xml_escape(callback_url),
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Stream status callback posted by the provider. Observability only: the
/// socket's own stop/error events are authoritative for the relay.
#[derive(Debug, serde::Deserialize)]
pub struct StatusCallback {
    #[serde(rename = "CallSid")]
    pub call_sid: Option<String>,
    #[serde(rename = "StreamStatus")]
    pub stream_status: Option<String>,
    #[serde(rename = "ErrorCode")]
    pub error_code: Option<String>,
    #[serde(rename = "ErrorMessage")]
    pub error_message: Option<String>,
}
