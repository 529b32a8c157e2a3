//! HTTP side of the signalling transport.
//!
//! All REST interactions with the session server go through one
//! [`ApiClient`] so the whole negotiation shares a single connection pool;
//! the push reader issues its auto-acknowledgements through the same client
//! concurrently with the caller flow.
//!
//! Request bodies are built with string formatting rather than a JSON
//! serializer because the session-message payload embeds a deliberately
//! malformed body (see [`crate::message`]); the envelopes themselves stay
//! valid JSON since the body rides inside a string field.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::config::SessionConfig;
use crate::error::{PunchError, PunchResult};
use crate::message::SessionMessage;
use crate::types::ConsoleKind;

/// Identity of the console a session talks to, shared with the push reader
/// for auto-acknowledgements.
#[derive(Debug, Clone)]
pub struct ConsoleTarget {
    /// Server-side session UUID
    pub session_id: String,
    /// Our numeric account id
    pub account_id: u64,
    /// Console device UID
    pub console_uid: [u8; 32],
    /// Console generation
    pub console_kind: ConsoleKind,
}

/// Shared HTTP client for the session endpoints.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    bearer: String,
    config: Arc<SessionConfig>,
}

impl ApiClient {
    /// Creates a client holding the bearer credential and connection pool.
    pub fn new(token: &str, config: Arc<SessionConfig>) -> PunchResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PunchError::Network(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            bearer: format!("Bearer {token}"),
            config,
        })
    }

    /// The `Authorization` header value.
    pub(crate) fn bearer(&self) -> &str {
        &self.bearer
    }

    /// Resolves the FQDN of the push notification server.
    pub async fn fetch_push_fqdn(&self) -> PunchResult<String> {
        let url = format!(
            "{}/np/serveraddr?version=2.1&fields=keepAliveStatus&keepAliveStatusType=3",
            self.config.push_api_base
        );
        let body = self.get(&url, &[]).await?;
        let json: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            PunchError::InvalidSchema(format!("serveraddr response unparseable ({e}): {body}"))
        })?;
        json.get("fqdn")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!("serveraddr response has no fqdn: {body}"))
            })
    }

    /// Creates a remote-play session bound to our push context.
    ///
    /// Returns the server-assigned session UUID and our numeric account id.
    pub async fn create_session(&self, pushctx_id: &str) -> PunchResult<(String, u64)> {
        let url = format!(
            "{}/api/sessionManager/v1/remotePlaySessions",
            self.config.web_api_base
        );
        let body = create_session_body(pushctx_id);
        tracing::debug!("create_session: sending {body}");
        let response = self.post(&url, body, &[]).await?;
        tracing::debug!("create_session: received {response}");

        let json: serde_json::Value = serde_json::from_str(&response).map_err(|e| {
            PunchError::InvalidSchema(format!("create response unparseable ({e}): {response}"))
        })?;
        let session_id = json
            .pointer("/remotePlaySessions/0/sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!("create response has no sessionId: {response}"))
            })?;
        if session_id.len() != 36 {
            return Err(PunchError::InvalidSchema(format!(
                "sessionId is not a UUIDv4: '{session_id}'"
            )));
        }
        let account_id = json
            .pointer("/remotePlaySessions/0/members/0/accountId")
            .and_then(account_id_value)
            .ok_or_else(|| {
                PunchError::InvalidSchema(format!("create response has no accountId: {response}"))
            })?;
        Ok((session_id.to_string(), account_id))
    }

    /// Asks the console to start remote play for our session.
    pub async fn start_session(
        &self,
        target: &ConsoleTarget,
        data1: &[u8; 16],
        data2: &[u8; 16],
    ) -> PunchResult<()> {
        let url = format!(
            "{}/api/cloudAssistedNavigation/v2/users/me/commands",
            self.config.web_api_base
        );
        let envelope = start_session_envelope(target, data1, data2);
        tracing::trace!("start_session: sending {envelope}");
        let response = self
            .post(&url, envelope, &[("User-Agent", "RpNetHttpUtilImpl")])
            .await?;
        tracing::trace!("start_session: received {response}");
        Ok(())
    }

    /// Posts a session message addressed to the console.
    pub async fn send_session_message(
        &self,
        target: &ConsoleTarget,
        message: &SessionMessage,
    ) -> PunchResult<()> {
        let url = format!(
            "{}/api/sessionManager/v1/remotePlaySessions/{}/sessionMessage",
            self.config.web_api_base, target.session_id
        );
        let envelope = message_envelope(target, &message.serialize());
        tracing::debug!("send_session_message: {envelope}");
        self.post(&url, envelope, &[]).await?;
        Ok(())
    }

    /// GET with bearer auth; non-2xx and transport errors map to the
    /// [`PunchError`] taxonomy.
    pub(crate) async fn get(&self, url: &str, headers: &[(&str, &str)]) -> PunchResult<String> {
        let mut request = self.http.get(url).header("Authorization", &self.bearer);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.send().await.map_err(|e| {
            tracing::error!("GET {url} failed: {e}");
            PunchError::Network(e.to_string())
        })?;
        self.check(url, response).await
    }

    /// POST with bearer auth and a JSON content type.
    pub(crate) async fn post(
        &self,
        url: &str,
        body: String,
        headers: &[(&str, &str)],
    ) -> PunchResult<String> {
        let mut request = self
            .http
            .post(url)
            .header("Authorization", &self.bearer)
            .header("Content-Type", "application/json; charset=utf-8");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.body(body).send().await.map_err(|e| {
            tracing::error!("POST {url} failed: {e}");
            PunchError::Network(e.to_string())
        })?;
        self.check(url, response).await
    }

    async fn check(&self, url: &str, response: reqwest::Response) -> PunchResult<String> {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status >= 400 {
            tracing::error!("{url} failed with HTTP {status}");
            tracing::debug!("response body: {body}");
            return Err(PunchError::HttpStatus(status));
        }
        Ok(body)
    }
}

fn account_id_value(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::String(s) => s.parse().ok(),
        other => other.as_u64(),
    }
}

/// Body of the session-creation POST. The server resolves the `"me"`
/// placeholders from the bearer credential.
fn create_session_body(pushctx_id: &str) -> String {
    format!(
        "{{\"remotePlaySessions\":[\
         {{\"members\":[\
         {{\"accountId\":\"me\",\
         \"deviceUniqueId\":\"me\",\
         \"platform\":\"me\",\
         \"pushContexts\":[{{\"pushContextId\":\"{pushctx_id}\"}}]}}]}}]}}"
    )
}

/// Envelope of the start command. `initialParams` is JSON-in-a-string.
fn start_session_envelope(target: &ConsoleTarget, data1: &[u8; 16], data2: &[u8; 16]) -> String {
    let payload = format!(
        "{{\"accountId\":{},\"roomId\":0,\"sessionId\":\"{}\",\"clientType\":\"Windows\",\
         \"data1\":\"{}\",\"data2\":\"{}\"}}",
        target.account_id,
        target.session_id,
        BASE64.encode(data1),
        BASE64.encode(data2),
    );
    format!(
        "{{\"commandDetail\":\
         {{\"commandType\":\"remotePlay\",\
         \"duid\":\"{}\",\
         \"messageDestination\":\"SQS\",\
         \"parameters\":{{\"initialParams\":{}}},\
         \"platform\":\"{}\"}}}}",
        hex::encode(target.console_uid),
        json_string(&payload),
        target.console_kind.platform(),
    )
}

/// Envelope of a session message. The body may be malformed JSON, but it
/// rides inside the payload string, so the envelope itself stays parseable.
fn message_envelope(target: &ConsoleTarget, body: &str) -> String {
    let payload = format!("ver=1.0, type=text, body={body}");
    format!(
        "{{\"channel\":\"remote_play:1\",\
         \"payload\":{},\
         \"to\":[\
         {{\"accountId\":\"{}\",\
         \"deviceUniqueId\":\"{}\",\
         \"platform\":\"{}\"}}]}}",
        json_string(&payload),
        target.account_id,
        hex::encode(target.console_uid),
        target.console_kind.platform(),
    )
}

/// JSON string literal with escaping, quotes included.
fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
