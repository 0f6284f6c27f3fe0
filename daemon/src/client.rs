//! OpenCode server HTTP client
//!
//! Thin wrapper over the session endpoints of a running `opencode serve`.

use std::time::Duration;

use maestro_transcript::MessageWithParts;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Header OpenCode uses to scope requests to a project directory.
pub const DIRECTORY_HEADER: &str = "x-opencode-directory";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A prompt request only answers once the whole assistant turn has finished.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from OpenCode: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Session summary as listed by `GET /session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time: SessionTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
}

#[derive(Debug, Clone)]
pub struct OpenCodeClient {
    base_url: String,
    directory: Option<String>,
    http: reqwest::Client,
}

impl OpenCodeClient {
    pub fn new(base_url: impl Into<String>, directory: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_http(base_url, directory, http)
    }

    pub fn with_http(
        base_url: impl Into<String>,
        directory: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            directory,
            http,
        }
    }

    #[allow(dead_code)]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    /// SSE endpoint of the server's event bus.
    pub fn event_url(&self) -> String {
        self.url("/event")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn scoped(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.directory {
            Some(dir) => req.header(DIRECTORY_HEADER, dir),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        debug!("GET {}", path);
        let resp = self
            .scoped(self.http.get(self.url(path)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(resp).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ClientError> {
        self.send_post(path, body, REQUEST_TIMEOUT).await
    }

    async fn send_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        debug!("POST {}", path);
        let mut req = self.scoped(self.http.post(self.url(path))).timeout(timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        decode(resp).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        self.get("/session").await
    }

    pub async fn create_session(&self, title: Option<&str>) -> Result<SessionSummary, ClientError> {
        let body = title.map(|t| json!({ "title": t }));
        self.post("/session", body).await
    }

    /// Submit a user prompt. OpenCode answers once the assistant turn is over.
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<Value, ClientError> {
        self.send_post(
            &session_path(session_id, "message"),
            Some(prompt_body(text)),
            PROMPT_TIMEOUT,
        )
        .await
    }

    pub async fn abort(&self, session_id: &str) -> Result<Value, ClientError> {
        self.post(&session_path(session_id, "abort"), None).await
    }

    /// Full history of a session, oldest first.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>, ClientError> {
        self.get(&session_path(session_id, "message")).await
    }
}

fn session_path(session_id: &str, action: &str) -> String {
    format!("/session/{session_id}/{action}")
}

/// OpenCode expects a parts array, not a plain content string.
fn prompt_body(text: &str) -> Value {
    json!({
        "parts": [{
            "type": "text",
            "text": text
        }]
    })
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::Status { status, body });
    }

    let bytes = resp.bytes().await?;
    // Some endpoints answer with an empty body.
    if bytes.is_empty() {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_slice(&bytes)?)
}
