//! Outbound start / cancel / notify calls.
//!
//! The engine builds an [`OutboundRequest`] from a task's request template
//! and hands it to a [`RemoteClient`]. The production client speaks HTTP/1
//! over hyper and retries network-level failures; [`RecordingClient`] keeps
//! requests in memory for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use taskgrid_core::{RequestTemplate, Task, TaskId};
use thiserror::Error;
use tracing::{debug, warn};

/// Why a task is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteAction {
    Start,
    Cancel,
    Notify,
}

impl RemoteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteAction::Start => "start",
            RemoteAction::Cancel => "cancel",
            RemoteAction::Notify => "notify",
        }
    }
}

/// A fully rendered outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub task_id: TaskId,
    pub action: RemoteAction,
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: serde_json::Value,
}

/// Render `template` for `task`. Dependency results are only sent with starts.
pub fn build_request(
    template: &RequestTemplate,
    action: RemoteAction,
    task: &Task,
    callback_base_url: &str,
) -> OutboundRequest {
    let mut body = serde_json::json!({
        "task_id": task.id,
        "action": action,
        "callback_url": callback_url(callback_base_url, &task.id),
        "attachment": template.attachment,
        "state": task.state,
    });
    if action == RemoteAction::Start
        && task.configuration.forward_results
        && !task.dependency_results.is_empty()
    {
        body["dependency_results"] = serde_json::json!(task.dependency_results);
    }
    if action == RemoteAction::Notify {
        body["stop_flag"] = serde_json::json!(task.stop_flag);
    }

    OutboundRequest {
        task_id: task.id.clone(),
        action,
        method: template.method.to_ascii_uppercase(),
        url: template.url.clone(),
        headers: template.headers.clone(),
        body,
    }
}

pub fn callback_url(base: &str, id: &str) -> String {
    format!("{}/api/v1/tasks/{id}/callback", base.trim_end_matches('/'))
}

/// What came back from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl RemoteResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Errors from outbound calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("invalid request for {url}: {reason}")]
    InvalidRequest { url: String, reason: String },

    #[error("unsupported scheme in {0}: only plain http is spoken, terminate TLS in a proxy")]
    UnsupportedScheme(String),

    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("http error from {url}: {reason}")]
    Http { url: String, reason: String },
}

impl RemoteError {
    /// Network-level failures are worth another attempt; malformed requests are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Connect { .. } | RemoteError::Timeout { .. } | RemoteError::Http { .. }
        )
    }
}

/// Sends outbound calls. Implementations must be shareable across tasks.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<RemoteResponse, RemoteError>;
}

// ── HTTP client ────────────────────────────────────────────────────

/// HTTP/1 client over hyper with bounded retries.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    attempts: u32,
    timeout: Duration,
    base_backoff: Duration,
}

impl HttpRemoteClient {
    pub fn new(attempts: u32, timeout: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout,
            base_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    async fn send_once(&self, request: &OutboundRequest) -> Result<RemoteResponse, RemoteError> {
        let url = request.url.as_str();
        let invalid = |reason: String| RemoteError::InvalidRequest {
            url: url.to_string(),
            reason,
        };

        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(RemoteError::UnsupportedScheme(url.to_string()));
        }
        let host = uri.host().ok_or_else(|| invalid("missing host".to_string()))?;
        let address = format!("{host}:{}", uri.port_u16().unwrap_or(80));
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| address.clone());
        let path = uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let method = http::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| invalid(e.to_string()))?;
        let payload = serde_json::to_vec(&request.body).map_err(|e| invalid(e.to_string()))?;

        let mut builder = http::Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, authority)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::USER_AGENT, "taskgrid/0.1");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let req = builder
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| invalid(e.to_string()))?;

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| RemoteError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let http_err = |e: hyper::Error| RemoteError::Http {
                url: url.to_string(),
                reason: e.to_string(),
            };
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(http_err)?;
            // Drive the connection in the background.
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "outbound connection closed with error");
                }
            });

            let resp = sender.send_request(req).await.map_err(http_err)?;
            let status = resp.status().as_u16();
            let bytes = resp.into_body().collect().await.map_err(http_err)?.to_bytes();
            Ok(RemoteResponse {
                status,
                body: parse_body(&bytes),
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                url: url.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn send(&self, request: &OutboundRequest) -> Result<RemoteResponse, RemoteError> {
        let mut backoff = self.base_backoff;
        let mut attempt = 1;
        loop {
            let result = self.send_once(request).await;
            let retry = match &result {
                Ok(resp) => resp.status >= 500,
                Err(e) => e.is_retryable(),
            };
            if !retry || attempt >= self.attempts {
                return result;
            }
            match &result {
                Ok(resp) => debug!(
                    task_id = %request.task_id,
                    action = request.action.as_str(),
                    status = resp.status,
                    attempt,
                    "remote server error, retrying"
                ),
                Err(e) => warn!(
                    task_id = %request.task_id,
                    action = request.action.as_str(),
                    error = %e,
                    attempt,
                    "remote call failed, retrying"
                ),
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
            attempt += 1;
        }
    }
}

/// Decode a response body as JSON, falling back to a string.
fn parse_body(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// ── In-process client ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct Recorded {
    requests: Vec<OutboundRequest>,
    unreachable: BTreeSet<TaskId>,
}

/// Records every request and answers `200 {}`; tasks marked unreachable
/// get a connection error instead.
#[derive(Debug, Clone, Default)]
pub struct RecordingClient {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call for `id` fail at the network level.
    pub fn set_unreachable(&self, id: &str) {
        self.lock().unreachable.insert(id.to_string());
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.lock().requests.clone()
    }

    /// Requests of one action, in send order.
    pub fn sent(&self, action: RemoteAction) -> Vec<OutboundRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.action == action)
            .cloned()
            .collect()
    }

    /// Task ids of requests of one action, in send order.
    pub fn sent_ids(&self, action: RemoteAction) -> Vec<TaskId> {
        self.sent(action).into_iter().map(|r| r.task_id).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        // A poisoned lock only means a test panicked mid-record; the data is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RemoteClient for RecordingClient {
    async fn send(&self, request: &OutboundRequest) -> Result<RemoteResponse, RemoteError> {
        let unreachable = {
            let mut recorded = self.lock();
            recorded.requests.push(request.clone());
            recorded.unreachable.contains(&request.task_id)
        };
        if unreachable {
            return Err(RemoteError::Connect {
                url: request.url.clone(),
                reason: "unreachable".to_string(),
            });
        }
        Ok(RemoteResponse::ok(serde_json::json!({})))
    }
}
