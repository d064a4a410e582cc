//! HTTP client for the remote control plane.
//!
//! Two auth schemes are in play: `UserKey` for read-only catalog and health
//! endpoints, `Bearer` for execution submission and streaming.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ControlPlaneError;
use crate::llm::ModelInfo;
use crate::normalizer::{SseDecoder, SseFrame, StreamEvent, normalize_sse_event};

/// Timeout for catalog requests.
const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for submitting an execution.
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer between the stream reader and its consumer.
const STREAM_BUFFER: usize = 100;

/// Items yielded by an execution stream.
pub type StreamItem = Result<StreamEvent, ControlPlaneError>;

/// Outcome of a health probe that reached the server.
#[derive(Debug, Clone, Copy)]
pub struct HealthProbe {
    pub status: StatusCode,
    pub latency: Duration,
}

/// An execution accepted by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionHandle {
    #[serde(alias = "execution_id")]
    pub id: String,
    #[serde(default)]
    pub status: String,
}

/// Which catalog to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Agents,
    Teams,
    Environments,
}

impl CatalogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CatalogKind::Agents => "agents",
            CatalogKind::Teams => "teams",
            CatalogKind::Environments => "environments",
        }
    }
}

/// Trimmed catalog entry for pickers on the dashboard.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CatalogItem {
    fn from_value(kind: CatalogKind, value: &Value) -> Option<Self> {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(String::from);
        let id = text("id")?;
        Some(Self {
            name: text("name").unwrap_or_else(|| id.clone()),
            description: match kind {
                CatalogKind::Environments => None,
                _ => text("description").filter(|d| !d.is_empty()),
            },
            model: match kind {
                CatalogKind::Agents => text("model_id").or_else(|| text("model")),
                _ => None,
            },
            id,
        })
    }
}

/// Client for the remote control plane API.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, api_key: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn user_key(&self) -> String {
        format!("UserKey {}", self.api_key.expose_secret())
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }

    /// `GET /api/health` with `UserKey` auth.
    pub async fn probe_health(&self, timeout: Duration) -> Result<HealthProbe, ControlPlaneError> {
        let started = Instant::now();
        let response = self
            .http
            .get(format!("{}/api/health", self.base_url))
            .header("Authorization", self.user_key())
            .timeout(timeout)
            .send()
            .await?;
        Ok(HealthProbe {
            status: response.status(),
            latency: started.elapsed(),
        })
    }

    /// Submit an agent execution. The returned id names the stream to follow.
    pub async fn execute_agent(
        &self,
        agent_id: &str,
        prompt: &str,
        worker_queue_id: &str,
    ) -> Result<ExecutionHandle, ControlPlaneError> {
        let url = format!("{}/api/v1/agents/{}/execute", self.base_url, agent_id);
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.bearer())
            .timeout(EXECUTE_TIMEOUT)
            .json(&json!({
                "prompt": prompt,
                "worker_queue_id": worker_queue_id,
                "stream": true,
            }))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let handle: ExecutionHandle = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::InvalidResponse(e.to_string()))?;
        info!(agent_id = %agent_id, execution_id = %handle.id, "Execution submitted");
        Ok(handle)
    }

    /// Open the execution's SSE stream and relay normalized events.
    ///
    /// The channel closes after a terminal event, at end of stream, or once
    /// `cancel` fires. Transport errors arrive as a final `Err` item.
    /// Cancelling before the server answers yields `ControlPlaneError::Cancelled`.
    pub async fn stream_execution(
        &self,
        execution_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamItem>, ControlPlaneError> {
        let url = format!("{}/api/v1/executions/{}/stream", self.base_url, execution_id);
        let request = self
            .http
            .get(&url)
            .header("Authorization", self.bearer())
            .header("Accept", "text/event-stream")
            .send();
        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(ControlPlaneError::Cancelled),
            response = request => response?,
        };

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Stream {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let execution_id = execution_id.to_string();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = response.chunk() => chunk,
                };
                match chunk {
                    Ok(Some(bytes)) => {
                        for frame in decoder.push(&bytes) {
                            if !forward_frame(&tx, &cancel, frame).await {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        if let Some(frame) = decoder.finish() {
                            forward_frame(&tx, &cancel, frame).await;
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(execution_id = %execution_id, error = %e, "Execution stream read failed");
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
            debug!(execution_id = %execution_id, "Execution stream closed");
        });

        Ok(rx)
    }

    /// List agents, teams, or environments.
    pub async fn list_catalog(&self, kind: CatalogKind) -> Result<Vec<CatalogItem>, ControlPlaneError> {
        let body: Value = self.get_user_key(&format!("/api/v1/{}", kind.as_str())).await?;
        let items: &[Value] = match &body {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => map
                .get(kind.as_str())
                .or_else(|| map.get("items"))
                .or_else(|| map.get("data"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            _ => &[],
        };
        Ok(items
            .iter()
            .filter_map(|v| CatalogItem::from_value(kind, v))
            .collect())
    }

    /// Available models. A non-200 answer yields an empty list.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ControlPlaneError> {
        Ok(self
            .get_user_key_optional("/api/v1/models")
            .await?
            .unwrap_or_default())
    }

    /// Provider names. A non-200 answer yields an empty list.
    pub async fn list_providers(&self) -> Result<Vec<String>, ControlPlaneError> {
        Ok(self
            .get_user_key_optional("/api/v1/models/providers")
            .await?
            .unwrap_or_default())
    }

    /// The control plane's default model, if it reports one.
    pub async fn default_model(&self) -> Result<Option<ModelInfo>, ControlPlaneError> {
        self.get_user_key_optional("/api/v1/models/default").await
    }

    async fn get_user_key<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ControlPlaneError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", self.user_key())
            .timeout(CATALOG_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Api {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ControlPlaneError::InvalidResponse(e.to_string()))
    }

    async fn get_user_key_optional<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, ControlPlaneError> {
        match self.get_user_key(path).await {
            Ok(value) => Ok(Some(value)),
            Err(ControlPlaneError::Api { status, .. }) => {
                debug!(path = %path, status, "Control plane returned no data");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Normalize and send one frame. Returns `false` when relaying should stop.
async fn forward_frame(
    tx: &mpsc::Sender<StreamItem>,
    cancel: &CancellationToken,
    frame: SseFrame,
) -> bool {
    let event_name = if frame.event.is_empty() {
        "message"
    } else {
        frame.event.as_str()
    };
    let event = normalize_sse_event(event_name, &frame.id, &frame.data);
    let terminal = event.is_terminal();

    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(Ok(event)) => sent.is_ok() && !terminal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_item_simplifies_agents() {
        let raw = json!({"id": "a1", "name": "Ops", "description": "runs ops", "model_id": "gpt-4o", "extra": 1});
        let item = CatalogItem::from_value(CatalogKind::Agents, &raw).unwrap();
        assert_eq!(item.model.as_deref(), Some("gpt-4o"));
        assert_eq!(item.description.as_deref(), Some("runs ops"));

        let env = CatalogItem::from_value(CatalogKind::Environments, &raw).unwrap();
        assert!(env.description.is_none());
        assert!(env.model.is_none());

        assert!(CatalogItem::from_value(CatalogKind::Teams, &json!({"name": "no id"})).is_none());
    }

    #[test]
    fn base_url_is_trimmed() {
        let client = ControlPlaneClient::new("https://cp.example.com/", SecretString::from("k"));
        assert_eq!(client.base_url(), "https://cp.example.com");
        assert_eq!(client.user_key(), "UserKey k");
        assert_eq!(client.bearer(), "Bearer k");
    }

    #[tokio::test]
    async fn forward_stops_after_terminal_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let output = SseFrame {
            event: "message".into(),
            data: r#"{"content":"hi"}"#.into(),
            ..Default::default()
        };
        let done = SseFrame {
            event: "done".into(),
            data: "{}".into(),
            ..Default::default()
        };
        assert!(forward_frame(&tx, &cancel, output).await);
        assert!(!forward_frame(&tx, &cancel, done).await);
        assert_eq!(rx.recv().await.unwrap().unwrap().content, "hi");
        assert!(rx.recv().await.unwrap().unwrap().is_terminal());
    }
}
