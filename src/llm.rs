//! LLM model metadata from the control plane, with a short-lived insights cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::control_plane::ControlPlaneClient;
use crate::error::ControlPlaneError;

/// How long assembled insights are served from cache.
pub const INSIGHTS_TTL: Duration = Duration::from_secs(5 * 60);

/// A model offered by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub recommended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatible_runtimes: Option<Vec<String>>,
}

/// Provider reachability as reported on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub model_count: usize,
}

/// Providers, models, and default model joined for one view.
#[derive(Debug, Clone, Serialize)]
pub struct LlmInsights {
    pub providers: Vec<ProviderStatus>,
    pub models: Vec<ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<ModelInfo>,
    pub last_updated: DateTime<Utc>,
    pub cached_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelTestRequest {
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelTestResponse {
    pub success: bool,
    pub model_id: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl ModelTestResponse {
    /// Probing models directly is not supported; report that plainly.
    pub fn unsupported(model_id: &str) -> Self {
        Self {
            success: false,
            model_id: model_id.to_string(),
            latency_ms: 0,
            error: Some("Model testing not yet implemented".to_string()),
            response: None,
        }
    }
}

/// Join provider names with per-provider model counts.
pub fn build_insights(
    provider_names: Vec<String>,
    models: Vec<ModelInfo>,
    default_model: Option<ModelInfo>,
    now: DateTime<Utc>,
) -> LlmInsights {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for model in &models {
        *counts.entry(model.provider.as_str()).or_default() += 1;
    }

    let providers = provider_names
        .into_iter()
        .map(|name| ProviderStatus {
            model_count: counts.get(name.as_str()).copied().unwrap_or(0),
            name,
            connected: true,
            latency_ms: None,
            error: None,
        })
        .collect();

    LlmInsights {
        providers,
        models,
        default_model,
        last_updated: now,
        cached_until: now + chrono::Duration::from_std(INSIGHTS_TTL).unwrap_or_default(),
    }
}

/// Caches assembled insights for [`INSIGHTS_TTL`].
pub struct LlmInsightsCache {
    entry: RwLock<Option<(Instant, LlmInsights)>>,
    ttl: Duration,
}

impl Default for LlmInsightsCache {
    fn default() -> Self {
        Self::new(INSIGHTS_TTL)
    }
}

impl LlmInsightsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            ttl,
        }
    }

    /// Fresh cached insights, if any.
    pub async fn cached(&self) -> Option<LlmInsights> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|(stored, _)| stored.elapsed() < self.ttl)
            .map(|(_, insights)| insights.clone())
    }

    pub async fn store(&self, insights: LlmInsights) {
        *self.entry.write().await = Some((Instant::now(), insights));
    }

    /// Cached insights, or a fresh fetch when stale. With no client the
    /// result is empty and not cached.
    pub async fn get_or_fetch(
        &self,
        client: Option<&ControlPlaneClient>,
    ) -> Result<LlmInsights, ControlPlaneError> {
        if let Some(insights) = self.cached().await {
            debug!("Serving cached LLM insights");
            return Ok(insights);
        }

        let Some(client) = client else {
            return Ok(build_insights(Vec::new(), Vec::new(), None, Utc::now()));
        };

        let (models, providers, default_model) = tokio::join!(
            client.list_models(),
            client.list_providers(),
            client.default_model()
        );
        let insights = build_insights(providers?, models?, default_model.ok().flatten(), Utc::now());
        self.store(insights.clone()).await;
        Ok(insights)
    }
}
