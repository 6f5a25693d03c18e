// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::provider::ModelProvider;
use crate::types::{ChatMessage, ModelResponse, Priority, ProviderError, ToolSpec};

const OVERLOAD_CACHE_TTL: Duration = Duration::from_secs(5);

/// Source of local-LLM queue depth for backpressure decisions.
#[async_trait]
pub trait QueueDepthProbe: Send + Sync {
    /// Combined ready + unacknowledged depth of the `local_llm` queue, or
    /// `None` when the probe is unavailable.
    async fn local_llm_depth(&self) -> Option<u64>;
}

/// Probe backed by the broker management API (`GET /api/queues`).
pub struct BrokerMgmtProbe {
    base_url: String,
    user: String,
    password: String,
    client: reqwest::Client,
}

impl BrokerMgmtProbe {
    pub fn new(base_url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            user: user.into(),
            password: password.into(),
            client,
        }
    }
}

#[async_trait]
impl QueueDepthProbe for BrokerMgmtProbe {
    async fn local_llm_depth(&self) -> Option<u64> {
        let base = self.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return None;
        }
        let mut request = self.client.get(format!("{base}/api/queues"));
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }
        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), "broker management API queue check failed");
                return None;
            }
            Err(err) => {
                warn!(error = %err, "broker management API queue check failed");
                return None;
            }
        };
        let payload: Value = response.json().await.ok()?;
        let queues = payload.as_array()?;
        for item in queues {
            if item.get("name").and_then(Value::as_str) == Some("local_llm") {
                let ready = item.get("messages_ready").and_then(Value::as_u64).unwrap_or(0);
                let unacked = item
                    .get("messages_unacknowledged")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                return Some(ready + unacked);
            }
        }
        None
    }
}

/// Both lanes' liveness, probed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterHealth {
    pub primary: bool,
    pub fallback: bool,
}

/// Primary/fallback model dispatch with queue-aware degradation.
///
/// The overload check shares state across calls through a short-TTL cache so
/// concurrent steps do not stampede the management API.
pub struct ProviderRouter {
    primary: Arc<dyn ModelProvider>,
    fallback: Arc<dyn ModelProvider>,
    probe: Arc<dyn QueueDepthProbe>,
    queue_threshold_local_llm: u64,
    overload_cache: Mutex<Option<(Instant, bool)>>,
}

impl ProviderRouter {
    pub fn new(
        primary: Arc<dyn ModelProvider>,
        fallback: Arc<dyn ModelProvider>,
        probe: Arc<dyn QueueDepthProbe>,
        queue_threshold_local_llm: u64,
    ) -> Self {
        Self {
            primary,
            fallback,
            probe,
            queue_threshold_local_llm,
            overload_cache: Mutex::new(None),
        }
    }

    async fn local_llm_overloaded(&self) -> bool {
        if self.queue_threshold_local_llm == 0 {
            return false;
        }
        let mut cache = self.overload_cache.lock().await;
        if let Some((stamp, value)) = *cache {
            if stamp.elapsed() < OVERLOAD_CACHE_TTL {
                return value;
            }
        }
        let overloaded = match self.probe.local_llm_depth().await {
            Some(depth) => depth > self.queue_threshold_local_llm,
            None => false,
        };
        *cache = Some((Instant::now(), overloaded));
        overloaded
    }

    /// Generate with fallback.  Returns `(response, lane, primary_error)`
    /// where `lane` is `"primary"` or `"fallback"` and `primary_error`
    /// carries the primary failure when the fallback lane answered.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
        temperature: f32,
        max_tokens: u32,
        priority: Priority,
    ) -> Result<(ModelResponse, &'static str, Option<String>), ProviderError> {
        let primary_error = match self
            .primary
            .generate(messages, tools, temperature, max_tokens)
            .await
        {
            Ok(response) => return Ok((response, "primary", None)),
            Err(err) => format!("{err:#}"),
        };
        warn!(error = %primary_error, "primary provider failed");

        // Low-priority work must not burn the local LLM while its queue is
        // already deep; the retryable error sends the task back to its queue.
        if priority == Priority::Low && self.local_llm_overloaded().await {
            return Err(ProviderError::retryable(primary_error));
        }

        match self
            .fallback
            .generate(messages, tools, temperature, max_tokens)
            .await
        {
            Ok(response) => Ok((response, "fallback", Some(primary_error))),
            Err(fallback_err) => Err(ProviderError::retryable(format!(
                "all providers failed: primary={primary_error}, fallback={fallback_err:#}"
            ))),
        }
    }

    pub async fn health(&self) -> RouterHealth {
        RouterHealth {
            primary: self.primary.health_check().await,
            fallback: self.fallback.health_check().await,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
