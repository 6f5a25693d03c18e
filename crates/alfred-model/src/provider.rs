// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::types::{ChatMessage, ModelResponse, ToolSpec};

/// A single model backend.  The router composes two of these into the
/// primary/fallback lanes; everything above the router only sees
/// [`ModelResponse`].
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for status display and error strings.
    fn name(&self) -> &str;

    /// One complete (turn-granular) generation.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<ModelResponse>;

    /// Cheap liveness probe; `false` on any transport or protocol failure.
    async fn health_check(&self) -> bool;
}
