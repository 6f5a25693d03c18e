// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted in-memory provider for tests and offline development.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::ModelProvider;
use crate::types::{ChatMessage, ModelResponse, ToolSpec};

enum Scripted {
    Ok(ModelResponse),
    Err(String),
}

/// A provider that replays a scripted sequence of responses and failures.
/// When the script runs dry it repeats the last configured behavior.
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    last: Mutex<Option<ModelResponse>>,
    healthy: bool,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(Some(ModelResponse::text_only("ok"))),
            healthy: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with the given text.
    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mock = Self::new(name);
        *mock.last.lock().expect("last lock") = Some(ModelResponse::text_only(text));
        mock
    }

    /// Always fail with the given message; reports unhealthy.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        let mock = Self::new(name);
        let message = message.into();
        mock.script
            .lock()
            .expect("script lock")
            .push_back(Scripted::Err(message));
        *mock.last.lock().expect("last lock") = None;
        Self { healthy: false, ..mock }
    }

    pub fn push_response(&self, response: ModelResponse) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Scripted::Ok(response));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Scripted::Err(message.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolSpec]>,
        _temperature: f32,
        _max_tokens: u32,
    ) -> anyhow::Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(Scripted::Ok(response)) => {
                *self.last.lock().expect("last lock") = Some(response.clone());
                Ok(response)
            }
            Some(Scripted::Err(message)) => {
                // A scripted failure is sticky once the script is dry.
                let repeat = message.clone();
                let mut script = self.script.lock().expect("script lock");
                if script.is_empty() && self.last.lock().expect("last lock").is_none() {
                    script.push_back(Scripted::Err(repeat));
                }
                anyhow::bail!("{}: {message}", self.name)
            }
            None => match self.last.lock().expect("last lock").clone() {
                Some(response) => Ok(response),
                None => anyhow::bail!("{}: mock script exhausted", self.name),
            },
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
