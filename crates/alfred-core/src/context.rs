// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use alfred_channels::ChannelRegistry;
use alfred_config::Settings;
use alfred_memory::ExtractionModel;
use alfred_model::{ChatMessage, Priority, ProviderRouter};
use alfred_store::Db;
use alfred_tasks::TaskRunner;
use alfred_tools::ToolRuntime;

use crate::notify::AgentNotification;

/// Everything an agent step needs.  Cheap to clone pieces are shared; the
/// step itself is re-entrant given only `(trace_id, thread_id, actor_id)`.
pub struct StepContext {
    pub db: Db,
    pub settings: Settings,
    pub runtime: ToolRuntime,
    pub router: Arc<ProviderRouter>,
    pub runner: Arc<TaskRunner>,
    pub channels: Arc<ChannelRegistry>,
    pub notifications: Option<mpsc::Sender<AgentNotification>>,
}

/// Adapter exposing the router as the memory layer's extraction model.
/// Extraction runs at low priority so it is shed first under backpressure.
pub(crate) struct RouterExtractionModel(pub Arc<ProviderRouter>);

#[async_trait]
impl ExtractionModel for RouterExtractionModel {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let (response, _lane, _primary_error) = self
            .0
            .generate(&[ChatMessage::user(prompt)], None, 0.2, 1024, Priority::Low)
            .await
            .map_err(|err| anyhow::anyhow!(err.message))?;
        Ok(response.text)
    }
}
