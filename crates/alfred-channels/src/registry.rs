// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::ChannelAdapter;

/// Registered channel adapters keyed by channel type.
#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: impl ChannelAdapter + 'static) {
        self.adapters
            .insert(adapter.channel_type().to_string(), Arc::new(adapter));
    }

    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(channel_type).cloned()
    }

    pub fn channel_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.keys().cloned().collect();
        types.sort();
        types
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
