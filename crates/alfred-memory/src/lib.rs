// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod compact;
mod knowledge;
mod policy;
mod service;
mod state_extractor;
mod state_items;
mod state_store;

pub use compact::{compact_thread, get_summaries, periodic_compaction, summarize_thread};
pub use knowledge::KnowledgeBaseService;
pub use policy::apply_memory_policy;
pub use service::{MemoryError, MemoryHit, MemoryService, StateHit};
pub use state_extractor::{extract_state_items, ExtractionModel, ExtractionResult};
pub use state_items::{
    compute_uid, has_replacement_verb, has_supersession_signal, normalize_text,
    resolve_status_merge, tier_priority, validate_item, StateItem, StateItemType,
};
pub use state_store::StateStore;
