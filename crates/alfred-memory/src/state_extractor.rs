// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Best-effort extraction of structured state items from new messages.
//!
//! Runs before the model call of an agent step.  Deterministic merge: items
//! dedup by uid, then by high-cosine embedding against existing items of the
//! same type; supersession only fires when the text itself carries a
//! supersession signal.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use alfred_events::embed::embed_text;
use alfred_store::{now_iso, queries, Db};

use crate::service::MemoryError;
use crate::state_items::{
    has_supersession_signal, resolve_status_merge, validate_item, StateItem, StateItemType,
};
use crate::state_store::StateStore;

/// Cosine threshold treated as "the same fact, phrased differently".
const MERGE_SIMILARITY: f32 = 0.9;

/// The model behind extraction; the orchestrator adapts the provider router
/// to this.
#[async_trait]
pub trait ExtractionModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractionResult {
    pub items_new: u32,
    pub items_merged: u32,
    pub items_dropped: u32,
    pub items_superseded: u32,
    pub skipped_reason: Option<String>,
}

impl ExtractionResult {
    fn skipped(reason: &str) -> Self {
        Self {
            skipped_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct IncomingItem {
    #[serde(default)]
    type_tag: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    confidence: String,
    #[serde(default)]
    topic_tags: Vec<String>,
    #[serde(default)]
    refs: Vec<String>,
    #[serde(default)]
    supersedes: Option<String>,
    #[serde(default)]
    conflict: bool,
}

fn confidence_rank(confidence: &str) -> u8 {
    match confidence {
        "high" => 2,
        "medium" => 1,
        _ => 0,
    }
}

fn max_confidence(a: &str, b: &str) -> String {
    if confidence_rank(a) >= confidence_rank(b) {
        a.to_string()
    } else {
        b.to_string()
    }
}

/// Pull the first JSON array out of a model reply that may be wrapped in
/// prose or markdown fences.
fn parse_items(raw: &str) -> Option<Vec<IncomingItem>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

fn extraction_prompt(messages: &[queries::MessageRow]) -> String {
    let mut prompt = String::from(
        "Extract durable state items from the following new conversation messages. \
         Reply with a JSON array; each element: {\"type_tag\": decision|constraint|action|\
         question|risk|failure, \"text\": string, \"status\": string, \"confidence\": \
         low|medium|high, \"topic_tags\": [string], \"refs\": [message ids], \
         \"supersedes\": uid or null, \"conflict\": bool}. \
         Reply with [] when nothing qualifies.\n\n",
    );
    for message in messages {
        prompt.push_str(&format!(
            "[{}] {}: {}\n",
            message.id, message.role, message.content
        ));
    }
    prompt
}

/// Extract, validate, merge and persist state items for every message after
/// the thread's extraction watermark.  The watermark always advances past
/// consumed messages, even when every candidate is dropped.
pub async fn extract_state_items(
    db: &Db,
    thread_id: &str,
    model: &dyn ExtractionModel,
) -> Result<ExtractionResult, MemoryError> {
    let store = StateStore;
    let (messages, prompt) = {
        let conn = db.open().map_err(MemoryError::from)?;
        let watermark = store.get_extraction_watermark(&conn, thread_id)?;
        let since = watermark.map(|(stamp, _)| stamp).unwrap_or_default();
        let messages = queries::messages_after(&conn, thread_id, &since)?;
        if messages.is_empty() {
            return Ok(ExtractionResult::skipped("no_new_messages"));
        }
        let prompt = extraction_prompt(&messages);
        (messages, prompt)
    };

    let raw = match model.complete(&prompt).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, thread_id, "state extraction model call failed");
            return Ok(ExtractionResult::skipped("model_error"));
        }
    };

    let incoming = parse_items(&raw).unwrap_or_default();
    let conn = db.open().map_err(MemoryError::from)?;
    let mut result = ExtractionResult::default();

    for raw_item in incoming {
        let mut item = StateItem {
            uid: String::new(),
            text: raw_item.text,
            status: raw_item.status,
            type_tag: raw_item.type_tag,
            topic_tags: raw_item.topic_tags,
            refs: raw_item.refs,
            confidence: if raw_item.confidence.is_empty() {
                "medium".to_string()
            } else {
                raw_item.confidence
            },
            conflict: raw_item.conflict,
            ..StateItem::new(StateItemType::Decision, "")
        };
        let errors = validate_item(&mut item);
        if errors.iter().any(|e| e == "missing text" || e == "missing refs") {
            result.items_dropped += 1;
            continue;
        }
        // Every ref must point at a message in this thread.
        let mut refs_ok = true;
        for reference in &item.refs {
            if !queries::message_exists(&conn, thread_id, reference)? {
                refs_ok = false;
                break;
            }
        }
        if !refs_ok {
            result.items_dropped += 1;
            continue;
        }

        item.last_seen_at = now_iso();
        let merged_uid = merge_or_insert(&conn, &store, thread_id, &mut item, &mut result)?;

        if let Some(old_uid) = raw_item.supersedes.as_deref() {
            if old_uid != merged_uid
                && has_supersession_signal(&item.text)
                && store.get_item(&conn, thread_id, old_uid)?.is_some()
            {
                let evidence = json!({
                    "signal_text": crate::state_items::normalize_text(&item.text),
                    "refs": item.refs,
                });
                store.supersede(&conn, thread_id, old_uid, &merged_uid, &evidence)?;
                result.items_superseded += 1;
            }
        }
    }

    if let Some(last) = messages.last() {
        store.set_extraction_watermark(&conn, thread_id, &last.created_at, &last.id)?;
    }
    Ok(result)
}

/// Merge into an existing row (by uid, then by embedding similarity within
/// the same type) or insert fresh.  Returns the uid the item landed on.
fn merge_or_insert(
    conn: &alfred_store::Connection,
    store: &StateStore,
    thread_id: &str,
    item: &mut StateItem,
    result: &mut ExtractionResult,
) -> Result<String, MemoryError> {
    if let Some(mut existing) = store.get_item(conn, thread_id, &item.uid)? {
        merge_into(&mut existing, item);
        store.upsert_item(conn, thread_id, &existing)?;
        result.items_merged += 1;
        return Ok(existing.uid);
    }

    let vec = embed_text(&item.text);
    let similar = store.search_similar_items(conn, thread_id, &vec, 1, MERGE_SIMILARITY)?;
    if let Some((candidate, _score)) = similar
        .into_iter()
        .find(|(candidate, _)| candidate.type_tag == item.type_tag)
    {
        let mut existing = candidate;
        merge_into(&mut existing, item);
        store.upsert_item(conn, thread_id, &existing)?;
        result.items_merged += 1;
        return Ok(existing.uid);
    }

    store.upsert_item(conn, thread_id, item)?;
    store.upsert_item_embedding(conn, &item.uid, thread_id, &vec)?;
    result.items_new += 1;
    Ok(item.uid.clone())
}

fn merge_into(existing: &mut StateItem, incoming: &StateItem) {
    for reference in &incoming.refs {
        if !existing.refs.contains(reference) {
            existing.refs.push(reference.clone());
        }
    }
    for tag in &incoming.topic_tags {
        if !existing.topic_tags.contains(tag) && existing.topic_tags.len() < 3 {
            existing.topic_tags.push(tag.clone());
        }
    }
    existing.confidence = max_confidence(&existing.confidence, &incoming.confidence);
    existing.status = resolve_status_merge(&existing.type_tag, &existing.status, &incoming.status);
    existing.conflict = existing.conflict || incoming.conflict;
    existing.last_seen_at = incoming.last_seen_at.clone();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
