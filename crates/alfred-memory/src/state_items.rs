// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Structured state item types and deterministic merge logic.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateItemType {
    Decision,
    Constraint,
    Action,
    Question,
    Risk,
    Failure,
}

impl StateItemType {
    pub fn parse(raw: &str) -> StateItemType {
        match raw.trim().to_ascii_lowercase().as_str() {
            "constraint" => StateItemType::Constraint,
            "action" => StateItemType::Action,
            "question" => StateItemType::Question,
            "risk" => StateItemType::Risk,
            "failure" => StateItemType::Failure,
            _ => StateItemType::Decision,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StateItemType::Decision => "decision",
            StateItemType::Constraint => "constraint",
            StateItemType::Action => "action",
            StateItemType::Question => "question",
            StateItemType::Risk => "risk",
            StateItemType::Failure => "failure",
        }
    }

    fn uid_prefix(&self) -> &'static str {
        match self {
            StateItemType::Decision => "d_",
            StateItemType::Constraint => "c_",
            StateItemType::Action => "a_",
            StateItemType::Question => "q_",
            StateItemType::Risk => "r_",
            StateItemType::Failure => "f_",
        }
    }

    fn is_valid(raw: &str) -> bool {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "decision" | "constraint" | "action" | "question" | "risk" | "failure"
        )
    }
}

const VALID_CONFIDENCE: &[&str] = &["low", "medium", "high"];
const SUPERSESSION_TRIGGERS: &[&str] =
    &["instead", "replaced", "switched", "changed to", "no longer"];
const REPLACEMENT_VERBS: &[&str] = &["use", "choose", "switch", "go with", "adopt"];
const VALID_TIERS: &[&str] = &["working", "episodic", "semantic_longterm", "procedural"];

/// Tier ordering for deterministic tie-breaking: recent short-term tiers win.
pub fn tier_priority(tier: &str) -> u8 {
    match tier {
        "working" => 0,
        "episodic" => 1,
        "semantic_longterm" => 2,
        "procedural" => 3,
        _ => 4,
    }
}

fn status_precedence(type_tag: StateItemType) -> &'static [&'static str] {
    match type_tag {
        StateItemType::Action => &["open", "blocked", "done", "superseded"],
        StateItemType::Question => &["open", "answered", "superseded"],
        StateItemType::Failure => &["open", "resolved", "superseded"],
        StateItemType::Decision | StateItemType::Constraint | StateItemType::Risk => {
            &["active", "superseded"]
        }
    }
}

fn default_status(type_tag: StateItemType) -> &'static str {
    match type_tag {
        StateItemType::Action | StateItemType::Question | StateItemType::Failure => "open",
        _ => "active",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateItem {
    pub uid: String,
    pub text: String,
    pub status: String,
    pub type_tag: String,
    #[serde(default)]
    pub topic_tags: Vec<String>,
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: String,
    #[serde(default)]
    pub replaced_by: Option<String>,
    #[serde(default)]
    pub supersession_evidence: Option<serde_json::Value>,
    #[serde(default)]
    pub conflict: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub last_seen_at: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_importance")]
    pub importance_score: f64,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub conflict_count: u32,
    #[serde(default = "default_agent")]
    pub agent_id: String,
    #[serde(default)]
    pub last_accessed_at: Option<String>,
}

fn default_confidence() -> String {
    "medium".to_string()
}
fn default_source() -> String {
    "extraction".to_string()
}
fn default_tier() -> String {
    "working".to_string()
}
fn default_importance() -> f64 {
    0.5
}
fn default_agent() -> String {
    "main".to_string()
}

impl StateItem {
    pub fn new(type_tag: StateItemType, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            uid: compute_uid(type_tag.as_str(), &text),
            text,
            status: default_status(type_tag).to_string(),
            type_tag: type_tag.as_str().to_string(),
            topic_tags: Vec::new(),
            refs: Vec::new(),
            confidence: default_confidence(),
            replaced_by: None,
            supersession_evidence: None,
            conflict: false,
            pinned: false,
            source: default_source(),
            created_at: String::new(),
            last_seen_at: String::new(),
            tier: default_tier(),
            importance_score: default_importance(),
            access_count: 0,
            conflict_count: 0,
            agent_id: default_agent(),
            last_accessed_at: None,
        }
    }
}

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:[-*+\u{2022}]|\d+[.)])\s+").expect("static regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Canonical text form used for uid computation and dedup: NFC, lowercase,
/// trimmed, leading list bullets removed, surrounding quotes stripped,
/// whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    let normalized: String = text.nfc().collect();
    let normalized = normalized.to_lowercase();
    let normalized = normalized.trim();
    let normalized = bullet_re().replace(normalized, "");
    let normalized = normalized.trim_matches(|c| c == '"' || c == '\'');
    let normalized = whitespace_re().replace_all(normalized, " ");
    normalized.trim().to_string()
}

/// `uid = typePrefix || first12(sha256(type ":" normalize(text)))`.
pub fn compute_uid(type_tag: &str, text: &str) -> String {
    let parsed = StateItemType::parse(type_tag);
    let payload = format!("{}:{}", parsed.as_str(), normalize_text(text));
    let digest = Sha256::digest(payload.as_bytes());
    format!("{}{}", parsed.uid_prefix(), &hex::encode(digest)[..12])
}

pub fn has_supersession_signal(text: &str) -> bool {
    let lowered = normalize_text(text);
    SUPERSESSION_TRIGGERS
        .iter()
        .any(|trigger| lowered.contains(trigger))
}

pub fn has_replacement_verb(text: &str) -> bool {
    let lowered = normalize_text(text);
    REPLACEMENT_VERBS.iter().any(|verb| lowered.contains(verb))
}

/// Pick the further-progressed of two statuses for the given type; unknown
/// statuses lose to known ones.
pub fn resolve_status_merge(type_tag: &str, status_a: &str, status_b: &str) -> String {
    let order = status_precedence(StateItemType::parse(type_tag));
    let rank = |status: &str| {
        let lowered = status.trim().to_lowercase();
        order
            .iter()
            .position(|s| *s == lowered)
            .map(|p| p as i64)
            .unwrap_or(-1)
    };
    if rank(status_a) >= rank(status_b) {
        status_a.trim().to_lowercase()
    } else {
        status_b.trim().to_lowercase()
    }
}

/// Normalize an item in place; returns the list of defects found.  Invalid
/// fields are clamped to safe defaults (with lowered confidence) rather than
/// rejected outright.
pub fn validate_item(item: &mut StateItem) -> Vec<String> {
    let mut errors = Vec::new();
    item.type_tag = item.type_tag.trim().to_lowercase();
    if !StateItemType::is_valid(&item.type_tag) {
        errors.push("invalid type_tag".to_string());
    }
    let parsed_type = StateItemType::parse(&item.type_tag);

    item.text = item.text.trim().to_string();
    if item.text.is_empty() {
        errors.push("missing text".to_string());
    }

    item.refs = item
        .refs
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    if item.refs.is_empty() {
        errors.push("missing refs".to_string());
    }

    let mut tags: Vec<String> = Vec::new();
    for tag in &item.topic_tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
        if tags.len() == 3 {
            break;
        }
    }
    item.topic_tags = tags;

    if !VALID_CONFIDENCE.contains(&item.confidence.as_str()) {
        item.confidence = "low".to_string();
    }

    let allowed = status_precedence(parsed_type);
    if !allowed.contains(&item.status.as_str()) {
        item.status = default_status(parsed_type).to_string();
        item.confidence = "low".to_string();
        errors.push("invalid status".to_string());
    }

    if item.uid.trim().is_empty() {
        item.uid = compute_uid(&item.type_tag, &item.text);
    }
    item.tier = item.tier.trim().to_lowercase();
    if item.tier.is_empty() {
        item.tier = "working".to_string();
    }
    if !VALID_TIERS.contains(&item.tier.as_str()) {
        item.tier = "working".to_string();
        errors.push("invalid tier".to_string());
    }
    item.importance_score = item.importance_score.clamp(0.0, 1.0);
    item.agent_id = item.agent_id.trim().to_string();
    if item.agent_id.is_empty() {
        item.agent_id = "main".to_string();
    }
    errors
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
