// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Memory write governance: secret scan, PII redaction, audit trail.

use std::sync::OnceLock;

use regex::Regex;
use rusqlite::Connection;
use serde_json::json;

use alfred_config::{PiiRedactMode, Settings};
use alfred_events::{emit, EventInput};
use alfred_store::{new_id, now_iso, StoreError};

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b").expect("static regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:\+?1[-.\s]?)?(?:\(?\d{3}\)?[-.\s]?)\d{3}[-.\s]?\d{4}\b")
            .expect("static regex")
    })
}

fn secret_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?:sk-[A-Za-z0-9]{16,}|AIza[0-9A-Za-z_-]{20,}|ghp_[A-Za-z0-9]{20,}|gho_[A-Za-z0-9]{20,}|xox[baprs]-[A-Za-z0-9-]{16,})\b",
        )
        .expect("static regex")
    })
}

fn mask_email(text: &str) -> String {
    email_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let value = &caps[0];
            let (local, domain) = value.split_once('@').unwrap_or((value, ""));
            let masked = if local.len() <= 2 {
                "*".repeat(local.len())
            } else {
                format!(
                    "{}***{}",
                    &local[..1],
                    &local[local.len() - 1..]
                )
            };
            format!("{masked}@{domain}")
        })
        .into_owned()
}

fn mask_phone(text: &str) -> String {
    phone_re().replace_all(text, "[REDACTED_PHONE]").into_owned()
}

fn record_decision(
    conn: &Connection,
    thread_id: Option<&str>,
    actor_id: &str,
    target_kind: &str,
    target_id: &str,
    decision: &str,
    reason: &str,
    char_count: usize,
) -> Result<(), StoreError> {
    let payload = json!({
        "char_count": char_count,
        "decision": decision,
        "reason": reason,
    });
    conn.execute(
        "INSERT INTO memory_governance_audit(\
             id, thread_id, actor_id, decision, reason, target_kind, target_id, \
             payload_redacted_json, created_at\
         ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        (
            new_id("evt"),
            thread_id,
            actor_id,
            decision,
            reason,
            target_kind,
            target_id,
            payload.to_string(),
            now_iso(),
        ),
    )?;
    let event_type = match decision {
        "redact" => Some("memory.policy.redaction"),
        "deny" => Some("memory.policy.denial"),
        _ => None,
    };
    if let Some(event_type) = event_type {
        let mut event = EventInput::new(
            new_id("trc"),
            event_type,
            "memory.policy",
            "agent",
            actor_id,
            json!({"reason": reason, "target_kind": target_kind, "target_id": target_id}),
        );
        if let Some(thread_id) = thread_id {
            event = event.with_thread(thread_id);
        }
        emit(conn, event)?;
    }
    Ok(())
}

/// Filter `text` through the memory governance gates.
///
/// Returns `(filtered_text, decision, reason)` where decision is one of
/// `allow`, `redact`, `deny`; a `deny` replaces the whole text with a
/// blocked marker.  Every decision leaves an audit row.
pub fn apply_memory_policy(
    conn: &Connection,
    settings: &Settings,
    text: &str,
    thread_id: Option<&str>,
    actor_id: &str,
    target_kind: &str,
    target_id: &str,
) -> Result<(String, &'static str, &'static str), StoreError> {
    let mut working = text.to_string();
    let mut decision: &'static str = "allow";
    let mut reason: &'static str = "none";

    if settings.memory_secret_scan_enabled && secret_re().is_match(&working) {
        working = secret_re()
            .replace_all(&working, "[REDACTED_SECRET]")
            .into_owned();
        decision = "redact";
        reason = "secret_scan";
    }

    let pii_found = email_re().is_match(&working) || phone_re().is_match(&working);
    if pii_found {
        match settings.memory_pii_redact_mode {
            PiiRedactMode::Deny => {
                working = "[BLOCKED_BY_MEMORY_POLICY]".to_string();
                decision = "deny";
                reason = "pii_detected";
            }
            PiiRedactMode::Mask => {
                working = mask_phone(&mask_email(&working));
                decision = "redact";
                reason = "pii_masked";
            }
            PiiRedactMode::Off => {}
        }
    }

    record_decision(
        conn,
        thread_id,
        actor_id,
        target_kind,
        target_id,
        decision,
        reason,
        working.chars().count(),
    )?;
    Ok((working, decision, reason))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
