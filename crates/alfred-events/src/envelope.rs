// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Action envelope: the `{intent, evidence, plan, diff, tests, result}`
//! payload shape required on sensitive event types so any action is
//! auditable end-to-end.

use serde_json::{json, Map, Value};

const ENVELOPE_EVENT_PREFIXES: &[&str] = &["tool.call.", "agent.step.", "self_update.", "policy."];
const ENVELOPE_EVENT_TYPES: &[&str] = &[
    "evidence.check",
    "prompt.build",
    "model.run.start",
    "model.run.end",
    "model.fallback",
    "failure_capsule.lookup",
];
const EVOLUTION_ITEM_PREFIX: &str = "evolution.item.";

pub fn requires_action_envelope(event_type: &str) -> bool {
    let clean = event_type.trim();
    ENVELOPE_EVENT_TYPES.contains(&clean)
        || ENVELOPE_EVENT_PREFIXES
            .iter()
            .any(|prefix| clean.starts_with(prefix))
}

fn requires_evolution_item_contract(event_type: &str) -> bool {
    event_type.trim().starts_with(EVOLUTION_ITEM_PREFIX)
}

fn as_object(value: Option<&Value>) -> Map<String, Value> {
    value
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn nonempty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn with_action_envelope(payload: &Map<String, Value>) -> Map<String, Value> {
    let mut out = payload.clone();

    if nonempty_str(out.get("intent")).is_none() {
        let status = nonempty_str(out.get("status")).unwrap_or_else(|| "record".to_string());
        out.insert("intent".to_string(), json!(format!("audit:{status}")));
    }
    if !out.get("evidence").is_some_and(Value::is_object) {
        out.insert("evidence".to_string(), json!({}));
    }
    let plan = as_object(out.get("plan"));
    if plan.is_empty() {
        out.insert(
            "plan".to_string(),
            json!({"summary": "auto-generated envelope plan"}),
        );
    }
    if !out.get("diff").is_some_and(Value::is_object) {
        out.insert("diff".to_string(), json!({}));
    }
    let mut tests = as_object(out.get("tests"));
    if nonempty_str(tests.get("result")).is_none() {
        tests.insert("result".to_string(), json!("pending"));
    }
    out.insert("tests".to_string(), Value::Object(tests));
    let mut result = as_object(out.get("result"));
    if nonempty_str(result.get("status")).is_none() {
        let status = nonempty_str(out.get("status")).unwrap_or_else(|| "recorded".to_string());
        result.insert("status".to_string(), json!(status));
    }
    out.insert("result".to_string(), Value::Object(result));
    out
}

fn with_evolution_contract(event_type: &str, payload: &Map<String, Value>) -> Map<String, Value> {
    let mut out = payload.clone();
    let status_hint = event_type
        .trim()
        .strip_prefix(EVOLUTION_ITEM_PREFIX)
        .unwrap_or_default();
    out.insert(
        "item_id".to_string(),
        json!(nonempty_str(out.get("item_id")).unwrap_or_default()),
    );
    out.insert(
        "trace_id".to_string(),
        json!(nonempty_str(out.get("trace_id")).unwrap_or_default()),
    );
    if nonempty_str(out.get("status")).is_none() {
        let status = if status_hint.is_empty() {
            "started"
        } else {
            status_hint
        };
        out.insert("status".to_string(), json!(status));
    }
    let refs: Vec<String> = out
        .get("evidence_refs")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    out.insert("evidence_refs".to_string(), json!(refs));
    out.insert(
        "result".to_string(),
        Value::Object(as_object(out.get("result"))),
    );
    out
}

/// Fill in the mandatory payload shape for the event type, leaving present
/// fields untouched.  Non-envelope types pass through unchanged.
pub fn enforce_action_envelope(event_type: &str, payload: &Value) -> Value {
    let map = as_object(Some(payload));
    if requires_evolution_item_contract(event_type) {
        return Value::Object(with_evolution_contract(event_type, &map));
    }
    if !requires_action_envelope(event_type) {
        return Value::Object(map);
    }
    Value::Object(with_action_envelope(&map))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefixes_and_types_require_envelope() {
        assert!(requires_action_envelope("tool.call.start"));
        assert!(requires_action_envelope("agent.step.end"));
        assert!(requires_action_envelope("policy.decision"));
        assert!(requires_action_envelope("model.fallback"));
        assert!(!requires_action_envelope("channel.outbound"));
        assert!(!requires_action_envelope("schedule.catchup"));
    }

    #[test]
    fn envelope_defaults_are_filled() {
        let out = enforce_action_envelope("tool.call.start", &json!({"tool": "echo"}));
        assert_eq!(out["tool"], "echo");
        assert_eq!(out["intent"], "audit:record");
        assert_eq!(out["tests"]["result"], "pending");
        assert_eq!(out["result"]["status"], "recorded");
        assert!(out["evidence"].is_object());
        assert!(out["diff"].is_object());
        assert_eq!(out["plan"]["summary"], "auto-generated envelope plan");
    }

    #[test]
    fn present_fields_are_preserved() {
        let out = enforce_action_envelope(
            "model.run.end",
            &json!({
                "intent": "reply",
                "tests": {"result": "passed"},
                "result": {"status": "ok"},
                "status": "done",
            }),
        );
        assert_eq!(out["intent"], "reply");
        assert_eq!(out["tests"]["result"], "passed");
        assert_eq!(out["result"]["status"], "ok");
    }

    #[test]
    fn status_seeds_intent_and_result() {
        let out = enforce_action_envelope("agent.step.skipped", &json!({"status": "skipped"}));
        assert_eq!(out["intent"], "audit:skipped");
        assert_eq!(out["result"]["status"], "skipped");
    }

    #[test]
    fn evolution_contract_shape() {
        let out = enforce_action_envelope("evolution.item.completed", &json!({"item_id": "i1"}));
        assert_eq!(out["item_id"], "i1");
        assert_eq!(out["trace_id"], "");
        assert_eq!(out["status"], "completed");
        assert_eq!(out["evidence_refs"], json!([]));
        assert!(out["result"].is_object());
    }

    #[test]
    fn plain_events_pass_through() {
        let payload = json!({"anything": 1});
        assert_eq!(enforce_action_envelope("channel.outbound", &payload), payload);
    }
}
