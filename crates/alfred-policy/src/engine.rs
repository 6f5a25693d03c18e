// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deny-by-default decision over `(principal, tool, arguments, system state)`.
//!
//! Rules fire in a fixed order; the first blocker wins:
//! R2 restarting, R1 lockdown, R5 session-tool scoping, R3 unknown tool,
//! R4 permission, R6 risk tier, R7 path allowlist, R8 per-step budget.

use rusqlite::Connection;
use serde_json::Value;

use alfred_store::{queries, StoreError};

/// Tools that remain usable while the system is in lockdown.
pub const SAFE_DURING_LOCKDOWN: &[&str] = &["session_list", "session_history"];

/// Tools reserved for the main agent (R5); `session_send` is the delegation
/// entry point and is deliberately included.
pub const SESSION_TOOLS: &[&str] = &["session_list", "session_history", "session_send"];

/// Intrinsic risk class of a tool, compared against governance `risk_tier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn parse(s: &str) -> RiskTier {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => RiskTier::High,
            "medium" => RiskTier::Medium,
            _ => RiskTier::Low,
        }
    }
}

/// What the engine needs to know about the tool under evaluation.
/// `None` means the tool is not registered at all (R3).
pub type ToolProfile = Option<RiskTier>;

fn argument_path(arguments: Option<&Value>) -> Option<String> {
    let args = arguments?;
    for key in ["path", "cwd"] {
        if let Some(path) = args.get(key).and_then(Value::as_str) {
            return Some(path.to_string());
        }
    }
    None
}

fn allowed_action_count(
    conn: &Connection,
    principal_id: &str,
    trace_id: &str,
) -> Result<u32, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events \
         WHERE event_type = 'policy.decision' AND actor_id = ?1 AND trace_id = ?2 \
           AND json_extract(payload_json, '$.allowed') = 1",
        (principal_id, trace_id),
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// Evaluate the rule chain.  Returns `(allowed, reason)`; an allow carries
/// the literal reason `"allow"`.
///
/// `tool_profile` carries registration + intrinsic risk so R3 and R6 fire in
/// rule order without the engine holding a registry reference.  `trace_id`
/// scopes the R8 action budget to the current step.
pub fn decision(
    conn: &Connection,
    principal_id: &str,
    tool_name: &str,
    arguments: Option<&Value>,
    trace_id: Option<&str>,
    tool_profile: ToolProfile,
) -> Result<(bool, String), StoreError> {
    let state = queries::get_system_state(conn)?;
    if state.restarting {
        return Ok((false, "R2: restarting".to_string()));
    }
    if state.lockdown && !SAFE_DURING_LOCKDOWN.contains(&tool_name) {
        return Ok((false, "R1: lockdown".to_string()));
    }
    if SESSION_TOOLS.contains(&tool_name) && principal_id != "main" {
        return Ok((false, "R5: main-agent-only session tool".to_string()));
    }
    let risk = match tool_profile {
        Some(risk) => risk,
        None => return Ok((false, "R3: unknown tool".to_string())),
    };
    if !queries::has_permission(conn, principal_id, tool_name)? {
        return Ok((false, "R4: permission denied".to_string()));
    }

    if let Some(governance) = queries::get_governance(conn, principal_id)? {
        if risk > RiskTier::parse(&governance.risk_tier) {
            return Ok((false, "R6: governance.risk_tier".to_string()));
        }
        if !governance.allowed_paths.is_empty() {
            if let Some(path) = argument_path(arguments) {
                let inside = governance
                    .allowed_paths
                    .iter()
                    .any(|prefix| path.starts_with(prefix.as_str()));
                if !inside {
                    return Ok((false, "R7: governance.allowed_paths".to_string()));
                }
            }
        }
        if let Some(trace_id) = trace_id {
            if allowed_action_count(conn, principal_id, trace_id)?
                >= governance.max_actions_per_step
            {
                return Ok((false, "R8: governance.max_actions_per_step".to_string()));
            }
        }
    }

    Ok((true, "allow".to_string()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use alfred_events::{emit, EventInput};
    use alfred_store::open_in_memory;
    use serde_json::json;

    fn seed_permission(conn: &Connection, principal: &str, tool: &str) {
        queries::grant_permission(conn, principal, tool).unwrap();
    }

    fn seed_governance(conn: &Connection, principal: &str, risk_tier: &str, paths: &[&str]) {
        queries::set_governance(
            conn,
            principal,
            &queries::Governance {
                risk_tier: risk_tier.to_string(),
                max_actions_per_step: 6,
                allowed_paths: paths.iter().map(|s| s.to_string()).collect(),
                can_request_privileged_change: false,
            },
        )
        .unwrap();
    }

    #[test]
    fn restarting_beats_everything() {
        let conn = open_in_memory().unwrap();
        queries::set_restarting(&conn, true).unwrap();
        queries::set_lockdown(&conn, true, "test").unwrap();
        let (allowed, reason) =
            decision(&conn, "main", "session_list", None, None, Some(RiskTier::Low)).unwrap();
        assert!(!allowed);
        assert_eq!(reason, "R2: restarting");
    }

    #[test]
    fn lockdown_allows_only_the_safe_set() {
        let conn = open_in_memory().unwrap();
        queries::set_lockdown(&conn, true, "test").unwrap();
        seed_permission(&conn, "main", "echo");
        seed_permission(&conn, "main", "session_list");
        let (allowed, reason) =
            decision(&conn, "main", "echo", None, None, Some(RiskTier::Low)).unwrap();
        assert!(!allowed);
        assert_eq!(reason, "R1: lockdown");
        let (allowed, _) =
            decision(&conn, "main", "session_list", None, None, Some(RiskTier::Low)).unwrap();
        assert!(allowed);
    }

    #[test]
    fn session_tools_are_main_only() {
        let conn = open_in_memory().unwrap();
        seed_permission(&conn, "coder", "session_send");
        let (allowed, reason) =
            decision(&conn, "coder", "session_send", None, None, Some(RiskTier::Low)).unwrap();
        assert!(!allowed);
        assert_eq!(reason, "R5: main-agent-only session tool");
    }

    #[test]
    fn lockdown_beats_session_scoping() {
        let conn = open_in_memory().unwrap();
        queries::set_lockdown(&conn, true, "test").unwrap();
        let (_, reason) =
            decision(&conn, "coder", "session_send", None, None, Some(RiskTier::Low)).unwrap();
        assert_eq!(reason, "R1: lockdown");
    }

    #[test]
    fn unknown_tool_is_r3() {
        let conn = open_in_memory().unwrap();
        let (allowed, reason) = decision(&conn, "main", "ghost", None, None, None).unwrap();
        assert!(!allowed);
        assert_eq!(reason, "R3: unknown tool");
    }

    #[test]
    fn missing_permission_is_r4() {
        let conn = open_in_memory().unwrap();
        let (allowed, reason) =
            decision(&conn, "main", "echo", None, None, Some(RiskTier::Low)).unwrap();
        assert!(!allowed);
        assert_eq!(reason, "R4: permission denied");
    }

    #[test]
    fn wildcard_permission_satisfies_r4() {
        let conn = open_in_memory().unwrap();
        seed_permission(&conn, "main", "*");
        let (allowed, reason) =
            decision(&conn, "main", "echo", None, None, Some(RiskTier::Low)).unwrap();
        assert!(allowed);
        assert_eq!(reason, "allow");
    }

    #[test]
    fn risk_tier_cap_is_r6() {
        let conn = open_in_memory().unwrap();
        seed_permission(&conn, "coder", "exec_host");
        seed_governance(&conn, "coder", "low", &["/tmp"]);
        let (allowed, reason) = decision(
            &conn,
            "coder",
            "exec_host",
            Some(&json!({"cwd": "/tmp", "command": "echo ok"})),
            None,
            Some(RiskTier::High),
        )
        .unwrap();
        assert!(!allowed);
        assert_eq!(reason, "R6: governance.risk_tier");
    }

    #[test]
    fn path_outside_allowlist_is_r7() {
        let conn = open_in_memory().unwrap();
        seed_permission(&conn, "coder", "echo");
        seed_governance(&conn, "coder", "medium", &["/tmp/allowed"]);
        let (allowed, reason) = decision(
            &conn,
            "coder",
            "echo",
            Some(&json!({"path": "/tmp/other/file.txt"})),
            None,
            Some(RiskTier::Low),
        )
        .unwrap();
        assert!(!allowed);
        assert_eq!(reason, "R7: governance.allowed_paths");
    }

    #[test]
    fn path_inside_allowlist_is_allowed() {
        let conn = open_in_memory().unwrap();
        seed_permission(&conn, "coder", "echo");
        seed_governance(&conn, "coder", "medium", &["/tmp/allowed"]);
        let (allowed, reason) = decision(
            &conn,
            "coder",
            "echo",
            Some(&json!({"path": "/tmp/allowed/file.txt"})),
            None,
            Some(RiskTier::Low),
        )
        .unwrap();
        assert!(allowed);
        assert_eq!(reason, "allow");
    }

    #[test]
    fn budget_exhaustion_is_r8() {
        let conn = open_in_memory().unwrap();
        seed_permission(&conn, "coder", "echo");
        queries::set_governance(
            &conn,
            "coder",
            &queries::Governance {
                risk_tier: "medium".to_string(),
                max_actions_per_step: 2,
                allowed_paths: vec![],
                can_request_privileged_change: false,
            },
        )
        .unwrap();
        for _ in 0..2 {
            emit(
                &conn,
                EventInput::new(
                    "trc_budget",
                    "policy.decision",
                    "policy",
                    "agent",
                    "coder",
                    json!({"tool": "echo", "allowed": true, "reason": "allow"}),
                ),
            )
            .unwrap();
        }
        let (allowed, reason) = decision(
            &conn,
            "coder",
            "echo",
            None,
            Some("trc_budget"),
            Some(RiskTier::Low),
        )
        .unwrap();
        assert!(!allowed);
        assert_eq!(reason, "R8: governance.max_actions_per_step");
        // A fresh trace has a fresh budget.
        let (allowed, _) = decision(
            &conn,
            "coder",
            "echo",
            None,
            Some("trc_other"),
            Some(RiskTier::Low),
        )
        .unwrap();
        assert!(allowed);
    }

    #[test]
    fn ungoverned_principal_skips_r6_to_r8() {
        let conn = open_in_memory().unwrap();
        seed_permission(&conn, "main", "exec_host");
        let (allowed, _) = decision(
            &conn,
            "main",
            "exec_host",
            Some(&json!({"path": "/anywhere"})),
            Some("trc_x"),
            Some(RiskTier::High),
        )
        .unwrap();
        assert!(allowed);
    }
}
