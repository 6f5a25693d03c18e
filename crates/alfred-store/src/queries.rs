// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Query helpers over the core tables.
//!
//! Connections are passed in by the caller; helpers that mutate more than one
//! row run inside [`crate::with_tx`].

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::connection::{with_tx, StoreError};
use crate::ids::{new_id, now_iso};

/// The singleton `system_state` row.
#[derive(Debug, Clone, Default)]
pub struct SystemState {
    pub lockdown: bool,
    pub lockdown_reason: String,
    pub restarting: bool,
    pub readyz_fail_streak: u32,
}

/// One stored message.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// Per-agent governance limits; absent for ungoverned principals.
#[derive(Debug, Clone)]
pub struct Governance {
    pub risk_tier: String,
    pub max_actions_per_step: u32,
    pub allowed_paths: Vec<String>,
    pub can_request_privileged_change: bool,
}

/// Outbound payload for the channel dispatcher.
#[derive(Debug, Clone)]
pub struct ChannelOutbound {
    pub recipient: String,
    pub text: String,
}

// ── System state ─────────────────────────────────────────────────────────────

pub fn ensure_system_state(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO system_state(id, updated_at) VALUES('singleton', ?1)",
        [now_iso()],
    )?;
    Ok(())
}

pub fn get_system_state(conn: &Connection) -> Result<SystemState, StoreError> {
    ensure_system_state(conn)?;
    let state = conn.query_row(
        "SELECT lockdown, lockdown_reason, restarting, readyz_fail_streak \
         FROM system_state WHERE id = 'singleton'",
        [],
        |row| {
            Ok(SystemState {
                lockdown: row.get::<_, i64>(0)? != 0,
                lockdown_reason: row.get(1)?,
                restarting: row.get::<_, i64>(2)? != 0,
                readyz_fail_streak: row.get::<_, i64>(3)? as u32,
            })
        },
    )?;
    Ok(state)
}

pub fn set_lockdown(conn: &Connection, on: bool, reason: &str) -> Result<(), StoreError> {
    ensure_system_state(conn)?;
    conn.execute(
        "UPDATE system_state SET lockdown = ?1, lockdown_reason = ?2, updated_at = ?3 \
         WHERE id = 'singleton'",
        (on as i64, reason, now_iso()),
    )?;
    Ok(())
}

pub fn set_restarting(conn: &Connection, on: bool) -> Result<(), StoreError> {
    ensure_system_state(conn)?;
    conn.execute(
        "UPDATE system_state SET restarting = ?1, updated_at = ?2 WHERE id = 'singleton'",
        (on as i64, now_iso()),
    )?;
    Ok(())
}

/// Record a readyz probe result.  Consecutive failures at or past the
/// threshold flip the system into lockdown; a success resets the streak.
/// Returns `true` when this call caused the lockdown transition.
pub fn record_readyz_result(
    conn: &Connection,
    ok: bool,
    threshold: u32,
) -> Result<bool, StoreError> {
    ensure_system_state(conn)?;
    if ok {
        conn.execute(
            "UPDATE system_state SET readyz_fail_streak = 0, updated_at = ?1 \
             WHERE id = 'singleton'",
            [now_iso()],
        )?;
        return Ok(false);
    }
    conn.execute(
        "UPDATE system_state SET readyz_fail_streak = readyz_fail_streak + 1, updated_at = ?1 \
         WHERE id = 'singleton'",
        [now_iso()],
    )?;
    let state = get_system_state(conn)?;
    if !state.lockdown && state.readyz_fail_streak >= threshold.max(1) {
        set_lockdown(conn, true, "readyz_fail_streak")?;
        return Ok(true);
    }
    Ok(false)
}

/// Record an exec-host tool outcome.  A burst of failures at or past the
/// threshold flips the system into lockdown; a success resets the streak.
/// Returns `true` when this call caused the lockdown transition.
pub fn record_exec_host_result(
    conn: &Connection,
    ok: bool,
    threshold: u32,
) -> Result<bool, StoreError> {
    ensure_system_state(conn)?;
    if ok {
        conn.execute(
            "UPDATE system_state SET exec_host_fail_streak = 0, updated_at = ?1 \
             WHERE id = 'singleton'",
            [now_iso()],
        )?;
        return Ok(false);
    }
    conn.execute(
        "UPDATE system_state \
         SET exec_host_fail_streak = exec_host_fail_streak + 1, updated_at = ?1 \
         WHERE id = 'singleton'",
        [now_iso()],
    )?;
    let streak: i64 = conn.query_row(
        "SELECT exec_host_fail_streak FROM system_state WHERE id = 'singleton'",
        [],
        |row| row.get(0),
    )?;
    let state = get_system_state(conn)?;
    if !state.lockdown && streak as u32 >= threshold.max(1) {
        set_lockdown(conn, true, "exec_host_failures")?;
        return Ok(true);
    }
    Ok(false)
}

// ── Users / channels / threads / messages ────────────────────────────────────

pub fn ensure_user(conn: &Connection, external_id: &str) -> Result<String, StoreError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE external_id = ?1",
            [external_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = new_id("usr");
    conn.execute(
        "INSERT INTO users(id, external_id, created_at) VALUES(?1, ?2, ?3)",
        (&id, external_id, now_iso()),
    )?;
    Ok(id)
}

pub fn ensure_channel(
    conn: &Connection,
    user_id: &str,
    channel_type: &str,
) -> Result<String, StoreError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM channels WHERE user_id = ?1 AND channel_type = ?2",
            (user_id, channel_type),
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = new_id("chn");
    conn.execute(
        "INSERT INTO channels(id, user_id, channel_type, created_at) VALUES(?1, ?2, ?3, ?4)",
        (&id, user_id, channel_type, now_iso()),
    )?;
    Ok(id)
}

/// Create a fresh open thread with its mirror `sessions` and
/// `session_participants` rows, all-or-nothing.
pub fn create_thread(
    conn: &Connection,
    user_id: &str,
    channel_id: &str,
) -> Result<String, StoreError> {
    let id = new_id("thr");
    let now = now_iso();
    with_tx(conn, |conn| -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO threads(id, user_id, channel_id, status, created_at, updated_at) \
             VALUES(?1, ?2, ?3, 'open', ?4, ?4)",
            (&id, user_id, channel_id, &now),
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO sessions(id, kind, status, created_at, updated_at) \
             VALUES(?1, 'thread', 'open', ?2, ?2)",
            (&id, &now),
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO session_participants(session_id, actor_type, actor_id, role) \
             VALUES(?1, 'user', ?2, 'user')",
            (&id, user_id),
        )?;
        Ok(())
    })?;
    Ok(id)
}

/// Return the user's single open thread, creating one on the given channel
/// when none exists.  Open threads are channel-agnostic: a user talking over
/// two channels still lands in one conversation.
pub fn ensure_open_thread(
    conn: &Connection,
    user_id: &str,
    channel_id: &str,
) -> Result<String, StoreError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM threads WHERE user_id = ?1 AND status = 'open' \
             ORDER BY created_at LIMIT 1",
            [user_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    create_thread(conn, user_id, channel_id)
}

pub fn insert_message(
    conn: &Connection,
    thread_id: &str,
    role: &str,
    content: &str,
) -> Result<String, StoreError> {
    let id = new_id("msg");
    conn.execute(
        "INSERT INTO messages(id, thread_id, role, content, created_at) VALUES(?1, ?2, ?3, ?4, ?5)",
        (&id, thread_id, role, content, now_iso()),
    )?;
    conn.execute(
        "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
        (now_iso(), thread_id),
    )?;
    Ok(id)
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Last `limit` messages of the thread in insertion order.
pub fn thread_tail(
    conn: &Connection,
    thread_id: &str,
    limit: usize,
) -> Result<Vec<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, thread_id, role, content, created_at FROM ( \
             SELECT id, thread_id, role, content, created_at \
             FROM messages WHERE thread_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT ?2 \
         ) ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map((thread_id, limit as i64), message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn latest_user_message(
    conn: &Connection,
    thread_id: &str,
) -> Result<Option<MessageRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, thread_id, role, content, created_at FROM messages \
             WHERE thread_id = ?1 AND role = 'user' \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            [thread_id],
            message_from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn messages_after(
    conn: &Connection,
    thread_id: &str,
    created_after: &str,
) -> Result<Vec<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, thread_id, role, content, created_at FROM messages \
         WHERE thread_id = ?1 AND created_at > ?2 \
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map((thread_id, created_after), message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn message_exists(
    conn: &Connection,
    thread_id: &str,
    message_id: &str,
) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE thread_id = ?1 AND id = ?2",
        (thread_id, message_id),
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn message_count(conn: &Connection, thread_id: &str) -> Result<u64, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
        [thread_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Owning `(user_id, channel_id)` of a thread.
pub fn thread_owner(
    conn: &Connection,
    thread_id: &str,
) -> Result<Option<(String, String)>, StoreError> {
    let row = conn
        .query_row(
            "SELECT user_id, channel_id FROM threads WHERE id = ?1",
            [thread_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

pub fn channel_type_of(
    conn: &Connection,
    channel_id: &str,
) -> Result<Option<String>, StoreError> {
    let row = conn
        .query_row(
            "SELECT channel_type FROM channels WHERE id = ?1",
            [channel_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row)
}

// ── Principals / permissions / governance ────────────────────────────────────

pub fn ensure_principal(
    conn: &Connection,
    principal_id: &str,
    principal_type: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO principals(id, principal_type, created_at) VALUES(?1, ?2, ?3)",
        (principal_id, principal_type, now_iso()),
    )?;
    Ok(())
}

pub fn grant_permission(
    conn: &Connection,
    principal_id: &str,
    tool_name: &str,
) -> Result<(), StoreError> {
    ensure_principal(conn, principal_id, "agent")?;
    conn.execute(
        "INSERT OR REPLACE INTO tool_permissions(principal_id, tool_name, effect) \
         VALUES(?1, ?2, 'allow')",
        (principal_id, tool_name),
    )?;
    Ok(())
}

/// Explicit allow row for the tool, or the `*` wildcard.
pub fn has_permission(
    conn: &Connection,
    principal_id: &str,
    tool_name: &str,
) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tool_permissions \
         WHERE principal_id = ?1 AND effect = 'allow' AND tool_name IN (?2, '*')",
        (principal_id, tool_name),
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn set_governance(
    conn: &Connection,
    principal_id: &str,
    governance: &Governance,
) -> Result<(), StoreError> {
    let paths = serde_json::to_string(&governance.allowed_paths)
        .unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT OR REPLACE INTO agent_governance(\
             principal_id, risk_tier, max_actions_per_step, allowed_paths_json, \
             can_request_privileged_change, updated_at\
         ) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        (
            principal_id,
            &governance.risk_tier,
            governance.max_actions_per_step as i64,
            paths,
            governance.can_request_privileged_change as i64,
            now_iso(),
        ),
    )?;
    Ok(())
}

pub fn get_governance(
    conn: &Connection,
    principal_id: &str,
) -> Result<Option<Governance>, StoreError> {
    let row = conn
        .query_row(
            "SELECT risk_tier, max_actions_per_step, allowed_paths_json, \
                    can_request_privileged_change \
             FROM agent_governance WHERE principal_id = ?1",
            [principal_id],
            |row| {
                let paths_json: String = row.get(2)?;
                Ok(Governance {
                    risk_tier: row.get(0)?,
                    max_actions_per_step: row.get::<_, i64>(1)?.max(1) as u32,
                    allowed_paths: serde_json::from_str(&paths_json).unwrap_or_default(),
                    can_request_privileged_change: row.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()?;
    Ok(row)
}

// ── Schedules ─────────────────────────────────────────────────────────────────

pub fn insert_schedule(
    conn: &Connection,
    thread_id: Option<&str>,
    cron_expr: &str,
    payload_json: &str,
    max_catchup: Option<u32>,
) -> Result<String, StoreError> {
    let id = new_id("sch");
    conn.execute(
        "INSERT INTO schedules(id, thread_id, cron_expr, payload_json, enabled, max_catchup, \
                               created_at) \
         VALUES(?1, ?2, ?3, ?4, 1, ?5, ?6)",
        (
            &id,
            thread_id,
            cron_expr,
            payload_json,
            max_catchup.map(|v| v as i64),
            now_iso(),
        ),
    )?;
    Ok(id)
}

// ── Approvals ─────────────────────────────────────────────────────────────────

/// Single-use consent for a privileged action; expires after `ttl_minutes`.
pub fn create_approval(
    conn: &Connection,
    action: &str,
    granted_by: &str,
    ttl_minutes: u32,
) -> Result<String, StoreError> {
    let id = new_id("apv");
    let expires = (Utc::now() + Duration::minutes(ttl_minutes as i64))
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    conn.execute(
        "INSERT INTO approvals(id, action, granted_by, consumed, created_at, expires_at) \
         VALUES(?1, ?2, ?3, 0, ?4, ?5)",
        (&id, action, granted_by, now_iso(), expires),
    )?;
    Ok(id)
}

/// Consume the oldest live approval matching `action`.  Returns `false` when
/// none exists; a consumed row never matches again.
pub fn consume_approval(conn: &Connection, action: &str) -> Result<bool, StoreError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM approvals \
             WHERE action = ?1 AND consumed = 0 AND expires_at > ?2 \
             ORDER BY created_at LIMIT 1",
            (action, now_iso()),
            |row| row.get(0),
        )
        .optional()?;
    match id {
        Some(id) => {
            conn.execute("UPDATE approvals SET consumed = 1 WHERE id = ?1", [id])?;
            Ok(true)
        }
        None => Ok(false),
    }
}

// ── Failure capsules ──────────────────────────────────────────────────────────

pub fn insert_failure_capsule(
    conn: &Connection,
    trace_id: &str,
    thread_id: Option<&str>,
    summary: &str,
    detail_json: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO failure_capsules(trace_id, thread_id, summary, detail_json, \
                                                 created_at) \
         VALUES(?1, ?2, ?3, ?4, ?5)",
        (trace_id, thread_id, summary, detail_json, now_iso()),
    )?;
    Ok(())
}

pub fn get_failure_capsule(
    conn: &Connection,
    trace_id: &str,
) -> Result<Option<(String, String)>, StoreError> {
    let row = conn
        .query_row(
            "SELECT summary, detail_json FROM failure_capsules WHERE trace_id = ?1",
            [trace_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

// ── Sessions ──────────────────────────────────────────────────────────────────

pub fn ensure_session(conn: &Connection, session_id: &str, kind: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO sessions(id, kind, status, created_at, updated_at) \
         VALUES(?1, ?2, 'open', ?3, ?3)",
        (session_id, kind, now_iso()),
    )?;
    Ok(())
}

pub fn add_session_participant(
    conn: &Connection,
    session_id: &str,
    actor_type: &str,
    actor_id: &str,
    role: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO session_participants(session_id, actor_type, actor_id, role) \
         VALUES(?1, ?2, ?3, ?4)",
        (session_id, actor_type, actor_id, role),
    )?;
    Ok(())
}

pub fn list_sessions(conn: &Connection, limit: usize) -> Result<Vec<(String, String)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, status FROM sessions ORDER BY updated_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Channel outbound ──────────────────────────────────────────────────────────

/// Resolve the recipient and text for an outbound message, or `None` when the
/// message does not belong to the thread.
pub fn get_channel_outbound(
    conn: &Connection,
    thread_id: &str,
    message_id: &str,
) -> Result<Option<ChannelOutbound>, StoreError> {
    let row = conn
        .query_row(
            "SELECT u.external_id, m.content \
             FROM messages m \
             JOIN threads t ON t.id = m.thread_id \
             JOIN users u ON u.id = t.user_id \
             WHERE m.id = ?1 AND m.thread_id = ?2",
            (message_id, thread_id),
            |row| {
                Ok(ChannelOutbound {
                    recipient: row.get(0)?,
                    text: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::open_in_memory;

    fn seeded() -> (Connection, String, String, String) {
        let conn = open_in_memory().unwrap();
        let user = ensure_user(&conn, "15555550100").unwrap();
        let channel = ensure_channel(&conn, &user, "whatsapp").unwrap();
        let thread = ensure_open_thread(&conn, &user, &channel).unwrap();
        (conn, user, channel, thread)
    }

    #[test]
    fn ensure_user_is_idempotent() {
        let conn = open_in_memory().unwrap();
        let a = ensure_user(&conn, "ext_1").unwrap();
        let b = ensure_user(&conn, "ext_1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn open_thread_is_channel_agnostic() {
        let conn = open_in_memory().unwrap();
        let user = ensure_user(&conn, "ext_2").unwrap();
        let wa = ensure_channel(&conn, &user, "whatsapp").unwrap();
        let tg = ensure_channel(&conn, &user, "telegram").unwrap();
        let t1 = ensure_open_thread(&conn, &user, &wa).unwrap();
        let t2 = ensure_open_thread(&conn, &user, &tg).unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn thread_creation_mirrors_session_rows() {
        let (conn, user, _, thread) = seeded();
        let kind: String = conn
            .query_row("SELECT kind FROM sessions WHERE id = ?1", [&thread], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(kind, "thread");
        let participants: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM session_participants \
                 WHERE session_id = ?1 AND actor_id = ?2",
                (&thread, &user),
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(participants, 1);
    }

    #[test]
    fn tail_is_in_insertion_order() {
        let (conn, _, _, thread) = seeded();
        insert_message(&conn, &thread, "user", "one").unwrap();
        insert_message(&conn, &thread, "assistant", "two").unwrap();
        insert_message(&conn, &thread, "user", "three").unwrap();
        let tail = thread_tail(&conn, &thread, 2).unwrap();
        let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[test]
    fn wildcard_permission_allows_any_tool() {
        let conn = open_in_memory().unwrap();
        grant_permission(&conn, "main", "*").unwrap();
        assert!(has_permission(&conn, "main", "anything").unwrap());
        assert!(!has_permission(&conn, "other", "anything").unwrap());
    }

    #[test]
    fn readyz_streak_flips_lockdown_at_threshold() {
        let conn = open_in_memory().unwrap();
        assert!(!record_readyz_result(&conn, false, 3).unwrap());
        assert!(!record_readyz_result(&conn, false, 3).unwrap());
        assert!(record_readyz_result(&conn, false, 3).unwrap());
        let state = get_system_state(&conn).unwrap();
        assert!(state.lockdown);
        assert_eq!(state.lockdown_reason, "readyz_fail_streak");
    }

    #[test]
    fn readyz_success_resets_streak() {
        let conn = open_in_memory().unwrap();
        record_readyz_result(&conn, false, 3).unwrap();
        record_readyz_result(&conn, true, 3).unwrap();
        assert_eq!(get_system_state(&conn).unwrap().readyz_fail_streak, 0);
    }

    #[test]
    fn exec_host_failure_burst_flips_lockdown() {
        let conn = open_in_memory().unwrap();
        assert!(!record_exec_host_result(&conn, false, 2).unwrap());
        assert!(record_exec_host_result(&conn, false, 2).unwrap());
        assert!(get_system_state(&conn).unwrap().lockdown);
        assert_eq!(
            get_system_state(&conn).unwrap().lockdown_reason,
            "exec_host_failures"
        );
    }

    #[test]
    fn exec_host_success_resets_the_streak() {
        let conn = open_in_memory().unwrap();
        record_exec_host_result(&conn, false, 3).unwrap();
        record_exec_host_result(&conn, true, 3).unwrap();
        record_exec_host_result(&conn, false, 3).unwrap();
        assert!(!get_system_state(&conn).unwrap().lockdown);
    }

    #[test]
    fn approval_is_single_use() {
        let conn = open_in_memory().unwrap();
        create_approval(&conn, "host.exec.sudo", "admin", 15).unwrap();
        assert!(consume_approval(&conn, "host.exec.sudo").unwrap());
        assert!(!consume_approval(&conn, "host.exec.sudo").unwrap());
    }

    #[test]
    fn governance_round_trip() {
        let conn = open_in_memory().unwrap();
        set_governance(
            &conn,
            "coder",
            &Governance {
                risk_tier: "medium".to_string(),
                max_actions_per_step: 6,
                allowed_paths: vec!["/tmp/allowed".to_string()],
                can_request_privileged_change: false,
            },
        )
        .unwrap();
        let g = get_governance(&conn, "coder").unwrap().unwrap();
        assert_eq!(g.risk_tier, "medium");
        assert_eq!(g.max_actions_per_step, 6);
        assert_eq!(g.allowed_paths, vec!["/tmp/allowed"]);
        assert!(get_governance(&conn, "ghost").unwrap().is_none());
    }

    #[test]
    fn outbound_resolves_recipient_and_text() {
        let (conn, _, _, thread) = seeded();
        let msg = insert_message(&conn, &thread, "assistant", "hello there").unwrap();
        let outbound = get_channel_outbound(&conn, &thread, &msg).unwrap().unwrap();
        assert_eq!(outbound.recipient, "15555550100");
        assert_eq!(outbound.text, "hello there");
        assert!(get_channel_outbound(&conn, &thread, "msg_missing")
            .unwrap()
            .is_none());
    }
}
