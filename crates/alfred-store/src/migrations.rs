// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::Connection;
use tracing::info;

use crate::connection::StoreError;
use crate::ids::now_iso;

/// Append-forward migration list.  New migrations are appended, never edited;
/// applied names are recorded in `schema_migrations`.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_core.sql", MIGRATION_0001_CORE),
    ("0002_memory.sql", MIGRATION_0002_MEMORY),
    ("0003_knowledge.sql", MIGRATION_0003_KNOWLEDGE),
    ("0004_exec_host_streak.sql", MIGRATION_0004_EXEC_HOST),
];

const MIGRATION_0001_CORE: &str = r#"
CREATE TABLE IF NOT EXISTS system_state (
    id TEXT PRIMARY KEY CHECK (id = 'singleton'),
    lockdown INTEGER NOT NULL DEFAULT 0,
    lockdown_reason TEXT NOT NULL DEFAULT '',
    restarting INTEGER NOT NULL DEFAULT 0,
    readyz_fail_streak INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    channel_type TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, channel_type)
);

CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id),
    channel_id TEXT NOT NULL REFERENCES channels(id),
    status TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_threads_user ON threads(user_id, status);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    media_json TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, created_at);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    span_id TEXT NOT NULL,
    parent_span_id TEXT,
    thread_id TEXT,
    event_type TEXT NOT NULL,
    component TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    payload_redacted_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_trace ON events(trace_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, created_at);

CREATE TABLE IF NOT EXISTS event_text (
    event_id TEXT PRIMARY KEY,
    thread_id TEXT,
    redacted_text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS event_fts USING fts5(
    event_id UNINDEXED,
    thread_id UNINDEXED,
    redacted_text
);

CREATE TABLE IF NOT EXISTS event_vec (
    id TEXT PRIMARY KEY,
    thread_id TEXT,
    vec BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS principals (
    id TEXT PRIMARY KEY,
    principal_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tool_permissions (
    principal_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    effect TEXT NOT NULL,
    PRIMARY KEY (principal_id, tool_name)
);

CREATE TABLE IF NOT EXISTS agent_governance (
    principal_id TEXT PRIMARY KEY,
    risk_tier TEXT NOT NULL,
    max_actions_per_step INTEGER NOT NULL,
    allowed_paths_json TEXT NOT NULL DEFAULT '[]',
    can_request_privileged_change INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    thread_id TEXT,
    cron_expr TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    max_catchup INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedule_dispatches (
    schedule_id TEXT NOT NULL,
    due_at TEXT NOT NULL,
    dispatched_at TEXT NOT NULL,
    PRIMARY KEY (schedule_id, due_at)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_participants (
    session_id TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    role TEXT NOT NULL,
    PRIMARY KEY (session_id, actor_type, actor_id)
);

CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    action TEXT NOT NULL,
    granted_by TEXT NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS failure_capsules (
    trace_id TEXT PRIMARY KEY,
    thread_id TEXT,
    summary TEXT NOT NULL,
    detail_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
"#;

const MIGRATION_0002_MEMORY: &str = r#"
CREATE TABLE IF NOT EXISTS memory_items (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    text TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_thread ON memory_items(thread_id, last_seen_at);

CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
    memory_id UNINDEXED,
    thread_id UNINDEXED,
    text
);

CREATE TABLE IF NOT EXISTS memory_vecs (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    vec BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS state_items (
    uid TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    text TEXT NOT NULL,
    status TEXT NOT NULL,
    type_tag TEXT NOT NULL,
    topic_tags_json TEXT NOT NULL DEFAULT '[]',
    refs_json TEXT NOT NULL DEFAULT '[]',
    confidence TEXT NOT NULL DEFAULT 'medium',
    replaced_by TEXT,
    supersession_evidence TEXT,
    conflict INTEGER NOT NULL DEFAULT 0,
    pinned INTEGER NOT NULL DEFAULT 0,
    source TEXT NOT NULL DEFAULT 'extraction',
    created_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    tier TEXT NOT NULL DEFAULT 'working',
    importance_score REAL NOT NULL DEFAULT 0.5,
    access_count INTEGER NOT NULL DEFAULT 0,
    conflict_count INTEGER NOT NULL DEFAULT 0,
    agent_id TEXT NOT NULL DEFAULT 'main',
    last_accessed_at TEXT,
    PRIMARY KEY (thread_id, uid)
);

CREATE TABLE IF NOT EXISTS state_item_vecs (
    uid TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    vec BLOB NOT NULL,
    PRIMARY KEY (thread_id, uid)
);

CREATE TABLE IF NOT EXISTS state_extraction_watermarks (
    thread_id TEXT PRIMARY KEY,
    last_created_at TEXT NOT NULL,
    last_message_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS thread_summaries (
    thread_id TEXT PRIMARY KEY,
    short TEXT NOT NULL DEFAULT '',
    long TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL
);
"#;

const MIGRATION_0003_KNOWLEDGE: &str = r#"
CREATE TABLE IF NOT EXISTS knowledge_docs (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,
    tags_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_docs_fts USING fts5(
    doc_id UNINDEXED,
    title,
    content,
    tags
);

CREATE TABLE IF NOT EXISTS memory_governance_audit (
    id TEXT PRIMARY KEY,
    thread_id TEXT,
    actor_id TEXT NOT NULL,
    decision TEXT NOT NULL,
    reason TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_id TEXT NOT NULL DEFAULT '',
    payload_redacted_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

const MIGRATION_0004_EXEC_HOST: &str = r#"
ALTER TABLE system_state ADD COLUMN exec_host_fail_streak INTEGER NOT NULL DEFAULT 0;
"#;

fn lock_holder() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Apply all pending migrations under the singleton lock row.
///
/// The lock row is keyed `host:pid`; a concurrent attempt from a different
/// holder fails fast instead of interleaving DDL.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let holder = lock_holder();
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations(
                 name TEXT PRIMARY KEY,
                 applied_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS schema_migration_lock(
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 holder TEXT,
                 acquired_at TEXT
             );",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migration_lock(id, holder, acquired_at) \
             VALUES(1, NULL, NULL)",
            [],
        )?;
        let current: Option<String> = conn.query_row(
            "SELECT holder FROM schema_migration_lock WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        if let Some(current) = current.filter(|h| !h.is_empty() && *h != holder) {
            return Err(StoreError::MigrationLocked { holder: current });
        }
        conn.execute(
            "UPDATE schema_migration_lock SET holder = ?1, acquired_at = ?2 WHERE id = 1",
            (&holder, now_iso()),
        )?;

        for (name, script) in MIGRATIONS {
            let applied: i64 = conn.query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE name = ?1",
                [name],
                |row| row.get(0),
            )?;
            if applied > 0 {
                continue;
            }
            info!(migration = name, "applying migration");
            conn.execute_batch(script)?;
            conn.execute(
                "INSERT INTO schema_migrations(name, applied_at) VALUES(?1, ?2)",
                (name, now_iso()),
            )?;
        }

        conn.execute(
            "UPDATE schema_migration_lock SET holder = NULL, acquired_at = NULL WHERE id = 1",
            [],
        )?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
