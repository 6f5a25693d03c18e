// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Event retention: prune old events together with their derived index rows.

use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde_json::json;

use alfred_store::{new_id, with_tx, StoreError};

use crate::writer::{emit, EventInput};

/// Rows removed by one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneSummary {
    pub deleted_events: u64,
    pub deleted_text_rows: u64,
    pub deleted_vec_rows: u64,
}

const BATCH_CAP: usize = 10_000;

/// Delete events older than `retention_days`, along with their `event_text`,
/// FTS and vector rows, in one transaction.  Emits
/// `maintenance.events.pruned` with the counts.
pub fn prune_events(conn: &Connection, retention_days: u32) -> Result<PruneSummary, StoreError> {
    let cutoff = (Utc::now() - Duration::days(retention_days.max(1) as i64))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

    let summary = with_tx(conn, |conn| -> Result<PruneSummary, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id FROM events WHERE created_at < ?1 LIMIT ?2",
        )?;
        let old_ids: Vec<String> = stmt
            .query_map((&cutoff, BATCH_CAP as i64), |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if old_ids.is_empty() {
            return Ok(PruneSummary::default());
        }

        let placeholders = vec!["?"; old_ids.len()].join(",");
        conn.execute(
            &format!("DELETE FROM event_fts WHERE event_id IN ({placeholders})"),
            rusqlite::params_from_iter(old_ids.iter()),
        )?;
        let deleted_text = conn.execute(
            &format!("DELETE FROM event_text WHERE event_id IN ({placeholders})"),
            rusqlite::params_from_iter(old_ids.iter()),
        )?;
        let deleted_vec = conn.execute(
            &format!("DELETE FROM event_vec WHERE id IN ({placeholders})"),
            rusqlite::params_from_iter(old_ids.iter()),
        )?;
        let deleted_events = conn.execute(
            &format!("DELETE FROM events WHERE id IN ({placeholders})"),
            rusqlite::params_from_iter(old_ids.iter()),
        )?;
        Ok(PruneSummary {
            deleted_events: deleted_events as u64,
            deleted_text_rows: deleted_text as u64,
            deleted_vec_rows: deleted_vec as u64,
        })
    })?;

    emit(
        conn,
        EventInput::new(
            new_id("trc"),
            "maintenance.events.pruned",
            "tasks.events",
            "system",
            "maintenance",
            json!({
                "retention_days": retention_days,
                "cutoff": cutoff,
                "deleted_events": summary.deleted_events,
                "deleted_text_rows": summary.deleted_text_rows,
                "deleted_vec_rows": summary.deleted_vec_rows,
            }),
        ),
    )?;
    Ok(summary)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use alfred_store::open_in_memory;

    fn insert_old_event(conn: &Connection, id: &str, created_at: &str, text: Option<&str>) {
        conn.execute(
            "INSERT INTO events(id, trace_id, span_id, parent_span_id, thread_id, event_type, \
                                component, actor_type, actor_id, payload_json, \
                                payload_redacted_json, created_at) \
             VALUES(?1, 'trc_old', 'spn_old', NULL, NULL, 'agent.message', 'test', 'system', \
                    'test', '{}', '{}', ?2)",
            (id, created_at),
        )
        .unwrap();
        if let Some(text) = text {
            conn.execute(
                "INSERT INTO event_text(event_id, thread_id, redacted_text, created_at) \
                 VALUES(?1, NULL, ?2, ?3)",
                (id, text, created_at),
            )
            .unwrap();
            conn.execute(
                "INSERT INTO event_fts(event_id, thread_id, redacted_text) VALUES(?1, NULL, ?2)",
                (id, text),
            )
            .unwrap();
            conn.execute(
                "INSERT INTO event_vec(id, thread_id, vec) VALUES(?1, NULL, x'00000000')",
                [id],
            )
            .unwrap();
        }
    }

    #[test]
    fn prunes_event_and_all_derived_rows() {
        let conn = open_in_memory().unwrap();
        insert_old_event(&conn, "evt_ancient", "2020-01-01T00:00:00Z", Some("old text"));
        let summary = prune_events(&conn, 30).unwrap();
        assert_eq!(summary.deleted_events, 1);
        assert_eq!(summary.deleted_text_rows, 1);
        assert_eq!(summary.deleted_vec_rows, 1);
        for table in ["event_text", "event_vec"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} not pruned");
        }
        let fts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_fts WHERE event_id = 'evt_ancient'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fts, 0);
    }

    #[test]
    fn recent_events_survive() {
        let conn = open_in_memory().unwrap();
        let recent = Utc::now().to_rfc3339();
        insert_old_event(&conn, "evt_recent", &recent, None);
        let summary = prune_events(&conn, 30).unwrap();
        assert_eq!(summary.deleted_events, 0);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE id = 'evt_recent'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn prune_emits_a_maintenance_event() {
        let conn = open_in_memory().unwrap();
        insert_old_event(&conn, "evt_ancient", "2020-01-01T00:00:00Z", None);
        prune_events(&conn, 30).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE event_type = 'maintenance.events.pruned'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
