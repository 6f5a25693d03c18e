// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use alfred_store::{new_id, now_iso, StoreError};

use crate::embed::{embed_text, vec_to_blob};
use crate::envelope::enforce_action_envelope;
use crate::redact::redact_payload;

/// One event to append.  `span_id` is minted on construction; parent span and
/// thread are attached with the builder methods.
#[derive(Debug, Clone)]
pub struct EventInput {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub thread_id: Option<String>,
    pub event_type: String,
    pub component: String,
    pub actor_type: String,
    pub actor_id: String,
    pub payload: Value,
}

impl EventInput {
    pub fn new(
        trace_id: impl Into<String>,
        event_type: impl Into<String>,
        component: impl Into<String>,
        actor_type: impl Into<String>,
        actor_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: new_id("spn"),
            parent_span_id: None,
            thread_id: None,
            event_type: event_type.into(),
            component: component.into(),
            actor_type: actor_type.into(),
            actor_id: actor_id.into(),
            payload,
        }
    }

    pub fn with_span(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = span_id.into();
        self
    }

    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// A persisted event, as read back from the log.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub thread_id: Option<String>,
    pub event_type: String,
    pub component: String,
    pub actor_type: String,
    pub actor_id: String,
    pub payload: Value,
    pub payload_redacted: Value,
    pub created_at: String,
}

/// Append one event.
///
/// Envelope enforcement and redaction happen here, on the structured payload.
/// When the redacted payload carries a non-empty string under `text`, the
/// event is co-indexed: an `event_text` row, an FTS row, and a vector upsert.
pub fn emit(conn: &Connection, event: EventInput) -> Result<String, StoreError> {
    let event_id = new_id("evt");
    let payload = enforce_action_envelope(&event.event_type, &event.payload);
    let redacted = redact_payload(&payload);
    let created_at = now_iso();

    conn.execute(
        "INSERT INTO events(\
             id, trace_id, span_id, parent_span_id, thread_id, \
             event_type, component, actor_type, actor_id, \
             payload_json, payload_redacted_json, created_at\
         ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        (
            &event_id,
            &event.trace_id,
            &event.span_id,
            &event.parent_span_id,
            &event.thread_id,
            &event.event_type,
            &event.component,
            &event.actor_type,
            &event.actor_id,
            payload.to_string(),
            redacted.to_string(),
            &created_at,
        ),
    )?;

    if let Some(text) = redacted.get("text").and_then(Value::as_str) {
        if !text.is_empty() {
            conn.execute(
                "INSERT OR REPLACE INTO event_text(event_id, thread_id, redacted_text, created_at) \
                 VALUES(?1, ?2, ?3, ?4)",
                (&event_id, &event.thread_id, text, &created_at),
            )?;
            conn.execute(
                "INSERT INTO event_fts(event_id, thread_id, redacted_text) VALUES(?1, ?2, ?3)",
                (&event_id, &event.thread_id, text),
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO event_vec(id, thread_id, vec) VALUES(?1, ?2, ?3)",
                (&event_id, &event.thread_id, vec_to_blob(&embed_text(text))),
            )?;
        }
    }

    Ok(event_id)
}

pub fn fetch_event(conn: &Connection, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, trace_id, span_id, parent_span_id, thread_id, event_type, component, \
                    actor_type, actor_id, payload_json, payload_redacted_json, created_at \
             FROM events WHERE id = ?1",
            [event_id],
            |row| {
                let payload_json: String = row.get(9)?;
                let redacted_json: String = row.get(10)?;
                Ok(StoredEvent {
                    id: row.get(0)?,
                    trace_id: row.get(1)?,
                    span_id: row.get(2)?,
                    parent_span_id: row.get(3)?,
                    thread_id: row.get(4)?,
                    event_type: row.get(5)?,
                    component: row.get(6)?,
                    actor_type: row.get(7)?,
                    actor_id: row.get(8)?,
                    payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
                    payload_redacted: serde_json::from_str(&redacted_json).unwrap_or(Value::Null),
                    created_at: row.get(11)?,
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
    use alfred_store::open_in_memory;
    use serde_json::json;

    #[test]
    fn emit_fetch_round_trip() {
        let conn = open_in_memory().unwrap();
        let input = EventInput::new(
            "trc_rt",
            "channel.outbound",
            "channels.whatsapp",
            "channel",
            "whatsapp",
            json!({"message_id": "msg_1", "status": "sent"}),
        )
        .with_thread("thr_rt");
        let expected = input.clone();
        let event_id = emit(&conn, input).unwrap();
        let stored = fetch_event(&conn, &event_id).unwrap().unwrap();
        assert_eq!(stored.trace_id, expected.trace_id);
        assert_eq!(stored.span_id, expected.span_id);
        assert_eq!(stored.thread_id, expected.thread_id);
        assert_eq!(stored.event_type, expected.event_type);
        assert_eq!(stored.component, expected.component);
        assert_eq!(stored.actor_type, expected.actor_type);
        assert_eq!(stored.actor_id, expected.actor_id);
        assert_eq!(stored.payload, expected.payload);
    }

    #[test]
    fn redacted_payload_masks_sensitive_keys() {
        let conn = open_in_memory().unwrap();
        let event_id = emit(
            &conn,
            EventInput::new(
                "trc_red",
                "channel.outbound",
                "channels.test",
                "channel",
                "test",
                json!({"phone": "+15555550100", "note": "ok"}),
            ),
        )
        .unwrap();
        let stored = fetch_event(&conn, &event_id).unwrap().unwrap();
        assert_eq!(stored.payload_redacted["phone"], "[REDACTED]");
        assert_eq!(stored.payload["phone"], "+15555550100");
    }

    #[test]
    fn envelope_is_enforced_on_write() {
        let conn = open_in_memory().unwrap();
        let event_id = emit(
            &conn,
            EventInput::new(
                "trc_env",
                "tool.call.start",
                "tools.runtime",
                "agent",
                "main",
                json!({"tool": "echo"}),
            ),
        )
        .unwrap();
        let stored = fetch_event(&conn, &event_id).unwrap().unwrap();
        assert_eq!(stored.payload["intent"], "audit:record");
        assert_eq!(stored.payload["tests"]["result"], "pending");
    }

    #[test]
    fn text_payload_is_co_indexed() {
        let conn = open_in_memory().unwrap();
        let event_id = emit(
            &conn,
            EventInput::new(
                "trc_idx",
                "agent.message",
                "orchestrator",
                "agent",
                "main",
                json!({"text": "remember the redis decision"}),
            )
            .with_thread("thr_idx"),
        )
        .unwrap();
        let text_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_text WHERE event_id = ?1",
                [&event_id],
                |r| r.get(0),
            )
            .unwrap();
        let fts_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_fts WHERE event_id = ?1",
                [&event_id],
                |r| r.get(0),
            )
            .unwrap();
        let vec_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM event_vec WHERE id = ?1",
                [&event_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!((text_rows, fts_rows, vec_rows), (1, 1, 1));
    }

    #[test]
    fn textless_payload_is_not_indexed() {
        let conn = open_in_memory().unwrap();
        emit(
            &conn,
            EventInput::new(
                "trc_noidx",
                "schedule.catchup",
                "scheduler",
                "system",
                "scheduler",
                json!({"dispatched_count": 1}),
            ),
        )
        .unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM event_text", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }
}
