// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;

use alfred_events::{emit, EventInput};
use alfred_store::{new_id, now_iso, with_tx, StoreError};
use alfred_tasks::TaskRunner;

use crate::service::{fetch_due_schedules_report, DueDispatch};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: u32,
    pub deferred: u32,
}

fn emit_schedule_error(
    conn: &Connection,
    schedule_id: &str,
    thread_id: Option<&str>,
    reason: &str,
) -> Result<(), StoreError> {
    let mut event = EventInput::new(
        new_id("trc"),
        "schedule.error",
        "scheduler",
        "system",
        "scheduler",
        json!({"schedule_id": schedule_id, "reason": reason}),
    );
    if let Some(thread_id) = thread_id {
        event = event.with_thread(thread_id);
    }
    emit(conn, event)?;
    Ok(())
}

/// Create the isolated thread for one dispatch: thread row plus the mirror
/// `sessions` and `session_participants` rows, all-or-nothing.
fn create_isolated_thread(
    conn: &Connection,
    user_id: &str,
    channel_id: &str,
) -> Result<String, StoreError> {
    let thread_id = new_id("thr");
    let now = now_iso();
    with_tx(conn, |conn| -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO threads(id, user_id, channel_id, status, created_at, updated_at) \
             VALUES(?1, ?2, ?3, 'open', ?4, ?4)",
            (&thread_id, user_id, channel_id, &now),
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO sessions(id, kind, status, created_at, updated_at) \
             VALUES(?1, 'thread', 'open', ?2, ?2)",
            (&thread_id, &now),
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO session_participants(session_id, actor_type, actor_id, role) \
             VALUES(?1, 'user', ?2, 'user')",
            (&thread_id, user_id),
        )?;
        Ok(())
    })?;
    Ok(thread_id)
}

fn dispatch_one(
    conn: &Connection,
    runner: &TaskRunner,
    item: &DueDispatch,
) -> Result<bool, StoreError> {
    let payload: Value = match serde_json::from_str(&item.payload_json) {
        Ok(payload) => payload,
        Err(_) => {
            emit_schedule_error(
                conn,
                &item.schedule_id,
                item.thread_id.as_deref(),
                "malformed_payload",
            )?;
            return Ok(false);
        }
    };

    let owner = match item.thread_id.as_deref() {
        Some(thread_id) => alfred_store::queries::thread_owner(conn, thread_id)?,
        None => None,
    };
    let Some((user_id, channel_id)) = owner else {
        // Without a parent thread there is no execution context to clone.
        emit_schedule_error(
            conn,
            &item.schedule_id,
            item.thread_id.as_deref(),
            "missing_thread",
        )?;
        return Ok(false);
    };

    let schedule_thread_id = create_isolated_thread(conn, &user_id, &channel_id)?;
    let trace_id = payload
        .get("trace_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| new_id("trc"));

    runner.send_task(
        "agent_step",
        json!({
            "trace_id": trace_id,
            "thread_id": schedule_thread_id,
            "actor_id": "main",
        }),
        Some("agent_priority"),
    );
    emit(
        conn,
        EventInput::new(
            trace_id,
            "schedule.trigger",
            "scheduler",
            "system",
            "scheduler",
            json!({"schedule_id": item.schedule_id, "due_at": item.due_at}),
        )
        .with_thread(schedule_thread_id),
    )?;
    Ok(true)
}

/// One scheduler tick: claim due slots, spin up an isolated thread per
/// dispatch, enqueue the agent steps, and report catch-up accounting.
/// Per-schedule failures are recorded and skipped; the tick never aborts.
pub fn scheduler_tick(
    conn: &Connection,
    runner: &TaskRunner,
    now: Option<DateTime<Utc>>,
    default_max_catchup: u32,
) -> Result<TickSummary, StoreError> {
    let (due, metrics) = fetch_due_schedules_report(conn, now, default_max_catchup)?;

    let mut summary = TickSummary::default();
    for item in &due {
        match dispatch_one(conn, runner, item) {
            Ok(true) => summary.dispatched += 1,
            Ok(false) => {}
            Err(err) => {
                warn!(schedule_id = %item.schedule_id, error = %err, "schedule dispatch failed");
                emit_schedule_error(
                    conn,
                    &item.schedule_id,
                    item.thread_id.as_deref(),
                    "dispatch_error",
                )?;
            }
        }
    }

    for metric in &metrics {
        if metric.dispatched_count == 0 && metric.deferred_count == 0 {
            continue;
        }
        summary.deferred += metric.deferred_count;
        emit(
            conn,
            EventInput::new(
                new_id("trc"),
                "schedule.catchup",
                "scheduler",
                "system",
                "scheduler",
                json!({
                    "schedule_id": metric.schedule_id,
                    "dispatched_count": metric.dispatched_count,
                    "deferred_count": metric.deferred_count,
                }),
            ),
        )?;
    }
    Ok(summary)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use alfred_store::{open_in_memory, queries};
    use chrono::{Duration, TimeZone};
    use futures::FutureExt;
    use std::sync::{Arc, Mutex};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn runner_with_sink() -> (Arc<TaskRunner>, Arc<Mutex<Vec<Value>>>) {
        let runner = Arc::new(TaskRunner::new(4));
        let sink = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        runner.register(
            "agent_step",
            Arc::new(move |kwargs: Value| {
                let captured = Arc::clone(&captured);
                async move {
                    captured.lock().unwrap().push(kwargs);
                    Ok(())
                }
                .boxed()
            }),
        );
        (runner, sink)
    }

    fn seed_parent_thread(conn: &Connection) -> String {
        let user = queries::ensure_user(conn, "sched_user").unwrap();
        let channel = queries::ensure_channel(conn, &user, "whatsapp").unwrap();
        queries::ensure_open_thread(conn, &user, &channel).unwrap()
    }

    #[tokio::test]
    async fn tick_dispatches_into_isolated_threads() {
        let conn = open_in_memory().unwrap();
        let parent = seed_parent_thread(&conn);
        queries::insert_schedule(&conn, Some(&parent), "@every:60", "{}", Some(5)).unwrap();
        conn.execute(
            "UPDATE schedules SET last_run_at = ?1",
            [(now() - Duration::seconds(150))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)],
        )
        .unwrap();

        let (runner, sink) = runner_with_sink();
        let summary = scheduler_tick(&conn, &runner, Some(now()), 10).unwrap();
        runner.shutdown(std::time::Duration::from_secs(1)).await;

        assert_eq!(summary.dispatched, 2);
        let steps = sink.lock().unwrap().clone();
        assert_eq!(steps.len(), 2);
        for step in &steps {
            let thread_id = step["thread_id"].as_str().unwrap();
            assert_ne!(thread_id, parent);
            let status: String = conn
                .query_row("SELECT status FROM threads WHERE id = ?1", [thread_id], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(status, "open");
            let mirrored: i64 = conn
                .query_row("SELECT COUNT(*) FROM sessions WHERE id = ?1", [thread_id], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(mirrored, 1);
        }
        let triggers: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE event_type = 'schedule.trigger'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(triggers, 2);
    }

    #[tokio::test]
    async fn tick_is_idempotent_across_runs() {
        let conn = open_in_memory().unwrap();
        let parent = seed_parent_thread(&conn);
        queries::insert_schedule(&conn, Some(&parent), "@every:60", "{}", Some(5)).unwrap();
        conn.execute(
            "UPDATE schedules SET last_run_at = ?1",
            [(now() - Duration::seconds(150))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)],
        )
        .unwrap();

        let (runner, sink) = runner_with_sink();
        scheduler_tick(&conn, &runner, Some(now()), 10).unwrap();
        let second = scheduler_tick(&conn, &runner, Some(now()), 10).unwrap();
        runner.shutdown(std::time::Duration::from_secs(1)).await;

        assert_eq!(second.dispatched, 0);
        assert_eq!(sink.lock().unwrap().len(), 2);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schedule_dispatches", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn malformed_payload_emits_error_and_continues() {
        let conn = open_in_memory().unwrap();
        let parent = seed_parent_thread(&conn);
        queries::insert_schedule(&conn, Some(&parent), "@every:60", "not json", Some(5)).unwrap();
        queries::insert_schedule(&conn, Some(&parent), "@every:60", "{}", Some(5)).unwrap();
        conn.execute(
            "UPDATE schedules SET last_run_at = ?1",
            [(now() - Duration::seconds(90))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)],
        )
        .unwrap();

        let (runner, _sink) = runner_with_sink();
        let summary = scheduler_tick(&conn, &runner, Some(now()), 10).unwrap();
        runner.shutdown(std::time::Duration::from_secs(1)).await;

        assert_eq!(summary.dispatched, 1);
        let errors: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE event_type = 'schedule.error'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn missing_parent_thread_emits_error() {
        let conn = open_in_memory().unwrap();
        queries::insert_schedule(&conn, Some("thr_gone"), "@every:60", "{}", Some(5)).unwrap();
        conn.execute(
            "UPDATE schedules SET last_run_at = ?1",
            [(now() - Duration::seconds(90))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)],
        )
        .unwrap();

        let (runner, sink) = runner_with_sink();
        let summary = scheduler_tick(&conn, &runner, Some(now()), 10).unwrap();
        runner.shutdown(std::time::Duration::from_secs(1)).await;

        assert_eq!(summary.dispatched, 0);
        assert!(sink.lock().unwrap().is_empty());
        let payload: String = conn
            .query_row(
                "SELECT payload_json FROM events WHERE event_type = 'schedule.error'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(payload.contains("missing_thread"));
    }

    #[tokio::test]
    async fn catchup_events_carry_counts() {
        let conn = open_in_memory().unwrap();
        let parent = seed_parent_thread(&conn);
        queries::insert_schedule(&conn, Some(&parent), "@every:60", "{}", Some(1)).unwrap();
        conn.execute(
            "UPDATE schedules SET last_run_at = ?1",
            [(now() - Duration::seconds(600))
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)],
        )
        .unwrap();

        let (runner, _sink) = runner_with_sink();
        let summary = scheduler_tick(&conn, &runner, Some(now()), 10).unwrap();
        runner.shutdown(std::time::Duration::from_secs(1)).await;

        assert_eq!(summary.dispatched, 1);
        assert!(summary.deferred > 0);
        let payload: String = conn
            .query_row(
                "SELECT payload_json FROM events WHERE event_type = 'schedule.catchup'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(payload.contains("\"dispatched_count\":1"));
    }
}
