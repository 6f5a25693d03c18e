// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Due-schedule evaluation and idempotent dispatch claiming.
//!
//! The only durable idempotency mechanism is the unique key on
//! `schedule_dispatches(schedule_id, due_at)`: a tick claims each due slot
//! by inserting that row, and a constraint violation means another tick won
//! the slot.

use chrono::{DateTime, Duration, SecondsFormat, Timelike, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::warn;

use alfred_store::{now_iso, StoreError};

use crate::cron::{cron_matches, parse_interval_seconds};

/// One claimed slot, ready to enqueue.
#[derive(Debug, Clone)]
pub struct DueDispatch {
    pub schedule_id: String,
    pub thread_id: Option<String>,
    pub due_at: String,
    pub payload_json: String,
}

/// Per-schedule accounting for the `schedule.catchup` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleMetric {
    pub schedule_id: String,
    pub dispatched_count: u32,
    pub deferred_count: u32,
}

fn effective_max_catchup(row_value: Option<i64>, default_max_catchup: u32) -> u32 {
    match row_value {
        Some(value) if value > 0 => value as u32,
        _ => default_max_catchup.max(1),
    }
}

fn format_slot(slot: DateTime<Utc>) -> String {
    slot.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_stamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Interval slots strictly inside `(last_run_at, now)`.
///
/// A slot landing exactly on `now` is left for the next tick, so a second
/// evaluation at the same instant never re-dispatches.  First run fires
/// immediately.
fn iter_due_interval(
    last_run_at: Option<DateTime<Utc>>,
    interval_s: u64,
    now: DateTime<Utc>,
    max_catchup: u32,
) -> (Vec<DateTime<Utc>>, u32) {
    let previous = match last_run_at {
        Some(previous) => previous,
        None => return (vec![now], 0),
    };
    let seconds = (now - previous).num_seconds();
    if seconds <= interval_s as i64 {
        return (Vec::new(), 0);
    }
    let total_due = ((seconds - 1) / interval_s as i64) as u32;
    let emit_count = total_due.min(max_catchup);
    let due = (1..=emit_count)
        .map(|idx| previous + Duration::seconds(interval_s as i64 * idx as i64))
        .collect();
    (due, total_due - emit_count)
}

/// Cron slots in `(last_run_at, now]` at minute granularity.
fn iter_due_cron(
    last_run_at: Option<DateTime<Utc>>,
    cron_expr: &str,
    now: DateTime<Utc>,
    max_catchup: u32,
) -> (Vec<DateTime<Utc>>, u32) {
    let current_slot = now
        .with_second(0)
        .and_then(|dt| dt.with_nanosecond(0))
        .unwrap_or(now);
    let matches = |slot: DateTime<Utc>| cron_matches(slot, cron_expr).unwrap_or(false);

    let start = match last_run_at {
        Some(previous) => {
            let truncated = previous
                .with_second(0)
                .and_then(|dt| dt.with_nanosecond(0))
                .unwrap_or(previous);
            truncated + Duration::minutes(1)
        }
        None => {
            if matches(current_slot) {
                return (vec![current_slot], 0);
            }
            return (Vec::new(), 0);
        }
    };

    let mut due = Vec::new();
    let mut total_due = 0u32;
    let mut cursor = start;
    while cursor <= current_slot {
        if matches(cursor) {
            total_due += 1;
            if (due.len() as u32) < max_catchup {
                due.push(cursor);
            }
        }
        cursor += Duration::minutes(1);
    }
    let skipped = total_due - due.len() as u32;
    (due, skipped)
}

/// Evaluate every enabled schedule, claim due slots, and advance
/// `last_run_at` to the latest claimed slot.
pub fn fetch_due_schedules_report(
    conn: &Connection,
    now: Option<DateTime<Utc>>,
    default_max_catchup: u32,
) -> Result<(Vec<DueDispatch>, Vec<ScheduleMetric>), StoreError> {
    let current = now.unwrap_or_else(Utc::now);
    let mut stmt = conn.prepare(
        "SELECT id, thread_id, cron_expr, payload_json, last_run_at, max_catchup \
         FROM schedules WHERE enabled = 1",
    )?;
    let rows: Vec<(String, Option<String>, String, String, Option<String>, Option<i64>)> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut due = Vec::new();
    let mut metrics = Vec::new();
    for (schedule_id, thread_id, cron_expr, payload_json, last_run_at, max_catchup) in rows {
        let max_catchup = effective_max_catchup(max_catchup, default_max_catchup);
        let previous = last_run_at.as_deref().and_then(parse_stamp);
        let (due_slots, deferred_count) = match parse_interval_seconds(&cron_expr) {
            Some(interval_s) => iter_due_interval(previous, interval_s, current, max_catchup),
            None => iter_due_cron(previous, &cron_expr, current, max_catchup),
        };

        let mut dispatched_slots: Vec<DateTime<Utc>> = Vec::new();
        for slot in due_slots {
            let due_stamp = format_slot(slot);
            let insert = conn.execute(
                "INSERT INTO schedule_dispatches(schedule_id, due_at, dispatched_at) \
                 VALUES(?1, ?2, ?3)",
                (&schedule_id, &due_stamp, now_iso()),
            );
            match insert {
                Ok(_) => {}
                // Slot already claimed by another tick.
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            dispatched_slots.push(slot);
            due.push(DueDispatch {
                schedule_id: schedule_id.clone(),
                thread_id: thread_id.clone(),
                due_at: due_stamp,
                payload_json: payload_json.clone(),
            });
        }

        if let Some(last) = dispatched_slots.last() {
            conn.execute(
                "UPDATE schedules SET last_run_at = ?1 WHERE id = ?2",
                (format_slot(*last), &schedule_id),
            )?;
        }
        metrics.push(ScheduleMetric {
            schedule_id,
            dispatched_count: dispatched_slots.len() as u32,
            deferred_count,
        });
    }
    Ok((due, metrics))
}

/// Backlog estimate without claiming anything.
pub fn estimate_schedule_backlog(
    conn: &Connection,
    now: Option<DateTime<Utc>>,
    default_max_catchup: u32,
) -> Result<Value, StoreError> {
    let current = now.unwrap_or_else(Utc::now);
    let mut stmt = conn.prepare(
        "SELECT id, cron_expr, last_run_at, max_catchup FROM schedules WHERE enabled = 1",
    )?;
    let rows: Vec<(String, String, Option<String>, Option<i64>)> = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut total_dispatchable = 0u32;
    let mut total_deferred = 0u32;
    let mut summary = Vec::new();
    for (schedule_id, cron_expr, last_run_at, max_catchup) in rows {
        let max_catchup = effective_max_catchup(max_catchup, default_max_catchup);
        let previous = last_run_at.as_deref().and_then(parse_stamp);
        let (due_slots, deferred) = match parse_interval_seconds(&cron_expr) {
            Some(interval_s) => iter_due_interval(previous, interval_s, current, max_catchup),
            None => iter_due_cron(previous, &cron_expr, current, max_catchup),
        };
        if !due_slots.is_empty() || deferred > 0 {
            warn!(schedule_id, backlog = due_slots.len(), deferred, "schedule backlog");
        }
        total_dispatchable += due_slots.len() as u32;
        total_deferred += deferred;
        summary.push(json!({
            "schedule_id": schedule_id,
            "dispatchable": due_slots.len(),
            "deferred": deferred,
            "max_catchup": max_catchup,
        }));
    }
    Ok(json!({
        "dispatchable_total": total_dispatchable,
        "deferred_total": total_deferred,
        "schedule_count": summary.len(),
        "schedules": summary,
    }))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
