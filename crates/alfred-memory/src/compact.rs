// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Thread compaction: rolling short/long summaries of conversation history.

use rusqlite::Connection;
use tracing::debug;

use alfred_store::{now_iso, queries, Db, StoreError};

use crate::state_extractor::ExtractionModel;

const SHORT_WINDOW: usize = 5;
const SHORT_CAP: usize = 400;
const LONG_CAP: usize = 2000;

fn clip(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let clipped: String = text.chars().take(cap.saturating_sub(1)).collect();
    format!("{clipped}\u{2026}")
}

/// Current `(short, long)` summaries; empty strings when never compacted.
pub fn get_summaries(conn: &Connection, thread_id: &str) -> Result<(String, String), StoreError> {
    let row = conn
        .query_row(
            "SELECT short, long FROM thread_summaries WHERE thread_id = ?1",
            [thread_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap_or((String::new(), String::new()));
    Ok(row)
}

fn store_summaries(
    conn: &Connection,
    thread_id: &str,
    short: &str,
    long: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO thread_summaries(thread_id, short, long, updated_at) \
         VALUES(?1, ?2, ?3, ?4)",
        (thread_id, short, long, now_iso()),
    )?;
    Ok(())
}

/// Deterministic compaction: `short` digests the last few turns, `long`
/// extends the rolling digest with anything new.  Returns `(short, long)`.
pub fn compact_thread(
    conn: &Connection,
    thread_id: &str,
) -> Result<(String, String), StoreError> {
    let tail = queries::thread_tail(conn, thread_id, SHORT_WINDOW)?;
    let short = clip(
        &tail
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join(" | "),
        SHORT_CAP,
    );

    let (_, previous_long) = get_summaries(conn, thread_id)?;
    let long = if previous_long.is_empty() {
        clip(&short, LONG_CAP)
    } else if previous_long.contains(&short) {
        previous_long
    } else {
        // Keep the newest content; clip from the front when over cap.
        let combined = format!("{previous_long} | {short}");
        let overflow = combined.chars().count().saturating_sub(LONG_CAP);
        if overflow > 0 {
            combined.chars().skip(overflow).collect()
        } else {
            combined
        }
    };

    store_summaries(conn, thread_id, &short, &long)?;
    Ok((short, long))
}

/// LLM-backed long-summary refresh; falls back to the deterministic digest
/// when the model call fails.
pub async fn summarize_thread(
    db: &Db,
    thread_id: &str,
    model: &dyn ExtractionModel,
) -> Result<(String, String), StoreError> {
    let prompt = {
        let conn = db.open()?;
        let tail = queries::thread_tail(&conn, thread_id, 50)?;
        let mut prompt = String::from(
            "Summarize this conversation in at most five sentences, keeping decisions \
             and open questions:\n\n",
        );
        for message in &tail {
            prompt.push_str(&format!("{}: {}\n", message.role, message.content));
        }
        prompt
    };

    let summary = model.complete(&prompt).await.ok();
    let conn = db.open()?;
    let (short, mut long) = compact_thread(&conn, thread_id)?;
    if let Some(summary) = summary.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        long = clip(&summary, LONG_CAP);
        store_summaries(&conn, thread_id, &short, &long)?;
    }
    Ok((short, long))
}

/// Visit every open thread past the message-count watermark and refresh its
/// summaries.  Returns the number of threads compacted.
pub fn periodic_compaction(
    conn: &Connection,
    min_messages: u64,
) -> Result<u32, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT t.id FROM threads t \
         WHERE t.status = 'open' \
           AND (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.id) >= ?1",
    )?;
    let threads: Vec<String> = stmt
        .query_map([min_messages as i64], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut compacted = 0;
    for thread_id in threads {
        compact_thread(conn, &thread_id)?;
        debug!(thread_id, "compacted thread");
        compacted += 1;
    }
    Ok(compacted)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
