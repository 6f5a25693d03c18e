// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tracing::warn;

use alfred_events::{emit, EventInput};
use alfred_store::{new_id, queries, Db, StoreError};

use crate::registry::ChannelRegistry;

/// Base backoff schedule; each attempt adds uniform [0,1) seconds of jitter.
const BASE_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(8),
    Duration::from_secs(32),
];

/// HTTP statuses worth another attempt.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { attempts: u32 },
    Skipped,
    Blocked,
    Failed,
}

fn emit_channel_event(
    db: &Db,
    trace_id: &str,
    thread_id: &str,
    channel_type: &str,
    event_type: &str,
    payload: Value,
) -> Result<(), StoreError> {
    let conn = db.open()?;
    emit(
        &conn,
        EventInput::new(
            trace_id,
            event_type,
            format!("channels.{channel_type}"),
            "channel",
            channel_type,
            payload,
        )
        .with_thread(thread_id),
    )?;
    Ok(())
}

/// Deliver one outbound message through its channel adapter.
///
/// Never fails the surrounding task: every terminal state is reported
/// through the event log and the returned outcome.
pub async fn send_channel_message(
    db: &Db,
    registry: &ChannelRegistry,
    thread_id: &str,
    message_id: &str,
    channel_type: &str,
) -> DispatchOutcome {
    send_with_delays(db, registry, thread_id, message_id, channel_type, &BASE_DELAYS).await
}

async fn send_with_delays(
    db: &Db,
    registry: &ChannelRegistry,
    thread_id: &str,
    message_id: &str,
    channel_type: &str,
    delays: &[Duration],
) -> DispatchOutcome {
    let Some(adapter) = registry.get(channel_type) else {
        // The CLI loops output locally; anything else missing is a problem.
        if channel_type != "cli" {
            warn!(channel_type, "no adapter registered for channel");
        }
        return DispatchOutcome::Skipped;
    };

    let trace_id = new_id("trc");
    let outbound = {
        let conn = match db.open() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "channel dispatch could not open the store");
                return DispatchOutcome::Failed;
            }
        };
        match queries::get_system_state(&conn) {
            Ok(state) if state.lockdown => {
                drop(conn);
                let _ = emit_channel_event(
                    db,
                    &trace_id,
                    thread_id,
                    channel_type,
                    "channel.outbound.blocked",
                    json!({"message_id": message_id, "reason": "lockdown"}),
                );
                return DispatchOutcome::Blocked;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "channel dispatch could not read system state");
                return DispatchOutcome::Failed;
            }
        }
        match queries::get_channel_outbound(&conn, thread_id, message_id) {
            Ok(Some(outbound)) => outbound,
            Ok(None) => return DispatchOutcome::Skipped,
            Err(err) => {
                warn!(error = %err, "channel dispatch could not resolve the message");
                return DispatchOutcome::Failed;
            }
        }
    };

    let _ = emit_channel_event(
        db,
        &trace_id,
        thread_id,
        channel_type,
        "channel.outbound",
        json!({"message_id": message_id, "status": "start"}),
    );

    let mut attempts = 0u32;
    for (idx, delay) in delays.iter().enumerate() {
        attempts += 1;
        let last_attempt = idx + 1 == delays.len();
        let failure_reason = match adapter.send_text(&outbound.recipient, &outbound.text).await {
            Ok(status) if RETRYABLE_STATUSES.contains(&status) => format!("http {status}"),
            Ok(status) if status >= 400 => {
                // Non-retryable client error: dead-letter immediately.
                let _ = emit_channel_event(
                    db,
                    &trace_id,
                    thread_id,
                    channel_type,
                    "task.dead_letter",
                    json!({
                        "message_id": message_id,
                        "reason": format!("http {status}"),
                        "attempts": attempts,
                    }),
                );
                return DispatchOutcome::Failed;
            }
            Ok(_) => {
                let _ = emit_channel_event(
                    db,
                    &trace_id,
                    thread_id,
                    channel_type,
                    "channel.outbound",
                    json!({"message_id": message_id, "status": "sent", "attempts": attempts}),
                );
                if adapter.supports_presence() {
                    if let Err(err) = adapter.send_presence(&outbound.recipient, "paused").await {
                        warn!(error = %err, "presence update failed");
                    }
                }
                return DispatchOutcome::Sent { attempts };
            }
            Err(err) => err.message,
        };

        if last_attempt {
            let _ = emit_channel_event(
                db,
                &trace_id,
                thread_id,
                channel_type,
                "task.dead_letter",
                json!({
                    "message_id": message_id,
                    "reason": failure_reason,
                    "attempts": attempts,
                }),
            );
            return DispatchOutcome::Failed;
        }
        let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0));
        tokio::time::sleep(*delay + jitter).await;
    }
    DispatchOutcome::Failed
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
