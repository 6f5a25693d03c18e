// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Core task registrations: the named handlers the runner dispatches.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use alfred_channels::send_channel_message;
use alfred_events::prune_events;
use alfred_memory::periodic_compaction;
use alfred_scheduler::scheduler_tick;
use alfred_store::new_id;

use crate::context::StepContext;
use crate::step::run_agent_step;

const COMPACTION_MIN_MESSAGES: u64 = 40;

fn kwarg<'a>(kwargs: &'a Value, key: &str) -> Option<&'a str> {
    kwargs.get(key).and_then(Value::as_str)
}

/// Register the core task handlers on the runner:
/// `agent_step`, `channel_send`, `scheduler_tick`, `event_maintenance`,
/// `periodic_compaction`.
pub fn register_core_tasks(ctx: Arc<StepContext>) {
    let step_ctx = Arc::clone(&ctx);
    ctx.runner.register(
        "agent_step",
        Arc::new(move |kwargs: Value| {
            let ctx = Arc::clone(&step_ctx);
            async move {
                let trace_id = kwarg(&kwargs, "trace_id")
                    .map(str::to_string)
                    .unwrap_or_else(|| new_id("trc"));
                let Some(thread_id) = kwarg(&kwargs, "thread_id").map(str::to_string) else {
                    anyhow::bail!("agent_step requires thread_id");
                };
                let actor_id = kwarg(&kwargs, "actor_id").unwrap_or("main").to_string();
                run_agent_step(&ctx, &trace_id, &thread_id, &actor_id).await?;
                Ok(())
            }
            .boxed()
        }),
    );

    let channel_ctx = Arc::clone(&ctx);
    ctx.runner.register(
        "channel_send",
        Arc::new(move |kwargs: Value| {
            let ctx = Arc::clone(&channel_ctx);
            async move {
                let (Some(thread_id), Some(message_id), Some(channel_type)) = (
                    kwarg(&kwargs, "thread_id").map(str::to_string),
                    kwarg(&kwargs, "message_id").map(str::to_string),
                    kwarg(&kwargs, "channel_type").map(str::to_string),
                ) else {
                    anyhow::bail!("channel_send requires thread_id, message_id, channel_type");
                };
                send_channel_message(&ctx.db, &ctx.channels, &thread_id, &message_id, &channel_type)
                    .await;
                Ok(())
            }
            .boxed()
        }),
    );

    let tick_ctx = Arc::clone(&ctx);
    ctx.runner.register(
        "scheduler_tick",
        Arc::new(move |_kwargs: Value| {
            let ctx = Arc::clone(&tick_ctx);
            async move {
                let conn = ctx.db.open()?;
                let summary = scheduler_tick(
                    &conn,
                    &ctx.runner,
                    None,
                    ctx.settings.scheduler_max_catchup,
                )?;
                if summary.deferred > 0 {
                    warn!(deferred = summary.deferred, "schedule backlog deferred");
                }
                Ok(())
            }
            .boxed()
        }),
    );

    let maintenance_ctx = Arc::clone(&ctx);
    ctx.runner.register(
        "event_maintenance",
        Arc::new(move |_kwargs: Value| {
            let ctx = Arc::clone(&maintenance_ctx);
            async move {
                let conn = ctx.db.open()?;
                prune_events(&conn, ctx.settings.event_retention_days)?;
                Ok(())
            }
            .boxed()
        }),
    );

    let compaction_ctx = Arc::clone(&ctx);
    ctx.runner.register(
        "periodic_compaction",
        Arc::new(move |_kwargs: Value| {
            let ctx = Arc::clone(&compaction_ctx);
            async move {
                let conn = ctx.db.open()?;
                periodic_compaction(&conn, COMPACTION_MIN_MESSAGES)?;
                Ok(())
            }
            .boxed()
        }),
    );
}
