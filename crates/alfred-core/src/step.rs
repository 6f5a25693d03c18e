// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The per-turn agent step state machine.
//!
//! One call drives: ingress check → command short-circuit → prompt build →
//! state extraction → model call → tool loop → reply.  The step is the only
//! layer that turns errors into user-visible text; transient tool and
//! provider failures flow back into the transcript so the agent can
//! self-correct.

use serde_json::{json, Value};
use tracing::warn;

use alfred_events::{emit, EventInput};
use alfred_memory::{extract_state_items, get_summaries, MemoryService};
use alfred_model::{ChatMessage, Priority, ToolSpec};
use alfred_store::{queries, StoreError};
use alfred_tools::ToolRuntimeError;

use crate::commands::{help_reply, is_known_command, parse_command, status_reply};
use crate::context::{RouterExtractionModel, StepContext};
use crate::notify::{notify, AgentNotification};
use crate::prompt::{build_prompt_with_report, PromptInput};
use crate::strip::strip_control_tokens;

const TAIL_MESSAGES: usize = 20;
const DEFAULT_MAX_TOOL_ROUNDS: u32 = 6;

/// Terminal state of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Replied { message_id: String, text: String },
    Skipped { reason: &'static str },
    Failed { trace_id: String },
}

fn emit_step_event(
    ctx: &StepContext,
    trace_id: &str,
    thread_id: &str,
    actor_id: &str,
    event_type: &str,
    payload: Value,
) -> Result<(), StoreError> {
    let conn = ctx.db.open()?;
    emit(
        &conn,
        EventInput::new(trace_id, event_type, "orchestrator", "agent", actor_id, payload)
            .with_thread(thread_id),
    )?;
    Ok(())
}

/// Append the assistant reply and queue outbound channel dispatch.
fn deliver_reply(
    ctx: &StepContext,
    thread_id: &str,
    text: &str,
) -> Result<String, StoreError> {
    let (message_id, channel_type) = {
        let conn = ctx.db.open()?;
        let message_id = queries::insert_message(&conn, thread_id, "assistant", text)?;
        let channel_type = match queries::thread_owner(&conn, thread_id)? {
            Some((_, channel_id)) => {
                queries::channel_type_of(&conn, &channel_id)?.unwrap_or_else(|| "cli".to_string())
            }
            None => "cli".to_string(),
        };
        (message_id, channel_type)
    };
    ctx.runner.send_task(
        "channel_send",
        json!({
            "thread_id": thread_id,
            "message_id": message_id,
            "channel_type": channel_type,
        }),
        Some("tools_io"),
    );
    Ok(message_id)
}

fn finish_step(
    ctx: &StepContext,
    trace_id: &str,
    thread_id: &str,
    actor_id: &str,
    status: &str,
) -> Result<(), StoreError> {
    emit_step_event(
        ctx,
        trace_id,
        thread_id,
        actor_id,
        "agent.step.end",
        json!({"status": status}),
    )?;
    emit_step_event(
        ctx,
        trace_id,
        thread_id,
        actor_id,
        "agent.done",
        json!({"status": status}),
    )?;
    notify(
        &ctx.notifications,
        AgentNotification::Done {
            thread_id: thread_id.to_string(),
        },
    );
    Ok(())
}

fn tool_specs(ctx: &StepContext) -> Vec<ToolSpec> {
    ctx.runtime
        .registry()
        .schemas()
        .into_iter()
        .map(|schema| ToolSpec {
            name: schema.name,
            description: schema.description,
            parameters: schema.parameters,
        })
        .collect()
}

/// Run one agent step.  Re-entrant: a `(thread_id, trace_id)` that already
/// completed is skipped without side effects.
pub async fn run_agent_step(
    ctx: &StepContext,
    trace_id: &str,
    thread_id: &str,
    actor_id: &str,
) -> anyhow::Result<StepOutcome> {
    // Ingress check and at-most-once guard.
    let latest_user = {
        let conn = ctx.db.open()?;
        queries::ensure_system_state(&conn)?;
        let completed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events \
             WHERE trace_id = ?1 AND thread_id = ?2 AND event_type = 'agent.step.end'",
            (trace_id, thread_id),
            |row| row.get(0),
        )?;
        if completed > 0 {
            return Ok(StepOutcome::Skipped {
                reason: "already_completed",
            });
        }
        let state = queries::get_system_state(&conn)?;
        if state.restarting {
            emit(
                &conn,
                EventInput::new(
                    trace_id,
                    "agent.step.skipped",
                    "orchestrator",
                    "agent",
                    actor_id,
                    json!({"status": "skipped", "reason": "restarting"}),
                )
                .with_thread(thread_id),
            )?;
            return Ok(StepOutcome::Skipped {
                reason: "restarting",
            });
        }
        queries::latest_user_message(&conn, thread_id)?
    };

    notify(
        &ctx.notifications,
        AgentNotification::Thinking {
            thread_id: thread_id.to_string(),
        },
    );

    // Command short-circuit: recognized slash-commands answer directly.
    if let Some(message) = &latest_user {
        if let Some((command, _args)) = parse_command(&message.content) {
            if is_known_command(&command) {
                let reply = match command.as_str() {
                    "/status" => {
                        let state = {
                            let conn = ctx.db.open()?;
                            queries::get_system_state(&conn)?
                        };
                        let health = ctx.router.health().await;
                        status_reply(&state, &health)
                    }
                    _ => help_reply(),
                };
                let message_id = deliver_reply(ctx, thread_id, &reply)?;
                finish_step(ctx, trace_id, thread_id, actor_id, "ok")?;
                return Ok(StepOutcome::Replied {
                    message_id,
                    text: reply,
                });
            }
        }
    }

    // Prompt build.
    let latest_text = latest_user.as_ref().map(|m| m.content.clone()).unwrap_or_default();
    let (system_part, user_part, report) = {
        let conn = ctx.db.open()?;
        let (summary_short, summary_long) = get_summaries(&conn, thread_id)?;
        let memory_chunks = match MemoryService.search(
            &conn,
            thread_id,
            ctx.settings.prompt_max_memory_items,
            (!latest_text.is_empty()).then_some(latest_text.as_str()),
            0.4,
            0.35,
            0.25,
        ) {
            Ok(hits) => hits.into_iter().map(|hit| hit.text).collect(),
            Err(err) => {
                warn!(error = %err, "memory search failed; continuing without context");
                Vec::new()
            }
        };
        let tail = queries::thread_tail(&conn, thread_id, TAIL_MESSAGES)?
            .into_iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect();
        let input = PromptInput {
            system_context: format!(
                "You are {actor_id}, a persistent conversational assistant. \
                 Use tools when they help; answer plainly when they do not."
            ),
            summary_short,
            summary_long,
            memory_chunks,
            tail,
            token_budget: ctx.settings.prompt_token_budget,
            max_memory_items: ctx.settings.prompt_max_memory_items,
            tools: ctx.runtime.registry().schemas(),
        };
        build_prompt_with_report(&input)
    };
    emit_step_event(
        ctx,
        trace_id,
        thread_id,
        actor_id,
        "prompt.build",
        json!({
            "prompt_mode": report.prompt_mode,
            "sections": report.sections.iter().map(|(k, v)| (k.to_string(), json!(v))).collect::<serde_json::Map<_, _>>(),
        }),
    )?;

    // State extraction is best-effort and never blocks the turn.
    let extraction_model = RouterExtractionModel(ctx.router.clone());
    if let Err(err) = extract_state_items(&ctx.db, thread_id, &extraction_model).await {
        warn!(error = %err, "state extraction failed");
    }

    // Model + tool loop.
    let max_rounds = {
        let conn = ctx.db.open()?;
        queries::get_governance(&conn, actor_id)?
            .map(|g| g.max_actions_per_step)
            .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS)
    };
    let priority = if actor_id == "main" {
        Priority::Normal
    } else {
        Priority::Low
    };
    let specs = tool_specs(ctx);
    let mut messages = vec![
        ChatMessage::system(system_part),
        ChatMessage::user(user_part),
    ];
    let mut final_text = String::new();

    for round in 0..=max_rounds {
        emit_step_event(
            ctx,
            trace_id,
            thread_id,
            actor_id,
            "model.run.start",
            json!({"round": round}),
        )?;
        let (response, lane, primary_error) = match ctx
            .router
            .generate(&messages, Some(specs.as_slice()), 0.7, 4096, priority)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                // Hard provider failure: capsule + bounded apology.
                {
                    let conn = ctx.db.open()?;
                    queries::insert_failure_capsule(
                        &conn,
                        trace_id,
                        Some(thread_id),
                        &err.message,
                        "{}",
                    )?;
                }
                let apology = format!(
                    "Sorry, I could not reach a language model just now. \
                     The incident is recorded under trace {trace_id}."
                );
                deliver_reply(ctx, thread_id, &apology)?;
                finish_step(ctx, trace_id, thread_id, actor_id, "failed")?;
                return Ok(StepOutcome::Failed {
                    trace_id: trace_id.to_string(),
                });
            }
        };
        emit_step_event(
            ctx,
            trace_id,
            thread_id,
            actor_id,
            "model.run.end",
            json!({"round": round, "lane": lane}),
        )?;
        if let Some(primary_error) = primary_error {
            emit_step_event(
                ctx,
                trace_id,
                thread_id,
                actor_id,
                "model.fallback",
                json!({"error": primary_error}),
            )?;
            notify(
                &ctx.notifications,
                AgentNotification::Fallback {
                    primary_error: primary_error.clone(),
                },
            );
        }

        if response.tool_calls.is_empty() {
            final_text = response.text;
            break;
        }
        if round == max_rounds {
            // Out of budget: answer with whatever text the model produced.
            final_text = response.text;
            break;
        }

        if !response.text.is_empty() {
            messages.push(ChatMessage::assistant(response.text.as_str()));
        }
        for call in response.tool_calls {
            let outcome = ctx
                .runtime
                .execute(
                    &ctx.db,
                    &call.name,
                    call.arguments,
                    actor_id,
                    trace_id,
                    Some(thread_id),
                )
                .await;
            let feedback = match outcome {
                Ok(result) => {
                    if call.name == "session_send" {
                        if let Some(to) = result.get("to_agent_id").and_then(Value::as_str) {
                            notify(
                                &ctx.notifications,
                                AgentNotification::Delegated {
                                    to_agent_id: to.to_string(),
                                },
                            );
                        }
                    }
                    format!("{} result: {}", call.name, result)
                }
                Err(ToolRuntimeError::Policy { reason }) => {
                    format!("{} was refused: {reason}", call.name)
                }
                Err(ToolRuntimeError::Tool(err)) => {
                    format!("{} failed: {}", call.name, err.message)
                }
                Err(ToolRuntimeError::Store(err)) => {
                    warn!(error = %err, tool = %call.name, "tool runtime store failure");
                    format!("{} failed: internal storage error", call.name)
                }
            };
            messages.push(ChatMessage::tool(feedback));
        }
    }

    // Reply.
    let reply_text = strip_control_tokens(&final_text);
    let message_id = deliver_reply(ctx, thread_id, &reply_text)?;
    finish_step(ctx, trace_id, thread_id, actor_id, "ok")?;
    Ok(StepOutcome::Replied {
        message_id,
        text: reply_text,
    })
}
