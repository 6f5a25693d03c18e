// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session tools.  All three are main-agent-only (policy rule R5);
//! `session_send` is the delegation entry point.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use alfred_events::{emit, EventInput};
use alfred_store::{new_id, queries};
use alfred_tasks::TaskRunner;

use crate::tool::{Tool, ToolContext, ToolError};

pub struct SessionListTool;

#[async_trait]
impl Tool for SessionListTool {
    fn name(&self) -> &str {
        "session_list"
    }

    fn description(&self) -> &str {
        "List known sessions, most recently active first"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Maximum sessions to return" }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
        let conn = ctx.db.open().map_err(ToolError::from)?;
        let sessions = queries::list_sessions(&conn, limit.clamp(1, 100))?;
        Ok(json!({
            "sessions": sessions
                .into_iter()
                .map(|(id, status)| json!({"id": id, "status": status}))
                .collect::<Vec<_>>()
        }))
    }
}

pub struct SessionHistoryTool;

#[async_trait]
impl Tool for SessionHistoryTool {
    fn name(&self) -> &str {
        "session_history"
    }

    fn description(&self) -> &str {
        "Read the recent message history of a session"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        let session_id = args
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("session_id is required"))?;
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
        let conn = ctx.db.open().map_err(ToolError::from)?;
        let messages = queries::thread_tail(&conn, session_id, limit.clamp(1, 100))?;
        Ok(json!({
            "messages": messages
                .into_iter()
                .map(|m| json!({
                    "id": m.id,
                    "role": m.role,
                    "content": m.content,
                    "created_at": m.created_at,
                }))
                .collect::<Vec<_>>()
        }))
    }
}

/// Delegate to another agent: routes a message into the thread, mirrors the
/// delegation session, and queues a worker step for the target agent.
pub struct SessionSendTool {
    runner: Arc<TaskRunner>,
}

impl SessionSendTool {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for SessionSendTool {
    fn name(&self) -> &str {
        "session_send"
    }

    fn description(&self) -> &str {
        "Send a message to another agent and queue a worker step for it"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to_agent_id": { "type": "string" },
                "message": { "type": "string" }
            },
            "required": ["to_agent_id", "message"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        let to_agent_id = args
            .get("to_agent_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::new("to_agent_id is required"))?;
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ToolError::new("message is required"))?;
        let thread_id = ctx
            .thread_id
            .as_deref()
            .ok_or_else(|| ToolError::new("session_send requires a thread context"))?;

        let session_id = format!("{thread_id}::{to_agent_id}");
        let worker_trace = new_id("trc");
        {
            let conn = ctx.db.open().map_err(ToolError::from)?;
            queries::ensure_session(&conn, &session_id, "delegation")?;
            queries::add_session_participant(&conn, &session_id, "agent", &ctx.caller_id, "delegator")?;
            queries::add_session_participant(&conn, &session_id, "agent", to_agent_id, "worker")?;
            queries::insert_message(&conn, thread_id, "agent", message)?;
            emit(
                &conn,
                EventInput::new(
                    ctx.trace_id.clone(),
                    "agent.delegate",
                    "orchestrator",
                    "agent",
                    ctx.caller_id.clone(),
                    json!({
                        "to_agent_id": to_agent_id,
                        "session_id": session_id,
                        "worker_trace_id": worker_trace,
                    }),
                )
                .with_thread(thread_id),
            )?;
            emit(
                &conn,
                EventInput::new(
                    ctx.trace_id.clone(),
                    "agent.message",
                    "orchestrator",
                    "agent",
                    ctx.caller_id.clone(),
                    json!({"text": message, "to_agent_id": to_agent_id}),
                )
                .with_thread(thread_id),
            )?;
        }

        let queued = self.runner.send_task(
            "agent_step",
            json!({
                "trace_id": worker_trace,
                "thread_id": thread_id,
                "actor_id": to_agent_id,
            }),
            Some("agent_priority"),
        );
        debug!(to_agent_id, queued, "delegation dispatched");
        Ok(json!({
            "status": "delegated",
            "to_agent_id": to_agent_id,
            "session_id": session_id,
            "queued": queued,
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use alfred_store::Db;

    fn ctx_with_thread(db: &Db) -> (ToolContext, String) {
        let conn = db.open().unwrap();
        let user = queries::ensure_user(&conn, "user_1").unwrap();
        let channel = queries::ensure_channel(&conn, &user, "cli").unwrap();
        let thread = queries::ensure_open_thread(&conn, &user, &channel).unwrap();
        (
            ToolContext {
                db: db.clone(),
                caller_id: "main".to_string(),
                trace_id: "trc_sess".to_string(),
                thread_id: Some(thread.clone()),
            },
            thread,
        )
    }

    #[tokio::test]
    async fn list_returns_sessions() {
        let db = Db::in_memory().unwrap();
        let (ctx, thread) = ctx_with_thread(&db);
        let out = SessionListTool.execute(&ctx, &json!({})).await.unwrap();
        let sessions = out["sessions"].as_array().unwrap();
        assert!(sessions.iter().any(|s| s["id"] == json!(thread)));
    }

    #[tokio::test]
    async fn history_reads_thread_messages() {
        let db = Db::in_memory().unwrap();
        let (ctx, thread) = ctx_with_thread(&db);
        {
            let conn = db.open().unwrap();
            queries::insert_message(&conn, &thread, "user", "hello there").unwrap();
        }
        let out = SessionHistoryTool
            .execute(&ctx, &json!({"session_id": thread}))
            .await
            .unwrap();
        assert_eq!(out["messages"][0]["content"], "hello there");
    }

    #[tokio::test]
    async fn history_requires_session_id() {
        let db = Db::in_memory().unwrap();
        let (ctx, _) = ctx_with_thread(&db);
        assert!(SessionHistoryTool.execute(&ctx, &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn send_routes_message_and_queues_worker_step() {
        let db = Db::in_memory().unwrap();
        let (ctx, thread) = ctx_with_thread(&db);
        let runner = Arc::new(TaskRunner::new(1));
        let received = Arc::new(std::sync::Mutex::new(None::<Value>));
        let sink = Arc::clone(&received);
        runner.register(
            "agent_step",
            Arc::new(move |kwargs: Value| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    *sink.lock().unwrap() = Some(kwargs);
                    Ok(())
                }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
            }),
        );
        let tool = SessionSendTool::new(Arc::clone(&runner));
        let out = tool
            .execute(&ctx, &json!({"to_agent_id": "coder", "message": "review this"}))
            .await
            .unwrap();
        assert_eq!(out["status"], "delegated");
        assert_eq!(out["queued"], true);
        runner.shutdown(std::time::Duration::from_secs(1)).await;

        let kwargs = received.lock().unwrap().clone().unwrap();
        assert_eq!(kwargs["actor_id"], "coder");
        assert_eq!(kwargs["thread_id"], json!(thread));

        let conn = db.open().unwrap();
        let routed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE thread_id = ?1 AND role = 'agent'",
                [&thread],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(routed, 1);
        let delegate_events: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE event_type = 'agent.delegate'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(delegate_events, 1);
    }

    #[tokio::test]
    async fn send_without_thread_context_fails() {
        let db = Db::in_memory().unwrap();
        let runner = Arc::new(TaskRunner::new(1));
        let ctx = ToolContext {
            db,
            caller_id: "main".to_string(),
            trace_id: "trc_x".to_string(),
            thread_id: None,
        };
        let tool = SessionSendTool::new(runner);
        assert!(tool
            .execute(&ctx, &json!({"to_agent_id": "coder", "message": "x"}))
            .await
            .is_err());
    }
}
