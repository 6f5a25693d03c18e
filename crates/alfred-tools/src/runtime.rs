// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use serde_json::{json, Value};

use alfred_events::{emit, EventInput};
use alfred_policy::decision;
use alfred_store::{new_id, Db};

use crate::registry::ToolRegistry;
use crate::tool::{ToolContext, ToolRuntimeError};

/// Policy-gated, audited tool dispatch.
///
/// Every execution produces one `tool.call.start` and exactly one matching
/// `tool.call.end` on the same call span, whatever the outcome; the policy
/// verdict in between is emitted as `policy.decision` for allow and deny
/// alike (the allow events are what the R8 budget counts).
pub struct ToolRuntime {
    registry: Arc<ToolRegistry>,
}

impl ToolRuntime {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn execute(
        &self,
        db: &Db,
        tool_name: &str,
        arguments: Value,
        caller_id: &str,
        trace_id: &str,
        thread_id: Option<&str>,
    ) -> Result<Value, ToolRuntimeError> {
        let span_id = new_id("spn");
        let event = |event_type: &str, component: &str, payload: Value| {
            let mut event = EventInput::new(
                trace_id,
                event_type,
                component,
                "agent",
                caller_id,
                payload,
            )
            .with_span(span_id.clone());
            if let Some(thread_id) = thread_id {
                event = event.with_thread(thread_id);
            }
            event
        };

        {
            let conn = db.open()?;
            emit(
                &conn,
                event(
                    "tool.call.start",
                    "tools.runtime",
                    json!({"tool": tool_name, "arguments": arguments.clone()}),
                ),
            )?;

            let profile = self.registry.profile(tool_name);
            let (allowed, reason) = decision(
                &conn,
                caller_id,
                tool_name,
                Some(&arguments),
                Some(trace_id),
                profile,
            )?;
            emit(
                &conn,
                event(
                    "policy.decision",
                    "policy",
                    json!({"tool": tool_name, "allowed": allowed, "reason": reason}),
                )
                .with_span(new_id("spn"))
                .with_parent(span_id.clone()),
            )?;
            if !allowed {
                emit(
                    &conn,
                    event(
                        "tool.call.end",
                        "tools.runtime",
                        json!({"tool": tool_name, "error": reason, "status": "denied"}),
                    ),
                )?;
                return Err(ToolRuntimeError::Policy { reason });
            }
        }

        // An unregistered tool was denied above (R3), so the lookup holds.
        let Some(tool) = self.registry.get(tool_name) else {
            return Err(ToolRuntimeError::Policy {
                reason: "R3: unknown tool".to_string(),
            });
        };
        let ctx = ToolContext {
            db: db.clone(),
            caller_id: caller_id.to_string(),
            trace_id: trace_id.to_string(),
            thread_id: thread_id.map(str::to_string),
        };
        let outcome = tool.execute(&ctx, &arguments).await;

        let conn = db.open()?;
        match outcome {
            Ok(result) => {
                emit(
                    &conn,
                    event(
                        "tool.call.end",
                        "tools.runtime",
                        json!({"tool": tool_name, "result": result}),
                    ),
                )?;
                Ok(result)
            }
            Err(err) => {
                emit(
                    &conn,
                    event(
                        "tool.call.end",
                        "tools.runtime",
                        json!({"tool": tool_name, "error": err.message, "status": "error"}),
                    ),
                )?;
                Err(err.into())
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Tool, ToolError};
    use alfred_policy::RiskTier;
    use alfred_store::queries;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the arguments back"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, _ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
            Ok(json!({"ok": true, "args": args}))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _ctx: &ToolContext, _args: &Value) -> Result<Value, ToolError> {
            Err(ToolError::new("handler exploded"))
        }
    }

    fn runtime() -> ToolRuntime {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(FailingTool);
        ToolRuntime::new(Arc::new(registry))
    }

    fn event_counts(db: &Db, trace_id: &str) -> (i64, i64, i64) {
        let conn = db.open().unwrap();
        let count = |event_type: &str| -> i64 {
            conn.query_row(
                "SELECT COUNT(*) FROM events WHERE trace_id = ?1 AND event_type = ?2",
                (trace_id, event_type),
                |r| r.get(0),
            )
            .unwrap()
        };
        (
            count("tool.call.start"),
            count("policy.decision"),
            count("tool.call.end"),
        )
    }

    #[tokio::test]
    async fn allowed_tool_runs_and_pairs_events() {
        let db = Db::in_memory().unwrap();
        {
            let conn = db.open().unwrap();
            queries::grant_permission(&conn, "main", "echo").unwrap();
        }
        let result = runtime()
            .execute(&db, "echo", json!({"text": "hi"}), "main", "trc_ok", None)
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(event_counts(&db, "trc_ok"), (1, 1, 1));
    }

    #[tokio::test]
    async fn start_and_end_share_the_call_span() {
        let db = Db::in_memory().unwrap();
        {
            let conn = db.open().unwrap();
            queries::grant_permission(&conn, "main", "echo").unwrap();
        }
        runtime()
            .execute(&db, "echo", json!({}), "main", "trc_span", None)
            .await
            .unwrap();
        let conn = db.open().unwrap();
        let distinct_spans: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT span_id) FROM events \
                 WHERE trace_id = 'trc_span' AND event_type IN ('tool.call.start', 'tool.call.end')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(distinct_spans, 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_denied_with_paired_events() {
        let db = Db::in_memory().unwrap();
        let err = runtime()
            .execute(&db, "ghost", json!({}), "main", "trc_unknown", None)
            .await
            .unwrap_err();
        match err {
            ToolRuntimeError::Policy { reason } => assert_eq!(reason, "R3: unknown tool"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(event_counts(&db, "trc_unknown"), (1, 1, 1));
    }

    #[tokio::test]
    async fn lockdown_denial_pairs_events() {
        let db = Db::in_memory().unwrap();
        {
            let conn = db.open().unwrap();
            queries::grant_permission(&conn, "main", "echo").unwrap();
            queries::set_lockdown(&conn, true, "test").unwrap();
        }
        let err = runtime()
            .execute(&db, "echo", json!({}), "main", "trc_l", None)
            .await
            .unwrap_err();
        match err {
            ToolRuntimeError::Policy { reason } => assert_eq!(reason, "R1: lockdown"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(event_counts(&db, "trc_l"), (1, 1, 1));
    }

    #[tokio::test]
    async fn handler_failure_lands_in_the_end_event() {
        let db = Db::in_memory().unwrap();
        {
            let conn = db.open().unwrap();
            queries::grant_permission(&conn, "main", "failing").unwrap();
        }
        let err = runtime()
            .execute(&db, "failing", json!({}), "main", "trc_fail", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolRuntimeError::Tool(_)));
        let conn = db.open().unwrap();
        let payload: String = conn
            .query_row(
                "SELECT payload_json FROM events \
                 WHERE trace_id = 'trc_fail' AND event_type = 'tool.call.end'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(payload.contains("handler exploded"));
    }

    #[tokio::test]
    async fn governance_path_denial_flows_through_runtime() {
        let db = Db::in_memory().unwrap();
        {
            let conn = db.open().unwrap();
            queries::grant_permission(&conn, "coder", "echo").unwrap();
            queries::set_governance(
                &conn,
                "coder",
                &queries::Governance {
                    risk_tier: "medium".to_string(),
                    max_actions_per_step: 6,
                    allowed_paths: vec!["/tmp/allowed".to_string()],
                    can_request_privileged_change: false,
                },
            )
            .unwrap();
        }
        let err = runtime()
            .execute(
                &db,
                "echo",
                json!({"path": "/tmp/blocked/file.txt"}),
                "coder",
                "trc_gov_1",
                None,
            )
            .await
            .unwrap_err();
        match err {
            ToolRuntimeError::Policy { reason } => {
                assert_eq!(reason, "R7: governance.allowed_paths")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn action_budget_is_enforced_per_trace() {
        let db = Db::in_memory().unwrap();
        {
            let conn = db.open().unwrap();
            queries::grant_permission(&conn, "coder", "echo").unwrap();
            queries::set_governance(
                &conn,
                "coder",
                &queries::Governance {
                    risk_tier: "medium".to_string(),
                    max_actions_per_step: 2,
                    allowed_paths: vec![],
                    can_request_privileged_change: false,
                },
            )
            .unwrap();
        }
        let rt = runtime();
        for _ in 0..2 {
            rt.execute(&db, "echo", json!({}), "coder", "trc_budget", None)
                .await
                .unwrap();
        }
        let err = rt
            .execute(&db, "echo", json!({}), "coder", "trc_budget", None)
            .await
            .unwrap_err();
        match err {
            ToolRuntimeError::Policy { reason } => {
                assert_eq!(reason, "R8: governance.max_actions_per_step")
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
