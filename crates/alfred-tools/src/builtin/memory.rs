// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use alfred_memory::MemoryService;

use crate::tool::{Tool, ToolContext, ToolError};

/// Hybrid search over the current thread's memory.
pub struct MemorySearchTool;

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search this conversation's long-term memory"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer" }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        let thread_id = ctx
            .thread_id
            .as_deref()
            .ok_or_else(|| ToolError::new("memory_search requires a thread context"))?;
        let query = args.get("query").and_then(Value::as_str);
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;
        let conn = ctx.db.open().map_err(ToolError::from)?;
        let hits = MemoryService
            .search(&conn, thread_id, limit.clamp(1, 50), query, 0.4, 0.35, 0.25)
            .map_err(|err| ToolError::new(err.to_string()))?;
        Ok(json!({
            "results": hits
                .into_iter()
                .map(|h| json!({"id": h.id, "text": h.text, "score": h.score}))
                .collect::<Vec<_>>()
        }))
    }
}
