// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use alfred_memory::KnowledgeBaseService;

use crate::tool::{Tool, ToolContext, ToolError};

/// Search the shared knowledge base.
pub struct KnowledgeSearchTool;

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn description(&self) -> &str {
        "Search stored knowledge documents by keyword"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("query is required"))?;
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;
        let conn = ctx.db.open().map_err(ToolError::from)?;
        let docs = KnowledgeBaseService
            .search(&conn, query, limit)
            .map_err(ToolError::from)?;
        Ok(json!({
            "results": docs
                .into_iter()
                .map(|d| json!({"id": d.id, "title": d.title, "content": d.content}))
                .collect::<Vec<_>>()
        }))
    }
}
