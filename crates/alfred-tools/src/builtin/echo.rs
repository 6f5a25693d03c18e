// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolContext, ToolError};

/// Diagnostic tool: reflects its arguments back.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given arguments back unchanged"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            }
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
        Ok(json!({"echo": args}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alfred_store::Db;

    #[tokio::test]
    async fn echoes_arguments() {
        let ctx = ToolContext {
            db: Db::in_memory().unwrap(),
            caller_id: "main".to_string(),
            trace_id: "trc_t".to_string(),
            thread_id: None,
        };
        let out = EchoTool.execute(&ctx, &json!({"text": "hi"})).await.unwrap();
        assert_eq!(out["echo"]["text"], "hi");
    }
}
