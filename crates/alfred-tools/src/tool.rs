// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use alfred_policy::RiskTier;
use alfred_store::{Db, StoreError};

/// Error produced by a tool handler.  Flows back into the conversation as a
/// tool-result message; never retried.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        ToolError::new(err.to_string())
    }
}

/// Terminal outcome of a runtime execution.
#[derive(Debug, Error)]
pub enum ToolRuntimeError {
    /// Denied by the policy engine; surfaces as a refusal in the reply.
    #[error("tool denied by policy: {reason}")]
    Policy { reason: String },
    /// The handler itself failed.
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-invocation context handed to a tool handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub db: Db,
    pub caller_id: String,
    pub trace_id: String,
    pub thread_id: Option<String>,
}

/// Trait every built-in and registered tool implements.
///
/// `parameters_schema` is JSON-schema-shaped (`{type, properties, required}`)
/// and is advertised to the model; argument validation stays the handler's
/// responsibility at its own boundary.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    /// Intrinsic risk class, compared against governance risk tiers.
    fn risk_class(&self) -> RiskTier {
        RiskTier::Low
    }
    async fn execute(&self, ctx: &ToolContext, args: &Value) -> Result<Value, ToolError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, _ctx: &ToolContext, _args: &Value) -> Result<Value, ToolError> {
            Ok(json!({"ok": true}))
        }
    }

    #[test]
    fn default_risk_class_is_low() {
        assert_eq!(MinimalTool.risk_class(), RiskTier::Low);
    }

    #[test]
    fn policy_error_display_carries_the_reason() {
        let err = ToolRuntimeError::Policy {
            reason: "R1: lockdown".to_string(),
        };
        assert_eq!(err.to_string(), "tool denied by policy: R1: lockdown");
    }
}
