// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use alfred_policy::RiskTier;

use crate::tool::Tool;

/// A tool schema as advertised to model providers.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registration + intrinsic risk, in the shape the policy engine wants.
    pub fn profile(&self, name: &str) -> Option<RiskTier> {
        self.tools.get(name).map(|tool| tool.risk_class())
    }

    /// Schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolContext, ToolError};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoTool {
        name: &'static str,
        risk: RiskTier,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        fn risk_class(&self) -> RiskTier {
            self.risk
        }
        async fn execute(&self, _ctx: &ToolContext, args: &Value) -> Result<Value, ToolError> {
            Ok(json!({"echo": args}))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo", risk: RiskTier::Low });
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn profile_reports_registration_and_risk() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "danger", risk: RiskTier::High });
        assert_eq!(registry.profile("danger"), Some(RiskTier::High));
        assert_eq!(registry.profile("missing"), None);
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "zeta", risk: RiskTier::Low });
        registry.register(EchoTool { name: "alpha", risk: RiskTier::Low });
        let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "t", risk: RiskTier::Low });
        registry.register(EchoTool { name: "t", risk: RiskTier::High });
        assert_eq!(registry.names().len(), 1);
        assert_eq!(registry.profile("t"), Some(RiskTier::High));
    }
}
