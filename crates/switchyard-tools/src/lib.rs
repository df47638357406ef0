//! Tool registry for the agent loop.
//!
//! Tools are capabilities exposed to the model during a turn.
//! Each tool implements the [`Tool`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use switchyard_core::types::{ToolResultContent, ToolSpec};

pub mod notes;

/// Context provided to tools during execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub user_id: String,
    pub conversation_id: String,
}

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ToolResultContent>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Text(text.into())],
            is_error: false,
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            content: vec![ToolResultContent::Json(value)],
            is_error: false,
        }
    }

    /// A failure reported back to the model rather than to the caller.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Text(text.into())],
            is_error: true,
        }
    }
}

/// The core tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model (e.g., "notes").
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's input.
    fn input_schema(&self) -> serde_json::Value;

    async fn invoke(
        &self,
        input: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput>;
}

/// Registry of available tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the inference request, in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Invoke a tool by name. Unknown names are an error.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool '{name}'"))?;
        tool.invoke(input, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase text."
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn invoke(
            &self,
            input: serde_json::Value,
            _context: &ToolContext,
        ) -> anyhow::Result<ToolOutput> {
            let text = input["text"].as_str().unwrap_or_default();
            Ok(ToolOutput::text(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn test_registry_invoke() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));
        assert_eq!(registry.list(), vec!["upper"]);

        let out = registry
            .invoke("upper", json!({"text": "hi"}), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::text("HI"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke("missing", json!({}), &ToolContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_specs_and_replace() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Upper));
        registry.register(Arc::new(Upper));
        let specs = registry.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "upper");
        assert_eq!(specs[0].input_schema["type"], "object");
    }
}
