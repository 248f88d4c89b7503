//! Tool registry (C-TOOLS). Generalizes the reference `ToolRegistry`/
//! `AgentTool` pair: tools are partitioned into `info` (read-only, executed
//! eagerly by the executor and folded into context) and `output` (deferred
//! until the task's result is accepted, per §4.6).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub mod builtin;

pub use builtin::{ReadContextTool, RecordNoteTool};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("tool not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Read-only: gathers information. Safe to invoke eagerly as part of
    /// context assembly, any number of times, without side effects.
    Info,
    /// Side-effecting: produces or commits a task's output. Deferred until
    /// the executor has an accepted result to act on.
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: Value) -> Self {
        Self { success: true, content, error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { success: false, content: Value::Null, error: Some(message.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    pub parameters_schema: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ToolKind;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn invoke(&self, params: Value) -> Result<ToolResult, ToolError>;
}

/// Holds every tool a task's execution may call. Looked up by name at
/// routing time; listed wholesale when building a tool-aware decomposition
/// prompt.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                kind: t.kind(),
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect()
    }

    pub async fn invoke(&self, name: &str, params: Value) -> Result<ToolResult, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.invoke(params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ReadContextTool));
        registry.register(Box::new(RecordNoteTool::new()));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn default_registry_lists_builtin_tools() {
        let registry = ToolRegistry::default();
        let names: Vec<String> = registry.list().into_iter().map(|d| d.name).collect();
        assert!(names.contains(&"read_context".to_string()));
        assert!(names.contains(&"record_note".to_string()));
    }
}
