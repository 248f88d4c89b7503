//! A small set of built-in tools so the crate is usable out of the box
//! without a caller having to register anything. Grounded in the reference
//! file-ops/system-ops tools, generalized away from filesystem access since
//! this crate has no workspace-editing surface of its own.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;

use super::{Tool, ToolError, ToolKind, ToolResult};

/// Echoes back whatever text is handed to it, tagged as an info section.
/// Stands in for the class of read-only lookups (file reads, web search,
/// code search) a real deployment would register here.
pub struct ReadContextTool;

#[async_trait]
impl Tool for ReadContextTool {
    fn name(&self) -> &str {
        "read_context"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Info
    }

    fn description(&self) -> &str {
        "Returns the given query unchanged, tagged as a context note"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<ToolResult, ToolError> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParameters("missing `query`".into()))?;
        Ok(ToolResult::ok(json!({ "note": query })))
    }
}

/// Appends a note to an in-memory log. An `output` tool: it mutates state
/// and is only invoked once a task's result is accepted.
pub struct RecordNoteTool {
    notes: Mutex<Vec<String>>,
}

impl RecordNoteTool {
    pub fn new() -> Self {
        Self { notes: Mutex::new(Vec::new()) }
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().unwrap().clone()
    }
}

impl Default for RecordNoteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for RecordNoteTool {
    fn name(&self) -> &str {
        "record_note"
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Output
    }

    fn description(&self) -> &str {
        "Appends a note describing the task's accepted output"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "note": { "type": "string" } },
            "required": ["note"]
        })
    }

    async fn invoke(&self, params: Value) -> Result<ToolResult, ToolError> {
        let note = params
            .get("note")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParameters("missing `note`".into()))?;
        self.notes.lock().unwrap().push(note.to_string());
        Ok(ToolResult::ok(json!({ "recorded": true })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_context_echoes_query() {
        let tool = ReadContextTool;
        let result = tool.invoke(json!({"query": "hello"})).await.unwrap();
        assert_eq!(result.content["note"], "hello");
    }

    #[tokio::test]
    async fn record_note_accumulates() {
        let tool = RecordNoteTool::new();
        tool.invoke(json!({"note": "a"})).await.unwrap();
        tool.invoke(json!({"note": "b"})).await.unwrap();
        assert_eq!(tool.notes(), vec!["a".to_string(), "b".to_string()]);
    }
}
