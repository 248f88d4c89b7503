//! Recursive, tool-aware task decomposition (C2, §4.2). Classifies a task's
//! complexity, then — for anything above `low` — asks the backend to
//! propose subtasks as structured JSON, recursing down to `MAX_DEPTH` or
//! until every leaf classifies as `low`.
//!
//! Mirrors the reference planner's `classify_intent`/`decompose_complex_task`
//! pair: an LLM call for the interesting case, a deterministic keyword
//! heuristic as the fallback when the backend is unavailable or returns
//! something unusable.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::providers::{BackendError, ChatMessage, ChatRequest, LLMBackend};
use crate::store::models::MAX_DEPTH;
use crate::tools::ToolRegistry;

#[derive(Debug, thiserror::Error)]
pub enum DecomposeError {
    #[error("decomposition refused: {0}")]
    Refused(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

pub type DecomposeResult<T> = Result<T, DecomposeError>;

/// Default upper bound on how many subtasks a single decomposition call
/// may propose, overridable per call.
pub const DEFAULT_MAX_SUBTASKS: usize = 5;

impl From<BackendError> for DecomposeError {
    fn from(e: BackendError) -> Self {
        DecomposeError::BackendUnavailable(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedSubtask {
    pub name: String,
    pub description: String,
    pub complexity: Complexity,
    /// Indices into the sibling list of subtasks this one `requires`.
    pub requires: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct DecompositionResponse {
    subtasks: Vec<ProposedSubtask>,
}

fn decomposition_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "subtasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "description": {"type": "string"},
                        "complexity": {"type": "string", "enum": ["low", "medium", "high"]},
                        "requires": {"type": "array", "items": {"type": "integer"}}
                    },
                    "required": ["name", "description", "complexity"]
                }
            }
        },
        "required": ["subtasks"]
    })
}

pub struct Decomposer {
    backend: Arc<dyn LLMBackend>,
    model: String,
    max_depth: u32,
}

impl Decomposer {
    pub fn new(backend: Arc<dyn LLMBackend>, model: String, max_depth: u32) -> Self {
        Self { backend, model, max_depth }
    }

    /// Classifies how complex a task description is. Tries the backend
    /// first; falls back to a deterministic keyword/length heuristic if the
    /// backend is unavailable, matching the reference planner's behavior
    /// when running without a live provider.
    pub async fn classify(&self, description: &str, cancel: CancellationToken) -> Complexity {
        match self.classify_via_backend(description, cancel).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "complexity classification fell back to heuristic");
                classify_heuristic(description)
            }
        }
    }

    async fn classify_via_backend(&self, description: &str, cancel: CancellationToken) -> DecomposeResult<Complexity> {
        let schema = json!({
            "type": "object",
            "properties": { "complexity": { "type": "string", "enum": ["low", "medium", "high"] } },
            "required": ["complexity"]
        });
        let req = ChatRequest {
            messages: vec![
                ChatMessage::system("Classify the complexity of the given task as low, medium, or high."),
                ChatMessage::user(description),
            ],
            model: self.model.clone(),
            max_tokens: Some(64),
            temperature: Some(0.0),
            response_schema: Some(schema),
        };
        let resp = self.backend.chat(req, cancel).await?;
        #[derive(Deserialize)]
        struct Wire {
            complexity: Complexity,
        }
        let wire: Wire = serde_json::from_str(&resp.content)
            .map_err(|e| DecomposeError::BackendUnavailable(e.to_string()))?;
        Ok(wire.complexity)
    }

    /// Proposes a flat list of subtasks for `description`, optionally aware
    /// of the tools available to whichever executor will run them. Returns
    /// `Refused` if the backend explicitly declines (malformed or empty
    /// output, too many subtasks, a subtask echoing `parent_name`, or
    /// after the classification says this isn't actually `low`).
    ///
    /// `max_subtasks` caps how many children a single decomposition may
    /// propose. When `depth`'s children would land at the deepest
    /// allowed level, every proposed subtask is forced to `low`
    /// complexity: there's no further depth budget to decompose them
    /// again, so they must be directly executable.
    pub async fn decompose(
        &self,
        description: &str,
        parent_name: &str,
        depth: u32,
        max_subtasks: usize,
        max_depth_override: Option<u32>,
        tools: Option<&ToolRegistry>,
        cancel: CancellationToken,
    ) -> DecomposeResult<Vec<ProposedSubtask>> {
        let effective_max_depth = max_depth_override.unwrap_or(self.max_depth).min(MAX_DEPTH as u32);
        if depth >= effective_max_depth {
            debug!(depth, "max decompose depth reached, stopping");
            return Ok(Vec::new());
        }
        let children_are_leaves = depth + 1 >= effective_max_depth;

        let tool_list = tools
            .map(|r| {
                r.list()
                    .into_iter()
                    .map(|d| format!("- {} ({:?}): {}", d.name, d.kind, d.description))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        let prompt = if tool_list.is_empty() {
            format!("Decompose this task into an ordered list of smaller subtasks:\n\n{description}")
        } else {
            format!(
                "Decompose this task into an ordered list of smaller subtasks. Available tools:\n{tool_list}\n\nTask:\n{description}"
            )
        };

        let req = ChatRequest {
            messages: vec![
                ChatMessage::system("You decompose tasks into subtasks. Respond with the requested JSON shape only."),
                ChatMessage::user(prompt),
            ],
            model: self.model.clone(),
            max_tokens: Some(1024),
            temperature: Some(0.2),
            response_schema: Some(decomposition_schema()),
        };

        let resp = self.backend.chat(req, cancel).await?;
        let mut parsed: DecompositionResponse = serde_json::from_str(&resp.content)
            .map_err(|e| DecomposeError::Refused(format!("malformed decomposition output: {e}")))?;

        if parsed.subtasks.len() < 2 {
            return Err(DecomposeError::Refused(format!("backend returned {} subtask(s), need at least 2", parsed.subtasks.len())));
        }
        if parsed.subtasks.len() > max_subtasks {
            return Err(DecomposeError::Refused(format!(
                "backend returned {} subtask(s), exceeding the limit of {max_subtasks}",
                parsed.subtasks.len()
            )));
        }
        let parent_name_normalized = parent_name.trim().to_lowercase();
        let mut seen_names = std::collections::HashSet::new();
        for s in &parsed.subtasks {
            if s.name.trim().is_empty() {
                return Err(DecomposeError::Refused("subtask has an empty name".into()));
            }
            if s.name.trim().to_lowercase() == parent_name_normalized {
                return Err(DecomposeError::Refused(format!("subtask repeats its parent's name: {}", s.name)));
            }
            if !seen_names.insert(s.name.trim().to_lowercase()) {
                return Err(DecomposeError::Refused(format!("duplicate subtask name: {}", s.name)));
            }
            for &dep in &s.requires {
                if dep >= parsed.subtasks.len() {
                    return Err(DecomposeError::Refused(format!("subtask references out-of-range dependency {dep}")));
                }
            }
        }

        if children_are_leaves {
            for s in &mut parsed.subtasks {
                s.complexity = Complexity::Low;
            }
        }

        Ok(parsed.subtasks)
    }
}

/// Deterministic fallback: keyword/length based, matching the reference
/// planner's intent-classification style. Never calls the backend.
pub fn classify_heuristic(description: &str) -> Complexity {
    let lower = description.to_lowercase();
    let word_count = description.split_whitespace().count();

    let high_signal = ["design", "architecture", "migrate", "refactor the", "rewrite", "investigate"];
    let medium_signal = ["implement", "add", "build", "create", "integrate", "fix"];

    if high_signal.iter().any(|s| lower.contains(s)) || word_count > 40 {
        Complexity::High
    } else if medium_signal.iter().any(|s| lower.contains(s)) || word_count > 12 {
        Complexity::Medium
    } else {
        Complexity::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;

    #[test]
    fn heuristic_flags_short_description_as_low() {
        assert_eq!(classify_heuristic("fix typo"), Complexity::Low);
    }

    #[test]
    fn heuristic_flags_architecture_language_as_high() {
        assert_eq!(classify_heuristic("design the new architecture for the service"), Complexity::High);
    }

    #[tokio::test]
    async fn classify_falls_back_when_backend_returns_unparseable_json() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response("not json");
        let decomposer = Decomposer::new(backend, "mock".into(), 3);
        let complexity = decomposer.classify("implement a new login form", CancellationToken::new()).await;
        assert_eq!(complexity, Complexity::Medium);
    }

    #[tokio::test]
    async fn decompose_refuses_on_empty_subtasks() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"subtasks": []}"#);
        let decomposer = Decomposer::new(backend, "mock".into(), 3);
        let err = decomposer
            .decompose("build a thing", "parent", 0, DEFAULT_MAX_SUBTASKS, None, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::Refused(_)));
    }

    #[tokio::test]
    async fn decompose_refuses_on_out_of_range_dependency() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(
            r#"{"subtasks": [{"name": "a", "description": "a", "complexity": "low", "requires": [5]}, {"name": "b", "description": "b", "complexity": "low", "requires": []}]}"#,
        );
        let decomposer = Decomposer::new(backend, "mock".into(), 3);
        let err = decomposer
            .decompose("build a thing", "parent", 0, DEFAULT_MAX_SUBTASKS, None, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::Refused(_)));
    }

    #[tokio::test]
    async fn decompose_refuses_on_single_subtask() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"subtasks": [{"name": "a", "description": "a", "complexity": "low", "requires": []}]}"#);
        let decomposer = Decomposer::new(backend, "mock".into(), 3);
        let err = decomposer
            .decompose("build a thing", "parent", 0, DEFAULT_MAX_SUBTASKS, None, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::Refused(_)));
    }

    #[tokio::test]
    async fn decompose_refuses_on_duplicate_names() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(
            r#"{"subtasks": [{"name": "a", "description": "first", "complexity": "low", "requires": []}, {"name": "A", "description": "second", "complexity": "low", "requires": []}]}"#,
        );
        let decomposer = Decomposer::new(backend, "mock".into(), 3);
        let err = decomposer
            .decompose("build a thing", "parent", 0, DEFAULT_MAX_SUBTASKS, None, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::Refused(_)));
    }

    #[tokio::test]
    async fn decompose_refuses_on_name_matching_parent() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(
            r#"{"subtasks": [{"name": "Parent", "description": "first", "complexity": "low", "requires": []}, {"name": "b", "description": "second", "complexity": "low", "requires": []}]}"#,
        );
        let decomposer = Decomposer::new(backend, "mock".into(), 3);
        let err = decomposer
            .decompose("build a thing", "parent", 0, DEFAULT_MAX_SUBTASKS, None, None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DecomposeError::Refused(_)));
    }

    #[tokio::test]
    async fn decompose_stops_at_max_depth() {
        let backend = Arc::new(MockBackend::new());
        let decomposer = Decomposer::new(backend, "mock".into(), 2);
        let subtasks = decomposer
            .decompose("build a thing", "parent", 2, DEFAULT_MAX_SUBTASKS, None, None, CancellationToken::new())
            .await
            .unwrap();
        assert!(subtasks.is_empty());
    }

    #[tokio::test]
    async fn decompose_forces_low_complexity_when_children_are_leaves() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(
            r#"{"subtasks": [{"name": "a", "description": "a", "complexity": "high", "requires": []}, {"name": "b", "description": "b", "complexity": "high", "requires": []}]}"#,
        );
        let decomposer = Decomposer::new(backend, "mock".into(), 3);
        // effective_max_depth = min(3, MAX_DEPTH=3) = 3; depth+1 == 3 >= 3, so children are leaves.
        let subtasks = decomposer
            .decompose("build a thing", "parent", 2, DEFAULT_MAX_SUBTASKS, None, None, CancellationToken::new())
            .await
            .unwrap();
        assert!(subtasks.iter().all(|s| s.complexity == Complexity::Low));
    }
}
