//! Data model (§3): Plan, Task, links, outputs, evaluation history, context
//! snapshots, runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub const MAX_DEPTH: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub goal: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub meta: serde_json::Value,
}

impl Plan {
    pub fn new(title: String, goal: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            goal,
            created_at: now,
            updated_at: now,
            meta: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Root,
    Composite,
    Atomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub plan_id: String,
    pub parent_id: Option<String>,
    pub root_id: String,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i64,
    pub depth: i64,
    pub position: i64,
    pub path: String,
    pub session_id: Option<String>,
    pub workflow_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether this task may transition to `running`/`completed` (§3: only
    /// atomic tasks execute directly).
    pub fn is_executable(&self) -> bool {
        self.task_type == TaskType::Atomic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Requires,
    Refers,
    Duplicates,
    RelatesTo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLink {
    pub from_id: String,
    pub to_id: String,
    pub kind: LinkKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    SingleJudge,
    MultiExpert,
    Adversarial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: String,
    pub task_id: String,
    pub iteration: u32,
    pub content_snapshot: String,
    pub overall_score: f64,
    pub dimension_scores: HashMap<String, f64>,
    pub suggestions: Vec<String>,
    pub needs_revision: bool,
    pub mode: EvaluationMode,
    pub created_at: DateTime<Utc>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Index,
    DepRequires,
    DepRefers,
    Sibling,
    Retrieved,
    Manual,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncatedReason {
    None,
    PerSection,
    Total,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionMeta {
    pub source_id: String,
    pub kind: SectionKind,
    pub priority_tier: i64,
    pub length: usize,
    pub truncated_reason: TruncatedReason,
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub task_id: String,
    pub label: String,
    pub combined_text: String,
    pub sections: Vec<SectionMeta>,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub plan_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub strategy: String,
    pub options: serde_json::Value,
    pub status: RunStatus,
}
