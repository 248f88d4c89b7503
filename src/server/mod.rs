//! Core HTTP API (§6 "External interfaces"). Borrows `axum`'s `Router` /
//! `State` / `Json` shape from the pack's git-smart-HTTP server, since the
//! teacher this crate is otherwise grounded in only speaks JSON-RPC over
//! stdio and has no HTTP surface of its own.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::context::ContextOptions;
use crate::error::ApiError;
use crate::orchestrator::{DecomposeTaskOptions, Orchestrator, RunOptions};
use crate::scheduler::Strategy;
use crate::store::{ContextSnapshot, Plan, Task};

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/plans/propose", post(propose_plan))
        .route("/plans/approve", post(approve_plan))
        .route("/plans", get(list_plans))
        .route("/plans/{id}/tasks", get(list_tasks))
        .route("/plans/{id}/decompose", post(decompose_plan))
        .route("/tasks/{id}/decompose", post(decompose_one_task))
        .route("/run", post(run_plan))
        .route("/tasks/{id}/execute", post(execute_task))
        .route("/tasks/{id}/output", get(get_task_output))
        .route("/context/links", post(create_link).delete(delete_link))
        .route("/context/links/{task_id}", get(list_links))
        .route("/tasks/{id}/context/preview", post(preview_context))
        .route("/tasks/{id}/context/snapshots", get(list_snapshots))
        .route("/tasks/{id}/context/snapshots/{label}", get(get_snapshot))
        .route("/plans/{id}/assembled", get(assembled_plan))
        .with_state(orchestrator)
}

#[derive(Debug, Deserialize)]
struct ProposePlanRequest {
    title: String,
    goal: String,
}

async fn propose_plan(State(orch): State<Arc<Orchestrator>>, Json(req): Json<ProposePlanRequest>) -> Result<Json<Plan>, ApiError> {
    Ok(Json(orch.propose_plan(req.title, req.goal).await?))
}

#[derive(Debug, Deserialize)]
struct ApprovePlanRequest {
    plan_id: String,
}

async fn approve_plan(State(orch): State<Arc<Orchestrator>>, Json(req): Json<ApprovePlanRequest>) -> Result<Json<Plan>, ApiError> {
    Ok(Json(orch.approve_plan(&req.plan_id).await?))
}

async fn list_plans(State(orch): State<Arc<Orchestrator>>) -> Result<Json<Vec<Plan>>, ApiError> {
    Ok(Json(orch.store().list_plans().await?))
}

async fn list_tasks(State(orch): State<Arc<Orchestrator>>, Path(plan_id): Path<String>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(orch.list_tasks(&plan_id).await?))
}

#[derive(Debug, Serialize)]
struct DecomposeResponse {
    added: Vec<Task>,
}

#[derive(Debug, Deserialize, Default)]
struct DecomposePlanRequest {
    max_depth: Option<u32>,
}

async fn decompose_plan(
    State(orch): State<Arc<Orchestrator>>,
    Path(plan_id): Path<String>,
    Json(req): Json<DecomposePlanRequest>,
) -> Result<Json<DecomposeResponse>, ApiError> {
    let tasks = orch.list_tasks(&plan_id).await?;
    let root = tasks
        .iter()
        .find(|t| t.task_type == crate::store::TaskType::Root)
        .ok_or_else(|| ApiError::Validation("plan has no root task".into()))?;
    let options = DecomposeTaskOptions { max_depth: req.max_depth, ..DecomposeTaskOptions::default() };
    let added = orch.decompose_task(&plan_id, &root.id, options, CancellationToken::new()).await?;
    Ok(Json(DecomposeResponse { added }))
}

#[derive(Debug, Deserialize)]
struct DecomposeTaskRequest {
    plan_id: String,
    max_subtasks: Option<usize>,
    #[serde(default)]
    force: bool,
    tool_aware: Option<bool>,
}

async fn decompose_one_task(
    State(orch): State<Arc<Orchestrator>>,
    Path(task_id): Path<String>,
    Json(req): Json<DecomposeTaskRequest>,
) -> Result<Json<DecomposeResponse>, ApiError> {
    let defaults = DecomposeTaskOptions::default();
    let options = DecomposeTaskOptions {
        max_subtasks: req.max_subtasks.unwrap_or(defaults.max_subtasks),
        force: req.force,
        tool_aware: req.tool_aware.unwrap_or(defaults.tool_aware),
        ..defaults
    };
    let added = orch.decompose_task(&req.plan_id, &task_id, options, CancellationToken::new()).await?;
    Ok(Json(DecomposeResponse { added }))
}

/// Mirrors every field of [`ContextOptions`] (§4.2) as an optional override
/// over the assembler's configured defaults, shared by the `/run` and
/// `/tasks/{id}/context/preview` bodies.
#[derive(Debug, Deserialize, Default)]
struct ContextOptionsOverride {
    include_index: Option<bool>,
    include_deps: Option<bool>,
    include_plan_siblings: Option<bool>,
    include_retrieved: Option<bool>,
    k_per_category: Option<usize>,
    retrieval_k: Option<usize>,
    retrieval_min_similarity: Option<f32>,
    retrieval_max_candidates: Option<usize>,
    manual_ids: Option<Vec<String>>,
    budget_total_chars: Option<usize>,
    budget_per_section_chars: Option<usize>,
    summarization_strategy: Option<String>,
    use_memory: Option<bool>,
}

fn merge_context_options(defaults: ContextOptions, overrides: &ContextOptionsOverride) -> Result<ContextOptions, ApiError> {
    let summarization_strategy = match &overrides.summarization_strategy {
        Some(s) => parse_truncation_strategy(s)?,
        None => defaults.summarization_strategy,
    };
    Ok(ContextOptions {
        include_index: overrides.include_index.unwrap_or(defaults.include_index),
        include_deps: overrides.include_deps.unwrap_or(defaults.include_deps),
        include_plan_siblings: overrides.include_plan_siblings.unwrap_or(defaults.include_plan_siblings),
        include_retrieved: overrides.include_retrieved.unwrap_or(defaults.include_retrieved),
        k_per_category: overrides.k_per_category.or(defaults.k_per_category),
        retrieval_k: overrides.retrieval_k.unwrap_or(defaults.retrieval_k),
        retrieval_min_similarity: overrides.retrieval_min_similarity.unwrap_or(defaults.retrieval_min_similarity),
        retrieval_max_candidates: overrides.retrieval_max_candidates.unwrap_or(defaults.retrieval_max_candidates),
        manual_ids: overrides.manual_ids.clone().unwrap_or(defaults.manual_ids),
        budget_total_chars: overrides.budget_total_chars.or(defaults.budget_total_chars),
        budget_per_section_chars: overrides.budget_per_section_chars.or(defaults.budget_per_section_chars),
        summarization_strategy,
        use_memory: overrides.use_memory.unwrap_or(defaults.use_memory),
        ..defaults
    })
}

#[derive(Debug, Deserialize, Default)]
struct EvaluationOptionsOverride {
    max_iterations: Option<u32>,
    quality_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    plan_id: String,
    #[serde(default = "default_strategy")]
    strategy: String,
    #[serde(default = "default_true")]
    use_context: bool,
    context_options: Option<ContextOptionsOverride>,
    #[serde(default)]
    auto_decompose: bool,
    #[serde(default = "default_true")]
    use_tools: bool,
    #[serde(default = "default_true")]
    enable_evaluation: bool,
    evaluation_mode: Option<String>,
    evaluation_options: Option<EvaluationOptionsOverride>,
    #[serde(default)]
    include_summary: bool,
    #[serde(default)]
    auto_assemble: bool,
}

fn default_strategy() -> String {
    "dag".to_string()
}

fn parse_strategy(s: &str) -> Result<Strategy, ApiError> {
    match s {
        "bfs" => Ok(Strategy::Bfs),
        "dag" => Ok(Strategy::Dag),
        "postorder" => Ok(Strategy::Postorder),
        other => Err(ApiError::Validation(format!("unknown strategy: {other}"))),
    }
}

#[derive(Debug, Serialize)]
struct RunResponse {
    status: &'static str,
    total: usize,
    successful: usize,
    failed: usize,
    results: Vec<crate::executor::ExecutionOutcome>,
    summary: Option<String>,
    assembled: Option<String>,
}

/// Deterministic per-run digest for `include_summary`: one line per
/// completed task naming its status and score, no LLM call.
fn build_run_summary(outcomes: &[crate::executor::ExecutionOutcome]) -> String {
    outcomes
        .iter()
        .map(|o| format!("{}: {:?} (score {:.2}, {} iteration(s))", o.task_id, o.status, o.final_evaluation.overall_score, o.iterations))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_plan(State(orch): State<Arc<Orchestrator>>, Json(req): Json<RunRequest>) -> Result<Json<RunResponse>, ApiError> {
    let strategy = parse_strategy(&req.strategy)?;

    let context_options = match &req.context_options {
        Some(overrides) => Some(merge_context_options(orch.assembler().default_options(), overrides)?),
        None => None,
    };
    let (max_iterations, quality_threshold) = match &req.evaluation_options {
        Some(overrides) => (overrides.max_iterations, overrides.quality_threshold),
        None => (None, None),
    };
    let options = RunOptions {
        use_context: req.use_context,
        context_options,
        use_tools: req.use_tools,
        enable_evaluation: req.enable_evaluation,
        evaluation_mode: req.evaluation_mode.clone(),
        max_iterations,
        quality_threshold,
        auto_decompose: req.auto_decompose,
    };

    let outcomes = orch.run(&req.plan_id, strategy, options, CancellationToken::new()).await?;
    let successful = outcomes.iter().filter(|o| o.status == crate::store::TaskStatus::Completed).count();
    let failed = outcomes.len() - successful;
    let status = if failed == 0 { "completed" } else { "failed" };
    let summary = req.include_summary.then(|| build_run_summary(&outcomes));
    let assembled = if req.auto_assemble { Some(orch.assemble(&req.plan_id).await?) } else { None };
    Ok(Json(RunResponse { status, total: outcomes.len(), successful, failed, results: outcomes, summary, assembled }))
}

#[derive(Debug, Deserialize)]
struct ExecuteTaskRequest {
    plan_id: String,
    #[serde(default = "default_true")]
    use_context: bool,
    evaluation_mode: Option<String>,
    #[serde(default = "default_true")]
    use_tools: bool,
    #[serde(default = "default_true")]
    enable_evaluation: bool,
}

fn default_true() -> bool {
    true
}

async fn execute_task(
    State(orch): State<Arc<Orchestrator>>,
    Path(task_id): Path<String>,
    Json(req): Json<ExecuteTaskRequest>,
) -> Result<Json<crate::executor::ExecutionOutcome>, ApiError> {
    let outcome = orch
        .execute_task(
            &req.plan_id,
            &task_id,
            req.use_context,
            req.evaluation_mode.as_deref(),
            req.use_tools,
            req.enable_evaluation,
            CancellationToken::new(),
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct TaskOutputQuery {
    plan_id: String,
}

async fn get_task_output(
    State(orch): State<Arc<Orchestrator>>,
    Path(task_id): Path<String>,
    Query(q): Query<TaskOutputQuery>,
) -> Result<Json<crate::store::TaskOutput>, ApiError> {
    let output = orch
        .store()
        .get_output(&q.plan_id, &task_id)
        .await?
        .ok_or_else(|| ApiError::Validation("task has no output yet".into()))?;
    Ok(Json(output))
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    plan_id: String,
    from_id: String,
    to_id: String,
    kind: crate::store::LinkKind,
}

async fn create_link(State(orch): State<Arc<Orchestrator>>, Json(req): Json<LinkRequest>) -> Result<Json<serde_json::Value>, ApiError> {
    orch.store().create_link(&req.plan_id, &req.from_id, &req.to_id, req.kind).await?;
    Ok(Json(serde_json::json!({ "created": true })))
}

async fn delete_link(State(orch): State<Arc<Orchestrator>>, Json(req): Json<LinkRequest>) -> Result<Json<serde_json::Value>, ApiError> {
    orch.store().delete_link(&req.plan_id, &req.from_id, &req.to_id, req.kind).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct ListLinksQuery {
    plan_id: String,
}

#[derive(Debug, Serialize)]
struct LinksResponse {
    inbound: Vec<crate::store::TaskLink>,
    outbound: Vec<crate::store::TaskLink>,
}

async fn list_links(
    State(orch): State<Arc<Orchestrator>>,
    Path(task_id): Path<String>,
    Query(q): Query<ListLinksQuery>,
) -> Result<Json<LinksResponse>, ApiError> {
    let inbound = orch.store().inbound_links(&q.plan_id, &task_id).await?;
    let outbound = orch.store().outbound_links(&q.plan_id, &task_id).await?;
    Ok(Json(LinksResponse { inbound, outbound }))
}

/// Preview endpoint body: the same override set `/run`'s `context_options`
/// accepts, so a caller can exercise any combination before wiring it into
/// an actual `execute`/`run` call.
#[derive(Debug, Deserialize)]
struct ContextPreviewRequest {
    plan_id: String,
    #[serde(flatten)]
    overrides: ContextOptionsOverride,
}

fn parse_truncation_strategy(s: &str) -> Result<crate::context::TruncationStrategy, ApiError> {
    match s {
        "none" => Ok(crate::context::TruncationStrategy::None),
        "truncate" => Ok(crate::context::TruncationStrategy::Truncate),
        "sentence" => Ok(crate::context::TruncationStrategy::Sentence),
        other => Err(ApiError::Validation(format!("unknown summarization_strategy: {other}"))),
    }
}

async fn preview_context(
    State(orch): State<Arc<Orchestrator>>,
    Path(task_id): Path<String>,
    Json(req): Json<ContextPreviewRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = orch.store().get_task(&req.plan_id, &task_id).await?;
    let options = merge_context_options(orch.assembler().default_options(), &req.overrides)?;
    let candidates = orch.assembler().gather(&req.plan_id, &task, &options, &[], CancellationToken::new()).await?;
    let (combined, sections) =
        crate::context::Assembler::apply_budget(&candidates, options.budget_total_chars, options.budget_per_section_chars, options.summarization_strategy);
    Ok(Json(serde_json::json!({ "combined_text": combined, "sections": sections })))
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    plan_id: String,
}

async fn list_snapshots(
    State(orch): State<Arc<Orchestrator>>,
    Path(task_id): Path<String>,
    Query(q): Query<SnapshotQuery>,
) -> Result<Json<Vec<ContextSnapshot>>, ApiError> {
    Ok(Json(orch.store().list_snapshots(&q.plan_id, &task_id).await?))
}

async fn get_snapshot(
    State(orch): State<Arc<Orchestrator>>,
    Path((task_id, label)): Path<(String, String)>,
    Query(q): Query<SnapshotQuery>,
) -> Result<Json<ContextSnapshot>, ApiError> {
    Ok(Json(orch.store().get_snapshot(&q.plan_id, &task_id, &label).await?))
}

#[derive(Debug, Serialize)]
struct AssembledResponse {
    plan_id: String,
    combined: String,
}

async fn assembled_plan(State(orch): State<Arc<Orchestrator>>, Path(plan_id): Path<String>) -> Result<Json<AssembledResponse>, ApiError> {
    let combined = orch.assemble(&plan_id).await?;
    Ok(Json(AssembledResponse { plan_id, combined }))
}
