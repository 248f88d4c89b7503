//! Iterative, evaluation-driven execution of a single atomic task (C6,
//! §4.6). Each task gets its own per-task lock so two concurrent workers
//! can never step on the same task's state machine; cancellation is
//! cooperative via `CancellationToken`; retries back off exponentially the
//! same way the reference provider clients do around a flaky network call.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{Assembler, ContextOptions};
use crate::evaluate::{Evaluation, Evaluator};
use crate::memory::Memory;
use crate::providers::{ChatMessage, ChatRequest, LLMBackend};
use crate::store::{Store, StoreError, Task, TaskStatus};
use crate::tools::ToolRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("backend error: {0}")]
    Backend(#[from] crate::providers::BackendError),
    #[error("evaluator error: {0}")]
    Evaluator(#[from] crate::evaluate::EvaluatorError),
    #[error("task cancelled")]
    Cancelled,
    #[error("task {0} exceeded its retry budget")]
    RetriesExhausted(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Per-call execution options (§4.5): `context_options` defaults to the
/// assembler's configured defaults with a snapshot saved under the
/// `execution` label when `None`; `use_tools` and `enable_evaluation` gate
/// the corresponding lifecycle steps; `evaluator_override` lets a single
/// call use a different Evaluator than the one this Executor was built
/// with, without reconstructing the Executor.
#[derive(Clone)]
pub struct ExecuteOptions {
    pub context_options: Option<ContextOptions>,
    pub use_tools: bool,
    pub enable_evaluation: bool,
    pub evaluator_override: Option<Arc<dyn Evaluator>>,
    /// Per-call overrides for this Executor's configured
    /// `max_iterations`/`quality_threshold` (§4.5 `evaluation_options`).
    pub max_iterations: Option<u32>,
    pub quality_threshold: Option<f64>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            context_options: None,
            use_tools: true,
            enable_evaluation: true,
            evaluator_override: None,
            max_iterations: None,
            quality_threshold: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionOutcome {
    pub task_id: String,
    pub iterations: u32,
    pub final_output: String,
    pub final_evaluation: Evaluation,
    pub status: TaskStatus,
}

/// Drives a single task through pending -> running -> completed/failed,
/// iterating generate-then-evaluate until the evaluator is satisfied or
/// `max_iterations` is reached.
pub struct Executor {
    store: Arc<Store>,
    backend: Arc<dyn LLMBackend>,
    model: String,
    assembler: Arc<Assembler>,
    evaluator: Arc<dyn Evaluator>,
    tools: Arc<ToolRegistry>,
    max_iterations: u32,
    max_retries: u32,
    backoff_base_ms: u64,
    quality_threshold: f64,
    memory: Option<Arc<Memory>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        backend: Arc<dyn LLMBackend>,
        model: String,
        assembler: Arc<Assembler>,
        evaluator: Arc<dyn Evaluator>,
        tools: Arc<ToolRegistry>,
        max_iterations: u32,
        max_retries: u32,
        backoff_base_ms: u64,
    ) -> Self {
        Self {
            store,
            backend,
            model,
            assembler,
            evaluator,
            tools,
            max_iterations,
            max_retries,
            backoff_base_ms,
            quality_threshold: crate::evaluate::DEFAULT_QUALITY_THRESHOLD,
            memory: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the default [`crate::evaluate::DEFAULT_QUALITY_THRESHOLD`]
    /// an evaluation must clear before a task is accepted.
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Attaches the optional cross-plan memory collaborator (C7, §4.8).
    /// Consumed as extra context sections when a task's `ContextOptions`
    /// sets `use_memory`, and written to after every accepted output.
    pub fn with_memory(mut self, memory: Arc<Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    async fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(task_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Runs every eagerly-executable `info` tool the registry knows about
    /// against the task's own description, folding the results into extra
    /// context text. `output` tools are never invoked here — only once a
    /// candidate is accepted, via `apply_accepted_output`.
    async fn run_info_tools(&self, task_description: &str) -> Vec<(String, String)> {
        let mut extra = Vec::new();
        for descriptor in self.tools.list() {
            if descriptor.kind != crate::tools::ToolKind::Info {
                continue;
            }
            let params = serde_json::json!({ "query": task_description });
            if let Ok(result) = self.tools.invoke(&descriptor.name, params).await {
                if result.success {
                    extra.push((descriptor.name.clone(), result.content.to_string()));
                }
            }
        }
        extra
    }

    async fn generate(&self, task_description: &str, context_text: &str, prior_feedback: &[String], cancel: CancellationToken) -> ExecutorResult<String> {
        let mut user_content = format!("Task:\n{task_description}\n\nContext:\n{context_text}");
        if !prior_feedback.is_empty() {
            user_content.push_str(&format!("\n\nAddress this feedback from the prior attempt:\n{}", prior_feedback.join("\n")));
        }
        let req = ChatRequest {
            messages: vec![
                ChatMessage::system("Produce the output this task asks for. Be direct and complete."),
                ChatMessage::user(user_content),
            ],
            model: self.model.clone(),
            max_tokens: Some(2048),
            temperature: Some(0.4),
            response_schema: None,
        };
        let resp = self.backend.chat(req, cancel).await?;
        Ok(resp.content)
    }

    /// Runs the task's full lifecycle: assembles context, iterates
    /// generate-then-evaluate until accepted or exhausted, persists the
    /// accepted output, and invokes any `output` tools once accepted.
    /// See [`ExecuteOptions`] for the per-call toggles this honors.
    pub async fn execute(&self, plan_id: &str, task: &Task, options: ExecuteOptions, cancel: CancellationToken) -> ExecutorResult<ExecutionOutcome> {
        if !task.is_executable() {
            return Err(ExecutorError::Store(StoreError::Conflict(format!("task {} is not atomic", task.id))));
        }

        let ExecuteOptions { context_options, use_tools, enable_evaluation, evaluator_override, max_iterations, quality_threshold } = options;
        let evaluator: &Arc<dyn Evaluator> = evaluator_override.as_ref().unwrap_or(&self.evaluator);
        let max_iterations = max_iterations.unwrap_or(self.max_iterations);
        let quality_threshold = quality_threshold.unwrap_or(self.quality_threshold);

        let lock = self.lock_for(&task.id).await;
        let _guard = lock.lock().await;

        self.store.update_status(plan_id, &task.id, TaskStatus::Running).await?;

        let context_options = context_options.unwrap_or_else(|| ContextOptions {
            save_snapshot: true,
            label: "execution".to_string(),
            use_memory: self.memory.is_some(),
            ..self.assembler.default_options()
        });
        let task_description = self.store.get_input(plan_id, &task.id).await?.unwrap_or_else(|| task.name.clone());

        let memory_candidates = if context_options.use_memory {
            match &self.memory {
                Some(memory) => match memory.query(&task_description, &[], 3, cancel.clone()).await {
                    Ok(hits) => hits.into_iter().map(|h| (h.id, h.text)).collect(),
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "memory query failed, continuing without it");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let (combined_text, _sections) =
            self.assembler.gather_and_snapshot(plan_id, task, &context_options, &memory_candidates, cancel.clone()).await?;
        let tool_context = if use_tools { self.run_info_tools(&task_description).await } else { Vec::new() };
        let mut context_text = combined_text;
        for (name, content) in &tool_context {
            context_text.push_str(&format!("\n\n[{name}]\n{content}"));
        }

        let mut feedback: Vec<String> = Vec::new();
        let mut last_output = String::new();
        let mut last_eval: Option<Evaluation> = None;
        let mut retries = 0u32;
        let mut iterations_used = 0u32;

        for iteration in 0..max_iterations {
            iterations_used = iteration + 1;
            if cancel.is_cancelled() {
                self.store.update_status(plan_id, &task.id, TaskStatus::Cancelled).await?;
                return Err(ExecutorError::Cancelled);
            }

            let generated = match self.generate(&task_description, &context_text, &feedback, cancel.clone()).await {
                Ok(out) => out,
                Err(e) => {
                    retries += 1;
                    if retries > self.max_retries {
                        self.store.update_status(plan_id, &task.id, TaskStatus::Failed).await?;
                        return Err(ExecutorError::RetriesExhausted(task.id.clone()));
                    }
                    let backoff = self.backoff_base_ms * 2u64.saturating_pow(retries);
                    warn!(task_id = %task.id, retries, backoff_ms = backoff, error = %e, "generation failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    continue;
                }
            };

            if !enable_evaluation {
                // Evaluation skipped: the first generated candidate is
                // accepted outright, with a neutral record so downstream
                // readers (e.g. the assembled artifact, §4.7) still see a
                // score rather than a missing field.
                let evaluation = Evaluation {
                    overall_score: 1.0,
                    dimension_scores: HashMap::new(),
                    suggestions: Vec::new(),
                    needs_revision: false,
                    rewritten_content: None,
                };
                last_output = generated;
                self.store
                    .append_evaluation(
                        plan_id,
                        &crate::store::EvaluationRecord {
                            id: uuid::Uuid::new_v4().to_string(),
                            task_id: task.id.clone(),
                            iteration,
                            content_snapshot: last_output.clone(),
                            overall_score: evaluation.overall_score,
                            dimension_scores: evaluation.dimension_scores.clone(),
                            suggestions: evaluation.suggestions.clone(),
                            needs_revision: evaluation.needs_revision,
                            mode: evaluator.mode(),
                            created_at: chrono::Utc::now(),
                            meta: serde_json::json!({ "degraded": false, "evaluation_skipped": true }),
                        },
                    )
                    .await?;
                last_eval = Some(evaluation);
                break;
            }

            // §4.4: an evaluator backend failure degrades to the last valid
            // score (or a neutral zero score on the very first iteration)
            // with `needs_revision` forced false, rather than failing the
            // task outright — an evaluator outage should not stall a run.
            let (evaluation, degraded) =
                match evaluator.evaluate(&task_description, &generated, quality_threshold, cancel.clone()).await {
                    Ok(eval) => (eval, false),
                    Err(e) => {
                        warn!(task_id = %task.id, iteration, error = %e, "evaluator backend failed, degrading to last valid score");
                        let fallback = last_eval.clone().unwrap_or(Evaluation {
                            overall_score: 0.0,
                            dimension_scores: HashMap::new(),
                            suggestions: Vec::new(),
                            needs_revision: false,
                            rewritten_content: None,
                        });
                        (Evaluation { needs_revision: false, rewritten_content: None, ..fallback }, true)
                    }
                };
            debug!(task_id = %task.id, iteration, score = evaluation.overall_score, degraded, "evaluated candidate output");

            last_output = evaluation.rewritten_content.clone().unwrap_or(generated);
            let needs_revision = evaluation.needs_revision;
            feedback = evaluation.suggestions.clone();

            self.store
                .append_evaluation(
                    plan_id,
                    &crate::store::EvaluationRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        task_id: task.id.clone(),
                        iteration,
                        content_snapshot: last_output.clone(),
                        overall_score: evaluation.overall_score,
                        dimension_scores: evaluation.dimension_scores.clone(),
                        suggestions: evaluation.suggestions.clone(),
                        needs_revision: evaluation.needs_revision,
                        mode: evaluator.mode(),
                        created_at: chrono::Utc::now(),
                        meta: serde_json::json!({ "degraded": degraded }),
                    },
                )
                .await?;
            last_eval = Some(evaluation);

            if !needs_revision {
                break;
            }
        }

        // On acceptance, an evaluation passing, or iteration exhaustion
        // (still `needs_revision` after the last attempt), the best
        // candidate so far is persisted as completed; only a hard failure
        // to ever produce or evaluate a candidate is a real failure.
        let final_eval = last_eval.ok_or_else(|| ExecutorError::RetriesExhausted(task.id.clone()))?;
        let status = TaskStatus::Completed;

        self.store.put_output(plan_id, &task.id, &last_output).await?;
        self.store.update_status(plan_id, &task.id, status).await?;

        if status == TaskStatus::Completed {
            if use_tools {
                self.apply_accepted_output(&task.id, &last_output).await;
            }
            if let Some(memory) = &self.memory {
                if let Err(e) = memory.save(&last_output, vec!["experience".into()], cancel.clone()).await {
                    warn!(task_id = %task.id, error = %e, "failed to save task experience to memory");
                }
            }
        }

        info!(task_id = %task.id, status = ?status, score = final_eval.overall_score, "task execution finished");

        Ok(ExecutionOutcome {
            task_id: task.id.clone(),
            iterations: iterations_used,
            final_output: last_output,
            final_evaluation: final_eval,
            status,
        })
    }

    async fn apply_accepted_output(&self, task_id: &str, output: &str) {
        for descriptor in self.tools.list() {
            if descriptor.kind != crate::tools::ToolKind::Output {
                continue;
            }
            let params = serde_json::json!({ "note": format!("task {task_id}: {output}") });
            let _ = self.tools.invoke(&descriptor.name, params).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::SingleJudgeEvaluator;
    use crate::providers::MockBackend;
    use crate::store::TaskType;

    async fn setup() -> (Arc<Store>, Task) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let plan = store.create_plan("exec-test".into(), "goal".into()).await.unwrap();
        let task = store
            .create_task(&plan.id, None, "root".into(), TaskType::Root, 0, None)
            .await
            .unwrap();
        let atomic = store
            .create_task(&plan.id, Some(&task), "write a greeting".into(), TaskType::Atomic, 0, None)
            .await
            .unwrap();
        store.put_input(&plan.id, &atomic.id, "Write a friendly greeting.").await.unwrap();
        (store, atomic)
    }

    #[tokio::test]
    async fn accepted_output_marks_task_completed() {
        let (store, task) = setup().await;
        let backend = Arc::new(MockBackend::new());
        backend.queue_response("Hello there!");
        backend.queue_response(r#"{"dimension_scores": {"quality": 0.95}, "suggestions": []}"#);
        let backend_dyn: Arc<dyn LLMBackend> = backend.clone();

        let assembler = Arc::new(Assembler::new(store.clone(), backend_dyn.clone(), "mock-embed".into(), 5, 0.0));
        let evaluator: Arc<dyn Evaluator> = Arc::new(SingleJudgeEvaluator::new(backend_dyn.clone(), "mock".into()));
        let tools = Arc::new(ToolRegistry::default());
        let executor = Executor::new(store.clone(), backend_dyn, "mock".into(), assembler, evaluator, tools, 3, 2, 10);

        let outcome = executor.execute(&task.plan_id, &task, ExecuteOptions::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);

        let stored = store.get_task(&task.plan_id, &task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn low_score_iterates_until_accepted() {
        let (store, task) = setup().await;
        let backend = Arc::new(MockBackend::new());
        backend.queue_response("rough draft");
        backend.queue_response(r#"{"dimension_scores": {"quality": 0.3}, "suggestions": ["add more detail"]}"#);
        backend.queue_response("polished draft");
        backend.queue_response(r#"{"dimension_scores": {"quality": 0.9}, "suggestions": []}"#);
        let backend_dyn: Arc<dyn LLMBackend> = backend.clone();

        let assembler = Arc::new(Assembler::new(store.clone(), backend_dyn.clone(), "mock-embed".into(), 5, 0.0));
        let evaluator: Arc<dyn Evaluator> = Arc::new(SingleJudgeEvaluator::new(backend_dyn.clone(), "mock".into()));
        let tools = Arc::new(ToolRegistry::default());
        let executor = Executor::new(store.clone(), backend_dyn, "mock".into(), assembler, evaluator, tools, 3, 2, 10);

        let outcome = executor.execute(&task.plan_id, &task, ExecuteOptions::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.final_output, "polished draft");
    }

    #[tokio::test]
    async fn accepted_output_is_saved_to_memory_when_attached() {
        let (store, task) = setup().await;
        let backend = Arc::new(MockBackend::new());
        backend.queue_response("Hello there!");
        backend.queue_response(r#"{"dimension_scores": {"quality": 0.95}, "suggestions": []}"#);
        let backend_dyn: Arc<dyn LLMBackend> = backend.clone();

        let assembler = Arc::new(Assembler::new(store.clone(), backend_dyn.clone(), "mock-embed".into(), 5, 0.0));
        let evaluator: Arc<dyn Evaluator> = Arc::new(SingleJudgeEvaluator::new(backend_dyn.clone(), "mock".into()));
        let tools = Arc::new(ToolRegistry::default());
        let memory_dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(crate::memory::Memory::open(memory_dir.path(), backend_dyn.clone(), "mock-embed".into()).await.unwrap());
        let executor = Executor::new(store.clone(), backend_dyn, "mock".into(), assembler, evaluator, tools, 3, 2, 10).with_memory(memory.clone());

        let outcome = executor.execute(&task.plan_id, &task, ExecuteOptions::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);

        let hits = memory.query("Hello there!", &[], 5, CancellationToken::new()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "Hello there!");
    }

    #[tokio::test]
    async fn evaluator_failure_degrades_instead_of_failing_the_task() {
        let (store, task) = setup().await;
        let backend = Arc::new(MockBackend::new());
        backend.queue_response("a draft");
        backend.queue_response("not valid json, so the judge call fails to parse");
        let backend_dyn: Arc<dyn LLMBackend> = backend.clone();

        let assembler = Arc::new(Assembler::new(store.clone(), backend_dyn.clone(), "mock-embed".into(), 5, 0.0));
        let evaluator: Arc<dyn Evaluator> = Arc::new(SingleJudgeEvaluator::new(backend_dyn.clone(), "mock".into()));
        let tools = Arc::new(ToolRegistry::default());
        let executor = Executor::new(store.clone(), backend_dyn, "mock".into(), assembler, evaluator, tools, 3, 2, 10);

        let outcome = executor.execute(&task.plan_id, &task, ExecuteOptions::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.final_output, "a draft");
        assert!(!outcome.final_evaluation.needs_revision);

        let evals = store.list_evaluations(&task.plan_id, &task.id).await.unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].meta["degraded"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn cancelled_token_stops_execution() {
        let (store, task) = setup().await;
        let backend = Arc::new(MockBackend::new());
        let backend_dyn: Arc<dyn LLMBackend> = backend.clone();
        let assembler = Arc::new(Assembler::new(store.clone(), backend_dyn.clone(), "mock-embed".into(), 5, 0.0));
        let evaluator: Arc<dyn Evaluator> = Arc::new(SingleJudgeEvaluator::new(backend_dyn.clone(), "mock".into()));
        let tools = Arc::new(ToolRegistry::default());
        let executor = Executor::new(store.clone(), backend_dyn, "mock".into(), assembler, evaluator, tools, 3, 2, 10);

        let token = CancellationToken::new();
        token.cancel();
        let err = executor.execute(&task.plan_id, &task, ExecuteOptions::default(), token).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
    }
}
