//! Top-level orchestrator (C0). Wires the decomposer, scheduler, context
//! assembler, evaluator, and executor together behind the operations the
//! HTTP surface exposes: propose a plan, approve it, recursively decompose
//! it, and run it to completion.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::{Assembler, ContextOptions};
use crate::decompose::{Complexity, DecomposeError, Decomposer};
use crate::error::ApiError;
use crate::evaluate::{build_evaluator, Evaluator};
use crate::executor::{ExecuteOptions, ExecutionOutcome, Executor};
use crate::providers::LLMBackend;
use crate::scheduler::{ready_tasks, schedule, Strategy};
use crate::store::{Plan, Store, Task, TaskStatus, TaskType};
use crate::tools::ToolRegistry;

/// Per-call overrides for [`Orchestrator::decompose_task`] (§4.3): `force`
/// re-decomposes a task even if it already has children (deleting them,
/// cascading, first); `tool_aware` passes the configured `ToolRegistry`'s
/// capabilities into the decomposition prompt; `max_depth` bounds the
/// recursive sweep below this task (`None` keeps the Decomposer's own
/// configured default).
#[derive(Debug, Clone, Copy)]
pub struct DecomposeTaskOptions {
    pub max_subtasks: usize,
    pub force: bool,
    pub tool_aware: bool,
    pub max_depth: Option<u32>,
}

impl Default for DecomposeTaskOptions {
    fn default() -> Self {
        Self { max_subtasks: crate::decompose::DEFAULT_MAX_SUBTASKS, force: false, tool_aware: true, max_depth: None }
    }
}

/// Per-call overrides for [`Orchestrator::run`] (§6 `POST /run`): the same
/// `use_context`/`use_tools`/`enable_evaluation`/`evaluation_mode` toggles
/// `execute_task` exposes for a single task, applied uniformly to every
/// task the run dispatches, plus `auto_decompose` to sweep the plan to an
/// atomic-leaved tree before scheduling. `context_options`, when set,
/// replaces the assembler's defaults outright (ignoring `use_context`);
/// `max_iterations`/`quality_threshold` override the Executor's configured
/// defaults for every dispatched task (§4.5 `evaluation_options`).
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub use_context: bool,
    pub context_options: Option<ContextOptions>,
    pub use_tools: bool,
    pub enable_evaluation: bool,
    pub evaluation_mode: Option<String>,
    pub max_iterations: Option<u32>,
    pub quality_threshold: Option<f64>,
    pub auto_decompose: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            use_context: true,
            context_options: None,
            use_tools: true,
            enable_evaluation: true,
            evaluation_mode: None,
            max_iterations: None,
            quality_threshold: None,
            auto_decompose: false,
        }
    }
}

pub struct Orchestrator {
    store: Arc<Store>,
    decomposer: Arc<Decomposer>,
    assembler: Arc<Assembler>,
    executor: Arc<Executor>,
    tools: Arc<ToolRegistry>,
    evaluator: Arc<dyn Evaluator>,
    backend: Arc<dyn LLMBackend>,
    model: String,
    parallelism: usize,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        decomposer: Arc<Decomposer>,
        assembler: Arc<Assembler>,
        executor: Arc<Executor>,
        tools: Arc<ToolRegistry>,
        evaluator: Arc<dyn Evaluator>,
        backend: Arc<dyn LLMBackend>,
        model: String,
        parallelism: usize,
    ) -> Self {
        Self { store, decomposer, assembler, executor, tools, evaluator, backend, model, parallelism }
    }

    pub async fn propose_plan(&self, title: String, goal: String) -> Result<Plan, ApiError> {
        let plan = self.store.create_plan(title, goal.clone()).await?;
        self.store
            .create_task(&plan.id, None, plan.title.clone(), TaskType::Root, 0, None)
            .await?;
        info!(plan_id = %plan.id, "proposed plan");
        Ok(plan)
    }

    /// Approval is a no-op state transition in this crate (there is no
    /// separate "draft" persistence layer to promote out of); it exists as
    /// an explicit step so a caller can gate execution behind a human
    /// review of the proposed root task.
    pub async fn approve_plan(&self, plan_id: &str) -> Result<Plan, ApiError> {
        Ok(self.store.get_plan(plan_id).await?)
    }

    pub async fn list_tasks(&self, plan_id: &str) -> Result<Vec<Task>, ApiError> {
        Ok(self.store.plan_tasks(plan_id).await?)
    }

    /// Recursively decomposes `task_id` and its descendants down to
    /// `MAX_DEPTH` or until every leaf classifies as `low` complexity,
    /// persisting each proposed subtask and its `requires` edges as it
    /// goes. See [`DecomposeTaskOptions`] for the per-call overrides §4.3
    /// exposes.
    pub async fn decompose_task(
        &self,
        plan_id: &str,
        task_id: &str,
        options: DecomposeTaskOptions,
        cancel: CancellationToken,
    ) -> Result<Vec<Task>, ApiError> {
        let task = self.store.get_task(plan_id, task_id).await?;
        let mut created = Vec::new();
        self.decompose_recursive(plan_id, &task, &options, cancel, &mut created).await?;
        Ok(created)
    }

    async fn decompose_recursive(
        &self,
        plan_id: &str,
        task: &Task,
        options: &DecomposeTaskOptions,
        cancel: CancellationToken,
        created: &mut Vec<Task>,
    ) -> Result<(), ApiError> {
        let existing_children = self.store.children(plan_id, &task.id).await?;
        if !existing_children.is_empty() {
            if !options.force {
                return Ok(());
            }
            for child in &existing_children {
                self.store.delete_task(plan_id, &child.id).await?;
            }
        }

        let description = self.store.get_input(plan_id, &task.id).await?.unwrap_or_else(|| task.name.clone());
        let complexity = self.decomposer.classify(&description, cancel.clone()).await;

        if complexity == Complexity::Low {
            return Ok(());
        }

        let tools = options.tool_aware.then_some(self.tools.as_ref());
        let proposed = match self
            .decomposer
            .decompose(&description, &task.name, task.depth as u32, options.max_subtasks, options.max_depth, tools, cancel.clone())
            .await
        {
            Ok(subtasks) => subtasks,
            Err(DecomposeError::Refused(msg)) => {
                warn!(task_id = %task.id, reason = %msg, "decomposition refused, leaving task atomic");
                return Ok(());
            }
            Err(e) => return Err(ApiError::Decompose(e)),
        };

        let mut child_ids = Vec::new();
        for subtask in &proposed {
            let task_type = if subtask.complexity == Complexity::Low { TaskType::Atomic } else { TaskType::Composite };
            let child = self
                .store
                .create_task(plan_id, Some(task), subtask.name.clone(), task_type, 0, None)
                .await?;
            self.store.put_input(plan_id, &child.id, &subtask.description).await?;
            child_ids.push(child.clone());
            created.push(child);
        }
        for (i, subtask) in proposed.iter().enumerate() {
            for &dep_index in &subtask.requires {
                self.store
                    .create_link(plan_id, &child_ids[i].id, &child_ids[dep_index].id, crate::store::LinkKind::Requires)
                    .await?;
            }
        }

        for child in child_ids {
            if child.task_type == TaskType::Composite {
                Box::pin(self.decompose_recursive(plan_id, &child, options, cancel.clone(), created)).await?;
            }
        }
        Ok(())
    }

    /// Runs every executable (atomic) task in the plan, dispatching a task
    /// only once every task it `requires` has completed. `strategy` is
    /// validated up front (it also surfaces a `requires` cycle as an
    /// error) but otherwise only orders the non-dependency-aware
    /// strategies' tie-breaks; actual dispatch is readiness-driven so a
    /// dependent never starts before its prerequisites finish, bounded by
    /// `self.parallelism` concurrent executions. `options` applies the same
    /// per-task toggles [`Orchestrator::execute_task`] exposes uniformly
    /// across every task the run dispatches. If `options.auto_decompose`,
    /// the plan's root is swept to convergence (§4.3) before scheduling.
    pub async fn run(&self, plan_id: &str, strategy: Strategy, options: RunOptions, cancel: CancellationToken) -> Result<Vec<ExecutionOutcome>, ApiError> {
        if options.auto_decompose {
            let existing = self.store.plan_tasks(plan_id).await?;
            if let Some(root) = existing.iter().find(|t| t.task_type == TaskType::Root) {
                self.decompose_task(plan_id, &root.id, DecomposeTaskOptions::default(), cancel.clone()).await?;
            }
        }

        let tasks = self.store.plan_tasks(plan_id).await?;
        let edges = self.store.all_requires_edges(plan_id).await?;
        schedule(&tasks, &edges, strategy).map_err(ApiError::Scheduler)?;

        let run = self.store.create_run(plan_id, strategy_name(strategy), serde_json::json!({})).await?;
        let semaphore = Arc::new(Semaphore::new(self.parallelism.max(1)));
        let mut execute_options = self.build_execute_options(options.use_context, options.use_tools, options.enable_evaluation, options.evaluation_mode.as_deref());
        if options.context_options.is_some() {
            execute_options.context_options = options.context_options.clone();
        }
        execute_options.max_iterations = options.max_iterations;
        execute_options.quality_threshold = options.quality_threshold;

        let mut live = tasks;
        let mut join_set: tokio::task::JoinSet<(String, Result<ExecutionOutcome, crate::executor::ExecutorError>)> = tokio::task::JoinSet::new();
        let mut outcomes = Vec::new();
        let mut failed = false;

        loop {
            if !cancel.is_cancelled() {
                for task in ready_tasks(&live, &edges) {
                    if let Some(slot) = live.iter_mut().find(|t| t.id == task.id) {
                        slot.status = TaskStatus::Running;
                    }
                    let semaphore = semaphore.clone();
                    let executor = self.executor.clone();
                    let plan_id = plan_id.to_string();
                    let cancel = cancel.clone();
                    let execute_options = execute_options.clone();
                    join_set.spawn(async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        let result = executor.execute(&plan_id, &task, execute_options, cancel).await;
                        (task.id, result)
                    });
                }
            }

            if join_set.is_empty() {
                break;
            }

            match join_set.join_next().await {
                Some(Ok((task_id, Ok(outcome)))) => {
                    if let Some(slot) = live.iter_mut().find(|t| t.id == task_id) {
                        slot.status = outcome.status;
                    }
                    outcomes.push(outcome);
                }
                Some(Ok((task_id, Err(e)))) => {
                    warn!(task_id = %task_id, error = %e, "task execution failed");
                    if let Some(slot) = live.iter_mut().find(|t| t.id == task_id) {
                        slot.status = TaskStatus::Failed;
                    }
                    failed = true;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "task execution panicked");
                    failed = true;
                }
                None => break,
            }
        }

        let final_status = if cancel.is_cancelled() {
            crate::store::RunStatus::Cancelled
        } else if failed {
            crate::store::RunStatus::Failed
        } else {
            crate::store::RunStatus::Completed
        };
        self.store.finish_run(plan_id, &run.id, final_status).await?;

        Ok(outcomes)
    }

    /// Executes exactly `task_id`, independent of `run`'s plan-wide dispatch
    /// loop — the HTTP `POST /tasks/{id}/execute` endpoint's counterpart
    /// (§6), not a filtered view over a full-plan run. `use_context=false`
    /// replaces the assembler's default bundle with an empty one so the
    /// task sees only its own input; `evaluation_mode`, when set, overrides
    /// the Orchestrator's configured Evaluator for this call only.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_task(
        &self,
        plan_id: &str,
        task_id: &str,
        use_context: bool,
        evaluation_mode: Option<&str>,
        use_tools: bool,
        enable_evaluation: bool,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ApiError> {
        let task = self.store.get_task(plan_id, task_id).await?;
        let options = self.build_execute_options(use_context, use_tools, enable_evaluation, evaluation_mode);
        Ok(self.executor.execute(plan_id, &task, options, cancel).await?)
    }

    /// Shared by `execute_task` and `run`: `use_context=false` replaces the
    /// assembler's default bundle with an empty one so the task sees only
    /// its own input; `evaluation_mode`, when set, overrides the
    /// Orchestrator's configured Evaluator for this call only.
    fn build_execute_options(&self, use_context: bool, use_tools: bool, enable_evaluation: bool, evaluation_mode: Option<&str>) -> ExecuteOptions {
        let context_options = if use_context {
            None
        } else {
            Some(ContextOptions {
                include_index: false,
                include_deps: false,
                include_plan_siblings: false,
                include_retrieved: false,
                manual_ids: Vec::new(),
                use_memory: false,
                ..self.assembler.default_options()
            })
        };
        let evaluator_override = evaluation_mode.map(|mode| build_evaluator(mode, self.backend.clone(), self.model.clone()));
        ExecuteOptions { context_options, use_tools, enable_evaluation, evaluator_override, ..ExecuteOptions::default() }
    }

    /// Concatenates every atomic task's accepted output into one artifact,
    /// walking the tree postorder (children before parent) so nested work
    /// reads in completion order. An atomic task directly under the root
    /// gets a bare `[name]` header; one nested under a composite gets
    /// `[composite: name]` so its place in the tree stays legible.
    pub async fn assemble(&self, plan_id: &str) -> Result<String, ApiError> {
        let tasks = self.store.plan_tasks(plan_id).await?;
        let root = tasks
            .iter()
            .find(|t| t.task_type == TaskType::Root)
            .ok_or_else(|| ApiError::Validation("plan has no root task".into()))?;
        let mut sections = Vec::new();
        self.assemble_recursive(plan_id, root, &tasks, None, &mut sections).await?;
        Ok(sections.join("\n\n"))
    }

    async fn assemble_recursive(
        &self,
        plan_id: &str,
        task: &Task,
        all: &[Task],
        group_name: Option<&str>,
        sections: &mut Vec<String>,
    ) -> Result<(), ApiError> {
        if task.is_executable() {
            let output = self.store.get_output(plan_id, &task.id).await?;
            let content = output.map(|o| o.content).unwrap_or_default();
            let header = match group_name {
                Some(name) => format!("{name}: {}", task.name),
                None => task.name.clone(),
            };
            sections.push(format!("[{header}]\n{content}"));
            return Ok(());
        }

        let mut children: Vec<&Task> = all.iter().filter(|t| t.parent_id.as_deref() == Some(task.id.as_str())).collect();
        children.sort_by_key(|t| t.position);
        let child_group = if task.task_type == TaskType::Root { None } else { Some(task.name.as_str()) };
        for child in children {
            Box::pin(self.assemble_recursive(plan_id, child, all, child_group, sections)).await?;
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn assembler(&self) -> &Arc<Assembler> {
        &self.assembler
    }
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Bfs => "bfs",
        Strategy::Dag => "dag",
        Strategy::Postorder => "postorder",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::SingleJudgeEvaluator;
    use crate::providers::{LLMBackend, MockBackend};

    async fn build_orchestrator() -> (Orchestrator, Arc<MockBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let backend = Arc::new(MockBackend::new());
        let backend_dyn: Arc<dyn LLMBackend> = backend.clone();
        let decomposer = Arc::new(Decomposer::new(backend_dyn.clone(), "mock".into(), 3));
        let assembler = Arc::new(Assembler::new(store.clone(), backend_dyn.clone(), "mock-embed".into(), 5, 0.0));
        let tools = Arc::new(ToolRegistry::default());
        let evaluator: Arc<dyn Evaluator> = Arc::new(SingleJudgeEvaluator::new(backend_dyn.clone(), "mock".into()));
        let executor = Arc::new(Executor::new(
            store.clone(),
            backend_dyn,
            "mock".into(),
            assembler.clone(),
            evaluator.clone(),
            tools.clone(),
            3,
            2,
            10,
        ));
        (Orchestrator::new(store, decomposer, assembler, executor, tools, evaluator, backend_dyn, "mock".into(), 2), backend)
    }

    #[tokio::test]
    async fn propose_plan_creates_root_task() {
        let (orchestrator, _backend) = build_orchestrator().await;
        let plan = orchestrator.propose_plan("t".into(), "build a thing".into()).await.unwrap();
        let tasks = orchestrator.list_tasks(&plan.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::Root);
    }

    #[tokio::test]
    async fn decompose_creates_children_with_requires_links() {
        let (orchestrator, backend) = build_orchestrator().await;
        let plan = orchestrator.propose_plan("t".into(), "build a thing".into()).await.unwrap();
        let tasks = orchestrator.list_tasks(&plan.id).await.unwrap();
        let root = &tasks[0];

        backend.queue_response(r#"{"complexity": "high"}"#);
        backend.queue_response(
            r#"{"subtasks": [{"name": "a", "description": "first", "complexity": "low", "requires": []}, {"name": "b", "description": "second", "complexity": "low", "requires": [0]}]}"#,
        );

        orchestrator.decompose_task(&plan.id, &root.id, DecomposeTaskOptions::default(), CancellationToken::new()).await.unwrap();
        let all_tasks = orchestrator.list_tasks(&plan.id).await.unwrap();
        assert_eq!(all_tasks.len(), 3);

        let deps = orchestrator.store().list_dependencies(&plan.id, &all_tasks[2].id).await.unwrap();
        assert_eq!(deps.len(), 1);
    }

    #[tokio::test]
    async fn run_never_starts_a_dependent_before_its_prerequisite_completes() {
        let (orchestrator, backend) = build_orchestrator().await;
        let plan = orchestrator.propose_plan("t".into(), "build a thing".into()).await.unwrap();
        let tasks = orchestrator.list_tasks(&plan.id).await.unwrap();
        let root = &tasks[0];

        backend.queue_response(r#"{"complexity": "high"}"#);
        backend.queue_response(
            r#"{"subtasks": [{"name": "a", "description": "first", "complexity": "low", "requires": []}, {"name": "b", "description": "second", "complexity": "low", "requires": [0]}]}"#,
        );
        orchestrator.decompose_task(&plan.id, &root.id, DecomposeTaskOptions::default(), CancellationToken::new()).await.unwrap();

        // Queued strictly in "a generates, a is accepted, b generates, b is
        // accepted" order. If `b` were ever dispatched before `a` finished,
        // its generate call would consume `a`'s acceptance response instead
        // and the mock backend's echo fallback would kick in, producing
        // output that doesn't match either queued candidate.
        backend.queue_response("output-a");
        backend.queue_response(r#"{"dimension_scores": {"quality": 0.95}, "suggestions": []}"#);
        backend.queue_response("output-b");
        backend.queue_response(r#"{"dimension_scores": {"quality": 0.95}, "suggestions": []}"#);

        let outcomes = orchestrator.run(&plan.id, Strategy::Dag, RunOptions::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == TaskStatus::Completed));
        assert!(outcomes.iter().any(|o| o.final_output == "output-a"));
        assert!(outcomes.iter().any(|o| o.final_output == "output-b"));
    }

    #[tokio::test]
    async fn assemble_orders_postorder_with_composite_headers() {
        let (orchestrator, _backend) = build_orchestrator().await;
        let plan = orchestrator.propose_plan("t".into(), "build a thing".into()).await.unwrap();
        let tasks = orchestrator.list_tasks(&plan.id).await.unwrap();
        let root = tasks[0].clone();
        let store = orchestrator.store();

        let c1 = store.create_task(&plan.id, Some(&root), "c1".into(), TaskType::Composite, 0, Some(0)).await.unwrap();
        let a1 = store.create_task(&plan.id, Some(&c1), "a1".into(), TaskType::Atomic, 0, Some(0)).await.unwrap();
        let c2 = store.create_task(&plan.id, Some(&root), "c2".into(), TaskType::Composite, 0, Some(1)).await.unwrap();
        let a2 = store.create_task(&plan.id, Some(&c2), "a2".into(), TaskType::Atomic, 0, Some(0)).await.unwrap();
        let a3 = store.create_task(&plan.id, Some(&root), "a3".into(), TaskType::Atomic, 0, Some(2)).await.unwrap();

        store.put_output(&plan.id, &a1.id, "out-a1").await.unwrap();
        store.put_output(&plan.id, &a2.id, "out-a2").await.unwrap();
        store.put_output(&plan.id, &a3.id, "out-a3").await.unwrap();

        let assembled = orchestrator.assemble(&plan.id).await.unwrap();
        let expected = "[c1: a1]\nout-a1\n\n[c2: a2]\nout-a2\n\n[a3]\nout-a3";
        assert_eq!(assembled, expected);
    }
}
