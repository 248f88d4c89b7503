//! Thin command-line entry point (§6 "Ambient stack — Test tooling /
//! CLI"). Wires together the same collaborators the HTTP server uses, for
//! scripting and local experimentation without standing up a server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::context::Assembler;
use crate::decompose::Decomposer;
use crate::evaluate::{AdversarialEvaluator, EvaluationCache, Evaluator, MultiExpertEvaluator, SingleJudgeEvaluator};
use crate::executor::Executor;
use crate::memory::Memory;
use crate::orchestrator::{DecomposeTaskOptions, Orchestrator, RunOptions};
use crate::providers::{EmbeddingCache, HttpBackend, LLMBackend, MockBackend};
use crate::scheduler::Strategy;
use crate::store::Store;
use crate::tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "taskloom", about = "Goal-to-artifact task orchestration core")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a plan with a single root task.
    Propose { title: String, goal: String },
    /// Recursively decompose a plan's root task.
    Decompose { plan_id: String },
    /// Run every executable task in a plan.
    Run {
        plan_id: String,
        #[arg(long, default_value = "dag")]
        strategy: String,
    },
    /// Print the assembled context a task would see, without executing it.
    Assemble { plan_id: String, task_id: String },
    /// Concatenate every atomic task's accepted output into one artifact.
    AssemblePlan { plan_id: String },
    /// List every plan known to this data directory.
    ListPlans,
    /// Serve the HTTP API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
}

pub struct Cli;

impl Cli {
    pub async fn run(raw_args: Vec<String>) -> Result<()> {
        let args = Args::parse_from(raw_args);
        let config = Config::load()?;
        let orchestrator = build_orchestrator(&config).await?;

        match args.command {
            Command::Propose { title, goal } => {
                let plan = orchestrator.propose_plan(title, goal).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
            Command::Decompose { plan_id } => {
                let tasks = orchestrator.list_tasks(&plan_id).await?;
                let root = tasks
                    .iter()
                    .find(|t| t.task_type == crate::store::TaskType::Root)
                    .context("plan has no root task")?;
                let added = orchestrator.decompose_task(&plan_id, &root.id, DecomposeTaskOptions::default(), CancellationToken::new()).await?;
                println!("{}", serde_json::to_string_pretty(&added)?);
            }
            Command::Run { plan_id, strategy } => {
                let strategy = match strategy.as_str() {
                    "bfs" => Strategy::Bfs,
                    "dag" => Strategy::Dag,
                    "postorder" => Strategy::Postorder,
                    other => anyhow::bail!("unknown strategy: {other}"),
                };
                let outcomes = orchestrator.run(&plan_id, strategy, RunOptions::default(), CancellationToken::new()).await?;
                println!("{} tasks executed", outcomes.len());
            }
            Command::Assemble { plan_id, task_id } => {
                let task = orchestrator.store().get_task(&plan_id, &task_id).await?;
                let options = orchestrator.assembler().default_options();
                let candidates = orchestrator.assembler().gather(&plan_id, &task, &options, &[], CancellationToken::new()).await?;
                let (combined, _) = Assembler::apply_budget(&candidates, options.budget_total_chars, options.budget_per_section_chars, options.summarization_strategy);
                println!("{combined}");
            }
            Command::AssemblePlan { plan_id } => {
                let assembled = orchestrator.assemble(&plan_id).await?;
                println!("{assembled}");
            }
            Command::ListPlans => {
                let plans = orchestrator.store().list_plans().await?;
                println!("{}", serde_json::to_string_pretty(&plans)?);
            }
            Command::Serve { addr } => {
                let router = crate::server::router(Arc::new(orchestrator));
                info!(%addr, "starting taskloom HTTP API");
                let listener = tokio::net::TcpListener::bind(&addr).await?;
                axum::serve(listener, router).await?;
            }
        }

        Ok(())
    }
}

async fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let store = Arc::new(Store::open(&config.data_dir).await?);

    let backend: Arc<dyn LLMBackend> = if config.llm_mock {
        Arc::new(MockBackend::with_model(config.llm_model.clone()))
    } else {
        let url = config
            .llm_backend_url
            .clone()
            .context("LLM_BACKEND_URL must be set when LLM_MOCK is false")?;
        Arc::new(HttpBackend::new(
            url,
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.embedding_model.clone(),
            config.llm_retries,
            config.llm_backoff_base_ms,
        )?)
    };
    let cached_backend: Arc<dyn LLMBackend> = Arc::new(EmbeddingCache::new(backend.clone(), config.embedding_cache_size));

    let decomposer = Arc::new(Decomposer::new(backend.clone(), config.llm_model.clone(), config.max_decompose_depth));
    let assembler = Arc::new(Assembler::new(
        store.clone(),
        cached_backend.clone(),
        config.embedding_model.clone(),
        config.semantic_default_k,
        config.semantic_min_similarity,
    ));
    let tools = Arc::new(ToolRegistry::default());
    let evaluator: Arc<dyn Evaluator> = match config.evaluation_mode.as_str() {
        "multi_expert" => Arc::new(EvaluationCache::new(
            MultiExpertEvaluator::new(backend.clone(), config.llm_model.clone(), vec!["correctness".into(), "clarity".into(), "completeness".into()]),
            config.evaluation_cache_size,
        )),
        "adversarial" => Arc::new(EvaluationCache::new(AdversarialEvaluator::new(backend.clone(), config.llm_model.clone()), config.evaluation_cache_size)),
        _ => Arc::new(EvaluationCache::new(SingleJudgeEvaluator::new(backend.clone(), config.llm_model.clone()), config.evaluation_cache_size)),
    };
    let mut executor = Executor::new(
        store.clone(),
        backend.clone(),
        config.llm_model.clone(),
        assembler.clone(),
        evaluator.clone(),
        tools.clone(),
        config.max_iterations,
        config.llm_retries,
        config.llm_backoff_base_ms,
    )
    .with_quality_threshold(config.quality_threshold);
    if config.use_memory {
        let memory = Memory::open(config.data_dir.join("memory"), backend.clone(), config.embedding_model.clone()).await?;
        executor = executor.with_memory(Arc::new(memory));
    }
    let executor = Arc::new(executor);

    Ok(Orchestrator::new(store, decomposer, assembler, executor, tools, evaluator, backend, config.llm_model.clone(), config.default_parallelism))
}
