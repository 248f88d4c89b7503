//! Evaluation-driven iteration (C5, §4.5). An `Evaluator` scores a task's
//! candidate output and says whether it needs another revision pass. Three
//! modes share one contract so the executor doesn't need to know which is
//! configured.

pub mod adversarial;
pub mod cache;
pub mod multi_expert;
pub mod single_judge;

pub use adversarial::AdversarialEvaluator;
pub use cache::EvaluationCache;
pub use multi_expert::MultiExpertEvaluator;
pub use single_judge::SingleJudgeEvaluator;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::providers::{BackendError, LLMBackend};
use crate::store::EvaluationMode;

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("malformed evaluation output: {0}")]
    MalformedOutput(String),
}

pub type EvaluatorResult<T> = Result<T, EvaluatorError>;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Evaluation {
    pub overall_score: f64,
    pub dimension_scores: HashMap<String, f64>,
    pub suggestions: Vec<String>,
    pub needs_revision: bool,
    /// Set only by evaluators that produce a revised draft as part of
    /// scoring (the adversarial mode's rewriter step). When present, the
    /// executor adopts this text as the iteration's output instead of the
    /// generator's original draft.
    pub rewritten_content: Option<String>,
}

/// Evaluators are pure with respect to storage: given the same task id,
/// content, mode, and options, they always compute the same `Evaluation`.
/// Persistence and caching happen outside this trait.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn mode(&self) -> EvaluationMode;

    /// `threshold` is the minimum `overall_score` at which `needs_revision`
    /// comes back false; callers that don't care pass [`DEFAULT_QUALITY_THRESHOLD`].
    async fn evaluate(
        &self,
        task_description: &str,
        candidate_output: &str,
        threshold: f64,
        cancel: CancellationToken,
    ) -> EvaluatorResult<Evaluation>;
}

/// Dimension weights used when averaging multi-expert or adversarial
/// scores. Defaults to uniform weighting across whatever dimensions the
/// backend returns.
#[derive(Debug, Clone, Default)]
pub struct DimensionWeights(pub HashMap<String, f64>);

impl DimensionWeights {
    pub fn weighted_average(&self, scores: &HashMap<String, f64>) -> f64 {
        if scores.is_empty() {
            return 0.0;
        }
        if self.0.is_empty() {
            return scores.values().sum::<f64>() / scores.len() as f64;
        }
        let mut total_weight = 0.0;
        let mut sum = 0.0;
        for (dim, score) in scores {
            let weight = self.0.get(dim).copied().unwrap_or(1.0);
            sum += score * weight;
            total_weight += weight;
        }
        if total_weight == 0.0 {
            0.0
        } else {
            sum / total_weight
        }
    }
}

/// Default minimum `overall_score` below which a task needs another
/// iteration. Callers may override this per evaluation (e.g. a task's
/// `evaluation_options.quality_threshold`).
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.8;

/// Builds the bare (uncached) Evaluator for a configured or per-request
/// `evaluation_mode` string (§6). Unknown modes fall back to `single_judge`.
pub fn build_evaluator(mode: &str, backend: Arc<dyn LLMBackend>, model: String) -> Arc<dyn Evaluator> {
    match mode {
        "multi_expert" => Arc::new(MultiExpertEvaluator::new(backend, model, vec!["correctness".into(), "clarity".into(), "completeness".into()])),
        "adversarial" => Arc::new(AdversarialEvaluator::new(backend, model)),
        _ => Arc::new(SingleJudgeEvaluator::new(backend, model)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_weighting_averages_plainly() {
        let weights = DimensionWeights::default();
        let mut scores = HashMap::new();
        scores.insert("correctness".to_string(), 0.8);
        scores.insert("clarity".to_string(), 0.4);
        assert!((weights.weighted_average(&scores) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn configured_weighting_biases_toward_heavier_dimension() {
        let mut w = HashMap::new();
        w.insert("correctness".to_string(), 3.0);
        w.insert("clarity".to_string(), 1.0);
        let weights = DimensionWeights(w);
        let mut scores = HashMap::new();
        scores.insert("correctness".to_string(), 1.0);
        scores.insert("clarity".to_string(), 0.0);
        assert!((weights.weighted_average(&scores) - 0.75).abs() < 1e-9);
    }
}
