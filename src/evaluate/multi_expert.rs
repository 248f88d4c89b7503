//! Multi-expert evaluation: several role-based judges score the same
//! candidate in parallel, averaged per dimension with configurable
//! (default uniform) weights.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{DimensionWeights, Evaluation, Evaluator, EvaluatorError, EvaluatorResult};
use crate::providers::{ChatMessage, ChatRequest, LLMBackend};
use crate::store::EvaluationMode;

#[derive(Debug, Deserialize)]
struct ExpertResponse {
    dimension_scores: HashMap<String, f64>,
    suggestions: Vec<String>,
}

fn schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "dimension_scores": {"type": "object", "additionalProperties": {"type": "number"}},
            "suggestions": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["dimension_scores", "suggestions"]
    })
}

pub struct MultiExpertEvaluator {
    backend: Arc<dyn LLMBackend>,
    model: String,
    roles: Vec<String>,
    weights: DimensionWeights,
}

impl MultiExpertEvaluator {
    pub fn new(backend: Arc<dyn LLMBackend>, model: String, roles: Vec<String>) -> Self {
        Self { backend, model, roles, weights: DimensionWeights::default() }
    }

    pub fn with_weights(mut self, weights: DimensionWeights) -> Self {
        self.weights = weights;
        self
    }

    async fn ask_role(&self, role: &str, task_description: &str, candidate_output: &str, cancel: CancellationToken) -> EvaluatorResult<ExpertResponse> {
        let req = ChatRequest {
            messages: vec![
                ChatMessage::system(format!(
                    "You are an expert reviewer specializing in {role}. Score the candidate output on dimensions relevant to your specialty (0.0-1.0) and list concrete suggestions."
                )),
                ChatMessage::user(format!("Task:\n{task_description}\n\nCandidate output:\n{candidate_output}")),
            ],
            model: self.model.clone(),
            max_tokens: Some(512),
            temperature: Some(0.0),
            response_schema: Some(schema()),
        };
        let resp = self.backend.chat(req, cancel).await?;
        serde_json::from_str(&resp.content).map_err(|e| EvaluatorError::MalformedOutput(e.to_string()))
    }
}

#[async_trait]
impl Evaluator for MultiExpertEvaluator {
    fn mode(&self) -> EvaluationMode {
        EvaluationMode::MultiExpert
    }

    async fn evaluate(&self, task_description: &str, candidate_output: &str, threshold: f64, cancel: CancellationToken) -> EvaluatorResult<Evaluation> {
        let calls = self.roles.iter().map(|role| self.ask_role(role, task_description, candidate_output, cancel.clone()));
        let responses: Vec<ExpertResponse> = join_all(calls).await.into_iter().collect::<EvaluatorResult<Vec<_>>>()?;

        let mut summed: HashMap<String, (f64, usize)> = HashMap::new();
        let mut suggestions = Vec::new();
        let mut seen_suggestions = std::collections::HashSet::new();
        for r in &responses {
            for (dim, score) in &r.dimension_scores {
                let entry = summed.entry(dim.clone()).or_insert((0.0, 0));
                entry.0 += score;
                entry.1 += 1;
            }
            for suggestion in &r.suggestions {
                let normalized = suggestion.trim().to_lowercase();
                if seen_suggestions.insert(normalized) {
                    suggestions.push(suggestion.clone());
                }
            }
        }
        let averaged: HashMap<String, f64> = summed.into_iter().map(|(k, (sum, n))| (k, sum / n as f64)).collect();
        let overall = self.weights.weighted_average(&averaged);

        Ok(Evaluation {
            overall_score: overall,
            needs_revision: overall < threshold,
            dimension_scores: averaged,
            suggestions,
            rewritten_content: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;

    #[tokio::test]
    async fn averages_scores_across_experts() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"dimension_scores": {"correctness": 1.0}, "suggestions": []}"#);
        backend.queue_response(r#"{"dimension_scores": {"correctness": 0.0}, "suggestions": []}"#);
        let evaluator = MultiExpertEvaluator::new(backend, "mock".into(), vec!["security".into(), "style".into()]);
        let eval = evaluator.evaluate("do X", "did X", crate::evaluate::DEFAULT_QUALITY_THRESHOLD, CancellationToken::new()).await.unwrap();
        assert!((eval.dimension_scores["correctness"] - 0.5).abs() < 1e-9);
    }
}
