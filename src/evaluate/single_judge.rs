//! Single-judge evaluation: one backend call scores the output directly.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Evaluation, Evaluator, EvaluatorError, EvaluatorResult};
use crate::providers::{ChatMessage, ChatRequest, LLMBackend};
use crate::store::EvaluationMode;

#[derive(Debug, Deserialize)]
struct JudgeResponse {
    dimension_scores: HashMap<String, f64>,
    suggestions: Vec<String>,
}

pub struct SingleJudgeEvaluator {
    backend: Arc<dyn LLMBackend>,
    model: String,
}

impl SingleJudgeEvaluator {
    pub fn new(backend: Arc<dyn LLMBackend>, model: String) -> Self {
        Self { backend, model }
    }
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

#[async_trait]
impl Evaluator for SingleJudgeEvaluator {
    fn mode(&self) -> EvaluationMode {
        EvaluationMode::SingleJudge
    }

    async fn evaluate(&self, task_description: &str, candidate_output: &str, threshold: f64, cancel: CancellationToken) -> EvaluatorResult<Evaluation> {
        let req = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "Score the candidate output against the task on each relevant dimension (0.0-1.0) and list concrete suggestions for improvement.",
                ),
                ChatMessage::user(format!("Task:\n{task_description}\n\nCandidate output:\n{candidate_output}")),
            ],
            model: self.model.clone(),
            max_tokens: Some(512),
            temperature: Some(0.0),
            response_schema: Some(schema()),
        };
        let resp = self.backend.chat(req, cancel).await?;
        let parsed: JudgeResponse = serde_json::from_str(&resp.content)
            .map_err(|e| EvaluatorError::MalformedOutput(e.to_string()))?;

        let overall = if parsed.dimension_scores.is_empty() {
            0.0
        } else {
            parsed.dimension_scores.values().sum::<f64>() / parsed.dimension_scores.len() as f64
        };

        Ok(Evaluation {
            overall_score: overall,
            needs_revision: overall < threshold,
            dimension_scores: parsed.dimension_scores,
            suggestions: parsed.suggestions,
            rewritten_content: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;

    #[tokio::test]
    async fn low_score_requests_revision() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"dimension_scores": {"correctness": 0.3}, "suggestions": ["be more precise"]}"#);
        let judge = SingleJudgeEvaluator::new(backend, "mock".into());
        let eval = judge.evaluate("do X", "did Y", crate::evaluate::DEFAULT_QUALITY_THRESHOLD, CancellationToken::new()).await.unwrap();
        assert!(eval.needs_revision);
        assert_eq!(eval.suggestions.len(), 1);
    }

    #[tokio::test]
    async fn high_score_accepts() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"dimension_scores": {"correctness": 0.95}, "suggestions": []}"#);
        let judge = SingleJudgeEvaluator::new(backend, "mock".into());
        let eval = judge.evaluate("do X", "did X", crate::evaluate::DEFAULT_QUALITY_THRESHOLD, CancellationToken::new()).await.unwrap();
        assert!(!eval.needs_revision);
    }
}
