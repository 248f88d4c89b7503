//! Adversarial evaluation: a critic tries to find fault, a rewriter
//! proposes a fix addressing those flaws, and a final rescore judges the
//! rewrite rather than the original candidate. Three backend round-trips
//! instead of one.

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
struct CritiqueResponse {
    flaws: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RewriteResponse {
    rewritten: String,
}

#[derive(Debug, Deserialize)]
struct RescoreResponse {
    dimension_scores: HashMap<String, f64>,
}

pub struct AdversarialEvaluator {
    backend: Arc<dyn LLMBackend>,
    model: String,
}

impl AdversarialEvaluator {
    pub fn new(backend: Arc<dyn LLMBackend>, model: String) -> Self {
        Self { backend, model }
    }

    async fn rescore(&self, task_description: &str, content: &str, flaws: &[String], cancel: CancellationToken) -> EvaluatorResult<RescoreResponse> {
        let rescore_schema = json!({
            "type": "object",
            "properties": { "dimension_scores": { "type": "object", "additionalProperties": { "type": "number" } } },
            "required": ["dimension_scores"]
        });
        let flaw_note = if flaws.is_empty() {
            "No flaws were found.".to_string()
        } else {
            format!("Flaws the critic raised against the prior draft:\n{}", flaws.join("\n"))
        };
        let rescore_req = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "Score the content per dimension (0.0-1.0): a severe, unaddressed flaw should pull its dimension's score down.",
                ),
                ChatMessage::user(format!("Task:\n{task_description}\n\nContent:\n{content}\n\n{flaw_note}")),
            ],
            model: self.model.clone(),
            max_tokens: Some(256),
            temperature: Some(0.0),
            response_schema: Some(rescore_schema),
        };
        let resp = self.backend.chat(rescore_req, cancel).await?;
        serde_json::from_str(&resp.content).map_err(|e| EvaluatorError::MalformedOutput(e.to_string()))
    }
}

fn mean_score(scores: &HashMap<String, f64>) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.values().sum::<f64>() / scores.len() as f64
    }
}

#[async_trait]
impl Evaluator for AdversarialEvaluator {
    fn mode(&self) -> EvaluationMode {
        EvaluationMode::Adversarial
    }

    async fn evaluate(&self, task_description: &str, candidate_output: &str, threshold: f64, cancel: CancellationToken) -> EvaluatorResult<Evaluation> {
        let critique_schema = json!({
            "type": "object",
            "properties": { "flaws": { "type": "array", "items": { "type": "string" } } },
            "required": ["flaws"]
        });
        let critique_req = ChatRequest {
            messages: vec![
                ChatMessage::system("You are a critic. Find every flaw in the candidate output relative to the task. List none if it's flawless."),
                ChatMessage::user(format!("Task:\n{task_description}\n\nCandidate output:\n{candidate_output}")),
            ],
            model: self.model.clone(),
            max_tokens: Some(512),
            temperature: Some(0.3),
            response_schema: Some(critique_schema),
        };
        let critique_resp = self.backend.chat(critique_req, cancel.clone()).await?;
        let critique: CritiqueResponse = serde_json::from_str(&critique_resp.content)
            .map_err(|e| EvaluatorError::MalformedOutput(e.to_string()))?;

        if critique.flaws.is_empty() {
            let rescore = self.rescore(task_description, candidate_output, &[], cancel).await?;
            let overall = mean_score(&rescore.dimension_scores);
            return Ok(Evaluation {
                overall_score: overall,
                needs_revision: overall < threshold,
                dimension_scores: rescore.dimension_scores,
                suggestions: Vec::new(),
                rewritten_content: None,
            });
        }

        let rewrite_schema = json!({
            "type": "object",
            "properties": { "rewritten": { "type": "string" } },
            "required": ["rewritten"]
        });
        let rewrite_req = ChatRequest {
            messages: vec![
                ChatMessage::system("You are a rewriter. Produce a revised version of the candidate output that addresses every flaw the critic found."),
                ChatMessage::user(format!(
                    "Task:\n{task_description}\n\nCandidate output:\n{candidate_output}\n\nFlaws to address:\n{}",
                    critique.flaws.join("\n")
                )),
            ],
            model: self.model.clone(),
            max_tokens: Some(2048),
            temperature: Some(0.4),
            response_schema: Some(rewrite_schema),
        };
        let rewrite_resp = self.backend.chat(rewrite_req, cancel.clone()).await?;
        let rewrite: RewriteResponse = serde_json::from_str(&rewrite_resp.content)
            .map_err(|e| EvaluatorError::MalformedOutput(e.to_string()))?;

        let rescore = self.rescore(task_description, &rewrite.rewritten, &critique.flaws, cancel).await?;
        let overall = mean_score(&rescore.dimension_scores);

        Ok(Evaluation {
            overall_score: overall,
            needs_revision: overall < threshold,
            dimension_scores: rescore.dimension_scores,
            suggestions: critique.flaws,
            rewritten_content: Some(rewrite.rewritten),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;

    #[tokio::test]
    async fn flawed_candidate_is_rewritten_and_rescored() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"flaws": ["missing edge case handling"]}"#);
        backend.queue_response(r#"{"rewritten": "did X, handling the edge case"}"#);
        backend.queue_response(r#"{"dimension_scores": {"correctness": 0.4}}"#);
        let evaluator = AdversarialEvaluator::new(backend, "mock".into());
        let eval = evaluator.evaluate("do X", "did X", crate::evaluate::DEFAULT_QUALITY_THRESHOLD, CancellationToken::new()).await.unwrap();
        assert!(eval.needs_revision);
        assert_eq!(eval.rewritten_content.as_deref(), Some("did X, handling the edge case"));
        assert_eq!(eval.suggestions, vec!["missing edge case handling".to_string()]);
    }

    #[tokio::test]
    async fn rewrite_that_resolves_flaws_is_accepted() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"flaws": ["missing edge case handling"]}"#);
        backend.queue_response(r#"{"rewritten": "did X, handling the edge case"}"#);
        backend.queue_response(r#"{"dimension_scores": {"correctness": 0.95}}"#);
        let evaluator = AdversarialEvaluator::new(backend, "mock".into());
        let eval = evaluator.evaluate("do X", "did X", crate::evaluate::DEFAULT_QUALITY_THRESHOLD, CancellationToken::new()).await.unwrap();
        assert!(!eval.needs_revision);
    }

    #[tokio::test]
    async fn no_flaws_and_high_score_accepts() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"flaws": []}"#);
        backend.queue_response(r#"{"dimension_scores": {"correctness": 0.95}}"#);
        let evaluator = AdversarialEvaluator::new(backend, "mock".into());
        let eval = evaluator.evaluate("do X", "did X", crate::evaluate::DEFAULT_QUALITY_THRESHOLD, CancellationToken::new()).await.unwrap();
        assert!(!eval.needs_revision);
        assert!(eval.rewritten_content.is_none());
    }
}
