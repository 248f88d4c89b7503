//! The language model backend seam (C-LLM). Generalizes the reference
//! `LLMProvider` trait into the single contract every collaborator in this
//! crate — decomposer, evaluators, context assembler — talks to.

pub mod cache;
pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use cache::EmbeddingCache;
pub use http::HttpBackend;
pub use mock::MockBackend;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// When set, the backend is asked to return JSON matching this schema.
    /// Used by the decomposer and evaluators for structured output.
    pub response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: u32,
}

#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub model: String,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub model: String,
    pub supports_embeddings: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend request cancelled")]
    Cancelled,
    #[error("backend returned malformed output: {0}")]
    MalformedOutput(String),
    #[error("backend rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A language model backend. Implementors must be cancellation-aware: a
/// cancelled token must abort in-flight work promptly rather than merely
/// discard the result.
#[async_trait]
pub trait LLMBackend: Send + Sync {
    async fn chat(&self, req: ChatRequest, cancel: CancellationToken) -> BackendResult<ChatResponse>;

    async fn embed(&self, req: EmbedRequest, cancel: CancellationToken) -> BackendResult<EmbedResponse>;

    /// Cheap liveness check, used by health endpoints and startup checks.
    async fn ping(&self) -> BackendResult<()>;

    fn info(&self) -> BackendInfo;
}

/// Computes cosine similarity between two equal-length embedding vectors.
/// Returns 0.0 for zero-magnitude vectors rather than dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_similarity_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_is_handled_without_panic() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }
}
