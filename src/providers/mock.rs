//! Deterministic backend used by the default `LLM_MOCK=1` configuration and
//! by every test in this crate. Mirrors the reference `MockProvider`'s
//! queued-response pattern, generalized to also answer `embed`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{BackendError, BackendInfo, BackendResult, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, LLMBackend};

#[derive(Debug, Clone)]
pub struct MockChatResponse {
    pub content: String,
    pub tokens_used: u32,
}

/// Queues pre-programmed chat responses; falls back to an echo of the last
/// user message once the queue is drained. Embeddings are a deterministic
/// hash-based projection so that identical inputs always produce identical
/// vectors without a real embedding model.
pub struct MockBackend {
    model: String,
    responses: Mutex<VecDeque<MockChatResponse>>,
    embed_dims: usize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            model: "mock".to_string(),
            responses: Mutex::new(VecDeque::new()),
            embed_dims: 16,
        }
    }

    pub fn with_model(model: impl Into<String>) -> Self {
        Self { model: model.into(), ..Self::new() }
    }

    pub fn queue_response(&self, content: impl Into<String>) {
        self.responses.lock().unwrap().push_back(MockChatResponse {
            content: content.into(),
            tokens_used: 0,
        });
    }

    fn next_response(&self, req: &ChatRequest) -> MockChatResponse {
        if let Some(r) = self.responses.lock().unwrap().pop_front() {
            return r;
        }
        let echo = req
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        MockChatResponse {
            content: format!("acknowledged: {echo}"),
            tokens_used: echo.split_whitespace().count() as u32,
        }
    }

    /// Projects text into a fixed-dimension vector deterministically: each
    /// dimension accumulates a byte-weighted hash of the input so cosine
    /// similarity reflects lexical overlap well enough for tests and offline
    /// development, without pulling in a real embedding model.
    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.embed_dims];
        for (i, byte) in text.bytes().enumerate() {
            let slot = i % self.embed_dims;
            v[slot] += (byte as f32 + 1.0) * 0.01;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMBackend for MockBackend {
    async fn chat(&self, req: ChatRequest, cancel: CancellationToken) -> BackendResult<ChatResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            () = tokio::task::yield_now() => {
                let response = self.next_response(&req);
                Ok(ChatResponse {
                    content: response.content,
                    model: self.model.clone(),
                    tokens_used: response.tokens_used,
                })
            }
        }
    }

    async fn embed(&self, req: EmbedRequest, cancel: CancellationToken) -> BackendResult<EmbedResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            () = tokio::task::yield_now() => {
                let vectors = req.inputs.iter().map(|t| self.embed_one(t)).collect();
                Ok(EmbedResponse { vectors })
            }
        }
    }

    async fn ping(&self) -> BackendResult<()> {
        Ok(())
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "mock".to_string(),
            model: self.model.clone(),
            supports_embeddings: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatMessage, cosine_similarity};

    #[tokio::test]
    async fn queued_response_is_returned_in_order() {
        let backend = MockBackend::new();
        backend.queue_response("first");
        backend.queue_response("second");
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: "mock".into(),
            max_tokens: None,
            temperature: None,
            response_schema: None,
        };
        let r1 = backend.chat(req.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(r1.content, "first");
        let r2 = backend.chat(req, CancellationToken::new()).await.unwrap();
        assert_eq!(r2.content, "second");
    }

    #[tokio::test]
    async fn identical_text_embeds_identically() {
        let backend = MockBackend::new();
        let req = EmbedRequest { model: "mock-embed".into(), inputs: vec!["same text".into(), "same text".into()] };
        let res = backend.embed(req, CancellationToken::new()).await.unwrap();
        assert_eq!(res.vectors[0], res.vectors[1]);
        assert!(cosine_similarity(&res.vectors[0], &res.vectors[1]) > 0.99);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_chat() {
        let backend = MockBackend::new();
        let token = CancellationToken::new();
        token.cancel();
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: "mock".into(),
            max_tokens: None,
            temperature: None,
            response_schema: None,
        };
        let err = backend.chat(req, token).await.unwrap_err();
        assert!(matches!(err, BackendError::Cancelled));
    }
}
