//! Generic HTTP backend for `LLM_BACKEND_URL`. Speaks a minimal
//! `POST /chat` / `POST /embed` contract (OpenAI-compatible bodies) over
//! `reqwest`, the way the reference `OpenAIProvider` does, generalized to a
//! configurable base URL rather than one baked-in vendor.
//!
//! Retries follow `LLM_RETRIES` / `LLM_BACKOFF_BASE` with exponential
//! backoff; a token-bucket limits outbound request rate so a burst of
//! concurrent tasks doesn't all hammer the backend at once.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BackendError, BackendInfo, BackendResult, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, LLMBackend};

#[derive(Debug, Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: &'a [super::ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    content: String,
    #[serde(default)]
    tokens_used: u32,
}

#[derive(Debug, Serialize)]
struct WireEmbedRequest<'a> {
    model: &'a str,
    inputs: &'a [String],
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    vectors: Vec<Vec<f32>>,
}

/// Cooperative token bucket: callers await a slot before issuing a request,
/// refilled by a background tick. Bounds outbound request rate without a
/// hard queue depth limit.
struct RateLimiter {
    tokens: Mutex<f64>,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Mutex<std::time::Instant>,
}

impl RateLimiter {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: Mutex::new(capacity),
            capacity,
            refill_per_sec,
            last_refill: Mutex::new(std::time::Instant::now()),
        }
    }

    async fn acquire(&self) {
        loop {
            {
                let mut tokens = self.tokens.lock().await;
                let mut last = self.last_refill.lock().await;
                let elapsed = last.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.refill_per_sec).min(self.capacity);
                *last = std::time::Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    model: String,
    embedding_model: String,
    retries: u32,
    backoff_base_ms: u64,
    limiter: Arc<RateLimiter>,
}

impl HttpBackend {
    pub fn new(base_url: String, api_key: Option<String>, model: String, embedding_model: String, retries: u32, backoff_base_ms: u64) -> BackendResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            model,
            embedding_model,
            retries,
            backoff_base_ms,
            limiter: Arc::new(RateLimiter::new(4.0, 2.0)),
        })
    }

    async fn with_retries<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = BackendResult<T>>,
    {
        let mut last_err = BackendError::Unavailable("no attempts made".into());
        for n in 0..=self.retries {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            self.limiter.acquire().await;
            // Race the call itself against cancellation so a token cancelled
            // mid-request aborts it immediately rather than only being
            // noticed at the next retry boundary.
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                res = attempt() => res,
            };
            match outcome {
                Ok(v) => return Ok(v),
                Err(BackendError::RateLimited { retry_after_ms }) => {
                    warn!(attempt = n, retry_after_ms, "backend rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                    last_err = BackendError::RateLimited { retry_after_ms };
                }
                Err(e) => {
                    let backoff = self.backoff_base_ms * 2u64.saturating_pow(n);
                    debug!(attempt = n, backoff_ms = backoff, error = %e, "backend call failed, retrying");
                    last_err = e;
                    if n < self.retries {
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl LLMBackend for HttpBackend {
    async fn chat(&self, req: ChatRequest, cancel: CancellationToken) -> BackendResult<ChatResponse> {
        let url = format!("{}/chat", self.base_url.trim_end_matches('/'));
        let wire = WireChatRequest {
            model: &req.model,
            messages: &req.messages,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            response_schema: req.response_schema.as_ref(),
        };

        self.with_retries(&cancel, || async {
            let resp = self
                .client
                .post(&url)
                .json(&wire)
                .send()
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;

            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after_ms = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|secs| secs * 1000)
                    .unwrap_or(1000);
                return Err(BackendError::RateLimited { retry_after_ms });
            }
            if !resp.status().is_success() {
                return Err(BackendError::Unavailable(format!("status {}", resp.status())));
            }
            let body: WireChatResponse = resp
                .json()
                .await
                .map_err(|e| BackendError::MalformedOutput(e.to_string()))?;
            Ok(ChatResponse {
                content: body.content,
                model: req.model.clone(),
                tokens_used: body.tokens_used,
            })
        })
        .await
    }

    async fn embed(&self, req: EmbedRequest, cancel: CancellationToken) -> BackendResult<EmbedResponse> {
        let url = format!("{}/embed", self.base_url.trim_end_matches('/'));
        let wire = WireEmbedRequest { model: &req.model, inputs: &req.inputs };

        self.with_retries(&cancel, || async {
            let resp = self
                .client
                .post(&url)
                .json(&wire)
                .send()
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(BackendError::Unavailable(format!("status {}", resp.status())));
            }
            let body: WireEmbedResponse = resp
                .json()
                .await
                .map_err(|e| BackendError::MalformedOutput(e.to_string()))?;
            Ok(EmbedResponse { vectors: body.vectors })
        })
        .await
    }

    async fn ping(&self) -> BackendResult<()> {
        let url = format!("{}/health", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!("status {}", resp.status())))
        }
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "http".to_string(),
            model: self.model.clone(),
            supports_embeddings: !self.embedding_model.is_empty(),
        }
    }
}
