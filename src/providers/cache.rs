//! Process-wide embedding cache. Wraps any `LLMBackend` and memoizes
//! `embed()` results by a content hash of (model, text), so repeated
//! context-assembly passes over the same task tree don't re-embed text
//! that hasn't changed.

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{BackendInfo, BackendResult, ChatRequest, ChatResponse, EmbedRequest, EmbedResponse, LLMBackend};

pub struct EmbeddingCache<B: LLMBackend + ?Sized> {
    inner: Arc<B>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<B: LLMBackend + ?Sized> EmbeddingCache<B> {
    pub fn new(inner: Arc<B>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { inner, cache: Mutex::new(LruCache::new(capacity)) }
    }

    fn key(model: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl<B: LLMBackend + ?Sized> LLMBackend for EmbeddingCache<B> {
    async fn chat(&self, req: ChatRequest, cancel: CancellationToken) -> BackendResult<ChatResponse> {
        self.inner.chat(req, cancel).await
    }

    async fn embed(&self, req: EmbedRequest, cancel: CancellationToken) -> BackendResult<EmbedResponse> {
        let mut vectors = Vec::with_capacity(req.inputs.len());
        let mut misses: Vec<(usize, String)> = Vec::new();

        {
            let mut cache = self.cache.lock().unwrap();
            for (i, text) in req.inputs.iter().enumerate() {
                let key = Self::key(&req.model, text);
                match cache.get(&key) {
                    Some(v) => vectors.push(Some(v.clone())),
                    None => {
                        vectors.push(None);
                        misses.push((i, text.clone()));
                    }
                }
            }
        }

        if !misses.is_empty() {
            let miss_req = EmbedRequest {
                model: req.model.clone(),
                inputs: misses.iter().map(|(_, t)| t.clone()).collect(),
            };
            let fetched = self.inner.embed(miss_req, cancel).await?;
            let mut cache = self.cache.lock().unwrap();
            for ((i, text), vector) in misses.into_iter().zip(fetched.vectors.into_iter()) {
                let key = Self::key(&req.model, &text);
                cache.put(key, vector.clone());
                vectors[i] = Some(vector);
            }
        }

        Ok(EmbedResponse { vectors: vectors.into_iter().map(|v| v.unwrap()).collect() })
    }

    async fn ping(&self) -> BackendResult<()> {
        self.inner.ping().await
    }

    fn info(&self) -> BackendInfo {
        self.inner.info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;

    #[tokio::test]
    async fn repeated_text_is_served_from_cache() {
        let backend = Arc::new(MockBackend::new());
        let cache = EmbeddingCache::new(backend, 16);
        let req = EmbedRequest { model: "mock-embed".into(), inputs: vec!["hello".into()] };
        let r1 = cache.embed(req.clone(), CancellationToken::new()).await.unwrap();
        let r2 = cache.embed(req, CancellationToken::new()).await.unwrap();
        assert_eq!(r1.vectors, r2.vectors);
    }

    #[tokio::test]
    async fn distinct_models_do_not_collide() {
        let backend = Arc::new(MockBackend::new());
        let cache = EmbeddingCache::new(backend, 16);
        let a = cache
            .embed(EmbedRequest { model: "model-a".into(), inputs: vec!["x".into()] }, CancellationToken::new())
            .await
            .unwrap();
        let b = cache
            .embed(EmbedRequest { model: "model-b".into(), inputs: vec!["x".into()] }, CancellationToken::new())
            .await
            .unwrap();
        // Same underlying mock projection regardless of model name, but the
        // cache must still key on model so swapping models invalidates reuse.
        assert_eq!(a.vectors, b.vectors);
    }
}
