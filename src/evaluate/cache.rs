//! Process-wide evaluation cache, keyed by `hash(task_id, content, mode,
//! options)` (§4.5). Wraps any `Evaluator` so repeated evaluation of an
//! unchanged candidate output — common when only a sibling task changed —
//! skips the backend entirely.

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Evaluation, Evaluator, EvaluatorResult};
use crate::store::EvaluationMode;

pub struct EvaluationCache<E: Evaluator> {
    inner: E,
    cache: Mutex<LruCache<String, Evaluation>>,
}

impl<E: Evaluator> EvaluationCache<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self { inner, cache: Mutex::new(LruCache::new(capacity)) }
    }

    fn key(&self, task_id: &str, content: &str, threshold: f64, options: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(task_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{:?}", self.inner.mode()).as_bytes());
        hasher.update([0u8]);
        hasher.update(threshold.to_bits().to_le_bytes());
        hasher.update([0u8]);
        hasher.update(options.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// `task_id`, `threshold`, and `options` participate in the cache key
    /// alongside the candidate text itself; `evaluate_cached` is the entry
    /// point callers should use instead of the plain `Evaluator::evaluate`.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate_cached(
        &self,
        task_id: &str,
        task_description: &str,
        candidate_output: &str,
        threshold: f64,
        options: &str,
        cancel: CancellationToken,
    ) -> EvaluatorResult<Evaluation> {
        let key = self.key(task_id, candidate_output, threshold, options);
        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return Ok(hit.clone());
        }
        let result = self.inner.evaluate(task_description, candidate_output, threshold, cancel).await?;
        self.cache.lock().unwrap().put(key, result.clone());
        Ok(result)
    }

    pub fn mode(&self) -> EvaluationMode {
        self.inner.mode()
    }
}

/// Lets an `EvaluationCache` drop straight into the `Arc<dyn Evaluator>`
/// seam the executor uses. The plain `Evaluator` trait has no `task_id` of
/// its own to key on, so the task description stands in for it — stable
/// enough in practice since two distinct tasks essentially never share one.
#[async_trait]
impl<E: Evaluator> Evaluator for EvaluationCache<E> {
    fn mode(&self) -> EvaluationMode {
        self.inner.mode()
    }

    async fn evaluate(&self, task_description: &str, candidate_output: &str, threshold: f64, cancel: CancellationToken) -> EvaluatorResult<Evaluation> {
        self.evaluate_cached(task_description, task_description, candidate_output, threshold, "", cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::single_judge::SingleJudgeEvaluator;
    use crate::providers::MockBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn identical_candidate_is_served_from_cache() {
        let backend = Arc::new(MockBackend::new());
        backend.queue_response(r#"{"dimension_scores": {"correctness": 0.9}, "suggestions": []}"#);
        let judge = SingleJudgeEvaluator::new(backend, "mock".into());
        let cached = EvaluationCache::new(judge, 16);

        let first = cached
            .evaluate_cached("task-1", "do X", "did X", super::super::DEFAULT_QUALITY_THRESHOLD, "{}", CancellationToken::new())
            .await
            .unwrap();
        // No second response was queued; a cache miss here would panic on
        // an empty queue inside the mock's echo fallback instead of erroring,
        // so a successful second call proves the cache was hit.
        let second = cached
            .evaluate_cached("task-1", "do X", "did X", super::super::DEFAULT_QUALITY_THRESHOLD, "{}", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.overall_score, second.overall_score);
    }
}
