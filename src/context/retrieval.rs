//! Semantic retrieval over embedded candidate text, brute-force cosine
//! similarity rather than an external vector-index crate — the candidate
//! set per task is small (siblings, dependencies, pinned notes), and a
//! deterministic in-process scan keeps `gather`/`apply_budget` byte-
//! identical given the same inputs, which an external index with its own
//! internal ordering would not guarantee.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::providers::{cosine_similarity, EmbedRequest, LLMBackend};

#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Embeds `query` and every candidate, ranks by cosine similarity, and
/// returns the top `k` above `min_similarity`. Ties break on `id` ascending
/// so the result order is deterministic.
pub async fn retrieve_top_k(
    backend: &Arc<dyn LLMBackend>,
    model: &str,
    query: &str,
    candidates: &[RetrievalCandidate],
    k: usize,
    min_similarity: f32,
    cancel: CancellationToken,
) -> Result<Vec<RetrievalHit>, crate::providers::BackendError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut inputs = vec![query.to_string()];
    inputs.extend(candidates.iter().map(|c| c.text.clone()));
    let embedded = backend
        .embed(EmbedRequest { model: model.to_string(), inputs }, cancel)
        .await?;

    let query_vec = &embedded.vectors[0];
    let mut hits: Vec<RetrievalHit> = candidates
        .iter()
        .zip(embedded.vectors[1..].iter())
        .map(|(c, v)| RetrievalHit { id: c.id.clone(), text: c.text.clone(), score: cosine_similarity(query_vec, v) })
        .filter(|h| h.score >= min_similarity)
        .collect();

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.id.cmp(&b.id)));
    hits.truncate(k);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;

    #[tokio::test]
    async fn ranks_candidates_by_similarity() {
        let backend: Arc<dyn LLMBackend> = Arc::new(MockBackend::new());
        let candidates = vec![
            RetrievalCandidate { id: "a".into(), text: "apples and oranges".into() },
            RetrievalCandidate { id: "b".into(), text: "apples and oranges".into() },
            RetrievalCandidate { id: "c".into(), text: "completely different topic xyz".into() },
        ];
        let hits = retrieve_top_k(&backend, "mock-embed", "apples and oranges", &candidates, 2, 0.0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.id == "a" || h.id == "b"));
    }

    #[tokio::test]
    async fn min_similarity_filters_weak_matches() {
        let backend: Arc<dyn LLMBackend> = Arc::new(MockBackend::new());
        let candidates = vec![RetrievalCandidate { id: "a".into(), text: "zzz".into() }];
        let hits = retrieve_top_k(&backend, "mock-embed", "apples", &candidates, 5, 0.99, CancellationToken::new())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
