//! Optional cross-plan memory (C7). Notes saved here outlive any single
//! plan and are retrieved by semantic similarity, the same way the context
//! assembler ranks sibling/dependency text, so a task can learn from what
//! similar tasks in other plans produced. File-index-plus-entity layout
//! follows the reference `ConversationStorage`: one JSON index plus one
//! file per entry, rather than a relational store, since entries are
//! append-mostly and rarely queried by anything but similarity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::providers::{cosine_similarity, EmbedRequest, LLMBackend};

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(#[from] crate::providers::BackendError),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub text: String,
    pub tags: Vec<String>,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Persists notes a plan's run wants remembered beyond the plan's own
/// lifetime (e.g. a recurring mistake an evaluator keeps flagging).
pub struct Memory {
    dir: PathBuf,
    backend: Arc<dyn LLMBackend>,
    embedding_model: String,
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl Memory {
    pub async fn open(dir: impl AsRef<Path>, backend: Arc<dyn LLMBackend>, embedding_model: String) -> MemoryResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let index_path = dir.join("index.json");
        let entries = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        Ok(Self { dir, backend, embedding_model, entries: RwLock::new(entries) })
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    async fn persist_index(&self) -> MemoryResult<()> {
        let entries = self.entries.read().await;
        let content = serde_json::to_string_pretty(&*entries)?;
        std::fs::write(self.index_path(), content)?;
        Ok(())
    }

    /// Saves a note, embedding it immediately so later queries don't pay
    /// the embedding cost again.
    pub async fn save(&self, text: &str, tags: Vec<String>, cancel: CancellationToken) -> MemoryResult<MemoryEntry> {
        let embedded = self
            .backend
            .embed(EmbedRequest { model: self.embedding_model.clone(), inputs: vec![text.to_string()] }, cancel)
            .await?;
        let entry = MemoryEntry {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            tags,
            embedding: embedded.vectors.into_iter().next().unwrap_or_default(),
            created_at: Utc::now(),
        };
        self.entries.write().await.insert(entry.id.clone(), entry.clone());
        self.persist_index().await?;
        debug!(memory_id = %entry.id, "saved memory entry");
        Ok(entry)
    }

    /// Returns the `k` most similar entries to `query`, optionally
    /// restricted to entries carrying at least one of `tags`.
    pub async fn query(&self, query: &str, tags: &[String], k: usize, cancel: CancellationToken) -> MemoryResult<Vec<MemoryHit>> {
        let entries = self.entries.read().await;
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let embedded = self
            .backend
            .embed(EmbedRequest { model: self.embedding_model.clone(), inputs: vec![query.to_string()] }, cancel)
            .await?;
        let query_vec = embedded.vectors.into_iter().next().unwrap_or_default();

        let mut hits: Vec<MemoryHit> = entries
            .values()
            .filter(|e| tags.is_empty() || e.tags.iter().any(|t| tags.contains(t)))
            .map(|e| MemoryHit { id: e.id.clone(), text: e.text.clone(), score: cosine_similarity(&query_vec, &e.embedding) })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockBackend;

    #[tokio::test]
    async fn save_then_query_finds_similar_entry() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn LLMBackend> = Arc::new(MockBackend::new());
        let memory = Memory::open(dir.path(), backend, "mock-embed".into()).await.unwrap();
        memory.save("always validate input before parsing", vec!["lesson".into()], CancellationToken::new()).await.unwrap();

        let hits = memory.query("validate input before parsing", &[], 5, CancellationToken::new()).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn tag_filter_excludes_untagged_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn LLMBackend> = Arc::new(MockBackend::new());
        let memory = Memory::open(dir.path(), backend, "mock-embed".into()).await.unwrap();
        memory.save("note one", vec!["a".into()], CancellationToken::new()).await.unwrap();
        memory.save("note two", vec!["b".into()], CancellationToken::new()).await.unwrap();

        let hits = memory.query("note", &["a".to_string()], 5, CancellationToken::new()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "note one");
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn LLMBackend> = Arc::new(MockBackend::new());
        {
            let memory = Memory::open(dir.path(), backend.clone(), "mock-embed".into()).await.unwrap();
            memory.save("persisted note", vec![], CancellationToken::new()).await.unwrap();
        }
        let reopened = Memory::open(dir.path(), backend, "mock-embed".into()).await.unwrap();
        let hits = reopened.query("persisted note", &[], 5, CancellationToken::new()).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
