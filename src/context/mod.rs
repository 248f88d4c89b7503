//! Context assembly under budget (C4, §4.4). Gathers candidate sections
//! from every source the spec names, ranks them into priority tiers,
//! greedily fills a character budget with deterministic tie-breaks, and
//! snapshots the result so a later run can cite exactly what a task saw.

pub mod retrieval;

use regex::Regex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::providers::LLMBackend;
use crate::store::{ContextSnapshot, LinkKind, SectionKind, SectionMeta, Store, StoreResult, Task, TruncatedReason};
use retrieval::{retrieve_top_k, RetrievalCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationStrategy {
    None,
    Truncate,
    Sentence,
}

/// A candidate section before budgeting: text plus enough metadata to rank
/// and, later, describe it in a snapshot.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source_id: String,
    pub kind: SectionKind,
    pub text: String,
    pub score: Option<f32>,
}

/// Lower tiers are preferred when the budget runs out. Mirrors the order
/// in §4.2: index, then `requires` dependencies, then siblings, then
/// semantically retrieved text, then memory (placed between retrieved and
/// refers), then `refers` dependencies, then manual pins.
fn tier_rank(kind: SectionKind) -> i64 {
    match kind {
        SectionKind::Index => 0,
        SectionKind::DepRequires => 1,
        SectionKind::Sibling => 2,
        SectionKind::Retrieved => 3,
        SectionKind::Memory => 4,
        SectionKind::DepRefers => 5,
        SectionKind::Manual => 6,
    }
}

/// §4.2 `gather` options, all optional with documented defaults. A task's
/// executor and the `/tasks/{id}/context/preview` handler both build one of
/// these and hand it to `Assembler::gather`.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub include_index: bool,
    pub include_deps: bool,
    pub include_plan_siblings: bool,
    pub include_retrieved: bool,
    pub k_per_category: Option<usize>,
    pub retrieval_k: usize,
    pub retrieval_min_similarity: f32,
    pub retrieval_max_candidates: usize,
    pub manual_ids: Vec<String>,
    pub budget_total_chars: Option<usize>,
    pub budget_per_section_chars: Option<usize>,
    pub summarization_strategy: TruncationStrategy,
    pub save_snapshot: bool,
    pub label: String,
    pub use_memory: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            include_index: true,
            include_deps: true,
            include_plan_siblings: true,
            include_retrieved: true,
            k_per_category: None,
            retrieval_k: 5,
            retrieval_min_similarity: 0.2,
            retrieval_max_candidates: 50,
            manual_ids: Vec::new(),
            budget_total_chars: None,
            budget_per_section_chars: None,
            summarization_strategy: TruncationStrategy::Sentence,
            save_snapshot: false,
            label: "default".to_string(),
            use_memory: false,
        }
    }
}

pub struct Assembler {
    store: Arc<Store>,
    backend: Arc<dyn LLMBackend>,
    embedding_model: String,
    semantic_default_k: usize,
    semantic_min_similarity: f32,
}

impl Assembler {
    pub fn new(store: Arc<Store>, backend: Arc<dyn LLMBackend>, embedding_model: String, semantic_default_k: usize, semantic_min_similarity: f32) -> Self {
        Self { store, backend, embedding_model, semantic_default_k, semantic_min_similarity }
    }

    /// `ContextOptions` seeded with this assembler's configured retrieval
    /// defaults rather than the struct's hardcoded fallbacks.
    pub fn default_options(&self) -> ContextOptions {
        ContextOptions { retrieval_k: self.semantic_default_k, retrieval_min_similarity: self.semantic_min_similarity, ..ContextOptions::default() }
    }

    /// Gathers every candidate section for `task_id`: the task's own
    /// index/description, its `requires` and `refers` dependencies, its
    /// siblings, semantically retrieved sibling/dependency text, manual
    /// pins resolved from `options.manual_ids`, and whatever
    /// `memory_candidates` the caller supplies (only consulted when
    /// `options.use_memory` is set).
    pub async fn gather(
        &self,
        plan_id: &str,
        task: &Task,
        options: &ContextOptions,
        memory_candidates: &[(String, String)],
        cancel: CancellationToken,
    ) -> StoreResult<Vec<Candidate>> {
        let mut candidates = Vec::new();
        let task_input = self.store.get_input(plan_id, &task.id).await?.unwrap_or_default();

        if options.include_index {
            candidates.push(Candidate {
                source_id: task.id.clone(),
                kind: SectionKind::Index,
                text: format!("{}\n{}", task.name, task_input),
                score: None,
            });
        }

        let mut retrieval_pool: Vec<RetrievalCandidate> = Vec::new();

        if options.include_deps {
            let deps = self.store.list_dependencies(plan_id, &task.id).await?;
            let deps = take_per_category(deps, options.k_per_category);
            for (dep_task, kind) in &deps {
                let output = self.store.get_output(plan_id, &dep_task.id).await?;
                let text = output.map(|o| o.content).unwrap_or_else(|| dep_task.name.clone());
                let section_kind = match kind {
                    LinkKind::Requires => SectionKind::DepRequires,
                    _ => SectionKind::DepRefers,
                };
                retrieval_pool.push(RetrievalCandidate { id: dep_task.id.clone(), text: text.clone() });
                candidates.push(Candidate { source_id: dep_task.id.clone(), kind: section_kind, text, score: None });
            }
        }

        if options.include_plan_siblings {
            let siblings = take_per_category(self.store.siblings(plan_id, &task.id).await?, options.k_per_category);
            for sibling in &siblings {
                let output = self.store.get_output(plan_id, &sibling.id).await?;
                let text = output.map(|o| o.content).unwrap_or_else(|| sibling.name.clone());
                retrieval_pool.push(RetrievalCandidate { id: sibling.id.clone(), text: text.clone() });
                candidates.push(Candidate { source_id: sibling.id.clone(), kind: SectionKind::Sibling, text, score: None });
            }
        }

        if options.include_retrieved && !retrieval_pool.is_empty() {
            retrieval_pool.truncate(options.retrieval_max_candidates.max(1));
            let query = format!("{}\n{}", task.name, task_input);
            let hits = retrieve_top_k(
                &self.backend,
                &self.embedding_model,
                &query,
                &retrieval_pool,
                options.retrieval_k,
                options.retrieval_min_similarity,
                cancel,
            )
            .await
            .map_err(|e| crate::store::StoreError::Unavailable(e.to_string()))?;
            for hit in hits {
                candidates.push(Candidate {
                    source_id: hit.id,
                    kind: SectionKind::Retrieved,
                    text: hit.text,
                    score: Some(hit.score),
                });
            }
        }

        for id in &options.manual_ids {
            if let Ok(Some(output)) = self.store.get_output(plan_id, id).await {
                candidates.push(Candidate { source_id: id.clone(), kind: SectionKind::Manual, text: output.content, score: None });
            } else if let Ok(Some(input)) = self.store.get_input(plan_id, id).await {
                candidates.push(Candidate { source_id: id.clone(), kind: SectionKind::Manual, text: input, score: None });
            }
        }
        if options.use_memory {
            for (id, text) in memory_candidates {
                candidates.push(Candidate { source_id: id.clone(), kind: SectionKind::Memory, text: text.clone(), score: None });
            }
        }

        Ok(candidates)
    }

    /// Greedily fills the budget in tier order, then `source_id` ascending
    /// within a tier for a fully deterministic result (§4.2: ties are
    /// broken purely by id, not by score).
    /// `budget_per_section_chars` caps any single section; `budget_total_chars`
    /// caps the sum across all sections. Either, both, or neither may be set
    /// (§4.2): with neither set the bundle is returned unbounded. A section
    /// is truncated per `strategy` when it doesn't fit whole and there's
    /// still room for a meaningfully sized piece of it, otherwise dropped.
    /// `truncated_reason` records which cap (if any) forced the cut.
    pub fn apply_budget(
        candidates: &[Candidate],
        budget_total_chars: Option<usize>,
        budget_per_section_chars: Option<usize>,
        strategy: TruncationStrategy,
    ) -> (String, Vec<SectionMeta>) {
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| tier_rank(a.kind).cmp(&tier_rank(b.kind)).then(a.source_id.cmp(&b.source_id)));

        let mut remaining_total = budget_total_chars;
        let mut combined = String::new();
        let mut sections = Vec::new();

        for candidate in ordered {
            if remaining_total == Some(0) {
                break;
            }

            let mut text = candidate.text.clone();
            let mut truncated_per_section = false;
            if let Some(cap) = budget_per_section_chars {
                if text.len() > cap {
                    if strategy == TruncationStrategy::None {
                        continue;
                    }
                    text = truncate_text(&text, cap, strategy);
                    truncated_per_section = true;
                }
            }

            let mut truncated_total = false;
            if let Some(rem) = remaining_total {
                if text.len() > rem {
                    if strategy == TruncationStrategy::None {
                        continue;
                    }
                    text = truncate_text(&text, rem, strategy);
                    truncated_total = true;
                }
            }

            let reason = match (truncated_per_section, truncated_total) {
                (true, true) => TruncatedReason::Both,
                (true, false) => TruncatedReason::PerSection,
                (false, true) => TruncatedReason::Total,
                (false, false) => TruncatedReason::None,
            };

            if !combined.is_empty() {
                combined.push_str("\n\n");
            }
            combined.push_str(&text);
            if let Some(rem) = remaining_total.as_mut() {
                *rem = rem.saturating_sub(text.len());
            }

            sections.push(SectionMeta {
                source_id: candidate.source_id.clone(),
                kind: candidate.kind,
                priority_tier: tier_rank(candidate.kind),
                length: text.len(),
                truncated_reason: reason,
                score: candidate.score,
            });
        }

        (combined, sections)
    }

    /// Runs `gather` + `apply_budget` and idempotently persists the result
    /// as a snapshot under `options.label` (re-saving with the same label
    /// replaces the prior content rather than appending a duplicate), but
    /// only when `options.save_snapshot` is set.
    pub async fn gather_and_snapshot(
        &self,
        plan_id: &str,
        task: &Task,
        options: &ContextOptions,
        memory_candidates: &[(String, String)],
        cancel: CancellationToken,
    ) -> StoreResult<(String, Vec<SectionMeta>)> {
        let candidates = self.gather(plan_id, task, options, memory_candidates, cancel).await?;
        let (combined, sections) =
            Self::apply_budget(&candidates, options.budget_total_chars, options.budget_per_section_chars, options.summarization_strategy);
        if options.save_snapshot {
            self.store
                .save_snapshot(plan_id, &task.id, &options.label, &combined, &sections, serde_json::json!({}))
                .await?;
        }
        Ok((combined, sections))
    }
}

/// Caps each dependency/sibling category to its first `k` entries (by the
/// store's own ordering) when `k_per_category` is set; a no-op otherwise.
fn take_per_category<T>(mut items: Vec<T>, k_per_category: Option<usize>) -> Vec<T> {
    if let Some(k) = k_per_category {
        items.truncate(k);
    }
    items
}

/// Truncates `text` to at most `max_len` bytes. `Sentence` backs off to the
/// last sentence boundary (`.`, `!`, `?` followed by whitespace) inside the
/// limit when one exists; `Truncate` cuts at a UTF-8-safe char boundary.
fn truncate_text(text: &str, max_len: usize, strategy: TruncationStrategy) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut cut = max_len;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let hard_cut = &text[..cut];

    if strategy == TruncationStrategy::Sentence {
        let boundary_re = Regex::new(r"[.!?]\s").unwrap();
        if let Some(m) = boundary_re.find_iter(hard_cut).last() {
            return text[..m.end()].trim_end().to_string();
        }
    }
    hard_cut.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, kind: SectionKind, text: &str) -> Candidate {
        Candidate { source_id: id.to_string(), kind, text: text.to_string(), score: None }
    }

    #[test]
    fn budget_respects_tier_order() {
        let candidates = vec![
            candidate("sib", SectionKind::Sibling, "sibling text"),
            candidate("idx", SectionKind::Index, "index text"),
        ];
        let (combined, sections) = Assembler::apply_budget(&candidates, Some(1000), None, TruncationStrategy::Truncate);
        assert!(combined.find("index text").unwrap() < combined.find("sibling text").unwrap());
        assert_eq!(sections[0].source_id, "idx");
    }

    #[test]
    fn tight_budget_truncates_per_section() {
        let candidates = vec![candidate("idx", SectionKind::Index, &"x".repeat(200))];
        let (combined, sections) = Assembler::apply_budget(&candidates, Some(50), None, TruncationStrategy::Truncate);
        assert_eq!(combined.len(), 50);
        assert_eq!(sections[0].truncated_reason, TruncatedReason::Total);
    }

    #[test]
    fn none_strategy_drops_oversized_sections_instead_of_cutting() {
        let candidates = vec![candidate("idx", SectionKind::Index, &"x".repeat(200))];
        let (combined, sections) = Assembler::apply_budget(&candidates, Some(50), None, TruncationStrategy::None);
        assert!(combined.is_empty());
        assert!(sections.is_empty());
    }

    #[test]
    fn per_section_and_total_caps_combine_into_both() {
        // Three 500-char sections, a 400-char per-section cap, and a
        // 1000-char total cap: the first two sections each cost 400
        // (reason `per_section`), leaving 200 for the third, which is
        // truncated a second time by the total cap (reason `both`).
        let candidates = vec![
            candidate("a", SectionKind::DepRequires, &"a".repeat(500)),
            candidate("b", SectionKind::Sibling, &"b".repeat(500)),
            candidate("c", SectionKind::Retrieved, &"c".repeat(500)),
        ];
        let (_, sections) = Assembler::apply_budget(&candidates, Some(1000), Some(400), TruncationStrategy::Truncate);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].truncated_reason, TruncatedReason::PerSection);
        assert_eq!(sections[0].length, 400);
        assert_eq!(sections[1].truncated_reason, TruncatedReason::PerSection);
        assert_eq!(sections[1].length, 400);
        assert_eq!(sections[2].truncated_reason, TruncatedReason::Both);
        assert_eq!(sections[2].length, 200);
    }

    #[test]
    fn no_budget_returns_every_candidate_unbounded() {
        let candidates = vec![candidate("idx", SectionKind::Index, &"x".repeat(10_000))];
        let (combined, sections) = Assembler::apply_budget(&candidates, None, None, TruncationStrategy::Truncate);
        assert_eq!(combined.len(), 10_000);
        assert_eq!(sections[0].truncated_reason, TruncatedReason::None);
    }

    #[test]
    fn tie_breaks_on_source_id_ascending() {
        let candidates = vec![
            candidate("b", SectionKind::Sibling, "b text"),
            candidate("a", SectionKind::Sibling, "a text"),
        ];
        let (combined, _) = Assembler::apply_budget(&candidates, Some(1000), None, TruncationStrategy::Truncate);
        assert!(combined.find("a text").unwrap() < combined.find("b text").unwrap());
    }

    #[test]
    fn small_remaining_total_truncates_rather_than_drops() {
        // 10 chars left in the total budget is well under what used to be
        // a "not worth it" floor; the section must still appear, cut down
        // to exactly what's left, rather than being skipped.
        let candidates = vec![
            candidate("a", SectionKind::Index, &"a".repeat(90)),
            candidate("b", SectionKind::Sibling, &"b".repeat(50)),
        ];
        let (_, sections) = Assembler::apply_budget(&candidates, Some(100), None, TruncationStrategy::Truncate);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].source_id, "b");
        assert_eq!(sections[1].length, 10);
        assert_eq!(sections[1].truncated_reason, TruncatedReason::Total);
    }

    #[test]
    fn sentence_strategy_backs_off_to_boundary() {
        let text = "First sentence is here. Second sentence continues onward and onward.";
        let truncated = truncate_text(text, 40, TruncationStrategy::Sentence);
        assert_eq!(truncated, "First sentence is here.");
    }
}
