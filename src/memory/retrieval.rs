//! Hybrid search and prompt-context assembly.
//!
//! The engine is stateless: each call embeds the query, runs vector and
//! lexical search concurrently against the store, and fuses the two ranked
//! lists with Reciprocal Rank Fusion. Fusion is deterministic given the two
//! input lists; ties on the fused score break toward the more recent record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::memory::store::{MemoryFilter, MemoryStore, ScoredMemory};
use crate::memory::types::{meta, MemoryId, MemoryRecord, MemoryTier, MemoryType};

/// Which search modality produced (or co-produced) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Vector,
    Text,
}

/// A fused search result with its component scores kept for explainability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedMemory {
    pub id: MemoryId,
    pub content: String,
    pub memory_type: MemoryType,
    pub tier: MemoryTier,
    pub owner: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub importance_score: f64,
    pub metadata: Map<String, Value>,
    /// Cosine similarity from the vector branch, if it surfaced this record.
    pub vector_score: Option<f64>,
    /// Lexical relevance from the text branch, if it surfaced this record.
    pub text_score: Option<f64>,
    /// Total RRF contribution across both lists.
    pub combined_score: f64,
    pub sources: Vec<SearchSource>,
}

impl RetrievedMemory {
    /// Copy with content truncated to `max_chars`, for cache payloads.
    pub fn truncated(&self, max_chars: usize) -> Self {
        let mut copy = self.clone();
        if copy.content.chars().count() > max_chars {
            copy.content = copy.content.chars().take(max_chars).collect();
        }
        copy
    }
}

/// Parameters for one hybrid search.
#[derive(Debug, Clone)]
pub struct HybridSearchRequest {
    pub query: String,
    pub owner: Option<String>,
    pub memory_types: Option<Vec<MemoryType>>,
    pub tier: Option<MemoryTier>,
    pub limit: usize,
    pub min_score: f64,
    pub vector_weight: f64,
    pub text_weight: f64,
}

impl HybridSearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            owner: None,
            memory_types: None,
            tier: None,
            limit: 10,
            min_score: 0.3,
            vector_weight: 0.6,
            text_weight: 0.4,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn maybe_owner(mut self, owner: Option<&str>) -> Self {
        self.owner = owner.map(str::to_string);
        self
    }

    pub fn memory_types(mut self, types: Vec<MemoryType>) -> Self {
        self.memory_types = Some(types);
        self
    }

    pub fn tier(mut self, tier: MemoryTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn weights(mut self, vector: f64, text: f64) -> Self {
        self.vector_weight = vector;
        self.text_weight = text;
        self
    }
}

/// Working-memory transcript plus recent summaries, ready for a prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Session working memory in chronological order.
    pub working: Vec<MemoryRecord>,
    /// Recent summaries, newest first.
    pub summaries: Vec<MemoryRecord>,
}

impl PromptContext {
    pub fn is_empty(&self) -> bool {
        self.working.is_empty() && self.summaries.is_empty()
    }

    /// Render as `role: content` lines followed by `Summary:` lines.
    pub fn to_prompt_string(&self) -> String {
        let mut lines = Vec::new();

        for record in &self.working {
            if record.content.is_empty() {
                continue;
            }
            let role = record
                .metadata
                .get(meta::ROLE)
                .and_then(|v| v.as_str())
                .unwrap_or("user");
            lines.push(format!("{}: {}", role, record.content));
        }

        for record in &self.summaries {
            if !record.content.is_empty() {
                lines.push(format!("Summary: {}", record.content));
            }
        }

        lines.join("\n")
    }
}

/// Stateless hybrid retrieval over a [`MemoryStore`].
pub struct RetrievalEngine {
    store: Arc<dyn MemoryStore>,
    embedder: Arc<dyn Embedder>,
    config: MemoryConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Run vector and lexical search concurrently and fuse the ranked lists.
    ///
    /// Each branch is asked for twice the requested limit so fusion has
    /// candidates to work with. An embedding failure degrades the call to
    /// lexical-only; store failures propagate. Cancellation follows the
    /// caller's future; wrap in `tokio::time::timeout` for deadlines.
    pub async fn hybrid_search(
        &self,
        request: &HybridSearchRequest,
    ) -> Result<Vec<RetrievedMemory>> {
        if request.query.trim().is_empty() || request.limit == 0 {
            return Ok(Vec::new());
        }

        let filter = MemoryFilter {
            owner: request.owner.clone(),
            memory_types: request.memory_types.clone(),
            tier: request.tier,
        };
        let overfetch = request.limit.saturating_mul(2);

        let vector_branch = async {
            match self.embedder.embed(&request.query).await {
                Ok(embedding) => {
                    self.store
                        .vector_search(&embedding, &filter, overfetch, request.min_score)
                        .await
                }
                Err(e) => {
                    warn!("query embedding failed, degrading to lexical-only: {}", e);
                    Ok(Vec::new())
                }
            }
        };
        let text_branch = self.store.text_search(&request.query, &filter, overfetch);

        let (vector_hits, text_hits) = futures::join!(vector_branch, text_branch);
        let (vector_hits, text_hits) = (vector_hits?, text_hits?);

        debug!(
            vector = vector_hits.len(),
            text = text_hits.len(),
            "hybrid search branches complete"
        );

        Ok(rrf_fuse(
            vector_hits,
            text_hits,
            request.vector_weight,
            request.text_weight,
            self.config.rrf_k,
            request.limit,
        ))
    }

    /// Working memory for the session (most recent `max_working`, oldest
    /// first) followed by up to `max_summaries` newest summaries visible to
    /// the owner. Pure read, no mutation.
    pub async fn get_context_for_prompt(
        &self,
        owner: Option<&str>,
        session_id: &str,
        max_working: usize,
        max_summaries: usize,
    ) -> Result<PromptContext> {
        let working = self
            .store
            .find_by_session(session_id, Some(&[MemoryType::Working]), max_working)
            .await?;

        let summaries = match owner {
            Some(owner) => {
                self.store
                    .find_by_type(MemoryType::EpisodicSummary, Some(owner), true, max_summaries)
                    .await?
            }
            None => {
                self.store
                    .find_by_type(MemoryType::EpisodicSummary, None, true, max_summaries)
                    .await?
            }
        };

        Ok(PromptContext { working, summaries })
    }
}

struct FusedEntry {
    record: MemoryRecord,
    vector_score: Option<f64>,
    text_score: Option<f64>,
    combined_score: f64,
    sources: Vec<SearchSource>,
}

impl FusedEntry {
    fn new(record: MemoryRecord) -> Self {
        Self {
            record,
            vector_score: None,
            text_score: None,
            combined_score: 0.0,
            sources: Vec::new(),
        }
    }
}

/// Reciprocal Rank Fusion over two ranked lists.
///
/// Each list contributes `weight / (k + rank)` per entry (rank is 1-based);
/// an id present in both lists sums both contributions. The final order is
/// fused score descending, then newer `timestamp`, then id, which makes the
/// fusion bit-stable for fixed inputs.
fn rrf_fuse(
    vector_hits: Vec<ScoredMemory>,
    text_hits: Vec<ScoredMemory>,
    vector_weight: f64,
    text_weight: f64,
    k: f64,
    limit: usize,
) -> Vec<RetrievedMemory> {
    let mut fused: HashMap<MemoryId, FusedEntry> = HashMap::new();

    for (index, hit) in vector_hits.into_iter().enumerate() {
        let contribution = vector_weight / (k + (index + 1) as f64);
        let ScoredMemory { record, score } = hit;
        let entry = fused
            .entry(record.id.clone())
            .or_insert_with(|| FusedEntry::new(record));
        entry.combined_score += contribution;
        entry.vector_score = Some(score);
        entry.sources.push(SearchSource::Vector);
    }

    for (index, hit) in text_hits.into_iter().enumerate() {
        let contribution = text_weight / (k + (index + 1) as f64);
        let ScoredMemory { record, score } = hit;
        let entry = fused
            .entry(record.id.clone())
            .or_insert_with(|| FusedEntry::new(record));
        entry.combined_score += contribution;
        entry.text_score = Some(score);
        entry.sources.push(SearchSource::Text);
    }

    let mut entries: Vec<FusedEntry> = fused.into_values().collect();
    entries.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then_with(|| b.record.timestamp.cmp(&a.record.timestamp))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    entries.truncate(limit);

    entries
        .into_iter()
        .map(|entry| RetrievedMemory {
            id: entry.record.id,
            content: entry.record.content,
            memory_type: entry.record.memory_type,
            tier: entry.record.tier,
            owner: entry.record.owner,
            timestamp: entry.record.timestamp,
            importance_score: entry.record.importance_score,
            metadata: entry.record.metadata,
            vector_score: entry.vector_score,
            text_score: entry.text_score,
            combined_score: entry.combined_score,
            sources: entry.sources,
        })
        .collect()
}
