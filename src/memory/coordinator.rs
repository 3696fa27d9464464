//! Memory coordinator: query routing, promotion, consolidation, maintenance.
//!
//! The coordinator is stateless between calls; everything it needs lives in
//! the store, including the semantic cache entries it writes. Construction
//! is explicit dependency injection: the service entry point owns the store
//! and embedder and hands them in.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::memory::retrieval::{
    HybridSearchRequest, PromptContext, RetrievalEngine, RetrievedMemory,
};
use crate::memory::scoring;
use crate::memory::store::{MemoryFilter, MemoryStore, ScoredMemory};
use crate::memory::types::{
    meta, MemoryId, MemoryRecord, MemoryStats, MemoryTier, MemoryType, MemoryUpdate, StoreRequest,
};

/// Importance assigned to knowledge extracted from conversation.
const KNOWLEDGE_IMPORTANCE: f64 = 0.7;

/// Importance assigned to newly recorded entities.
const ENTITY_IMPORTANCE: f64 = 0.6;

/// Parameters for [`MemoryCoordinator::route_query`].
#[derive(Debug, Clone)]
pub struct RouteQueryRequest {
    pub query: String,
    pub owner: Option<String>,
    pub session_id: Option<String>,
    pub include_stm: bool,
    pub include_ltm: bool,
    pub limit: usize,
}

impl RouteQueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            owner: None,
            session_id: None,
            include_stm: true,
            include_ltm: true,
            limit: 10,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn include_stm(mut self, include: bool) -> Self {
        self.include_stm = include;
        self
    }

    pub fn include_ltm(mut self, include: bool) -> Self {
        self.include_ltm = include;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Counts from one maintenance pass. Sub-task failures land in `errors`
/// instead of failing the pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub expired_removed: u64,
    pub decay_updated: u64,
    pub consolidation_candidates: u64,
    pub errors: Vec<String>,
}

/// Orchestrates memory operations across STM and LTM.
pub struct MemoryCoordinator {
    store: Arc<dyn MemoryStore>,
    retrieval: RetrievalEngine,
    config: MemoryConfig,
}

impl MemoryCoordinator {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: Arc<dyn Embedder>,
        config: MemoryConfig,
    ) -> Self {
        let retrieval = RetrievalEngine::new(Arc::clone(&store), embedder, config.clone());
        Self {
            store,
            retrieval,
            config,
        }
    }

    /// The retrieval engine, for callers that want raw hybrid search or
    /// [`PromptContext`] access.
    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    // ==================== Query routing ====================

    /// Answer a query from the semantic cache when possible, otherwise run
    /// hybrid search per requested tier, merge, and cache the outcome.
    ///
    /// A cache hit bumps the entry's hit counter and returns its stored
    /// result list without touching the retrieval engine. Cache read and
    /// write failures degrade to a normal search; caching is an
    /// optimization, never a correctness requirement.
    pub async fn route_query(&self, request: &RouteQueryRequest) -> Result<Vec<RetrievedMemory>> {
        let query_hash = cache_key(&request.query);

        match self
            .store
            .find_cache_entry(&query_hash, request.owner.as_deref())
            .await
        {
            Ok(Some(entry)) => {
                if let Some(results) = decode_cached_results(&entry) {
                    debug!(hash = %query_hash, "semantic cache hit");
                    if let Err(e) = self.store.record_cache_hit(&entry.id).await {
                        warn!("failed to record cache hit: {}", e);
                    }
                    return Ok(results.into_iter().take(request.limit).collect());
                }
                warn!(id = %entry.id, "unreadable cache entry, searching instead");
            }
            Ok(None) => {}
            Err(e) => warn!("semantic cache lookup failed: {}", e),
        }

        let mut tiers = Vec::new();
        if request.include_stm {
            tiers.push(MemoryTier::Stm);
        }
        if request.include_ltm {
            tiers.push(MemoryTier::Ltm);
        }

        let mut results = Vec::new();
        for tier in tiers {
            let search = HybridSearchRequest::new(request.query.as_str())
                .maybe_owner(request.owner.as_deref())
                .tier(tier)
                .limit(request.limit)
                .min_score(self.config.min_vector_score)
                .weights(self.config.vector_weight, self.config.text_weight);
            results.extend(self.retrieval.hybrid_search(&search).await?);
        }

        results.sort_by(|a, b| {
            b.combined_score
                .total_cmp(&a.combined_score)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut seen = HashSet::new();
        results.retain(|r| seen.insert(r.id.clone()));
        results.truncate(request.limit);

        self.write_cache(&request.query, &query_hash, request.owner.as_deref(), &results)
            .await;

        Ok(results)
    }

    /// Best-effort cache write; failures are swallowed.
    async fn write_cache(
        &self,
        query: &str,
        query_hash: &str,
        owner: Option<&str>,
        results: &[RetrievedMemory],
    ) {
        if results.is_empty() {
            return;
        }

        let cached: Vec<RetrievedMemory> = results
            .iter()
            .take(self.config.cache_max_results)
            .map(|r| r.truncated(self.config.cache_content_max_chars))
            .collect();

        let payload = match serde_json::to_value(&cached) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to serialize cache payload: {}", e);
                return;
            }
        };

        let request = StoreRequest::new(MemoryType::SemanticCache, query)
            .maybe_owner(owner)
            .importance(self.config.cache_importance)
            .ttl(self.config.cache_ttl)
            .meta(meta::QUERY_HASH, query_hash)
            .meta(meta::CACHED_RESULTS, payload)
            .meta(meta::RESULT_COUNT, results.len())
            .meta(meta::CACHE_HITS, 0);

        if let Err(e) = self.store.store(request).await {
            warn!("semantic cache write failed: {}", e);
        }
    }

    // ==================== STM -> LTM promotion ====================

    /// Promote a short-term record into the long-term tier.
    ///
    /// Creates a new LTM record carrying the source's content and context,
    /// then links the source with a compare-and-set so a concurrent or
    /// retried promotion cannot produce a second copy: the loser of the
    /// race deletes its copy and reports [`Error::AlreadyPromoted`].
    pub async fn promote_to_ltm(
        &self,
        source_id: &MemoryId,
        target_type: MemoryType,
    ) -> Result<MemoryId> {
        if target_type.tier() != MemoryTier::Ltm {
            return Err(Error::Internal(format!(
                "promotion target {} is not long-term",
                target_type
            )));
        }

        let source = self.store.get(source_id).await?;
        if source.tier != MemoryTier::Stm {
            return Err(Error::NotStm(source_id.to_string()));
        }
        if source.is_consolidated() {
            return Err(Error::AlreadyPromoted(source_id.to_string()));
        }

        let mut metadata = source.metadata.clone();
        metadata.insert(
            meta::PROMOTED_AT.to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );

        let mut request = StoreRequest::new(target_type, source.content.clone())
            .maybe_owner(source.owner.as_deref())
            .importance(
                source
                    .importance_score
                    .max(self.config.promoted_importance_min),
            )
            .want_embedding(source.has_embedding)
            .promoted_from(source_id.clone())
            .metadata(metadata);
        if let Some(conversation_id) = &source.conversation_id {
            request = request.conversation(conversation_id.clone());
        }

        let ltm_id = self.store.store(request).await?;

        if self.store.link_consolidation(source_id, &ltm_id).await? {
            info!(source = %source_id, target = %ltm_id, "promoted memory to LTM");
            Ok(ltm_id)
        } else {
            // lost the race to a concurrent promotion
            let _ = self.store.delete(&ltm_id).await;
            Err(Error::AlreadyPromoted(source_id.to_string()))
        }
    }

    /// Promote every sufficiently important working record of a session.
    /// Per-record failures are logged and skipped; the batch continues.
    pub async fn auto_promote_session(
        &self,
        session_id: &str,
        importance_threshold: f64,
    ) -> Result<Vec<MemoryId>> {
        let candidates = self
            .store
            .find_promotable(session_id, importance_threshold, self.config.maintenance_batch)
            .await?;

        let mut promoted = Vec::new();
        for record in candidates {
            match self
                .promote_to_ltm(&record.id, MemoryType::EpisodicConversation)
                .await
            {
                Ok(ltm_id) => promoted.push(ltm_id),
                Err(Error::AlreadyPromoted(_)) => {}
                Err(e) => warn!(source = %record.id, "promotion failed: {}", e),
            }
        }

        info!(
            session = session_id,
            promoted = promoted.len(),
            "auto-promotion complete"
        );
        Ok(promoted)
    }

    // ==================== Consolidation ====================

    /// Merge several records into one summary, soft-superseding the sources.
    ///
    /// Topics, keywords, and entities are aggregated across the sources
    /// (first-seen order, deduplicated, capped). Each source is linked with
    /// a compare-and-set; an already-consolidated source is skipped, so the
    /// operation is idempotent per source and never re-links.
    pub async fn consolidate(
        &self,
        source_ids: &[MemoryId],
        summary_text: &str,
        owner: Option<&str>,
    ) -> Result<MemoryId> {
        if source_ids.is_empty() {
            return Err(Error::Internal(
                "consolidation requires at least one source memory".to_string(),
            ));
        }

        let mut sources = Vec::new();
        for id in source_ids {
            match self.store.get(id).await {
                Ok(record) => sources.push(record),
                Err(Error::NotFound(_)) => warn!(source = %id, "consolidation source missing"),
                Err(e) => return Err(e),
            }
        }
        if sources.is_empty() {
            return Err(Error::Internal(
                "no consolidation sources found".to_string(),
            ));
        }

        let topics = collect_strings(&sources, meta::TOPICS, self.config.consolidation_topics_max);
        let keywords = collect_strings(
            &sources,
            meta::KEYWORDS,
            self.config.consolidation_keywords_max,
        );
        let entities = collect_values(
            &sources,
            meta::ENTITIES,
            self.config.consolidation_entities_max,
        );

        let request = StoreRequest::new(MemoryType::EpisodicSummary, summary_text)
            .maybe_owner(owner)
            .importance(self.config.summary_importance)
            .meta(
                meta::SOURCE_MEMORY_IDS,
                Value::from(
                    sources
                        .iter()
                        .map(|r| r.id.to_string())
                        .collect::<Vec<_>>(),
                ),
            )
            .meta(meta::SOURCE_COUNT, sources.len())
            .meta(meta::TOPICS, Value::from(topics))
            .meta(meta::KEYWORDS, Value::from(keywords))
            .meta(meta::ENTITIES, Value::Array(entities))
            .meta(meta::CONSOLIDATED_AT, Utc::now().to_rfc3339());

        let summary_id = self.store.store(request).await?;

        let mut linked = 0usize;
        for record in &sources {
            match self.store.link_consolidation(&record.id, &summary_id).await {
                Ok(true) => {
                    linked += 1;
                    // consolidated sources matter less from now on
                    if let Err(e) = self
                        .store
                        .adjust_importance(
                            &record.id,
                            -self.config.consolidation_importance_penalty,
                        )
                        .await
                    {
                        warn!(source = %record.id, "importance adjustment failed: {}", e);
                    }
                }
                Ok(false) => debug!(source = %record.id, "already consolidated, skipped"),
                Err(e) => warn!(source = %record.id, "consolidation link failed: {}", e),
            }
        }

        info!(
            summary = %summary_id,
            linked,
            of = sources.len(),
            "consolidated memories"
        );
        Ok(summary_id)
    }

    // ==================== Maintenance ====================

    /// One bounded maintenance pass: sweep expired STM, recompute decay for
    /// a batch of LTM records (persisting only meaningful changes), and
    /// count consolidation candidates. Each sub-task is isolated; failures
    /// are reported, not raised. Safe to run on a fixed schedule and
    /// concurrently with itself.
    pub async fn run_maintenance(&self, owner: Option<&str>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let now = Utc::now();

        match self.store.delete_expired(now).await {
            Ok(removed) => report.expired_removed = removed,
            Err(e) => {
                warn!("expiry sweep failed: {}", e);
                report.errors.push(format!("expiry sweep: {}", e));
            }
        }

        match self
            .store
            .decay_batch(owner, self.config.maintenance_batch)
            .await
        {
            Ok(batch) => {
                for record in batch {
                    let fresh = scoring::record_decay(&record, now);
                    if (fresh - record.decay_score).abs() <= self.config.decay_write_threshold {
                        continue;
                    }
                    match self.store.set_decay(&record.id, fresh).await {
                        Ok(true) => report.decay_updated += 1,
                        Ok(false) => {}
                        Err(e) => warn!(id = %record.id, "decay update failed: {}", e),
                    }
                }
            }
            Err(e) => {
                warn!("decay recomputation failed: {}", e);
                report.errors.push(format!("decay recomputation: {}", e));
            }
        }

        match self
            .store
            .count_consolidation_candidates(owner, self.config.consolidation_decay_cutoff)
            .await
        {
            Ok(count) => report.consolidation_candidates = count,
            Err(e) => {
                warn!("consolidation candidate count failed: {}", e);
                report.errors.push(format!("candidate count: {}", e));
            }
        }

        info!(
            expired = report.expired_removed,
            decayed = report.decay_updated,
            candidates = report.consolidation_candidates,
            "memory maintenance complete"
        );
        report
    }

    // ==================== Working memory ====================

    /// Store one conversation turn as working memory with STM defaults:
    /// the configured TTL, and an embedding only when important enough to
    /// be worth retrieving semantically.
    pub async fn add_to_working_memory(
        &self,
        content: &str,
        role: &str,
        owner: Option<&str>,
        session_id: &str,
        conversation_id: Option<&str>,
        importance_score: f64,
    ) -> Result<MemoryId> {
        let mut request = StoreRequest::new(MemoryType::Working, content)
            .maybe_owner(owner)
            .session(session_id)
            .importance(importance_score)
            .want_embedding(importance_score >= self.config.vectorize_importance_min)
            .ttl(self.config.stm_ttl)
            .meta(meta::ROLE, role);
        if let Some(conversation_id) = conversation_id {
            request = request.conversation(conversation_id);
        }
        self.store.store(request).await
    }

    /// Session transcript plus recent summaries, rendered for a prompt.
    pub async fn get_working_memory_context(
        &self,
        session_id: &str,
        owner: Option<&str>,
        limit: usize,
    ) -> Result<String> {
        let context = self
            .retrieval
            .get_context_for_prompt(owner, session_id, limit, 3)
            .await?;
        Ok(context.to_prompt_string())
    }

    /// Structured variant of [`get_working_memory_context`].
    ///
    /// [`get_working_memory_context`]: MemoryCoordinator::get_working_memory_context
    pub async fn get_prompt_context(
        &self,
        session_id: &str,
        owner: Option<&str>,
        max_working: usize,
        max_summaries: usize,
    ) -> Result<PromptContext> {
        self.retrieval
            .get_context_for_prompt(owner, session_id, max_working, max_summaries)
            .await
    }

    // ==================== Importance events ====================

    /// An explicit "remember this" from the user pins the record near the
    /// top of the importance scale.
    pub async fn mark_important(&self, id: &MemoryId) -> Result<bool> {
        self.store
            .set_importance(id, self.config.remember_importance)
            .await
    }

    // ==================== Knowledge & entities ====================

    /// Store caller-extracted knowledge as a long-term fact. The engine
    /// performs no extraction itself; `content` is whatever the text
    /// analysis collaborator produced.
    pub async fn extract_knowledge(
        &self,
        content: &str,
        owner: Option<&str>,
        source_memory_id: Option<&MemoryId>,
    ) -> Result<MemoryId> {
        let mut request = StoreRequest::new(MemoryType::SemanticKnowledge, content)
            .maybe_owner(owner)
            .importance(KNOWLEDGE_IMPORTANCE)
            .meta(meta::EXTRACTED_AT, Utc::now().to_rfc3339());
        if let Some(source) = source_memory_id {
            request = request.meta(meta::SOURCE_MEMORY_ID, source.to_string());
        }
        self.store.store(request).await
    }

    /// Upsert a shared entity record. An existing entity (matched by name,
    /// case-insensitive) gets its context refreshed and its mention counter
    /// bumped; otherwise a new shared record is created.
    pub async fn record_entity(
        &self,
        entity_name: &str,
        entity_type: &str,
        context: &str,
        owner: Option<&str>,
    ) -> Result<MemoryId> {
        let now = Utc::now();

        if let Some(existing) = self.store.find_entity(entity_name).await? {
            let mut metadata = existing.metadata.clone();
            let mentions = metadata
                .get(meta::MENTION_COUNT)
                .and_then(|v| v.as_i64())
                .unwrap_or(0)
                + 1;
            metadata.insert(meta::MENTION_COUNT.to_string(), Value::from(mentions));
            metadata.insert(
                meta::LAST_MENTIONED.to_string(),
                Value::from(now.to_rfc3339()),
            );

            self.store
                .update(
                    &existing.id,
                    MemoryUpdate::new().content(context).metadata(metadata),
                )
                .await?;
            return Ok(existing.id);
        }

        let request = StoreRequest::new(MemoryType::SharedEntity, context)
            .maybe_owner(owner)
            .shared()
            .importance(ENTITY_IMPORTANCE)
            .meta(meta::ENTITY_NAME, entity_name)
            .meta(meta::ENTITY_TYPE, entity_type)
            .meta(meta::MENTION_COUNT, 1)
            .meta(meta::LAST_MENTIONED, now.to_rfc3339());
        self.store.store(request).await
    }

    // ==================== Admin passthroughs ====================

    pub async fn get(&self, id: &MemoryId) -> Result<MemoryRecord> {
        self.store.get(id).await
    }

    pub async fn update(&self, id: &MemoryId, update: MemoryUpdate) -> Result<bool> {
        self.store.update(id, update).await
    }

    pub async fn delete(&self, id: &MemoryId) -> Result<bool> {
        self.store.delete(id).await
    }

    pub async fn find_by_type(
        &self,
        memory_type: MemoryType,
        owner: Option<&str>,
        include_shared: bool,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.store
            .find_by_type(memory_type, owner, include_shared, limit)
            .await
    }

    pub async fn text_search(
        &self,
        query: &str,
        owner: Option<&str>,
        memory_types: Option<Vec<MemoryType>>,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        let filter = MemoryFilter {
            owner: owner.map(str::to_string),
            memory_types,
            tier: None,
        };
        self.store.text_search(query, &filter, limit).await
    }

    pub async fn stats(&self, owner: Option<&str>) -> Result<MemoryStats> {
        self.store.stats(owner).await
    }
}

/// Stable cache key: sha256 of the lower-cased query, short hex form.
fn cache_key(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.to_lowercase().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn decode_cached_results(entry: &MemoryRecord) -> Option<Vec<RetrievedMemory>> {
    let payload = entry.metadata.get(meta::CACHED_RESULTS)?;
    serde_json::from_value(payload.clone()).ok()
}

/// First-seen-order deduplicated strings from a metadata key, capped.
fn collect_strings(sources: &[MemoryRecord], key: &str, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for record in sources {
        let Some(values) = record.metadata.get(key).and_then(|v| v.as_array()) else {
            continue;
        };
        for value in values {
            if let Some(s) = value.as_str() {
                if seen.insert(s.to_string()) {
                    out.push(s.to_string());
                }
            }
        }
    }
    out.truncate(cap);
    out
}

/// Deduplicated opaque values from a metadata key, capped. Values are
/// compared by their serialized form.
fn collect_values(sources: &[MemoryRecord], key: &str, cap: usize) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for record in sources {
        let Some(values) = record.metadata.get(key).and_then(|v| v.as_array()) else {
            continue;
        };
        for value in values {
            if seen.insert(value.to_string()) {
                out.push(value.clone());
            }
        }
    }
    out.truncate(cap);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use crate::memory::store::SqliteMemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sqlite_store() -> Arc<SqliteMemoryStore> {
        Arc::new(SqliteMemoryStore::in_memory(Some(Arc::new(MockEmbedder::new(16)))).unwrap())
    }

    fn coordinator_over(store: Arc<dyn MemoryStore>) -> MemoryCoordinator {
        MemoryCoordinator::new(store, Arc::new(MockEmbedder::new(16)), MemoryConfig::default())
    }

    /// Call-counting fake around the SQLite backend, for asserting that a
    /// cache hit issues no additional search calls.
    struct CountingStore {
        inner: SqliteMemoryStore,
        vector_calls: AtomicUsize,
        text_calls: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: SqliteMemoryStore::in_memory(Some(Arc::new(MockEmbedder::new(16))))
                    .unwrap(),
                vector_calls: AtomicUsize::new(0),
                text_calls: AtomicUsize::new(0),
            }
        }

        fn search_calls(&self) -> (usize, usize) {
            (
                self.vector_calls.load(Ordering::SeqCst),
                self.text_calls.load(Ordering::SeqCst),
            )
        }
    }

    #[async_trait]
    impl MemoryStore for CountingStore {
        async fn store(&self, request: StoreRequest) -> Result<MemoryId> {
            self.inner.store(request).await
        }

        async fn insert(&self, record: &MemoryRecord) -> Result<()> {
            self.inner.insert(record).await
        }

        async fn get(&self, id: &MemoryId) -> Result<MemoryRecord> {
            self.inner.get(id).await
        }

        async fn update(&self, id: &MemoryId, update: MemoryUpdate) -> Result<bool> {
            self.inner.update(id, update).await
        }

        async fn delete(&self, id: &MemoryId) -> Result<bool> {
            self.inner.delete(id).await
        }

        async fn find_by_type(
            &self,
            memory_type: MemoryType,
            owner: Option<&str>,
            include_shared: bool,
            limit: usize,
        ) -> Result<Vec<MemoryRecord>> {
            self.inner
                .find_by_type(memory_type, owner, include_shared, limit)
                .await
        }

        async fn find_by_session(
            &self,
            session_id: &str,
            memory_types: Option<&[MemoryType]>,
            limit: usize,
        ) -> Result<Vec<MemoryRecord>> {
            self.inner.find_by_session(session_id, memory_types, limit).await
        }

        async fn find_by_user(
            &self,
            owner: &str,
            tier: Option<MemoryTier>,
            include_shared: bool,
            limit: usize,
        ) -> Result<Vec<MemoryRecord>> {
            self.inner.find_by_user(owner, tier, include_shared, limit).await
        }

        async fn text_search(
            &self,
            query: &str,
            filter: &MemoryFilter,
            limit: usize,
        ) -> Result<Vec<ScoredMemory>> {
            self.text_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.text_search(query, filter, limit).await
        }

        async fn vector_search(
            &self,
            embedding: &[f32],
            filter: &MemoryFilter,
            limit: usize,
            min_score: f64,
        ) -> Result<Vec<ScoredMemory>> {
            self.vector_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.vector_search(embedding, filter, limit, min_score).await
        }

        async fn stats(&self, owner: Option<&str>) -> Result<MemoryStats> {
            self.inner.stats(owner).await
        }

        async fn link_consolidation(&self, id: &MemoryId, target: &MemoryId) -> Result<bool> {
            self.inner.link_consolidation(id, target).await
        }

        async fn set_importance(&self, id: &MemoryId, importance: f64) -> Result<bool> {
            self.inner.set_importance(id, importance).await
        }

        async fn adjust_importance(&self, id: &MemoryId, delta: f64) -> Result<bool> {
            self.inner.adjust_importance(id, delta).await
        }

        async fn set_decay(&self, id: &MemoryId, decay: f64) -> Result<bool> {
            self.inner.set_decay(id, decay).await
        }

        async fn record_cache_hit(&self, id: &MemoryId) -> Result<()> {
            self.inner.record_cache_hit(id).await
        }

        async fn find_cache_entry(
            &self,
            query_hash: &str,
            owner: Option<&str>,
        ) -> Result<Option<MemoryRecord>> {
            self.inner.find_cache_entry(query_hash, owner).await
        }

        async fn find_promotable(
            &self,
            session_id: &str,
            min_importance: f64,
            limit: usize,
        ) -> Result<Vec<MemoryRecord>> {
            self.inner.find_promotable(session_id, min_importance, limit).await
        }

        async fn decay_batch(
            &self,
            owner: Option<&str>,
            limit: usize,
        ) -> Result<Vec<MemoryRecord>> {
            self.inner.decay_batch(owner, limit).await
        }

        async fn count_consolidation_candidates(
            &self,
            owner: Option<&str>,
            decay_cutoff: f64,
        ) -> Result<u64> {
            self.inner.count_consolidation_candidates(owner, decay_cutoff).await
        }

        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            self.inner.delete_expired(now).await
        }

        async fn find_entity(&self, entity_name: &str) -> Result<Option<MemoryRecord>> {
            self.inner.find_entity(entity_name).await
        }
    }

    #[test]
    fn test_cache_key_is_case_insensitive_and_stable() {
        assert_eq!(cache_key("Where are my KEYS"), cache_key("where are my keys"));
        assert_ne!(cache_key("where are my keys"), cache_key("where is my bag"));
        assert_eq!(cache_key("x").len(), 16);
    }

    #[tokio::test]
    async fn test_route_query_caches_results() {
        let store = Arc::new(CountingStore::new());
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        store
            .store(
                StoreRequest::new(MemoryType::SemanticKnowledge, "the wifi password is hunter2")
                    .want_embedding(false),
            )
            .await
            .unwrap();

        let request = RouteQueryRequest::new("wifi password");
        let first = coordinator.route_query(&request).await.unwrap();
        assert!(!first.is_empty());

        let after_first = store.search_calls();
        assert!(after_first.1 >= 1);

        // identical query within the TTL: served from cache, zero new
        // search calls
        let second = coordinator.route_query(&request).await.unwrap();
        assert_eq!(store.search_calls(), after_first);

        let first_ids: Vec<_> = first.iter().map(|r| r.id.clone()).collect();
        let second_ids: Vec<_> = second.iter().map(|r| r.id.clone()).collect();
        assert_eq!(first_ids, second_ids);

        // the cache entry itself tracked the hit
        let entry = store
            .find_cache_entry(&cache_key("wifi password"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            entry.metadata.get(meta::CACHE_HITS).and_then(|v| v.as_i64()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_route_query_respects_tier_toggles() {
        let store = Arc::new(CountingStore::new());
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        store
            .store(
                StoreRequest::new(MemoryType::SemanticKnowledge, "long term fact")
                    .want_embedding(false),
            )
            .await
            .unwrap();

        let request = RouteQueryRequest::new("long term fact").include_stm(false);
        coordinator.route_query(&request).await.unwrap();

        // one tier searched -> one text call
        assert_eq!(store.search_calls().1, 1);
    }

    #[tokio::test]
    async fn test_promote_to_ltm_copies_and_links() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let source_id = coordinator
            .add_to_working_memory("Buy milk tomorrow", "user", Some("alice"), "s1", None, 0.8)
            .await
            .unwrap();

        let ltm_id = coordinator
            .promote_to_ltm(&source_id, MemoryType::EpisodicConversation)
            .await
            .unwrap();

        let ltm = store.get(&ltm_id).await.unwrap();
        assert_eq!(ltm.tier, MemoryTier::Ltm);
        assert_eq!(ltm.memory_type, MemoryType::EpisodicConversation);
        assert_eq!(ltm.content, "Buy milk tomorrow");
        assert_eq!(ltm.owner.as_deref(), Some("alice"));
        assert_eq!(ltm.importance_score, 0.8);
        assert_eq!(ltm.promoted_from, Some(source_id.clone()));
        assert!(ltm.metadata.contains_key(meta::PROMOTED_AT));
        assert!(ltm.expires_at.is_none());

        let source = store.get(&source_id).await.unwrap();
        assert_eq!(source.consolidated_into, Some(ltm_id));
    }

    #[tokio::test]
    async fn test_promotion_raises_importance_floor() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let source_id = coordinator
            .add_to_working_memory("minor detail", "user", None, "s1", None, 0.3)
            .await
            .unwrap();
        let ltm_id = coordinator
            .promote_to_ltm(&source_id, MemoryType::EpisodicConversation)
            .await
            .unwrap();

        let ltm = store.get(&ltm_id).await.unwrap();
        assert_eq!(ltm.importance_score, 0.6);
    }

    #[tokio::test]
    async fn test_promote_twice_yields_exactly_one_ltm_record() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let source_id = coordinator
            .add_to_working_memory("remember me", "user", None, "s1", None, 0.9)
            .await
            .unwrap();

        coordinator
            .promote_to_ltm(&source_id, MemoryType::EpisodicConversation)
            .await
            .unwrap();
        let err = coordinator
            .promote_to_ltm(&source_id, MemoryType::EpisodicConversation)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyPromoted(_)));

        let copies = store
            .find_by_type(MemoryType::EpisodicConversation, None, true, 10)
            .await
            .unwrap();
        assert_eq!(copies.len(), 1);
    }

    #[tokio::test]
    async fn test_promote_preconditions() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let ltm_id = store
            .store(StoreRequest::new(MemoryType::SemanticKnowledge, "fact"))
            .await
            .unwrap();
        assert!(matches!(
            coordinator
                .promote_to_ltm(&ltm_id, MemoryType::EpisodicConversation)
                .await,
            Err(Error::NotStm(_))
        ));

        assert!(matches!(
            coordinator
                .promote_to_ltm(&MemoryId::new(), MemoryType::EpisodicConversation)
                .await,
            Err(Error::NotFound(_))
        ));

        let stm_id = coordinator
            .add_to_working_memory("hello", "user", None, "s1", None, 0.9)
            .await
            .unwrap();
        assert!(matches!(
            coordinator.promote_to_ltm(&stm_id, MemoryType::Working).await,
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_promote_session() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        for (content, importance) in
            [("critical", 0.9), ("notable", 0.75), ("chit chat", 0.2)]
        {
            coordinator
                .add_to_working_memory(content, "user", None, "s1", None, importance)
                .await
                .unwrap();
        }

        let promoted = coordinator.auto_promote_session("s1", 0.7).await.unwrap();
        assert_eq!(promoted.len(), 2);

        // a second pass finds nothing left to promote
        let again = coordinator.auto_promote_session("s1", 0.7).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_consolidate_aggregates_and_links() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let a = store
            .store(
                StoreRequest::new(MemoryType::EpisodicConversation, "talked about the trip")
                    .importance(0.5)
                    .meta(meta::TOPICS, serde_json::json!(["travel", "family"]))
                    .meta(meta::KEYWORDS, serde_json::json!(["flight"])),
            )
            .await
            .unwrap();
        let b = store
            .store(
                StoreRequest::new(MemoryType::EpisodicConversation, "booked the hotel")
                    .importance(0.5)
                    .meta(meta::TOPICS, serde_json::json!(["family", "budget"]))
                    .meta(meta::KEYWORDS, serde_json::json!(["hotel", "flight"])),
            )
            .await
            .unwrap();

        let summary_id = coordinator
            .consolidate(&[a.clone(), b.clone()], "Planned the family trip", Some("alice"))
            .await
            .unwrap();

        let summary = store.get(&summary_id).await.unwrap();
        assert_eq!(summary.memory_type, MemoryType::EpisodicSummary);
        assert_eq!(
            summary.metadata.get(meta::TOPICS),
            Some(&serde_json::json!(["travel", "family", "budget"]))
        );
        assert_eq!(
            summary.metadata.get(meta::KEYWORDS),
            Some(&serde_json::json!(["flight", "hotel"]))
        );
        assert_eq!(
            summary.metadata.get(meta::SOURCE_COUNT).and_then(|v| v.as_u64()),
            Some(2)
        );

        // sources are linked and matter less now
        for id in [&a, &b] {
            let source = store.get(id).await.unwrap();
            assert_eq!(source.consolidated_into, Some(summary_id.clone()));
            assert!((source.importance_score - 0.3).abs() < 1e-9);
        }

        // idempotent per source: a second consolidation never re-links
        let second_summary = coordinator
            .consolidate(&[a.clone(), b.clone()], "Duplicate summary", Some("alice"))
            .await
            .unwrap();
        for id in [&a, &b] {
            let source = store.get(id).await.unwrap();
            assert_eq!(source.consolidated_into, Some(summary_id.clone()));
            assert_ne!(source.consolidated_into, Some(second_summary.clone()));
            assert!((source.importance_score - 0.3).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_consolidate_requires_sources() {
        let store = sqlite_store();
        let coordinator = coordinator_over(store as Arc<dyn MemoryStore>);

        assert!(coordinator.consolidate(&[], "empty", None).await.is_err());
        assert!(coordinator
            .consolidate(&[MemoryId::new()], "missing", None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_run_maintenance() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        // expired working memory awaiting the sweep
        let mut expired = MemoryRecord::new(MemoryType::Working, "stale");
        expired.created_at = Utc::now() - ChronoDuration::hours(10);
        expired.timestamp = expired.created_at;
        expired.expires_at = Some(expired.created_at + ChronoDuration::hours(8));
        store.insert(&expired).await.unwrap();

        // fresh record whose stored decay is far from the recomputed value
        store
            .store(StoreRequest::new(MemoryType::SemanticKnowledge, "drifted").importance(0.5))
            .await
            .unwrap();

        // fresh maximally-important record: recomputation changes nothing,
        // so the write is suppressed
        store
            .store(StoreRequest::new(MemoryType::SemanticKnowledge, "stable").importance(1.0))
            .await
            .unwrap();

        // old low-importance conversation decays below the cutoff
        let mut old = MemoryRecord::new(MemoryType::EpisodicConversation, "old chat");
        old.created_at = Utc::now() - ChronoDuration::days(600);
        old.timestamp = old.created_at;
        old.importance_score = 0.1;
        store.insert(&old).await.unwrap();

        let report = coordinator.run_maintenance(None).await;

        assert_eq!(report.expired_removed, 1);
        assert_eq!(report.decay_updated, 2);
        assert_eq!(report.consolidation_candidates, 1);
        assert!(report.errors.is_empty());

        let drifted = store.get(&old.id).await.unwrap();
        assert!(drifted.decay_score < 0.3);

        // a second pass is idempotent for the same state
        let second = coordinator.run_maintenance(None).await;
        assert_eq!(second.expired_removed, 0);
        assert_eq!(second.decay_updated, 0);
        assert_eq!(second.consolidation_candidates, 1);
    }

    #[tokio::test]
    async fn test_mark_important() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let id = store
            .store(StoreRequest::new(MemoryType::SemanticKnowledge, "the gate code is 4711"))
            .await
            .unwrap();

        assert!(coordinator.mark_important(&id).await.unwrap());
        let record = store.get(&id).await.unwrap();
        assert_eq!(record.importance_score, 0.9);
    }

    #[tokio::test]
    async fn test_extract_knowledge_links_source() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let source = coordinator
            .add_to_working_memory("I moved to Lisbon", "user", Some("alice"), "s1", None, 0.8)
            .await
            .unwrap();
        let knowledge_id = coordinator
            .extract_knowledge("Alice lives in Lisbon", Some("alice"), Some(&source))
            .await
            .unwrap();

        let knowledge = store.get(&knowledge_id).await.unwrap();
        assert_eq!(knowledge.memory_type, MemoryType::SemanticKnowledge);
        assert_eq!(knowledge.importance_score, 0.7);
        assert_eq!(
            knowledge
                .metadata
                .get(meta::SOURCE_MEMORY_ID)
                .and_then(|v| v.as_str()),
            Some(source.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_record_entity_upserts() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let first = coordinator
            .record_entity("Nana", "person", "Nana lives next door", Some("alice"))
            .await
            .unwrap();
        let second = coordinator
            .record_entity("nana", "person", "Nana moved in with us", Some("bob"))
            .await
            .unwrap();

        assert_eq!(first, second);
        let entity = store.get(&first).await.unwrap();
        assert!(entity.shared);
        assert_eq!(entity.content, "Nana moved in with us");
        assert_eq!(
            entity.metadata.get(meta::MENTION_COUNT).and_then(|v| v.as_i64()),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_working_memory_vectorize_threshold() {
        let store = sqlite_store();
        let coordinator = coordinator_over(Arc::clone(&store) as Arc<dyn MemoryStore>);

        let low = coordinator
            .add_to_working_memory("small talk", "user", None, "s1", None, 0.5)
            .await
            .unwrap();
        let high = coordinator
            .add_to_working_memory("my passport number is X123", "user", None, "s1", None, 0.7)
            .await
            .unwrap();

        assert!(!store.get(&low).await.unwrap().has_embedding);
        assert!(store.get(&high).await.unwrap().has_embedding);
    }

    #[tokio::test]
    async fn test_working_memory_context_renders_roles() {
        let store = sqlite_store();
        let coordinator = coordinator_over(store as Arc<dyn MemoryStore>);

        coordinator
            .add_to_working_memory("hi", "user", None, "s1", None, 0.5)
            .await
            .unwrap();
        coordinator
            .add_to_working_memory("hello there", "assistant", None, "s1", None, 0.5)
            .await
            .unwrap();

        let context = coordinator
            .get_working_memory_context("s1", None, 10)
            .await
            .unwrap();
        assert_eq!(context, "user: hi\nassistant: hello there");
    }
}
