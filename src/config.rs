//! Tuning parameters for the memory engine.
//!
//! Every constant that shapes lifecycle or ranking behavior lives here so
//! deployments can tune them without touching the engine. Defaults match the
//! values the system shipped with; the maintenance batch size and the decay
//! write-suppression threshold in particular are carried-over tuning values
//! that should be revisited against real workload data.

use std::time::Duration;

/// Default time-to-live for working memory entries.
pub const STM_TTL_DEFAULT: Duration = Duration::from_secs(8 * 60 * 60);

/// Default time-to-live for semantic cache entries.
pub const CACHE_TTL_DEFAULT: Duration = Duration::from_secs(60 * 60);

/// Smoothing constant for Reciprocal Rank Fusion. De-emphasizes rank-1
/// dominance: with k = 60 the first and second ranks contribute nearly
/// equally.
pub const RRF_K_DEFAULT: f64 = 60.0;

/// Configuration for a [`MemoryCoordinator`](crate::memory::MemoryCoordinator)
/// and its collaborators.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// TTL applied to working memory when the caller gives none.
    pub stm_ttl: Duration,
    /// TTL for semantic cache entries.
    pub cache_ttl: Duration,
    /// Maximum number of results stored per cache entry.
    pub cache_max_results: usize,
    /// Cached result content is truncated to this many characters.
    pub cache_content_max_chars: usize,
    /// Importance assigned to cache entries themselves.
    pub cache_importance: f64,
    /// Minimum importance for automatic STM promotion.
    pub promotion_threshold: f64,
    /// Promoted records keep at least this importance.
    pub promoted_importance_min: f64,
    /// Working memory is embedded only at or above this importance.
    pub vectorize_importance_min: f64,
    /// RRF smoothing constant.
    pub rrf_k: f64,
    /// Weight of the vector result list in fusion.
    pub vector_weight: f64,
    /// Weight of the lexical result list in fusion.
    pub text_weight: f64,
    /// Minimum cosine similarity for vector search hits.
    pub min_vector_score: f64,
    /// Records examined per maintenance pass.
    pub maintenance_batch: usize,
    /// Decay recomputation persists only when the change exceeds this.
    pub decay_write_threshold: f64,
    /// Conversations below this decay score count as consolidation
    /// candidates.
    pub consolidation_decay_cutoff: f64,
    /// Topic cap on consolidated summaries.
    pub consolidation_topics_max: usize,
    /// Keyword cap on consolidated summaries.
    pub consolidation_keywords_max: usize,
    /// Entity cap on consolidated summaries.
    pub consolidation_entities_max: usize,
    /// Importance assigned to summary records.
    pub summary_importance: f64,
    /// Importance set by an explicit "remember this".
    pub remember_importance: f64,
    /// Importance penalty applied to consolidated sources (floored at 0).
    pub consolidation_importance_penalty: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stm_ttl: STM_TTL_DEFAULT,
            cache_ttl: CACHE_TTL_DEFAULT,
            cache_max_results: 20,
            cache_content_max_chars: 500,
            cache_importance: 0.3,
            promotion_threshold: 0.7,
            promoted_importance_min: 0.6,
            vectorize_importance_min: 0.6,
            rrf_k: RRF_K_DEFAULT,
            vector_weight: 0.6,
            text_weight: 0.4,
            min_vector_score: 0.3,
            maintenance_batch: 500,
            decay_write_threshold: 0.05,
            consolidation_decay_cutoff: 0.3,
            consolidation_topics_max: 10,
            consolidation_keywords_max: 15,
            consolidation_entities_max: 10,
            summary_importance: 0.7,
            remember_importance: 0.9,
            consolidation_importance_penalty: 0.2,
        }
    }
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stm_ttl(mut self, ttl: Duration) -> Self {
        self.stm_ttl = ttl;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_promotion_threshold(mut self, threshold: f64) -> Self {
        self.promotion_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_fusion_weights(mut self, vector: f64, text: f64) -> Self {
        self.vector_weight = vector;
        self.text_weight = text;
        self
    }

    pub fn with_min_vector_score(mut self, min_score: f64) -> Self {
        self.min_vector_score = min_score;
        self
    }

    pub fn with_maintenance_batch(mut self, batch: usize) -> Self {
        self.maintenance_batch = batch;
        self
    }

    pub fn with_decay_write_threshold(mut self, threshold: f64) -> Self {
        self.decay_write_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.stm_ttl, Duration::from_secs(28_800));
        assert_eq!(config.cache_ttl, Duration::from_secs(3_600));
        assert_eq!(config.rrf_k, 60.0);
        assert_eq!(config.vector_weight, 0.6);
        assert_eq!(config.text_weight, 0.4);
        assert_eq!(config.maintenance_batch, 500);
    }

    #[test]
    fn test_builders() {
        let config = MemoryConfig::new()
            .with_cache_ttl(Duration::from_secs(60))
            .with_fusion_weights(0.5, 0.5)
            .with_maintenance_batch(100);

        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.vector_weight, 0.5);
        assert_eq!(config.maintenance_batch, 100);
    }

    #[test]
    fn test_promotion_threshold_clamped() {
        let config = MemoryConfig::new().with_promotion_threshold(1.5);
        assert_eq!(config.promotion_threshold, 1.0);
    }
}
