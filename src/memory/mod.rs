//! Hierarchical memory: records, storage, retrieval, and lifecycle.
//!
//! Two tiers with explicit lifecycle transitions:
//!
//! - **STM** (working memory, semantic cache): session-scoped, expires by TTL
//! - **LTM** (procedural/episodic/semantic/shared): persistent, subject to
//!   decay scoring, promotion from STM, and consolidation into summaries
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use engram_core::{MemoryConfig, MemoryCoordinator, MockEmbedder, SqliteMemoryStore};
//!
//! let embedder = Arc::new(MockEmbedder::new(384));
//! let store = Arc::new(SqliteMemoryStore::open("memories.db", Some(embedder.clone()))?);
//! let coordinator = MemoryCoordinator::new(store, embedder, MemoryConfig::default());
//!
//! // One turn of conversation into working memory
//! coordinator
//!     .add_to_working_memory("I parked on level 3", "user", Some("alice"), "s1", None, 0.8)
//!     .await?;
//!
//! // Later: hybrid retrieval with a semantic cache in front
//! let hits = coordinator
//!     .route_query(&RouteQueryRequest::new("where did I park?").owner("alice"))
//!     .await?;
//! ```

mod coordinator;
mod retrieval;
mod schema;
mod scoring;
mod store;
mod types;

pub use coordinator::{MaintenanceReport, MemoryCoordinator, RouteQueryRequest};
pub use retrieval::{
    HybridSearchRequest, PromptContext, RetrievalEngine, RetrievedMemory, SearchSource,
};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use scoring::{
    age_in_days, compute_decay, cosine_similarity, record_decay, DEFAULT_DECAY_SCORE,
    DEFAULT_IMPORTANCE_SCORE,
};
pub use store::{MemoryFilter, MemoryStore, ScoredMemory, SqliteMemoryStore};
pub use types::{
    meta, MemoryId, MemoryRecord, MemoryStats, MemoryTier, MemoryType, MemoryUpdate, StoreRequest,
    TierStats, TypeStats,
};
