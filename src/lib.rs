//! # engram-core
//!
//! A hierarchical memory engine for conversational agents: short-lived
//! session context and long-lived knowledge in one store, hybrid
//! vector + lexical retrieval, and lifecycle management for everything in
//! between.
//!
//! ## Core Components
//!
//! - **MemoryRecord**: one record type across tiers, tagged by `MemoryType`
//!   with an open metadata bag for role-specific fields
//! - **MemoryStore**: backing-store contract (CRUD, filtered scans, lexical
//!   and vector search, TTL expiry, compare-and-set linkage) with a
//!   SQLite + FTS5 implementation
//! - **RetrievalEngine**: stateless hybrid search fusing both modalities
//!   with Reciprocal Rank Fusion, plus prompt-context assembly
//! - **MemoryCoordinator**: query routing behind a semantic cache,
//!   STM→LTM promotion, consolidation into summaries, and bounded-cost
//!   periodic maintenance (expiry sweep, decay recomputation)
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use engram_core::{
//!     MemoryConfig, MemoryCoordinator, MockEmbedder, RouteQueryRequest, SqliteMemoryStore,
//! };
//!
//! let embedder = Arc::new(MockEmbedder::new(384));
//! let store = Arc::new(SqliteMemoryStore::open("memories.db", Some(embedder.clone()))?);
//! let memory = MemoryCoordinator::new(store, embedder, MemoryConfig::default());
//!
//! let results = memory
//!     .route_query(&RouteQueryRequest::new("where are my keys?").owner("alice"))
//!     .await?;
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod memory;

// Re-exports for convenience
pub use config::MemoryConfig;
pub use embedding::{Embedder, EmbedderConfig, HttpEmbedder, MockEmbedder};
pub use error::{Error, Result};
pub use memory::{
    HybridSearchRequest, MaintenanceReport, MemoryCoordinator, MemoryFilter, MemoryId,
    MemoryRecord, MemoryStats, MemoryStore, MemoryTier, MemoryType, MemoryUpdate, PromptContext,
    RetrievalEngine, RetrievedMemory, RouteQueryRequest, ScoredMemory, SearchSource,
    SqliteMemoryStore, StoreRequest,
};
