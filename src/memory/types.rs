//! Record types for the hierarchical memory engine.
//!
//! One record struct covers every role (message, fact, summary, entity,
//! cached query result). Role-specific fields live in the open `metadata`
//! bag under the keys in [`meta`], keyed off the `memory_type` tag, so
//! storage and indexing stay uniform across variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::memory::scoring::{DEFAULT_DECAY_SCORE, DEFAULT_IMPORTANCE_SCORE};

/// Well-known metadata keys.
pub mod meta {
    /// Speaker role on working/episodic records (`user`/`assistant`).
    pub const ROLE: &str = "role";
    /// Topic list on episodic records and summaries.
    pub const TOPICS: &str = "topics";
    /// Keyword list on episodic records and summaries.
    pub const KEYWORDS: &str = "keywords";
    /// Entity list on episodic records and summaries.
    pub const ENTITIES: &str = "entities";
    /// Normalized query hash on semantic cache entries.
    pub const QUERY_HASH: &str = "query_hash";
    /// Serialized result list on semantic cache entries.
    pub const CACHED_RESULTS: &str = "cached_results";
    /// Result count on semantic cache entries.
    pub const RESULT_COUNT: &str = "result_count";
    /// Hit counter on semantic cache entries.
    pub const CACHE_HITS: &str = "cache_hits";
    /// Promotion timestamp on promoted records.
    pub const PROMOTED_AT: &str = "promoted_at";
    /// Consolidation timestamp on summary records.
    pub const CONSOLIDATED_AT: &str = "consolidated_at";
    /// Source record ids on summary records.
    pub const SOURCE_MEMORY_IDS: &str = "source_memory_ids";
    /// Source record count on summary records.
    pub const SOURCE_COUNT: &str = "source_count";
    /// Back-reference on extracted knowledge records.
    pub const SOURCE_MEMORY_ID: &str = "source_memory_id";
    /// Extraction timestamp on knowledge records.
    pub const EXTRACTED_AT: &str = "extracted_at";
    /// Entity name on shared entity records.
    pub const ENTITY_NAME: &str = "entity_name";
    /// Entity kind (person/place/project/...) on shared entity records.
    pub const ENTITY_TYPE: &str = "entity_type";
    /// Mention counter on shared entity records.
    pub const MENTION_COUNT: &str = "mention_count";
    /// Last mention timestamp on shared entity records.
    pub const LAST_MENTIONED: &str = "last_mentioned";
}

/// Opaque identity of a stored record. Assigned at creation, immutable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemoryId(Uuid);

impl MemoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    /// Short-term: session-scoped, always carries an expiry.
    Stm,
    /// Long-term: persistent, subject to decay and consolidation.
    Ltm,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Stm => "stm",
            MemoryTier::Ltm => "ltm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stm" => Some(MemoryTier::Stm),
            "ltm" => Some(MemoryTier::Ltm),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specific memory types within each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Current session context (STM).
    Working,
    /// Cached hybrid-search results (STM).
    SemanticCache,
    /// Tool usage patterns (LTM).
    ProceduralTool,
    /// Multi-step task patterns (LTM).
    ProceduralWorkflow,
    /// Individual conversation messages (LTM).
    EpisodicConversation,
    /// Conversation summaries (LTM).
    EpisodicSummary,
    /// Learned facts (LTM).
    SemanticKnowledge,
    /// Entities: people, places, projects (LTM, shared).
    SharedEntity,
    /// User profile and preferences (LTM, shared).
    SharedPersona,
}

impl MemoryType {
    /// The tier is derived solely from the type and never changes.
    pub fn tier(&self) -> MemoryTier {
        match self {
            MemoryType::Working | MemoryType::SemanticCache => MemoryTier::Stm,
            _ => MemoryTier::Ltm,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Working => "working",
            MemoryType::SemanticCache => "semantic_cache",
            MemoryType::ProceduralTool => "procedural_tool",
            MemoryType::ProceduralWorkflow => "procedural_workflow",
            MemoryType::EpisodicConversation => "episodic_conversation",
            MemoryType::EpisodicSummary => "episodic_summary",
            MemoryType::SemanticKnowledge => "semantic_knowledge",
            MemoryType::SharedEntity => "shared_entity",
            MemoryType::SharedPersona => "shared_persona",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "working" => Some(MemoryType::Working),
            "semantic_cache" => Some(MemoryType::SemanticCache),
            "procedural_tool" => Some(MemoryType::ProceduralTool),
            "procedural_workflow" => Some(MemoryType::ProceduralWorkflow),
            "episodic_conversation" => Some(MemoryType::EpisodicConversation),
            "episodic_summary" => Some(MemoryType::EpisodicSummary),
            "semantic_knowledge" => Some(MemoryType::SemanticKnowledge),
            "shared_entity" => Some(MemoryType::SharedEntity),
            "shared_persona" => Some(MemoryType::SharedPersona),
            _ => None,
        }
    }

    /// All known types, for stats and tests.
    pub fn all() -> [MemoryType; 9] {
        [
            MemoryType::Working,
            MemoryType::SemanticCache,
            MemoryType::ProceduralTool,
            MemoryType::ProceduralWorkflow,
            MemoryType::EpisodicConversation,
            MemoryType::EpisodicSummary,
            MemoryType::SemanticKnowledge,
            MemoryType::SharedEntity,
            MemoryType::SharedPersona,
        ]
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    /// Derived from `memory_type` at creation; write-once.
    pub tier: MemoryTier,
    pub memory_type: MemoryType,
    /// Owning user; `None` with `shared = false` means system-scoped.
    pub owner: Option<String>,
    /// Family/system-wide visibility.
    pub shared: bool,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    /// Mirrors `embedding` presence so queries can filter without
    /// fetching the vector.
    pub has_embedding: bool,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Logical event time; usually equals `created_at`.
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    /// Set at creation for every STM record, absent for LTM.
    pub expires_at: Option<DateTime<Utc>>,
    pub importance_score: f64,
    pub decay_score: f64,
    pub access_count: u64,
    /// STM record this was promoted from, if any.
    pub promoted_from: Option<MemoryId>,
    /// Summary that superseded this record; also marks a promoted source.
    pub consolidated_into: Option<MemoryId>,
    pub related_memories: Vec<MemoryId>,
    /// Type-specific fields, see [`meta`].
    pub metadata: Map<String, Value>,
}

impl MemoryRecord {
    /// Create a record with the tier derived from `memory_type`.
    pub fn new(memory_type: MemoryType, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MemoryId::new(),
            tier: memory_type.tier(),
            memory_type,
            owner: None,
            shared: false,
            content: content.into(),
            embedding: None,
            has_embedding: false,
            session_id: None,
            conversation_id: None,
            timestamp: now,
            created_at: now,
            last_accessed: None,
            expires_at: None,
            importance_score: DEFAULT_IMPORTANCE_SCORE,
            decay_score: DEFAULT_DECAY_SCORE,
            access_count: 0,
            promoted_from: None,
            consolidated_into: None,
            related_memories: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance_score = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.has_embedding = !embedding.is_empty();
        self.embedding = Some(embedding);
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Logically superseded by a summary, or already promoted.
    pub fn is_consolidated(&self) -> bool {
        self.consolidated_into.is_some()
    }
}

/// Request to store a new record.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub memory_type: MemoryType,
    pub content: String,
    pub owner: Option<String>,
    pub shared: bool,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub importance_score: f64,
    /// Ask the embedding collaborator for a vector. Failure is non-fatal.
    pub want_embedding: bool,
    /// STM expiry; ignored for LTM types. STM records with no TTL get the
    /// store's default.
    pub ttl: Option<Duration>,
    pub promoted_from: Option<MemoryId>,
    pub metadata: Map<String, Value>,
}

impl StoreRequest {
    pub fn new(memory_type: MemoryType, content: impl Into<String>) -> Self {
        Self {
            memory_type,
            content: content.into(),
            owner: None,
            shared: false,
            session_id: None,
            conversation_id: None,
            importance_score: DEFAULT_IMPORTANCE_SCORE,
            want_embedding: true,
            ttl: None,
            promoted_from: None,
            metadata: Map::new(),
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

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance_score = importance.clamp(0.0, 1.0);
        self
    }

    pub fn want_embedding(mut self, want: bool) -> Self {
        self.want_embedding = want;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn promoted_from(mut self, source: MemoryId) -> Self {
        self.promoted_from = Some(source);
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Partial update of a record's mutable fields.
///
/// Identity, `created_at`, `tier`, and `memory_type` are immutable by
/// construction: the patch has no way to name them.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpdate {
    pub content: Option<String>,
    pub importance_score: Option<f64>,
    pub decay_score: Option<f64>,
    pub shared: Option<bool>,
    /// Replaces the whole metadata bag when set.
    pub metadata: Option<Map<String, Value>>,
}

impl MemoryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance_score = Some(importance.clamp(0.0, 1.0));
        self
    }

    pub fn decay(mut self, decay: f64) -> Self {
        self.decay_score = Some(decay.clamp(0.0, 1.0));
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.importance_score.is_none()
            && self.decay_score.is_none()
            && self.shared.is_none()
            && self.metadata.is_none()
    }
}

/// Per-type aggregate statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeStats {
    pub count: u64,
    pub avg_importance: f64,
    pub avg_decay: f64,
}

/// Per-tier aggregate statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    pub total: u64,
    pub types: HashMap<MemoryType, TypeStats>,
}

/// Memory statistics grouped by tier and type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub stm: TierStats,
    pub ltm: TierStats,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_derivation() {
        for memory_type in MemoryType::all() {
            let expected = matches!(
                memory_type,
                MemoryType::Working | MemoryType::SemanticCache
            );
            assert_eq!(memory_type.tier() == MemoryTier::Stm, expected);
        }
    }

    #[test]
    fn test_type_round_trip() {
        for memory_type in MemoryType::all() {
            assert_eq!(MemoryType::parse(memory_type.as_str()), Some(memory_type));
        }
        assert_eq!(MemoryType::parse("episodic"), None);
    }

    #[test]
    fn test_tier_round_trip() {
        assert_eq!(MemoryTier::parse("stm"), Some(MemoryTier::Stm));
        assert_eq!(MemoryTier::parse("ltm"), Some(MemoryTier::Ltm));
        assert_eq!(MemoryTier::parse("mid"), None);
    }

    #[test]
    fn test_record_defaults() {
        let record = MemoryRecord::new(MemoryType::Working, "hello");

        assert_eq!(record.tier, MemoryTier::Stm);
        assert_eq!(record.importance_score, 0.5);
        assert_eq!(record.decay_score, 1.0);
        assert_eq!(record.access_count, 0);
        assert_eq!(record.timestamp, record.created_at);
        assert!(record.last_accessed.is_none());
        assert!(!record.has_embedding);
        assert!(!record.is_consolidated());
    }

    #[test]
    fn test_record_builders() {
        let record = MemoryRecord::new(MemoryType::SemanticKnowledge, "fact")
            .with_owner("alice")
            .with_session("s1")
            .with_importance(1.7)
            .with_embedding(vec![0.1, 0.2])
            .with_meta(meta::ROLE, "assistant");

        assert_eq!(record.tier, MemoryTier::Ltm);
        assert_eq!(record.owner.as_deref(), Some("alice"));
        assert_eq!(record.importance_score, 1.0);
        assert!(record.has_embedding);
        assert_eq!(
            record.metadata.get(meta::ROLE).and_then(|v| v.as_str()),
            Some("assistant")
        );
    }

    #[test]
    fn test_record_expiry() {
        let now = Utc::now();
        let record = MemoryRecord::new(MemoryType::Working, "x")
            .with_expires_at(now - chrono::Duration::seconds(1));
        assert!(record.is_expired(now));

        let record =
            MemoryRecord::new(MemoryType::Working, "x").with_expires_at(now + chrono::Duration::hours(8));
        assert!(!record.is_expired(now));
    }

    #[test]
    fn test_update_is_empty() {
        assert!(MemoryUpdate::new().is_empty());
        assert!(!MemoryUpdate::new().content("x").is_empty());
        assert!(!MemoryUpdate::new().decay(0.4).is_empty());
    }

    #[test]
    fn test_memory_id_round_trip() {
        let id = MemoryId::new();
        let parsed = MemoryId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
