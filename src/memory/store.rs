//! Memory store contract and SQLite-backed implementation.
//!
//! [`MemoryStore`] is the seam between the engine and the backing store:
//! document CRUD, filtered scans, lexical relevance search, bounded vector
//! similarity search, TTL expiry, and the single-field compare-and-set used
//! to guarantee at-most-once promotion and consolidation. Any backend
//! satisfying the contract is substitutable; [`SqliteMemoryStore`] is the
//! shipped implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::memory::schema::{initialize_schema, is_initialized};
use crate::memory::scoring::cosine_similarity;
use crate::memory::types::{
    MemoryId, MemoryRecord, MemoryStats, MemoryTier, MemoryType, MemoryUpdate, StoreRequest,
    TypeStats,
};

/// Filter shared by the search entry points. An `owner` restricts results to
/// that user's records plus shared ones.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub owner: Option<String>,
    pub memory_types: Option<Vec<MemoryType>>,
    pub tier: Option<MemoryTier>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
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
}

/// A record with the relevance score a search assigned to it.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f64,
}

/// Backing-store contract for the memory engine.
///
/// Expired STM records are unreachable from every read method. Scans and
/// searches that feed retrieval or promotion exclude records carrying a
/// consolidation link; session scans keep them so a transcript survives
/// promotion of its messages.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store a new record, deriving the tier from the type. Blank content is
    /// rejected with [`Error::EmptyContent`]. Embedding failures degrade to
    /// a vector-less record.
    async fn store(&self, request: StoreRequest) -> Result<MemoryId>;

    /// Insert a fully-built record, validating tier/expiry invariants.
    async fn insert(&self, record: &MemoryRecord) -> Result<()>;

    /// Point lookup. Side effect: bumps `access_count` and refreshes
    /// `last_accessed` (both forward-only).
    async fn get(&self, id: &MemoryId) -> Result<MemoryRecord>;

    /// Patch mutable fields. Returns false when nothing matched.
    async fn update(&self, id: &MemoryId, update: MemoryUpdate) -> Result<bool>;

    /// Hard delete. Returns false when nothing matched.
    async fn delete(&self, id: &MemoryId) -> Result<bool>;

    /// Records of one type, most recent first.
    async fn find_by_type(
        &self,
        memory_type: MemoryType,
        owner: Option<&str>,
        include_shared: bool,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>>;

    /// The most recent `limit` records of a session, returned oldest first
    /// so callers can reconstruct a transcript.
    async fn find_by_session(
        &self,
        session_id: &str,
        memory_types: Option<&[MemoryType]>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>>;

    /// A user's records, most recent first.
    async fn find_by_user(
        &self,
        owner: &str,
        tier: Option<MemoryTier>,
        include_shared: bool,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>>;

    /// Lexical relevance search, best match first.
    async fn text_search(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>>;

    /// Top-`limit` records by cosine similarity against `embedding`, best
    /// first, keeping only scores at or above `min_score`.
    async fn vector_search(
        &self,
        embedding: &[f32],
        filter: &MemoryFilter,
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredMemory>>;

    /// Counts and score averages grouped by tier and type.
    async fn stats(&self, owner: Option<&str>) -> Result<MemoryStats>;

    /// Set `consolidated_into` only if it is currently absent. The
    /// at-most-once guard for promotion and consolidation.
    async fn link_consolidation(&self, id: &MemoryId, target: &MemoryId) -> Result<bool>;

    /// Set the importance score (clamped to [0, 1]).
    async fn set_importance(&self, id: &MemoryId, importance: f64) -> Result<bool>;

    /// Add `delta` to the importance score, clamped to [0, 1].
    async fn adjust_importance(&self, id: &MemoryId, delta: f64) -> Result<bool>;

    /// Persist a recomputed decay score.
    async fn set_decay(&self, id: &MemoryId, decay: f64) -> Result<bool>;

    /// Atomically bump a cache entry's hit counter and refresh access.
    async fn record_cache_hit(&self, id: &MemoryId) -> Result<()>;

    /// Newest non-expired semantic cache entry for a query hash, visible to
    /// `owner` (own or shared).
    async fn find_cache_entry(
        &self,
        query_hash: &str,
        owner: Option<&str>,
    ) -> Result<Option<MemoryRecord>>;

    /// Working records of a session at or above `min_importance` with no
    /// promotion linkage yet, oldest first.
    async fn find_promotable(
        &self,
        session_id: &str,
        min_importance: f64,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>>;

    /// A batch of LTM records for decay recomputation, oldest first.
    async fn decay_batch(&self, owner: Option<&str>, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Count of conversations ready for consolidation: decayed below the
    /// cutoff and not yet linked.
    async fn count_consolidation_candidates(
        &self,
        owner: Option<&str>,
        decay_cutoff: f64,
    ) -> Result<u64>;

    /// Remove records whose expiry has passed. Defensive sweep backing the
    /// per-query expiry predicates.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Shared entity record by case-insensitive name.
    async fn find_entity(&self, entity_name: &str) -> Result<Option<MemoryRecord>>;
}

const COLUMNS: &str = "id, tier, memory_type, owner, shared, content, embedding, has_embedding, \
     session_id, conversation_id, timestamp, created_at, last_accessed, expires_at, \
     importance_score, decay_score, access_count, promoted_from, consolidated_into, \
     related_memories, metadata";

const COLUMNS_M: &str = "m.id, m.tier, m.memory_type, m.owner, m.shared, m.content, m.embedding, \
     m.has_embedding, m.session_id, m.conversation_id, m.timestamp, m.created_at, \
     m.last_accessed, m.expires_at, m.importance_score, m.decay_score, m.access_count, \
     m.promoted_from, m.consolidated_into, m.related_memories, m.metadata";

type BoxedParams = Vec<Box<dyn rusqlite::ToSql>>;

/// SQLite-backed memory store.
///
/// SQLite has no native ANN index, so `vector_search` is a brute-force
/// cosine scan bounded by `scan_cap` newest embedded candidates — bounded
/// cost at the price of recall on large collections. Lexical search uses
/// the FTS5 index kept in sync by triggers.
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
    embedder: Option<Arc<dyn Embedder>>,
    scan_cap: usize,
    default_stm_ttl: Duration,
}

impl SqliteMemoryStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;
        }

        Ok(Self::from_connection(conn, embedder))
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;

        Ok(Self::from_connection(conn, embedder))
    }

    fn from_connection(conn: Connection, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
            scan_cap: 500,
            default_stm_ttl: Duration::from_secs(8 * 60 * 60),
        }
    }

    /// Override the brute-force vector scan cap.
    pub fn with_scan_cap(mut self, cap: usize) -> Self {
        self.scan_cap = cap;
        self
    }

    /// Override the TTL applied to STM records stored without one.
    pub fn with_default_stm_ttl(mut self, ttl: Duration) -> Self {
        self.default_stm_ttl = ttl;
        self
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::storage(e.to_string()))
    }

    fn query_records(&self, sql: &str, params_vec: &BoxedParams) -> Result<Vec<MemoryRecord>> {
        self.with_conn(|conn| {
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(sql)?;
            let records = stmt
                .query_map(params_refs.as_slice(), Self::row_to_record)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(records)
        })
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<MemoryRecord> {
        let id_str: String = row.get(0)?;
        let tier_str: String = row.get(1)?;
        let type_str: String = row.get(2)?;

        let id = MemoryId::parse(&id_str)
            .map_err(|e| column_error(0, format!("invalid memory id: {}", e)))?;
        let tier = MemoryTier::parse(&tier_str)
            .ok_or_else(|| column_error(1, format!("unknown tier: {}", tier_str)))?;
        let memory_type = MemoryType::parse(&type_str)
            .ok_or_else(|| column_error(2, format!("unknown memory type: {}", type_str)))?;

        let embedding: Option<Vec<f32>> = row.get::<_, Option<Vec<u8>>>(6)?.map(|bytes| {
            bytes
                .chunks(4)
                .map(|chunk| {
                    let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
                    f32::from_le_bytes(arr)
                })
                .collect()
        });

        let related_memories: Vec<MemoryId> = row
            .get::<_, Option<String>>(19)?
            .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
            .map(|ids| ids.iter().filter_map(|s| MemoryId::parse(s).ok()).collect())
            .unwrap_or_default();

        let metadata: Map<String, Value> = row
            .get::<_, Option<String>>(20)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Ok(MemoryRecord {
            id,
            tier,
            memory_type,
            owner: row.get(3)?,
            shared: row.get::<_, i64>(4)? != 0,
            content: row.get(5)?,
            has_embedding: row.get::<_, i64>(7)? != 0,
            embedding,
            session_id: row.get(8)?,
            conversation_id: row.get(9)?,
            timestamp: parse_datetime(row.get::<_, String>(10)?),
            created_at: parse_datetime(row.get::<_, String>(11)?),
            last_accessed: row.get::<_, Option<String>>(12)?.map(parse_datetime),
            expires_at: row.get::<_, Option<String>>(13)?.map(parse_datetime),
            importance_score: row.get(14)?,
            decay_score: row.get(15)?,
            access_count: row.get::<_, i64>(16)? as u64,
            promoted_from: row
                .get::<_, Option<String>>(17)?
                .and_then(|s| MemoryId::parse(&s).ok()),
            consolidated_into: row
                .get::<_, Option<String>>(18)?
                .and_then(|s| MemoryId::parse(&s).ok()),
            related_memories,
            metadata,
        })
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn store(&self, request: StoreRequest) -> Result<MemoryId> {
        if request.content.trim().is_empty() {
            return Err(Error::EmptyContent);
        }

        let mut record = MemoryRecord::new(request.memory_type, request.content);
        record.owner = request.owner;
        record.shared = request.shared;
        record.session_id = request.session_id;
        record.conversation_id = request.conversation_id;
        record.importance_score = request.importance_score.clamp(0.0, 1.0);
        record.promoted_from = request.promoted_from;
        record.metadata = request.metadata;

        if record.tier == MemoryTier::Stm {
            let ttl = request.ttl.unwrap_or(self.default_stm_ttl);
            let ttl = ChronoDuration::from_std(ttl)
                .map_err(|e| Error::Internal(format!("invalid TTL: {}", e)))?;
            record.expires_at = Some(record.created_at + ttl);
        }

        if request.want_embedding {
            if let Some(embedder) = &self.embedder {
                match embedder.embed(&record.content).await {
                    Ok(vector) if !vector.is_empty() => {
                        record.embedding = Some(vector);
                        record.has_embedding = true;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(id = %record.id, "embedding failed, storing without vector: {}", e)
                    }
                }
            }
        }

        self.insert(&record).await?;
        debug!(id = %record.id, memory_type = %record.memory_type, "stored memory");
        Ok(record.id)
    }

    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        if record.tier != record.memory_type.tier() {
            return Err(Error::Internal(format!(
                "tier {} does not match memory type {}",
                record.tier, record.memory_type
            )));
        }
        match record.tier {
            MemoryTier::Stm => match record.expires_at {
                Some(at) if at > record.created_at => {}
                _ => {
                    return Err(Error::Internal(
                        "short-term records need an expiry after creation".to_string(),
                    ))
                }
            },
            MemoryTier::Ltm => {
                if record.expires_at.is_some() {
                    return Err(Error::Internal(
                        "long-term records must not carry an expiry".to_string(),
                    ));
                }
            }
        }

        let embedding_blob = record
            .embedding
            .as_ref()
            .map(|e| e.iter().flat_map(|f| f.to_le_bytes()).collect::<Vec<u8>>());

        let related = serde_json::to_string(
            &record
                .related_memories
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        )?;
        let metadata = serde_json::to_string(&record.metadata)?;

        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO memories ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                    COLUMNS
                ),
                params![
                    record.id.to_string(),
                    record.tier.as_str(),
                    record.memory_type.as_str(),
                    record.owner,
                    record.shared as i64,
                    record.content,
                    embedding_blob,
                    record.has_embedding as i64,
                    record.session_id,
                    record.conversation_id,
                    record.timestamp.to_rfc3339(),
                    record.created_at.to_rfc3339(),
                    record.last_accessed.map(|t| t.to_rfc3339()),
                    record.expires_at.map(|t| t.to_rfc3339()),
                    record.importance_score,
                    record.decay_score,
                    record.access_count as i64,
                    record.promoted_from.as_ref().map(ToString::to_string),
                    record.consolidated_into.as_ref().map(ToString::to_string),
                    related,
                    metadata,
                ],
            )?;
            Ok(())
        })
    }

    async fn get(&self, id: &MemoryId) -> Result<MemoryRecord> {
        let now = Utc::now();
        let record = self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM memories
                     WHERE id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    COLUMNS
                ),
                params![id.to_string(), now.to_rfc3339()],
                Self::row_to_record,
            )
            .optional()
        })?;

        let record = record.ok_or_else(|| Error::not_found(id))?;

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed = ?2
                 WHERE id = ?1",
                params![id.to_string(), now.to_rfc3339()],
            )?;
            Ok(())
        })?;

        Ok(record)
    }

    async fn update(&self, id: &MemoryId, update: MemoryUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut params_vec: BoxedParams = Vec::new();

        if let Some(content) = update.content {
            sets.push("content = ?");
            params_vec.push(Box::new(content));
        }
        if let Some(importance) = update.importance_score {
            sets.push("importance_score = ?");
            params_vec.push(Box::new(importance.clamp(0.0, 1.0)));
        }
        if let Some(decay) = update.decay_score {
            sets.push("decay_score = ?");
            params_vec.push(Box::new(decay.clamp(0.0, 1.0)));
        }
        if let Some(shared) = update.shared {
            sets.push("shared = ?");
            params_vec.push(Box::new(shared as i64));
        }
        if let Some(metadata) = update.metadata {
            sets.push("metadata = ?");
            params_vec.push(Box::new(serde_json::to_string(&metadata)?));
        }
        params_vec.push(Box::new(id.to_string()));

        let sql = format!("UPDATE memories SET {} WHERE id = ?", sets.join(", "));
        let rows = self.with_conn(|conn| {
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            conn.execute(&sql, params_refs.as_slice())
        })?;

        Ok(rows > 0)
    }

    async fn delete(&self, id: &MemoryId) -> Result<bool> {
        let rows = self.with_conn(|conn| {
            conn.execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])
        })?;
        Ok(rows > 0)
    }

    async fn find_by_type(
        &self,
        memory_type: MemoryType,
        owner: Option<&str>,
        include_shared: bool,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!(
            "SELECT {} FROM memories WHERE memory_type = ? AND consolidated_into IS NULL",
            COLUMNS
        );
        let mut params_vec: BoxedParams = vec![Box::new(memory_type.as_str())];
        push_live(&mut sql, &mut params_vec, Utc::now());

        if let Some(owner) = owner {
            if include_shared {
                sql.push_str(" AND (owner = ? OR shared = 1)");
            } else {
                sql.push_str(" AND owner = ?");
            }
            params_vec.push(Box::new(owner.to_string()));
        }

        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        self.query_records(&sql, &params_vec)
    }

    async fn find_by_session(
        &self,
        session_id: &str,
        memory_types: Option<&[MemoryType]>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!("SELECT {} FROM memories WHERE session_id = ?", COLUMNS);
        let mut params_vec: BoxedParams = vec![Box::new(session_id.to_string())];
        push_live(&mut sql, &mut params_vec, Utc::now());

        if let Some(types) = memory_types {
            push_type_filter(&mut sql, &mut params_vec, types);
        }

        // Most recent N, then reversed into transcript order.
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        let mut records = self.query_records(&sql, &params_vec)?;
        records.reverse();
        Ok(records)
    }

    async fn find_by_user(
        &self,
        owner: &str,
        tier: Option<MemoryTier>,
        include_shared: bool,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!(
            "SELECT {} FROM memories WHERE consolidated_into IS NULL",
            COLUMNS
        );
        let mut params_vec: BoxedParams = Vec::new();
        push_live(&mut sql, &mut params_vec, Utc::now());

        if include_shared {
            sql.push_str(" AND (owner = ? OR shared = 1)");
        } else {
            sql.push_str(" AND owner = ?");
        }
        params_vec.push(Box::new(owner.to_string()));

        if let Some(tier) = tier {
            sql.push_str(" AND tier = ?");
            params_vec.push(Box::new(tier.as_str()));
        }

        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        self.query_records(&sql, &params_vec)
    }

    async fn text_search(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let mut sql = format!(
            "SELECT {}, rank FROM memories m JOIN memories_fts f ON m.rowid = f.rowid
             WHERE memories_fts MATCH ? AND consolidated_into IS NULL",
            COLUMNS_M
        );
        let mut params_vec: BoxedParams = vec![Box::new(match_expr)];
        push_live(&mut sql, &mut params_vec, Utc::now());
        push_filter(&mut sql, &mut params_vec, filter);

        sql.push_str(" ORDER BY rank LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        self.with_conn(|conn| {
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let hits = stmt
                .query_map(params_refs.as_slice(), |row| {
                    let record = Self::row_to_record(row)?;
                    // FTS5 rank is bm25: smaller (more negative) is better.
                    let rank: f64 = row.get(21)?;
                    Ok(ScoredMemory {
                        record,
                        score: -rank,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(hits)
        })
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        filter: &MemoryFilter,
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<ScoredMemory>> {
        if embedding.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {} FROM memories
             WHERE has_embedding = 1 AND consolidated_into IS NULL",
            COLUMNS
        );
        let mut params_vec: BoxedParams = Vec::new();
        push_live(&mut sql, &mut params_vec, Utc::now());
        push_filter(&mut sql, &mut params_vec, filter);

        // Brute-force scan over the newest embedded candidates, bounded by
        // scan_cap.
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT ?");
        params_vec.push(Box::new(self.scan_cap as i64));

        let candidates = self.query_records(&sql, &params_vec)?;

        let mut hits: Vec<ScoredMemory> = candidates
            .into_iter()
            .filter_map(|record| {
                let score = record
                    .embedding
                    .as_deref()
                    .map(|e| cosine_similarity(embedding, e))
                    .unwrap_or(0.0);
                (score >= min_score).then_some(ScoredMemory { record, score })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.record.timestamp.cmp(&a.record.timestamp))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn stats(&self, owner: Option<&str>) -> Result<MemoryStats> {
        let mut sql = String::from(
            "SELECT tier, memory_type, COUNT(*), AVG(importance_score), AVG(decay_score)
             FROM memories WHERE 1=1",
        );
        let mut params_vec: BoxedParams = Vec::new();
        push_live(&mut sql, &mut params_vec, Utc::now());

        if let Some(owner) = owner {
            sql.push_str(" AND (owner = ? OR shared = 1)");
            params_vec.push(Box::new(owner.to_string()));
        }

        sql.push_str(" GROUP BY tier, memory_type");

        let rows: Vec<(String, String, u64, f64, f64)> = self.with_conn(|conn| {
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_refs.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                        row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                    ))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })?;

        let mut stats = MemoryStats::default();
        for (tier_str, type_str, count, avg_importance, avg_decay) in rows {
            let (Some(tier), Some(memory_type)) =
                (MemoryTier::parse(&tier_str), MemoryType::parse(&type_str))
            else {
                continue;
            };

            let tier_stats = match tier {
                MemoryTier::Stm => &mut stats.stm,
                MemoryTier::Ltm => &mut stats.ltm,
            };
            tier_stats.total += count;
            tier_stats.types.insert(
                memory_type,
                TypeStats {
                    count,
                    avg_importance,
                    avg_decay,
                },
            );
            stats.total += count;
        }

        Ok(stats)
    }

    async fn link_consolidation(&self, id: &MemoryId, target: &MemoryId) -> Result<bool> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET consolidated_into = ?2
                 WHERE id = ?1 AND consolidated_into IS NULL",
                params![id.to_string(), target.to_string()],
            )
        })?;
        Ok(rows > 0)
    }

    async fn set_importance(&self, id: &MemoryId, importance: f64) -> Result<bool> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET importance_score = ?2 WHERE id = ?1",
                params![id.to_string(), importance.clamp(0.0, 1.0)],
            )
        })?;
        Ok(rows > 0)
    }

    async fn adjust_importance(&self, id: &MemoryId, delta: f64) -> Result<bool> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories
                 SET importance_score = MAX(0.0, MIN(1.0, importance_score + ?2))
                 WHERE id = ?1",
                params![id.to_string(), delta],
            )
        })?;
        Ok(rows > 0)
    }

    async fn set_decay(&self, id: &MemoryId, decay: f64) -> Result<bool> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET decay_score = ?2 WHERE id = ?1",
                params![id.to_string(), decay.clamp(0.0, 1.0)],
            )
        })?;
        Ok(rows > 0)
    }

    async fn record_cache_hit(&self, id: &MemoryId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET
                     metadata = json_set(
                         COALESCE(metadata, '{}'),
                         '$.cache_hits',
                         COALESCE(json_extract(metadata, '$.cache_hits'), 0) + 1
                     ),
                     access_count = access_count + 1,
                     last_accessed = ?2
                 WHERE id = ?1",
                params![id.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    async fn find_cache_entry(
        &self,
        query_hash: &str,
        owner: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        let mut sql = format!(
            "SELECT {} FROM memories
             WHERE memory_type = 'semantic_cache'
               AND json_extract(metadata, '$.query_hash') = ?",
            COLUMNS
        );
        let mut params_vec: BoxedParams = vec![Box::new(query_hash.to_string())];
        push_live(&mut sql, &mut params_vec, Utc::now());

        if let Some(owner) = owner {
            sql.push_str(" AND (owner = ? OR shared = 1)");
            params_vec.push(Box::new(owner.to_string()));
        }

        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT 1");

        Ok(self.query_records(&sql, &params_vec)?.into_iter().next())
    }

    async fn find_promotable(
        &self,
        session_id: &str,
        min_importance: f64,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!(
            "SELECT {} FROM memories
             WHERE session_id = ? AND memory_type = 'working'
               AND importance_score >= ? AND consolidated_into IS NULL",
            COLUMNS
        );
        let mut params_vec: BoxedParams = vec![
            Box::new(session_id.to_string()),
            Box::new(min_importance),
        ];
        push_live(&mut sql, &mut params_vec, Utc::now());

        sql.push_str(" ORDER BY timestamp ASC, rowid ASC LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        self.query_records(&sql, &params_vec)
    }

    async fn decay_batch(&self, owner: Option<&str>, limit: usize) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!("SELECT {} FROM memories WHERE tier = 'ltm'", COLUMNS);
        let mut params_vec: BoxedParams = Vec::new();

        if let Some(owner) = owner {
            sql.push_str(" AND (owner = ? OR shared = 1)");
            params_vec.push(Box::new(owner.to_string()));
        }

        sql.push_str(" ORDER BY timestamp ASC, rowid ASC LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        self.query_records(&sql, &params_vec)
    }

    async fn count_consolidation_candidates(
        &self,
        owner: Option<&str>,
        decay_cutoff: f64,
    ) -> Result<u64> {
        let mut sql = String::from(
            "SELECT COUNT(*) FROM memories
             WHERE tier = 'ltm' AND memory_type = 'episodic_conversation'
               AND consolidated_into IS NULL AND decay_score < ?",
        );
        let mut params_vec: BoxedParams = vec![Box::new(decay_cutoff)];

        if let Some(owner) = owner {
            sql.push_str(" AND (owner = ? OR shared = 1)");
            params_vec.push(Box::new(owner.to_string()));
        }

        self.with_conn(|conn| {
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            conn.query_row(&sql, params_refs.as_slice(), |row| {
                row.get::<_, i64>(0).map(|n| n as u64)
            })
        })
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM memories WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now.to_rfc3339()],
            )
        })?;
        if rows > 0 {
            debug!(removed = rows, "swept expired memories");
        }
        Ok(rows as u64)
    }

    async fn find_entity(&self, entity_name: &str) -> Result<Option<MemoryRecord>> {
        let mut sql = format!(
            "SELECT {} FROM memories
             WHERE memory_type = 'shared_entity'
               AND lower(json_extract(metadata, '$.entity_name')) = lower(?)",
            COLUMNS
        );
        let mut params_vec: BoxedParams = vec![Box::new(entity_name.to_string())];
        push_live(&mut sql, &mut params_vec, Utc::now());
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT 1");

        Ok(self.query_records(&sql, &params_vec)?.into_iter().next())
    }
}

fn push_live(sql: &mut String, params_vec: &mut BoxedParams, now: DateTime<Utc>) {
    sql.push_str(" AND (expires_at IS NULL OR expires_at > ?)");
    params_vec.push(Box::new(now.to_rfc3339()));
}

fn push_type_filter(sql: &mut String, params_vec: &mut BoxedParams, types: &[MemoryType]) {
    let placeholders: Vec<&str> = types.iter().map(|_| "?").collect();
    sql.push_str(&format!(" AND memory_type IN ({})", placeholders.join(",")));
    for memory_type in types {
        params_vec.push(Box::new(memory_type.as_str()));
    }
}

fn push_filter(sql: &mut String, params_vec: &mut BoxedParams, filter: &MemoryFilter) {
    if let Some(owner) = &filter.owner {
        sql.push_str(" AND (owner = ? OR shared = 1)");
        params_vec.push(Box::new(owner.clone()));
    }
    if let Some(types) = &filter.memory_types {
        push_type_filter(sql, params_vec, types);
    }
    if let Some(tier) = filter.tier {
        sql.push_str(" AND tier = ?");
        params_vec.push(Box::new(tier.as_str()));
    }
}

/// Build a sanitized FTS5 MATCH expression: an OR of quoted alphanumeric
/// terms, so user punctuation cannot break the query syntax.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn column_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
