//! SQLite persistence for datasets, documents, segments, and the model
//! registry.
//!
//! ## Database schema
//!
//! ```sql
//! -- Datasets: retrieval configuration and model binding
//! CREATE TABLE datasets (
//!     id TEXT PRIMARY KEY,
//!     name TEXT,
//!     embedding_model_id TEXT,
//!     retrieval_mode TEXT,             -- vector | full_text | hybrid
//!     retrieval_config TEXT,           -- RetrievalSettings as JSON
//!     created_at INTEGER
//! );
//!
//! -- Documents: per-upload status roll-up
//! CREATE TABLE documents (
//!     id TEXT PRIMARY KEY,
//!     dataset_id TEXT REFERENCES datasets(id),
//!     name TEXT,                       -- source file name
//!     embedding_model_id TEXT,
//!     status TEXT, progress INTEGER, error TEXT,
//!     chunk_count INTEGER, character_count INTEGER
//! );
//!
//! -- Segments: the searchable unit
//! CREATE TABLE segments (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     document_id TEXT, dataset_id TEXT,
//!     chunk_index INTEGER, content TEXT, content_length INTEGER,
//!     embedding BLOB,                  -- f32 little-endian (optional)
//!     vector_dimension INTEGER, embedding_model_id TEXT,
//!     status TEXT, error TEXT, enabled INTEGER,
//!     metadata TEXT                    -- provenance JSON
//! );
//! ```
//!
//! A contentless-sync FTS5 table (`segments_fts`) shadows `segments.content`
//! through triggers and provides the lexical ranking operator.
//!
//! ## SQLite configuration
//!
//! WAL journal, normal synchronous, busy timeout, foreign keys, large page
//! size for embedding blobs, auto-vacuum.

use anyhow::{Context, Result, anyhow};
use quarry_embed::{ApiConfig, ModelConfig};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use super::{
    Dataset, Document, DocumentStatus, NewSegment, RetrievalMode, RetrievalSettings, Segment,
    SegmentId, SegmentStatus, StatusCounts,
};

/// A registered embedding or rerank model with its provider credentials.
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub model_id: String,
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub dimension: Option<usize>,
    pub max_batch_size: usize,
    pub max_text_length: Option<usize>,
    pub active: bool,
}

impl ModelRecord {
    pub fn new(
        model_id: impl Into<String>,
        provider: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            provider: provider.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            dimension: None,
            max_batch_size: 16,
            max_text_length: None,
            active: true,
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_text_length(mut self, max_text_length: usize) -> Self {
        self.max_text_length = Some(max_text_length);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Resolve this record into the call-time configuration struct.
    pub fn to_config(&self) -> ModelConfig {
        let mut config = ModelConfig::new(
            self.model_id.clone(),
            self.provider.clone(),
            ApiConfig::new(self.base_url.clone(), self.api_key.clone()),
        )
        .with_max_batch_size(self.max_batch_size);
        if let Some(dimension) = self.dimension {
            config = config.with_dimension(dimension);
        }
        if let Some(max_text_length) = self.max_text_length {
            config = config.with_max_text_length(max_text_length);
        }
        config
    }
}

/// Aggregate numbers for one dataset, recomputed from the rows themselves
/// rather than maintained as counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetStats {
    pub document_count: usize,
    pub chunk_count: usize,
    /// Bytes of stored content plus embedding blobs
    pub storage_size: usize,
}

/// SQLite-backed index over datasets, documents, and segments.
///
/// Cheap to clone (shares the connection pool); all writes that must be
/// atomic go through one transaction per call.
#[derive(Clone, Debug)]
pub struct SegmentIndex {
    pool: SqlitePool,
}

impl SegmentIndex {
    /// Open a persistent index at `base/quarry.db`.
    pub async fn open(base: &Path) -> Result<Self> {
        let db_path = base.join("quarry.db");

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true)
                .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Full)
                .page_size(1 << 16)
                .optimize_on_close(true, 1 << 10),
        )
        .await?;
        Self::new_with_pool(pool).await
    }

    /// Open an in-memory index, for tests.
    ///
    /// Pinned to a single connection: every pooled connection would
    /// otherwise get its own private `:memory:` database.
    pub async fn open_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS datasets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                embedding_model_id TEXT NOT NULL,
                retrieval_mode TEXT NOT NULL DEFAULT 'vector',
                retrieval_config TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                dataset_id TEXT NOT NULL,
                name TEXT NOT NULL,
                embedding_model_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                character_count INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (dataset_id) REFERENCES datasets(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                dataset_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                content_length INTEGER NOT NULL,
                embedding BLOB,
                vector_dimension INTEGER,
                embedding_model_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                metadata TEXT,
                CONSTRAINT unique_segment UNIQUE(document_id, chunk_index),
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Lexical search operator: external-content FTS5 kept in sync by
        // triggers so segment writes stay plain UPDATEs.
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS segments_fts
             USING fts5(content, content='segments', content_rowid='id')",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS segments_fts_insert AFTER INSERT ON segments BEGIN
                INSERT INTO segments_fts(rowid, content) VALUES (new.id, new.content);
            END
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS segments_fts_delete AFTER DELETE ON segments BEGIN
                INSERT INTO segments_fts(segments_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
            END
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS segments_fts_update AFTER UPDATE OF content ON segments BEGIN
                INSERT INTO segments_fts(segments_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
                INSERT INTO segments_fts(rowid, content) VALUES (new.id, new.content);
            END
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_models (
                model_id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_key TEXT NOT NULL,
                dimension INTEGER,
                max_batch_size INTEGER NOT NULL DEFAULT 16,
                max_text_length INTEGER,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_document ON segments(document_id, status)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_dataset ON segments(dataset_id, status)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_dataset ON documents(dataset_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Get the underlying SQLite connection pool for transactional callers.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── datasets ───────────────────────────────────────────────────

    pub async fn upsert_dataset(&self, dataset: &Dataset) -> Result<()> {
        let config_json = serde_json::to_string(&dataset.retrieval_config)?;
        sqlx::query(
            r#"
            INSERT INTO datasets (id, name, embedding_model_id, retrieval_mode, retrieval_config, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                embedding_model_id = excluded.embedding_model_id,
                retrieval_mode = excluded.retrieval_mode,
                retrieval_config = excluded.retrieval_config
            "#,
        )
        .bind(&dataset.id)
        .bind(&dataset.name)
        .bind(&dataset.embedding_model_id)
        .bind(dataset.retrieval_mode.as_str())
        .bind(config_json)
        .bind(dataset.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_dataset(&self, dataset_id: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE id = ?1")
            .bind(dataset_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let mode: String = row.get("retrieval_mode");
            let config_json: String = row.get("retrieval_config");
            Ok(Dataset {
                id: row.get("id"),
                name: row.get("name"),
                embedding_model_id: row.get("embedding_model_id"),
                retrieval_mode: RetrievalMode::parse(&mode)?,
                retrieval_config: serde_json::from_str::<RetrievalSettings>(&config_json)
                    .with_context(|| format!("corrupt retrieval_config for dataset {dataset_id}"))?,
                created_at: row.get("created_at"),
            })
        })
        .transpose()
    }

    // ── documents ──────────────────────────────────────────────────

    pub async fn upsert_document(&self, document: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
            (id, dataset_id, name, embedding_model_id, status, progress, error, chunk_count, character_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                embedding_model_id = excluded.embedding_model_id,
                status = excluded.status,
                progress = excluded.progress,
                error = excluded.error
            "#,
        )
        .bind(&document.id)
        .bind(&document.dataset_id)
        .bind(&document.name)
        .bind(&document.embedding_model_id)
        .bind(document.status.as_str())
        .bind(document.progress as i64)
        .bind(document.error.as_deref())
        .bind(document.chunk_count as i64)
        .bind(document.character_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| document_from_row(&row)).transpose()
    }

    pub async fn documents_of_dataset(&self, dataset_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE dataset_id = ?1 ORDER BY id")
            .bind(dataset_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    // ── segments ───────────────────────────────────────────────────

    /// Ingest segments for a document in one transaction, updating the
    /// document's chunk/character totals from the stored rows.
    pub async fn insert_segments(
        &self,
        document_id: &str,
        dataset_id: &str,
        segments: &[NewSegment],
    ) -> Result<Vec<SegmentId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(segments.len());

        for segment in segments {
            let metadata_json = segment
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let result = sqlx::query(
                r#"
                INSERT INTO segments
                (document_id, dataset_id, chunk_index, content, content_length, status, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                ON CONFLICT(document_id, chunk_index) DO UPDATE SET
                    content = excluded.content,
                    content_length = excluded.content_length,
                    status = 'pending',
                    embedding = NULL,
                    vector_dimension = NULL,
                    embedding_model_id = NULL,
                    error = NULL,
                    metadata = excluded.metadata
                "#,
            )
            .bind(document_id)
            .bind(dataset_id)
            .bind(segment.chunk_index as i64)
            .bind(&segment.content)
            .bind(segment.content.chars().count() as i64)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        sqlx::query(
            r#"
            UPDATE documents SET
                chunk_count = (SELECT COUNT(*) FROM segments WHERE document_id = ?1),
                character_count = (SELECT COALESCE(SUM(content_length), 0) FROM segments WHERE document_id = ?1)
            WHERE id = ?1
            "#,
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ids)
    }

    pub async fn get_segment(&self, id: SegmentId) -> Result<Option<Segment>> {
        let row = sqlx::query("SELECT * FROM segments WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| segment_from_row(&row)).transpose()
    }

    pub async fn segments_of_document(&self, document_id: &str) -> Result<Vec<Segment>> {
        let rows =
            sqlx::query("SELECT * FROM segments WHERE document_id = ?1 ORDER BY chunk_index")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(segment_from_row).collect()
    }

    /// Segments still awaiting vectorization, in stable chunk order.
    ///
    /// Completed and failed rows are deliberately excluded so a resumed run
    /// never touches work that already settled.
    pub async fn pending_segments(&self, document_id: &str) -> Result<Vec<Segment>> {
        let rows = sqlx::query(
            "SELECT * FROM segments WHERE document_id = ?1 AND status = 'pending' ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(segment_from_row).collect()
    }

    pub async fn count_pending_in_dataset(&self, dataset_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM segments WHERE dataset_id = ?1 AND status = 'pending'",
        )
        .bind(dataset_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    pub async fn set_segment_enabled(&self, id: SegmentId, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE segments SET enabled = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Per-status tallies for one document's segments.
    pub async fn status_counts(&self, document_id: &str) -> Result<StatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM segments WHERE document_id = ?1 GROUP BY status",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match SegmentStatus::parse(&status)? {
                SegmentStatus::Pending => counts.pending = n as usize,
                SegmentStatus::Processing => counts.processing = n as usize,
                SegmentStatus::Completed => counts.completed = n as usize,
                SegmentStatus::Failed => counts.failed = n as usize,
            }
        }
        Ok(counts)
    }

    // ── retrieval queries ──────────────────────────────────────────

    /// All embeddable candidates for a vector search: completed, enabled,
    /// with a stored vector. Returns each segment with its document's
    /// source file name.
    pub async fn vector_candidates(&self, dataset_id: &str) -> Result<Vec<(Segment, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT s.*, d.name AS document_name
            FROM segments s
            JOIN documents d ON d.id = s.document_id
            WHERE s.dataset_id = ?1
              AND s.status = 'completed'
              AND s.enabled = 1
              AND s.embedding IS NOT NULL
            "#,
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let name: String = row.get("document_name");
                Ok((segment_from_row(row)?, name))
            })
            .collect()
    }

    /// Lexical candidates ranked by bm25 for an FTS5 MATCH expression.
    ///
    /// The rank is negated bm25 (higher is better) and still on the raw
    /// bm25 scale; the retrieval engine normalizes it.
    pub async fn fts_candidates(
        &self,
        dataset_id: &str,
        match_expr: &str,
        limit: usize,
    ) -> Result<Vec<(Segment, String, f32)>> {
        let rows = sqlx::query(
            r#"
            SELECT s.*, d.name AS document_name, -bm25(segments_fts) AS lexical_rank
            FROM segments_fts
            JOIN segments s ON s.id = segments_fts.rowid
            JOIN documents d ON d.id = s.document_id
            WHERE segments_fts MATCH ?1
              AND s.dataset_id = ?2
              AND s.status = 'completed'
              AND s.enabled = 1
            ORDER BY lexical_rank DESC
            LIMIT ?3
            "#,
        )
        .bind(match_expr)
        .bind(dataset_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let name: String = row.get("document_name");
                let rank: f64 = row.get("lexical_rank");
                Ok((segment_from_row(row)?, name, rank as f32))
            })
            .collect()
    }

    // ── model registry ─────────────────────────────────────────────

    pub async fn register_model(&self, model: &ModelRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_models
            (model_id, provider, base_url, api_key, dimension, max_batch_size, max_text_length, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(model_id) DO UPDATE SET
                provider = excluded.provider,
                base_url = excluded.base_url,
                api_key = excluded.api_key,
                dimension = excluded.dimension,
                max_batch_size = excluded.max_batch_size,
                max_text_length = excluded.max_text_length,
                active = excluded.active
            "#,
        )
        .bind(&model.model_id)
        .bind(&model.provider)
        .bind(&model.base_url)
        .bind(&model.api_key)
        .bind(model.dimension.map(|d| d as i64))
        .bind(model.max_batch_size as i64)
        .bind(model.max_text_length.map(|l| l as i64))
        .bind(model.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_model(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        let row = sqlx::query("SELECT * FROM embedding_models WHERE model_id = ?1")
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| ModelRecord {
            model_id: row.get("model_id"),
            provider: row.get("provider"),
            base_url: row.get("base_url"),
            api_key: row.get("api_key"),
            dimension: row.get::<Option<i64>, _>("dimension").map(|d| d as usize),
            max_batch_size: row.get::<i64, _>("max_batch_size") as usize,
            max_text_length: row
                .get::<Option<i64>, _>("max_text_length")
                .map(|l| l as usize),
            active: row.get("active"),
        }))
    }

    /// A model that exists and is active, or `None` for both absence and
    /// inactivity — the two cases callers must treat the same way.
    pub async fn active_model(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        Ok(self.get_model(model_id).await?.filter(|m| m.active))
    }

    // ── aggregates ─────────────────────────────────────────────────

    /// Recompute dataset aggregates from the rows themselves.
    pub async fn dataset_stats(&self, dataset_id: &str) -> Result<DatasetStats> {
        let document_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE dataset_id = ?1")
                .bind(dataset_id)
                .fetch_one(&self.pool)
                .await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS chunks,
                   COALESCE(SUM(content_length), 0) AS content_size,
                   COALESCE(SUM(LENGTH(embedding)), 0) AS vector_size
            FROM segments WHERE dataset_id = ?1
            "#,
        )
        .bind(dataset_id)
        .fetch_one(&self.pool)
        .await?;

        let chunks: i64 = row.get("chunks");
        let content_size: i64 = row.get("content_size");
        let vector_size: i64 = row.get("vector_size");

        Ok(DatasetStats {
            document_count: document_count as usize,
            chunk_count: chunks as usize,
            storage_size: (content_size + vector_size) as usize,
        })
    }
}

/// Encode an embedding as a little-endian f32 blob.
pub(crate) fn embedding_to_blob(vector: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice::<f32, u8>(vector).to_vec()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        name: row.get("name"),
        embedding_model_id: row.get("embedding_model_id"),
        status: DocumentStatus::parse(&status)?,
        progress: row.get::<i64, _>("progress") as u8,
        error: row.get("error"),
        chunk_count: row.get::<i64, _>("chunk_count") as usize,
        character_count: row.get::<i64, _>("character_count") as usize,
    })
}

fn segment_from_row(row: &SqliteRow) -> Result<Segment> {
    let status: String = row.get("status");
    let embedding_bytes: Option<Vec<u8>> = row.get("embedding");
    let metadata_json: Option<String> = row.get("metadata");

    let embedding =
        embedding_bytes.map(|bytes| bytemuck::cast_slice::<u8, f32>(&bytes).to_vec());
    let metadata = metadata_json
        .map(|json| {
            serde_json::from_str(&json).map_err(|e| anyhow!("corrupt segment metadata: {e}"))
        })
        .transpose()?;

    Ok(Segment {
        id: row.get("id"),
        document_id: row.get("document_id"),
        dataset_id: row.get("dataset_id"),
        chunk_index: row.get::<i64, _>("chunk_index") as usize,
        content: row.get("content"),
        content_length: row.get::<i64, _>("content_length") as usize,
        embedding,
        vector_dimension: row
            .get::<Option<i64>, _>("vector_dimension")
            .map(|d| d as usize),
        embedding_model_id: row.get("embedding_model_id"),
        status: SegmentStatus::parse(&status)?,
        error: row.get("error"),
        enabled: row.get("enabled"),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_index() -> Result<SegmentIndex> {
        let index = SegmentIndex::open_memory().await?;
        index
            .upsert_dataset(&Dataset::new("ds-1", "handbook", "embed-small"))
            .await?;
        index
            .upsert_document(&Document::new("doc-1", "ds-1", "guide.md", "embed-small"))
            .await?;
        Ok(index)
    }

    #[tokio::test]
    async fn persistent_index_survives_reopen() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;

        {
            let index = SegmentIndex::open(temp_dir.path()).await?;
            index
                .upsert_dataset(&Dataset::new("ds-1", "handbook", "embed-small"))
                .await?;
        }

        let reopened = SegmentIndex::open(temp_dir.path()).await?;
        assert!(reopened.get_dataset("ds-1").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn dataset_round_trip() -> Result<()> {
        let index = seeded_index().await?;

        let fetched = index.get_dataset("ds-1").await?.unwrap();
        assert_eq!(fetched.name, "handbook");
        assert_eq!(fetched.retrieval_mode, RetrievalMode::Vector);
        assert_eq!(fetched.retrieval_config.top_k, 5);

        assert!(index.get_dataset("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn segment_ingestion_updates_document_totals() -> Result<()> {
        let index = seeded_index().await?;

        let ids = index
            .insert_segments(
                "doc-1",
                "ds-1",
                &[
                    NewSegment::new(0, "first chunk"),
                    NewSegment::new(1, "second chunk"),
                ],
            )
            .await?;
        assert_eq!(ids.len(), 2);

        let document = index.get_document("doc-1").await?.unwrap();
        assert_eq!(document.chunk_count, 2);
        assert_eq!(document.character_count, "first chunk".len() + "second chunk".len());

        let pending = index.pending_segments("doc-1").await?;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].chunk_index, 0);
        assert_eq!(pending[1].chunk_index, 1);
        assert!(pending.iter().all(|s| s.status == SegmentStatus::Pending));
        Ok(())
    }

    #[tokio::test]
    async fn vector_candidates_require_completed_and_enabled() -> Result<()> {
        let index = seeded_index().await?;
        let ids = index
            .insert_segments(
                "doc-1",
                "ds-1",
                &[NewSegment::new(0, "alpha"), NewSegment::new(1, "beta")],
            )
            .await?;

        // Complete the first segment with a stored vector, disable the second.
        sqlx::query(
            "UPDATE segments SET status = 'completed', embedding = ?1, vector_dimension = 2 WHERE id = ?2",
        )
        .bind(embedding_to_blob(&[1.0, 0.0]))
        .bind(ids[0])
        .execute(index.pool())
        .await?;
        sqlx::query(
            "UPDATE segments SET status = 'completed', embedding = ?1, vector_dimension = 2, enabled = 0 WHERE id = ?2",
        )
        .bind(embedding_to_blob(&[0.0, 1.0]))
        .bind(ids[1])
        .execute(index.pool())
        .await?;

        let candidates = index.vector_candidates("ds-1").await?;
        assert_eq!(candidates.len(), 1);
        let (segment, document_name) = &candidates[0];
        assert_eq!(segment.id, ids[0]);
        assert_eq!(segment.embedding.as_deref(), Some(&[1.0, 0.0][..]));
        assert_eq!(document_name, "guide.md");
        Ok(())
    }

    #[tokio::test]
    async fn fts_candidates_match_completed_segments() -> Result<()> {
        let index = seeded_index().await?;
        let ids = index
            .insert_segments(
                "doc-1",
                "ds-1",
                &[
                    NewSegment::new(0, "the quarterly revenue report"),
                    NewSegment::new(1, "holiday schedule for the office"),
                ],
            )
            .await?;
        sqlx::query("UPDATE segments SET status = 'completed' WHERE id IN (?1, ?2)")
            .bind(ids[0])
            .bind(ids[1])
            .execute(index.pool())
            .await?;

        let hits = index.fts_candidates("ds-1", "\"revenue\"", 10).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, ids[0]);
        assert!(hits[0].2 > 0.0, "negated bm25 rank should be positive");

        let none = index.fts_candidates("ds-1", "\"unmentioned\"", 10).await?;
        assert!(none.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn model_registry_round_trip() -> Result<()> {
        let index = seeded_index().await?;

        let model = ModelRecord::new("embed-small", "openai", "https://api.openai.com/v1", "sk-x")
            .with_dimension(1536)
            .with_max_batch_size(64);
        index.register_model(&model).await?;

        let fetched = index.active_model("embed-small").await?.unwrap();
        assert_eq!(fetched.dimension, Some(1536));
        assert_eq!(fetched.max_batch_size, 64);
        let config = fetched.to_config();
        assert_eq!(config.capabilities.dimension, Some(1536));

        index
            .register_model(&ModelRecord::new("old", "openai", "u", "k").inactive())
            .await?;
        assert!(index.active_model("old").await?.is_none());
        assert!(index.get_model("old").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn dataset_stats_recompute_from_rows() -> Result<()> {
        let index = seeded_index().await?;
        let ids = index
            .insert_segments("doc-1", "ds-1", &[NewSegment::new(0, "abcd")])
            .await?;
        sqlx::query("UPDATE segments SET embedding = ?1 WHERE id = ?2")
            .bind(embedding_to_blob(&[0.0, 1.0]))
            .bind(ids[0])
            .execute(index.pool())
            .await?;

        let stats = index.dataset_stats("ds-1").await?;
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.storage_size, 4 + 8);
        Ok(())
    }
}
