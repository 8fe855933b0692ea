//! Segment/document status state machine and transactional persistence
//!
//! Every status write in the system goes through this module. Document
//! status and progress are never set freely: outside of initialization they
//! are always recomputed from the segment aggregates by
//! [`derive_document_status`].

use anyhow::Result;
use sqlx::Row;
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::generator::{EmbedOutcome, SegmentEmbedding};
use crate::storage::{DocumentStatus, SegmentId, SegmentIndex, StatusCounts};
use crate::storage::segment_index::embedding_to_blob;

/// Derive a document's status and progress from its segment tallies.
///
/// - any pending or processing segment → `Processing`, progress from the
///   completed share;
/// - all failed → `Failed`, progress 0;
/// - some failed, some completed → `Error` (partial), progress from the
///   completed share;
/// - otherwise → `Completed`, progress 100.
///
/// A document with no segments derives `Completed`/100: there is nothing
/// left to do for it.
pub fn derive_document_status(counts: StatusCounts) -> (DocumentStatus, u8) {
    let total = counts.total();
    if total == 0 {
        return (DocumentStatus::Completed, 100);
    }

    let percent = ((counts.completed as f64 / total as f64) * 100.0).round() as u8;
    if counts.pending > 0 || counts.processing > 0 {
        (DocumentStatus::Processing, percent)
    } else if counts.failed == total {
        (DocumentStatus::Failed, 0)
    } else if counts.failed > 0 {
        (DocumentStatus::Error, percent)
    } else {
        (DocumentStatus::Completed, 100)
    }
}

/// Owner of all segment and document status transitions.
#[derive(Clone, Debug)]
pub struct StateManager {
    index: SegmentIndex,
}

impl StateManager {
    pub fn new(index: SegmentIndex) -> Self {
        Self { index }
    }

    /// Put a document into the processing state at the start of a run.
    pub async fn initialize_document(&self, document_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = 'processing', progress = 0, error = NULL WHERE id = ?1",
        )
        .bind(document_id)
        .execute(self.index.pool())
        .await?;
        Ok(())
    }

    /// Bulk-mark segments as processing before they are handed to the
    /// generator.
    pub async fn mark_segments_processing(&self, ids: &[SegmentId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!("UPDATE segments SET status = 'processing' WHERE id IN ({placeholders})");
        let mut query_builder = sqlx::query(&query);
        for id in ids {
            query_builder = query_builder.bind(id);
        }
        query_builder.execute(self.index.pool()).await?;
        Ok(())
    }

    /// Persist a run's embedding results in a single transaction.
    ///
    /// Successful results get their vector, dimension, and `completed`
    /// status; failed results get `failed` plus the error message. Every
    /// affected document's status and progress are then recomputed inside
    /// the same transaction, so readers never observe segments and documents
    /// out of step.
    pub async fn save_embedding_results(&self, results: &[SegmentEmbedding]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        let mut tx = self.index.pool().begin().await?;

        for result in results {
            match &result.outcome {
                EmbedOutcome::Embedded { vector } => {
                    sqlx::query(
                        r#"
                        UPDATE segments SET
                            embedding = ?1,
                            vector_dimension = ?2,
                            status = 'completed',
                            error = NULL
                        WHERE id = ?3
                        "#,
                    )
                    .bind(embedding_to_blob(vector))
                    .bind(vector.len() as i64)
                    .bind(result.segment_id)
                    .execute(&mut *tx)
                    .await?;
                }
                EmbedOutcome::Failed { error, .. } => {
                    sqlx::query(
                        r#"
                        UPDATE segments SET
                            embedding = NULL,
                            vector_dimension = NULL,
                            status = 'failed',
                            error = ?1
                        WHERE id = ?2
                        "#,
                    )
                    .bind(error)
                    .bind(result.segment_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        let affected: BTreeSet<&str> = results.iter().map(|r| r.document_id.as_str()).collect();
        for document_id in affected {
            let rows = sqlx::query(
                "SELECT status, COUNT(*) AS n FROM segments WHERE document_id = ?1 GROUP BY status",
            )
            .bind(document_id)
            .fetch_all(&mut *tx)
            .await?;

            let mut counts = StatusCounts::default();
            for row in rows {
                let status: String = row.get("status");
                let n: i64 = row.get("n");
                match crate::storage::SegmentStatus::parse(&status)? {
                    crate::storage::SegmentStatus::Pending => counts.pending = n as usize,
                    crate::storage::SegmentStatus::Processing => counts.processing = n as usize,
                    crate::storage::SegmentStatus::Completed => counts.completed = n as usize,
                    crate::storage::SegmentStatus::Failed => counts.failed = n as usize,
                }
            }

            let (status, progress) = derive_document_status(counts);
            sqlx::query("UPDATE documents SET status = ?1, progress = ?2 WHERE id = ?3")
                .bind(status.as_str())
                .bind(progress as i64)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
            debug!(document_id, status = status.as_str(), progress, "document status recomputed");
        }

        tx.commit().await?;
        Ok(())
    }

    /// Recompute one document's status and progress from its segments.
    pub async fn resync_document_status(&self, document_id: &str) -> Result<(DocumentStatus, u8)> {
        let counts = self.index.status_counts(document_id).await?;
        let (status, progress) = derive_document_status(counts);
        sqlx::query("UPDATE documents SET status = ?1, progress = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(progress as i64)
            .bind(document_id)
            .execute(self.index.pool())
            .await?;
        Ok((status, progress))
    }

    /// Coarse progress write outside the main transaction, for UI
    /// responsiveness during a long run.
    pub async fn update_document_progress(&self, document_id: &str, progress: u8) -> Result<()> {
        sqlx::query("UPDATE documents SET progress = ?1 WHERE id = ?2")
            .bind(progress.min(100) as i64)
            .bind(document_id)
            .execute(self.index.pool())
            .await?;
        Ok(())
    }

    /// Coarse progress write for several documents at once.
    pub async fn update_documents_progress(&self, document_ids: &[String], progress: u8) -> Result<()> {
        for document_id in document_ids {
            self.update_document_progress(document_id, progress).await?;
        }
        Ok(())
    }

    /// Mark a document failed with an entity-level error message.
    pub async fn mark_document_failed(&self, document_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = 'failed', progress = 0, error = ?1 WHERE id = ?2",
        )
        .bind(error)
        .bind(document_id)
        .execute(self.index.pool())
        .await?;
        Ok(())
    }

    /// Flip a document's failed segments back to pending. Returns how many
    /// were reset; a second consecutive call returns 0.
    pub async fn reset_failed_segments_by_document(&self, document_id: &str) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE segments SET status = 'pending', error = NULL WHERE document_id = ?1 AND status = 'failed'",
        )
        .bind(document_id)
        .execute(self.index.pool())
        .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Dataset-wide variant of
    /// [`reset_failed_segments_by_document`](Self::reset_failed_segments_by_document).
    pub async fn reset_failed_segments_by_dataset(&self, dataset_id: &str) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE segments SET status = 'pending', error = NULL WHERE dataset_id = ?1 AND status = 'failed'",
        )
        .bind(dataset_id)
        .execute(self.index.pool())
        .await?;
        Ok(result.rows_affected() as usize)
    }

    /// Rebind a dataset to a new embedding model, invalidating every child
    /// segment back to pending in one transaction. Existing vectors are
    /// dropped, never migrated. Returns the number of invalidated segments.
    pub async fn invalidate_dataset_embeddings(
        &self,
        dataset_id: &str,
        new_model_id: &str,
    ) -> Result<usize> {
        let mut tx = self.index.pool().begin().await?;

        sqlx::query("UPDATE datasets SET embedding_model_id = ?1 WHERE id = ?2")
            .bind(new_model_id)
            .bind(dataset_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE documents SET
                embedding_model_id = ?1, status = 'pending', progress = 0, error = NULL
            WHERE dataset_id = ?2
            "#,
        )
        .bind(new_model_id)
        .bind(dataset_id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            r#"
            UPDATE segments SET
                status = 'pending',
                embedding = NULL,
                vector_dimension = NULL,
                embedding_model_id = NULL,
                error = NULL
            WHERE dataset_id = ?1
            "#,
        )
        .bind(dataset_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let invalidated = result.rows_affected() as usize;
        info!(dataset_id, new_model_id, invalidated, "dataset embeddings invalidated");
        Ok(invalidated)
    }
}
