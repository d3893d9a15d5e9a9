//! # Dead-Letter Repository
//!
//! Terminal holding area for mutations that can never succeed.
//!
//! ## Move Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   move_to_dead_letter (ONE TRANSACTION)                 │
//! │                                                                         │
//! │  1. Re-read the record inside the transaction                          │
//! │  2. Check IN_PROGRESS / PENDING / RETRY → DEAD_LETTER is allowed       │
//! │  3. INSERT INTO dead_letters (full record JSON, reason, attempts)      │
//! │  4. DELETE FROM mutation_queue WHERE operation_id = ? AND status = ?   │
//! │  5. Same for every later unsynced step of its dependency group         │
//! │     (reason "predecessor step N failed")                               │
//! │                                                                         │
//! │  COMMIT ← a record is never in both tables, never in neither           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Resolving an entry only marks it; it never puts the record back in the
//! queue. Retrying is a fresh enqueue with a new operation id.

use billbook_core::clock::{from_millis, to_millis};
use billbook_core::{DeadLetterEntry, IdGenerator, MutationRecord, MutationStatus};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{error, info};

use crate::error::{DbError, DbResult};
use crate::repository::mutation_queue::MutationQueueRepository;

const DEAD_LETTER_COLUMNS: &str = "id, original_operation_id, record, failure_reason, \
    total_attempts, first_attempt_at, moved_at, is_resolved, resolution_notes, resolved_at";

#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    id: String,
    original_operation_id: String,
    record: String,
    failure_reason: String,
    total_attempts: i64,
    first_attempt_at: Option<i64>,
    moved_at: i64,
    is_resolved: bool,
    resolution_notes: Option<String>,
    resolved_at: Option<i64>,
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = DbError;

    fn try_from(row: DeadLetterRow) -> DbResult<Self> {
        Ok(DeadLetterEntry {
            id: row.id,
            original_operation_id: row.original_operation_id,
            record: serde_json::from_str(&row.record)?,
            failure_reason: row.failure_reason,
            total_attempts: row.total_attempts.max(0) as u32,
            first_attempt_at: row.first_attempt_at.map(from_millis),
            moved_to_dead_letter_at: from_millis(row.moved_at),
            is_resolved: row.is_resolved,
            resolution_notes: row.resolution_notes,
            resolved_at: row.resolved_at.map(from_millis),
        })
    }
}

/// Repository for dead-lettered mutations.
#[derive(Debug, Clone)]
pub struct DeadLetterRepository {
    pool: SqlitePool,
}

impl DeadLetterRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeadLetterRepository { pool }
    }

    /// Moves a queued record, and any later steps of its group, out of the
    /// queue atomically.
    ///
    /// ## Arguments
    /// * `operation_id` - Record to move
    /// * `reason` - Failure reason stored on the entry
    /// * `total_attempts` - Attempts made, including the one that just failed
    /// * `ids` - Source of dead-letter entry ids
    ///
    /// ## Returns
    /// The created entries, the requested record first.
    pub async fn move_to_dead_letter(
        &self,
        operation_id: &str,
        reason: &str,
        total_attempts: u32,
        now: DateTime<Utc>,
        ids: &dyn IdGenerator,
    ) -> DbResult<Vec<DeadLetterEntry>> {
        let mut tx = self.pool.begin().await?;

        let record = MutationQueueRepository::get_in(&mut tx, operation_id)
            .await?
            .ok_or_else(|| DbError::not_found("Mutation", operation_id))?;

        let mut moved = Vec::new();
        moved.push(Self::move_one_in(&mut tx, record.clone(), reason, total_attempts, now, ids).await?);

        if let Some(group) = &record.dependency_group {
            let followers =
                MutationQueueRepository::group_followers_in(&mut tx, group, record.step_number)
                    .await?;
            let cascade_reason = format!("predecessor step {} failed", record.step_number);

            for follower in followers {
                let attempts = follower.retry_count;
                moved.push(
                    Self::move_one_in(&mut tx, follower, &cascade_reason, attempts, now, ids)
                        .await?,
                );
            }
        }

        tx.commit().await?;

        for entry in &moved {
            error!(
                operation_id = %entry.original_operation_id,
                table = %entry.record.target_collection,
                total_attempts = entry.total_attempts,
                reason = %entry.failure_reason,
                "Mutation dead-lettered"
            );
        }

        Ok(moved)
    }

    async fn move_one_in(
        conn: &mut SqliteConnection,
        mut record: MutationRecord,
        reason: &str,
        total_attempts: u32,
        now: DateTime<Utc>,
        ids: &dyn IdGenerator,
    ) -> DbResult<DeadLetterEntry> {
        let from = record.status;
        record.transition(MutationStatus::DeadLetter, now)?;

        let entry = DeadLetterEntry::new(ids.next_id(), record, reason, total_attempts, now);

        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, original_operation_id, owner_id, target_collection, document_id,
                dependency_group, step_number, record, failure_reason, total_attempts,
                first_attempt_at, moved_at, is_resolved
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.original_operation_id)
        .bind(&entry.record.owner_id)
        .bind(&entry.record.target_collection)
        .bind(&entry.record.document_id)
        .bind(&entry.record.dependency_group)
        .bind(entry.record.step_number as i64)
        .bind(serde_json::to_string(&entry.record)?)
        .bind(&entry.failure_reason)
        .bind(entry.total_attempts as i64)
        .bind(entry.first_attempt_at.map(to_millis))
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

        MutationQueueRepository::delete_in(conn, &entry.original_operation_id, from).await?;

        Ok(entry)
    }

    /// Unresolved entries for one tenant, oldest first.
    pub async fn get_unresolved(&self, owner_id: &str) -> DbResult<Vec<DeadLetterEntry>> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
             WHERE owner_id = ?1 AND is_resolved = 0
             ORDER BY moved_at ASC, rowid ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeadLetterEntry::try_from).collect()
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<DeadLetterEntry>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, id).await
    }

    pub async fn get_in(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<DeadLetterEntry>> {
        let row: Option<DeadLetterRow> = sqlx::query_as(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(DeadLetterEntry::try_from).transpose()
    }

    /// Entry created for a given original operation, if any.
    pub async fn find_by_operation(&self, operation_id: &str) -> DbResult<Option<DeadLetterEntry>> {
        let row: Option<DeadLetterRow> = sqlx::query_as(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE original_operation_id = ?1"
        ))
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeadLetterEntry::try_from).transpose()
    }

    /// Marks an entry resolved. Resolving twice keeps the first notes.
    pub async fn resolve(
        &self,
        id: &str,
        notes: &str,
        now: DateTime<Utc>,
    ) -> DbResult<DeadLetterEntry> {
        let mut conn = self.pool.acquire().await?;
        Self::resolve_in(&mut conn, id, notes, now).await
    }

    pub async fn resolve_in(
        conn: &mut SqliteConnection,
        id: &str,
        notes: &str,
        now: DateTime<Utc>,
    ) -> DbResult<DeadLetterEntry> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters SET
                is_resolved = 1,
                resolution_notes = ?2,
                resolved_at = ?3
            WHERE id = ?1 AND is_resolved = 0
            "#,
        )
        .bind(id)
        .bind(notes)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

        let entry = Self::get_in(conn, id)
            .await?
            .ok_or_else(|| DbError::not_found("DeadLetter", id))?;

        if result.rows_affected() == 1 {
            info!(id = %id, operation_id = %entry.original_operation_id, "Dead letter resolved");
        }

        Ok(entry)
    }

    /// Unresolved entries across all tenants.
    pub async fn count_unresolved(&self) -> DbResult<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE is_resolved = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u32)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{grouped, pending, test_db};
    use billbook_core::SequentialIds;

    #[tokio::test]
    async fn test_move_is_atomic() {
        let db = test_db().await;
        let queue = db.mutation_queue();
        let record = pending("op-1", 100, 1_000);
        queue.insert(&record).await.unwrap();
        let claimed = queue.claim(&record, from_millis(2_000)).await.unwrap().unwrap();

        let ids = SequentialIds::new("dl");
        let moved = db
            .dead_letters()
            .move_to_dead_letter(&claimed.operation_id, "not_found", 1, from_millis(2_100), &ids)
            .await
            .unwrap();

        assert_eq!(moved.len(), 1);
        let entry = &moved[0];
        assert_eq!(entry.id, "dl-000001");
        assert_eq!(entry.original_operation_id, "op-1");
        assert_eq!(entry.failure_reason, "not_found");
        assert_eq!(entry.total_attempts, 1);
        assert_eq!(entry.first_attempt_at, Some(from_millis(2_000)));
        assert_eq!(entry.record.status, MutationStatus::DeadLetter);

        assert!(queue.get("op-1").await.unwrap().is_none());
        let stored = db.dead_letters().get("dl-000001").await.unwrap().unwrap();
        assert_eq!(&stored, entry);
        assert_eq!(queue.stats().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn test_moving_missing_record_fails() {
        let db = test_db().await;
        let ids = SequentialIds::new("dl");
        let err = db
            .dead_letters()
            .move_to_dead_letter("ghost", "x", 1, from_millis(0), &ids)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_group_followers_cascade() {
        let db = test_db().await;
        let queue = db.mutation_queue();
        for step in 1..=3 {
            queue
                .insert(&grouped(&format!("s{step}"), "g-1", step, 3, 1_000))
                .await
                .unwrap();
        }
        let step1 = queue.get("s1").await.unwrap().unwrap();
        let claimed = queue.claim(&step1, from_millis(2_000)).await.unwrap().unwrap();

        let ids = SequentialIds::new("dl");
        let moved = db
            .dead_letters()
            .move_to_dead_letter(&claimed.operation_id, "validation", 1, from_millis(2_100), &ids)
            .await
            .unwrap();

        let ops: Vec<&str> = moved.iter().map(|e| e.original_operation_id.as_str()).collect();
        assert_eq!(ops, vec!["s1", "s2", "s3"]);
        assert_eq!(moved[1].failure_reason, "predecessor step 1 failed");
        assert_eq!(moved[1].total_attempts, 0);

        assert_eq!(queue.stats().await.unwrap().outstanding(), 0);
        assert_eq!(db.dead_letters().get_unresolved("biz-1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_and_never_resurrects() {
        let db = test_db().await;
        let queue = db.mutation_queue();
        let record = pending("op-1", 100, 1_000);
        queue.insert(&record).await.unwrap();

        let ids = SequentialIds::new("dl");
        let moved = db
            .dead_letters()
            .move_to_dead_letter("op-1", "duplicate", 0, from_millis(1_500), &ids)
            .await
            .unwrap();
        let id = moved[0].id.clone();

        let resolved = db
            .dead_letters()
            .resolve(&id, "fixed by hand", from_millis(3_000))
            .await
            .unwrap();
        assert!(resolved.is_resolved);
        assert_eq!(resolved.resolved_at, Some(from_millis(3_000)));

        let again = db
            .dead_letters()
            .resolve(&id, "second note", from_millis(4_000))
            .await
            .unwrap();
        assert_eq!(again.resolution_notes.as_deref(), Some("fixed by hand"));

        assert!(db.dead_letters().get_unresolved("biz-1").await.unwrap().is_empty());
        assert!(queue.get("op-1").await.unwrap().is_none());

        let err = db
            .dead_letters()
            .resolve("nope", "", from_millis(0))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
