//! # Mutation Queue Repository
//!
//! The durable table of Mutation Records and the state-machine-gated update
//! path the dispatcher drives it through.
//!
//! ## Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  LOCAL WRITE (e.g., save a bill)                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. INSERT/UPDATE local_documents (the user's change)           │   │
//! │  │  2. INSERT INTO mutation_queue (status = 'pending')             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DISPATCHER                                                            │
//! │  1. select_eligible  (priority, age, group predecessor SYNCED)         │
//! │  2. claim            UPDATE ... WHERE status IN (pending, retry)       │
//! │                      rows_affected == 1 → this worker owns it          │
//! │  3. push, then one of:                                                 │
//! │     mark_synced      WHERE status = 'in_progress'                      │
//! │     mark_retry       WHERE status = 'in_progress', retry_count + 1     │
//! │     dead-letter      (see dead_letter repository)                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every update checks the in-memory transition against the state machine
//! first, then guards the SQL on the expected current status, so two paths
//! can never both settle the same record.

use billbook_core::clock::{from_millis, to_millis};
use billbook_core::{MutationRecord, MutationStatus, OperationType, QueueStats};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};

macro_rules! mutation_columns {
    () => {
        "operation_id, operation_type, target_collection, document_id, payload, \
         payload_hash, status, retry_count, last_error, created_at, first_attempt_at, \
         last_attempt_at, next_attempt_at, synced_at, priority, parent_operation_id, \
         step_number, total_steps, dependency_group, owner_id, user_id, device_id"
    };
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MutationRow {
    operation_id: String,
    operation_type: OperationType,
    target_collection: String,
    document_id: String,
    payload: String,
    payload_hash: String,
    status: MutationStatus,
    retry_count: i64,
    last_error: Option<String>,
    created_at: i64,
    first_attempt_at: Option<i64>,
    last_attempt_at: Option<i64>,
    next_attempt_at: Option<i64>,
    synced_at: Option<i64>,
    priority: i64,
    parent_operation_id: Option<String>,
    step_number: i64,
    total_steps: i64,
    dependency_group: Option<String>,
    owner_id: String,
    user_id: String,
    device_id: String,
}

impl TryFrom<MutationRow> for MutationRecord {
    type Error = DbError;

    fn try_from(row: MutationRow) -> DbResult<Self> {
        Ok(MutationRecord {
            operation_id: row.operation_id,
            operation_type: row.operation_type,
            target_collection: row.target_collection,
            document_id: row.document_id,
            payload: serde_json::from_str(&row.payload)?,
            payload_hash: row.payload_hash,
            status: row.status,
            retry_count: row.retry_count.max(0) as u32,
            last_error: row.last_error,
            created_at: from_millis(row.created_at),
            first_attempt_at: row.first_attempt_at.map(from_millis),
            last_attempt_at: row.last_attempt_at.map(from_millis),
            next_attempt_at: row.next_attempt_at.map(from_millis),
            synced_at: row.synced_at.map(from_millis),
            priority: row.priority as i32,
            parent_operation_id: row.parent_operation_id,
            step_number: row.step_number.max(1) as u32,
            total_steps: row.total_steps.max(1) as u32,
            dependency_group: row.dependency_group,
            owner_id: row.owner_id,
            user_id: row.user_id,
            device_id: row.device_id,
        })
    }
}

fn into_records(rows: Vec<MutationRow>) -> DbResult<Vec<MutationRecord>> {
    rows.into_iter().map(MutationRecord::try_from).collect()
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the local mutation queue.
#[derive(Debug, Clone)]
pub struct MutationQueueRepository {
    pool: SqlitePool,
}

impl MutationQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        MutationQueueRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Insert / Read
    // -------------------------------------------------------------------------

    /// Inserts a PENDING record inside the caller's transaction.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let mut tx = db.begin().await?;
    /// documents.put_in(&mut tx, "bills", "b-1", &data, now).await?;
    /// MutationQueueRepository::insert_in(&mut tx, &record).await?;
    /// tx.commit().await?;
    /// ```
    pub async fn insert_in(conn: &mut SqliteConnection, record: &MutationRecord) -> DbResult<()> {
        if record.status != MutationStatus::Pending {
            return Err(DbError::stale(&record.operation_id, MutationStatus::Pending));
        }

        debug!(
            operation_id = %record.operation_id,
            table = %record.target_collection,
            document_id = %record.document_id,
            "Enqueuing mutation"
        );

        let result = sqlx::query(concat!(
            "INSERT INTO mutation_queue (",
            mutation_columns!(),
            ") VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
             ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
        ))
        .bind(&record.operation_id)
        .bind(record.operation_type.as_str())
        .bind(&record.target_collection)
        .bind(&record.document_id)
        .bind(record.payload.to_string())
        .bind(&record.payload_hash)
        .bind(record.status.as_str())
        .bind(record.retry_count as i64)
        .bind(&record.last_error)
        .bind(to_millis(record.created_at))
        .bind(record.first_attempt_at.map(to_millis))
        .bind(record.last_attempt_at.map(to_millis))
        .bind(record.next_attempt_at.map(to_millis))
        .bind(record.synced_at.map(to_millis))
        .bind(record.priority as i64)
        .bind(&record.parent_operation_id)
        .bind(record.step_number as i64)
        .bind(record.total_steps as i64)
        .bind(&record.dependency_group)
        .bind(&record.owner_id)
        .bind(&record.user_id)
        .bind(&record.device_id)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => match DbError::from(e) {
                DbError::UniqueViolation { field, .. } => Err(DbError::UniqueViolation {
                    field,
                    value: record.operation_id.clone(),
                }),
                other => Err(other),
            },
        }
    }

    /// Inserts a PENDING record in its own transaction.
    pub async fn insert(&self, record: &MutationRecord) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_in(&mut conn, record).await
    }

    pub async fn get(&self, operation_id: &str) -> DbResult<Option<MutationRecord>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, operation_id).await
    }

    pub async fn get_in(
        conn: &mut SqliteConnection,
        operation_id: &str,
    ) -> DbResult<Option<MutationRecord>> {
        let row: Option<MutationRow> = sqlx::query_as(concat!(
            "SELECT ",
            mutation_columns!(),
            " FROM mutation_queue WHERE operation_id = ?1"
        ))
        .bind(operation_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(MutationRecord::try_from).transpose()
    }

    /// Records in one status, oldest first.
    pub async fn list_by_status(
        &self,
        status: MutationStatus,
        limit: u32,
    ) -> DbResult<Vec<MutationRecord>> {
        let rows: Vec<MutationRow> = sqlx::query_as(concat!(
            "SELECT ",
            mutation_columns!(),
            " FROM mutation_queue WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    // -------------------------------------------------------------------------
    // Dispatch Selection
    // -------------------------------------------------------------------------

    /// Records the dispatcher may claim now.
    ///
    /// ## Eligibility
    /// - PENDING, or RETRY whose `next_attempt_at` has passed
    /// - No earlier step of the same dependency group is still in the queue
    ///   unsynced
    /// - No older unsynced record touches the same document, so edits of one
    ///   document are never in flight together
    ///
    /// Ordered by priority ascending, then creation time, then insertion order.
    pub async fn select_eligible(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<MutationRecord>> {
        let rows: Vec<MutationRow> = sqlx::query_as(concat!(
            "SELECT ",
            mutation_columns!(),
            " FROM mutation_queue AS q
            WHERE (q.status = 'pending'
                   OR (q.status = 'retry'
                       AND (q.next_attempt_at IS NULL OR q.next_attempt_at <= ?1)))
              AND NOT EXISTS (
                  SELECT 1 FROM mutation_queue AS p
                  WHERE q.dependency_group IS NOT NULL
                    AND p.dependency_group = q.dependency_group
                    AND p.step_number < q.step_number
                    AND p.status <> 'synced')
              AND NOT EXISTS (
                  SELECT 1 FROM mutation_queue AS d
                  WHERE d.target_collection = q.target_collection
                    AND d.document_id = q.document_id
                    AND d.status IN ('pending', 'in_progress', 'retry')
                    AND d.rowid < q.rowid)
            ORDER BY q.priority ASC, q.created_at ASC, q.rowid ASC
            LIMIT ?2"
        ))
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    /// Earliest `next_attempt_at` among waiting RETRY records.
    pub async fn next_retry_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(next_attempt_at) FROM mutation_queue WHERE status = 'retry'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(next.map(from_millis))
    }

    // -------------------------------------------------------------------------
    // State Transitions
    // -------------------------------------------------------------------------

    /// Compare-and-set claim: PENDING/RETRY → IN_PROGRESS.
    ///
    /// ## Returns
    /// * `Some(record)` - this caller owns the record; returned copy is IN_PROGRESS
    /// * `None` - someone else claimed or settled it first
    pub async fn claim(
        &self,
        record: &MutationRecord,
        now: DateTime<Utc>,
    ) -> DbResult<Option<MutationRecord>> {
        record.ensure_transition(MutationStatus::InProgress)?;

        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'in_progress',
                last_attempt_at = ?2,
                first_attempt_at = COALESCE(first_attempt_at, ?2)
            WHERE operation_id = ?1
              AND status IN ('pending', 'retry')
            "#,
        )
        .bind(&record.operation_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            debug!(operation_id = %record.operation_id, "Claim lost");
            return Ok(None);
        }

        let mut claimed = record.clone();
        claimed.transition(MutationStatus::InProgress, now)?;
        Ok(Some(claimed))
    }

    /// IN_PROGRESS → SYNCED.
    pub async fn mark_synced(
        &self,
        record: &MutationRecord,
        now: DateTime<Utc>,
    ) -> DbResult<MutationRecord> {
        record.ensure_transition(MutationStatus::Synced)?;

        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'synced',
                synced_at = ?2,
                next_attempt_at = NULL,
                last_error = NULL
            WHERE operation_id = ?1
              AND status = 'in_progress'
            "#,
        )
        .bind(&record.operation_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(DbError::stale(&record.operation_id, MutationStatus::InProgress));
        }

        let mut synced = record.clone();
        synced.transition(MutationStatus::Synced, now)?;
        synced.last_error = None;
        Ok(synced)
    }

    /// IN_PROGRESS → RETRY, incrementing `retry_count`.
    pub async fn mark_retry(
        &self,
        record: &MutationRecord,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<MutationRecord> {
        record.ensure_transition(MutationStatus::Retry)?;

        let result = sqlx::query(
            r#"
            UPDATE mutation_queue SET
                status = 'retry',
                retry_count = retry_count + 1,
                last_error = ?2,
                next_attempt_at = ?3
            WHERE operation_id = ?1
              AND status = 'in_progress'
            "#,
        )
        .bind(&record.operation_id)
        .bind(error)
        .bind(to_millis(next_attempt_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(DbError::stale(&record.operation_id, MutationStatus::InProgress));
        }

        let mut retry = record.clone();
        retry.transition(MutationStatus::Retry, now)?;
        retry.last_error = Some(error.to_string());
        retry.next_attempt_at = Some(next_attempt_at);
        Ok(retry)
    }

    /// Startup recovery: every IN_PROGRESS record goes back to PENDING.
    ///
    /// An interrupted attempt may or may not have reached the server; the
    /// server's idempotency ledger makes re-sending it safe. Each record takes
    /// the gated IN_PROGRESS to PENDING edge like any other transition.
    pub async fn recover_in_progress(&self) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<MutationRow> = sqlx::query_as(concat!(
            "SELECT ",
            mutation_columns!(),
            " FROM mutation_queue WHERE status = 'in_progress'"
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut recovered = 0;
        for record in into_records(rows)? {
            record.ensure_transition(MutationStatus::Pending)?;
            let result = sqlx::query(
                "UPDATE mutation_queue SET status = 'pending' \
                 WHERE operation_id = ?1 AND status = 'in_progress'",
            )
            .bind(&record.operation_id)
            .execute(&mut *tx)
            .await?;
            recovered += result.rows_affected();
        }
        tx.commit().await?;

        if recovered > 0 {
            info!(recovered, "Recovered interrupted mutations");
        }
        Ok(recovered)
    }

    // -------------------------------------------------------------------------
    // Reconciler Support
    // -------------------------------------------------------------------------

    /// Unsynced records touching one document, oldest first.
    pub async fn active_for_document_in(
        conn: &mut SqliteConnection,
        collection: &str,
        document_id: &str,
    ) -> DbResult<Vec<MutationRecord>> {
        let rows: Vec<MutationRow> = sqlx::query_as(concat!(
            "SELECT ",
            mutation_columns!(),
            " FROM mutation_queue
            WHERE target_collection = ?1
              AND document_id = ?2
              AND status IN ('pending', 'in_progress', 'retry')
            ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(collection)
        .bind(document_id)
        .fetch_all(&mut *conn)
        .await?;

        into_records(rows)
    }

    /// Later unsynced steps of a dependency group.
    pub async fn group_followers_in(
        conn: &mut SqliteConnection,
        dependency_group: &str,
        after_step: u32,
    ) -> DbResult<Vec<MutationRecord>> {
        let rows: Vec<MutationRow> = sqlx::query_as(concat!(
            "SELECT ",
            mutation_columns!(),
            " FROM mutation_queue
            WHERE dependency_group = ?1
              AND step_number > ?2
              AND status IN ('pending', 'retry')
            ORDER BY step_number ASC"
        ))
        .bind(dependency_group)
        .bind(after_step as i64)
        .fetch_all(&mut *conn)
        .await?;

        into_records(rows)
    }

    /// Removes a record that is leaving the queue. Guarded on its status.
    pub(crate) async fn delete_in(
        conn: &mut SqliteConnection,
        operation_id: &str,
        expected: MutationStatus,
    ) -> DbResult<()> {
        let result =
            sqlx::query("DELETE FROM mutation_queue WHERE operation_id = ?1 AND status = ?2")
                .bind(operation_id)
                .bind(expected.as_str())
                .execute(&mut *conn)
                .await?;

        if result.rows_affected() != 1 {
            return Err(DbError::stale(operation_id, expected));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Statistics / Maintenance
    // -------------------------------------------------------------------------

    /// Live counts per status. `dead_letter` counts unresolved entries.
    pub async fn stats(&self) -> DbResult<QueueStats> {
        let rows: Vec<(MutationStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM mutation_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.set(status, count as u32);
        }

        let dead: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE is_resolved = 0")
                .fetch_one(&self.pool)
                .await?;
        stats.dead_letter = dead as u32;

        Ok(stats)
    }

    /// Deletes SYNCED records synced before `older_than`.
    pub async fn purge_synced(&self, older_than: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM mutation_queue WHERE status = 'synced' AND synced_at < ?1",
        )
        .bind(to_millis(older_than))
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, "Purged synced mutations");
        }
        Ok(purged)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
