//! Pull watermarks, one per table.

use billbook_core::clock::to_millis;
use billbook_core::PullCursor;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;

#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    /// Last persisted pull position for a table.
    pub async fn get_cursor(&self, table: &str) -> DbResult<Option<PullCursor>> {
        let row: Option<(i64, Option<String>)> =
            sqlx::query_as("SELECT watermark, last_id FROM sync_state WHERE table_name = ?1")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(watermark, last_id)| PullCursor { watermark, last_id }))
    }

    /// Stores a new pull position. Never moves a watermark backwards.
    pub async fn set_cursor(
        &self,
        table: &str,
        cursor: &PullCursor,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (table_name, watermark, last_id, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (table_name) DO UPDATE SET
                watermark = excluded.watermark,
                last_id = excluded.last_id,
                updated_at = excluded.updated_at
            WHERE excluded.watermark > sync_state.watermark
               OR (excluded.watermark = sync_state.watermark
                   AND COALESCE(excluded.last_id, '') >= COALESCE(sync_state.last_id, ''))
            "#,
        )
        .bind(table)
        .bind(cursor.watermark)
        .bind(&cursor.last_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lowest watermark across the given tables; `None` if any table has
    /// never been pulled.
    pub async fn last_synced_at(&self, tables: &[String]) -> DbResult<Option<i64>> {
        let mut lowest: Option<i64> = None;
        for table in tables {
            match self.get_cursor(table).await? {
                Some(cursor) => {
                    lowest = Some(lowest.map_or(cursor.watermark, |l| l.min(cursor.watermark)));
                }
                None => return Ok(None),
            }
        }
        Ok(lowest)
    }
}
