//! Conflict log repository.
//!
//! Append-only. The table carries triggers that abort any UPDATE or DELETE,
//! so this repository only ever inserts and reads.

use billbook_core::clock::{from_millis, to_millis};
use billbook_core::{ConflictLogEntry, ConflictResolution};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;

use crate::error::{DbError, DbResult};

const CONFLICT_COLUMNS: &str = "id, entity_type, entity_id, operation_id, local_snapshot, \
    server_snapshot, divergent_fields, resolution, detected_at";

#[derive(Debug, sqlx::FromRow)]
struct ConflictRow {
    id: String,
    entity_type: String,
    entity_id: String,
    operation_id: Option<String>,
    local_snapshot: String,
    server_snapshot: String,
    divergent_fields: String,
    resolution: String,
    detected_at: i64,
}

impl TryFrom<ConflictRow> for ConflictLogEntry {
    type Error = DbError;

    fn try_from(row: ConflictRow) -> DbResult<Self> {
        let resolution = match row.resolution.as_str() {
            "server_wins" => ConflictResolution::ServerWins,
            other => return Err(DbError::Corrupt(format!("unknown resolution '{other}'"))),
        };

        Ok(ConflictLogEntry {
            id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            operation_id: row.operation_id,
            local_snapshot: serde_json::from_str(&row.local_snapshot)?,
            server_snapshot: serde_json::from_str(&row.server_snapshot)?,
            divergent_fields: serde_json::from_str(&row.divergent_fields)?,
            resolution,
            detected_at: from_millis(row.detected_at),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConflictLogRepository {
    pool: SqlitePool,
}

impl ConflictLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ConflictLogRepository { pool }
    }

    /// Appends an entry inside the caller's transaction.
    pub async fn append_in(conn: &mut SqliteConnection, entry: &ConflictLogEntry) -> DbResult<()> {
        warn!(
            table = %entry.entity_type,
            document_id = %entry.entity_id,
            fields = ?entry.divergent_fields,
            resolution = %entry.resolution,
            "Sync conflict"
        );

        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                id, entity_type, entity_id, operation_id, local_snapshot,
                server_snapshot, divergent_fields, resolution, detected_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.operation_id)
        .bind(entry.local_snapshot.to_string())
        .bind(entry.server_snapshot.to_string())
        .bind(serde_json::to_string(&entry.divergent_fields)?)
        .bind(entry.resolution.as_str())
        .bind(to_millis(entry.detected_at))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn append(&self, entry: &ConflictLogEntry) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::append_in(&mut conn, entry).await
    }

    /// Every conflict recorded for one document, oldest first.
    pub async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> DbResult<Vec<ConflictLogEntry>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflict_log
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY detected_at ASC, rowid ASC"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictLogEntry::try_from).collect()
    }

    /// Most recent conflicts first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<ConflictLogEntry>> {
        let rows: Vec<ConflictRow> = sqlx::query_as(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflict_log
             ORDER BY detected_at DESC, rowid DESC LIMIT ?1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictLogEntry::try_from).collect()
    }

    pub async fn count(&self) -> DbResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conflict_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;
    use serde_json::json;

    fn entry(id: &str, at: i64) -> ConflictLogEntry {
        ConflictLogEntry::server_wins(
            id,
            "customers",
            "c-1",
            Some("op-1".to_string()),
            json!({"name": "Asha", "phone": "1"}),
            json!({"name": "Asha", "phone": "2"}),
            from_millis(at),
        )
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let db = test_db().await;
        let log = db.conflicts();

        log.append(&entry("c-1", 10)).await.unwrap();
        log.append(&entry("c-2", 20)).await.unwrap();

        let all = log.list_for_entity("customers", "c-1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], entry("c-1", 10));
        assert_eq!(all[0].divergent_fields, vec!["phone"]);

        let recent = log.recent(1).await.unwrap();
        assert_eq!(recent[0].id, "c-2");
        assert_eq!(log.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_log_is_append_only() {
        let db = test_db().await;
        db.conflicts().append(&entry("c-1", 10)).await.unwrap();

        let update = sqlx::query("UPDATE conflict_log SET resolution = 'local_wins'")
            .execute(db.pool())
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM conflict_log").execute(db.pool()).await;
        assert!(delete.is_err());
        assert_eq!(db.conflicts().count().await.unwrap(), 1);
    }
}
