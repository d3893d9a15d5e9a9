//! # Local Document Repository
//!
//! The device's copy of every synced business document. Local writes land
//! here in the same transaction as their queue record; the reconciler
//! overwrites them with server-canonical values.
//!
//! ```text
//!  collection  document_id  data (JSON)          server_version  is_deleted
//!  ──────────  ───────────  ───────────────────  ──────────────  ──────────
//!  products    p-1          {"name":"Tea",...}   1042            0
//!  bills       b-7          {"invoice_number"..} NULL            0   ← never synced
//! ```

use billbook_core::clock::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::DbResult;

/// A locally stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDocument {
    pub collection: String,
    pub document_id: String,
    pub data: Value,
    /// Server `updatedAt` of the last canonical copy applied. `None` until
    /// the server has confirmed the document once.
    pub server_version: Option<i64>,
    pub is_deleted: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    collection: String,
    document_id: String,
    data: String,
    server_version: Option<i64>,
    is_deleted: bool,
    updated_at: i64,
}

impl TryFrom<DocumentRow> for LocalDocument {
    type Error = crate::error::DbError;

    fn try_from(row: DocumentRow) -> DbResult<Self> {
        Ok(LocalDocument {
            collection: row.collection,
            document_id: row.document_id,
            data: serde_json::from_str(&row.data)?,
            server_version: row.server_version,
            is_deleted: row.is_deleted,
            updated_at: from_millis(row.updated_at),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DocumentRepository {
    pool: SqlitePool,
}

impl DocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DocumentRepository { pool }
    }

    pub async fn get(&self, collection: &str, document_id: &str) -> DbResult<Option<LocalDocument>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, collection, document_id).await
    }

    pub async fn get_in(
        conn: &mut SqliteConnection,
        collection: &str,
        document_id: &str,
    ) -> DbResult<Option<LocalDocument>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            r#"
            SELECT collection, document_id, data, server_version, is_deleted, updated_at
            FROM local_documents
            WHERE collection = ?1 AND document_id = ?2
            "#,
        )
        .bind(collection)
        .bind(document_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(LocalDocument::try_from).transpose()
    }

    /// Records a local write. The server version is left as it was.
    pub async fn put_in(
        conn: &mut SqliteConnection,
        collection: &str,
        document_id: &str,
        data: &Value,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO local_documents (collection, document_id, data, server_version, is_deleted, updated_at)
            VALUES (?1, ?2, ?3, NULL, 0, ?4)
            ON CONFLICT (collection, document_id) DO UPDATE SET
                data = excluded.data,
                is_deleted = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(document_id)
        .bind(data.to_string())
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Records a local soft delete.
    pub async fn mark_deleted_in(
        conn: &mut SqliteConnection,
        collection: &str,
        document_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO local_documents (collection, document_id, data, server_version, is_deleted, updated_at)
            VALUES (?1, ?2, '{}', NULL, 1, ?3)
            ON CONFLICT (collection, document_id) DO UPDATE SET
                is_deleted = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(document_id)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Overwrites the local copy with the server's canonical row.
    pub async fn apply_canonical_in(
        conn: &mut SqliteConnection,
        collection: &str,
        document_id: &str,
        data: &Value,
        server_version: i64,
        is_deleted: bool,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO local_documents (collection, document_id, data, server_version, is_deleted, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (collection, document_id) DO UPDATE SET
                data = excluded.data,
                server_version = excluded.server_version,
                is_deleted = excluded.is_deleted,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(document_id)
        .bind(data.to_string())
        .bind(server_version)
        .bind(is_deleted)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Only bumps the known server version, keeping local data.
    pub async fn set_server_version_in(
        conn: &mut SqliteConnection,
        collection: &str,
        document_id: &str,
        server_version: i64,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE local_documents SET server_version = ?3
            WHERE collection = ?1 AND document_id = ?2
              AND (server_version IS NULL OR server_version < ?3)
            "#,
        )
        .bind(collection)
        .bind(document_id)
        .bind(server_version)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Live (not deleted) documents of one collection, by id.
    pub async fn list(&self, collection: &str) -> DbResult<Vec<LocalDocument>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT collection, document_id, data, server_version, is_deleted, updated_at
            FROM local_documents
            WHERE collection = ?1 AND is_deleted = 0
            ORDER BY document_id ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LocalDocument::try_from).collect()
    }
}
