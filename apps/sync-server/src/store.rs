//! # Server Store
//!
//! SQLite persistence for the reconciliation service.
//!
//! ```text
//! sync_records        (tenant_id, table_name, id) → data, is_deleted,
//!                     updated_at (server version), client_timestamp
//! table_versions      (tenant_id, table_name)     → last version handed out
//! applied_operations  (tenant_id, operation_id)   → payload_hash, target row
//! ```
//!
//! `updated_at` is allocated per tenant table and never goes backwards:
//! `max(now_ms, previous + 1)`. Pull pages on `(updated_at, id)`.
//!
//! Every query takes the tenant id; nothing reads across tenants.

use billbook_core::{ChangeAction, ServerChange};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/server");

macro_rules! record_columns {
    () => {
        "table_name, id, data, is_deleted, created_at, updated_at, client_timestamp"
    };
}

// =============================================================================
// Rows
// =============================================================================

/// One stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub table: String,
    pub id: String,
    pub data: Value,
    pub is_deleted: bool,
    pub created_at: i64,
    /// Server version.
    pub updated_at: i64,
    /// `localTimestamp` of the write that produced this version.
    pub client_timestamp: i64,
}

impl StoredRow {
    /// Wire form, tagged `delete` when soft-deleted.
    pub fn to_change(&self) -> ServerChange {
        ServerChange {
            table: self.table.clone(),
            action: if self.is_deleted {
                ChangeAction::Delete
            } else {
                ChangeAction::Update
            },
            id: self.id.clone(),
            data: self.data.clone(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    table_name: String,
    id: String,
    data: String,
    is_deleted: bool,
    created_at: i64,
    updated_at: i64,
    client_timestamp: i64,
}

impl TryFrom<RecordRow> for StoredRow {
    type Error = ServerError;

    fn try_from(row: RecordRow) -> ServerResult<Self> {
        Ok(StoredRow {
            data: serde_json::from_str(&row.data)?,
            table: row.table_name,
            id: row.id,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
            client_timestamp: row.client_timestamp,
        })
    }
}

/// Ledger entry for an applied operation id.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AppliedOperation {
    pub payload_hash: String,
    pub table_name: String,
    pub record_id: String,
}

/// A row version about to be written.
#[derive(Debug)]
pub struct RowWrite<'a> {
    pub table: &'a str,
    pub id: &'a str,
    pub data: &'a Value,
    pub is_deleted: bool,
    pub version: i64,
    pub client_timestamp: i64,
    pub device_id: &'a str,
    pub user_id: &'a str,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct ServerStore {
    pool: SqlitePool,
}

impl ServerStore {
    /// Opens the pool and runs migrations.
    pub async fn connect(config: &ServerConfig) -> ServerResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let mut pool_options =
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
        if config.database_url.contains(":memory:") {
            // The database lives only as long as its single connection.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = ServerStore { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> ServerResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("Server migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> ServerResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // =========================================================================
    // Records
    // =========================================================================

    pub async fn get(&self, tenant: &str, table: &str, id: &str) -> ServerResult<Option<StoredRow>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, tenant, table, id).await
    }

    pub async fn get_in(
        conn: &mut SqliteConnection,
        tenant: &str,
        table: &str,
        id: &str,
    ) -> ServerResult<Option<StoredRow>> {
        let row: Option<RecordRow> = sqlx::query_as(concat!(
            "SELECT ",
            record_columns!(),
            " FROM sync_records WHERE tenant_id = ?1 AND table_name = ?2 AND id = ?3"
        ))
        .bind(tenant)
        .bind(table)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(StoredRow::try_from).transpose()
    }

    /// Hands out the next version for a tenant table.
    pub async fn next_version_in(
        conn: &mut SqliteConnection,
        tenant: &str,
        table: &str,
        now_ms: i64,
    ) -> ServerResult<i64> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO table_versions (tenant_id, table_name, version)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (tenant_id, table_name)
            DO UPDATE SET version = MAX(excluded.version, table_versions.version + 1)
            RETURNING version
            "#,
        )
        .bind(tenant)
        .bind(table)
        .bind(now_ms)
        .fetch_one(&mut *conn)
        .await?;

        Ok(version)
    }

    /// Inserts or overwrites a row. `created_at` is kept on overwrite.
    pub async fn write_in(
        conn: &mut SqliteConnection,
        tenant: &str,
        row: &RowWrite<'_>,
        now_ms: i64,
    ) -> ServerResult<StoredRow> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (
                tenant_id, table_name, id, data, is_deleted,
                created_at, updated_at, client_timestamp, last_device_id, last_user_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (tenant_id, table_name, id) DO UPDATE SET
                data = excluded.data,
                is_deleted = excluded.is_deleted,
                updated_at = excluded.updated_at,
                client_timestamp = excluded.client_timestamp,
                last_device_id = excluded.last_device_id,
                last_user_id = excluded.last_user_id
            "#,
        )
        .bind(tenant)
        .bind(row.table)
        .bind(row.id)
        .bind(row.data.to_string())
        .bind(row.is_deleted)
        .bind(now_ms)
        .bind(row.version)
        .bind(row.client_timestamp)
        .bind(row.device_id)
        .bind(row.user_id)
        .execute(&mut *conn)
        .await?;

        Self::get_in(conn, tenant, row.table, row.id)
            .await?
            .ok_or_else(|| ServerError::Internal(format!("{}/{} vanished after write", row.table, row.id)))
    }

    /// Rows of one table after a `(updated_at, id)` position, ascending.
    ///
    /// With no `after_id` only rows strictly newer than `since` are returned.
    pub async fn changes_since(
        &self,
        tenant: &str,
        table: &str,
        since: Option<i64>,
        after_id: Option<&str>,
        limit: u32,
    ) -> ServerResult<Vec<StoredRow>> {
        let rows: Vec<RecordRow> = sqlx::query_as(concat!(
            "SELECT ",
            record_columns!(),
            " FROM sync_records
            WHERE tenant_id = ?1 AND table_name = ?2
              AND (updated_at > ?3 OR (updated_at = ?3 AND id > ?4))
            ORDER BY updated_at ASC, id ASC
            LIMIT ?5"
        ))
        .bind(tenant)
        .bind(table)
        .bind(since.unwrap_or(i64::MIN))
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredRow::try_from).collect()
    }

    // =========================================================================
    // Idempotency Ledger
    // =========================================================================

    pub async fn find_operation_in(
        conn: &mut SqliteConnection,
        tenant: &str,
        operation_id: &str,
    ) -> ServerResult<Option<AppliedOperation>> {
        Ok(sqlx::query_as(
            r#"
            SELECT payload_hash, table_name, record_id
            FROM applied_operations
            WHERE tenant_id = ?1 AND operation_id = ?2
            "#,
        )
        .bind(tenant)
        .bind(operation_id)
        .fetch_optional(&mut *conn)
        .await?)
    }

    pub async fn record_operation_in(
        conn: &mut SqliteConnection,
        tenant: &str,
        operation_id: &str,
        payload_hash: &str,
        table: &str,
        id: &str,
        now_ms: i64,
    ) -> ServerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO applied_operations
                (tenant_id, operation_id, payload_hash, table_name, record_id, applied_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(tenant)
        .bind(operation_id)
        .bind(payload_hash)
        .bind(table)
        .bind(id)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn count_operations(&self, tenant: &str) -> ServerResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM applied_operations WHERE tenant_id = ?1")
                .bind(tenant)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}
