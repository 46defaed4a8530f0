use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use super::{Filter, Page, PageRequest, RecordStore, StoreError};

/// SQLite-backed record store.
///
/// All kinds share one `records` table; filters are evaluated with
/// `json_extract` over the stored body. `seq` preserves insertion order across
/// updates because upserts never touch it.
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Convert sqlx error to StoreError with appropriate retry classification
    fn sqlx_to_store_error(operation: &str, e: sqlx::Error) -> StoreError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return StoreError::retryable(operation, format!("Database locked: {error_msg}"));
        }
        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return StoreError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }
        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return StoreError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        StoreError::retryable(operation, error_msg)
    }

    /// Open (or create) a store.
    ///
    /// * `database_url` - SQLite connection string (e.g. "sqlite:data.db?mode=rwc" or "sqlite::memory:")
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        // A private in-memory database only exists on its own connection.
        let max_connections = if is_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "flowhost::store::sqlite", url = %database_url, "record store opened");
        Ok(Self { pool })
    }

    /// Private in-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (kind, id)
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind, seq)")
            .execute(pool)
            .await?;
        Ok(())
    }

    fn where_clause(filter: &Filter) -> String {
        let mut sql = String::from("kind = ?");
        for _ in filter.clauses() {
            sql.push_str(" AND json_extract(body, ?) = ?");
        }
        sql
    }
}

#[async_trait::async_trait]
impl RecordStore for SqliteRecordStore {
    async fn store(&self, kind: &str, id: &str, body: Value) -> Result<(), StoreError> {
        if !body.is_object() {
            return Err(StoreError::permanent("store", format!("{kind}/{id}: body is not an object")));
        }
        let text = serde_json::to_string(&body).map_err(|e| StoreError::codec("store", e))?;
        sqlx::query(
            r#"
            INSERT INTO records (kind, id, body) VALUES (?1, ?2, ?3)
            ON CONFLICT(kind, id) DO UPDATE SET body = excluded.body, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(text)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("store", e))?;
        Ok(())
    }

    async fn load(&self, kind: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT body FROM records WHERE kind = ? AND id = ?")
            .bind(kind)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("load", e))?;
        match row {
            Some(row) => {
                let text: String = row
                    .try_get("body")
                    .map_err(|e| Self::sqlx_to_store_error("load", e))?;
                serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|e| StoreError::codec("load", e))
            }
            None => Ok(None),
        }
    }

    async fn query(&self, kind: &str, filter: &Filter, page: PageRequest) -> Result<Page<Value>, StoreError> {
        let where_sql = Self::where_clause(filter);

        let count_sql = format!("SELECT COUNT(*) FROM records WHERE {where_sql}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql).bind(kind);
        for (field, value) in filter.clauses() {
            count_query = count_query.bind(format!("$.{field}")).bind(value.as_str());
        }
        let total = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("query", e))?;

        let select_sql = format!("SELECT body FROM records WHERE {where_sql} ORDER BY seq LIMIT ? OFFSET ?");
        let mut select = sqlx::query(&select_sql).bind(kind);
        for (field, value) in filter.clauses() {
            select = select.bind(format!("$.{field}")).bind(value.as_str());
        }
        let rows = select
            .bind(page.limit as i64)
            .bind(page.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("query", e))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row
                .try_get("body")
                .map_err(|e| Self::sqlx_to_store_error("query", e))?;
            items.push(serde_json::from_str(&text).map_err(|e| StoreError::codec("query", e))?);
        }
        Ok(Page::from_window(items, page, total.max(0) as usize))
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE kind = ? AND id = ?")
            .bind(kind)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_batch(&self, kind: &str, ids: &[String]) -> Result<usize, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_store_error("delete_batch", e))?;
        let mut removed = 0usize;
        for id in ids {
            let result = sqlx::query("DELETE FROM records WHERE kind = ? AND id = ?")
                .bind(kind)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_store_error("delete_batch", e))?;
            removed += result.rows_affected() as usize;
        }
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_store_error("delete_batch", e))?;
        Ok(removed)
    }
}
