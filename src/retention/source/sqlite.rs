use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{DeleteExecutor, StaleFilter, StaleItemSource, StalePage};
use crate::{
    config::{RecordTableConfig, SqliteConfig},
    retention::error::StoreResult,
};

/// Record store over a SQLite table.
///
/// Timestamps are epoch milliseconds. Table and column names come from
/// [`RecordTableConfig`], which only admits plain identifiers.
pub struct SqliteRecordStore {
    pool: SqlitePool,
    select_sql: String,
    select_owner_sql: String,
    table: RecordTableConfig,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool, table: RecordTableConfig) -> Self {
        let base = format!(
            "SELECT {id} FROM {name} WHERE {updated} < ? AND COALESCE({deleted}, 0) = 0",
            id = table.id_column,
            name = table.name,
            updated = table.updated_at_column,
            deleted = table.deleted_at_column,
        );
        let select_sql = format!("{base} ORDER BY {} LIMIT ? OFFSET ?", table.id_column);
        let select_owner_sql = format!(
            "{base} AND {} = ? ORDER BY {} LIMIT ? OFFSET ?",
            table.owner_column, table.id_column
        );

        Self {
            pool,
            select_sql,
            select_owner_sql,
            table,
        }
    }

    /// Open the configured database.
    pub async fn from_config(config: &SqliteConfig) -> StoreResult<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(
                sqlx::sqlite::SqliteConnectOptions::new()
                    .filename(&config.path)
                    .create_if_missing(config.create_if_missing)
                    .journal_mode(if config.wal_mode {
                        sqlx::sqlite::SqliteJournalMode::Wal
                    } else {
                        sqlx::sqlite::SqliteJournalMode::Delete
                    })
                    .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms)),
            )
            .await?;

        Ok(Self::new(pool, config.table.clone()))
    }
}

#[async_trait]
impl StaleItemSource for SqliteRecordStore {
    async fn get_stale_page(
        &self,
        filter: &StaleFilter,
        page: usize,
        page_size: usize,
    ) -> StoreResult<StalePage> {
        // SQLite treats a negative LIMIT as unbounded
        let limit: i64 = if page_size == 0 {
            -1
        } else {
            page_size as i64 + 1
        };
        let offset = page.saturating_mul(page_size) as i64;
        let older_than = filter.older_than.timestamp_millis();

        let ids: Vec<String> = match &filter.owner_id {
            Some(owner) => {
                sqlx::query_scalar(&self.select_owner_sql)
                    .bind(older_than)
                    .bind(owner)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar(&self.select_sql)
                    .bind(older_than)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(StalePage::from_peek(ids, page_size))
    }
}

#[async_trait]
impl DeleteExecutor for SqliteRecordStore {
    async fn delete_batch(&self, ids: &[String]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({placeholders})",
            self.table.name, self.table.id_column
        );

        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;

        tracing::trace!(
            requested = ids.len(),
            deleted = result.rows_affected(),
            table = %self.table.name,
            "Deleted record batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    /// Create an in-memory SQLite database with the default records table
    async fn create_test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        sqlx::query(
            r#"
            CREATE TABLE records (
                id TEXT PRIMARY KEY NOT NULL,
                owner_id TEXT,
                update_at INTEGER NOT NULL,
                delete_at INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await
        .expect("Failed to create records table");

        pool
    }

    async fn insert(pool: &SqlitePool, id: &str, owner: &str, age_days: i64, deleted: bool) {
        let updated = (Utc::now() - Duration::days(age_days)).timestamp_millis();
        sqlx::query("INSERT INTO records (id, owner_id, update_at, delete_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(owner)
            .bind(updated)
            .bind(if deleted { updated } else { 0 })
            .execute(pool)
            .await
            .expect("Failed to insert record");
    }

    fn filter(days: i64, owner: Option<&str>) -> StaleFilter {
        StaleFilter {
            older_than: Utc::now() - Duration::days(days),
            owner_id: owner.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_stale_page_filters_and_orders() {
        let pool = create_test_pool().await;
        insert(&pool, "c", "alice", 100, false).await;
        insert(&pool, "a", "alice", 100, false).await;
        insert(&pool, "b", "alice", 1, false).await;
        insert(&pool, "d", "alice", 100, true).await;
        insert(&pool, "e", "bob", 100, false).await;

        let store = SqliteRecordStore::new(pool, RecordTableConfig::default());

        let all = store.get_stale_page(&filter(30, None), 0, 10).await.unwrap();
        assert_eq!(all.ids, vec!["a", "c", "e"]);
        assert!(!all.has_more);

        let alice = store
            .get_stale_page(&filter(30, Some("alice")), 0, 10)
            .await
            .unwrap();
        assert_eq!(alice.ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_stale_page_has_more() {
        let pool = create_test_pool().await;
        for i in 0..11 {
            insert(&pool, &format!("r{i:02}"), "alice", 100, false).await;
        }
        let store = SqliteRecordStore::new(pool, RecordTableConfig::default());

        let first = store.get_stale_page(&filter(30, None), 0, 10).await.unwrap();
        assert!(first.has_more);
        assert_eq!(first.ids.len(), 10);

        let second = store.get_stale_page(&filter(30, None), 1, 10).await.unwrap();
        assert!(!second.has_more);
        assert_eq!(second.ids, vec!["r10"]);
    }

    #[tokio::test]
    async fn test_delete_batch() {
        let pool = create_test_pool().await;
        insert(&pool, "a", "alice", 100, false).await;
        insert(&pool, "b", "alice", 100, false).await;
        let store = SqliteRecordStore::new(pool.clone(), RecordTableConfig::default());

        store
            .delete_batch(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        store.delete_batch(&[]).await.unwrap();

        let remaining: Vec<String> = sqlx::query_scalar("SELECT id FROM records")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, vec!["b"]);
    }
}
