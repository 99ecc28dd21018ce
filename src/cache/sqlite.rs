//! # SQLite Cache Backend
//!
//! A pooled, persistent [`CacheBackend`] built on `sqlx`. Entries live in a
//! single `evidence_cache` table keyed by cache key, with an optional
//! `expires_at` in unix milliseconds. Expired rows are filtered on read and
//! removed lazily.
//!
//! Transient failures (pool timeouts, I/O errors, `SQLITE_BUSY`) are retried
//! with exponential backoff according to [`CacheConfig::max_retries`].
//!
//! ```rust,no_run
//! use variant_evidence::cache::SqliteCacheBackend;
//! use variant_evidence::config::CacheConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> variant_evidence::Result<()> {
//! let backend = SqliteCacheBackend::new(&CacheConfig {
//!     url: "sqlite://evidence_cache.db".into(),
//!     ..CacheConfig::default()
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

use super::CacheBackend;
use crate::config::{CacheConfig, RetryConfig};
use crate::error::{EvidenceError, Result};
use crate::retry::{retry_async, RetryPolicy};

/// A [`CacheBackend`] persisted in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteCacheBackend {
    pool: Pool<Sqlite>,
    retry: RetryConfig,
}

impl SqliteCacheBackend {
    /// Connects to `config.url`, creating the database file if needed, and runs migrations.
    pub async fn new(config: &CacheConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .acquire_timeout(config.pool_timeout)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;
        debug!(url = %config.url, pool_size = config.pool_size, "sqlite cache ready");

        Ok(Self {
            pool,
            retry: config.retry_config(),
        })
    }

    /// An in-memory backend, useful for testing.
    ///
    /// Each SQLite in-memory connection is its own database, so the pool is held
    /// to a single connection that is never reaped or recycled.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self {
            pool,
            retry: RetryConfig::default(),
        })
    }

    /// Closes the pool; pending operations finish first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evidence_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_evidence_cache_expires
            ON evidence_cache(expires_at)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> Option<i64> {
    if ttl.is_zero() {
        return None;
    }
    let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    Some(now_millis().saturating_add(ttl))
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let pool = &self.pool;
        let row = retry_async(
            || async move {
                sqlx::query("SELECT value, expires_at FROM evidence_cache WHERE key = ?")
                    .bind(key)
                    .fetch_optional(pool)
                    .await
                    .map_err(EvidenceError::from)
            },
            &mut self.policy(),
        )
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: Option<i64> = row.try_get("expires_at")?;
        if expires_at.is_some_and(|at| at <= now_millis()) {
            sqlx::query("DELETE FROM evidence_cache WHERE key = ? AND expires_at <= ?")
                .bind(key)
                .bind(now_millis())
                .execute(pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(row.try_get("value")?))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let pool = &self.pool;
        let expires_at = expiry_millis(ttl);
        retry_async(
            || async move {
                sqlx::query(
                    r#"
                    INSERT INTO evidence_cache (key, value, expires_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        expires_at = excluded.expires_at
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(expires_at)
                .execute(pool)
                .await
                .map_err(EvidenceError::from)
            },
            &mut self.policy(),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let pool = &self.pool;
        retry_async(
            || async move {
                let mut tx = pool.begin().await?;
                let mut removed = 0;
                for key in keys {
                    removed += sqlx::query("DELETE FROM evidence_cache WHERE key = ?")
                        .bind(key.as_str())
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                }
                tx.commit().await?;
                Ok::<u64, EvidenceError>(removed)
            },
            &mut self.policy(),
        )
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pool = &self.pool;
        retry_async(
            || async move {
                let result = sqlx::query(
                    "DELETE FROM evidence_cache WHERE substr(key, 1, length(?1)) = ?1",
                )
                .bind(prefix)
                .execute(pool)
                .await?;
                Ok::<u64, EvidenceError>(result.rows_affected())
            },
            &mut self.policy(),
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        sqlx::query("DELETE FROM evidence_cache")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM evidence_cache WHERE expires_at IS NULL OR expires_at > ?",
        )
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pool_keeps_its_only_connection() {
        let backend = SqliteCacheBackend::new_in_memory().await.unwrap();
        let options = backend.pool.options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);

        backend.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(backend.pool.size(), 1);
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn round_trips_and_overwrites() {
        let backend = SqliteCacheBackend::new_in_memory().await.unwrap();
        backend.set("k", "one", Duration::ZERO).await.unwrap();
        backend
            .set("k", "two", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("two"));
        assert_eq!(backend.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_rows_are_hidden_and_removed() {
        let backend = SqliteCacheBackend::new_in_memory().await.unwrap();
        backend
            .set("gone", "v", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.get("gone").await.unwrap().is_none());
        assert_eq!(backend.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prefix_delete_is_literal() {
        let backend = SqliteCacheBackend::new_in_memory().await.unwrap();
        backend.set("clinvar:variant:aa", "1", Duration::ZERO).await.unwrap();
        backend.set("clinvar:variant:bb", "2", Duration::ZERO).await.unwrap();
        backend.set("hgmd:variant:aa", "3", Duration::ZERO).await.unwrap();
        backend.set("clinvar_x", "4", Duration::ZERO).await.unwrap();
        assert_eq!(backend.delete_prefix("clinvar:").await.unwrap(), 2);
        assert_eq!(
            backend
                .delete(&["hgmd:variant:aa".to_string(), "nope".to_string()])
                .await
                .unwrap(),
            1
        );
        assert_eq!(backend.len().await.unwrap(), 1);
        backend.ping().await.unwrap();
    }
}
