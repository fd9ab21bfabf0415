//! Named cache stores
//!
//! A backend holds any number of named stores, each mapping a request key to
//! a full response. Store names carry the cache version so activation can
//! drop everything written by older versions.

use super::CacheKey;
use crate::error::StorageError;
use crate::host::FetchResponse;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::info;

#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn store_names(&self) -> Result<Vec<String>, StorageError>;

    /// Returns whether the store existed.
    async fn delete_store(&self, store: &str) -> Result<bool, StorageError>;

    async fn get(&self, store: &str, key: &CacheKey)
        -> Result<Option<FetchResponse>, StorageError>;

    async fn put(
        &self,
        store: &str,
        key: &CacheKey,
        response: &FetchResponse,
    ) -> Result<(), StorageError>;
}

/// Process-local stores.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    stores: DashMap<String, DashMap<String, FetchResponse>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, store: &str) -> usize {
        self.stores.get(store).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, store: &str) -> bool {
        self.len(store) == 0
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn store_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.stores.iter().map(|s| s.key().clone()).collect())
    }

    async fn delete_store(&self, store: &str) -> Result<bool, StorageError> {
        Ok(self.stores.remove(store).is_some())
    }

    async fn get(
        &self,
        store: &str,
        key: &CacheKey,
    ) -> Result<Option<FetchResponse>, StorageError> {
        Ok(self
            .stores
            .get(store)
            .and_then(|entries| entries.get(key.as_str()).map(|r| r.value().clone())))
    }

    async fn put(
        &self,
        store: &str,
        key: &CacheKey,
        response: &FetchResponse,
    ) -> Result<(), StorageError> {
        self.stores
            .entry(store.to_string())
            .or_default()
            .insert(key.as_str().to_string(), response.clone());
        Ok(())
    }
}

/// Stores persisted in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // In-memory databases are per connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        info!("Tile cache database ready at {}", database_url);
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tile_cache (
                store TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                status INTEGER NOT NULL,
                url TEXT NOT NULL,
                headers TEXT NOT NULL,
                body BLOB NOT NULL,
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (store, cache_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for SqliteStorage {
    async fn store_names(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT DISTINCT store FROM tile_cache ORDER BY store")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("store")).collect())
    }

    async fn delete_store(&self, store: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM tile_cache WHERE store = ?")
            .bind(store)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(
        &self,
        store: &str,
        key: &CacheKey,
    ) -> Result<Option<FetchResponse>, StorageError> {
        let row = sqlx::query(
            "SELECT status, url, headers, body FROM tile_cache WHERE store = ? AND cache_key = ?",
        )
        .bind(store)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: i64 = row.get("status");
        let headers_json: String = row.get("headers");
        let headers: Vec<(String, String)> =
            serde_json::from_str(&headers_json).map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        let status = u16::try_from(status).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let body: Vec<u8> = row.get("body");

        Ok(Some(FetchResponse {
            status,
            url: row.get("url"),
            headers,
            body: Bytes::from(body),
        }))
    }

    async fn put(
        &self,
        store: &str,
        key: &CacheKey,
        response: &FetchResponse,
    ) -> Result<(), StorageError> {
        let headers_json = serde_json::to_string(&response.headers).map_err(|e| {
            StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })?;

        sqlx::query(
            r#"
            INSERT INTO tile_cache (store, cache_key, status, url, headers, body, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(store, cache_key) DO UPDATE SET
                status = excluded.status,
                url = excluded.url,
                headers = excluded.headers,
                body = excluded.body,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(store)
        .bind(key.as_str())
        .bind(i64::from(response.status))
        .bind(&response.url)
        .bind(headers_json)
        .bind(response.body.as_ref())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
