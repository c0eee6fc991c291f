//! Live key/value queue settings.
//!
//! Nothing here caches: every typed getter issues a fresh read, so a change
//! written by one process is seen by every other process on its next read.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use tracing::{instrument, warn};

use queuectl_core::config::{parse_backoff_base, parse_flag, parse_max_retries, parse_poll_interval};
use queuectl_core::{ConfigKey, QueueError, QueueResult, RetryPolicy};

use crate::db::{Database, map_sqlx_error};

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_raw(&self, key: ConfigKey) -> QueueResult<Option<String>>;

    async fn set_raw(&self, key: ConfigKey, value: &str) -> QueueResult<()>;

    /// Every stored entry, including ones this build does not recognise.
    async fn entries(&self) -> QueueResult<Vec<(String, String)>>;

    /// Stored value, or the key's default when absent.
    async fn get(&self, key: ConfigKey) -> QueueResult<String> {
        Ok(self
            .get_raw(key)
            .await?
            .unwrap_or_else(|| key.default_value().to_string()))
    }

    /// Validate and store.
    async fn set(&self, key: ConfigKey, value: &str) -> QueueResult<()> {
        let value = value.trim();
        key.validate(value)?;
        self.set_raw(key, value).await
    }

    async fn max_retries(&self) -> QueueResult<u32> {
        typed(self, ConfigKey::MaxRetries, parse_max_retries).await
    }

    async fn backoff_base(&self) -> QueueResult<u32> {
        typed(self, ConfigKey::BackoffBase, parse_backoff_base).await
    }

    async fn poll_interval(&self) -> QueueResult<Duration> {
        typed(self, ConfigKey::PollIntervalSec, parse_poll_interval).await
    }

    /// The cooperative stop flag.
    async fn graceful_stop(&self) -> QueueResult<bool> {
        typed(self, ConfigKey::GracefulStop, parse_flag).await
    }

    async fn retry_policy(&self) -> QueueResult<RetryPolicy> {
        Ok(RetryPolicy {
            backoff_base: self.backoff_base().await?,
        })
    }
}

/// Read `key` and parse it; an unparsable stored value falls back to the default.
async fn typed<S, T>(store: &S, key: ConfigKey, parse: fn(&str) -> QueueResult<T>) -> QueueResult<T>
where
    S: ConfigStore + ?Sized,
{
    let raw = store.get(key).await?;
    match parse(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(key = %key, value = %raw, error = %err, "invalid config value, using default");
            parse(key.default_value())
        }
    }
}

/// Config store backed by the `config` table.
#[derive(Debug, Clone)]
pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl SqliteConfigStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn get_raw(&self, key: ConfigKey) -> QueueResult<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("config_get", e))
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn set_raw(&self, key: ConfigKey, value: &str) -> QueueResult<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key.as_str())
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("config_set", e))?;
        Ok(())
    }

    async fn entries(&self) -> QueueResult<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("config_list", e))?;

        rows.iter()
            .map(|row| {
                let key: String = row
                    .try_get("key")
                    .map_err(|e| map_sqlx_error("config_list", e))?;
                let value: String = row
                    .try_get("value")
                    .map_err(|e| map_sqlx_error("config_list", e))?;
                Ok((key, value))
            })
            .collect()
    }
}

/// In-memory config store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    values: RwLock<BTreeMap<String, String>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> QueueError {
        QueueError::storage("config store lock poisoned")
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get_raw(&self, key: ConfigKey) -> QueueResult<Option<String>> {
        let values = self.values.read().map_err(|_| Self::poisoned())?;
        Ok(values.get(key.as_str()).cloned())
    }

    async fn set_raw(&self, key: ConfigKey, value: &str) -> QueueResult<()> {
        let mut values = self.values.write().map_err(|_| Self::poisoned())?;
        values.insert(key.as_str().to_string(), value.to_string());
        Ok(())
    }

    async fn entries(&self) -> QueueResult<Vec<(String, String)>> {
        let values = self.values.read().map_err(|_| Self::poisoned())?;
        Ok(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
