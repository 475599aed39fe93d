// Volatile tier: fast key/value, entries may vanish at any time. Durable tier:
// conversation audit log, ban set and mirrors of volatile values.

mod memory;
mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub use memory::InMemoryVolatileStore;
pub use sqlite::SqliteDurableStore;

pub type Result<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait VolatileStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Store `value` only when `key` is absent or expired. Returns whether
    /// the value was written.
    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Atomically add `delta` to the integer stored at `key` and return the
    /// new value. A missing or expired key starts at zero and gets `ttl`;
    /// an existing key keeps its original expiry.
    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    async fn purge_expired(&self) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLog {
    pub conversation_id: String,
    pub user_id: u64,
    pub client_address: String,
    pub history: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub search: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub total: u64,
    pub logs: Vec<ConversationLog>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn upsert_log(&self, log: &ConversationLog) -> Result<()>;

    async fn get_log(&self, conversation_id: &str) -> Result<Option<ConversationLog>>;

    async fn list_logs(&self, query: &LogQuery) -> Result<LogPage>;

    async fn delete_log(&self, conversation_id: &str) -> Result<bool>;

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn mirror_get(&self, key: &str) -> Result<Option<String>>;

    async fn mirror_set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn mirror_delete(&self, key: &str) -> Result<()>;

    async fn mirror_purge_expired(&self) -> Result<u64>;

    /// Returns `true` when the address was not already banned.
    async fn ban_add(&self, client_address: &str) -> Result<bool>;

    async fn ban_contains(&self, client_address: &str) -> Result<bool>;

    async fn ban_remove(&self, client_address: &str) -> Result<bool>;

    async fn ban_list(&self) -> Result<Vec<String>>;

    async fn ban_clear(&self) -> Result<u64>;
}
