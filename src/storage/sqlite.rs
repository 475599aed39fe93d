use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};

use super::{ConversationLog, DurableStore, LogPage, LogQuery, Result};
use crate::error::StorageError;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS conversation_logs (
        conversation_id TEXT NOT NULL PRIMARY KEY,
        user_id INTEGER NOT NULL DEFAULT 0,
        client_address TEXT NOT NULL,
        history TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_conversation_logs_created ON conversation_logs(created_at)",
    "CREATE TABLE IF NOT EXISTS kv_mirror (
        key TEXT NOT NULL PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS banned_clients (
        client_address TEXT NOT NULL PRIMARY KEY,
        banned_at INTEGER NOT NULL
    )",
];

#[derive(Clone)]
pub struct SqliteDurableStore {
    pool: SqlitePool,
}

impl SqliteDurableStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to an in-memory database sees its own database.
        let max_conns: u32 = if database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = sqlx::pool::PoolOptions::<Sqlite>::new()
            .max_connections(max_conns)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Durable store ready at {}", database_url);
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {}", secs)))
}

fn row_to_log(row: &SqliteRow) -> Result<ConversationLog> {
    let user_id: i64 = row.try_get("user_id")?;
    Ok(ConversationLog {
        conversation_id: row.try_get("conversation_id")?,
        user_id: u64::try_from(user_id).unwrap_or(0),
        client_address: row.try_get("client_address")?,
        history: row.try_get("history")?,
        created_at: to_datetime(row.try_get("created_at")?)?,
    })
}

fn like_pattern(search: &str) -> String {
    let escaped = search
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn expiry_from_now(ttl: Duration) -> i64 {
    Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2)
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn upsert_log(&self, log: &ConversationLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_logs (conversation_id, user_id, client_address, history, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE SET
                user_id = excluded.user_id,
                client_address = excluded.client_address,
                history = excluded.history,
                created_at = excluded.created_at",
        )
        .bind(&log.conversation_id)
        .bind(i64::try_from(log.user_id).unwrap_or(0))
        .bind(&log.client_address)
        .bind(&log.history)
        .bind(log.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_log(&self, conversation_id: &str) -> Result<Option<ConversationLog>> {
        let row = sqlx::query(
            "SELECT conversation_id, user_id, client_address, history, created_at
             FROM conversation_logs WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_log).transpose()
    }

    async fn list_logs(&self, query: &LogQuery) -> Result<LogPage> {
        let pattern = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        let filter = "WHERE (? IS NULL
                OR conversation_id LIKE ? ESCAPE '\\'
                OR client_address LIKE ? ESCAPE '\\')";

        let total: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS total FROM conversation_logs {}",
            filter
        ))
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(&format!(
            "SELECT conversation_id, user_id, client_address, history, created_at
             FROM conversation_logs {}
             ORDER BY created_at DESC, conversation_id ASC
             LIMIT ? OFFSET ?",
            filter
        ))
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(i64::from(query.limit))
        .bind(i64::from(query.offset))
        .fetch_all(&self.pool)
        .await?;

        let logs = rows.iter().map(row_to_log).collect::<Result<Vec<_>>>()?;
        Ok(LogPage {
            total: u64::try_from(total).unwrap_or(0),
            logs,
        })
    }

    async fn delete_log(&self, conversation_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversation_logs WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conversation_logs WHERE created_at < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mirror_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_mirror WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(Utc::now().timestamp())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn mirror_set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_mirror (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_from_now(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mirror_delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_mirror WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mirror_purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_mirror WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ban_add(&self, client_address: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO banned_clients (client_address, banned_at) VALUES (?, ?)",
        )
        .bind(client_address)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ban_contains(&self, client_address: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM banned_clients WHERE client_address = ?")
            .bind(client_address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn ban_remove(&self, client_address: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM banned_clients WHERE client_address = ?")
            .bind(client_address)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ban_list(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT client_address FROM banned_clients ORDER BY banned_at ASC, client_address ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("client_address").map_err(StorageError::from))
            .collect()
    }

    async fn ban_clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM banned_clients")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn store() -> SqliteDurableStore {
        SqliteDurableStore::connect("sqlite::memory:").await.unwrap()
    }

    fn log(id: &str, address: &str, created_at: DateTime<Utc>) -> ConversationLog {
        ConversationLog {
            conversation_id: id.to_string(),
            user_id: 0,
            client_address: address.to_string(),
            history: "[]".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let store = store().await;
        let now = Utc::now();
        store.upsert_log(&log("c1", "1.1.1.1", now)).await.unwrap();

        let mut updated = log("c1", "2.2.2.2", now);
        updated.history = "[{\"role\":\"user\",\"content\":\"hi\"}]".into();
        updated.user_id = 42;
        store.upsert_log(&updated).await.unwrap();

        let page = store
            .list_logs(&LogQuery {
                search: None,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        let row = store.get_log("c1").await.unwrap().unwrap();
        assert_eq!(row.client_address, "2.2.2.2");
        assert_eq!(row.user_id, 42);
        assert_eq!(row.history, updated.history);
    }

    #[tokio::test]
    async fn missing_log_is_none_and_delete_is_idempotent() {
        let store = store().await;
        assert!(store.get_log("nope").await.unwrap().is_none());
        assert!(!store.delete_log("nope").await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_old_rows() {
        let store = store().await;
        let now = Utc::now();
        store
            .upsert_log(&log("old", "1.1.1.1", now - ChronoDuration::days(40)))
            .await
            .unwrap();
        store.upsert_log(&log("new", "1.1.1.1", now)).await.unwrap();

        let removed = store
            .purge_logs_before(now - ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_log("old").await.unwrap().is_none());
        assert!(store.get_log("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = store().await;
        let now = Utc::now();
        for i in 0..5 {
            store
                .upsert_log(&log(
                    &format!("conv_{}", i),
                    "10.0.0.1",
                    now - ChronoDuration::seconds(i),
                ))
                .await
                .unwrap();
        }
        store
            .upsert_log(&log("other", "192.168.1.5", now))
            .await
            .unwrap();

        let page = store
            .list_logs(&LogQuery {
                search: Some("conv_".into()),
                limit: 2,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.logs.len(), 2);
        assert_eq!(page.logs[0].conversation_id, "conv_0");

        let by_address = store
            .list_logs(&LogQuery {
                search: Some("192.168".into()),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(by_address.total, 1);
        assert_eq!(by_address.logs[0].conversation_id, "other");
    }

    #[tokio::test]
    async fn mirror_purge_deletes_expired_rows() {
        let store = store().await;
        for key in ["a", "b", "c"] {
            store
                .mirror_set(key, "1", Duration::from_secs(0))
                .await
                .unwrap();
        }
        store
            .mirror_set("live", "1", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.mirror_purge_expired().await.unwrap(), 3);
        let remaining: i64 = sqlx::query("SELECT COUNT(*) AS n FROM kv_mirror")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(store.mirror_get("live").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn mirror_respects_expiry() {
        let store = store().await;
        store
            .mirror_set("live", "1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .mirror_set("dead", "1", Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(store.mirror_get("live").await.unwrap().as_deref(), Some("1"));
        assert!(store.mirror_get("dead").await.unwrap().is_none());

        store.mirror_delete("live").await.unwrap();
        assert!(store.mirror_get("live").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ban_set_operations() {
        let store = store().await;
        assert!(store.ban_add("1.2.3.4").await.unwrap());
        assert!(!store.ban_add("1.2.3.4").await.unwrap());
        assert!(store.ban_add("5.6.7.8").await.unwrap());
        assert!(store.ban_contains("1.2.3.4").await.unwrap());
        assert_eq!(store.ban_list().await.unwrap().len(), 2);

        assert!(store.ban_remove("5.6.7.8").await.unwrap());
        assert_eq!(store.ban_clear().await.unwrap(), 1);
        assert!(!store.ban_contains("1.2.3.4").await.unwrap());
    }
}
