use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, StorageError};
use crate::hooks::Hooks;
use crate::storage::{ConversationLog, DurableStore, LogPage, LogQuery, VolatileStore};
use crate::web::models::Message;

pub const MAX_HISTORY: usize = 50;
pub const CONVERSATION_COOKIE: &str = "chat_conversation_id";
pub const COOKIE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_IDENTITY_LEN: usize = 128;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub max_age: Duration,
}

// nanosecond clock plus random bits
pub fn mint_identity() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let entropy = Uuid::new_v4().simple().to_string();
    format!("chat_{:x}{}", nanos, &entropy[..16])
}

pub fn acceptable_identity(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_IDENTITY_LEN
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    valid.then_some(trimmed)
}

fn history_key(conversation_id: &str) -> String {
    format!("chat_history:{}", conversation_id)
}

fn parse_history(raw: &[u8]) -> Option<Vec<Message>> {
    serde_json::from_slice(raw).ok()
}

pub fn truncate_history(history: &mut Vec<Message>) {
    if history.len() > MAX_HISTORY {
        let excess = history.len() - MAX_HISTORY;
        history.drain(..excess);
    }
}

pub struct ConversationStore {
    volatile: Arc<dyn VolatileStore>,
    durable: Arc<dyn DurableStore>,
    hooks: Arc<Hooks>,
    history_ttl: Duration,
}

impl ConversationStore {
    pub fn new(
        volatile: Arc<dyn VolatileStore>,
        durable: Arc<dyn DurableStore>,
        hooks: Arc<Hooks>,
        history_ttl: Duration,
    ) -> Self {
        Self {
            volatile,
            durable,
            hooks,
            history_ttl,
        }
    }

    /// Posted value, then cookie, then a freshly minted identity (which comes
    /// back with the cookie the caller must set).
    pub fn resolve_identity(
        &self,
        posted: Option<&str>,
        cookie: Option<&str>,
    ) -> (String, Vec<SetCookie>) {
        if let Some(id) = posted.and_then(acceptable_identity) {
            return (id.to_string(), Vec::new());
        }
        if let Some(id) = cookie.and_then(acceptable_identity) {
            return (id.to_string(), Vec::new());
        }

        let id = mint_identity();
        debug!("Minted conversation {}", id);
        let cookie = SetCookie {
            name: CONVERSATION_COOKIE.to_string(),
            value: id.clone(),
            max_age: COOKIE_MAX_AGE,
        };
        (id, vec![cookie])
    }

    // Never fails: an unreadable or missing copy reads as empty.
    pub async fn load_history(&self, conversation_id: &str) -> Vec<Message> {
        match self.volatile.get(&history_key(conversation_id)).await {
            Ok(Some(raw)) => {
                if let Some(history) = parse_history(&raw) {
                    return history;
                }
                warn!("Discarding unreadable cached history for {}", conversation_id);
            }
            Ok(None) => {}
            Err(e) => warn!("Volatile history lookup failed for {}: {}", conversation_id, e),
        }

        match self.durable.get_log(conversation_id).await {
            Ok(Some(log)) => parse_history(log.history.as_bytes()).unwrap_or_else(|| {
                warn!("Discarding unreadable history row for {}", conversation_id);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Durable history lookup failed for {}: {}", conversation_id, e);
                Vec::new()
            }
        }
    }

    pub async fn save_history(
        &self,
        conversation_id: &str,
        mut history: Vec<Message>,
        user_id: u64,
        client_address: &str,
    ) -> Result<Vec<Message>, StorageError> {
        truncate_history(&mut history);
        let serialized = serde_json::to_string(&history)?;

        let ttl = self.hooks.history_ttl.apply(self.history_ttl);
        self.volatile
            .set(&history_key(conversation_id), serialized.as_bytes(), ttl)
            .await?;

        self.durable
            .upsert_log(&ConversationLog {
                conversation_id: conversation_id.to_string(),
                user_id,
                client_address: client_address.to_string(),
                history: serialized,
                created_at: Utc::now(),
            })
            .await?;

        debug!(
            "Saved {} messages for conversation {}",
            history.len(),
            conversation_id
        );
        Ok(history)
    }

    // Returns whether a durable row existed.
    pub async fn clear_history(&self, conversation_id: &str) -> Result<bool, StorageError> {
        self.volatile.delete(&history_key(conversation_id)).await?;
        self.durable.delete_log(conversation_id).await
    }

    pub async fn purge_older_than(&self, days: i64) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let removed = self.durable.purge_logs_before(cutoff).await?;
        info!("Purged {} conversation logs older than {} days", removed, days);
        Ok(removed)
    }

    pub async fn get_log(&self, conversation_id: &str) -> Result<ConversationLog, ChatError> {
        self.durable
            .get_log(conversation_id)
            .await?
            .ok_or(ChatError::NotFound)
    }

    // Newest first; `page` is 1-based.
    pub async fn list_logs(
        &self,
        search: Option<String>,
        page: u32,
        per_page: u32,
    ) -> Result<LogPage, StorageError> {
        let per_page = per_page.clamp(1, MAX_PAGE_SIZE);
        let page = page.max(1);
        self.durable
            .list_logs(&LogQuery {
                search,
                limit: per_page,
                offset: (page - 1).saturating_mul(per_page),
            })
            .await
    }
}
