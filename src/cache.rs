use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::hooks::Hooks;
use crate::storage::{DurableStore, VolatileStore};
use crate::web::models::{Message, ResponseEnvelope, Role};

// Volatile tier first, then the durable mirror. Durable hits are not promoted.
pub struct ResponseCache {
    volatile: Arc<dyn VolatileStore>,
    durable: Arc<dyn DurableStore>,
    hooks: Arc<Hooks>,
    enabled: bool,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(
        volatile: Arc<dyn VolatileStore>,
        durable: Arc<dyn DurableStore>,
        hooks: Arc<Hooks>,
        enabled: bool,
        ttl: Duration,
    ) -> Self {
        Self {
            volatile,
            durable,
            hooks,
            enabled,
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.hooks.cache_enabled.apply(self.enabled)
    }

    pub fn ttl(&self) -> Duration {
        self.hooks.cache_ttl.apply(self.ttl)
    }

    pub fn key(conversation_id: &str, history: &[Message]) -> String {
        let serialized = serde_json::to_vec(history).unwrap_or_default();
        let digest = Sha256::digest(&serialized);
        format!("chat_response:{}{}", conversation_id, hex::encode(digest))
    }

    /// Key an earlier turn was stored under when `message` repeats it, i.e.
    /// `history` already ends with `message` and its answer.
    pub fn repeat_key(conversation_id: &str, history: &[Message], message: &str) -> Option<String> {
        match history {
            [.., asked, answered]
                if asked.role == Role::User
                    && asked.content == message
                    && answered.role == Role::Assistant =>
            {
                Some(Self::key(conversation_id, &history[..history.len() - 1]))
            }
            _ => None,
        }
    }

    pub async fn get(&self, key: &str) -> Option<ResponseEnvelope> {
        if !self.is_enabled() {
            return None;
        }

        match self.volatile.get(key).await {
            Ok(Some(raw)) => match serde_json::from_slice(&raw) {
                Ok(envelope) => {
                    debug!("Response cache hit (volatile) for {}", key);
                    return Some(envelope);
                }
                Err(e) => warn!("Unreadable cached response {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Volatile cache lookup failed for {}: {}", key, e),
        }

        match self.durable.mirror_get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(envelope) => {
                    debug!("Response cache hit (durable) for {}", key);
                    Some(envelope)
                }
                Err(e) => {
                    warn!("Unreadable mirrored response {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Durable cache lookup failed for {}: {}", key, e);
                None
            }
        }
    }

    pub async fn put(
        &self,
        key: &str,
        envelope: &ResponseEnvelope,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let serialized = serde_json::to_string(envelope)?;
        self.volatile.set(key, serialized.as_bytes(), ttl).await?;
        self.durable.mirror_set(key, &serialized, ttl).await?;
        Ok(())
    }
}
