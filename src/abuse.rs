use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{Settings, SettingsStore};
use crate::error::{ChatError, StorageError};
use crate::hooks::{BanDecision, Hooks};
use crate::notify::Notifier;
use crate::storage::{DurableStore, VolatileStore};

const COUNTER_WINDOW: Duration = Duration::from_secs(60 * 60);

pub(crate) fn counter_key(client_address: &str) -> String {
    format!("chat_requests:{}", client_address)
}

// Durable copy of a counter, so a restart does not reset the window.
#[derive(Debug, Serialize, Deserialize)]
struct CounterMirror {
    count: i64,
    window_end: i64,
}

pub struct AbuseGuard {
    volatile: Arc<dyn VolatileStore>,
    durable: Arc<dyn DurableStore>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<dyn SettingsStore>,
    hooks: Arc<Hooks>,
    threshold: u64,
}

impl AbuseGuard {
    pub fn new(
        volatile: Arc<dyn VolatileStore>,
        durable: Arc<dyn DurableStore>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<dyn SettingsStore>,
        hooks: Arc<Hooks>,
        threshold: u64,
    ) -> Self {
        Self {
            volatile,
            durable,
            notifier,
            settings,
            hooks,
            threshold,
        }
    }

    pub async fn is_banned(&self, client_address: &str) -> Result<bool, StorageError> {
        let banned = self.durable.ban_contains(client_address).await?;
        let decision = self.hooks.is_banned.apply(BanDecision {
            client_address: client_address.to_string(),
            banned,
        });
        Ok(decision.banned)
    }

    /// Count one request for `client_address`; bans the client and returns
    /// `RateLimited` once the hourly count reaches the threshold.
    pub async fn check_and_increment(&self, client_address: &str) -> Result<(), ChatError> {
        let threshold = self.hooks.rate_limit_threshold.apply(self.threshold);
        let key = counter_key(client_address);
        let now = Utc::now().timestamp();

        let mirror = self
            .durable
            .mirror_get(&key)
            .await?
            .and_then(|raw| serde_json::from_str::<CounterMirror>(&raw).ok())
            .filter(|m| m.window_end > now);

        // The volatile tier lost the counter (restart or eviction): seed it
        // from the mirror. `add` only succeeds for the first request to try.
        if let Some(m) = &mirror {
            if m.count > 0 && self.volatile.get(&key).await?.is_none() {
                let remaining = Duration::from_secs(u64::try_from(m.window_end - now).unwrap_or(0));
                if self
                    .volatile
                    .add(&key, m.count.to_string().as_bytes(), remaining)
                    .await?
                {
                    debug!("Resumed request counter for {} at {}", client_address, m.count);
                }
            }
        }

        let count = self.volatile.increment(&key, 1, COUNTER_WINDOW).await?;

        let window_end = mirror
            .map(|m| m.window_end)
            .unwrap_or(now + COUNTER_WINDOW.as_secs() as i64);
        let snapshot = serde_json::to_string(&CounterMirror { count, window_end })
            .map_err(StorageError::from)?;
        let remaining = Duration::from_secs(u64::try_from(window_end - now).unwrap_or(0));
        self.durable.mirror_set(&key, &snapshot, remaining).await?;

        if count >= 0 && count as u64 >= threshold {
            let newly_banned = self.durable.ban_add(client_address).await?;
            warn!(
                "Client {} exceeded {} requests/hour (count {}), banned",
                client_address, threshold, count
            );
            self.notify_rate_limited(client_address, count, threshold, newly_banned);
            return Err(ChatError::RateLimited);
        }

        Ok(())
    }

    fn notify_rate_limited(&self, client_address: &str, count: i64, threshold: u64, newly: bool) {
        self.notifier.notify(
            "Chat widget: client banned for excessive requests",
            &format!(
                "Client {} sent {} requests within an hour (limit {}) and has been banned.",
                client_address, count, threshold
            ),
        );

        if Settings::load(self.settings.as_ref()).debug_mode {
            self.notifier.notify(
                "Chat widget debug: rate limit triggered",
                &format!(
                    "client={} count={} threshold={} newly_banned={} at={}",
                    client_address,
                    count,
                    threshold,
                    newly,
                    Utc::now().to_rfc3339()
                ),
            );
        }
    }

    pub async fn clear_bans(&self) -> Result<u64, StorageError> {
        self.durable.ban_clear().await
    }

    pub async fn banned_clients(&self) -> Result<Vec<String>, StorageError> {
        self.durable.ban_list().await
    }

    pub async fn unban(&self, client_address: &str) -> Result<bool, StorageError> {
        self.volatile.delete(&counter_key(client_address)).await?;
        self.durable.mirror_delete(&counter_key(client_address)).await?;
        self.durable.ban_remove(client_address).await
    }
}
