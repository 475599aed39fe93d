use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::orchestrator::ChatService;

pub const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const BAN_CLEAR_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Delete durable conversation rows older than the configured retention.
pub async fn purge_expired_logs(service: &ChatService) {
    let days = service.settings().log_retention_days;
    match service.conversations().purge_older_than(days).await {
        Ok(0) => {}
        Ok(n) => info!("Purged {} conversation logs older than {} days", n, days),
        Err(e) => error!("Conversation log purge failed: {}", e),
    }
}

pub async fn clear_ban_list(service: &ChatService) {
    match service.abuse().clear_bans().await {
        Ok(0) => {}
        Ok(n) => info!("Cleared {} banned clients", n),
        Err(e) => error!("Clearing the ban list failed: {}", e),
    }
}

pub async fn sweep_expired_entries(service: &ChatService) {
    match service.purge_expired_entries().await {
        Ok((0, 0)) => {}
        Ok((volatile, durable)) => debug!(
            "Swept {} expired volatile entries and {} expired mirrors",
            volatile, durable
        ),
        Err(e) => error!("Expiry sweep failed: {}", e),
    }
}

fn every(period: Duration, first_tick: Instant) -> Interval {
    let mut ticker = interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Spawn the background jobs. The log purge and the expiry sweep run once
/// right away; the ban clear first fires an hour after startup.
pub fn spawn(service: Arc<ChatService>) -> Vec<JoinHandle<()>> {
    let purge = {
        let service = service.clone();
        tokio::spawn(async move {
            let mut ticker = every(PURGE_INTERVAL, Instant::now());
            loop {
                ticker.tick().await;
                purge_expired_logs(&service).await;
            }
        })
    };

    let sweep = {
        let service = service.clone();
        tokio::spawn(async move {
            let mut ticker = every(EXPIRY_SWEEP_INTERVAL, Instant::now());
            loop {
                ticker.tick().await;
                sweep_expired_entries(&service).await;
            }
        })
    };

    let bans = tokio::spawn(async move {
        let mut ticker = every(BAN_CLEAR_INTERVAL, Instant::now() + BAN_CLEAR_INTERVAL);
        loop {
            ticker.tick().await;
            clear_ban_list(&service).await;
        }
    });

    vec![purge, sweep, bans]
}
