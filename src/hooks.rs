// Named extension points. Filters run in registration order, each receiving
// the previous one's output; actions observe an event. Empty chains are no-ops.

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::web::models::{ChatPayload, ResponseEnvelope};

type FilterFn<T> = Box<dyn Fn(T) -> T + Send + Sync>;
type ActionFn<E> = Box<dyn Fn(&E) + Send + Sync>;

pub struct FilterChain<T> {
    callbacks: Vec<FilterFn<T>>,
}

impl<T> Default for FilterChain<T> {
    fn default() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }
}

impl<T> FilterChain<T> {
    pub fn add<F>(&mut self, callback: F)
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    pub fn apply(&self, value: T) -> T {
        self.callbacks.iter().fold(value, |acc, cb| cb(acc))
    }
}

pub struct ActionList<E> {
    callbacks: Vec<ActionFn<E>>,
}

impl<E> Default for ActionList<E> {
    fn default() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }
}

impl<E> ActionList<E> {
    pub fn add<F>(&mut self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    pub fn fire(&self, event: &E) {
        for cb in &self.callbacks {
            cb(event);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanDecision {
    pub client_address: String,
    pub banned: bool,
}

#[derive(Debug, Clone)]
pub struct ApiCallOutcome {
    pub duration: Duration,
    pub attempts: u32,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub conversation_id: String,
    pub message_count: usize,
    pub api_response_time_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExternalLogEvent {
    pub conversation_id: String,
    pub client_address: String,
    pub user_message: String,
    pub assistant_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub conversation_id: String,
    pub rating: i32,
    #[serde(default)]
    pub feedback: String,
}

#[derive(Default)]
pub struct Hooks {
    pub spam_filter: FilterChain<String>,
    pub is_banned: FilterChain<BanDecision>,
    pub rate_limit_threshold: FilterChain<u64>,
    pub cache_enabled: FilterChain<bool>,
    pub cache_ttl: FilterChain<Duration>,
    pub history_ttl: FilterChain<Duration>,
    pub endpoint: FilterChain<String>,
    pub api_timeout: FilterChain<Duration>,
    pub user_avatar: FilterChain<String>,
    pub assistant_avatar: FilterChain<String>,
    pub response: FilterChain<ResponseEnvelope>,

    pub before_api_call: ActionList<ChatPayload>,
    pub after_api_call: ActionList<ApiCallOutcome>,
    pub feedback: ActionList<Feedback>,
    pub analytics: ActionList<AnalyticsEvent>,
    pub external_log: ActionList<ExternalLogEvent>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    // Configured avatars plus log-backed observers.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut hooks = Self::new();

        if let Some(avatar) = config.user_avatar.clone() {
            hooks.user_avatar.add(move |_| avatar.clone());
        }
        if let Some(avatar) = config.assistant_avatar.clone() {
            hooks.assistant_avatar.add(move |_| avatar.clone());
        }

        hooks.after_api_call.add(|outcome: &ApiCallOutcome| {
            if outcome.success {
                debug!(
                    "Completion call succeeded after {} attempt(s) in {:.2}s",
                    outcome.attempts,
                    outcome.duration.as_secs_f64()
                );
            } else {
                warn!(
                    "Completion call failed after {} attempt(s) in {:.2}s: {}",
                    outcome.attempts,
                    outcome.duration.as_secs_f64(),
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        });
        hooks.analytics.add(|event: &AnalyticsEvent| {
            info!(
                "analytics conversation={} messages={} response_time={:.2}s",
                event.conversation_id, event.message_count, event.api_response_time_secs
            );
        });
        hooks.external_log.add(|event: &ExternalLogEvent| {
            debug!(
                "conversation={} client={} user={:?} assistant={:?}",
                event.conversation_id,
                event.client_address,
                event.user_message,
                event.assistant_message
            );
        });
        hooks.feedback.add(|feedback: &Feedback| {
            info!(
                "Feedback for {}: rating {} {:?}",
                feedback.conversation_id, feedback.rating, feedback.feedback
            );
        });

        hooks
    }
}
