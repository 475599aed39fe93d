// Request pipeline shared by the form and JSON transports. History is only
// written after a successful gateway round trip.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::abuse::AbuseGuard;
use crate::cache::ResponseCache;
use crate::config::{ServerConfig, Settings, SettingsStore};
use crate::conversation::{ConversationStore, SetCookie};
use crate::error::{ChatError, StorageError};
use crate::hooks::{AnalyticsEvent, ExternalLogEvent, Hooks};
use crate::model::{validate_settings, CompletionGateway, HttpTransport};
use crate::notify::Notifier;
use crate::render::{self, DEFAULT_ASSISTANT_AVATAR, DEFAULT_USER_AVATAR};
use crate::storage::{DurableStore, VolatileStore};
use crate::web::models::{ChatPayload, Message, ResponseEnvelope, Role};

pub const RESET_COMMAND: &str = "reset";
pub const HISTORY_COMMAND: &str = "history";
pub const RESET_REPLY: &str = "Conversation has been reset.";

#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub client_address: String,
    pub user_id: u64,
    pub posted_conversation_id: Option<String>,
    pub cookie_conversation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub envelope: ResponseEnvelope,
    pub cookies: Vec<SetCookie>,
}

pub struct ChatDependencies {
    pub settings: Arc<dyn SettingsStore>,
    pub volatile: Arc<dyn VolatileStore>,
    pub durable: Arc<dyn DurableStore>,
    pub transport: Arc<dyn HttpTransport>,
    pub notifier: Arc<dyn Notifier>,
    pub hooks: Arc<Hooks>,
}

pub struct ChatService {
    settings: Arc<dyn SettingsStore>,
    hooks: Arc<Hooks>,
    volatile: Arc<dyn VolatileStore>,
    durable: Arc<dyn DurableStore>,
    abuse: AbuseGuard,
    conversations: ConversationStore,
    cache: ResponseCache,
    gateway: CompletionGateway,
    api_timeout: Duration,
    conversation_locks: Option<DashMap<String, Arc<Mutex<()>>>>,
}

impl ChatService {
    pub fn new(config: &ServerConfig, deps: ChatDependencies) -> Self {
        let ChatDependencies {
            settings,
            volatile,
            durable,
            transport,
            notifier,
            hooks,
        } = deps;

        Self {
            abuse: AbuseGuard::new(
                volatile.clone(),
                durable.clone(),
                notifier,
                settings.clone(),
                hooks.clone(),
                config.rate_limit_threshold,
            ),
            conversations: ConversationStore::new(
                volatile.clone(),
                durable.clone(),
                hooks.clone(),
                Duration::from_secs(config.history_ttl_secs),
            ),
            cache: ResponseCache::new(
                volatile.clone(),
                durable.clone(),
                hooks.clone(),
                config.cache_enabled,
                Duration::from_secs(config.cache_ttl_secs),
            ),
            gateway: CompletionGateway::new(transport, hooks.clone()),
            api_timeout: Duration::from_secs(config.api_timeout_secs),
            conversation_locks: config.serialize_conversations.then(DashMap::new),
            settings,
            hooks,
            volatile,
            durable,
        }
    }

    pub fn abuse(&self) -> &AbuseGuard {
        &self.abuse
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn settings(&self) -> Settings {
        Settings::load(self.settings.as_ref())
    }

    // (volatile, durable) counts of expired entries removed.
    pub async fn purge_expired_entries(&self) -> Result<(u64, u64), StorageError> {
        let volatile = self.volatile.purge_expired().await?;
        let durable = self.durable.mirror_purge_expired().await?;
        Ok((volatile, durable))
    }

    pub async fn handle(&self, raw_message: &str, ctx: &ChatContext) -> Result<ChatReply, ChatError> {
        let message = self.hooks.spam_filter.apply(raw_message.to_string());

        if self.abuse.is_banned(&ctx.client_address).await? {
            info!("Rejected banned client {}", ctx.client_address);
            return Err(ChatError::Banned);
        }
        self.abuse.check_and_increment(&ctx.client_address).await?;

        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyInput);
        }

        let (conversation_id, cookies) = self.conversations.resolve_identity(
            ctx.posted_conversation_id.as_deref(),
            ctx.cookie_conversation_id.as_deref(),
        );

        let lock = self.conversation_lock(&conversation_id);
        let guard = match &lock {
            Some(lock) => Some(lock.clone().lock_owned().await),
            None => None,
        };

        let result = self.run(message, &conversation_id, ctx).await;

        drop(guard);
        drop(lock);
        self.release_conversation_lock(&conversation_id);

        result.map(|envelope| ChatReply { envelope, cookies })
    }

    async fn run(
        &self,
        message: &str,
        conversation_id: &str,
        ctx: &ChatContext,
    ) -> Result<ResponseEnvelope, ChatError> {
        let mut history = self.conversations.load_history(conversation_id).await;
        let user_avatar = self.hooks.user_avatar.apply(DEFAULT_USER_AVATAR.to_string());
        let assistant_avatar = self
            .hooks
            .assistant_avatar
            .apply(DEFAULT_ASSISTANT_AVATAR.to_string());

        if message.eq_ignore_ascii_case(RESET_COMMAND) {
            self.conversations.clear_history(conversation_id).await?;
            info!("Conversation {} reset", conversation_id);
            return Ok(ResponseEnvelope {
                user_message_html: render::message_html(Role::User, message, &user_avatar),
                assistant_message_html: render::message_html(
                    Role::Assistant,
                    RESET_REPLY,
                    &assistant_avatar,
                ),
                conversation_id: conversation_id.to_string(),
                api_response_time_seconds: 0.0,
            });
        }

        if message.eq_ignore_ascii_case(HISTORY_COMMAND) {
            return Ok(ResponseEnvelope {
                user_message_html: render::message_html(Role::User, message, &user_avatar),
                assistant_message_html: render::history_html(
                    &history,
                    &user_avatar,
                    &assistant_avatar,
                ),
                conversation_id: conversation_id.to_string(),
                api_response_time_seconds: 0.0,
            });
        }

        let settings = self.settings();
        // A new conversation starts with the configured prompt.
        if history.is_empty() && !settings.prompt.is_empty() {
            history.push(Message::system(settings.prompt.clone()));
        }

        let cache_enabled = self.cache.is_enabled();
        let repeat_key = cache_enabled
            .then(|| ResponseCache::repeat_key(conversation_id, &history, message))
            .flatten();
        history.push(Message::user(message));
        // Stored under the fingerprint of the history actually sent.
        let cache_key = cache_enabled.then(|| ResponseCache::key(conversation_id, &history));

        if let Some(key) = &cache_key {
            for candidate in repeat_key.iter().chain(std::iter::once(key)) {
                if let Some(envelope) = self.cache.get(candidate).await {
                    info!("Serving cached response for conversation {}", conversation_id);
                    return Ok(envelope);
                }
            }
        }

        let endpoint = self.gateway.endpoint(&settings);
        validate_settings(&settings, &endpoint)?;

        let payload = ChatPayload {
            model: settings.model.clone(),
            messages: history,
        };
        let timeout = self.hooks.api_timeout.apply(self.api_timeout);
        debug!("Conversation {} user message: {}", conversation_id, message);

        let started = Instant::now();
        let reply = self.gateway.complete(&settings, &payload, timeout).await?;
        let elapsed = started.elapsed().as_secs_f64();

        let mut history = payload.messages;
        history.push(Message::assistant(reply.clone()));
        let history = self
            .conversations
            .save_history(conversation_id, history, ctx.user_id, &ctx.client_address)
            .await?;

        let envelope = self.hooks.response.apply(ResponseEnvelope {
            user_message_html: render::message_html(Role::User, message, &user_avatar),
            assistant_message_html: render::message_html(Role::Assistant, &reply, &assistant_avatar),
            conversation_id: conversation_id.to_string(),
            api_response_time_seconds: (elapsed * 100.0).round() / 100.0,
        });

        if let Some(key) = &cache_key {
            if let Err(e) = self.cache.put(key, &envelope, self.cache.ttl()).await {
                warn!("Could not cache response for {}: {}", conversation_id, e);
            }
        }

        self.hooks.analytics.fire(&AnalyticsEvent {
            conversation_id: conversation_id.to_string(),
            message_count: history.len(),
            api_response_time_secs: envelope.api_response_time_seconds,
        });
        self.hooks.external_log.fire(&ExternalLogEvent {
            conversation_id: conversation_id.to_string(),
            client_address: ctx.client_address.clone(),
            user_message: message.to_string(),
            assistant_message: reply,
        });

        info!(
            "Conversation {} answered in {:.2}s ({} messages stored)",
            conversation_id,
            envelope.api_response_time_seconds,
            history.len()
        );
        Ok(envelope)
    }

    fn conversation_lock(&self, conversation_id: &str) -> Option<Arc<Mutex<()>>> {
        self.conversation_locks
            .as_ref()
            .map(|locks| locks.entry(conversation_id.to_string()).or_default().clone())
    }

    fn release_conversation_lock(&self, conversation_id: &str) {
        if let Some(locks) = &self.conversation_locks {
            locks.remove_if(conversation_id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::counter_key;
    use crate::test_support::{configured_settings, ok_reply, TestHarness};
    use std::sync::Mutex as StdMutex;

    fn ctx(conversation_id: &str) -> ChatContext {
        ChatContext {
            client_address: "203.0.113.10".into(),
            user_id: 0,
            posted_conversation_id: Some(conversation_id.into()),
            cookie_conversation_id: None,
        }
    }

    #[tokio::test]
    async fn hello_round_trip_creates_row() {
        let h = TestHarness::new().await;
        h.transport.push_reply(200, &ok_reply("Hi there"));

        let reply = h.service.handle("Hello", &ctx("ollama_abc123")).await.unwrap();
        let env = reply.envelope;
        assert!(env.user_message_html.contains("Hello"));
        assert!(env.assistant_message_html.contains("Hi there"));
        assert_eq!(env.conversation_id, "ollama_abc123");
        assert!(reply.cookies.is_empty());

        let row = h.service.conversations().get_log("ollama_abc123").await.unwrap();
        assert_eq!(row.client_address, "203.0.113.10");
        let stored = h.service.conversations().load_history("ollama_abc123").await;
        assert_eq!(
            stored,
            vec![
                Message::system("You are a helpful assistant."),
                Message::user("Hello"),
                Message::assistant("Hi there"),
            ]
        );
    }

    #[tokio::test]
    async fn new_visitor_gets_identity_cookie() {
        let h = TestHarness::new().await;
        h.transport.push_reply(200, &ok_reply("Hi"));
        let reply = h
            .service
            .handle(
                "Hello",
                &ChatContext {
                    client_address: "203.0.113.10".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(reply.cookies.len(), 1);
        assert_eq!(reply.cookies[0].value, reply.envelope.conversation_id);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_after_gates() {
        let h = TestHarness::new().await;
        let err = h.service.handle("   ", &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyInput));
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn spam_filter_runs_first() {
        let mut hooks = Hooks::new();
        hooks.spam_filter.add(|m: String| m.replace("buy pills", ""));
        let h = TestHarness::with_hooks(hooks).await;
        let err = h.service.handle("buy pills", &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyInput));
    }

    #[tokio::test]
    async fn banned_client_is_rejected() {
        let h = TestHarness::new().await;
        h.durable.ban_add("203.0.113.10").await.unwrap();
        let err = h.service.handle("Hello", &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, ChatError::Banned));
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn rate_limit_bans_on_threshold() {
        let h = TestHarness::new().await;
        h.volatile
            .increment(&counter_key("203.0.113.10"), 99, Duration::from_secs(3600))
            .await
            .unwrap();
        let err = h.service.handle("Hello", &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, ChatError::RateLimited));
        assert_eq!(h.notifier.subjects().len(), 1);

        let err = h.service.handle("Hello", &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, ChatError::Banned));
    }

    #[tokio::test]
    async fn reset_clears_both_tiers_without_gateway() {
        let h = TestHarness::new().await;
        h.transport.push_reply(200, &ok_reply("Hi"));
        h.service.handle("Hello", &ctx("c1")).await.unwrap();

        let reply = h.service.handle("RESET", &ctx("c1")).await.unwrap();
        assert!(reply.envelope.assistant_message_html.contains(RESET_REPLY));
        assert!(h.service.conversations().load_history("c1").await.is_empty());
        assert!(matches!(
            h.service.conversations().get_log("c1").await,
            Err(ChatError::NotFound)
        ));
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn history_command_is_read_only() {
        let h = TestHarness::new().await;
        let empty = h.service.handle("history", &ctx("c1")).await.unwrap();
        assert!(empty.envelope.assistant_message_html.is_empty());

        h.transport.push_reply(200, &ok_reply("Hi there"));
        h.service.handle("Hello", &ctx("c1")).await.unwrap();
        let before = h.service.conversations().load_history("c1").await;

        let shown = h.service.handle("History", &ctx("c1")).await.unwrap();
        assert!(shown.envelope.assistant_message_html.contains("Hi there"));
        assert_eq!(h.service.conversations().load_history("c1").await, before);
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn repeated_request_is_served_from_cache() {
        let h = TestHarness::new().await;
        h.transport.push_reply(200, &ok_reply("Hi there"));

        let first = h.service.handle("Hello", &ctx("c1")).await.unwrap();
        let stored = h.service.conversations().load_history("c1").await;
        let second = h.service.handle("Hello", &ctx("c1")).await.unwrap();

        assert_eq!(
            serde_json::to_string(&first.envelope).unwrap(),
            serde_json::to_string(&second.envelope).unwrap()
        );
        assert_eq!(h.transport.calls(), 1);
        assert_eq!(h.service.conversations().load_history("c1").await, stored);
    }

    #[tokio::test]
    async fn repeat_after_expiry_is_cached_under_its_own_history() {
        let h = TestHarness::new().await;
        h.transport.push_reply(200, &ok_reply("answer A"));
        h.transport.push_reply(200, &ok_reply("answer B"));
        h.transport.push_reply(200, &ok_reply("answer C"));

        h.service.handle("Hello", &ctx("c1")).await.unwrap();

        // Drop the first turn's entry from both tiers as if its TTL ran out.
        let first_key = ResponseCache::key(
            "c1",
            &[
                Message::system(configured_settings().prompt),
                Message::user("Hello"),
            ],
        );
        h.volatile.delete(&first_key).await.unwrap();
        h.durable.mirror_delete(&first_key).await.unwrap();

        let second = h.service.handle("Hello", &ctx("c1")).await.unwrap();
        let third = h.service.handle("Hello", &ctx("c1")).await.unwrap();

        assert!(second.envelope.assistant_message_html.contains("answer B"));
        assert!(third.envelope.assistant_message_html.contains("answer B"));
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn cache_disabled_calls_gateway_each_time() {
        let mut config = TestHarness::config();
        config.cache_enabled = false;
        let h = TestHarness::with_config(config, Hooks::new()).await;
        h.transport.push_reply(200, &ok_reply("one"));
        h.transport.push_reply(200, &ok_reply("two"));

        h.service.handle("Hello", &ctx("c1")).await.unwrap();
        let second = h.service.handle("Hello", &ctx("c1")).await.unwrap();
        assert!(second.envelope.assistant_message_html.contains("two"));
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected_without_writes() {
        let h = TestHarness::new().await;
        h.settings.set("api_key", "");
        let err = h.service.handle("Hello", &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, ChatError::SettingsInvalid(_)));
        assert_eq!(h.transport.calls(), 0);
        assert!(h.service.conversations().load_history("c1").await.is_empty());
    }

    #[tokio::test]
    async fn gateway_failure_leaves_history_untouched() {
        let h = TestHarness::new().await;
        h.transport.push_reply(200, &ok_reply("Hi"));
        h.service.handle("Hello", &ctx("c1")).await.unwrap();
        let before = h.service.conversations().load_history("c1").await;

        h.transport.push_reply(502, "bad gateway");
        let err = h.service.handle("Another", &ctx("c1")).await.unwrap_err();
        assert!(matches!(err, ChatError::GatewayBadResponse(_)));
        assert_eq!(h.service.conversations().load_history("c1").await, before);
    }

    // Real clock: the durable tier talks to a SQLite worker thread, which a
    // paused runtime would race with its own timers.
    #[tokio::test]
    async fn network_failures_then_success() {
        let h = TestHarness::new().await;
        h.transport.push_network_error("connection refused");
        h.transport.push_network_error("connection refused");
        h.transport.push_reply(200, &ok_reply("finally"));

        let started = Instant::now();
        let reply = h.service.handle("Hello", &ctx("c1")).await.unwrap();
        assert!(reply.envelope.assistant_message_html.contains("finally"));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(h.transport.calls(), 3);
    }

    #[tokio::test]
    async fn hooks_shape_the_envelope_and_observe_the_call() {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let mut hooks = Hooks::new();
        hooks.assistant_avatar.add(|_| "https://example.com/bot.png".to_string());
        hooks.response.add(|mut env: ResponseEnvelope| {
            env.assistant_message_html.push_str("<!-- shaped -->");
            env
        });
        let sink = events.clone();
        hooks
            .analytics
            .add(move |e: &AnalyticsEvent| sink.lock().unwrap().push(e.message_count));

        let h = TestHarness::with_hooks(hooks).await;
        h.transport.push_reply(200, &ok_reply("Hi"));
        let reply = h.service.handle("Hello", &ctx("c1")).await.unwrap();

        assert!(reply
            .envelope
            .assistant_message_html
            .contains("https://example.com/bot.png"));
        assert!(reply.envelope.assistant_message_html.ends_with("<!-- shaped -->"));
        assert_eq!(*events.lock().unwrap(), vec![3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serialized_conversations_keep_every_turn() {
        let mut config = TestHarness::config();
        config.serialize_conversations = true;
        config.cache_enabled = false;
        let h = Arc::new(TestHarness::with_config(config, Hooks::new()).await);
        for i in 0..4 {
            h.transport.push_reply(200, &ok_reply(&format!("answer {}", i)));
        }

        let mut handles = Vec::new();
        for i in 0..4 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.service
                    .handle(&format!("question {}", i), &ctx("shared"))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // system prompt + 4 questions + 4 answers
        let stored = h.service.conversations().load_history("shared").await;
        assert_eq!(stored.len(), 9);
    }
}
