use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::{ServerConfig, Settings, SettingsStore};
use crate::hooks::Hooks;
use crate::model::{HttpReply, HttpTransport, TransportError};
use crate::notify::Notifier;
use crate::orchestrator::{ChatDependencies, ChatService};
use crate::storage::{InMemoryVolatileStore, SqliteDurableStore};

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value.to_string());
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, subject: &str, body: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
    }
}

// Replays queued replies in order; an empty queue answers with a network error.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpReply, TransportError>>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, status: u16, body: &str) {
        self.script.lock().unwrap().push_back(Ok(HttpReply {
            status,
            body: body.to_string(),
        }));
    }

    pub fn push_network_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(TransportError(message.to_string())));
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_body(&self) -> Option<String> {
        self.requests.lock().unwrap().last().map(|(_, b)| b.clone())
    }

    pub fn last_url(&self) -> Option<String> {
        self.requests.lock().unwrap().last().map(|(u, _)| u.clone())
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn post_json(
        &self,
        url: &str,
        _bearer_token: &str,
        body: String,
        _timeout: Duration,
    ) -> Result<HttpReply, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), body));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError("no scripted reply".to_string())))
    }
}

pub fn configured_settings() -> Settings {
    Settings {
        endpoint: "https://api.example.com/v1/chat/completions".into(),
        api_key: "sk-test".into(),
        model: "test-model".into(),
        prompt: "You are a helpful assistant.".into(),
        log_retention_days: 30,
        debug_mode: false,
    }
}

pub fn ok_reply(content: &str) -> String {
    json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] }).to_string()
}

pub struct TestHarness {
    pub service: Arc<ChatService>,
    pub transport: Arc<ScriptedTransport>,
    pub notifier: Arc<RecordingNotifier>,
    pub volatile: Arc<InMemoryVolatileStore>,
    pub durable: Arc<SqliteDurableStore>,
    pub settings: Arc<MemorySettingsStore>,
}

impl TestHarness {
    pub fn config() -> ServerConfig {
        ServerConfig {
            widget_token: "widget-token".into(),
            admin_token: Some("admin-token".into()),
            ..ServerConfig::default()
        }
    }

    pub async fn new() -> Self {
        Self::with_config(Self::config(), Hooks::new()).await
    }

    pub async fn with_hooks(hooks: Hooks) -> Self {
        Self::with_config(Self::config(), hooks).await
    }

    pub async fn with_config(config: ServerConfig, hooks: Hooks) -> Self {
        let settings = Arc::new(MemorySettingsStore::new());
        let defaults = configured_settings();
        settings.set("endpoint", &defaults.endpoint);
        settings.set("api_key", &defaults.api_key);
        settings.set("model", &defaults.model);
        settings.set("prompt", &defaults.prompt);

        let transport = Arc::new(ScriptedTransport::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let volatile = Arc::new(InMemoryVolatileStore::new());
        let durable = Arc::new(
            SqliteDurableStore::connect("sqlite::memory:")
                .await
                .unwrap(),
        );

        let service = Arc::new(ChatService::new(
            &config,
            ChatDependencies {
                settings: settings.clone(),
                volatile: volatile.clone(),
                durable: durable.clone(),
                transport: transport.clone(),
                notifier: notifier.clone(),
                hooks: Arc::new(hooks),
            },
        ));

        Self {
            service,
            transport,
            notifier,
            volatile,
            durable,
            settings,
        }
    }
}
