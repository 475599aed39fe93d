use std::env;

use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use log::warn;

// Defaults used when neither the environment nor a hook says otherwise
pub const DEFAULT_RATE_LIMIT_THRESHOLD: u64 = 100;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_HISTORY_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub rate_limit_threshold: u64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub history_ttl_secs: u64,
    pub api_timeout_secs: u64,
    pub widget_token: String,
    pub admin_token: Option<String>,
    pub notify_webhook: Option<String>,
    pub user_id_header: Option<String>,
    pub user_avatar: Option<String>,
    pub assistant_avatar: Option<String>,
    pub templates_dir: String,
    pub static_dir: String,
    pub serialize_conversations: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://chat.db".to_string(),
            rate_limit_threshold: DEFAULT_RATE_LIMIT_THRESHOLD,
            cache_enabled: true,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            history_ttl_secs: DEFAULT_HISTORY_TTL_SECS,
            api_timeout_secs: DEFAULT_API_TIMEOUT_SECS,
            widget_token: String::new(),
            admin_token: None,
            notify_webhook: None,
            user_id_header: None,
            user_avatar: None,
            assistant_avatar: None,
            templates_dir: "templates".to_string(),
            static_dir: "./static".to_string(),
            serialize_conversations: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let widget_token = match non_empty_var("CHAT_WIDGET_TOKEN") {
            Some(token) => token,
            None => {
                warn!("CHAT_WIDGET_TOKEN not set, generating a token for this process");
                generate_token(32)
            }
        };

        Ok(Self {
            host: env::var("CHAT_HOST").unwrap_or(defaults.host),
            port: parse_var("CHAT_PORT")?.unwrap_or(defaults.port),
            database_url: env::var("CHAT_DATABASE_URL").unwrap_or(defaults.database_url),
            rate_limit_threshold: parse_var("CHAT_RATE_LIMIT_THRESHOLD")?
                .unwrap_or(defaults.rate_limit_threshold),
            cache_enabled: parse_var("CHAT_CACHE_ENABLED")?.unwrap_or(defaults.cache_enabled),
            cache_ttl_secs: parse_var("CHAT_CACHE_TTL_SECS")?.unwrap_or(defaults.cache_ttl_secs),
            history_ttl_secs: parse_var("CHAT_HISTORY_TTL_SECS")?
                .unwrap_or(defaults.history_ttl_secs),
            api_timeout_secs: parse_var("CHAT_API_TIMEOUT_SECS")?
                .unwrap_or(defaults.api_timeout_secs),
            widget_token,
            admin_token: non_empty_var("CHAT_ADMIN_TOKEN"),
            notify_webhook: non_empty_var("CHAT_NOTIFY_WEBHOOK"),
            user_id_header: non_empty_var("CHAT_USER_ID_HEADER"),
            user_avatar: non_empty_var("CHAT_USER_AVATAR"),
            assistant_avatar: non_empty_var("CHAT_ASSISTANT_AVATAR"),
            templates_dir: env::var("CHAT_TEMPLATES_DIR").unwrap_or(defaults.templates_dir),
            static_dir: env::var("CHAT_STATIC_DIR").unwrap_or(defaults.static_dir),
            serialize_conversations: parse_var("CHAT_SERIALIZE_CONVERSATIONS")?
                .unwrap_or(defaults.serialize_conversations),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty_var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(None),
    }
}

pub fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

// Site settings an operator edits at runtime.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct EnvSettingsStore;

impl SettingsStore for EnvSettingsStore {
    fn get(&self, key: &str) -> Option<String> {
        env::var(format!("CHAT_{}", key.to_uppercase())).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub prompt: String,
    pub log_retention_days: i64,
    pub debug_mode: bool,
}

impl Settings {
    pub fn load(store: &dyn SettingsStore) -> Self {
        let text = |key: &str| store.get(key).unwrap_or_default().trim().to_string();

        Self {
            endpoint: text("endpoint"),
            api_key: text("api_key"),
            model: text("model"),
            prompt: text("prompt"),
            log_retention_days: store
                .get("log_retention_days")
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|days| *days > 0)
                .unwrap_or(DEFAULT_LOG_RETENTION_DAYS),
            debug_mode: store
                .get("debug_mode")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        }
    }
}
