mod abuse;
mod cache;
mod client_ip;
mod config;
mod conversation;
mod error;
mod hooks;
mod model;
mod notify;
mod orchestrator;
mod render;
mod scheduler;
mod storage;
mod web;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use actix_files as fs;
use actix_web::{web::Data, App, HttpServer};
use anyhow::Context as _;
use dotenv::dotenv;
use log::{error, info};
use tera::Tera;

use config::{EnvSettingsStore, ServerConfig};
use hooks::Hooks;
use model::ReqwestTransport;
use notify::{LogNotifier, Notifier, WebhookNotifier};
use orchestrator::{ChatDependencies, ChatService};
use storage::{InMemoryVolatileStore, SqliteDurableStore};
use web::routes;

// App state structure
struct AppState {
    tera: Tera,
    chat: Arc<ChatService>,
    config: Arc<ServerConfig>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting widget chat bridge");

    let config = Arc::new(ServerConfig::from_env()?);

    let durable = match SqliteDurableStore::connect(&config.database_url).await {
        Ok(store) => {
            info!("Durable store ready at {}", config.database_url);
            Arc::new(store)
        }
        Err(e) => {
            error!("Failed to open durable store {}: {}", config.database_url, e);
            std::process::exit(1);
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let chat = Arc::new(ChatService::new(
        &config,
        ChatDependencies {
            settings: Arc::new(EnvSettingsStore),
            volatile: Arc::new(InMemoryVolatileStore::new()),
            durable,
            transport: Arc::new(ReqwestTransport::new()),
            notifier,
            hooks: Arc::new(Hooks::from_config(&config)),
        },
    ));

    let _jobs = scheduler::spawn(chat.clone());

    // Initialize template engine
    let mut tera = match Tera::new(&format!("{}/**/*", config.templates_dir)) {
        Ok(t) => t,
        Err(e) => {
            error!("Template parsing error: {}", e);
            std::process::exit(1);
        }
    };
    tera.autoescape_on(vec![".html"]);

    let app_state = Data::new(AppState {
        tera,
        chat,
        config: config.clone(),
    });

    let static_dir = config.static_dir.clone();
    info!("Listening on {}:{}", config.host, config.port);

    // Start web server
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
            .service(fs::Files::new("/static", &static_dir))
    })
    .bind((config.host.as_str(), config.port))
    .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?
    .run()
    .await?;

    Ok(())
}
