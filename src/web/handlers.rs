use actix_web::cookie::{time, Cookie, SameSite};
use actix_web::http::header::{self, HeaderMap};
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use log::{error, info, warn};
use serde_json::json;
use tera::Context;

use crate::client_ip::resolve_client_address;
use crate::config::ServerConfig;
use crate::conversation::{acceptable_identity, SetCookie, CONVERSATION_COOKIE};
use crate::error::ChatError;
use crate::hooks::Feedback;
use crate::orchestrator::ChatContext;
use crate::render::{history_html, DEFAULT_ASSISTANT_AVATAR, DEFAULT_USER_AVATAR};
use crate::web::models::{ChatForm, ChatRequest, HistoryUpdate, LogListParams, ResponseEnvelope};
use crate::AppState;

pub const WIDGET_TOKEN_HEADER: &str = "X-Widget-Token";

const DEFAULT_PAGE_SIZE: u32 = 20;

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn require_widget_token(req: &HttpRequest, config: &ServerConfig) -> Result<(), ChatError> {
    match header_value(req.headers(), WIDGET_TOKEN_HEADER) {
        Some(token) if !config.widget_token.is_empty() && token == config.widget_token => Ok(()),
        _ => Err(ChatError::Unauthorized),
    }
}

// The admin surface is off unless an admin token is configured.
fn require_admin(req: &HttpRequest, config: &ServerConfig) -> Result<(), ChatError> {
    let expected = match config.admin_token.as_deref() {
        Some(token) if !token.is_empty() => token,
        _ => return Err(ChatError::Unauthorized),
    };
    let presented = header_value(req.headers(), header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(ChatError::Unauthorized),
    }
}

fn conversation_path(path: web::Path<String>) -> Result<String, ChatError> {
    let raw = path.into_inner();
    acceptable_identity(&raw)
        .map(str::to_string)
        .ok_or_else(|| ChatError::InvalidRequest("malformed conversation id".into()))
}

fn client_address(req: &HttpRequest) -> String {
    resolve_client_address(req.headers(), req.peer_addr())
}

fn user_id(req: &HttpRequest, config: &ServerConfig) -> u64 {
    config
        .user_id_header
        .as_deref()
        .and_then(|name| header_value(req.headers(), name))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn chat_context(req: &HttpRequest, config: &ServerConfig, posted: Option<String>) -> ChatContext {
    ChatContext {
        client_address: client_address(req),
        user_id: user_id(req, config),
        posted_conversation_id: posted,
        cookie_conversation_id: req
            .cookie(CONVERSATION_COOKIE)
            .map(|c| c.value().to_string()),
    }
}

fn to_cookie(instruction: &SetCookie) -> Cookie<'static> {
    Cookie::build(instruction.name.clone(), instruction.value.clone())
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(instruction.max_age.as_secs() as i64))
        .finish()
}

struct Page {
    conversation_id: Option<String>,
    history_html: String,
    envelope: Option<ResponseEnvelope>,
    error: Option<String>,
}

fn render_page(data: &AppState, page: &Page) -> Result<String, tera::Error> {
    let mut context = Context::new();
    context.insert("widget_token", &data.config.widget_token);
    context.insert("conversation_id", &page.conversation_id);
    context.insert("history_html", &page.history_html);
    context.insert("envelope", &page.envelope);
    context.insert("error", &page.error);
    data.tera.render("index.html", &context)
}

fn template_failure(e: tera::Error) -> HttpResponse {
    error!("Template error: {}", e);
    HttpResponse::InternalServerError().body("Template error")
}

// Index page handler
pub async fn index(data: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let conversation_id = req
        .cookie(CONVERSATION_COOKIE)
        .map(|c| c.value().to_string());

    let history_html = match &conversation_id {
        Some(id) => {
            let hooks = data.chat.hooks();
            let history = data.chat.conversations().load_history(id).await;
            history_html(
                &history,
                &hooks.user_avatar.apply(DEFAULT_USER_AVATAR.to_string()),
                &hooks.assistant_avatar.apply(DEFAULT_ASSISTANT_AVATAR.to_string()),
            )
        }
        None => String::new(),
    };

    let page = Page {
        conversation_id,
        history_html,
        envelope: None,
        error: None,
    };
    match render_page(&data, &page) {
        Ok(html) => HttpResponse::Ok().content_type("text/html").body(html),
        Err(e) => template_failure(e),
    }
}

// Health check endpoint
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

// Form post; errors render inline with their status code.
pub async fn chat_form(
    data: web::Data<AppState>,
    req: HttpRequest,
    form: web::Form<ChatForm>,
) -> impl Responder {
    let form = form.into_inner();
    let ctx = chat_context(&req, &data.config, form.conversation_id.clone());

    match data.chat.handle(&form.message, &ctx).await {
        Ok(reply) => {
            let page = Page {
                conversation_id: Some(reply.envelope.conversation_id.clone()),
                history_html: String::new(),
                envelope: Some(reply.envelope),
                error: None,
            };
            match render_page(&data, &page) {
                Ok(html) => {
                    let mut builder = HttpResponse::Ok();
                    for instruction in &reply.cookies {
                        builder.cookie(to_cookie(instruction));
                    }
                    builder.content_type("text/html").body(html)
                }
                Err(e) => template_failure(e),
            }
        }
        Err(e) => {
            let page = Page {
                conversation_id: form.conversation_id.or(ctx.cookie_conversation_id),
                history_html: String::new(),
                envelope: None,
                error: Some(e.user_message()),
            };
            match render_page(&data, &page) {
                Ok(html) => HttpResponse::build(e.status_code())
                    .content_type("text/html")
                    .body(html),
                Err(e) => template_failure(e),
            }
        }
    }
}

// Widget JSON chat endpoint
pub async fn chat_api(
    data: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, ChatError> {
    require_widget_token(&req, &data.config)?;
    let body = body.into_inner();
    let ctx = chat_context(&req, &data.config, body.conversation_id);

    let reply = data.chat.handle(&body.message, &ctx).await?;

    let mut builder = HttpResponse::Ok();
    for instruction in &reply.cookies {
        builder.cookie(to_cookie(instruction));
    }
    Ok(builder.json(reply.envelope))
}

// Widget-facing read: the history only, without who wrote it.
pub async fn get_log(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ChatError> {
    require_widget_token(&req, &data.config)?;
    let conversation_id = conversation_path(path)?;
    let log = data.chat.conversations().get_log(&conversation_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "conversation_id": log.conversation_id,
        "history": log.history,
        "created_at": log.created_at,
    })))
}

// Replace a conversation's history outright, no cache or gateway. An existing
// row keeps its owner.
pub async fn update_log(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<HistoryUpdate>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&req, &data.config)?;
    let conversation_id = conversation_path(path)?;
    let conversations = data.chat.conversations();

    let (owner_id, owner_address) = match conversations.get_log(&conversation_id).await {
        Ok(existing) => (existing.user_id, existing.client_address),
        Err(ChatError::NotFound) => (user_id(&req, &data.config), client_address(&req)),
        Err(e) => return Err(e),
    };

    let stored = conversations
        .save_history(
            &conversation_id,
            body.into_inner().history,
            owner_id,
            &owner_address,
        )
        .await?;

    info!(
        "History of conversation {} replaced ({} messages)",
        conversation_id,
        stored.len()
    );
    Ok(HttpResponse::Ok().json(json!({
        "conversation_id": conversation_id,
        "history": stored,
    })))
}

pub async fn feedback(
    data: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<Feedback>,
) -> Result<HttpResponse, ChatError> {
    require_widget_token(&req, &data.config)?;
    let feedback = body.into_inner();
    if feedback.conversation_id.trim().is_empty() {
        return Err(ChatError::InvalidRequest("conversation_id is required".into()));
    }

    data.chat.hooks().feedback.fire(&feedback);
    Ok(HttpResponse::Ok().json(json!({ "status": "ok" })))
}

pub async fn admin_list_logs(
    data: web::Data<AppState>,
    req: HttpRequest,
    query: web::Query<LogListParams>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&req, &data.config)?;
    let params = query.into_inner();
    let search = params.search.filter(|s| !s.trim().is_empty());
    let page = data
        .chat
        .conversations()
        .list_logs(
            search,
            params.page.unwrap_or(1),
            params.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn admin_delete_log(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&req, &data.config)?;
    let conversation_id = conversation_path(path)?;
    if !data.chat.conversations().clear_history(&conversation_id).await? {
        return Err(ChatError::NotFound);
    }
    info!("Deleted conversation {}", conversation_id);
    Ok(HttpResponse::NoContent().finish())
}

pub async fn admin_list_bans(
    data: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ChatError> {
    require_admin(&req, &data.config)?;
    let banned = data.chat.abuse().banned_clients().await?;
    Ok(HttpResponse::Ok().json(json!({ "banned": banned })))
}

pub async fn admin_clear_bans(
    data: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, ChatError> {
    require_admin(&req, &data.config)?;
    let cleared = data.chat.abuse().clear_bans().await?;
    warn!("Ban list cleared by operator ({} entries)", cleared);
    Ok(HttpResponse::Ok().json(json!({ "cleared": cleared })))
}

pub async fn admin_unban(
    data: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ChatError> {
    require_admin(&req, &data.config)?;
    let client = path.into_inner();
    if !data.chat.abuse().unban(&client).await? {
        return Err(ChatError::NotFound);
    }
    info!("Unbanned {}", client);
    Ok(HttpResponse::NoContent().finish())
}
