use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("bad response: {0}")]
    BadResponse(String),
}

// Every variant except `Storage` is a modeled outcome shown to the user.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("client is banned")]
    Banned,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("empty message")]
    EmptyInput,
    #[error("settings invalid: {0}")]
    SettingsInvalid(String),
    #[error("gateway network error: {0}")]
    GatewayNetwork(String),
    #[error("gateway bad response: {0}")]
    GatewayBadResponse(String),
    #[error("conversation not found")]
    NotFound,
    #[error("missing or invalid token")]
    Unauthorized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Banned => "banned",
            ChatError::RateLimited => "rate_limited",
            ChatError::EmptyInput => "empty_input",
            ChatError::SettingsInvalid(_) => "settings_invalid",
            ChatError::GatewayNetwork(_) => "gateway_network_error",
            ChatError::GatewayBadResponse(_) => "gateway_bad_response",
            ChatError::NotFound => "not_found",
            ChatError::Unauthorized => "unauthorized",
            ChatError::InvalidRequest(_) => "invalid_request",
            ChatError::Storage(_) => "internal_error",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ChatError::Banned => {
                "Your access has been temporarily blocked due to excessive requests.".to_string()
            }
            ChatError::RateLimited => "Too many requests. Please try again later.".to_string(),
            ChatError::EmptyInput => "Please enter a message.".to_string(),
            ChatError::SettingsInvalid(_) => {
                "The chat service is not configured correctly. Please contact the site administrator."
                    .to_string()
            }
            ChatError::GatewayNetwork(detail) if detail.trim().is_empty() => {
                "Could not reach the chat service.".to_string()
            }
            ChatError::GatewayNetwork(detail) => {
                format!("Could not reach the chat service: {}", detail.trim())
            }
            ChatError::GatewayBadResponse(_) => {
                "The chat service returned an invalid response.".to_string()
            }
            ChatError::NotFound => "Conversation not found.".to_string(),
            ChatError::Unauthorized => "Invalid or missing security token.".to_string(),
            ChatError::InvalidRequest(reason) => format!("Invalid request: {}.", reason),
            ChatError::Storage(_) => "An internal error occurred.".to_string(),
        }
    }
}

impl From<GatewayError> for ChatError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Settings(detail) => ChatError::SettingsInvalid(detail),
            GatewayError::Network(detail) => ChatError::GatewayNetwork(detail),
            GatewayError::BadResponse(detail) => ChatError::GatewayBadResponse(detail),
        }
    }
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::Banned => StatusCode::FORBIDDEN,
            ChatError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ChatError::EmptyInput | ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::SettingsInvalid(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::GatewayNetwork(_) | ChatError::GatewayBadResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.user_message(),
            "code": self.code(),
        }))
    }
}
