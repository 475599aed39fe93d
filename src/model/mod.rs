mod transport;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::Settings;
use crate::error::GatewayError;
use crate::hooks::{ApiCallOutcome, Hooks};
use crate::web::models::ChatPayload;

pub use transport::{HttpReply, HttpTransport, ReqwestTransport};
#[cfg(test)]
pub use transport::TransportError;

const MAX_ATTEMPTS: u32 = 3;

pub fn validate_settings(settings: &Settings, endpoint: &str) -> Result<(), GatewayError> {
    let missing: Vec<&str> = [
        ("endpoint", endpoint),
        ("api key", settings.api_key.as_str()),
        ("model", settings.model.as_str()),
        ("prompt", settings.prompt.as_str()),
    ]
    .iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| *name)
    .collect();

    if !missing.is_empty() {
        return Err(GatewayError::Settings(format!(
            "missing {}",
            missing.join(", ")
        )));
    }

    match url::Url::parse(endpoint) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(url) => Err(GatewayError::Settings(format!(
            "unsupported endpoint scheme {}",
            url.scheme()
        ))),
        Err(e) => Err(GatewayError::Settings(format!("invalid endpoint URL: {}", e))),
    }
}

// Pull choices[0].message.content out of an OpenAI-style body
fn extract_content(reply: &HttpReply) -> Result<String, GatewayError> {
    if reply.status != 200 {
        return Err(GatewayError::BadResponse(format!(
            "API returned status {}",
            reply.status
        )));
    }

    let json: Value = serde_json::from_str(&reply.body)
        .map_err(|e| GatewayError::BadResponse(format!("invalid JSON: {}", e)))?;
    debug!("Response JSON: {}", json);

    json.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            GatewayError::BadResponse("missing choices[0].message.content".to_string())
        })
}

pub struct CompletionGateway {
    transport: Arc<dyn HttpTransport>,
    hooks: Arc<Hooks>,
    backoff_unit: Duration,
}

impl CompletionGateway {
    pub fn new(transport: Arc<dyn HttpTransport>, hooks: Arc<Hooks>) -> Self {
        Self {
            transport,
            hooks,
            backoff_unit: Duration::from_secs(1),
        }
    }

    pub fn endpoint(&self, settings: &Settings) -> String {
        self.hooks.endpoint.apply(settings.endpoint.clone())
    }

    /// Send `payload` and return the assistant's reply.
    ///
    /// Transport failures are retried up to three attempts in total, sleeping
    /// 1s then 2s between them. HTTP errors and malformed bodies are final.
    pub async fn complete(
        &self,
        settings: &Settings,
        payload: &ChatPayload,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        let endpoint = self.endpoint(settings);
        validate_settings(settings, &endpoint)?;

        let body = serde_json::to_string(payload)
            .map_err(|e| GatewayError::Settings(format!("payload not serializable: {}", e)))?;

        self.hooks.before_api_call.fire(payload);
        info!(
            "Sending {} messages to {} (model {})",
            payload.messages.len(),
            endpoint,
            payload.model
        );

        let started = Instant::now();
        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            match self
                .transport
                .post_json(&endpoint, &settings.api_key, body.clone(), timeout)
                .await
            {
                Ok(reply) => break extract_content(&reply),
                Err(e) => {
                    warn!("Chat API attempt {}/{} failed: {}", attempts, MAX_ATTEMPTS, e);
                    if attempts >= MAX_ATTEMPTS {
                        break Err(GatewayError::Network(e.0));
                    }
                    let wait = self.backoff_unit * 2u32.pow(attempts - 1);
                    tokio::time::sleep(wait).await;
                }
            }
        };

        let duration = started.elapsed();
        match &result {
            Ok(content) => info!(
                "Chat API replied in {:.2}s after {} attempt(s), {} characters",
                duration.as_secs_f64(),
                attempts,
                content.len()
            ),
            Err(e) => warn!(
                "Chat API failed after {:.2}s and {} attempt(s): {}",
                duration.as_secs_f64(),
                attempts,
                e
            ),
        }
        self.hooks.after_api_call.fire(&ApiCallOutcome {
            duration,
            attempts,
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });

        result
    }
}
