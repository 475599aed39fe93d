use log::{error, warn};
use reqwest::Client;
use serde_json::json;

pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) {
        warn!("[notify] {}: {}", subject, body);
    }
}

// POSTs `{subject, body}` without waiting for the result.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, subject: &str, body: &str) {
        warn!("[notify] {}: {}", subject, body);

        let request = self
            .client
            .post(&self.url)
            .json(&json!({ "subject": subject, "body": body }));

        // Outside a runtime there is nobody to drive the request; the log line
        // above is all we get.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match request.send().await {
                    Ok(resp) if !resp.status().is_success() => {
                        error!("Notification webhook returned {}", resp.status());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Notification webhook failed: {}", e),
                }
            });
        }
    }
}
