use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    RequestFailed(String),
    #[error("No admin chat configured")]
    NoAdminChat,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Admin,
    User(String),
}

/// Best-effort message channel. Callers log failures and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &Recipient, message: &str) -> Result<(), NotifyError>;
}

/// Send and log on failure. Never propagates.
pub async fn notify_best_effort(notifier: &dyn Notifier, recipient: Recipient, message: &str) {
    if let Err(e) = notifier.notify(&recipient, message).await {
        warn!(error = %e, recipient = ?recipient, "Notification failed");
    }
}

/// Sends through the Telegram Bot API; user ids are Telegram chat ids.
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    admin_chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, admin_chat_id: String) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| NotifyError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{}", bot_token),
            admin_chat_id,
        })
    }

    fn chat_id<'a>(&'a self, recipient: &'a Recipient) -> Result<&'a str, NotifyError> {
        match recipient {
            Recipient::Admin if self.admin_chat_id.is_empty() => Err(NotifyError::NoAdminChat),
            Recipient::Admin => Ok(self.admin_chat_id.as_str()),
            Recipient::User(id) => Ok(id.as_str()),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, recipient: &Recipient, message: &str) -> Result<(), NotifyError> {
        let chat_id = self.chat_id(recipient)?;
        let resp = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&json!({ "chat_id": chat_id, "text": message }))
            .send()
            .await
            .map_err(|e| NotifyError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let error_text = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NotifyError::RequestFailed(error_text));
        }

        Ok(())
    }
}

/// Used when no bot token is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &Recipient, message: &str) -> Result<(), NotifyError> {
        info!(recipient = ?recipient, message, "Notification (log only)");
        Ok(())
    }
}
