use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    /// Shared secret for the admin surface. Empty disables every admin endpoint.
    pub admin_token: String,

    // Completion collaborator
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,

    // Notifier collaborator
    pub telegram_bot_token: String,
    pub admin_chat_id: String,

    // Uploads
    pub upload_dir: String,
    pub max_upload_bytes: usize,

    // Entitlement
    pub trial_duration_hours: i64,
    pub trial_weekly_limit: u32,
    pub usage_window_days: i64,
    pub decision_timeout_ms: u64,
    pub max_consume_retries: u32,
    #[serde(default)]
    pub tiers: HashMap<String, TierConfig>,
}

/// Paid tier settings. Quota and expiry are independent: a missing
/// `weekly_limit` means unbounded, a missing `duration_days` means the
/// tier never expires.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct TierConfig {
    #[serde(default)]
    pub weekly_limit: Option<u32>,
    #[serde(default)]
    pub duration_days: Option<i64>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("DESK")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 5000)?
            .set_default("admin_token", "")?
            .set_default("openai_api_key", "")?
            .set_default("openai_base_url", "https://api.openai.com/v1")?
            .set_default("openai_model", "gpt-4")?
            .set_default("telegram_bot_token", "")?
            .set_default("admin_chat_id", "")?
            .set_default("upload_dir", "uploads")?
            .set_default("max_upload_bytes", 10 * 1024 * 1024)?
            .set_default("trial_duration_hours", 24)?
            .set_default("trial_weekly_limit", 5)?
            .set_default("usage_window_days", 7)?
            .set_default("decision_timeout_ms", 3000)?
            .set_default("max_consume_retries", 5)?
            // Default paid tiers; elite carries no weekly limit.
            .set_default("tiers.starter.weekly_limit", 5)?
            .set_default("tiers.starter.duration_days", 30)?
            .set_default("tiers.pro.weekly_limit", 10)?
            .set_default("tiers.pro.duration_days", 30)?
            .set_default("tiers.elite.duration_days", 30)?
            .build()?;

        config.try_deserialize()
    }
}
