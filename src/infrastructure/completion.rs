use crate::domain::Topic;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("API request failed: {0}")]
    RequestFailed(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Empty reply")]
    EmptyReply,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Input to reply generation. The image reference is opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub topic: Topic,
    pub message: String,
    pub image_ref: Option<String>,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn generate_reply(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503)
}

const SYSTEM_PROMPT: &str = "You are a professional trading support analyst. \
Prioritize risk management and capital preservation. Give educational insight, \
never financial advice or trade signals. Never recommend adding funds or high-risk trades, \
and never ask which broker the trader uses. Be supportive during drawdowns. \
Speak as a human professional. Keep answers short, structured, and on the user's topic.";

#[derive(Debug, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Builds the chat message list for a topic.
pub fn build_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
    let (image_label, details_label, instructions) = match request.topic {
        Topic::TradeSetup => (
            "Chart screenshot",
            "Trade details",
            "Please analyze in sections: entry quality, stop loss appropriateness, \
             take profit realism, risk/reward ratio, suggestions to improve, potential red flags.",
        ),
        Topic::AccountHealth => (
            "Account screenshot",
            "Account details",
            "Provide a breakdown of risk exposure, lot sizing, overtrading signs, \
             and recommendations to stabilize the account.",
        ),
        Topic::Psychology => (
            "Optional context screenshot",
            "User emotional state",
            "Provide mindset support and actionable coping techniques. Identify signs of \
             revenge trading, overtrading, fear, or overconfidence, and help them refocus.",
        ),
        Topic::FundedAccount => (
            "Challenge/stats screenshot",
            "Details",
            "Review whether the user risks a rule violation, manages position sizing properly, \
             and is on track to pass the evaluation.",
        ),
        Topic::MarginCall => (
            "Critical screenshot",
            "Emergency margin call details",
            "Provide immediate risk mitigation steps, including what to close first and how to \
             reduce exposure, and help the user stay calm.",
        ),
    };

    let mut parts = Vec::new();
    if let Some(image_ref) = request.image_ref.as_deref().filter(|r| !r.is_empty()) {
        parts.push(format!("{}: {}", image_label, image_ref));
    }
    parts.push(format!("{}: {}", details_label, request.message));
    parts.push(instructions.to_string());

    vec![
        ChatMessage {
            role: "system",
            content: SYSTEM_PROMPT.to_string(),
        },
        ChatMessage {
            role: "user",
            content: parts.join("\n\n"),
        },
    ]
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: String, model: String) -> Result<Self, CompletionError> {
        let mut headers = header::HeaderMap::new();
        let auth_value = header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| CompletionError::InvalidConfig(format!("Invalid API key format: {}", e)))?;
        headers.insert(header::AUTHORIZATION, auth_value);
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                CompletionError::InvalidConfig(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, CompletionError> {
        let mut last_error: Option<String> = None;

        for attempt in 0..MAX_RETRIES {
            let response = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .json(body)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();

                    if status == 429 {
                        return Err(CompletionError::RateLimited);
                    }

                    if is_retryable_status(status) && attempt < MAX_RETRIES - 1 {
                        sleep(Duration::from_millis(INITIAL_BACKOFF_MS * 2_u64.pow(attempt))).await;
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if attempt < MAX_RETRIES - 1 {
                        sleep(Duration::from_millis(INITIAL_BACKOFF_MS * 2_u64.pow(attempt))).await;
                    }
                }
            }
        }

        Err(CompletionError::RequestFailed(
            last_error.unwrap_or_else(|| "Max retries exceeded".to_string()),
        ))
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn generate_reply(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = json!({
            "model": self.model,
            "messages": build_messages(request),
        });

        let resp = self.send_with_retry(&body).await?;

        if !resp.status().is_success() {
            let error_text = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(CompletionError::RequestFailed(error_text));
        }

        let json_response: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        extract_reply(&json_response)
    }
}

fn extract_reply(response: &serde_json::Value) -> Result<String, CompletionError> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| CompletionError::InvalidResponse("Missing message content".to_string()))?;

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(CompletionError::EmptyReply);
    }
    Ok(trimmed.to_string())
}
