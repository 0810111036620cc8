use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Support topics a user can open a request under.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Topic {
    TradeSetup,
    AccountHealth,
    Psychology,
    FundedAccount,
    MarginCall,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Answered,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReplySource {
    Auto,
    Agent,
}

/// One inbound support request and its reply, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: Uuid,
    pub user_id: String,
    pub topic: Topic,
    pub message: String,
    pub image_ref: Option<String>,
    pub reply: Option<String>,
    pub reply_source: Option<ReplySource>,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn new(
        user_id: String,
        topic: Topic,
        message: String,
        image_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            topic,
            message,
            image_ref,
            reply: None,
            reply_source: None,
            status: TicketStatus::Open,
            created_at: now,
            answered_at: None,
        }
    }
}
