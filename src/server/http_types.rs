use crate::application::AccountStatus;
use crate::domain::{PendingPayment, Ticket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

pub(super) const MAX_PAGINATION_LIMIT: i64 = 1000;

#[derive(Serialize, ToSchema)]
pub(super) struct HealthResponse {
    pub(super) status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) error: Option<String>,
}

#[derive(Deserialize, Debug, IntoParams, ToSchema)]
pub(super) struct PaginationParams {
    #[serde(default = "default_limit")]
    #[param(default = 100, maximum = 1000)]
    pub(super) limit: i64,
    #[serde(default)]
    #[param(default = 0)]
    pub(super) offset: i64,
}

impl PaginationParams {
    pub(super) fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, MAX_PAGINATION_LIMIT), self.offset.max(0))
    }
}

pub(super) fn default_limit() -> i64 {
    100
}

#[derive(Deserialize, Debug, IntoParams, ToSchema)]
pub(super) struct PaymentListParams {
    /// `pending` (default) or `approved`.
    #[serde(default = "default_payment_status")]
    pub(super) status: String,
    #[serde(default = "default_limit")]
    pub(super) limit: i64,
    #[serde(default)]
    pub(super) offset: i64,
}

fn default_payment_status() -> String {
    "pending".to_string()
}

#[derive(Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct UserRequest {
    #[validate(length(min = 1, max = 128))]
    #[schema(example = "123456789")]
    pub(super) user_id: String,
}

#[derive(Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChatRequest {
    #[validate(length(min = 1, max = 128))]
    pub(super) user_id: String,
    #[schema(example = "trade_setup")]
    pub(super) topic: String,
    #[validate(length(min = 1, max = 4000))]
    pub(super) message: String,
    /// Reference returned by the upload endpoint.
    #[serde(default, alias = "imageDescription")]
    #[validate(length(max = 512))]
    pub(super) image_ref: Option<String>,
}

#[derive(Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct SubmitPaymentRequest {
    #[validate(length(min = 1, max = 128))]
    pub(super) user_id: String,
    #[serde(alias = "plan")]
    #[schema(example = "pro")]
    pub(super) package: String,
    /// Transaction hash of the payment.
    #[validate(length(min = 8, max = 256))]
    pub(super) txid: String,
}

#[derive(Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct ActivateRequest {
    #[validate(length(min = 1, max = 128))]
    pub(super) user_id: String,
    #[serde(alias = "plan")]
    pub(super) package: String,
}

#[derive(Deserialize, Validate, ToSchema, Default)]
pub(super) struct ApprovePaymentRequest {
    #[serde(default)]
    #[validate(length(max = 1000))]
    pub(super) notes: Option<String>,
}

#[derive(Deserialize, Validate, ToSchema)]
pub(super) struct TicketReplyRequest {
    #[validate(length(min = 1, max = 8000))]
    pub(super) reply: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatusResponse {
    pub(super) user_id: String,
    pub(super) package: String,
    pub(super) trial_active: bool,
    pub(super) expired: bool,
    pub(super) expires_at: Option<DateTime<Utc>>,
    pub(super) days_remaining: Option<i64>,
    pub(super) requests_week: u32,
    /// `null` when unbounded.
    pub(super) limit: Option<u32>,
    pub(super) remaining: Option<u32>,
    pub(super) window_resets_at: DateTime<Utc>,
}

impl From<AccountStatus> for StatusResponse {
    fn from(status: AccountStatus) -> Self {
        Self {
            user_id: status.user_id,
            package: status.plan.to_string(),
            trial_active: status.trial_active,
            expired: status.expired,
            expires_at: status.expires_at,
            days_remaining: status.days_remaining,
            requests_week: status.requests_week,
            limit: status.limit.bound(),
            remaining: status.remaining,
            window_resets_at: status.window_resets_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct PaymentResponse {
    pub(super) reference: String,
    pub(super) user_id: String,
    pub(super) requested_plan: String,
    pub(super) status: String,
    pub(super) submitted_at: DateTime<Utc>,
    pub(super) verified_at: Option<DateTime<Utc>>,
    pub(super) notes: Option<String>,
}

impl From<PendingPayment> for PaymentResponse {
    fn from(payment: PendingPayment) -> Self {
        Self {
            reference: payment.reference,
            user_id: payment.user_id,
            requested_plan: payment.requested_plan.to_string(),
            status: payment.status.to_string(),
            submitted_at: payment.submitted_at,
            verified_at: payment.verified_at,
            notes: payment.notes,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(super) struct TicketResponse {
    pub(super) id: Uuid,
    pub(super) user_id: String,
    pub(super) topic: String,
    pub(super) message: String,
    pub(super) image_ref: Option<String>,
    pub(super) reply: Option<String>,
    pub(super) reply_source: Option<String>,
    pub(super) status: String,
    pub(super) created_at: DateTime<Utc>,
    pub(super) answered_at: Option<DateTime<Utc>>,
}

impl From<Ticket> for TicketResponse {
    fn from(ticket: Ticket) -> Self {
        Self {
            id: ticket.id,
            user_id: ticket.user_id,
            topic: ticket.topic.to_string(),
            message: ticket.message,
            image_ref: ticket.image_ref,
            reply: ticket.reply,
            reply_source: ticket.reply_source.map(|s| s.to_string()),
            status: ticket.status.to_string(),
            created_at: ticket.created_at,
            answered_at: ticket.answered_at,
        }
    }
}
