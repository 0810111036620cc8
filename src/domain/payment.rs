use super::{Account, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
}

/// An unverified claim of payment awaiting admin approval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingPayment {
    pub reference: String,
    pub user_id: String,
    pub requested_plan: Plan,
    pub status: PaymentStatus,
    pub submitted_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl PendingPayment {
    pub fn new(
        user_id: String,
        requested_plan: Plan,
        reference: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            reference,
            user_id,
            requested_plan,
            status: PaymentStatus::Pending,
            submitted_at: now,
            verified_at: None,
            notes: None,
        }
    }
}

/// Result of approving a payment by reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ApproveOutcome {
    /// Plan applied and payment marked approved together.
    Approved {
        payment: PendingPayment,
        account: Account,
    },
    NotFound,
    /// Approval is terminal; a second approval changes nothing.
    AlreadyApproved(PendingPayment),
}
