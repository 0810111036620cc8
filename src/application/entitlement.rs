//! Entitlement engine: the single decision point for gated actions.
//!
//! `check_and_consume` is linearizable per account without in-process locks.
//! The increment is one conditional write that re-checks the plan, the usage
//! window and the quota in the database, so concurrent consumers never abort
//! each other. A write refused because the plan or window changed underneath
//! re-reads the row and re-runs the whole check, up to a bounded number of
//! attempts. This holds across any number of server processes sharing the
//! database.
//!
//! Consumption is not reversible. If the caller goes away after the
//! increment reached the database, or the gated action fails afterwards, the
//! unit stays spent.

use crate::application::accounts::get_or_create;
use crate::application::{PlanPolicy, PlanValidity};
use crate::domain::{Account, Quota};
use crate::infrastructure::{AccountRepository, RepositoryError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Why a gated action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Denial {
    TrialExpired,
    PlanExpired,
    QuotaExceeded { limit: u32 },
    /// Storage failed or the decision timed out. The caller must not proceed.
    StorageError,
}

impl Denial {
    pub fn code(&self) -> &'static str {
        match self {
            Denial::TrialExpired => "trial_expired",
            Denial::PlanExpired => "plan_expired",
            Denial::QuotaExceeded { .. } => "quota_exceeded",
            Denial::StorageError => "storage_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// One unit was consumed; `used` is the count after this action.
    Allowed { limit: Quota, used: u32 },
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

#[derive(Error, Debug)]
pub enum EntitlementError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Gave up after {0} attempts against a changing account")]
    Contention(u32),
}

/// Refusal that depends only on plan validity, checked before any write.
fn validity_denial(policy: &PlanPolicy, account: &Account, now: DateTime<Utc>) -> Option<Denial> {
    match policy.validity(account, now) {
        PlanValidity::TrialExpired => Some(Denial::TrialExpired),
        PlanValidity::PlanExpired => Some(Denial::PlanExpired),
        PlanValidity::Active { .. } => None,
    }
}

pub struct EntitlementService<A>
where
    A: AccountRepository,
{
    account_repo: Arc<A>,
    policy: Arc<PlanPolicy>,
    decision_timeout: Duration,
    max_retries: u32,
}

impl<A> EntitlementService<A>
where
    A: AccountRepository,
{
    pub fn new(account_repo: Arc<A>, policy: Arc<PlanPolicy>) -> Self {
        Self {
            account_repo,
            policy,
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_limits(mut self, decision_timeout: Duration, max_retries: u32) -> Self {
        self.decision_timeout = decision_timeout;
        self.max_retries = max_retries;
        self
    }

    pub fn policy(&self) -> &PlanPolicy {
        &self.policy
    }

    /// Decide whether `user_id` may perform one more gated action at `now`,
    /// and if so record the consumption. Fails closed: any storage problem,
    /// including running out of time, is `Denied(StorageError)`.
    pub async fn check_and_consume(&self, user_id: &str, now: DateTime<Utc>) -> Decision {
        match tokio::time::timeout(self.decision_timeout, self.decide(user_id, now)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!(user_id, error = %e, "Entitlement check failed");
                Decision::Denied(Denial::StorageError)
            }
            Err(_) => {
                warn!(
                    user_id,
                    timeout_ms = self.decision_timeout.as_millis() as u64,
                    "Entitlement check timed out"
                );
                Decision::Denied(Denial::StorageError)
            }
        }
    }

    async fn decide(&self, user_id: &str, now: DateTime<Utc>) -> Result<Decision, EntitlementError> {
        let attempts = self.max_retries.max(1);

        for attempt in 0..attempts {
            let (mut account, _) = get_or_create(self.account_repo.as_ref(), user_id, now).await?;

            if let Some(denial) = validity_denial(&self.policy, &account, now) {
                return Ok(Decision::Denied(denial));
            }

            if self.policy.is_window_stale(account.usage_window_start, now) {
                // Persist the rollover before looking at the quota. The advanced
                // window start makes later calls see a fresh window.
                match self
                    .account_repo
                    .reset_usage_window(user_id, account.usage_window_start, now)
                    .await?
                {
                    Some(reset) => {
                        info!(user_id, "Usage window rolled over");
                        account = reset;
                    }
                    None => {
                        debug!(user_id, attempt, "Window reset lost a race; retrying");
                        continue;
                    }
                }
            }

            let limit = self.policy.limit_for(&account.plan);
            if !limit.admits(account.usage_count) {
                return Ok(Decision::Denied(Denial::QuotaExceeded {
                    limit: limit.bound().unwrap_or_default(),
                }));
            }

            if let Some(used) = self
                .account_repo
                .try_increment_usage(
                    user_id,
                    account.plan_start,
                    account.usage_window_start,
                    limit.bound(),
                )
                .await?
            {
                return Ok(Decision::Allowed { limit, used });
            }
            // Quota filled, or plan or window changed, since the read.
            debug!(user_id, attempt, "Usage increment refused; re-reading account");
        }

        Err(EntitlementError::Contention(attempts))
    }
}
