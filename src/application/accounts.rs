use crate::application::{AdminGrant, PlanPolicy, PlanValidity};
use crate::domain::{Account, Plan, Quota};
use crate::infrastructure::{
    notify_best_effort, AccountRepository, Notifier, Recipient, RepositoryError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),
}

/// Load the account, creating a default trial account on first reference.
///
/// A missing row is the normal first-contact case, not a failure; only
/// genuine storage errors are returned as `Err`. The flag reports whether
/// this call created the account.
pub async fn get_or_create<A>(
    repo: &A,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<(Account, bool), RepositoryError>
where
    A: AccountRepository + ?Sized,
{
    if let Some(account) = repo.get(user_id).await? {
        return Ok((account, false));
    }

    let (account, created) = repo
        .insert_if_absent(&Account::new_trial(user_id.to_string(), now))
        .await?;
    if created {
        info!(user_id, "Created trial account");
    }
    Ok((account, created))
}

/// Read-only snapshot of what an account may do right now.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AccountStatus {
    pub user_id: String,
    pub plan: Plan,
    pub trial_active: bool,
    pub expired: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_remaining: Option<i64>,
    /// Usage in the current window; a stale window reads as zero.
    pub requests_week: u32,
    pub limit: Quota,
    pub remaining: Option<u32>,
    pub window_resets_at: DateTime<Utc>,
}

impl AccountStatus {
    pub fn evaluate(policy: &PlanPolicy, account: &Account, now: DateTime<Utc>) -> Self {
        let validity = policy.validity(account, now);
        let (expired, expires_at, days_remaining) = match validity {
            PlanValidity::Active {
                expires_at,
                days_remaining,
            } => (false, expires_at, days_remaining),
            PlanValidity::TrialExpired | PlanValidity::PlanExpired => (true, None, Some(0)),
        };

        let stale = policy.is_window_stale(account.usage_window_start, now);
        let used = if stale { 0 } else { account.usage_count };
        let window_resets_at = if stale {
            now + policy.usage_window()
        } else {
            account.usage_window_start + policy.usage_window()
        };

        let limit = policy.limit_for(&account.plan);
        let remaining = if expired {
            Some(0)
        } else {
            limit.remaining(used)
        };

        Self {
            user_id: account.id.clone(),
            plan: account.plan.clone(),
            trial_active: account.plan.is_trial() && !expired,
            expired,
            expires_at,
            days_remaining,
            requests_week: used,
            limit,
            remaining,
            window_resets_at,
        }
    }
}

pub struct AccountService<A>
where
    A: AccountRepository,
{
    account_repo: Arc<A>,
    policy: Arc<PlanPolicy>,
    notifier: Arc<dyn Notifier>,
}

impl<A> AccountService<A>
where
    A: AccountRepository,
{
    pub fn new(account_repo: Arc<A>, policy: Arc<PlanPolicy>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            account_repo,
            policy,
            notifier,
        }
    }

    pub async fn get_or_create(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Account, AccountError> {
        let (account, _) = get_or_create(self.account_repo.as_ref(), user_id, now).await?;
        Ok(account)
    }

    pub async fn status(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountStatus, AccountError> {
        let account = self.get_or_create(user_id, now).await?;
        Ok(AccountStatus::evaluate(&self.policy, &account, now))
    }

    /// Start the trial for a new user. An existing account is returned as-is;
    /// a trial is never restarted.
    pub async fn start_trial(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountStatus, AccountError> {
        let (account, created) = get_or_create(self.account_repo.as_ref(), user_id, now).await?;

        if created {
            notify_best_effort(
                self.notifier.as_ref(),
                Recipient::Admin,
                &format!("User {} started a free trial.", user_id),
            )
            .await;
        }

        Ok(AccountStatus::evaluate(&self.policy, &account, now))
    }

    /// Manual activation: move the account onto a paid tier and reset usage.
    pub async fn activate(
        &self,
        _grant: &AdminGrant,
        user_id: &str,
        plan: &str,
        now: DateTime<Utc>,
    ) -> Result<Account, AccountError> {
        let plan = Plan::parse(plan);
        if !self.policy.is_paid_tier(&plan) {
            return Err(AccountError::UnknownPlan(plan.to_string()));
        }

        get_or_create(self.account_repo.as_ref(), user_id, now).await?;
        let account = self.account_repo.transition_plan(user_id, &plan, now).await?;
        info!(user_id, plan = %plan, "Account manually activated");

        notify_best_effort(
            self.notifier.as_ref(),
            Recipient::User(user_id.to_string()),
            &format!("Your {} plan has been activated. You can now use the services.", plan),
        )
        .await;
        notify_best_effort(
            self.notifier.as_ref(),
            Recipient::Admin,
            &format!("User {} has been manually activated on {}.", user_id, plan),
        )
        .await;

        Ok(account)
    }

    /// Delete the account; payments and tickets go with it.
    pub async fn delete(&self, _grant: &AdminGrant, user_id: &str) -> Result<bool, AccountError> {
        let deleted = self.account_repo.delete(user_id).await?;
        if deleted {
            info!(user_id, "Account deleted");
        }
        Ok(deleted)
    }
}
