use crate::application::{AdminGrant, PlanPolicy};
use crate::domain::{ApproveOutcome, PaymentStatus, PendingPayment, Plan};
use crate::infrastructure::{
    notify_best_effort, AccountRepository, Notifier, PaymentRepository, Recipient,
    RepositoryError,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Submitted(PendingPayment),
    /// The reference was already submitted; nothing was written.
    DuplicateReference,
    UnknownPlan(String),
    UnknownAccount,
}

pub struct PaymentService<A, P>
where
    A: AccountRepository,
    P: PaymentRepository,
{
    account_repo: Arc<A>,
    payment_repo: Arc<P>,
    policy: Arc<PlanPolicy>,
    notifier: Arc<dyn Notifier>,
}

impl<A, P> PaymentService<A, P>
where
    A: AccountRepository,
    P: PaymentRepository,
{
    pub fn new(
        account_repo: Arc<A>,
        payment_repo: Arc<P>,
        policy: Arc<PlanPolicy>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            account_repo,
            payment_repo,
            policy,
            notifier,
        }
    }

    /// Record a claim of payment for admin review. Account state is untouched.
    pub async fn submit_payment(
        &self,
        user_id: &str,
        requested_plan: &str,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, PaymentError> {
        let plan = Plan::parse(requested_plan);
        if !self.policy.is_paid_tier(&plan) {
            return Ok(SubmitOutcome::UnknownPlan(plan.to_string()));
        }

        if self.account_repo.get(user_id).await?.is_none() {
            return Ok(SubmitOutcome::UnknownAccount);
        }

        let payment = PendingPayment::new(
            user_id.to_string(),
            plan,
            reference.trim().to_string(),
            now,
        );

        match self.payment_repo.insert_if_absent(&payment).await {
            Ok(true) => {}
            Ok(false) => {
                info!(user_id, reference = %payment.reference, "Duplicate payment reference rejected");
                return Ok(SubmitOutcome::DuplicateReference);
            }
            // Account vanished between the check and the insert.
            Err(RepositoryError::NotFound(_)) => return Ok(SubmitOutcome::UnknownAccount),
            Err(e) => return Err(e.into()),
        }

        info!(
            user_id,
            reference = %payment.reference,
            plan = %payment.requested_plan,
            "Payment submitted for review"
        );
        notify_best_effort(
            self.notifier.as_ref(),
            Recipient::Admin,
            &format!(
                "New payment from user {}: {} plan, reference {}. Awaiting verification.",
                user_id, payment.requested_plan, payment.reference
            ),
        )
        .await;

        Ok(SubmitOutcome::Submitted(payment))
    }

    /// Apply the payment's plan and mark it approved in one unit, then tell the
    /// user. A failed notification does not undo the approval.
    pub async fn approve_payment(
        &self,
        _grant: &AdminGrant,
        reference: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ApproveOutcome, PaymentError> {
        let outcome = self.payment_repo.approve(reference, notes, now).await?;

        if let ApproveOutcome::Approved { payment, .. } = &outcome {
            info!(
                reference,
                user_id = %payment.user_id,
                plan = %payment.requested_plan,
                "Payment approved"
            );
            notify_best_effort(
                self.notifier.as_ref(),
                Recipient::User(payment.user_id.clone()),
                &format!(
                    "Your payment was verified. The {} plan is now active.",
                    payment.requested_plan
                ),
            )
            .await;
        }

        Ok(outcome)
    }

    pub async fn list_payments(
        &self,
        _grant: &AdminGrant,
        status: PaymentStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PendingPayment>, PaymentError> {
        Ok(self.payment_repo.list_by_status(status, limit, offset).await?)
    }

    pub async fn list_user_payments(
        &self,
        _grant: &AdminGrant,
        user_id: &str,
    ) -> Result<Vec<PendingPayment>, PaymentError> {
        Ok(self.payment_repo.list_by_user(user_id).await?)
    }
}
