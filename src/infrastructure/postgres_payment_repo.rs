use async_trait::async_trait;
use crate::domain::{ApproveOutcome, PaymentStatus, PendingPayment, Plan};
use crate::infrastructure::repository::row_to_account;
use crate::infrastructure::{PaymentRepository, RepositoryError};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use tracing::info;

pub struct PostgresPaymentRepository {
    pool: PgPool,
}

impl PostgresPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentRepository for PostgresPaymentRepository {
    async fn insert_if_absent(&self, payment: &PendingPayment) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO pending_payments (reference, user_id, requested_plan, status, submitted_at, verified_at, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (reference) DO NOTHING
            "#,
        )
        .bind(&payment.reference)
        .bind(&payment.user_id)
        .bind(payment.requested_plan.as_str())
        .bind(payment.status.to_string())
        .bind(payment.submitted_at)
        .bind(payment.verified_at)
        .bind(&payment.notes)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_foreign_key_violation() {
                    return RepositoryError::NotFound(format!("Account {}", payment.user_id));
                }
            }
            RepositoryError::DatabaseError(e)
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, reference: &str) -> Result<Option<PendingPayment>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT reference, user_id, requested_plan, status, submitted_at, verified_at, notes
            FROM pending_payments
            WHERE reference = $1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_payment).transpose()
    }

    async fn list_by_status(
        &self,
        status: PaymentStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PendingPayment>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT reference, user_id, requested_plan, status, submitted_at, verified_at, notes
            FROM pending_payments
            WHERE status = $1
            ORDER BY submitted_at ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_payment).collect()
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<PendingPayment>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT reference, user_id, requested_plan, status, submitted_at, verified_at, notes
            FROM pending_payments
            WHERE user_id = $1
            ORDER BY submitted_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_payment).collect()
    }

    async fn approve(
        &self,
        reference: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ApproveOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent approvals of the same reference.
        let row = sqlx::query(
            r#"
            SELECT reference, user_id, requested_plan, status, submitted_at, verified_at, notes
            FROM pending_payments
            WHERE reference = $1
            FOR UPDATE
            "#,
        )
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(ApproveOutcome::NotFound);
        };
        let payment = row_to_payment(&row)?;
        if payment.status == PaymentStatus::Approved {
            return Ok(ApproveOutcome::AlreadyApproved(payment));
        }

        let account_row = sqlx::query(
            r#"
            UPDATE accounts
            SET plan = $1, plan_start = $2, usage_count = 0, usage_window_start = $2,
                version = version + 1, updated_at = $2
            WHERE id = $3
            RETURNING id, plan, plan_start, usage_count, usage_window_start, version, created_at, updated_at
            "#,
        )
        .bind(payment.requested_plan.as_str())
        .bind(now)
        .bind(&payment.user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("Account {}", payment.user_id)))?;
        let account = row_to_account(&account_row)?;

        let payment_row = sqlx::query(
            r#"
            UPDATE pending_payments
            SET status = $1, verified_at = $2, notes = COALESCE($3, notes)
            WHERE reference = $4
            RETURNING reference, user_id, requested_plan, status, submitted_at, verified_at, notes
            "#,
        )
        .bind(PaymentStatus::Approved.to_string())
        .bind(now)
        .bind(notes)
        .bind(reference)
        .fetch_one(&mut *tx)
        .await?;
        let payment = row_to_payment(&payment_row)?;

        tx.commit().await?;

        info!(
            reference = %payment.reference,
            user_id = %payment.user_id,
            plan = %payment.requested_plan,
            "Payment approved and plan applied"
        );

        Ok(ApproveOutcome::Approved { payment, account })
    }
}

fn row_to_payment(row: &sqlx::postgres::PgRow) -> Result<PendingPayment, RepositoryError> {
    let status_str: String = row.try_get("status")?;
    let plan_str: String = row.try_get("requested_plan")?;

    Ok(PendingPayment {
        reference: row.try_get("reference")?,
        user_id: row.try_get("user_id")?,
        requested_plan: Plan::parse(&plan_str),
        status: PaymentStatus::from_str(&status_str).map_err(|_| {
            RepositoryError::InvalidData(format!("Unknown payment status: {}", status_str))
        })?,
        submitted_at: row.try_get("submitted_at")?,
        verified_at: row.try_get("verified_at")?,
        notes: row.try_get("notes")?,
    })
}
