use crate::domain::{
    Account, ApproveOutcome, PaymentStatus, PendingPayment, Plan, ReplySource, Ticket,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Account rows. A missing row is `Ok(None)` from `get`, never an error.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    #[must_use]
    async fn get(&self, id: &str) -> Result<Option<Account>, RepositoryError>;
    /// Insert `account` unless a row with its id exists. Returns the stored row
    /// either way, so concurrent first references converge on one account, and
    /// whether this call was the one that inserted it.
    #[must_use]
    async fn insert_if_absent(&self, account: &Account) -> Result<(Account, bool), RepositoryError>;
    /// Restart the usage window at `window_start` if the row is still in the
    /// window that began at `expected_window_start`. Returns the stored row, or
    /// `None` when another writer moved the window first.
    #[must_use]
    async fn reset_usage_window(
        &self,
        id: &str,
        expected_window_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Account>, RepositoryError>;
    /// Add one unit of usage in a single conditional write. The row must still
    /// be on the plan started at `plan_start`, inside the window started at
    /// `window_start`, and below `limit` (`None` = unbounded). Returns the new
    /// count, or `None` when any condition no longer holds.
    #[must_use]
    async fn try_increment_usage(
        &self,
        id: &str,
        plan_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Option<u32>, RepositoryError>;
    /// Move the account onto `plan`, restarting the plan and usage windows at `now`.
    #[must_use]
    async fn transition_plan(
        &self,
        id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Account, RepositoryError>;
    /// Delete the account and, by cascade, its payments and tickets.
    #[must_use]
    async fn delete(&self, id: &str) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Returns `false` when the reference already exists.
    #[must_use]
    async fn insert_if_absent(&self, payment: &PendingPayment) -> Result<bool, RepositoryError>;
    #[must_use]
    async fn get(&self, reference: &str) -> Result<Option<PendingPayment>, RepositoryError>;
    #[must_use]
    async fn list_by_status(
        &self,
        status: PaymentStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PendingPayment>, RepositoryError>;
    #[must_use]
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<PendingPayment>, RepositoryError>;
    /// Apply the payment's plan to its account and mark it approved, as one unit.
    #[must_use]
    async fn approve(
        &self,
        reference: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ApproveOutcome, RepositoryError>;
}

#[async_trait]
pub trait TicketRepository: Send + Sync {
    #[must_use]
    async fn create(&self, ticket: &Ticket) -> Result<(), RepositoryError>;
    #[must_use]
    async fn get_by_id(&self, id: Uuid) -> Result<Ticket, RepositoryError>;
    /// Store a reply on an open ticket. Returns `false` if it was already answered.
    #[must_use]
    async fn record_reply(
        &self,
        id: Uuid,
        reply: &str,
        source: ReplySource,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    #[must_use]
    async fn list_open(&self, limit: i64, offset: i64) -> Result<Vec<Ticket>, RepositoryError>;
    #[must_use]
    async fn list_by_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Ticket>, RepositoryError>;
}

pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn get(&self, id: &str) -> Result<Option<Account>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, plan, plan_start, usage_count, usage_window_start, version, created_at, updated_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    async fn insert_if_absent(
        &self,
        account: &Account,
    ) -> Result<(Account, bool), RepositoryError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, plan, plan_start, usage_count, usage_window_start, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            RETURNING id, plan, plan_start, usage_count, usage_window_start, version, created_at, updated_at
            "#,
        )
        .bind(&account.id)
        .bind(account.plan.as_str())
        .bind(account.plan_start)
        .bind(usage_to_db(account.usage_count)?)
        .bind(account.usage_window_start)
        .bind(account.version)
        .bind(account.created_at)
        .bind(account.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok((row_to_account(&row)?, true)),
            // Lost the race to a concurrent insert; read the winner.
            None => self
                .get(&account.id)
                .await?
                .map(|existing| (existing, false))
                .ok_or_else(|| RepositoryError::NotFound(format!("Account {}", account.id))),
        }
    }

    async fn reset_usage_window(
        &self,
        id: &str,
        expected_window_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Account>, RepositoryError> {
        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET usage_count = 0, usage_window_start = $1, version = version + 1, updated_at = $1
            WHERE id = $2 AND usage_window_start = $3
            RETURNING id, plan, plan_start, usage_count, usage_window_start, version, created_at, updated_at
            "#,
        )
        .bind(window_start)
        .bind(id)
        .bind(expected_window_start)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    async fn try_increment_usage(
        &self,
        id: &str,
        plan_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Option<u32>, RepositoryError> {
        // Limits past the column range behave as unbounded.
        let limit = limit.and_then(|l| i32::try_from(l).ok());

        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET usage_count = usage_count + 1, version = version + 1, updated_at = $1
            WHERE id = $2
              AND plan_start = $3
              AND usage_window_start = $4
              AND ($5::INTEGER IS NULL OR usage_count < $5)
            RETURNING usage_count
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .bind(plan_start)
        .bind(window_start)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<u32, RepositoryError> {
            let used: i32 = r.try_get("usage_count")?;
            u32::try_from(used).map_err(|_| {
                RepositoryError::InvalidData(format!("Negative usage count: {}", used))
            })
        })
        .transpose()
    }

    async fn transition_plan(
        &self,
        id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Account, RepositoryError> {
        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET plan = $1, plan_start = $2, usage_count = 0, usage_window_start = $2,
                version = version + 1, updated_at = $2
            WHERE id = $3
            RETURNING id, plan, plan_start, usage_count, usage_window_start, version, created_at, updated_at
            "#,
        )
        .bind(plan.as_str())
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("Account {}", id)))?;

        row_to_account(&row)
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub(crate) fn usage_to_db(count: u32) -> Result<i32, RepositoryError> {
    i32::try_from(count)
        .map_err(|_| RepositoryError::InvalidData(format!("Usage count out of range: {}", count)))
}

pub(crate) fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, RepositoryError> {
    let plan_str: String = row.try_get("plan")?;
    let usage_count: i32 = row.try_get("usage_count")?;
    let usage_count = u32::try_from(usage_count).map_err(|_| {
        RepositoryError::InvalidData(format!("Negative usage count: {}", usage_count))
    })?;

    Ok(Account {
        id: row.try_get("id")?,
        plan: Plan::parse(&plan_str),
        plan_start: row.try_get("plan_start")?,
        usage_count,
        usage_window_start: row.try_get("usage_window_start")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
