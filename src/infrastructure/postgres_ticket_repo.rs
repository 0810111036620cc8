use async_trait::async_trait;
use crate::domain::{ReplySource, Ticket, TicketStatus, Topic};
use crate::infrastructure::{RepositoryError, TicketRepository};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

pub struct PostgresTicketRepository {
    pool: PgPool,
}

impl PostgresTicketRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketRepository for PostgresTicketRepository {
    async fn create(&self, ticket: &Ticket) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO tickets (id, user_id, topic, message, image_ref, reply, reply_source,
                                 status, created_at, answered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(ticket.id)
        .bind(&ticket.user_id)
        .bind(ticket.topic.to_string())
        .bind(&ticket.message)
        .bind(&ticket.image_ref)
        .bind(&ticket.reply)
        .bind(ticket.reply_source.map(|s| s.to_string()))
        .bind(ticket.status.to_string())
        .bind(ticket.created_at)
        .bind(ticket.answered_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Ticket, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, topic, message, image_ref, reply, reply_source,
                   status, created_at, answered_at
            FROM tickets
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("Ticket {}", id)),
            _ => RepositoryError::DatabaseError(e),
        })?;

        row_to_ticket(&row)
    }

    async fn record_reply(
        &self,
        id: Uuid,
        reply: &str,
        source: ReplySource,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE tickets
            SET reply = $1, reply_source = $2, status = 'answered', answered_at = $3
            WHERE id = $4 AND status = 'open'
            "#,
        )
        .bind(reply)
        .bind(source.to_string())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_open(&self, limit: i64, offset: i64) -> Result<Vec<Ticket>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, topic, message, image_ref, reply, reply_source,
                   status, created_at, answered_at
            FROM tickets
            WHERE status = 'open'
            ORDER BY created_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_ticket).collect()
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Ticket>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, topic, message, image_ref, reply, reply_source,
                   status, created_at, answered_at
            FROM tickets
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_ticket).collect()
    }
}

// Enum columns map through the strum Display/EnumString derives.
fn row_to_ticket(row: &sqlx::postgres::PgRow) -> Result<Ticket, RepositoryError> {
    let topic_str: String = row.try_get("topic")?;
    let status_str: String = row.try_get("status")?;
    let source_str: Option<String> = row.try_get("reply_source")?;

    let reply_source = source_str
        .map(|s| {
            ReplySource::from_str(&s)
                .map_err(|_| RepositoryError::InvalidData(format!("Unknown reply source: {}", s)))
        })
        .transpose()?;

    Ok(Ticket {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        topic: Topic::from_str(&topic_str)
            .map_err(|_| RepositoryError::InvalidData(format!("Unknown topic: {}", topic_str)))?,
        message: row.try_get("message")?,
        image_ref: row.try_get("image_ref")?,
        reply: row.try_get("reply")?,
        reply_source,
        status: TicketStatus::from_str(&status_str).map_err(|_| {
            RepositoryError::InvalidData(format!("Unknown ticket status: {}", status_str))
        })?,
        created_at: row.try_get("created_at")?,
        answered_at: row.try_get("answered_at")?,
    })
}
