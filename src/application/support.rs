use crate::application::{AdminGrant, Decision, Denial, EntitlementService};
use crate::domain::{Quota, ReplySource, Ticket, Topic};
use crate::infrastructure::{
    notify_best_effort, AccountRepository, CompletionClient, CompletionRequest, Notifier,
    Recipient, RepositoryError, TicketRepository, UploadError, UploadStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SupportError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    /// Answered automatically.
    Replied {
        ticket_id: Uuid,
        reply: String,
        limit: Quota,
        used: u32,
    },
    /// Reply generation failed; the ticket waits for a human answer.
    Queued {
        ticket_id: Uuid,
        limit: Quota,
        used: u32,
    },
    Denied(Denial),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Replied(Ticket),
    NotFound,
    AlreadyAnswered,
}

const ADMIN_PREVIEW_CHARS: usize = 200;

fn preview(message: &str) -> String {
    let mut chars = message.chars();
    let head: String = chars.by_ref().take(ADMIN_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Request façade for the chat product. Every gated action goes through
/// the entitlement engine before anything else happens.
pub struct SupportService<A, T>
where
    A: AccountRepository,
    T: TicketRepository,
{
    entitlement: Arc<EntitlementService<A>>,
    ticket_repo: Arc<T>,
    completion: Arc<dyn CompletionClient>,
    uploads: Arc<dyn UploadStore>,
    notifier: Arc<dyn Notifier>,
}

impl<A, T> SupportService<A, T>
where
    A: AccountRepository,
    T: TicketRepository,
{
    pub fn new(
        entitlement: Arc<EntitlementService<A>>,
        ticket_repo: Arc<T>,
        completion: Arc<dyn CompletionClient>,
        uploads: Arc<dyn UploadStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            entitlement,
            ticket_repo,
            completion,
            uploads,
            notifier,
        }
    }

    pub async fn chat(
        &self,
        user_id: &str,
        topic: Topic,
        message: &str,
        image_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ChatOutcome, SupportError> {
        let (limit, used) = match self.entitlement.check_and_consume(user_id, now).await {
            Decision::Allowed { limit, used } => (limit, used),
            Decision::Denied(denial) => {
                info!(user_id, reason = denial.code(), "Chat request denied");
                return Ok(ChatOutcome::Denied(denial));
            }
        };

        let ticket = Ticket::new(
            user_id.to_string(),
            topic,
            message.to_string(),
            image_ref.clone(),
            now,
        );
        self.ticket_repo.create(&ticket).await?;

        notify_best_effort(
            self.notifier.as_ref(),
            Recipient::Admin,
            &format!(
                "New {} request from user {} (ticket {}): {}",
                topic,
                user_id,
                ticket.id,
                preview(message)
            ),
        )
        .await;

        let request = CompletionRequest {
            topic,
            message: message.to_string(),
            image_ref,
        };

        match self.completion.generate_reply(&request).await {
            Ok(reply) => {
                if !self
                    .ticket_repo
                    .record_reply(ticket.id, &reply, ReplySource::Auto, Utc::now())
                    .await?
                {
                    warn!(ticket_id = %ticket.id, "Ticket answered before automatic reply was stored");
                }
                Ok(ChatOutcome::Replied {
                    ticket_id: ticket.id,
                    reply,
                    limit,
                    used,
                })
            }
            Err(e) => {
                // The unit stays consumed; an agent answers the ticket instead.
                warn!(ticket_id = %ticket.id, error = %e, "Reply generation failed; ticket queued");
                Ok(ChatOutcome::Queued {
                    ticket_id: ticket.id,
                    limit,
                    used,
                })
            }
        }
    }

    /// Store an image for later reference in a chat request.
    pub async fn upload_image(
        &self,
        user_id: &str,
        bytes: &[u8],
        original_name: Option<&str>,
    ) -> Result<String, SupportError> {
        Ok(self.uploads.store(user_id, bytes, original_name).await?)
    }

    /// Urgent one-to-one request; alerts the admin without consuming quota.
    pub async fn emergency(&self, user_id: &str) {
        warn!(user_id, "Emergency request raised");
        notify_best_effort(
            self.notifier.as_ref(),
            Recipient::Admin,
            &format!("EMERGENCY: User {} needs immediate one-to-one assistance!", user_id),
        )
        .await;
    }

    pub async fn reply_to_ticket(
        &self,
        _grant: &AdminGrant,
        ticket_id: Uuid,
        reply: &str,
        now: DateTime<Utc>,
    ) -> Result<ReplyOutcome, SupportError> {
        let ticket = match self.ticket_repo.get_by_id(ticket_id).await {
            Ok(t) => t,
            Err(RepositoryError::NotFound(_)) => return Ok(ReplyOutcome::NotFound),
            Err(e) => return Err(e.into()),
        };

        if !self
            .ticket_repo
            .record_reply(ticket_id, reply, ReplySource::Agent, now)
            .await?
        {
            return Ok(ReplyOutcome::AlreadyAnswered);
        }

        info!(ticket_id = %ticket_id, user_id = %ticket.user_id, "Agent replied to ticket");
        notify_best_effort(
            self.notifier.as_ref(),
            Recipient::User(ticket.user_id.clone()),
            &format!("Reply to your {} request:\n\n{}", ticket.topic, reply),
        )
        .await;

        let answered = self.ticket_repo.get_by_id(ticket_id).await?;
        Ok(ReplyOutcome::Replied(answered))
    }

    pub async fn list_open_tickets(
        &self,
        _grant: &AdminGrant,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Ticket>, SupportError> {
        Ok(self.ticket_repo.list_open(limit, offset).await?)
    }

    pub async fn list_user_tickets(
        &self,
        _grant: &AdminGrant,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Ticket>, SupportError> {
        Ok(self.ticket_repo.list_by_user(user_id, limit, offset).await?)
    }
}
