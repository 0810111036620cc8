use crate::application::{
    AccountService, EntitlementService, PaymentService, PlanPolicy, SupportService,
};
use crate::infrastructure::{
    AppConfig, CompletionClient, LocalUploadStore, LogNotifier, Notifier, OpenAiClient,
    PostgresAccountRepository, PostgresPaymentRepository, PostgresTicketRepository,
    TelegramNotifier, UploadStore,
};
use anyhow::Context;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub type AccountServiceType = AccountService<PostgresAccountRepository>;
pub type EntitlementServiceType = EntitlementService<PostgresAccountRepository>;
pub type PaymentServiceType = PaymentService<PostgresAccountRepository, PostgresPaymentRepository>;
pub type SupportServiceType = SupportService<PostgresAccountRepository, PostgresTicketRepository>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub admin_token: Arc<str>,
    pub max_upload_bytes: usize,
    pub accounts: Arc<AccountServiceType>,
    pub entitlement: Arc<EntitlementServiceType>,
    pub payments: Arc<PaymentServiceType>,
    pub support: Arc<SupportServiceType>,
}

fn build_notifier(config: &AppConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    if config.telegram_bot_token.is_empty() {
        warn!("DESK_TELEGRAM_BOT_TOKEN not set; notifications are only logged");
        return Ok(Arc::new(LogNotifier));
    }
    let notifier = TelegramNotifier::new(&config.telegram_bot_token, config.admin_chat_id.clone())
        .context("init Telegram notifier")?;
    Ok(Arc::new(notifier))
}

/// Build full state from config + an existing pool.
///
/// Intended for embedding into a larger service that already manages a `PgPool`.
pub async fn build_state_with_pool(
    config: AppConfig,
    pool: PgPool,
    run_migrations: bool,
) -> anyhow::Result<AppState> {
    if run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("run migrations")?;
    }

    if config.admin_token.is_empty() {
        warn!("DESK_ADMIN_TOKEN not set; admin endpoints will reject every request");
    }
    if config.openai_api_key.is_empty() {
        warn!("DESK_OPENAI_API_KEY not set; chat requests will be queued for an agent");
    }

    let policy = Arc::new(PlanPolicy::from_config(&config).context("invalid plan settings")?);
    let notifier = build_notifier(&config)?;
    let completion: Arc<dyn CompletionClient> = Arc::new(
        OpenAiClient::new(
            &config.openai_api_key,
            config.openai_base_url.clone(),
            config.openai_model.clone(),
        )
        .context("init completion client")?,
    );
    let uploads: Arc<dyn UploadStore> = Arc::new(LocalUploadStore::new(
        config.upload_dir.clone(),
        config.max_upload_bytes,
    ));

    let account_repo = Arc::new(PostgresAccountRepository::new(pool.clone()));
    let payment_repo = Arc::new(PostgresPaymentRepository::new(pool.clone()));
    let ticket_repo = Arc::new(PostgresTicketRepository::new(pool.clone()));

    let entitlement = Arc::new(
        EntitlementService::new(account_repo.clone(), policy.clone()).with_limits(
            Duration::from_millis(config.decision_timeout_ms),
            config.max_consume_retries,
        ),
    );

    let accounts = Arc::new(AccountService::new(
        account_repo.clone(),
        policy.clone(),
        notifier.clone(),
    ));

    let payments = Arc::new(PaymentService::new(
        account_repo,
        payment_repo,
        policy,
        notifier.clone(),
    ));

    let support = Arc::new(SupportService::new(
        entitlement.clone(),
        ticket_repo,
        completion,
        uploads,
        notifier,
    ));

    Ok(AppState {
        pool,
        admin_token: Arc::from(config.admin_token.as_str()),
        max_upload_bytes: config.max_upload_bytes,
        accounts,
        entitlement,
        payments,
        support,
    })
}

/// Build state for the standalone server.
///
/// Creates the `PgPool`, runs migrations, and wires repositories/services.
pub async fn build_state_from_env(config: AppConfig) -> anyhow::Result<AppState> {
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("connect database")?;
    build_state_with_pool(config, pool, true).await
}
