//! Integration tests for support-desk
//! Entitlement decisions, payment reconciliation and the support façade,
//! driven against in-memory repositories.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mockall::mock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use support_desk::{
    application::{
        AccountService, AdminGrant, ChatOutcome, Decision, Denial, EntitlementService,
        PaymentService, PlanPolicy, ReplyOutcome, SubmitOutcome, SupportService, TierPolicy,
    },
    domain::{
        Account, ApproveOutcome, PaymentStatus, PendingPayment, Plan, Quota, ReplySource, Ticket,
        TicketStatus, Topic,
    },
    infrastructure::{
        AccountRepository, CompletionClient, CompletionError, CompletionRequest, LocalUploadStore,
        Notifier, NotifyError, PaymentRepository, Recipient, RepositoryError, TicketRepository,
        UploadStore,
    },
};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

// ============================================================================
// Mock Repositories for Testing
// ============================================================================

/// In-memory mock implementation of AccountRepository.
/// Conditional writes check and apply under one lock, like the conditional UPDATE.
/// Payment and ticket rows live here too so deleting an account cascades.
#[derive(Clone, Default)]
struct MockAccountRepository {
    accounts: Arc<Mutex<HashMap<String, Account>>>,
    payments: Arc<Mutex<HashMap<String, PendingPayment>>>,
    tickets: Arc<Mutex<HashMap<Uuid, Ticket>>>,
}

impl MockAccountRepository {
    fn seed(&self, account: Account) {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.id.clone(), account);
    }

    fn snapshot(&self, id: &str) -> Option<Account> {
        self.accounts.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl AccountRepository for MockAccountRepository {
    async fn get(&self, id: &str) -> Result<Option<Account>, RepositoryError> {
        Ok(self.accounts.lock().unwrap().get(id).cloned())
    }

    async fn insert_if_absent(&self, account: &Account) -> Result<(Account, bool), RepositoryError> {
        let mut accounts = self.accounts.lock().unwrap();
        if let Some(existing) = accounts.get(&account.id) {
            return Ok((existing.clone(), false));
        }
        accounts.insert(account.id.clone(), account.clone());
        Ok((account.clone(), true))
    }

    async fn reset_usage_window(
        &self,
        id: &str,
        expected_window_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Account>, RepositoryError> {
        let mut accounts = self.accounts.lock().unwrap();
        match accounts.get_mut(id) {
            Some(a) if a.usage_window_start == expected_window_start => {
                a.usage_count = 0;
                a.usage_window_start = window_start;
                a.version += 1;
                Ok(Some(a.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn try_increment_usage(
        &self,
        id: &str,
        plan_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Option<u32>, RepositoryError> {
        let mut accounts = self.accounts.lock().unwrap();
        match accounts.get_mut(id) {
            Some(a)
                if a.plan_start == plan_start
                    && a.usage_window_start == window_start
                    && limit.map_or(true, |max| a.usage_count < max) =>
            {
                a.usage_count += 1;
                a.version += 1;
                Ok(Some(a.usage_count))
            }
            _ => Ok(None),
        }
    }

    async fn transition_plan(
        &self,
        id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Account, RepositoryError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Account {}", id)))?;
        apply_plan(account, plan, now);
        Ok(account.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let removed = self.accounts.lock().unwrap().remove(id).is_some();
        self.payments.lock().unwrap().retain(|_, p| p.user_id != id);
        self.tickets.lock().unwrap().retain(|_, t| t.user_id != id);
        Ok(removed)
    }
}

fn apply_plan(account: &mut Account, plan: &Plan, now: DateTime<Utc>) {
    account.plan = plan.clone();
    account.plan_start = now;
    account.usage_count = 0;
    account.usage_window_start = now;
    account.version += 1;
    account.updated_at = now;
}

/// In-memory mock implementation of PaymentRepository.
/// Shares the account map so approval updates both sides under one critical section.
#[derive(Clone)]
struct MockPaymentRepository {
    payments: Arc<Mutex<HashMap<String, PendingPayment>>>,
    accounts: MockAccountRepository,
}

impl MockPaymentRepository {
    fn new(accounts: MockAccountRepository) -> Self {
        Self {
            payments: accounts.payments.clone(),
            accounts,
        }
    }
}

#[async_trait]
impl PaymentRepository for MockPaymentRepository {
    async fn insert_if_absent(&self, payment: &PendingPayment) -> Result<bool, RepositoryError> {
        if self.accounts.snapshot(&payment.user_id).is_none() {
            return Err(RepositoryError::NotFound(format!("Account {}", payment.user_id)));
        }
        let mut payments = self.payments.lock().unwrap();
        if payments.contains_key(&payment.reference) {
            return Ok(false);
        }
        payments.insert(payment.reference.clone(), payment.clone());
        Ok(true)
    }

    async fn get(&self, reference: &str) -> Result<Option<PendingPayment>, RepositoryError> {
        Ok(self.payments.lock().unwrap().get(reference).cloned())
    }

    async fn list_by_status(
        &self,
        status: PaymentStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PendingPayment>, RepositoryError> {
        let payments = self.payments.lock().unwrap();
        let mut matching: Vec<PendingPayment> = payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.submitted_at);
        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<PendingPayment>, RepositoryError> {
        let payments = self.payments.lock().unwrap();
        Ok(payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn approve(
        &self,
        reference: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ApproveOutcome, RepositoryError> {
        let mut payments = self.payments.lock().unwrap();
        let payment = match payments.get_mut(reference) {
            Some(p) => p,
            None => return Ok(ApproveOutcome::NotFound),
        };
        if payment.status == PaymentStatus::Approved {
            return Ok(ApproveOutcome::AlreadyApproved(payment.clone()));
        }

        let mut accounts = self.accounts.accounts.lock().unwrap();
        let account = accounts
            .get_mut(&payment.user_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Account {}", payment.user_id)))?;
        apply_plan(account, &payment.requested_plan, now);

        payment.status = PaymentStatus::Approved;
        payment.verified_at = Some(now);
        if let Some(notes) = notes {
            payment.notes = Some(notes.to_string());
        }

        Ok(ApproveOutcome::Approved {
            payment: payment.clone(),
            account: account.clone(),
        })
    }
}

/// In-memory mock implementation of TicketRepository
#[derive(Clone, Default)]
struct MockTicketRepository {
    tickets: Arc<Mutex<HashMap<Uuid, Ticket>>>,
}

impl MockTicketRepository {
    fn sharing(accounts: &MockAccountRepository) -> Self {
        Self {
            tickets: accounts.tickets.clone(),
        }
    }
}

#[async_trait]
impl TicketRepository for MockTicketRepository {
    async fn create(&self, ticket: &Ticket) -> Result<(), RepositoryError> {
        self.tickets.lock().unwrap().insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Ticket, RepositoryError> {
        self.tickets
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("Ticket {}", id)))
    }

    async fn record_reply(
        &self,
        id: Uuid,
        reply: &str,
        source: ReplySource,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tickets = self.tickets.lock().unwrap();
        match tickets.get_mut(&id) {
            Some(t) if t.status == TicketStatus::Open => {
                t.reply = Some(reply.to_string());
                t.reply_source = Some(source);
                t.status = TicketStatus::Answered;
                t.answered_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_open(&self, limit: i64, offset: i64) -> Result<Vec<Ticket>, RepositoryError> {
        let tickets = self.tickets.lock().unwrap();
        let mut open: Vec<Ticket> = tickets
            .values()
            .filter(|t| t.status == TicketStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|t| t.created_at);
        Ok(open
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Ticket>, RepositoryError> {
        let tickets = self.tickets.lock().unwrap();
        let mut mine: Vec<Ticket> = tickets
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        Ok(mine
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

/// Account store whose backend is unreachable.
struct FailingAccountRepository;

#[async_trait]
impl AccountRepository for FailingAccountRepository {
    async fn get(&self, _id: &str) -> Result<Option<Account>, RepositoryError> {
        Err(RepositoryError::DatabaseError(sqlx::Error::PoolTimedOut))
    }

    async fn insert_if_absent(&self, _account: &Account) -> Result<(Account, bool), RepositoryError> {
        Err(RepositoryError::DatabaseError(sqlx::Error::PoolTimedOut))
    }

    async fn reset_usage_window(
        &self,
        _id: &str,
        _expected_window_start: DateTime<Utc>,
        _window_start: DateTime<Utc>,
    ) -> Result<Option<Account>, RepositoryError> {
        Err(RepositoryError::DatabaseError(sqlx::Error::PoolTimedOut))
    }

    async fn try_increment_usage(
        &self,
        _id: &str,
        _plan_start: DateTime<Utc>,
        _window_start: DateTime<Utc>,
        _limit: Option<u32>,
    ) -> Result<Option<u32>, RepositoryError> {
        Err(RepositoryError::DatabaseError(sqlx::Error::PoolTimedOut))
    }

    async fn transition_plan(
        &self,
        id: &str,
        _plan: &Plan,
        _now: DateTime<Utc>,
    ) -> Result<Account, RepositoryError> {
        Err(RepositoryError::NotFound(id.to_string()))
    }

    async fn delete(&self, _id: &str) -> Result<bool, RepositoryError> {
        Err(RepositoryError::DatabaseError(sqlx::Error::PoolTimedOut))
    }
}

/// Account store that answers reads only after a long stall.
#[derive(Clone, Default)]
struct StallingAccountRepository {
    inner: MockAccountRepository,
}

#[async_trait]
impl AccountRepository for StallingAccountRepository {
    async fn get(&self, id: &str) -> Result<Option<Account>, RepositoryError> {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        self.inner.get(id).await
    }

    async fn insert_if_absent(&self, account: &Account) -> Result<(Account, bool), RepositoryError> {
        self.inner.insert_if_absent(account).await
    }

    async fn reset_usage_window(
        &self,
        id: &str,
        expected_window_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Account>, RepositoryError> {
        self.inner
            .reset_usage_window(id, expected_window_start, window_start)
            .await
    }

    async fn try_increment_usage(
        &self,
        id: &str,
        plan_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Option<u32>, RepositoryError> {
        self.inner
            .try_increment_usage(id, plan_start, window_start, limit)
            .await
    }

    async fn transition_plan(
        &self,
        id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Account, RepositoryError> {
        self.inner.transition_plan(id, plan, now).await
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        self.inner.delete(id).await
    }
}

/// Account store that gives up the thread at every storage call, the way a
/// database round-trip would, so concurrent callers interleave between the
/// read and the write.
#[derive(Clone, Default)]
struct YieldingAccountRepository {
    inner: MockAccountRepository,
}

#[async_trait]
impl AccountRepository for YieldingAccountRepository {
    async fn get(&self, id: &str) -> Result<Option<Account>, RepositoryError> {
        tokio::task::yield_now().await;
        let account = self.inner.get(id).await;
        tokio::task::yield_now().await;
        account
    }

    async fn insert_if_absent(&self, account: &Account) -> Result<(Account, bool), RepositoryError> {
        tokio::task::yield_now().await;
        self.inner.insert_if_absent(account).await
    }

    async fn reset_usage_window(
        &self,
        id: &str,
        expected_window_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Account>, RepositoryError> {
        tokio::task::yield_now().await;
        self.inner
            .reset_usage_window(id, expected_window_start, window_start)
            .await
    }

    async fn try_increment_usage(
        &self,
        id: &str,
        plan_start: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Option<u32>, RepositoryError> {
        tokio::task::yield_now().await;
        self.inner
            .try_increment_usage(id, plan_start, window_start, limit)
            .await
    }

    async fn transition_plan(
        &self,
        id: &str,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<Account, RepositoryError> {
        self.inner.transition_plan(id, plan, now).await
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        self.inner.delete(id).await
    }
}

// ============================================================================
// Mock Collaborators
// ============================================================================

mock! {
    Completion {}

    #[async_trait]
    impl CompletionClient for Completion {
        async fn generate_reply(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
    }
}

mock! {
    Notifier {}

    #[async_trait]
    impl Notifier for Notifier {
        async fn notify(&self, recipient: &Recipient, message: &str) -> Result<(), NotifyError>;
    }
}

fn quiet_notifier() -> Arc<dyn Notifier> {
    let mut notifier = MockNotifier::new();
    notifier.expect_notify().returning(|_, _| Ok(()));
    Arc::new(notifier)
}

// ============================================================================
// Helper Functions
// ============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn policy(trial_limit: u32) -> Arc<PlanPolicy> {
    Arc::new(
        PlanPolicy::new(24, Quota::Bounded(trial_limit))
            .with_tier(
                "basic",
                TierPolicy {
                    quota: Quota::Bounded(3),
                    duration_days: None,
                },
            )
            .with_tier(
                "premium",
                TierPolicy {
                    quota: Quota::Bounded(10),
                    duration_days: Some(30),
                },
            )
            .with_tier(
                "unlimited",
                TierPolicy {
                    quota: Quota::Unbounded,
                    duration_days: Some(30),
                },
            ),
    )
}

fn engine(repo: &MockAccountRepository, trial_limit: u32) -> EntitlementService<MockAccountRepository> {
    EntitlementService::new(Arc::new(repo.clone()), policy(trial_limit))
}

fn account_on(id: &str, plan: Plan, plan_start: DateTime<Utc>) -> Account {
    let mut account = Account::new_trial(id.to_string(), plan_start);
    account.plan = plan;
    account
}

fn admin() -> AdminGrant {
    AdminGrant::verify(true).expect("admin grant")
}

fn payment_service(
    accounts: &MockAccountRepository,
    payments: &MockPaymentRepository,
    notifier: Arc<dyn Notifier>,
) -> PaymentService<MockAccountRepository, MockPaymentRepository> {
    PaymentService::new(
        Arc::new(accounts.clone()),
        Arc::new(payments.clone()),
        policy(15),
        notifier,
    )
}

fn support_service(
    accounts: &MockAccountRepository,
    tickets: &MockTicketRepository,
    completion: MockCompletion,
    notifier: Arc<dyn Notifier>,
    upload_dir: &std::path::Path,
) -> SupportService<MockAccountRepository, MockTicketRepository> {
    let uploads: Arc<dyn UploadStore> = Arc::new(LocalUploadStore::new(upload_dir, 1024));
    SupportService::new(
        Arc::new(engine(accounts, 2)),
        Arc::new(tickets.clone()),
        Arc::new(completion),
        uploads,
        notifier,
    )
}

// ============================================================================
// Entitlement Engine
// ============================================================================

#[tokio::test]
async fn test_trial_scenario_quota_then_expiry() {
    let repo = MockAccountRepository::default();
    repo.seed(Account::new_trial("trader".to_string(), t0()));
    let engine = engine(&repo, 15);

    let at = t0() + Duration::hours(1);
    for n in 1..=15 {
        assert_eq!(
            engine.check_and_consume("trader", at).await,
            Decision::Allowed {
                limit: Quota::Bounded(15),
                used: n
            }
        );
    }
    assert_eq!(
        engine.check_and_consume("trader", at).await,
        Decision::Denied(Denial::QuotaExceeded { limit: 15 })
    );

    assert_eq!(
        engine
            .check_and_consume("trader", t0() + Duration::hours(25))
            .await,
        Decision::Denied(Denial::TrialExpired)
    );
}

#[tokio::test]
async fn test_trial_expires_regardless_of_usage() {
    let repo = MockAccountRepository::default();
    repo.seed(Account::new_trial("fresh".to_string(), t0()));
    let engine = engine(&repo, 15);

    // Exactly at the boundary the trial is over.
    assert_eq!(
        engine
            .check_and_consume("fresh", t0() + Duration::hours(24))
            .await,
        Decision::Denied(Denial::TrialExpired)
    );
    assert_eq!(repo.snapshot("fresh").unwrap().usage_count, 0);
}

#[tokio::test]
async fn test_first_reference_creates_trial_account() {
    let repo = MockAccountRepository::default();
    let engine = engine(&repo, 15);

    let decision = engine.check_and_consume("newcomer", t0()).await;
    assert!(decision.is_allowed());

    let account = repo.snapshot("newcomer").expect("account created");
    assert_eq!(account.plan, Plan::Trial);
    assert_eq!(account.plan_start, t0());
    assert_eq!(account.usage_count, 1);
}

#[tokio::test]
async fn test_denials_never_mutate_usage() {
    let repo = MockAccountRepository::default();
    repo.seed(Account::new_trial("capped".to_string(), t0()));
    let engine = engine(&repo, 2);

    let at = t0() + Duration::minutes(5);
    for _ in 0..2 {
        assert!(engine.check_and_consume("capped", at).await.is_allowed());
    }
    let before = repo.snapshot("capped").unwrap();

    for _ in 0..5 {
        assert_eq!(
            engine.check_and_consume("capped", at).await,
            Decision::Denied(Denial::QuotaExceeded { limit: 2 })
        );
    }

    let after = repo.snapshot("capped").unwrap();
    assert_eq!(after.usage_count, 2);
    assert_eq!(after.version, before.version);
}

#[tokio::test]
async fn test_window_rollover_resets_before_quota_check() {
    let repo = MockAccountRepository::default();
    let now = t0() + Duration::days(20);
    let mut account = account_on("weekly", Plan::Paid("basic".to_string()), t0());
    account.usage_count = 3;
    account.usage_window_start = now - Duration::days(8);
    repo.seed(account);
    let engine = engine(&repo, 15);

    assert_eq!(
        engine.check_and_consume("weekly", now).await,
        Decision::Allowed {
            limit: Quota::Bounded(3),
            used: 1
        }
    );

    // The window start advanced, so the next call does not reset again.
    assert_eq!(
        engine
            .check_and_consume("weekly", now + Duration::minutes(1))
            .await,
        Decision::Allowed {
            limit: Quota::Bounded(3),
            used: 2
        }
    );
    let stored = repo.snapshot("weekly").unwrap();
    assert_eq!(stored.usage_window_start, now);
    assert_eq!(stored.usage_count, 2);
}

#[tokio::test]
async fn test_window_exactly_seven_days_old_is_not_reset() {
    let repo = MockAccountRepository::default();
    let now = t0() + Duration::days(20);
    let mut account = account_on("edge", Plan::Paid("basic".to_string()), t0());
    account.usage_count = 3;
    account.usage_window_start = now - Duration::days(7);
    repo.seed(account);

    assert_eq!(
        engine(&repo, 15).check_and_consume("edge", now).await,
        Decision::Denied(Denial::QuotaExceeded { limit: 3 })
    );
}

/// Fire `calls` concurrent consumptions for one user and tally the outcomes
/// as (allowed, quota denied). Any other decision fails the test.
async fn burst(
    engine: &Arc<EntitlementService<YieldingAccountRepository>>,
    user_id: &str,
    calls: u32,
    at: DateTime<Utc>,
) -> (u32, u32) {
    let mut handles = Vec::new();
    for _ in 0..calls {
        let engine = engine.clone();
        let user_id = user_id.to_string();
        handles.push(tokio::spawn(async move {
            engine.check_and_consume(&user_id, at).await
        }));
    }

    let (mut allowed, mut quota_denied) = (0, 0);
    for handle in handles {
        match handle.await.expect("task panicked") {
            Decision::Allowed { .. } => allowed += 1,
            Decision::Denied(Denial::QuotaExceeded { .. }) => quota_denied += 1,
            other => panic!("unexpected decision: {:?}", other),
        }
    }
    (allowed, quota_denied)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_consumption_allows_exactly_the_limit() {
    const LIMIT: u32 = 10;
    const EXTRA: u32 = 15;
    const ROUNDS: u32 = 50;

    let repo = YieldingAccountRepository::default();
    let engine = Arc::new(EntitlementService::new(Arc::new(repo.clone()), policy(LIMIT)));
    let at = t0() + Duration::hours(1);

    for round in 0..ROUNDS {
        let user_id = format!("hot-{}", round);
        repo.inner.seed(Account::new_trial(user_id.clone(), t0()));

        let (allowed, quota_denied) = burst(&engine, &user_id, LIMIT + EXTRA, at).await;

        assert_eq!(allowed, LIMIT, "round {}", round);
        assert_eq!(quota_denied, EXTRA, "round {}", round);
        assert_eq!(repo.inner.snapshot(&user_id).unwrap().usage_count, LIMIT);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_consumption_across_window_rollover() {
    let repo = YieldingAccountRepository::default();
    let now = t0() + Duration::days(20);
    let mut account = account_on("rolling", Plan::Paid("basic".to_string()), t0());
    account.usage_count = 3;
    account.usage_window_start = now - Duration::days(9);
    repo.inner.seed(account);
    let engine = Arc::new(EntitlementService::new(Arc::new(repo.clone()), policy(15)));

    let (allowed, quota_denied) = burst(&engine, "rolling", 20, now).await;

    assert_eq!(allowed, 3);
    assert_eq!(quota_denied, 17);
    let stored = repo.inner.snapshot("rolling").unwrap();
    assert_eq!(stored.usage_window_start, now);
    assert_eq!(stored.usage_count, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_contact_creates_one_account() {
    let repo = YieldingAccountRepository::default();
    let engine = Arc::new(EntitlementService::new(Arc::new(repo.clone()), policy(15)));

    let (allowed, _) = burst(&engine, "racer", 8, t0()).await;

    assert_eq!(allowed, 8);
    assert_eq!(repo.inner.accounts.lock().unwrap().len(), 1);
    assert_eq!(repo.inner.snapshot("racer").unwrap().usage_count, 8);
}

#[tokio::test]
async fn test_storage_failure_fails_closed() {
    let engine = EntitlementService::new(Arc::new(FailingAccountRepository), policy(15));

    assert_eq!(
        engine.check_and_consume("anyone", t0()).await,
        Decision::Denied(Denial::StorageError)
    );
}

#[tokio::test]
async fn test_slow_storage_times_out_closed() {
    let repo = StallingAccountRepository::default();
    let engine = EntitlementService::new(Arc::new(repo.clone()), policy(15))
        .with_limits(std::time::Duration::from_millis(50), 3);

    assert_eq!(
        engine.check_and_consume("patient", t0()).await,
        Decision::Denied(Denial::StorageError)
    );
    assert!(repo.inner.snapshot("patient").is_none());
}

#[tokio::test]
async fn test_unrecognized_tier_gets_zero_quota() {
    let repo = MockAccountRepository::default();
    repo.seed(account_on("legacy", Plan::Paid("gold".to_string()), t0()));

    assert_eq!(
        engine(&repo, 15)
            .check_and_consume("legacy", t0() + Duration::hours(1))
            .await,
        Decision::Denied(Denial::QuotaExceeded { limit: 0 })
    );
}

#[tokio::test]
async fn test_paid_plan_expires_after_duration() {
    let repo = MockAccountRepository::default();
    repo.seed(account_on("lapsed", Plan::Paid("premium".to_string()), t0()));
    let engine = engine(&repo, 15);

    assert!(engine
        .check_and_consume("lapsed", t0() + Duration::days(29))
        .await
        .is_allowed());
    assert_eq!(
        engine
            .check_and_consume("lapsed", t0() + Duration::days(31))
            .await,
        Decision::Denied(Denial::PlanExpired)
    );
}

#[tokio::test]
async fn test_unbounded_tier_is_never_quota_limited() {
    let repo = MockAccountRepository::default();
    repo.seed(account_on("whale", Plan::Paid("unlimited".to_string()), t0()));
    let engine = engine(&repo, 15);

    let at = t0() + Duration::hours(2);
    for n in 1..=50 {
        assert_eq!(
            engine.check_and_consume("whale", at).await,
            Decision::Allowed {
                limit: Quota::Unbounded,
                used: n
            }
        );
    }
}

// ============================================================================
// Accounts
// ============================================================================

#[tokio::test]
async fn test_start_trial_never_resets_existing_account() {
    let repo = MockAccountRepository::default();
    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .withf(|r, msg| *r == Recipient::Admin && msg.contains("started a free trial"))
        .times(1)
        .returning(|_, _| Ok(()));
    let accounts = AccountService::new(Arc::new(repo.clone()), policy(15), Arc::new(notifier));

    let status = assert_ok!(accounts.start_trial("u7", t0()).await);
    assert!(status.trial_active);
    assert_eq!(status.requests_week, 0);
    assert_eq!(status.limit, Quota::Bounded(15));

    assert!(engine(&repo, 15)
        .check_and_consume("u7", t0() + Duration::hours(1))
        .await
        .is_allowed());

    let again = assert_ok!(accounts.start_trial("u7", t0() + Duration::hours(2)).await);
    assert_eq!(again.requests_week, 1);
    assert_eq!(again.remaining, Some(14));
    assert_eq!(repo.snapshot("u7").unwrap().plan_start, t0());
}

#[tokio::test]
async fn test_status_reports_expired_trial() {
    let repo = MockAccountRepository::default();
    repo.seed(Account::new_trial("late".to_string(), t0()));
    let accounts = AccountService::new(Arc::new(repo.clone()), policy(15), quiet_notifier());

    let status = assert_ok!(accounts.status("late", t0() + Duration::days(2)).await);
    assert!(status.expired);
    assert!(!status.trial_active);
    assert_eq!(status.remaining, Some(0));
}

#[tokio::test]
async fn test_manual_activation_switches_plan_and_resets_usage() {
    let repo = MockAccountRepository::default();
    let mut account = Account::new_trial("vip".to_string(), t0());
    account.usage_count = 4;
    repo.seed(account);

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .withf(|r, msg| *r == Recipient::User("vip".to_string()) && msg.contains("premium"))
        .times(1)
        .returning(|_, _| Ok(()));
    notifier
        .expect_notify()
        .withf(|r, _| *r == Recipient::Admin)
        .times(1)
        .returning(|_, _| Ok(()));
    let accounts = AccountService::new(Arc::new(repo.clone()), policy(15), Arc::new(notifier));

    let now = t0() + Duration::hours(3);
    let updated = assert_ok!(accounts.activate(&admin(), "vip", "Premium", now).await);
    assert_eq!(updated.plan, Plan::Paid("premium".to_string()));
    assert_eq!(updated.usage_count, 0);
    assert_eq!(updated.plan_start, now);
}

#[tokio::test]
async fn test_manual_activation_rejects_unknown_plan() {
    let repo = MockAccountRepository::default();
    let accounts = AccountService::new(Arc::new(repo.clone()), policy(15), quiet_notifier());

    assert_err!(accounts.activate(&admin(), "vip", "platinum", t0()).await);
    assert_err!(accounts.activate(&admin(), "vip", "trial", t0()).await);
    assert!(repo.snapshot("vip").is_none());
}

#[tokio::test]
async fn test_delete_account_removes_payments_and_tickets() {
    let repo = MockAccountRepository::default();
    repo.seed(Account::new_trial("leaving".to_string(), t0()));
    repo.seed(Account::new_trial("staying".to_string(), t0()));
    let payments = MockPaymentRepository::new(repo.clone());
    let tickets = MockTicketRepository::sharing(&repo);
    let payment_svc = payment_service(&repo, &payments, quiet_notifier());

    let mut completion = MockCompletion::new();
    completion
        .expect_generate_reply()
        .returning(|_| Ok("Answer".to_string()));
    let dir = tempfile::tempdir().unwrap();
    let support = support_service(&repo, &tickets, completion, quiet_notifier(), dir.path());

    for user_id in ["leaving", "staying"] {
        let reference = format!("tx-{}-0001", user_id);
        assert_ok!(
            payment_svc
                .submit_payment(user_id, "premium", &reference, t0() + Duration::hours(1))
                .await
        );
        let at = t0() + Duration::hours(1);
        assert_ok!(
            support
                .chat(user_id, Topic::TradeSetup, "Where is my stop?", None, at)
                .await
        );
    }

    let accounts = AccountService::new(Arc::new(repo.clone()), policy(15), quiet_notifier());
    assert!(assert_ok!(accounts.delete(&admin(), "leaving").await));

    assert!(assert_ok!(payment_svc.list_user_payments(&admin(), "leaving").await).is_empty());
    assert!(assert_ok!(support.list_user_tickets(&admin(), "leaving", 100, 0).await).is_empty());
    assert_eq!(
        assert_ok!(payment_svc.list_user_payments(&admin(), "staying").await).len(),
        1
    );
    assert_eq!(
        assert_ok!(support.list_user_tickets(&admin(), "staying", 100, 0).await).len(),
        1
    );
}

#[tokio::test]
async fn test_delete_account_then_recreate_as_trial() {
    let repo = MockAccountRepository::default();
    repo.seed(account_on("gone", Plan::Paid("basic".to_string()), t0()));
    let accounts = AccountService::new(Arc::new(repo.clone()), policy(15), quiet_notifier());

    assert!(assert_ok!(accounts.delete(&admin(), "gone").await));
    assert!(!assert_ok!(accounts.delete(&admin(), "gone").await));

    let recreated = assert_ok!(accounts.get_or_create("gone", t0() + Duration::days(1)).await);
    assert_eq!(recreated.plan, Plan::Trial);
}

#[test]
fn test_admin_grant_requires_admin() {
    assert!(AdminGrant::verify(false).is_err());
    assert!(AdminGrant::verify(true).is_ok());
}

// ============================================================================
// Payment Reconciliation
// ============================================================================

#[tokio::test]
async fn test_submit_then_approve_scenario() {
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("u1".to_string(), t0()));
    let payments = MockPaymentRepository::new(accounts.clone());

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .withf(|r, msg| *r == Recipient::Admin && msg.contains("tx123"))
        .times(1)
        .returning(|_, _| Ok(()));
    notifier
        .expect_notify()
        .withf(|r, msg| *r == Recipient::User("u1".to_string()) && msg.contains("premium"))
        .times(1)
        .returning(|_, _| Ok(()));
    let service = payment_service(&accounts, &payments, Arc::new(notifier));

    let submitted = assert_ok!(
        service
            .submit_payment("u1", "Premium", "tx123", t0() + Duration::hours(1))
            .await
    );
    assert!(matches!(submitted, SubmitOutcome::Submitted(ref p) if p.status == PaymentStatus::Pending));
    // Submission alone does not touch the account.
    assert_eq!(accounts.snapshot("u1").unwrap().plan, Plan::Trial);

    let approved_at = t0() + Duration::hours(2);
    let outcome = assert_ok!(
        service
            .approve_payment(&admin(), "tx123", Some("verified on chain"), approved_at)
            .await
    );
    match outcome {
        ApproveOutcome::Approved { payment, account } => {
            assert_eq!(payment.status, PaymentStatus::Approved);
            assert_eq!(payment.verified_at, Some(approved_at));
            assert_eq!(payment.notes.as_deref(), Some("verified on chain"));
            assert_eq!(account.plan, Plan::Paid("premium".to_string()));
        }
        other => panic!("expected approval, got {:?}", other),
    }

    let account = accounts.snapshot("u1").unwrap();
    assert_eq!(account.plan, Plan::Paid("premium".to_string()));
    assert_eq!(account.usage_count, 0);
    assert_eq!(account.plan_start, approved_at);
    assert_eq!(account.usage_window_start, approved_at);

    let stored = assert_ok!(payments.get("tx123").await).expect("payment stored");
    assert_eq!(stored.status, PaymentStatus::Approved);
}

#[tokio::test]
async fn test_submit_payment_is_idempotent_by_reference() {
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("payer".to_string(), t0()));
    let payments = MockPaymentRepository::new(accounts.clone());
    let service = payment_service(&accounts, &payments, quiet_notifier());

    let first = assert_ok!(service.submit_payment("payer", "basic", "0xabc123", t0()).await);
    assert!(matches!(first, SubmitOutcome::Submitted(_)));

    let second = assert_ok!(service.submit_payment("payer", "premium", "0xabc123", t0()).await);
    assert_eq!(second, SubmitOutcome::DuplicateReference);

    let mine = assert_ok!(payments.list_by_user("payer").await);
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].requested_plan, Plan::Paid("basic".to_string()));
}

#[tokio::test]
async fn test_submit_payment_rejects_unknown_plan_and_account() {
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("payer".to_string(), t0()));
    let payments = MockPaymentRepository::new(accounts.clone());
    let service = payment_service(&accounts, &payments, quiet_notifier());

    assert_eq!(
        assert_ok!(service.submit_payment("payer", "platinum", "ref-0001", t0()).await),
        SubmitOutcome::UnknownPlan("platinum".to_string())
    );
    assert_eq!(
        assert_ok!(service.submit_payment("ghost", "basic", "ref-0002", t0()).await),
        SubmitOutcome::UnknownAccount
    );
    assert!(assert_ok!(payments.list_by_status(PaymentStatus::Pending, 100, 0).await).is_empty());
}

#[tokio::test]
async fn test_approval_reflects_new_limit_immediately() {
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("upgrader".to_string(), t0()));
    let payments = MockPaymentRepository::new(accounts.clone());
    let service = payment_service(&accounts, &payments, quiet_notifier());
    let engine = engine(&accounts, 2);

    let at = t0() + Duration::hours(1);
    for _ in 0..2 {
        assert!(engine.check_and_consume("upgrader", at).await.is_allowed());
    }
    assert_eq!(
        engine.check_and_consume("upgrader", at).await,
        Decision::Denied(Denial::QuotaExceeded { limit: 2 })
    );

    assert_ok!(service.submit_payment("upgrader", "basic", "tx-upgrade", at).await);
    assert_ok!(service.approve_payment(&admin(), "tx-upgrade", None, at).await);

    assert_eq!(
        engine.check_and_consume("upgrader", at).await,
        Decision::Allowed {
            limit: Quota::Bounded(3),
            used: 1
        }
    );
}

#[tokio::test]
async fn test_approve_is_terminal() {
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("once".to_string(), t0()));
    let payments = MockPaymentRepository::new(accounts.clone());
    let service = payment_service(&accounts, &payments, quiet_notifier());
    let engine = engine(&accounts, 15);

    assert_eq!(
        assert_ok!(service.approve_payment(&admin(), "missing", None, t0()).await),
        ApproveOutcome::NotFound
    );

    assert_ok!(service.submit_payment("once", "basic", "tx-once", t0()).await);
    assert_ok!(service.approve_payment(&admin(), "tx-once", None, t0()).await);
    assert!(engine.check_and_consume("once", t0()).await.is_allowed());

    let repeat = assert_ok!(
        service
            .approve_payment(&admin(), "tx-once", None, t0() + Duration::hours(1))
            .await
    );
    assert!(matches!(repeat, ApproveOutcome::AlreadyApproved(_)));
    // A repeated approval must not hand out a fresh allowance.
    assert_eq!(accounts.snapshot("once").unwrap().usage_count, 1);
}

#[tokio::test]
async fn test_approval_survives_notifier_failure() {
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("offline".to_string(), t0()));
    let payments = MockPaymentRepository::new(accounts.clone());

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .returning(|_, _| Err(NotifyError::RequestFailed("telegram unreachable".to_string())));
    let service = payment_service(&accounts, &payments, Arc::new(notifier));

    assert_ok!(service.submit_payment("offline", "premium", "tx-offline", t0()).await);
    let outcome = assert_ok!(service.approve_payment(&admin(), "tx-offline", None, t0()).await);

    assert!(matches!(outcome, ApproveOutcome::Approved { .. }));
    assert_eq!(
        accounts.snapshot("offline").unwrap().plan,
        Plan::Paid("premium".to_string())
    );
}

#[tokio::test]
async fn test_payment_queue_lists_by_status() {
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("a".to_string(), t0()));
    accounts.seed(Account::new_trial("b".to_string(), t0()));
    let payments = MockPaymentRepository::new(accounts.clone());
    let service = payment_service(&accounts, &payments, quiet_notifier());

    assert_ok!(service.submit_payment("a", "basic", "ref-a", t0()).await);
    assert_ok!(
        service
            .submit_payment("b", "premium", "ref-b", t0() + Duration::minutes(1))
            .await
    );
    assert_ok!(service.approve_payment(&admin(), "ref-a", None, t0()).await);

    let pending = assert_ok!(
        service
            .list_payments(&admin(), PaymentStatus::Pending, 100, 0)
            .await
    );
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].reference, "ref-b");

    let approved = assert_ok!(
        service
            .list_payments(&admin(), PaymentStatus::Approved, 100, 0)
            .await
    );
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].reference, "ref-a");

    assert_eq!(assert_ok!(service.list_user_payments(&admin(), "b").await).len(), 1);
}

// ============================================================================
// Support Façade
// ============================================================================

#[tokio::test]
async fn test_chat_replies_and_records_ticket() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = MockAccountRepository::default();
    let tickets = MockTicketRepository::default();

    let mut completion = MockCompletion::new();
    completion
        .expect_generate_reply()
        .withf(|req| req.topic == Topic::TradeSetup && req.message == "Is my stop too tight?")
        .times(1)
        .returning(|_| Ok("Consider the recent swing low.".to_string()));
    let support = support_service(&accounts, &tickets, completion, quiet_notifier(), dir.path());

    let outcome = assert_ok!(
        support
            .chat("u1", Topic::TradeSetup, "Is my stop too tight?", None, t0())
            .await
    );
    let ticket_id = match outcome {
        ChatOutcome::Replied {
            ticket_id,
            reply,
            limit,
            used,
        } => {
            assert_eq!(reply, "Consider the recent swing low.");
            assert_eq!(limit, Quota::Bounded(2));
            assert_eq!(used, 1);
            ticket_id
        }
        other => panic!("expected reply, got {:?}", other),
    };

    let ticket = assert_ok!(tickets.get_by_id(ticket_id).await);
    assert_eq!(ticket.status, TicketStatus::Answered);
    assert_eq!(ticket.reply_source, Some(ReplySource::Auto));
}

#[tokio::test]
async fn test_chat_queues_ticket_when_completion_fails() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = MockAccountRepository::default();
    let tickets = MockTicketRepository::default();

    let mut completion = MockCompletion::new();
    completion
        .expect_generate_reply()
        .times(1)
        .returning(|_| Err(CompletionError::RateLimited));
    let support = support_service(&accounts, &tickets, completion, quiet_notifier(), dir.path());

    let outcome = assert_ok!(
        support
            .chat("u2", Topic::MarginCall, "Margin call incoming", None, t0())
            .await
    );
    assert!(matches!(outcome, ChatOutcome::Queued { used: 1, .. }));

    // The unit stays consumed.
    assert_eq!(accounts.snapshot("u2").unwrap().usage_count, 1);
    let open = assert_ok!(support.list_open_tickets(&admin(), 100, 0).await);
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].topic, Topic::MarginCall);
}

#[tokio::test]
async fn test_denied_chat_skips_completion_and_ticket() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("expired".to_string(), t0()));
    let tickets = MockTicketRepository::default();

    let mut completion = MockCompletion::new();
    completion.expect_generate_reply().times(0);
    let support = support_service(&accounts, &tickets, completion, quiet_notifier(), dir.path());

    let outcome = assert_ok!(
        support
            .chat(
                "expired",
                Topic::Psychology,
                "Feeling tilted",
                None,
                t0() + Duration::days(3)
            )
            .await
    );
    assert_eq!(outcome, ChatOutcome::Denied(Denial::TrialExpired));
    assert!(tickets.tickets.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_agent_reply_answers_ticket_once() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = MockAccountRepository::default();
    let tickets = MockTicketRepository::default();

    let mut completion = MockCompletion::new();
    completion
        .expect_generate_reply()
        .returning(|_| Err(CompletionError::EmptyReply));

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .withf(|r, _| *r == Recipient::Admin)
        .returning(|_, _| Ok(()));
    notifier
        .expect_notify()
        .withf(|r, msg| *r == Recipient::User("u3".to_string()) && msg.contains("Reduce size"))
        .times(1)
        .returning(|_, _| Ok(()));
    let support = support_service(&accounts, &tickets, completion, Arc::new(notifier), dir.path());

    let ticket_id = match assert_ok!(
        support
            .chat("u3", Topic::AccountHealth, "Down 8% this week", None, t0())
            .await
    ) {
        ChatOutcome::Queued { ticket_id, .. } => ticket_id,
        other => panic!("expected queued ticket, got {:?}", other),
    };

    let answered_at = t0() + Duration::minutes(10);
    match assert_ok!(
        support
            .reply_to_ticket(&admin(), ticket_id, "Reduce size for the rest of the week.", answered_at)
            .await
    ) {
        ReplyOutcome::Replied(ticket) => {
            assert_eq!(ticket.status, TicketStatus::Answered);
            assert_eq!(ticket.reply_source, Some(ReplySource::Agent));
            assert_eq!(ticket.answered_at, Some(answered_at));
        }
        other => panic!("expected reply, got {:?}", other),
    }

    assert_eq!(
        assert_ok!(
            support
                .reply_to_ticket(&admin(), ticket_id, "Second answer", answered_at)
                .await
        ),
        ReplyOutcome::AlreadyAnswered
    );
    assert_eq!(
        assert_ok!(
            support
                .reply_to_ticket(&admin(), Uuid::new_v4(), "Nobody home", answered_at)
                .await
        ),
        ReplyOutcome::NotFound
    );

    let history = assert_ok!(support.list_user_tickets(&admin(), "u3", 100, 0).await);
    assert_eq!(history.len(), 1);
    assert!(assert_ok!(support.list_open_tickets(&admin(), 100, 0).await).is_empty());
}

#[tokio::test]
async fn test_emergency_alerts_admin_without_consuming_quota() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = MockAccountRepository::default();
    accounts.seed(Account::new_trial("panic".to_string(), t0()));
    let tickets = MockTicketRepository::default();

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .withf(|r, msg| *r == Recipient::Admin && msg.contains("EMERGENCY") && msg.contains("panic"))
        .times(1)
        .returning(|_, _| Ok(()));
    let support = support_service(
        &accounts,
        &tickets,
        MockCompletion::new(),
        Arc::new(notifier),
        dir.path(),
    );

    support.emergency("panic").await;
    assert_eq!(accounts.snapshot("panic").unwrap().usage_count, 0);
}

#[tokio::test]
async fn test_upload_returns_reference_for_chat() {
    let dir = tempfile::tempdir().unwrap();
    let accounts = MockAccountRepository::default();
    let tickets = MockTicketRepository::default();

    let mut completion = MockCompletion::new();
    completion
        .expect_generate_reply()
        .withf(|req| req.image_ref.as_deref().map_or(false, |r| r.ends_with(".png")))
        .times(1)
        .returning(|_| Ok("The breakout failed at resistance.".to_string()));
    let support = support_service(&accounts, &tickets, completion, quiet_notifier(), dir.path());

    let image_ref = assert_ok!(support.upload_image("u4", b"fake png bytes", Some("chart.PNG")).await);
    assert!(dir.path().join(&image_ref).exists());

    assert_err!(support.upload_image("u4", b"", Some("empty.png")).await);
    assert_err!(support.upload_image("u4", &[0u8; 2048], Some("huge.png")).await);

    let outcome = assert_ok!(
        support
            .chat("u4", Topic::TradeSetup, "What went wrong here?", Some(image_ref), t0())
            .await
    );
    assert!(matches!(outcome, ChatOutcome::Replied { .. }));
}
