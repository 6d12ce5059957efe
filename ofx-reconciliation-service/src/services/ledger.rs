//! Client side of the ledger contract.
//!
//! The ledger owns expense transactions and their `reconciled` flag. This
//! service only lists unreconciled expenses by check number and flips that
//! flag. [`LedgerGateway`] wraps any [`LedgerService`] with a per-call timeout
//! and a single retry on transient failures.

use crate::models::LedgerExpenseTransaction;
use crate::services::metrics::{record_ledger_call, record_ledger_call_duration};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

/// Attempts per ledger call: the first try plus one retry.
const MAX_ATTEMPTS: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger transaction {0} not found")]
    NotFound(Uuid),

    #[error("Ledger transaction {0} is already reconciled")]
    AlreadyReconciled(Uuid),

    #[error("Ledger service timed out")]
    Timeout,

    #[error("Ledger service unreachable: {0}")]
    Transport(String),

    #[error("Ledger service returned {status}: {message}")]
    Rejected { status: u16, message: String },
}

impl LedgerError {
    /// Failures worth a second attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::NotFound(_) | Self::AlreadyReconciled(_) => false,
        }
    }
}

#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Unreconciled expenses of the tenant carrying exactly this check number.
    async fn list_unreconciled_by_check_number(
        &self,
        tenant_id: Uuid,
        check_number: &str,
    ) -> Result<Vec<LedgerExpenseTransaction>, LedgerError>;

    async fn mark_reconciled(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
        statement_transaction_id: Uuid,
    ) -> Result<(), LedgerError>;

    async fn mark_unreconciled(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<(), LedgerError>;
}

// ============================================================================
// HTTP client
// ============================================================================

pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str) -> Self {
        tracing::info!(endpoint = %base_url, "Ledger HTTP client configured");
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn expenses_url(&self, tenant_id: Uuid) -> String {
        format!("{}/api/v1/tenants/{}/expenses", self.base_url, tenant_id)
    }

    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
        ledger_id: Uuid,
    ) -> Result<(), LedgerError> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %url, "Ledger request failed");
                LedgerError::Transport(e.to_string())
            })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(LedgerError::NotFound(ledger_id)),
            StatusCode::CONFLICT => Err(LedgerError::AlreadyReconciled(ledger_id)),
            status => Err(rejected(status, response).await),
        }
    }
}

async fn rejected(status: StatusCode, response: reqwest::Response) -> LedgerError {
    let message = response.text().await.unwrap_or_default();
    LedgerError::Rejected {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl LedgerService for HttpLedgerClient {
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_unreconciled_by_check_number(
        &self,
        tenant_id: Uuid,
        check_number: &str,
    ) -> Result<Vec<LedgerExpenseTransaction>, LedgerError> {
        let url = format!("{}/unreconciled", self.expenses_url(tenant_id));
        let response = self
            .client
            .get(&url)
            .query(&[("check_number", check_number)])
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %url, "Ledger request failed");
                LedgerError::Transport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejected(status, response).await);
        }

        response
            .json::<Vec<LedgerExpenseTransaction>>()
            .await
            .map_err(|e| LedgerError::Transport(format!("Invalid ledger response: {}", e)))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn mark_reconciled(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
        statement_transaction_id: Uuid,
    ) -> Result<(), LedgerError> {
        let url = format!(
            "{}/{}/reconcile",
            self.expenses_url(tenant_id),
            ledger_transaction_id
        );
        let body = json!({ "statement_transaction_id": statement_transaction_id });
        self.post(&url, body, ledger_transaction_id).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn mark_unreconciled(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<(), LedgerError> {
        let url = format!(
            "{}/{}/unreconcile",
            self.expenses_url(tenant_id),
            ledger_transaction_id
        );
        self.post(&url, json!({}), ledger_transaction_id).await
    }
}

// ============================================================================
// In-memory ledger
// ============================================================================

/// Ledger kept in process memory, used when no ledger URL is configured and
/// by the test suite. `fail_next` makes the next mark calls fail with a
/// transport error.
#[derive(Default)]
pub struct InMemoryLedger {
    expenses: RwLock<HashMap<Uuid, LedgerExpenseTransaction>>,
    pending_failures: AtomicUsize,
    mark_calls: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, expense: LedgerExpenseTransaction) {
        self.expenses
            .write()
            .await
            .insert(expense.ledger_transaction_id, expense);
    }

    pub async fn get(&self, ledger_transaction_id: Uuid) -> Option<LedgerExpenseTransaction> {
        self.expenses
            .read()
            .await
            .get(&ledger_transaction_id)
            .cloned()
    }

    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of mark calls received, failed ones included.
    pub fn mark_calls(&self) -> usize {
        self.mark_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<(), LedgerError> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        let took = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(LedgerError::Transport("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerService for InMemoryLedger {
    async fn list_unreconciled_by_check_number(
        &self,
        tenant_id: Uuid,
        check_number: &str,
    ) -> Result<Vec<LedgerExpenseTransaction>, LedgerError> {
        let expenses = self.expenses.read().await;
        let mut found: Vec<LedgerExpenseTransaction> = expenses
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && !e.reconciled
                    && e.check_number.as_deref() == Some(check_number)
            })
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.transaction_date, e.ledger_transaction_id));
        Ok(found)
    }

    async fn mark_reconciled(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
        _statement_transaction_id: Uuid,
    ) -> Result<(), LedgerError> {
        self.injected_failure()?;
        let mut expenses = self.expenses.write().await;
        let expense = expenses
            .get_mut(&ledger_transaction_id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or(LedgerError::NotFound(ledger_transaction_id))?;
        if expense.reconciled {
            return Err(LedgerError::AlreadyReconciled(ledger_transaction_id));
        }
        expense.reconciled = true;
        Ok(())
    }

    async fn mark_unreconciled(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<(), LedgerError> {
        self.injected_failure()?;
        let mut expenses = self.expenses.write().await;
        let expense = expenses
            .get_mut(&ledger_transaction_id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or(LedgerError::NotFound(ledger_transaction_id))?;
        expense.reconciled = false;
        Ok(())
    }
}

// ============================================================================
// Gateway
// ============================================================================

#[derive(Clone)]
pub struct LedgerGateway {
    inner: Arc<dyn LedgerService>,
    timeout: Duration,
}

impl LedgerGateway {
    pub fn new(inner: Arc<dyn LedgerService>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub async fn list_unreconciled_by_check_number(
        &self,
        tenant_id: Uuid,
        check_number: &str,
    ) -> Result<Vec<LedgerExpenseTransaction>, LedgerError> {
        self.call("list_unreconciled", || {
            self.inner
                .list_unreconciled_by_check_number(tenant_id, check_number)
        })
        .await
    }

    /// Flags the entry as reconciled. The write is retried like any other
    /// call, so a conflict that follows an unanswered attempt means that
    /// attempt landed and is reported as success. Callers hold the local
    /// claim on `ledger_transaction_id`, so no other line can have won it.
    pub async fn mark_reconciled(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
        statement_transaction_id: Uuid,
    ) -> Result<(), LedgerError> {
        let (result, unanswered) = self
            .attempt("mark_reconciled", || {
                self.inner
                    .mark_reconciled(tenant_id, ledger_transaction_id, statement_transaction_id)
            })
            .await;
        match result {
            Err(LedgerError::AlreadyReconciled(id)) if unanswered => {
                tracing::info!(
                    ledger_transaction_id = %id,
                    "Earlier unanswered attempt was applied by the ledger"
                );
                Ok(())
            }
            other => other,
        }
    }

    pub async fn mark_unreconciled(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<(), LedgerError> {
        self.call("mark_unreconciled", || {
            self.inner.mark_unreconciled(tenant_id, ledger_transaction_id)
        })
        .await
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, request: F) -> Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        self.attempt(operation, request).await.0
    }

    /// Runs `request` with the timeout and retry policy. The flag is set when
    /// an attempt before the last one ended without a definite answer.
    async fn attempt<T, F, Fut>(
        &self,
        operation: &'static str,
        request: F,
    ) -> (Result<T, LedgerError>, bool)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        let mut unanswered = false;
        let result = loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.timeout, request()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(LedgerError::Timeout),
            };
            match outcome {
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(operation, attempt, error = %e, "Ledger call failed, retrying");
                    record_ledger_call(operation, "retry");
                    unanswered = true;
                }
                other => break other,
            }
        };

        record_ledger_call_duration(operation, started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => record_ledger_call(operation, "success"),
            Err(e) => {
                tracing::warn!(operation, attempts = attempt, error = %e, "Ledger call failed");
                record_ledger_call(operation, "failure");
            }
        }
        (result, unanswered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn expense(tenant_id: Uuid, check: &str) -> LedgerExpenseTransaction {
        LedgerExpenseTransaction {
            ledger_transaction_id: Uuid::new_v4(),
            tenant_id,
            check_number: Some(check.to_string()),
            amount: Decimal::new(100, 0),
            transaction_date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            description: "Supplier".to_string(),
            reconciled: false,
        }
    }

    /// Never answers within any reasonable timeout.
    struct Stalled;

    #[async_trait]
    impl LedgerService for Stalled {
        async fn list_unreconciled_by_check_number(
            &self,
            _tenant_id: Uuid,
            _check_number: &str,
        ) -> Result<Vec<LedgerExpenseTransaction>, LedgerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn mark_reconciled(&self, _: Uuid, _: Uuid, _: Uuid) -> Result<(), LedgerError> {
            Ok(())
        }

        async fn mark_unreconciled(&self, _: Uuid, _: Uuid) -> Result<(), LedgerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn lists_only_open_expenses_of_the_tenant() {
        let ledger = InMemoryLedger::new();
        let tenant = Uuid::new_v4();
        let open = expense(tenant, "1001");
        let mut closed = expense(tenant, "1001");
        closed.reconciled = true;
        ledger.insert(open.clone()).await;
        ledger.insert(closed).await;
        ledger.insert(expense(Uuid::new_v4(), "1001")).await;
        ledger.insert(expense(tenant, "01001")).await;

        let found = ledger
            .list_unreconciled_by_check_number(tenant, "1001")
            .await
            .unwrap();
        assert_eq!(found, vec![open]);
    }

    #[tokio::test]
    async fn mark_reconciled_is_tenant_scoped_and_exclusive() {
        let ledger = InMemoryLedger::new();
        let tenant = Uuid::new_v4();
        let entry = expense(tenant, "7");
        let id = entry.ledger_transaction_id;
        ledger.insert(entry).await;

        assert_eq!(
            ledger.mark_reconciled(Uuid::new_v4(), id, Uuid::new_v4()).await,
            Err(LedgerError::NotFound(id))
        );
        ledger.mark_reconciled(tenant, id, Uuid::new_v4()).await.unwrap();
        assert_eq!(
            ledger.mark_reconciled(tenant, id, Uuid::new_v4()).await,
            Err(LedgerError::AlreadyReconciled(id))
        );
    }

    #[tokio::test]
    async fn gateway_retries_a_transient_failure_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let tenant = Uuid::new_v4();
        let entry = expense(tenant, "9");
        let id = entry.ledger_transaction_id;
        ledger.insert(entry).await;
        let gateway = LedgerGateway::new(ledger.clone(), Duration::from_secs(1));

        ledger.fail_next(1);
        gateway.mark_reconciled(tenant, id, Uuid::new_v4()).await.unwrap();
        assert_eq!(ledger.mark_calls(), 2);

        ledger.fail_next(2);
        let err = gateway.mark_unreconciled(tenant, id).await.unwrap_err();
        assert!(matches!(err, LedgerError::Transport(_)));
        assert_eq!(ledger.mark_calls(), 4);
    }

    #[tokio::test]
    async fn gateway_does_not_retry_business_errors() {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = LedgerGateway::new(ledger.clone(), Duration::from_secs(1));
        let missing = Uuid::new_v4();

        let err = gateway
            .mark_reconciled(Uuid::new_v4(), missing, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::NotFound(missing));
        assert_eq!(ledger.mark_calls(), 1);
    }

    /// Applies every mark, but the first reply only arrives after `delay`.
    struct LateFirstReply {
        inner: InMemoryLedger,
        delay: Duration,
        replied: AtomicUsize,
    }

    #[async_trait]
    impl LedgerService for LateFirstReply {
        async fn list_unreconciled_by_check_number(
            &self,
            tenant_id: Uuid,
            check_number: &str,
        ) -> Result<Vec<LedgerExpenseTransaction>, LedgerError> {
            self.inner
                .list_unreconciled_by_check_number(tenant_id, check_number)
                .await
        }

        async fn mark_reconciled(
            &self,
            tenant_id: Uuid,
            ledger_transaction_id: Uuid,
            statement_transaction_id: Uuid,
        ) -> Result<(), LedgerError> {
            let result = self
                .inner
                .mark_reconciled(tenant_id, ledger_transaction_id, statement_transaction_id)
                .await;
            if self.replied.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(self.delay).await;
            }
            result
        }

        async fn mark_unreconciled(&self, tenant_id: Uuid, id: Uuid) -> Result<(), LedgerError> {
            self.inner.mark_unreconciled(tenant_id, id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_accepts_a_conflict_after_an_unanswered_attempt() {
        let tenant = Uuid::new_v4();
        let entry = expense(tenant, "12");
        let id = entry.ledger_transaction_id;
        let ledger = Arc::new(LateFirstReply {
            inner: InMemoryLedger::new(),
            delay: Duration::from_secs(10),
            replied: AtomicUsize::new(0),
        });
        ledger.inner.insert(entry).await;
        let gateway = LedgerGateway::new(ledger.clone(), Duration::from_millis(500));

        gateway.mark_reconciled(tenant, id, Uuid::new_v4()).await.unwrap();

        assert_eq!(ledger.replied.load(Ordering::SeqCst), 2);
        assert!(ledger.inner.get(id).await.unwrap().reconciled);

        // A conflict on a first, answered attempt is still a conflict.
        let err = gateway
            .mark_reconciled(tenant, id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::AlreadyReconciled(id));
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_times_out_slow_calls() {
        let gateway = LedgerGateway::new(Arc::new(Stalled), Duration::from_millis(200));
        let err = gateway
            .list_unreconciled_by_check_number(Uuid::new_v4(), "1")
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::Timeout);
    }
}
