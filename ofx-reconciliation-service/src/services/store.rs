//! Persistence seam for imports, statement transactions and the audit trail.
//!
//! [`Database`](crate::services::Database) is the Postgres implementation;
//! [`InMemoryStore`] backs local runs without `DATABASE_URL` and the tests.
//! Both implement the same guarded operations: a ledger entry is claimed by
//! at most one statement transaction per tenant, and a status change is
//! applied only while the row still looks the way the caller last saw it.

use crate::models::{
    ClaimOutcome, DedupKey, ImportStatus, OfxImport, ReconciliationAudit, StatementTransaction,
    StatusChange, StatusCounts,
};
use async_trait::async_trait;
use chrono::Utc;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteImportOutcome {
    Deleted,
    NotFound,
    /// At least one transaction is still linked to a ledger entry.
    HasLinkedTransactions,
}

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    /// Live (not failed) import of the same tenant and account with this
    /// fingerprint.
    async fn find_import_by_fingerprint(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<OfxImport>, AppError>;

    async fn existing_dedup_keys(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
    ) -> Result<HashSet<DedupKey>, AppError>;

    /// Writes the import and its transactions in one unit. Fails with
    /// [`AppError::Conflict`] when a live import of the account has the same
    /// fingerprint or one of the lines is already stored.
    async fn insert_import(
        &self,
        import: &OfxImport,
        transactions: &[StatementTransaction],
    ) -> Result<(), AppError>;

    async fn finish_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
        status: ImportStatus,
        transactions_reconciled: i32,
    ) -> Result<Option<OfxImport>, AppError>;

    async fn list_imports(&self, tenant_id: Uuid) -> Result<Vec<OfxImport>, AppError>;

    async fn get_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<Option<OfxImport>, AppError>;

    /// Removes an import and its transactions unless any of them is linked.
    async fn delete_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<DeleteImportOutcome, AppError>;

    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<Vec<StatementTransaction>, AppError>;

    /// Transactions in `pending_review` or `not_identified`, optionally
    /// restricted to one import.
    async fn list_open_transactions(
        &self,
        tenant_id: Uuid,
        import_id: Option<Uuid>,
    ) -> Result<Vec<StatementTransaction>, AppError>;

    async fn get_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<StatementTransaction>, AppError>;

    async fn find_by_ledger_transaction(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<Option<StatementTransaction>, AppError>;

    /// Reserves `ledger_transaction_id` for an unlinked statement transaction.
    async fn claim_ledger_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<ClaimOutcome, AppError>;

    /// Drops a claim that never reached a reconciled status.
    async fn release_claim(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<bool, AppError>;

    /// Applies a guarded status change and appends its audit entry.
    /// Returns `false` when the guard no longer holds.
    async fn transition(&self, tenant_id: Uuid, change: &StatusChange) -> Result<bool, AppError>;

    async fn list_audit(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<ReconciliationAudit>, AppError>;

    async fn status_counts(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<StatusCounts, AppError>;
}

/// Guard shared by both stores; see [`StatusChange`].
pub(crate) fn change_applies(tx: &StatementTransaction, change: &StatusChange) -> bool {
    if tx.reconciliation_status != change.from {
        return false;
    }
    match (change.clear_link, change.ledger_transaction_id) {
        (true, Some(id)) | (false, Some(id)) => tx.matched_transaction_id == Some(id),
        (true, None) => false,
        (false, None) => tx.matched_transaction_id.is_none(),
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    imports: HashMap<Uuid, OfxImport>,
    transactions: HashMap<Uuid, StatementTransaction>,
    audits: Vec<ReconciliationAudit>,
}

impl MemoryState {
    fn transactions_where<F>(&self, filter: F) -> Vec<StatementTransaction>
    where
        F: Fn(&StatementTransaction) -> bool,
    {
        let mut found: Vec<StatementTransaction> = self
            .transactions
            .values()
            .filter(|tx| filter(tx))
            .cloned()
            .collect();
        found.sort_by_key(|tx| (tx.transaction_date, tx.transaction_id));
        found
    }

    fn tenant_transaction_mut(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Option<&mut StatementTransaction> {
        self.transactions
            .get_mut(&transaction_id)
            .filter(|tx| tx.tenant_id == tenant_id)
    }
}

/// Single-lock store: every guarded operation runs under the write lock.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReconciliationStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn find_import_by_fingerprint(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<OfxImport>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .imports
            .values()
            .find(|i| {
                i.tenant_id == tenant_id
                    && i.account_id == account_id
                    && i.status != ImportStatus::Failed
                    && i.fingerprint == fingerprint
            })
            .cloned())
    }

    async fn existing_dedup_keys(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
    ) -> Result<HashSet<DedupKey>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .filter(|tx| tx.tenant_id == tenant_id && tx.account_id == account_id)
            .filter_map(|tx| tx.dedup_key())
            .collect())
    }

    async fn insert_import(
        &self,
        import: &OfxImport,
        transactions: &[StatementTransaction],
    ) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        if state.imports.contains_key(&import.import_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Import {} already exists",
                import.import_id
            )));
        }
        if import.status != ImportStatus::Failed
            && state.imports.values().any(|i| {
                i.tenant_id == import.tenant_id
                    && i.account_id == import.account_id
                    && i.status != ImportStatus::Failed
                    && i.fingerprint == import.fingerprint
            })
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Statement file already imported"
            )));
        }
        let stored: HashSet<DedupKey> = state
            .transactions
            .values()
            .filter(|tx| tx.tenant_id == import.tenant_id && tx.account_id == import.account_id)
            .filter_map(|tx| tx.dedup_key())
            .collect();
        if transactions
            .iter()
            .filter_map(|tx| tx.dedup_key())
            .any(|key| stored.contains(&key))
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Statement transaction already imported"
            )));
        }
        state.imports.insert(import.import_id, import.clone());
        for tx in transactions {
            state.transactions.insert(tx.transaction_id, tx.clone());
        }
        Ok(())
    }

    async fn finish_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
        status: ImportStatus,
        transactions_reconciled: i32,
    ) -> Result<Option<OfxImport>, AppError> {
        let mut state = self.state.write().await;
        Ok(state
            .imports
            .get_mut(&import_id)
            .filter(|i| i.tenant_id == tenant_id)
            .map(|import| {
                import.status = status;
                import.transactions_reconciled = transactions_reconciled;
                import.clone()
            }))
    }

    async fn list_imports(&self, tenant_id: Uuid) -> Result<Vec<OfxImport>, AppError> {
        let state = self.state.read().await;
        let mut imports: Vec<OfxImport> = state
            .imports
            .values()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        imports.sort_by(|a, b| b.imported_utc.cmp(&a.imported_utc));
        Ok(imports)
    }

    async fn get_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<Option<OfxImport>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .imports
            .get(&import_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn delete_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<DeleteImportOutcome, AppError> {
        let mut state = self.state.write().await;
        let owned = state
            .imports
            .get(&import_id)
            .is_some_and(|i| i.tenant_id == tenant_id);
        if !owned {
            return Ok(DeleteImportOutcome::NotFound);
        }
        let linked = state
            .transactions
            .values()
            .any(|tx| tx.import_id == import_id && tx.is_linked());
        if linked {
            return Ok(DeleteImportOutcome::HasLinkedTransactions);
        }

        let removed: HashSet<Uuid> = state
            .transactions
            .values()
            .filter(|tx| tx.import_id == import_id)
            .map(|tx| tx.transaction_id)
            .collect();
        state.transactions.retain(|id, _| !removed.contains(id));
        state
            .audits
            .retain(|a| !removed.contains(&a.statement_transaction_id));
        state.imports.remove(&import_id);
        Ok(DeleteImportOutcome::Deleted)
    }

    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<Vec<StatementTransaction>, AppError> {
        let state = self.state.read().await;
        Ok(state.transactions_where(|tx| tx.tenant_id == tenant_id && tx.import_id == import_id))
    }

    async fn list_open_transactions(
        &self,
        tenant_id: Uuid,
        import_id: Option<Uuid>,
    ) -> Result<Vec<StatementTransaction>, AppError> {
        let state = self.state.read().await;
        Ok(state.transactions_where(|tx| {
            tx.tenant_id == tenant_id
                && tx.reconciliation_status.is_open()
                && import_id.map_or(true, |id| tx.import_id == id)
        }))
    }

    async fn get_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<StatementTransaction>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .get(&transaction_id)
            .filter(|tx| tx.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_by_ledger_transaction(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<Option<StatementTransaction>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .find(|tx| {
                tx.tenant_id == tenant_id
                    && tx.matched_transaction_id == Some(ledger_transaction_id)
            })
            .cloned())
    }

    async fn claim_ledger_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<ClaimOutcome, AppError> {
        let mut state = self.state.write().await;
        let taken = state.transactions.values().any(|tx| {
            tx.tenant_id == tenant_id && tx.matched_transaction_id == Some(ledger_transaction_id)
        });

        let Some(tx) = state.tenant_transaction_mut(tenant_id, transaction_id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        if tx.is_linked() {
            return Ok(ClaimOutcome::StatementAlreadyLinked);
        }
        if taken {
            return Ok(ClaimOutcome::LedgerAlreadyClaimed);
        }
        tx.matched_transaction_id = Some(ledger_transaction_id);
        tx.updated_utc = Utc::now();
        Ok(ClaimOutcome::Claimed)
    }

    async fn release_claim(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        match state.tenant_transaction_mut(tenant_id, transaction_id) {
            Some(tx)
                if tx.matched_transaction_id == Some(ledger_transaction_id)
                    && !tx.reconciliation_status.is_reconciled() =>
            {
                tx.matched_transaction_id = None;
                tx.updated_utc = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition(&self, tenant_id: Uuid, change: &StatusChange) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        let Some(tx) = state.tenant_transaction_mut(tenant_id, change.transaction_id) else {
            return Ok(false);
        };
        if !change_applies(tx, change) {
            return Ok(false);
        }

        tx.reconciliation_status = change.to;
        if change.clear_link {
            tx.matched_transaction_id = None;
        }
        tx.updated_utc = Utc::now();
        state.audits.push(change.audit(tenant_id));
        Ok(true)
    }

    async fn list_audit(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<ReconciliationAudit>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .audits
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.statement_transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn status_counts(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<StatusCounts, AppError> {
        let state = self.state.read().await;
        let mut counts = StatusCounts::default();
        for tx in state
            .transactions
            .values()
            .filter(|tx| tx.tenant_id == tenant_id && tx.import_id == import_id)
        {
            counts.add(tx.reconciliation_status, 1);
        }
        Ok(counts)
    }
}
