//! Automatic check-number matching.
//!
//! Each open debit is matched against the tenant's unreconciled ledger
//! expenses carrying the same check number. Exactly one candidate is linked;
//! none marks the line `not_identified`; several are reported as ambiguous
//! and left for an operator. Amount and date never decide a match.

use crate::models::{
    AmbiguousMatch, BatchReconcileResult, CandidateEntry, MatchFailure, ReconciliationStatus,
    StatementTransaction, StatusChange, TransactionType, SYSTEM_ACTOR,
};
use crate::services::error::ReconciliationError;
use crate::services::ledger::LedgerGateway;
use crate::services::link::LedgerLinker;
use crate::services::metrics::record_transaction_match;
use crate::services::store::ReconciliationStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug)]
enum MatchOutcome {
    AutoReconciled,
    NotIdentified,
    SkippedCredit,
    Ambiguous(AmbiguousMatch),
    Failed(MatchFailure),
    /// The row changed under us; nothing was written.
    Unchanged,
    Cancelled,
}

impl MatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::AutoReconciled => "auto_reconciled",
            Self::NotIdentified => "not_identified",
            Self::SkippedCredit => "skipped_credit",
            Self::Ambiguous(_) => "ambiguous",
            Self::Failed(_) => "failed",
            Self::Unchanged => "unchanged",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone)]
pub struct MatchingEngine {
    store: Arc<dyn ReconciliationStore>,
    ledger: LedgerGateway,
    linker: LedgerLinker,
    worker_count: usize,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<dyn ReconciliationStore>,
        ledger: LedgerGateway,
        worker_count: usize,
    ) -> Self {
        let linker = LedgerLinker::new(store.clone(), ledger.clone());
        Self {
            store,
            ledger,
            linker,
            worker_count: worker_count.max(1),
        }
    }

    /// Runs the automatic pass over `transactions`. Lines that are not open
    /// are ignored. Per-line failures are collected, never returned as errors.
    #[instrument(skip(self, transactions, cancel), fields(tenant_id = %tenant_id, count = transactions.len()))]
    pub async fn run_batch(
        &self,
        tenant_id: Uuid,
        transactions: Vec<StatementTransaction>,
        cancel: &CancellationToken,
    ) -> BatchReconcileResult {
        let open: Vec<StatementTransaction> = transactions
            .into_iter()
            .filter(|tx| tx.reconciliation_status.is_open())
            .collect();

        let mut result = BatchReconcileResult {
            total: open.len(),
            ..Default::default()
        };

        let outcomes: Vec<MatchOutcome> = stream::iter(open)
            .map(|tx| {
                let engine = self.clone();
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return MatchOutcome::Cancelled;
                    }
                    engine.match_one(tenant_id, tx).await
                }
            })
            .buffer_unordered(self.worker_count)
            .collect()
            .await;

        for outcome in outcomes {
            record_transaction_match(outcome.label());
            match outcome {
                MatchOutcome::AutoReconciled => result.auto_reconciled += 1,
                MatchOutcome::NotIdentified => result.not_identified += 1,
                MatchOutcome::SkippedCredit => result.skipped_credits += 1,
                MatchOutcome::Ambiguous(m) => result.ambiguous.push(m),
                MatchOutcome::Failed(f) => result.failed.push(f),
                MatchOutcome::Unchanged => {}
                MatchOutcome::Cancelled => result.cancelled = true,
            }
        }

        tracing::info!(
            total = result.total,
            auto_reconciled = result.auto_reconciled,
            not_identified = result.not_identified,
            ambiguous = result.ambiguous.len(),
            failed = result.failed.len(),
            cancelled = result.cancelled,
            "Matching pass finished"
        );
        result
    }

    /// Re-runs the automatic pass over every open line of the tenant, or of
    /// one import.
    pub async fn reconcile_pending(
        &self,
        tenant_id: Uuid,
        import_id: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<BatchReconcileResult, ReconciliationError> {
        if let Some(import_id) = import_id {
            if self.store.get_import(tenant_id, import_id).await?.is_none() {
                return Err(ReconciliationError::NotFound(format!("Import {}", import_id)));
            }
        }
        let open = self
            .store
            .list_open_transactions(tenant_id, import_id)
            .await?;
        Ok(self.run_batch(tenant_id, open, cancel).await)
    }

    /// Ledger entries sharing the line's check number, with the amount and
    /// date signals an operator weighs before linking manually.
    pub async fn candidates(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<CandidateEntry>, ReconciliationError> {
        let statement = self
            .store
            .get_transaction(tenant_id, transaction_id)
            .await?
            .ok_or_else(|| ReconciliationError::statement_not_found(transaction_id))?;

        let Some(check_number) = statement.check_number.as_deref() else {
            return Ok(Vec::new());
        };

        let found = self
            .ledger
            .list_unreconciled_by_check_number(tenant_id, check_number)
            .await?;
        Ok(found
            .into_iter()
            .map(|entry| CandidateEntry::score(&statement, entry))
            .collect())
    }

    async fn match_one(&self, tenant_id: Uuid, tx: StatementTransaction) -> MatchOutcome {
        if tx.transaction_type == TransactionType::Credit {
            return MatchOutcome::SkippedCredit;
        }

        let Some(check_number) = tx.check_number.clone() else {
            return self.mark_not_identified(tenant_id, &tx).await;
        };

        let candidates = match self
            .ledger
            .list_unreconciled_by_check_number(tenant_id, &check_number)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => return failure(&tx, e.to_string()),
        };

        match candidates.as_slice() {
            [] => self.mark_not_identified(tenant_id, &tx).await,
            [only] => match self
                .linker
                .link(
                    tenant_id,
                    &tx,
                    only.ledger_transaction_id,
                    ReconciliationStatus::AutoReconciled,
                    SYSTEM_ACTOR,
                    None,
                )
                .await
            {
                Ok(_) => MatchOutcome::AutoReconciled,
                Err(e) => failure(&tx, e.to_string()),
            },
            many => {
                tracing::info!(
                    transaction_id = %tx.transaction_id,
                    check_number = %check_number,
                    candidates = many.len(),
                    "Ambiguous check number, leaving for review"
                );
                if tx.reconciliation_status == ReconciliationStatus::NotIdentified {
                    let change = unlinked_change(
                        &tx,
                        ReconciliationStatus::PendingReview,
                        "multiple ledger candidates",
                    );
                    if let Err(e) = self.store.transition(tenant_id, &change).await {
                        return failure(&tx, e.to_string());
                    }
                }
                MatchOutcome::Ambiguous(AmbiguousMatch {
                    statement_transaction_id: tx.transaction_id,
                    check_number,
                    candidate_count: many.len(),
                })
            }
        }
    }

    async fn mark_not_identified(
        &self,
        tenant_id: Uuid,
        tx: &StatementTransaction,
    ) -> MatchOutcome {
        if tx.reconciliation_status == ReconciliationStatus::NotIdentified {
            return MatchOutcome::NotIdentified;
        }
        let reason = if tx.check_number.is_some() {
            "no ledger entry with this check number"
        } else {
            "no check number"
        };
        let change = unlinked_change(tx, ReconciliationStatus::NotIdentified, reason);
        match self.store.transition(tenant_id, &change).await {
            Ok(true) => MatchOutcome::NotIdentified,
            Ok(false) => MatchOutcome::Unchanged,
            Err(e) => failure(tx, e.to_string()),
        }
    }
}

fn unlinked_change(
    tx: &StatementTransaction,
    to: ReconciliationStatus,
    reason: &str,
) -> StatusChange {
    StatusChange {
        transaction_id: tx.transaction_id,
        from: tx.reconciliation_status,
        to,
        ledger_transaction_id: None,
        clear_link: false,
        actor: SYSTEM_ACTOR.to_string(),
        reason: Some(reason.to_string()),
    }
}

fn failure(tx: &StatementTransaction, error: String) -> MatchOutcome {
    tracing::warn!(transaction_id = %tx.transaction_id, error = %error, "Automatic match failed");
    MatchOutcome::Failed(MatchFailure {
        statement_transaction_id: tx.transaction_id,
        error,
    })
}
