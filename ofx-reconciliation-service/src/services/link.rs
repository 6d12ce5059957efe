//! Linking a statement transaction to a ledger entry, and undoing it.
//!
//! A link spans two systems, so it is written as a small saga: claim the
//! ledger id locally, tell the ledger, then record the status. Any failure
//! after the claim releases it again, leaving the status untouched. When the
//! ledger call ends without a definite answer the ledger flag is cleared too.

use crate::models::{ClaimOutcome, ReconciliationStatus, StatementTransaction, StatusChange};
use crate::services::error::ReconciliationError;
use crate::services::ledger::{LedgerError, LedgerGateway};
use crate::services::store::ReconciliationStore;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct LedgerLinker {
    store: Arc<dyn ReconciliationStore>,
    ledger: LedgerGateway,
}

impl LedgerLinker {
    pub fn new(store: Arc<dyn ReconciliationStore>, ledger: LedgerGateway) -> Self {
        Self { store, ledger }
    }

    /// Links `statement` to `ledger_transaction_id` and moves it to `to`.
    #[instrument(skip(self, statement, reason), fields(transaction_id = %statement.transaction_id, to = %to))]
    pub async fn link(
        &self,
        tenant_id: Uuid,
        statement: &StatementTransaction,
        ledger_transaction_id: Uuid,
        to: ReconciliationStatus,
        actor: &str,
        reason: Option<String>,
    ) -> Result<StatementTransaction, ReconciliationError> {
        let transaction_id = statement.transaction_id;

        match self
            .store
            .claim_ledger_transaction(tenant_id, transaction_id, ledger_transaction_id)
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::StatementAlreadyLinked => {
                return Err(ReconciliationError::AlreadyReconciled(transaction_id))
            }
            ClaimOutcome::LedgerAlreadyClaimed => {
                return Err(ReconciliationError::LedgerEntryAlreadyLinked(
                    ledger_transaction_id,
                ))
            }
            ClaimOutcome::NotFound => {
                return Err(ReconciliationError::statement_not_found(transaction_id))
            }
        }

        if let Err(e) = self
            .ledger
            .mark_reconciled(tenant_id, ledger_transaction_id, transaction_id)
            .await
        {
            if e.is_transient() {
                // The ledger may have applied the write before the reply was lost.
                self.compensate_link(tenant_id, transaction_id, ledger_transaction_id)
                    .await;
            } else {
                self.release(tenant_id, transaction_id, ledger_transaction_id)
                    .await;
            }
            return Err(match e {
                LedgerError::NotFound(id) => {
                    ReconciliationError::NotFound(format!("Ledger transaction {}", id))
                }
                LedgerError::AlreadyReconciled(id) => {
                    ReconciliationError::LedgerEntryAlreadyLinked(id)
                }
                other => ReconciliationError::LedgerLinkFailure(other),
            });
        }

        let change = StatusChange {
            transaction_id,
            from: statement.reconciliation_status,
            to,
            ledger_transaction_id: Some(ledger_transaction_id),
            clear_link: false,
            actor: actor.to_string(),
            reason,
        };
        let applied = match self.store.transition(tenant_id, &change).await {
            Ok(applied) => applied,
            Err(e) => {
                self.compensate_link(tenant_id, transaction_id, ledger_transaction_id)
                    .await;
                return Err(e.into());
            }
        };
        if !applied {
            // The row moved on while the ledger was being called.
            self.compensate_link(tenant_id, transaction_id, ledger_transaction_id)
                .await;
            let current = self.current(tenant_id, transaction_id).await?;
            return Err(ReconciliationError::InvalidTransition {
                from: current.reconciliation_status,
                to,
            });
        }

        tracing::info!(
            ledger_transaction_id = %ledger_transaction_id,
            actor = %actor,
            "Statement transaction linked"
        );
        self.current(tenant_id, transaction_id).await
    }

    /// Clears the link of a reconciled `statement` and returns it to
    /// `pending_review`. The ledger is told first; an entry the ledger no
    /// longer knows is unlinked locally anyway.
    #[instrument(skip(self, statement, reason), fields(transaction_id = %statement.transaction_id))]
    pub async fn unlink(
        &self,
        tenant_id: Uuid,
        statement: &StatementTransaction,
        actor: &str,
        reason: Option<String>,
    ) -> Result<StatementTransaction, ReconciliationError> {
        let transaction_id = statement.transaction_id;
        let ledger_transaction_id = statement
            .matched_transaction_id
            .ok_or(ReconciliationError::InvalidTransition {
                from: statement.reconciliation_status,
                to: ReconciliationStatus::PendingReview,
            })?;

        match self
            .ledger
            .mark_unreconciled(tenant_id, ledger_transaction_id)
            .await
        {
            Ok(()) => {}
            Err(LedgerError::NotFound(id)) => {
                tracing::warn!(ledger_transaction_id = %id, "Ledger entry missing, unlinking locally");
            }
            Err(e) => return Err(ReconciliationError::LedgerLinkFailure(e)),
        }

        let change = StatusChange {
            transaction_id,
            from: statement.reconciliation_status,
            to: ReconciliationStatus::PendingReview,
            ledger_transaction_id: Some(ledger_transaction_id),
            clear_link: true,
            actor: actor.to_string(),
            reason,
        };
        if !self.store.transition(tenant_id, &change).await? {
            if let Err(e) = self
                .ledger
                .mark_reconciled(tenant_id, ledger_transaction_id, transaction_id)
                .await
            {
                tracing::error!(
                    error = %e,
                    ledger_transaction_id = %ledger_transaction_id,
                    "Failed to restore ledger reconciled flag"
                );
            }
            let current = self.current(tenant_id, transaction_id).await?;
            return Err(ReconciliationError::InvalidTransition {
                from: current.reconciliation_status,
                to: ReconciliationStatus::PendingReview,
            });
        }

        tracing::info!(
            ledger_transaction_id = %ledger_transaction_id,
            actor = %actor,
            "Statement transaction unlinked"
        );
        self.current(tenant_id, transaction_id).await
    }

    async fn current(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<StatementTransaction, ReconciliationError> {
        self.store
            .get_transaction(tenant_id, transaction_id)
            .await?
            .ok_or_else(|| ReconciliationError::statement_not_found(transaction_id))
    }

    async fn release(&self, tenant_id: Uuid, transaction_id: Uuid, ledger_transaction_id: Uuid) {
        if let Err(e) = self
            .store
            .release_claim(tenant_id, transaction_id, ledger_transaction_id)
            .await
        {
            tracing::error!(
                error = %e,
                transaction_id = %transaction_id,
                ledger_transaction_id = %ledger_transaction_id,
                "Failed to release ledger claim"
            );
        }
    }

    async fn compensate_link(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        ledger_transaction_id: Uuid,
    ) {
        if let Err(e) = self
            .ledger
            .mark_unreconciled(tenant_id, ledger_transaction_id)
            .await
        {
            tracing::error!(
                error = %e,
                ledger_transaction_id = %ledger_transaction_id,
                "Failed to revert ledger reconciled flag"
            );
        }
        self.release(tenant_id, transaction_id, ledger_transaction_id)
            .await;
    }
}
