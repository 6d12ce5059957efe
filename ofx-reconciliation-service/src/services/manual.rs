//! Operator actions on statement transactions.

use crate::models::{ReconciliationStatus, StatementTransaction, StatusChange};
use crate::services::error::ReconciliationError;
use crate::services::ledger::LedgerGateway;
use crate::services::link::LedgerLinker;
use crate::services::metrics::{record_error, record_reconciliation_operation};
use crate::services::store::ReconciliationStore;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct ManualReconciliation {
    store: Arc<dyn ReconciliationStore>,
    linker: LedgerLinker,
}

impl ManualReconciliation {
    pub fn new(store: Arc<dyn ReconciliationStore>, ledger: LedgerGateway) -> Self {
        let linker = LedgerLinker::new(store.clone(), ledger);
        Self { store, linker }
    }

    /// Links an unlinked statement transaction to a ledger entry chosen by
    /// the operator.
    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, user_id = %user_id))]
    pub async fn manual_reconcile(
        &self,
        tenant_id: Uuid,
        statement_transaction_id: Uuid,
        ledger_transaction_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<StatementTransaction, ReconciliationError> {
        let result = self
            .link_manually(
                tenant_id,
                statement_transaction_id,
                ledger_transaction_id,
                user_id,
                reason,
            )
            .await;
        track("manual_reconcile", result)
    }

    /// Undoes the link held by `ledger_transaction_id`, whichever way it was
    /// made, and returns the statement transaction to `pending_review`.
    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, user_id = %user_id))]
    pub async fn unreconcile(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<StatementTransaction, ReconciliationError> {
        let result = self
            .unlink(tenant_id, ledger_transaction_id, user_id, reason)
            .await;
        track("unreconcile", result)
    }

    /// Marks a line as not needing reconciliation. Ignoring an ignored line
    /// changes nothing.
    #[instrument(skip(self, reason), fields(tenant_id = %tenant_id, user_id = %user_id))]
    pub async fn ignore(
        &self,
        tenant_id: Uuid,
        statement_transaction_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<StatementTransaction, ReconciliationError> {
        let result = self
            .ignore_line(tenant_id, statement_transaction_id, user_id, reason)
            .await;
        track("ignore", result)
    }

    async fn link_manually(
        &self,
        tenant_id: Uuid,
        statement_transaction_id: Uuid,
        ledger_transaction_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<StatementTransaction, ReconciliationError> {
        let statement = self.load(tenant_id, statement_transaction_id).await?;
        if statement.is_linked() || statement.reconciliation_status.is_reconciled() {
            return Err(ReconciliationError::AlreadyReconciled(
                statement_transaction_id,
            ));
        }
        let to = ReconciliationStatus::ManualReconciled;
        if !statement.reconciliation_status.can_transition_to(to) {
            return Err(ReconciliationError::InvalidTransition {
                from: statement.reconciliation_status,
                to,
            });
        }
        self.linker
            .link(tenant_id, &statement, ledger_transaction_id, to, user_id, reason)
            .await
    }

    async fn unlink(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<StatementTransaction, ReconciliationError> {
        let statement = self
            .store
            .find_by_ledger_transaction(tenant_id, ledger_transaction_id)
            .await?
            .filter(|s| s.reconciliation_status.is_reconciled())
            .ok_or(ReconciliationError::NotLinked(ledger_transaction_id))?;
        self.linker
            .unlink(tenant_id, &statement, user_id, reason)
            .await
    }

    async fn ignore_line(
        &self,
        tenant_id: Uuid,
        statement_transaction_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<StatementTransaction, ReconciliationError> {
        let statement = self.load(tenant_id, statement_transaction_id).await?;
        let to = ReconciliationStatus::Ignored;
        if statement.reconciliation_status == to {
            return Ok(statement);
        }
        if !statement.reconciliation_status.can_transition_to(to) {
            return Err(ReconciliationError::InvalidTransition {
                from: statement.reconciliation_status,
                to,
            });
        }

        let change = StatusChange {
            transaction_id: statement_transaction_id,
            from: statement.reconciliation_status,
            to,
            ledger_transaction_id: None,
            clear_link: false,
            actor: user_id.to_string(),
            reason,
        };
        if self.store.transition(tenant_id, &change).await? {
            return self.load(tenant_id, statement_transaction_id).await;
        }

        // Lost a race: fine if the other writer also ignored it.
        let current = self.load(tenant_id, statement_transaction_id).await?;
        if current.reconciliation_status == to {
            Ok(current)
        } else {
            Err(ReconciliationError::InvalidTransition {
                from: current.reconciliation_status,
                to,
            })
        }
    }

    async fn load(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<StatementTransaction, ReconciliationError> {
        self.store
            .get_transaction(tenant_id, transaction_id)
            .await?
            .ok_or_else(|| ReconciliationError::statement_not_found(transaction_id))
    }
}

fn track<T>(
    operation: &str,
    result: Result<T, ReconciliationError>,
) -> Result<T, ReconciliationError> {
    match &result {
        Ok(_) => record_reconciliation_operation(operation, "success"),
        Err(e) => {
            tracing::info!(operation, error = %e, "Reconciliation operation rejected");
            record_reconciliation_operation(operation, "failure");
            record_error(e.kind());
        }
    }
    result
}
