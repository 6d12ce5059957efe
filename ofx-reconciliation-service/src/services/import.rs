//! OFX import sessions.
//!
//! One upload becomes one [`OfxImport`] plus its statement transactions, all
//! written together, followed by the automatic matching pass over exactly
//! those transactions.

use crate::models::{
    DedupKey, ImportOutcome, ImportStatus, OfxImport, ReconciliationStatus, StatementTransaction,
    TransactionType,
};
use crate::ofx::{decode_ofx_bytes, parse_ofx, ParsedStatement};
use crate::services::error::ReconciliationError;
use crate::services::matching::MatchingEngine;
use crate::services::metrics::{record_error, record_statement_import};
use crate::services::store::ReconciliationStore;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

/// Tries at writing an import whose lines collide with a concurrent upload.
const MAX_INSERT_ATTEMPTS: u32 = 2;

#[derive(Clone)]
pub struct ImportManager {
    store: Arc<dyn ReconciliationStore>,
    engine: MatchingEngine,
}

impl ImportManager {
    pub fn new(store: Arc<dyn ReconciliationStore>, engine: MatchingEngine) -> Self {
        Self { store, engine }
    }

    #[instrument(skip(self, raw, cancel), fields(tenant_id = %tenant_id, account_id = %account_id, file_name = %file_name, bytes = raw.len()))]
    pub async fn start_import(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        file_name: &str,
        raw: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ImportOutcome, ReconciliationError> {
        let content = decode_ofx_bytes(raw);
        let parsed = match parse_ofx(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                let reason = e.to_string();
                return Err(self
                    .record_failure(tenant_id, account_id, file_name, reason)
                    .await);
            }
        };

        let fingerprint = fingerprint(account_id, &parsed);
        if let Some(err) = self
            .already_imported(tenant_id, account_id, &fingerprint, &parsed)
            .await?
        {
            return Err(err);
        }

        // The store rejects a second live import of the file, or a line it
        // already holds, so a concurrent upload that commits first surfaces
        // here as a conflict. Lines are deduplicated again once before giving up.
        let mut attempt = 0;
        let (import, transactions, duplicates_skipped) = loop {
            attempt += 1;
            let (import, transactions, duplicates_skipped) = self
                .prepare(tenant_id, account_id, file_name, &fingerprint, &parsed)
                .await?;
            match self.store.insert_import(&import, &transactions).await {
                Ok(()) => break (import, transactions, duplicates_skipped),
                Err(AppError::Conflict(e)) => {
                    if let Some(err) = self
                        .already_imported(tenant_id, account_id, &fingerprint, &parsed)
                        .await?
                    {
                        return Err(err);
                    }
                    if attempt >= MAX_INSERT_ATTEMPTS {
                        return Err(AppError::Conflict(e).into());
                    }
                    tracing::info!(error = %e, "Lines collided with a concurrent import, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };
        let import_id = import.import_id;
        tracing::info!(
            import_id = %import_id,
            total = transactions.len(),
            skipped_lines = parsed.skipped.len(),
            duplicates_skipped,
            "Import persisted, starting matching pass"
        );

        let total = transactions.len();
        let batch = self.engine.run_batch(tenant_id, transactions, cancel).await;

        let import = self
            .store
            .finish_import(
                tenant_id,
                import_id,
                ImportStatus::Completed,
                batch.auto_reconciled as i32,
            )
            .await?
            .ok_or_else(|| ReconciliationError::NotFound(format!("Import {}", import_id)))?;
        record_statement_import("completed");

        Ok(ImportOutcome {
            import,
            total,
            auto_reconciled: batch.auto_reconciled,
            not_identified: batch.not_identified,
            ambiguous: batch.ambiguous,
            failed: batch.failed,
            skipped_lines: parsed.skipped,
            duplicates_skipped,
            cancelled: batch.cancelled,
        })
    }

    /// Duplicate error when a live import of the same file exists.
    async fn already_imported(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        fingerprint: &str,
        parsed: &ParsedStatement,
    ) -> Result<Option<ReconciliationError>, ReconciliationError> {
        let Some(existing) = self
            .store
            .find_import_by_fingerprint(tenant_id, account_id, fingerprint)
            .await?
        else {
            return Ok(None);
        };
        tracing::info!(existing_import_id = %existing.import_id, "Statement already imported");
        record_statement_import("duplicate");
        Ok(Some(ReconciliationError::DuplicateImport {
            existing_import_id: Some(existing.import_id),
            duplicates_skipped: parsed.transactions.len(),
        }))
    }

    /// Builds the import row and the lines not already stored for the
    /// account, with the number of lines dropped as duplicates.
    async fn prepare(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        file_name: &str,
        fingerprint: &str,
        parsed: &ParsedStatement,
    ) -> Result<(OfxImport, Vec<StatementTransaction>, usize), ReconciliationError> {
        let import_id = Uuid::new_v4();
        let now = Utc::now();
        let mut seen = self.store.existing_dedup_keys(tenant_id, account_id).await?;
        let mut duplicates_skipped = 0usize;
        let mut transactions = Vec::with_capacity(parsed.transactions.len());
        for line in &parsed.transactions {
            if let Some(fit_id) = &line.fit_id {
                let key = DedupKey {
                    fit_id: fit_id.clone(),
                    transaction_date: line.transaction_date,
                    amount: line.amount,
                };
                if !seen.insert(key) {
                    duplicates_skipped += 1;
                    continue;
                }
            }
            transactions.push(StatementTransaction {
                transaction_id: Uuid::new_v4(),
                tenant_id,
                import_id,
                account_id,
                fit_id: line.fit_id.clone(),
                transaction_date: line.transaction_date,
                description: line.description.clone(),
                amount: line.amount,
                transaction_type: line.transaction_type,
                check_number: line.check_number.clone(),
                document_number: line.document_number.clone(),
                reconciliation_status: ReconciliationStatus::PendingReview,
                matched_transaction_id: None,
                created_utc: now,
                updated_utc: now,
            });
        }

        if transactions.is_empty() {
            tracing::info!(duplicates_skipped, "Every transaction was already imported");
            record_statement_import("duplicate");
            return Err(ReconciliationError::DuplicateImport {
                existing_import_id: None,
                duplicates_skipped,
            });
        }

        let import = OfxImport {
            import_id,
            tenant_id,
            account_id,
            file_name: file_name.to_string(),
            bank_info: parsed.bank_info.clone(),
            fingerprint: fingerprint.to_string(),
            status: ImportStatus::Processing,
            error_message: None,
            total_transactions: transactions.len() as i32,
            transactions_reconciled: 0,
            total_credits: sum_of(&transactions, TransactionType::Credit),
            total_debits: sum_of(&transactions, TransactionType::Debit),
            imported_utc: now,
        };
        Ok((import, transactions, duplicates_skipped))
    }

    /// Keeps a `failed` import row for the audit trail and builds the error
    /// returned to the caller.
    async fn record_failure(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        file_name: &str,
        reason: String,
    ) -> ReconciliationError {
        tracing::warn!(reason = %reason, "OFX file rejected");
        record_statement_import("failed");
        record_error("ofx_parse");

        let failed = OfxImport::failed(tenant_id, account_id, file_name, reason.clone());
        if let Err(e) = self.store.insert_import(&failed, &[]).await {
            return ReconciliationError::Store(e);
        }
        ReconciliationError::ImportFailed {
            import_id: failed.import_id,
            reason,
        }
    }
}

/// Identity of a statement file: same account, period, line count and totals.
pub fn fingerprint(account_id: Uuid, parsed: &ParsedStatement) -> String {
    let period = |d: Option<chrono::NaiveDate>| d.map(|d| d.to_string()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(period(parsed.bank_info.period_start).as_bytes());
    hasher.update(b"|");
    hasher.update(period(parsed.bank_info.period_end).as_bytes());
    hasher.update(b"|");
    hasher.update(parsed.transactions.len().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(parsed.total_credits().normalize().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(parsed.total_debits().normalize().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn sum_of(transactions: &[StatementTransaction], kind: TransactionType) -> Decimal {
    transactions
        .iter()
        .filter(|t| t.transaction_type == kind)
        .map(|t| t.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::{InMemoryLedger, LedgerGateway};
    use crate::services::store::InMemoryStore;
    use std::time::Duration;

    const STATEMENT: &str = "<OFX><BANKMSGSRSV1><STMTTRNRS><STMTRS>
<BANKACCTFROM><BANKID>237<ACCTID>100</BANKACCTFROM>
<BANKTRANLIST><DTSTART>20240301<DTEND>20240331
<STMTTRN><TRNTYPE>CHECK<DTPOSTED>20240304<TRNAMT>-80.00<FITID>F1<CHECKNUM>12
<STMTTRN><TRNTYPE>CREDIT<DTPOSTED>20240305<TRNAMT>200.00<FITID>F2
<STMTTRN><TRNTYPE>DEBIT<DTPOSTED>20240306<TRNAMT>-20.00<FITID>F3
</BANKTRANLIST></STMTRS></STMTTRNRS></BANKMSGSRSV1></OFX>";

    fn manager() -> (ImportManager, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = LedgerGateway::new(Arc::new(InMemoryLedger::new()), Duration::from_secs(1));
        let engine = MatchingEngine::new(store.clone(), gateway, 2);
        (ImportManager::new(store.clone(), engine), store)
    }

    #[tokio::test]
    async fn import_totals_match_persisted_lines() {
        let (manager, store) = manager();
        let tenant = Uuid::new_v4();
        let account = Uuid::new_v4();

        let outcome = manager
            .start_import(tenant, account, "mar.ofx", STATEMENT.as_bytes(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.import.status, ImportStatus::Completed);
        assert_eq!(outcome.import.total_transactions, 3);
        assert_eq!(outcome.import.total_credits, Decimal::new(200, 0));
        assert_eq!(outcome.import.total_debits, Decimal::new(100, 0));
        assert_eq!(outcome.import.bank_info.bank_code.as_deref(), Some("237"));

        let lines = store.list_transactions(tenant, outcome.import.import_id).await.unwrap();
        assert_eq!(lines.len(), 3);
        let debits: Decimal = lines
            .iter()
            .filter(|t| t.transaction_type == TransactionType::Debit)
            .map(|t| t.amount)
            .sum();
        assert_eq!(debits, outcome.import.total_debits);
    }

    #[tokio::test]
    async fn same_file_twice_is_a_no_op() {
        let (manager, store) = manager();
        let tenant = Uuid::new_v4();
        let account = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let first = manager
            .start_import(tenant, account, "mar.ofx", STATEMENT.as_bytes(), &cancel)
            .await
            .unwrap();
        let second = manager
            .start_import(tenant, account, "mar-copy.ofx", STATEMENT.as_bytes(), &cancel)
            .await;

        match second {
            Err(ReconciliationError::DuplicateImport {
                existing_import_id,
                duplicates_skipped,
            }) => {
                assert_eq!(existing_import_id, Some(first.import.import_id));
                assert_eq!(duplicates_skipped, 3);
            }
            other => panic!("expected duplicate import, got {:?}", other.map(|o| o.total)),
        }
        assert_eq!(store.list_imports(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_still_being_matched_counts_as_imported() {
        let (manager, store) = manager();
        let tenant = Uuid::new_v4();
        let account = Uuid::new_v4();
        let parsed = parse_ofx(STATEMENT).unwrap();
        let in_flight = OfxImport {
            import_id: Uuid::new_v4(),
            tenant_id: tenant,
            account_id: account,
            file_name: "mar.ofx".to_string(),
            bank_info: parsed.bank_info.clone(),
            fingerprint: fingerprint(account, &parsed),
            status: ImportStatus::Processing,
            error_message: None,
            total_transactions: 0,
            transactions_reconciled: 0,
            total_credits: Decimal::ZERO,
            total_debits: Decimal::ZERO,
            imported_utc: Utc::now(),
        };
        store.insert_import(&in_flight, &[]).await.unwrap();

        let err = manager
            .start_import(tenant, account, "mar.ofx", STATEMENT.as_bytes(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ReconciliationError::DuplicateImport {
                existing_import_id, ..
            } => assert_eq!(existing_import_id, Some(in_flight.import_id)),
            other => panic!("expected duplicate import, got {}", other),
        }
        assert_eq!(store.list_imports(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overlapping_file_only_adds_new_lines() {
        let (manager, _) = manager();
        let tenant = Uuid::new_v4();
        let account = Uuid::new_v4();
        let cancel = CancellationToken::new();
        manager
            .start_import(tenant, account, "mar.ofx", STATEMENT.as_bytes(), &cancel)
            .await
            .unwrap();

        let extended = STATEMENT.replace(
            "</BANKTRANLIST>",
            "<STMTTRN><TRNTYPE>DEBIT<DTPOSTED>20240320<TRNAMT>-5.00<FITID>F4\n</BANKTRANLIST>",
        );
        let outcome = manager
            .start_import(tenant, account, "mar-full.ofx", extended.as_bytes(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.total, 1);
        assert_eq!(outcome.duplicates_skipped, 3);
        assert_eq!(outcome.import.total_debits, Decimal::new(5, 0));
    }

    #[tokio::test]
    async fn unparseable_file_leaves_a_failed_import() {
        let (manager, store) = manager();
        let tenant = Uuid::new_v4();

        let err = manager
            .start_import(tenant, Uuid::new_v4(), "bad.ofx", b"garbage", &CancellationToken::new())
            .await
            .unwrap_err();

        let import_id = match err {
            ReconciliationError::ImportFailed { import_id, .. } => import_id,
            other => panic!("expected ImportFailed, got {}", other),
        };
        let failed = store.get_import(tenant, import_id).await.unwrap().unwrap();
        assert_eq!(failed.status, ImportStatus::Failed);
        assert_eq!(failed.total_transactions, 0);
        assert!(failed.error_message.is_some());
        assert!(store.list_transactions(tenant, import_id).await.unwrap().is_empty());
    }

    #[test]
    fn fingerprint_ignores_decimal_scale() {
        let a = parse_ofx(STATEMENT).unwrap();
        let b = parse_ofx(&STATEMENT.replace("-80.00", "-80")).unwrap();
        let account = Uuid::new_v4();
        assert_eq!(fingerprint(account, &a), fingerprint(account, &b));
        assert_ne!(fingerprint(account, &a), fingerprint(Uuid::new_v4(), &a));
    }
}
