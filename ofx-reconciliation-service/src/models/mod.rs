//! Domain models for ofx-reconciliation-service.

#![allow(clippy::should_implement_trait)]

use crate::ofx::SkippedTransaction;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Actor recorded on audit entries written by the automatic pass.
pub const SYSTEM_ACTOR: &str = "system";

// ============================================================================
// Bank Info
// ============================================================================

/// Statement header as reported by the bank. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankInfo {
    pub bank_code: Option<String>,
    pub bank_name: Option<String>,
    pub account_number: Option<String>,
    pub agency: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
}

// ============================================================================
// Statement Transaction Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Credit,
    Debit,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "credit" => Self::Credit,
            _ => Self::Debit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    PendingReview,
    AutoReconciled,
    NotIdentified,
    ManualReconciled,
    Ignored,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::AutoReconciled => "auto_reconciled",
            Self::NotIdentified => "not_identified",
            Self::ManualReconciled => "manual_reconciled",
            Self::Ignored => "ignored",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending_review" => Self::PendingReview,
            "auto_reconciled" => Self::AutoReconciled,
            "not_identified" => Self::NotIdentified,
            "manual_reconciled" => Self::ManualReconciled,
            "ignored" => Self::Ignored,
            _ => Self::PendingReview,
        }
    }

    /// Statuses the automatic pass is allowed to pick up again.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::PendingReview | Self::NotIdentified)
    }

    pub fn is_reconciled(&self) -> bool {
        matches!(self, Self::AutoReconciled | Self::ManualReconciled)
    }

    pub fn can_transition_to(&self, next: ReconciliationStatus) -> bool {
        use ReconciliationStatus::*;
        matches!(
            (self, next),
            (PendingReview, AutoReconciled)
                | (PendingReview, NotIdentified)
                | (PendingReview, ManualReconciled)
                | (PendingReview, Ignored)
                | (NotIdentified, AutoReconciled)
                | (NotIdentified, ManualReconciled)
                | (NotIdentified, Ignored)
                | (NotIdentified, PendingReview)
                | (AutoReconciled, PendingReview)
                | (ManualReconciled, PendingReview)
                | (Ignored, ManualReconciled)
        )
    }
}

impl std::fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementTransaction {
    pub transaction_id: Uuid,
    pub tenant_id: Uuid,
    pub import_id: Uuid,
    pub account_id: Uuid,
    pub fit_id: Option<String>,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub check_number: Option<String>,
    pub document_number: Option<String>,
    pub reconciliation_status: ReconciliationStatus,
    pub matched_transaction_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl StatementTransaction {
    pub fn is_linked(&self) -> bool {
        self.matched_transaction_id.is_some()
    }

    /// Natural key used to skip lines already imported for the same account.
    /// Lines without a FITID are never considered duplicates.
    pub fn dedup_key(&self) -> Option<DedupKey> {
        self.fit_id.as_ref().map(|fit_id| DedupKey {
            fit_id: fit_id.clone(),
            transaction_date: self.transaction_date,
            amount: self.amount,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub fit_id: String,
    pub transaction_date: NaiveDate,
    pub amount: Decimal,
}

// ============================================================================
// Import Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Processing,
        }
    }
}

/// One OFX file ingested for one tenant and one cash/bank account.
///
/// `total_credits`, `total_debits` and `transactions_reconciled` are a snapshot
/// taken when the import completes; live figures come from [`StatusCounts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfxImport {
    pub import_id: Uuid,
    pub tenant_id: Uuid,
    pub account_id: Uuid,
    pub file_name: String,
    #[serde(flatten)]
    pub bank_info: BankInfo,
    pub fingerprint: String,
    pub status: ImportStatus,
    pub error_message: Option<String>,
    pub total_transactions: i32,
    pub transactions_reconciled: i32,
    pub total_credits: Decimal,
    pub total_debits: Decimal,
    pub imported_utc: DateTime<Utc>,
}

impl OfxImport {
    /// Audit record for a file that could not be parsed.
    pub fn failed(tenant_id: Uuid, account_id: Uuid, file_name: &str, reason: String) -> Self {
        Self {
            import_id: Uuid::new_v4(),
            tenant_id,
            account_id,
            file_name: file_name.to_string(),
            bank_info: BankInfo::default(),
            fingerprint: String::new(),
            status: ImportStatus::Failed,
            error_message: Some(reason),
            total_transactions: 0,
            transactions_reconciled: 0,
            total_credits: Decimal::ZERO,
            total_debits: Decimal::ZERO,
            imported_utc: Utc::now(),
        }
    }
}

/// Live per-status breakdown of an import's transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending_review: i64,
    pub auto_reconciled: i64,
    pub not_identified: i64,
    pub manual_reconciled: i64,
    pub ignored: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ReconciliationStatus, count: i64) {
        match status {
            ReconciliationStatus::PendingReview => self.pending_review += count,
            ReconciliationStatus::AutoReconciled => self.auto_reconciled += count,
            ReconciliationStatus::NotIdentified => self.not_identified += count,
            ReconciliationStatus::ManualReconciled => self.manual_reconciled += count,
            ReconciliationStatus::Ignored => self.ignored += count,
        }
    }

    pub fn reconciled(&self) -> i64 {
        self.auto_reconciled + self.manual_reconciled
    }
}

// ============================================================================
// Ledger Models
// ============================================================================

/// Expense recorded by the external ledger; the candidate side of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerExpenseTransaction {
    pub ledger_transaction_id: Uuid,
    pub tenant_id: Uuid,
    pub check_number: Option<String>,
    pub amount: Decimal,
    pub transaction_date: NaiveDate,
    pub description: String,
    #[serde(default)]
    pub reconciled: bool,
}

/// Ledger candidate plus the signals an operator looks at before linking.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateEntry {
    #[serde(flatten)]
    pub ledger_transaction: LedgerExpenseTransaction,
    pub amount_matches: bool,
    pub days_apart: i64,
}

impl CandidateEntry {
    pub fn score(statement: &StatementTransaction, ledger: LedgerExpenseTransaction) -> Self {
        let amount_matches = ledger.amount.abs() == statement.amount;
        let days_apart = (ledger.transaction_date - statement.transaction_date)
            .num_days()
            .abs();
        Self {
            ledger_transaction: ledger,
            amount_matches,
            days_apart,
        }
    }
}

// ============================================================================
// Audit Models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationAudit {
    pub audit_id: Uuid,
    pub tenant_id: Uuid,
    pub statement_transaction_id: Uuid,
    pub ledger_transaction_id: Option<Uuid>,
    pub previous_status: ReconciliationStatus,
    pub new_status: ReconciliationStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// A guarded status transition, applied together with its audit entry.
///
/// The store applies it only while the transaction is still in `from`:
/// - `ledger_transaction_id = Some(id)`, `clear_link = false`: the link must
///   already be `id` (it was claimed beforehand).
/// - `clear_link = true`: the link must be `ledger_transaction_id` and is
///   removed.
/// - `ledger_transaction_id = None`, `clear_link = false`: the transaction
///   must not be linked.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub transaction_id: Uuid,
    pub from: ReconciliationStatus,
    pub to: ReconciliationStatus,
    pub ledger_transaction_id: Option<Uuid>,
    pub clear_link: bool,
    pub actor: String,
    pub reason: Option<String>,
}

impl StatusChange {
    pub fn audit(&self, tenant_id: Uuid) -> ReconciliationAudit {
        ReconciliationAudit {
            audit_id: Uuid::new_v4(),
            tenant_id,
            statement_transaction_id: self.transaction_id,
            ledger_transaction_id: self.ledger_transaction_id,
            previous_status: self.from,
            new_status: self.to,
            actor: self.actor.clone(),
            reason: self.reason.clone(),
            created_utc: Utc::now(),
        }
    }
}

/// Result of trying to reserve a ledger entry for one statement transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    StatementAlreadyLinked,
    LedgerAlreadyClaimed,
    NotFound,
}

// ============================================================================
// Matching Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousMatch {
    pub statement_transaction_id: Uuid,
    pub check_number: String,
    pub candidate_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFailure {
    pub statement_transaction_id: Uuid,
    pub error: String,
}

/// Outcome of one automatic pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReconcileResult {
    /// Transactions picked up by the pass (open status), credits included.
    pub total: usize,
    pub auto_reconciled: usize,
    pub not_identified: usize,
    pub skipped_credits: usize,
    pub ambiguous: Vec<AmbiguousMatch>,
    pub failed: Vec<MatchFailure>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub import: OfxImport,
    pub total: usize,
    pub auto_reconciled: usize,
    pub not_identified: usize,
    pub ambiguous: Vec<AmbiguousMatch>,
    pub failed: Vec<MatchFailure>,
    pub skipped_lines: Vec<SkippedTransaction>,
    pub duplicates_skipped: usize,
    pub cancelled: bool,
}
