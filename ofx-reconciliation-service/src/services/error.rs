use crate::models::ReconciliationStatus;
use crate::ofx::OfxError;
use crate::services::ledger::LedgerError;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Invalid OFX file: {0}")]
    Parse(#[from] OfxError),

    #[error("Import {import_id} failed: {reason}")]
    ImportFailed { import_id: Uuid, reason: String },

    #[error("Statement already imported ({duplicates_skipped} transactions already present)")]
    DuplicateImport {
        existing_import_id: Option<Uuid>,
        duplicates_skipped: usize,
    },

    #[error("Statement transaction {0} is already reconciled")]
    AlreadyReconciled(Uuid),

    #[error("Ledger transaction {0} is not linked to any statement transaction")]
    NotLinked(Uuid),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Ledger transaction {0} is already linked to another statement transaction")]
    LedgerEntryAlreadyLinked(Uuid),

    #[error("Cannot move statement transaction from {from} to {to}")]
    InvalidTransition {
        from: ReconciliationStatus,
        to: ReconciliationStatus,
    },

    #[error("Ledger call failed: {0}")]
    LedgerLinkFailure(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl ReconciliationError {
    pub fn statement_not_found(id: Uuid) -> Self {
        Self::NotFound(format!("Statement transaction {}", id))
    }

    /// Label used for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::ImportFailed { .. } => "import_failed",
            Self::DuplicateImport { .. } => "duplicate_import",
            Self::AlreadyReconciled(_) => "already_reconciled",
            Self::NotLinked(_) => "not_linked",
            Self::NotFound(_) => "not_found",
            Self::LedgerEntryAlreadyLinked(_) => "ledger_entry_already_linked",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::LedgerLinkFailure(_) => "ledger_link_failure",
            Self::Store(_) => "store",
        }
    }
}

impl From<ReconciliationError> for AppError {
    fn from(err: ReconciliationError) -> Self {
        let message = err.to_string();
        match err {
            ReconciliationError::Parse(_) | ReconciliationError::ImportFailed { .. } => {
                AppError::UnprocessableEntity(anyhow::anyhow!(message))
            }
            ReconciliationError::DuplicateImport { .. }
            | ReconciliationError::AlreadyReconciled(_)
            | ReconciliationError::LedgerEntryAlreadyLinked(_)
            | ReconciliationError::InvalidTransition { .. } => {
                AppError::Conflict(anyhow::anyhow!(message))
            }
            ReconciliationError::NotLinked(_) | ReconciliationError::NotFound(_) => {
                AppError::NotFound(anyhow::anyhow!(message))
            }
            ReconciliationError::LedgerLinkFailure(LedgerError::NotFound(_)) => {
                AppError::NotFound(anyhow::anyhow!(message))
            }
            ReconciliationError::LedgerLinkFailure(LedgerError::AlreadyReconciled(_)) => {
                AppError::Conflict(anyhow::anyhow!(message))
            }
            ReconciliationError::LedgerLinkFailure(_) => {
                AppError::BadGateway(anyhow::anyhow!(message))
            }
            ReconciliationError::Store(e) => e,
        }
    }
}
