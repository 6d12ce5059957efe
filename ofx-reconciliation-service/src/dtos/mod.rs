use crate::models::{
    CandidateEntry, OfxImport, ReconciliationAudit, StatementTransaction, StatusCounts,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Imports
// ============================================================================

/// OFX upload. Exactly one of `content` (text) or `content_base64` (raw
/// bytes, for files in legacy encodings) must be set.
#[derive(Debug, Deserialize)]
pub struct ImportOfxRequest {
    pub account_id: Uuid,
    pub file_name: String,
    pub content: Option<String>,
    pub content_base64: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportSummary {
    #[serde(flatten)]
    pub import: OfxImport,
    pub status_counts: StatusCounts,
}

#[derive(Debug, Serialize)]
pub struct ImportListResponse {
    pub imports: Vec<ImportSummary>,
}

#[derive(Debug, Serialize)]
pub struct TransactionListResponse {
    pub import_id: Uuid,
    pub transactions: Vec<StatementTransaction>,
}

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct BatchReconcileRequest {
    /// Restricts the pass to one import; every open line of the tenant
    /// otherwise.
    pub import_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ManualReconcileRequest {
    pub ledger_transaction_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuditTrailResponse {
    pub transaction_id: Uuid,
    pub entries: Vec<ReconciliationAudit>,
}

#[derive(Debug, Serialize)]
pub struct CandidateListResponse {
    pub transaction_id: Uuid,
    pub candidates: Vec<CandidateEntry>,
}
