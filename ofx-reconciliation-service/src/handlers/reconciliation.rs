use crate::dtos::{
    AuditTrailResponse, BatchReconcileRequest, CandidateListResponse, ManualReconcileRequest,
    ReasonRequest,
};
use crate::middleware::TenantContext;
use crate::services::ReconciliationError;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

/// Re-runs the automatic check-number pass over open lines.
pub async fn check_batch(
    State(state): State<AppState>,
    ctx: TenantContext,
    body: Option<Json<BatchReconcileRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let cancel = state.shutdown.child_token();

    let result = state
        .engine
        .reconcile_pending(ctx.tenant_id, request.import_id, &cancel)
        .await?;

    Ok(Json(result))
}

pub async fn candidates(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(transaction_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let candidates = state
        .engine
        .candidates(ctx.tenant_id, transaction_id)
        .await?;

    Ok(Json(CandidateListResponse {
        transaction_id,
        candidates,
    }))
}

pub async fn manual_reconcile(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(transaction_id): Path<Uuid>,
    Json(request): Json<ManualReconcileRequest>,
) -> Result<impl IntoResponse, AppError> {
    let transaction = state
        .manual
        .manual_reconcile(
            ctx.tenant_id,
            transaction_id,
            request.ledger_transaction_id,
            &ctx.user_id,
            request.reason,
        )
        .await?;

    Ok(Json(transaction))
}

pub async fn ignore(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(transaction_id): Path<Uuid>,
    body: Option<Json<ReasonRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let transaction = state
        .manual
        .ignore(ctx.tenant_id, transaction_id, &ctx.user_id, request.reason)
        .await?;

    Ok(Json(transaction))
}

pub async fn audit_trail(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(transaction_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if state
        .store
        .get_transaction(ctx.tenant_id, transaction_id)
        .await?
        .is_none()
    {
        return Err(ReconciliationError::statement_not_found(transaction_id).into());
    }
    let entries = state.store.list_audit(ctx.tenant_id, transaction_id).await?;

    Ok(Json(AuditTrailResponse {
        transaction_id,
        entries,
    }))
}

pub async fn unreconcile(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(ledger_transaction_id): Path<Uuid>,
    body: Option<Json<ReasonRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let transaction = state
        .manual
        .unreconcile(
            ctx.tenant_id,
            ledger_transaction_id,
            &ctx.user_id,
            request.reason,
        )
        .await?;

    Ok(Json(transaction))
}
