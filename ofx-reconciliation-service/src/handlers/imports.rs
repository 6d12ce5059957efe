use crate::dtos::{ImportListResponse, ImportOfxRequest, ImportSummary, TransactionListResponse};
use crate::middleware::TenantContext;
use crate::services::DeleteImportOutcome;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use service_core::error::AppError;
use uuid::Uuid;

/// Raw bytes of the uploaded file. Base64 carries files in legacy encodings
/// untouched; text content is already UTF-8.
fn upload_bytes(request: ImportOfxRequest) -> Result<Vec<u8>, AppError> {
    match (request.content, request.content_base64) {
        (Some(text), None) => Ok(text.into_bytes()),
        (None, Some(encoded)) => STANDARD.decode(encoded.trim()).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("content_base64 is not valid base64: {}", e))
        }),
        (Some(_), Some(_)) => Err(AppError::BadRequest(anyhow::anyhow!(
            "Provide either content or content_base64, not both"
        ))),
        (None, None) => Err(AppError::BadRequest(anyhow::anyhow!(
            "content or content_base64 is required"
        ))),
    }
}

pub async fn import_ofx(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(request): Json<ImportOfxRequest>,
) -> Result<impl IntoResponse, AppError> {
    let file_name = request.file_name.trim().to_string();
    if file_name.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("file_name is required")));
    }
    let account_id = request.account_id;
    let raw = upload_bytes(request)?;

    let cancel = state.shutdown.child_token();
    let outcome = state
        .imports
        .start_import(ctx.tenant_id, account_id, &file_name, &raw, &cancel)
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn list_imports(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> Result<impl IntoResponse, AppError> {
    let imports = state.store.list_imports(ctx.tenant_id).await?;

    let mut summaries = Vec::with_capacity(imports.len());
    for import in imports {
        let status_counts = state
            .store
            .status_counts(ctx.tenant_id, import.import_id)
            .await?;
        summaries.push(ImportSummary {
            import,
            status_counts,
        });
    }

    Ok(Json(ImportListResponse {
        imports: summaries,
    }))
}

pub async fn get_import(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(import_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let import = state
        .store
        .get_import(ctx.tenant_id, import_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Import not found")))?;
    let status_counts = state.store.status_counts(ctx.tenant_id, import_id).await?;

    Ok(Json(ImportSummary {
        import,
        status_counts,
    }))
}

pub async fn delete_import(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(import_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    match state.store.delete_import(ctx.tenant_id, import_id).await? {
        DeleteImportOutcome::Deleted => {
            tracing::info!(tenant_id = %ctx.tenant_id, import_id = %import_id, user_id = %ctx.user_id, "Import deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        DeleteImportOutcome::NotFound => {
            Err(AppError::NotFound(anyhow::anyhow!("Import not found")))
        }
        DeleteImportOutcome::HasLinkedTransactions => Err(AppError::Conflict(anyhow::anyhow!(
            "Import has reconciled transactions; unreconcile them first"
        ))),
    }
}

pub async fn list_transactions(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(import_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if state
        .store
        .get_import(ctx.tenant_id, import_id)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound(anyhow::anyhow!("Import not found")));
    }
    let transactions = state.store.list_transactions(ctx.tenant_id, import_id).await?;

    Ok(Json(TransactionListResponse {
        import_id,
        transactions,
    }))
}
