//! Tenant context extracted from gateway headers.
//!
//! The API gateway authenticates the caller and forwards the tenant and user
//! as `X-Tenant-ID` and `X-User-ID`. Every store and ledger call is scoped to
//! that tenant.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    /// Recorded as the actor on audit entries.
    pub user_id: String,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            AppError::AuthError(anyhow::anyhow!("Missing {} header (required from gateway)", name))
        })
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw_tenant = header(parts, TENANT_ID_HEADER)?;
        let tenant_id = Uuid::parse_str(raw_tenant).map_err(|_| {
            AppError::BadRequest(anyhow::anyhow!("Invalid {} header", TENANT_ID_HEADER))
        })?;
        let user_id = header(parts, USER_ID_HEADER)?;

        let span = tracing::Span::current();
        span.record("tenant_id", tracing::field::display(tenant_id));
        span.record("user_id", user_id);

        Ok(TenantContext {
            tenant_id,
            user_id: user_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<TenantContext, AppError> {
        let (mut parts, _) = request.into_parts();
        TenantContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_tenant_and_user() {
        let tenant = Uuid::new_v4();
        let request = Request::builder()
            .header(TENANT_ID_HEADER, tenant.to_string())
            .header(USER_ID_HEADER, "ana")
            .body(())
            .unwrap();

        let ctx = extract(request).await.unwrap();
        assert_eq!(ctx.tenant_id, tenant);
        assert_eq!(ctx.user_id, "ana");
    }

    #[tokio::test]
    async fn rejects_missing_or_malformed_tenant() {
        let missing = Request::builder()
            .header(USER_ID_HEADER, "ana")
            .body(())
            .unwrap();
        assert!(matches!(extract(missing).await, Err(AppError::AuthError(_))));

        let malformed = Request::builder()
            .header(TENANT_ID_HEADER, "clinic-42")
            .header(USER_ID_HEADER, "ana")
            .body(())
            .unwrap();
        assert!(matches!(extract(malformed).await, Err(AppError::BadRequest(_))));
    }
}
