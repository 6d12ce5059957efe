//! Application startup and lifecycle management.

use crate::config::ReconciliationConfig;
use crate::handlers;
use crate::services::{
    Database, HttpLedgerClient, ImportManager, InMemoryLedger, InMemoryStore, LedgerGateway,
    LedgerService, ManualReconciliation, MatchingEngine, ReconciliationStore,
};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::Request,
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ReconciliationConfig,
    pub store: Arc<dyn ReconciliationStore>,
    pub engine: MatchingEngine,
    pub imports: ImportManager,
    pub manual: ManualReconciliation,
    /// Cancelled when the process starts shutting down; matching passes
    /// stop picking up new lines.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: ReconciliationConfig,
        store: Arc<dyn ReconciliationStore>,
        ledger: Arc<dyn LedgerService>,
    ) -> Self {
        let gateway = LedgerGateway::new(
            ledger,
            Duration::from_millis(config.ledger_service.timeout_ms),
        );
        let engine = MatchingEngine::new(
            store.clone(),
            gateway.clone(),
            config.matching.worker_count,
        );
        let imports = ImportManager::new(store.clone(), engine.clone());
        let manual = ManualReconciliation::new(store.clone(), gateway);

        Self {
            config,
            store,
            engine,
            imports,
            manual,
            shutdown: CancellationToken::new(),
        }
    }
}

/// HTTP routes of the service. Every `/api/v1` route needs the gateway's
/// tenant and user headers.
pub fn build_router(state: AppState) -> Router {
    let max_upload_bytes = state.config.max_upload_bytes;

    let api = Router::new()
        .route(
            "/imports",
            post(handlers::import_ofx).get(handlers::list_imports),
        )
        .route(
            "/imports/:import_id",
            get(handlers::get_import).delete(handlers::delete_import),
        )
        .route(
            "/imports/:import_id/transactions",
            get(handlers::list_transactions),
        )
        .route(
            "/reconciliations/check-batch",
            post(handlers::check_batch),
        )
        .route(
            "/transactions/:transaction_id/candidates",
            get(handlers::candidates),
        )
        .route(
            "/transactions/:transaction_id/reconcile",
            post(handlers::manual_reconcile),
        )
        .route(
            "/transactions/:transaction_id/ignore",
            post(handlers::ignore),
        )
        .route(
            "/transactions/:transaction_id/audit",
            get(handlers::audit_trail),
        )
        .route(
            "/ledger-transactions/:ledger_transaction_id/unreconcile",
            post(handlers::unreconcile),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/api/v1", api)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    tenant_id = tracing::field::Empty,
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ReconciliationConfig) -> Result<Self, AppError> {
        let store: Arc<dyn ReconciliationStore> = match &config.database {
            Some(database) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(db)
            }
            None => {
                tracing::warn!("DATABASE_URL not set - using in-memory store, data is not persisted");
                Arc::new(InMemoryStore::new())
            }
        };

        let ledger: Arc<dyn LedgerService> = match &config.ledger_service.url {
            Some(url) => Arc::new(HttpLedgerClient::new(url)),
            None => {
                tracing::warn!("LEDGER_SERVICE_URL not set - using in-memory ledger");
                Arc::new(InMemoryLedger::new())
            }
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "OFX reconciliation service listener bound");

        Ok(Self {
            port,
            listener,
            state: AppState::new(config, store, ledger),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serves until `signal` resolves, then cancels in-flight matching passes
    /// and drains open connections.
    pub async fn run_until_stopped<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.state.shutdown.clone();
        let router = build_router(self.state);

        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move {
                signal.await;
                tracing::info!("Cancelling in-flight matching passes");
                shutdown.cancel();
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerServiceConfig, MatchingConfig};
    use axum::http::StatusCode;
    use service_core::config::Config as CommonConfig;
    use service_core::observability::LogFormat;
    use tower::ServiceExt;

    fn router() -> Router {
        let config = ReconciliationConfig {
            common: CommonConfig { port: 0 },
            service_name: "ofx-reconciliation-service".to_string(),
            service_version: "test".to_string(),
            log_level: "debug".to_string(),
            log_format: LogFormat::Pretty,
            database: None,
            ledger_service: LedgerServiceConfig {
                url: None,
                timeout_ms: 100,
            },
            matching: MatchingConfig { worker_count: 2 },
            max_upload_bytes: 1024,
        };
        let state = AppState::new(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryLedger::new()),
        );
        build_router(state)
    }

    #[tokio::test]
    async fn health_needs_no_tenant() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_routes_need_gateway_headers() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/imports")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn uploads_over_the_limit_are_refused() {
        let body = serde_json::json!({
            "account_id": uuid::Uuid::new_v4(),
            "file_name": "big.ofx",
            "content": "x".repeat(4096),
        })
        .to_string();

        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/imports")
                    .header("content-type", "application/json")
                    .header("X-Tenant-ID", uuid::Uuid::new_v4().to_string())
                    .header("X-User-ID", "ana")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
