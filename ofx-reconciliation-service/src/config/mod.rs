//! Configuration module for ofx-reconciliation-service.

use service_core::config as core_config;
use service_core::error::AppError;
use service_core::observability::LogFormat;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// `None` runs against the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub ledger_service: LedgerServiceConfig,
    pub matching: MatchingConfig,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LedgerServiceConfig {
    /// `None` runs against the in-memory ledger.
    pub url: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub worker_count: usize,
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let database = match env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => Some(DatabaseConfig {
                url,
                max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parsed_or("DATABASE_MIN_CONNECTIONS", 2),
            }),
            _ => None,
        };

        let worker_count: usize = parsed_or("MATCHING_WORKER_COUNT", 8);
        if worker_count == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MATCHING_WORKER_COUNT must be at least 1"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "ofx-reconciliation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: LogFormat::from_str(
                &env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            ),
            database,
            ledger_service: LedgerServiceConfig {
                url: env::var("LEDGER_SERVICE_URL")
                    .ok()
                    .filter(|u| !u.trim().is_empty()),
                timeout_ms: parsed_or("LEDGER_TIMEOUT_MS", 5_000),
            },
            matching: MatchingConfig { worker_count },
            max_upload_bytes: parsed_or("MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
        })
    }
}
