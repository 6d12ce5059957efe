//! Services module for ofx-reconciliation-service.

pub mod database;
pub mod error;
pub mod import;
pub mod ledger;
pub mod link;
pub mod manual;
pub mod matching;
pub mod metrics;
pub mod store;

pub use database::Database;
pub use error::ReconciliationError;
pub use import::ImportManager;
pub use ledger::{HttpLedgerClient, InMemoryLedger, LedgerError, LedgerGateway, LedgerService};
pub use manual::ManualReconciliation;
pub use matching::MatchingEngine;
pub use metrics::{get_metrics, init_metrics};
pub use store::{DeleteImportOutcome, InMemoryStore, ReconciliationStore};
