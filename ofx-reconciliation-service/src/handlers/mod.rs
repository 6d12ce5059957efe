pub mod health;
pub mod imports;
pub mod reconciliation;

pub use health::{health_check, metrics_handler, readiness_check};
pub use imports::{delete_import, get_import, import_ofx, list_imports, list_transactions};
pub use reconciliation::{
    audit_trail, candidates, check_batch, ignore, manual_reconcile, unreconcile,
};
