//! Postgres implementation of [`ReconciliationStore`].

use crate::models::{
    BankInfo, ClaimOutcome, DedupKey, ImportStatus, OfxImport, ReconciliationAudit,
    ReconciliationStatus, StatementTransaction, StatusChange, StatusCounts, TransactionType,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{DeleteImportOutcome, ReconciliationStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const IMPORT_COLUMNS: &str = "import_id, tenant_id, account_id, file_name, bank_code, bank_name, \
     account_number, agency, period_start, period_end, fingerprint, status, error_message, \
     total_transactions, transactions_reconciled, total_credits, total_debits, imported_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, tenant_id, import_id, account_id, fit_id, \
     transaction_date, description, amount, transaction_type, check_number, document_number, \
     reconciliation_status, matched_transaction_id, created_utc, updated_utc";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Unique violations become conflicts so callers can tell a lost race from a
/// broken database.
fn insert_error(context: &str, e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!("{}: {}", context, db_err))
        }
        _ => db_error(context, e),
    }
}

// ============================================================================
// Row mappings
// ============================================================================

#[derive(sqlx::FromRow)]
struct ImportRow {
    import_id: Uuid,
    tenant_id: Uuid,
    account_id: Uuid,
    file_name: String,
    bank_code: Option<String>,
    bank_name: Option<String>,
    account_number: Option<String>,
    agency: Option<String>,
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
    fingerprint: String,
    status: String,
    error_message: Option<String>,
    total_transactions: i32,
    transactions_reconciled: i32,
    total_credits: Decimal,
    total_debits: Decimal,
    imported_utc: DateTime<Utc>,
}

impl From<ImportRow> for OfxImport {
    fn from(row: ImportRow) -> Self {
        Self {
            import_id: row.import_id,
            tenant_id: row.tenant_id,
            account_id: row.account_id,
            file_name: row.file_name,
            bank_info: BankInfo {
                bank_code: row.bank_code,
                bank_name: row.bank_name,
                account_number: row.account_number,
                agency: row.agency,
                period_start: row.period_start,
                period_end: row.period_end,
            },
            fingerprint: row.fingerprint,
            status: ImportStatus::from_str(&row.status),
            error_message: row.error_message,
            total_transactions: row.total_transactions,
            transactions_reconciled: row.transactions_reconciled,
            total_credits: row.total_credits,
            total_debits: row.total_debits,
            imported_utc: row.imported_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    transaction_id: Uuid,
    tenant_id: Uuid,
    import_id: Uuid,
    account_id: Uuid,
    fit_id: Option<String>,
    transaction_date: NaiveDate,
    description: String,
    amount: Decimal,
    transaction_type: String,
    check_number: Option<String>,
    document_number: Option<String>,
    reconciliation_status: String,
    matched_transaction_id: Option<Uuid>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<TransactionRow> for StatementTransaction {
    fn from(row: TransactionRow) -> Self {
        Self {
            transaction_id: row.transaction_id,
            tenant_id: row.tenant_id,
            import_id: row.import_id,
            account_id: row.account_id,
            fit_id: row.fit_id,
            transaction_date: row.transaction_date,
            description: row.description,
            amount: row.amount,
            transaction_type: TransactionType::from_str(&row.transaction_type),
            check_number: row.check_number,
            document_number: row.document_number,
            reconciliation_status: ReconciliationStatus::from_str(&row.reconciliation_status),
            matched_transaction_id: row.matched_transaction_id,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    audit_id: Uuid,
    tenant_id: Uuid,
    statement_transaction_id: Uuid,
    ledger_transaction_id: Option<Uuid>,
    previous_status: String,
    new_status: String,
    actor: String,
    reason: Option<String>,
    created_utc: DateTime<Utc>,
}

impl From<AuditRow> for ReconciliationAudit {
    fn from(row: AuditRow) -> Self {
        Self {
            audit_id: row.audit_id,
            tenant_id: row.tenant_id,
            statement_transaction_id: row.statement_transaction_id,
            ledger_transaction_id: row.ledger_transaction_id,
            previous_status: ReconciliationStatus::from_str(&row.previous_status),
            new_status: ReconciliationStatus::from_str(&row.new_status),
            actor: row.actor,
            reason: row.reason,
            created_utc: row.created_utc,
        }
    }
}

// ============================================================================
// Database
// ============================================================================

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "ofx-reconciliation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn insert_audit(
        conn: &mut sqlx::PgConnection,
        audit: &ReconciliationAudit,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_audit (audit_id, tenant_id, statement_transaction_id, ledger_transaction_id, previous_status, new_status, actor, reason, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(audit.audit_id)
        .bind(audit.tenant_id)
        .bind(audit.statement_transaction_id)
        .bind(audit.ledger_transaction_id)
        .bind(audit.previous_status.as_str())
        .bind(audit.new_status.as_str())
        .bind(&audit.actor)
        .bind(&audit.reason)
        .bind(audit.created_utc)
        .execute(conn)
        .await
        .map_err(|e| db_error("Failed to write audit entry", e))?;
        Ok(())
    }
}

#[async_trait]
impl ReconciliationStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, fingerprint), fields(tenant_id = %tenant_id, account_id = %account_id))]
    async fn find_import_by_fingerprint(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<OfxImport>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_import_by_fingerprint"])
            .start_timer();

        let row = sqlx::query_as::<_, ImportRow>(&format!(
            "SELECT {} FROM ofx_imports \
             WHERE tenant_id = $1 AND account_id = $2 AND fingerprint = $3 AND status <> 'failed' \
             ORDER BY imported_utc LIMIT 1",
            IMPORT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(account_id)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to look up import fingerprint", e))?;

        timer.observe_duration();
        Ok(row.map(OfxImport::from))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, account_id = %account_id))]
    async fn existing_dedup_keys(
        &self,
        tenant_id: Uuid,
        account_id: Uuid,
    ) -> Result<HashSet<DedupKey>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["existing_dedup_keys"])
            .start_timer();

        let rows = sqlx::query_as::<_, (String, NaiveDate, Decimal)>(
            r#"
            SELECT fit_id, transaction_date, amount
            FROM statement_transactions
            WHERE tenant_id = $1 AND account_id = $2 AND fit_id IS NOT NULL
            "#,
        )
        .bind(tenant_id)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load existing transactions", e))?;

        timer.observe_duration();
        Ok(rows
            .into_iter()
            .map(|(fit_id, transaction_date, amount)| DedupKey {
                fit_id,
                transaction_date,
                amount,
            })
            .collect())
    }

    #[instrument(skip(self, import, transactions), fields(tenant_id = %import.tenant_id, import_id = %import.import_id, count = transactions.len()))]
    async fn insert_import(
        &self,
        import: &OfxImport,
        transactions: &[StatementTransaction],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_import"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO ofx_imports (import_id, tenant_id, account_id, file_name, bank_code, bank_name, account_number, agency, period_start, period_end, fingerprint, status, error_message, total_transactions, transactions_reconciled, total_credits, total_debits, imported_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(import.import_id)
        .bind(import.tenant_id)
        .bind(import.account_id)
        .bind(&import.file_name)
        .bind(&import.bank_info.bank_code)
        .bind(&import.bank_info.bank_name)
        .bind(&import.bank_info.account_number)
        .bind(&import.bank_info.agency)
        .bind(import.bank_info.period_start)
        .bind(import.bank_info.period_end)
        .bind(&import.fingerprint)
        .bind(import.status.as_str())
        .bind(&import.error_message)
        .bind(import.total_transactions)
        .bind(import.transactions_reconciled)
        .bind(import.total_credits)
        .bind(import.total_debits)
        .bind(import.imported_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| insert_error("Failed to create import", e))?;

        for stx in transactions {
            sqlx::query(
                r#"
                INSERT INTO statement_transactions (transaction_id, tenant_id, import_id, account_id, fit_id, transaction_date, description, amount, transaction_type, check_number, document_number, reconciliation_status, matched_transaction_id, created_utc, updated_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(stx.transaction_id)
            .bind(stx.tenant_id)
            .bind(stx.import_id)
            .bind(stx.account_id)
            .bind(&stx.fit_id)
            .bind(stx.transaction_date)
            .bind(&stx.description)
            .bind(stx.amount)
            .bind(stx.transaction_type.as_str())
            .bind(&stx.check_number)
            .bind(&stx.document_number)
            .bind(stx.reconciliation_status.as_str())
            .bind(stx.matched_transaction_id)
            .bind(stx.created_utc)
            .bind(stx.updated_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| insert_error("Failed to create statement transaction", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit import", e))?;

        timer.observe_duration();
        info!("Import persisted");
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, import_id = %import_id))]
    async fn finish_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
        status: ImportStatus,
        transactions_reconciled: i32,
    ) -> Result<Option<OfxImport>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_import"])
            .start_timer();

        let row = sqlx::query_as::<_, ImportRow>(&format!(
            "UPDATE ofx_imports SET status = $3, transactions_reconciled = $4 \
             WHERE tenant_id = $1 AND import_id = $2 RETURNING {}",
            IMPORT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(import_id)
        .bind(status.as_str())
        .bind(transactions_reconciled)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to finish import", e))?;

        timer.observe_duration();
        Ok(row.map(OfxImport::from))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_imports(&self, tenant_id: Uuid) -> Result<Vec<OfxImport>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_imports"])
            .start_timer();

        let rows = sqlx::query_as::<_, ImportRow>(&format!(
            "SELECT {} FROM ofx_imports WHERE tenant_id = $1 ORDER BY imported_utc DESC",
            IMPORT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list imports", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(OfxImport::from).collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, import_id = %import_id))]
    async fn get_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<Option<OfxImport>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_import"])
            .start_timer();

        let row = sqlx::query_as::<_, ImportRow>(&format!(
            "SELECT {} FROM ofx_imports WHERE tenant_id = $1 AND import_id = $2",
            IMPORT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(import_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get import", e))?;

        timer.observe_duration();
        Ok(row.map(OfxImport::from))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, import_id = %import_id))]
    async fn delete_import(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<DeleteImportOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_import"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let exists = sqlx::query_scalar::<_, Uuid>(
            "SELECT import_id FROM ofx_imports WHERE tenant_id = $1 AND import_id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(import_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock import", e))?;
        if exists.is_none() {
            return Ok(DeleteImportOutcome::NotFound);
        }

        let linked: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM statement_transactions
            WHERE tenant_id = $1 AND import_id = $2 AND matched_transaction_id IS NOT NULL
            "#,
        )
        .bind(tenant_id)
        .bind(import_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to count linked transactions", e))?;
        if linked > 0 {
            return Ok(DeleteImportOutcome::HasLinkedTransactions);
        }

        sqlx::query("DELETE FROM ofx_imports WHERE tenant_id = $1 AND import_id = $2")
            .bind(tenant_id)
            .bind(import_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete import", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit import deletion", e))?;

        timer.observe_duration();
        info!("Import deleted");
        Ok(DeleteImportOutcome::Deleted)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, import_id = %import_id))]
    async fn list_transactions(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<Vec<StatementTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transactions"])
            .start_timer();

        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM statement_transactions \
             WHERE tenant_id = $1 AND import_id = $2 \
             ORDER BY transaction_date, transaction_id",
            TRANSACTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(import_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list transactions", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(StatementTransaction::from).collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_open_transactions(
        &self,
        tenant_id: Uuid,
        import_id: Option<Uuid>,
    ) -> Result<Vec<StatementTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_open_transactions"])
            .start_timer();

        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM statement_transactions \
             WHERE tenant_id = $1 \
               AND reconciliation_status IN ('pending_review', 'not_identified') \
               AND ($2::uuid IS NULL OR import_id = $2) \
             ORDER BY transaction_date, transaction_id",
            TRANSACTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(import_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list open transactions", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(StatementTransaction::from).collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<StatementTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM statement_transactions WHERE tenant_id = $1 AND transaction_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get transaction", e))?;

        timer.observe_duration();
        Ok(row.map(StatementTransaction::from))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, ledger_transaction_id = %ledger_transaction_id))]
    async fn find_by_ledger_transaction(
        &self,
        tenant_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<Option<StatementTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_by_ledger_transaction"])
            .start_timer();

        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM statement_transactions \
             WHERE tenant_id = $1 AND matched_transaction_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(ledger_transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to find linked transaction", e))?;

        timer.observe_duration();
        Ok(row.map(StatementTransaction::from))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    async fn claim_ledger_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<ClaimOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_ledger_transaction"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE statement_transactions
            SET matched_transaction_id = $3, updated_utc = NOW()
            WHERE tenant_id = $1 AND transaction_id = $2 AND matched_transaction_id IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .bind(ledger_transaction_id)
        .execute(&self.pool)
        .await;

        let outcome = match result {
            Ok(done) if done.rows_affected() == 1 => ClaimOutcome::Claimed,
            Ok(_) => match self.get_transaction(tenant_id, transaction_id).await? {
                Some(_) => ClaimOutcome::StatementAlreadyLinked,
                None => ClaimOutcome::NotFound,
            },
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                ClaimOutcome::LedgerAlreadyClaimed
            }
            Err(e) => return Err(db_error("Failed to claim ledger transaction", e)),
        };

        timer.observe_duration();
        Ok(outcome)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    async fn release_claim(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
        ledger_transaction_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_claim"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE statement_transactions
            SET matched_transaction_id = NULL, updated_utc = NOW()
            WHERE tenant_id = $1 AND transaction_id = $2 AND matched_transaction_id = $3
              AND reconciliation_status NOT IN ('auto_reconciled', 'manual_reconciled')
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .bind(ledger_transaction_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to release claim", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, change), fields(tenant_id = %tenant_id, transaction_id = %change.transaction_id, to = %change.to))]
    async fn transition(&self, tenant_id: Uuid, change: &StatusChange) -> Result<bool, AppError> {
        if change.clear_link && change.ledger_transaction_id.is_none() {
            return Ok(false);
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["transition"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let result = sqlx::query(
            r#"
            UPDATE statement_transactions
            SET reconciliation_status = $3,
                matched_transaction_id = CASE WHEN $6 THEN NULL ELSE matched_transaction_id END,
                updated_utc = NOW()
            WHERE tenant_id = $1 AND transaction_id = $2 AND reconciliation_status = $4
              AND (
                ($5::uuid IS NULL AND matched_transaction_id IS NULL)
                OR matched_transaction_id = $5
              )
            "#,
        )
        .bind(tenant_id)
        .bind(change.transaction_id)
        .bind(change.to.as_str())
        .bind(change.from.as_str())
        .bind(change.ledger_transaction_id)
        .bind(change.clear_link)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to update reconciliation status", e))?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        Self::insert_audit(&mut tx, &change.audit(tenant_id)).await?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit status change", e))?;

        timer.observe_duration();
        Ok(true)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    async fn list_audit(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<ReconciliationAudit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_audit"])
            .start_timer();

        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT audit_id, tenant_id, statement_transaction_id, ledger_transaction_id, previous_status, new_status, actor, reason, created_utc
            FROM reconciliation_audit
            WHERE tenant_id = $1 AND statement_transaction_id = $2
            ORDER BY created_utc
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list audit entries", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(ReconciliationAudit::from).collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, import_id = %import_id))]
    async fn status_counts(
        &self,
        tenant_id: Uuid,
        import_id: Uuid,
    ) -> Result<StatusCounts, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["status_counts"])
            .start_timer();

        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT reconciliation_status, COUNT(*)
            FROM statement_transactions
            WHERE tenant_id = $1 AND import_id = $2
            GROUP BY reconciliation_status
            "#,
        )
        .bind(tenant_id)
        .bind(import_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to count statuses", e))?;

        timer.observe_duration();
        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(ReconciliationStatus::from_str(&status), count);
        }
        Ok(counts)
    }
}
