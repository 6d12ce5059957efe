//! Common test utilities for ofx-reconciliation-service integration tests.

use chrono::NaiveDate;
use ofx_reconciliation_service::config::{
    LedgerServiceConfig, MatchingConfig, ReconciliationConfig,
};
use ofx_reconciliation_service::middleware::tenant::{TENANT_ID_HEADER, USER_ID_HEADER};
use ofx_reconciliation_service::models::LedgerExpenseTransaction;
use ofx_reconciliation_service::services::{InMemoryLedger, InMemoryStore, ReconciliationStore};
use ofx_reconciliation_service::startup::{build_router, AppState};
use rust_decimal::Decimal;
use serde_json::Value;
use service_core::config::Config as CommonConfig;
use service_core::observability::LogFormat;
use std::str::FromStr;
use std::sync::{Arc, Once};
use tokio::net::TcpListener;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,ofx_reconciliation_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn test_config() -> ReconciliationConfig {
    ReconciliationConfig {
        common: CommonConfig { port: 0 },
        service_name: "ofx-reconciliation-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        log_format: LogFormat::Pretty,
        database: None,
        ledger_service: LedgerServiceConfig {
            url: None,
            timeout_ms: 1_000,
        },
        matching: MatchingConfig { worker_count: 4 },
        max_upload_bytes: 1024 * 1024,
    }
}

/// Test application wrapper.
#[allow(dead_code)]
pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub tenant_id: Uuid,
    pub ledger: Arc<InMemoryLedger>,
    pub store: Arc<InMemoryStore>,
}

/// Spawn the HTTP API on an ephemeral port, backed by the in-memory store and
/// ledger, with a fresh tenant.
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let state = AppState::new(test_config(), store.clone(), ledger.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.ok();
    });

    TestApp {
        address: format!("http://127.0.0.1:{}", port),
        client: reqwest::Client::new(),
        tenant_id: Uuid::new_v4(),
        ledger,
        store,
    }
}

#[allow(dead_code)]
impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.address, path)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.as_tenant(self.client.get(self.url(path)), self.tenant_id)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.as_tenant(self.client.post(self.url(path)), self.tenant_id)
    }

    pub fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.as_tenant(self.client.delete(self.url(path)), self.tenant_id)
    }

    pub fn as_tenant(
        &self,
        request: reqwest::RequestBuilder,
        tenant_id: Uuid,
    ) -> reqwest::RequestBuilder {
        request
            .header(TENANT_ID_HEADER, tenant_id.to_string())
            .header(USER_ID_HEADER, "test-user")
    }

    /// Uploads `content` and returns the status with the parsed body.
    pub async fn import(&self, account_id: Uuid, content: &str) -> (u16, Value) {
        let response = self
            .post("/imports")
            .json(&serde_json::json!({
                "account_id": account_id,
                "file_name": "statement.ofx",
                "content": content,
            }))
            .send()
            .await
            .expect("Failed to send import request");
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Statement lines of an import, keyed by FITID.
    pub async fn transaction_by_fit_id(&self, import_id: &str, fit_id: &str) -> Value {
        let body: Value = self
            .get(&format!("/imports/{}/transactions", import_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["transactions"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["fit_id"] == fit_id)
            .cloned()
            .unwrap_or_else(|| panic!("no statement line with FITID {}", fit_id))
    }

    /// Adds an open ledger expense for this tenant and returns its id.
    pub async fn add_expense(&self, check_number: &str, amount: &str, date: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.ledger
            .insert(LedgerExpenseTransaction {
                ledger_transaction_id: id,
                tenant_id: self.tenant_id,
                check_number: Some(check_number.to_string()),
                amount: Decimal::from_str(amount).unwrap(),
                transaction_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
                description: format!("Check {}", check_number),
                reconciled: false,
            })
            .await;
        id
    }

    pub async fn audit_count(&self, transaction_id: Uuid) -> usize {
        self.store
            .list_audit(self.tenant_id, transaction_id)
            .await
            .unwrap()
            .len()
    }
}

/// One `<STMTTRN>` line of a generated statement.
#[allow(dead_code)]
pub struct Line<'a> {
    pub fit_id: &'a str,
    pub kind: &'a str,
    pub date: &'a str,
    pub amount: &'a str,
    pub check_number: Option<&'a str>,
}

#[allow(dead_code)]
pub fn check(
    fit_id: &'static str,
    date: &'static str,
    amount: &'static str,
    number: &'static str,
) -> Line<'static> {
    Line {
        fit_id,
        kind: "CHECK",
        date,
        amount,
        check_number: Some(number),
    }
}

#[allow(dead_code)]
pub fn deposit(fit_id: &'static str, date: &'static str, amount: &'static str) -> Line<'static> {
    Line {
        fit_id,
        kind: "DEP",
        date,
        amount,
        check_number: None,
    }
}

/// SGML statement for one checking account over January 2024.
#[allow(dead_code)]
pub fn statement(lines: &[Line]) -> String {
    let mut body = String::new();
    for line in lines {
        body.push_str(&format!(
            "<STMTTRN><TRNTYPE>{}<DTPOSTED>{}<TRNAMT>{}<FITID>{}",
            line.kind, line.date, line.amount, line.fit_id
        ));
        if let Some(number) = line.check_number {
            body.push_str(&format!("<CHECKNUM>{}", number));
        }
        body.push_str("<NAME>Statement line\n");
    }

    format!(
        "OFXHEADER:100
DATA:OFXSGML
VERSION:102
ENCODING:USASCII
CHARSET:1252

<OFX>
<BANKMSGSRSV1><STMTTRNRS><TRNUID>1
<STMTRS><CURDEF>USD
<BANKACCTFROM><BANKID>021<ACCTID>4455<ACCTTYPE>CHECKING</BANKACCTFROM>
<BANKTRANLIST><DTSTART>20240101<DTEND>20240131
{}</BANKTRANLIST>
</STMTRS></STMTTRNRS></BANKMSGSRSV1>
</OFX>",
        body
    )
}
