//! Integration tests for manual reconcile, unreconcile and ignore.

mod common;

use common::{check, spawn_app, statement, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;

/// Imports a single check line and returns its statement transaction id.
async fn import_check(app: &TestApp, number: &'static str) -> Uuid {
    let content = statement(&[check("A1", "20240301", "-150.00", number)]);
    let (status, body) = app.import(Uuid::new_v4(), &content).await;
    assert_eq!(status, 201);

    let import_id = body["import"]["import_id"].as_str().unwrap().to_string();
    let line = app.transaction_by_fit_id(&import_id, "A1").await;
    Uuid::parse_str(line["transaction_id"].as_str().unwrap()).unwrap()
}

async fn reconcile(app: &TestApp, transaction_id: Uuid, ledger_id: Uuid) -> (u16, Value) {
    let response = app
        .post(&format!("/transactions/{}/reconcile", transaction_id))
        .json(&json!({ "ledger_transaction_id": ledger_id, "reason": "matched by hand" }))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap_or(Value::Null))
}

async fn unreconcile(app: &TestApp, ledger_id: Uuid) -> (u16, Value) {
    let response = app
        .post(&format!("/ledger-transactions/{}/unreconcile", ledger_id))
        .json(&json!({ "reason": "wrong check" }))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap_or(Value::Null))
}

#[tokio::test]
async fn manual_reconcile_succeeds_once() {
    let app = spawn_app().await;
    let transaction_id = import_check(&app, "1001").await;
    let expense = app.add_expense("9999", "150.00", "2024-03-01").await;

    let (status, body) = reconcile(&app, transaction_id, expense).await;
    assert_eq!(status, 200);
    assert_eq!(body["reconciliation_status"], "manual_reconciled");
    assert_eq!(body["matched_transaction_id"], expense.to_string());
    assert!(app.ledger.get(expense).await.unwrap().reconciled);

    let other = app.add_expense("9998", "150.00", "2024-03-01").await;
    let (status, body) = reconcile(&app, transaction_id, other).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"], "conflict");
    assert!(!app.ledger.get(other).await.unwrap().reconciled);
}

#[tokio::test]
async fn unreconcile_returns_the_line_to_review_and_allows_a_rematch() {
    let app = spawn_app().await;
    let transaction_id = import_check(&app, "1001").await;
    let expense = app.add_expense("1001", "150.00", "2024-03-01").await;

    let (status, _) = reconcile(&app, transaction_id, expense).await;
    assert_eq!(status, 200);

    let (status, body) = unreconcile(&app, expense).await;
    assert_eq!(status, 200);
    assert_eq!(body["reconciliation_status"], "pending_review");
    assert_eq!(body["matched_transaction_id"], Value::Null);
    assert!(!app.ledger.get(expense).await.unwrap().reconciled);

    let batch: Value = app
        .post("/reconciliations/check-batch")
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(batch["auto_reconciled"], 1);
    assert!(app.ledger.get(expense).await.unwrap().reconciled);
}

#[tokio::test]
async fn unreconcile_of_an_unlinked_ledger_entry_is_not_found() {
    let app = spawn_app().await;

    let (status, body) = unreconcile(&app, Uuid::new_v4()).await;

    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn ignore_is_idempotent() {
    let app = spawn_app().await;
    let transaction_id = import_check(&app, "1001").await;
    let before = app.audit_count(transaction_id).await;

    for _ in 0..2 {
        let response = app
            .post(&format!("/transactions/{}/ignore", transaction_id))
            .json(&json!({ "reason": "bank fee" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["reconciliation_status"], "ignored");
    }

    assert_eq!(app.audit_count(transaction_id).await, before + 1);
}

#[tokio::test]
async fn ignored_line_can_still_be_reconciled_by_hand() {
    let app = spawn_app().await;
    let transaction_id = import_check(&app, "1001").await;
    let expense = app.add_expense("1001", "150.00", "2024-03-01").await;

    let response = app
        .post(&format!("/transactions/{}/ignore", transaction_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let (status, body) = reconcile(&app, transaction_id, expense).await;
    assert_eq!(status, 200);
    assert_eq!(body["reconciliation_status"], "manual_reconciled");
}

#[tokio::test]
async fn audit_trail_records_every_change() {
    let app = spawn_app().await;
    let transaction_id = import_check(&app, "1001").await;
    let expense = app.add_expense("7777", "150.00", "2024-03-01").await;

    reconcile(&app, transaction_id, expense).await;
    unreconcile(&app, expense).await;

    let audit: Value = app
        .get(&format!("/transactions/{}/audit", transaction_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = audit["entries"].as_array().unwrap();
    let statuses: Vec<&str> = entries
        .iter()
        .map(|e| e["new_status"].as_str().unwrap())
        .collect();

    assert_eq!(
        statuses,
        vec!["not_identified", "manual_reconciled", "pending_review"]
    );
    assert_eq!(entries[1]["actor"], "test-user");
    assert_eq!(entries[1]["reason"], "matched by hand");
}

#[tokio::test]
async fn other_tenants_cannot_touch_the_line() {
    let app = spawn_app().await;
    let transaction_id = import_check(&app, "1001").await;

    let response = app
        .as_tenant(
            app.client
                .post(app.url(&format!("/transactions/{}/ignore", transaction_id))),
            Uuid::new_v4(),
        )
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
}
