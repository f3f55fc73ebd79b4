//! Black-box tests of the HTTP surface over an ephemeral-port server.

use std::sync::Arc;
use std::time::Duration;

use remitsync_api::app::{self, services, AppServices};
use remitsync_infra::testing::{InMemoryLedger, LedgerCall};
use remitsync_infra::{DriverHandle, InMemoryPipelineStore, SchedulerDriver, Settings};
use remitsync_remote::RemoteError;
use reqwest::StatusCode;
use serde_json::{json, Value};

const SCOPE: i64 = 1;

struct TestServer {
    base_url: String,
    ledger: Arc<InMemoryLedger>,
    handle: tokio::task::JoinHandle<()>,
    driver: Option<DriverHandle>,
}

impl TestServer {
    /// Without a background driver: `/process` runs the pass inline.
    async fn spawn(extra: &str) -> Self {
        Self::start(extra, false).await
    }

    async fn spawn_with_driver(extra: &str) -> Self {
        Self::start(extra, true).await
    }

    async fn start(extra: &str, background: bool) -> Self {
        let settings = settings(extra);
        let ledger = Arc::new(InMemoryLedger::new());
        let flow = Arc::new(services::build_flow_control(&settings));
        let driver = Arc::new(SchedulerDriver::new(
            InMemoryPipelineStore::arc(),
            ledger.clone(),
            flow,
            settings,
        ));
        let driver_handle = background.then(|| Arc::clone(&driver).spawn());
        let trigger = driver_handle.as_ref().map(DriverHandle::trigger);
        let app = app::build_app(Arc::new(AppServices::new(driver, trigger)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            ledger,
            handle,
            driver: driver_handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.driver.take();
    }
}

fn settings(extra: &str) -> Settings {
    Settings::from_toml(&format!(
        r#"
        [remote]
        url = "http://ledger.test"
        database = "books"
        username = "sync"
        password = "secret"
        journal_id = 7

        {extra}
        "#
    ))
    .unwrap()
}

fn row(identifier: &str, amount: f64) -> Value {
    json!({
        "payment_date": "2024-05-02",
        "raw_identifier": identifier,
        "memo": "bank transfer",
        "amount": amount,
    })
}

async fn ingest(client: &reqwest::Client, server: &TestServer, rows: Vec<Value>) -> String {
    let res = client
        .post(server.url("/batches"))
        .json(&json!({ "source_name": "may.csv", "rows": rows }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    body["batch_id"].as_str().unwrap().to_string()
}

async fn post_json(client: &reqwest::Client, url: String) -> (StatusCode, Value) {
    let res = client.post(url).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn get_json(client: &reqwest::Client, url: String) -> (StatusCode, Value) {
    let res = client.get(url).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn health_is_ok() {
    let server = TestServer::spawn("").await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn ingested_batch_is_processed_on_demand() {
    let server = TestServer::spawn("").await;
    let client = reqwest::Client::new();
    let party = server.ledger.add_party("ACME SA", Some(SCOPE), &["30-12345678-9"]);
    server.ledger.set_debt(party, SCOPE, 1000.0);

    let id = ingest(
        &client,
        &server,
        vec![row("30-12345678-9", 1000.0), row("", 12.5)],
    )
    .await;

    let (status, summary) = get_json(&client, server.url(&format!("/batches/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["checkpoint"]["state"], "running");
    assert_eq!(summary["counts"]["pending"], 2);
    assert_eq!(summary["outstanding"], 2);
    assert_eq!(server.ledger.total_calls(), 0);

    let (status, report) = post_json(&client, server.url(&format!("/batches/{id}/process"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["outcome"], "completed");
    assert_eq!(report["done"], 1);
    assert_eq!(report["skipped"], 1);

    let (_, summary) = get_json(&client, server.url(&format!("/batches/{id}"))).await;
    assert_eq!(summary["checkpoint"]["state"], "completed");
    assert_eq!(summary["checkpoint"]["success_count"], 1);
    assert_eq!(summary["checkpoint"]["skipped_count"], 1);
    assert_eq!(summary["checkpoint"]["progress_percentage"], 100.0);

    let (_, items) = get_json(&client, server.url(&format!("/batches/{id}/items"))).await;
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["state"], "done");
    assert_eq!(items[0]["outcome"], "approved");
    assert_eq!(items[0]["party_id"], party);
    assert_eq!(items[1]["state"], "skipped");
    assert_eq!(items[1]["outcome"], "no_identifier");

    let (_, skipped) =
        get_json(&client, server.url(&format!("/batches/{id}/items?state=skipped"))).await;
    assert_eq!(skipped.as_array().unwrap().len(), 1);

    let (_, list) = get_json(&client, server.url("/batches")).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["batch_id"], id.as_str());

    assert_eq!(server.ledger.receipts().len(), 1);
}

#[tokio::test]
async fn rows_without_identifier_or_amount_are_rejected() {
    let server = TestServer::spawn("").await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/batches"))
        .json(&json!({ "source_name": "bad.csv", "rows": [row("20111222", 5.0), row("", 0.0)] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].as_str().unwrap().contains("row 2"));

    let (_, list) = get_json(&client, server.url("/batches")).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_and_malformed_batch_ids() {
    let server = TestServer::spawn("").await;
    let client = reqwest::Client::new();

    let (status, body) = get_json(&client, server.url("/batches/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_id");

    let missing = "0190a2d4-6f2e-7c3a-8b1d-2f6e5a4c3b21";
    let (status, body) = get_json(&client, server.url(&format!("/batches/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = post_json(&client, server.url(&format!("/batches/{missing}/process"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) =
        get_json(&client, server.url(&format!("/batches/{missing}/items"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn paused_batches_are_not_processed_until_resumed() {
    let server = TestServer::spawn("").await;
    let client = reqwest::Client::new();
    let party = server.ledger.add_party("Perez", None, &["20111222"]);
    server.ledger.set_debt(party, SCOPE, 300.0);
    let id = ingest(&client, &server, vec![row("20111222", 300.0)]).await;

    let (status, cp) = post_json(&client, server.url(&format!("/batches/{id}/pause"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cp["state"], "paused");

    let (_, report) = post_json(&client, server.url(&format!("/batches/{id}/process"))).await;
    assert_eq!(report["outcome"], "paused");
    assert_eq!(server.ledger.total_calls(), 0);

    let (status, cp) = post_json(&client, server.url(&format!("/batches/{id}/resume"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cp["state"], "running");

    let (_, report) = post_json(&client, server.url(&format!("/batches/{id}/process"))).await;
    assert_eq!(report["outcome"], "completed");

    // Pausing a completed batch is an illegal transition.
    let (status, body) = post_json(&client, server.url(&format!("/batches/{id}/pause"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_state");
}

#[tokio::test]
async fn failed_items_can_be_requeued() {
    let server = TestServer::spawn("[pipeline]\nmax_attempts = 1").await;
    let client = reqwest::Client::new();
    let party = server.ledger.add_party("ACME", None, &["20111222"]);
    server.ledger.set_debt(party, SCOPE, 5.0);
    server
        .ledger
        .fail_next(LedgerCall::ReceivableDebt, RemoteError::Fault("access error".into()));
    let id = ingest(&client, &server, vec![row("20111222", 5.0)]).await;

    let (_, report) = post_json(&client, server.url(&format!("/batches/{id}/process"))).await;
    assert_eq!(report["outcome"], "completed");
    assert_eq!(report["failed"], 1);

    let (status, body) =
        post_json(&client, server.url(&format!("/batches/{id}/requeue-failed"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requeued"], 1);
    assert_eq!(body["checkpoint"]["state"], "running");
    assert_eq!(body["checkpoint"]["failed_count"], 0);

    let (_, report) = post_json(&client, server.url(&format!("/batches/{id}/process"))).await;
    assert_eq!(report["done"], 1);
    assert_eq!(report["outcome"], "completed");
}

#[tokio::test]
async fn circuit_can_be_inspected_and_reset() {
    let server = TestServer::spawn("[flow]\nfailure_threshold = 1").await;
    let client = reqwest::Client::new();
    server
        .ledger
        .fail_next(LedgerCall::Authenticate, RemoteError::Transport("connection refused".into()));
    let id = ingest(&client, &server, vec![row("20111222", 5.0)]).await;

    let (_, report) = post_json(&client, server.url(&format!("/batches/{id}/process"))).await;
    assert_eq!(report["outcome"], "deferred");

    let (status, circuit) = get_json(&client, server.url("/flow/circuit")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(circuit["state"], "open");

    let (status, circuit) = post_json(&client, server.url("/flow/circuit/reset")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(circuit["state"], "closed");
    assert_eq!(circuit["consecutive_failures"], 0);
}

#[tokio::test]
async fn background_driver_processes_ingested_batches() {
    let server = TestServer::spawn_with_driver("").await;
    let client = reqwest::Client::new();
    let party = server.ledger.add_party("ACME", None, &["20111222"]);
    server.ledger.set_debt(party, SCOPE, 42.0);

    let res = client
        .post(server.url("/batches"))
        .json(&json!({ "source_name": "bg.csv", "rows": [row("20111222", 42.0)] }))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["queued"], true);
    let id = body["batch_id"].as_str().unwrap().to_string();

    for _ in 0..100 {
        let (_, summary) = get_json(&client, server.url(&format!("/batches/{id}"))).await;
        if summary["checkpoint"]["state"] == "completed" {
            assert_eq!(summary["counts"]["done"], 1);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("batch was not completed by the background driver");
}
