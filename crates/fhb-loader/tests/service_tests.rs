//! Whole-process runs in local directory mode

mod common;

use common::{init_tracing, write_patients};
use fhb_loader::ledger::FileType;
use fhb_loader::{LoaderConfig, LoaderService};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

fn local_config(dir: &std::path::Path, server: &MockServer) -> LoaderConfig {
    let mut config = LoaderConfig::default();
    config.source.local_dir = Some(dir.to_path_buf());
    config.source.file_types = vec![FileType::Ndjson, FileType::Json];
    config.engine.max_inflight = 2;
    config.engine.pool_size = 4;
    config.engine.idle_backoff_secs = 0;
    config.engine.stop_timeout_secs = 5;
    config.fhir.url = format!("{}/fhir", server.uri());
    config.fhir.timeout_secs = 5;
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn test_local_run_submits_everything_and_exits() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/fhir/Patient/[^/]+$"))
        .respond_with(ResponseTemplate::new(201))
        .expect(6)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fhir"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "type": "transaction-response",
            "entry": [{"response": {"status": "201 Created", "location": "Patient/t1/_history/1"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    write_patients(dir.path(), "a.ndjson", 2);
    write_patients(dir.path(), "sub/b.ndjson", 4);
    std::fs::write(
        dir.path().join("tx.json"),
        json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{
                "resource": {"resourceType": "Patient", "id": "t1"},
                "request": {"method": "PUT", "url": "Patient/t1"}
            }]
        })
        .to_string(),
    )
    .unwrap();

    let service = LoaderService::new(local_config(dir.path(), &server)).unwrap();
    tokio::time::timeout(
        Duration::from_secs(20),
        service.run_until(CancellationToken::new()),
    )
    .await
    .expect("loader did not finish")
    .unwrap();

    server.verify().await;
}

#[tokio::test]
async fn test_local_run_with_nothing_to_load_fails() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("README.md"), "no bundles here").unwrap();

    let service = LoaderService::new(local_config(dir.path(), &server)).unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        service.run_until(CancellationToken::new()),
    )
    .await
    .expect("loader did not finish");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_shutdown_cancels_a_slow_run() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    for i in 0..10 {
        write_patients(dir.path(), &format!("f{}.ndjson", i), 2);
    }

    let service = LoaderService::new(local_config(dir.path(), &server)).unwrap();
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(10), service.run_until(shutdown))
        .await
        .expect("loader did not stop")
        .unwrap();

    // Ten files at two lines each would take far longer than a single round.
    assert!(started.elapsed() < Duration::from_secs(2));
    let received = server.received_requests().await.unwrap_or_default();
    assert!(received.len() < 20);
}
