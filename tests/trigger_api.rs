//! Integration tests for the HTTP trigger.
//!
//! Each test spins up an Axum server on a random port and drives it with
//! reqwest, exercising the real REST contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use uuid::Uuid;

use candidate_intake::config::PipelineConfig;
use candidate_intake::error::{ExtractionError, MailError};
use candidate_intake::extraction::{DocumentInput, ExtractionAdapter, ExtractionBackend};
use candidate_intake::mail::{FetchedMessage, MailSource, MessageSummary};
use candidate_intake::pipeline::RunCoordinator;
use candidate_intake::pipeline::calendar::{DayWindow, south_africa_offset};
use candidate_intake::server::intake_routes;
use candidate_intake::store::{IntakeStore, LibSqlBackend, TenantRoute};
use candidate_intake::trigger::RunTrigger;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Empty mailbox that takes `delay` to answer a listing.
struct SlowMailbox {
    delay: Duration,
}

#[async_trait]
impl MailSource for SlowMailbox {
    fn name(&self) -> &str {
        "slow"
    }

    async fn list_messages(
        &self,
        _route: &TenantRoute,
        _window: &DayWindow,
    ) -> Result<Vec<MessageSummary>, MailError> {
        tokio::time::sleep(self.delay).await;
        Ok(vec![])
    }

    async fn get_message(&self, _route: &TenantRoute, id: &str) -> Result<FetchedMessage, MailError> {
        Err(MailError::MessageNotFound(id.to_string()))
    }

    async fn get_attachment(
        &self,
        _route: &TenantRoute,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, MailError> {
        Err(MailError::AttachmentNotFound {
            message_id: message_id.into(),
            attachment_id: attachment_id.into(),
        })
    }
}

struct UnusedModel;

#[async_trait]
impl ExtractionBackend for UnusedModel {
    fn name(&self) -> &str {
        "unused"
    }

    async fn extract(&self, _document: &DocumentInput) -> Result<String, ExtractionError> {
        Ok("{}".into())
    }
}

/// Start an Axum server on a random port, return its base URL.
async fn start_server(delay: Duration) -> String {
    let store: Arc<dyn IntakeStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store
        .insert_route(&TenantRoute {
            id: Uuid::new_v4(),
            source_address: "cvs@greenfield.example".into(),
            user_id: "recruiter-1".into(),
            org_id: "org-greenfield".into(),
            timezone: "+02:00".into(),
            active: true,
        })
        .await
        .unwrap();

    let coordinator = RunCoordinator::new(
        store,
        Arc::new(SlowMailbox { delay }),
        ExtractionAdapter::new(Arc::new(UnusedModel)),
        &PipelineConfig::default(),
    );
    let trigger = Arc::new(RunTrigger::new(Arc::new(coordinator), south_africa_offset()));
    let app = intake_routes(trigger);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Duration::ZERO).await;
        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["service"], "candidate-intake");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn run_then_inspect() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Duration::ZERO).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/api/runs"))
            .json(&serde_json::json!({"target_day": "2024-03-15"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let report: Value = resp.json().await.unwrap();
        assert_eq!(report["status"], "completed");
        assert_eq!(report["target_day"], "2024-03-15");
        assert_eq!(report["stats"]["routes_processed"], 1);
        let run_id = report["run_id"].as_str().unwrap().to_string();

        let run: Value = client
            .get(format!("{base}/api/runs/{run_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(run["status"], "completed");
        assert!(run["duration_ms"].is_u64());

        let audit: Value = client
            .get(format!("{base}/api/runs/{run_id}/audit"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let entries = audit.as_array().unwrap();
        assert!(entries.iter().any(|e| e["stage"] == "route"));
        assert!(entries.iter().all(|e| e["run_id"] == run_id.as_str()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bad_target_day_is_400() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Duration::ZERO).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/runs"))
            .json(&serde_json::json!({"target_day": "2024-02-30"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("2024-02-30"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn overlapping_trigger_is_409() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Duration::from_millis(500)).await;
        let client = reqwest::Client::new();

        let first = {
            let client = client.clone();
            let url = format!("{base}/api/runs");
            tokio::spawn(async move { client.post(url).send().await.unwrap().status() })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let health: Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["run_active"], true);

        let second = client.post(format!("{base}/api/runs")).send().await.unwrap();
        assert_eq!(second.status(), 409);

        assert_eq!(first.await.unwrap(), 200);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_run_is_404() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Duration::ZERO).await;
        let resp = reqwest::get(format!("{base}/api/runs/{}", Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}
