//! HTTP trigger and run inspection endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::error::TriggerError;
use crate::trigger::RunTrigger;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<RunTrigger>,
}

/// Build the Axum router for the intake service.
pub fn intake_routes(trigger: Arc<RunTrigger>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/runs", post(start_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/audit", get(get_run_audit))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { trigger })
}

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    target_day: Option<String>,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "candidate-intake",
        "run_active": state.trigger.is_running(),
    }))
}

// ── Runs ────────────────────────────────────────────────────────────────

/// Body is optional; `{}` and an empty body both mean "yesterday".
async fn start_run(State(state): State<AppState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        match serde_json::from_slice::<RunRequest>(&body) {
            Ok(r) => r,
            Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("Invalid request body: {e}")),
        }
    };

    let day = match state.trigger.resolve_day(request.target_day.as_deref()) {
        Ok(day) => day,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match state.trigger.trigger(Some(day)).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))).into_response(),
        Err(TriggerError::Busy) => error_body(StatusCode::CONFLICT, "A run is already in progress"),
        Err(TriggerError::InvalidDay(d)) => error_body(StatusCode::BAD_REQUEST, d),
        Err(TriggerError::Infrastructure(e)) => {
            error!(error = %e, "Run could not start");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_body(StatusCode::BAD_REQUEST, "Invalid run ID");
    };
    match state.trigger.store().get_run(id).await {
        Ok(Some(run)) => (StatusCode::OK, Json(json!(run))).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Run not found"),
        Err(e) => {
            error!(run_id = %id, error = %e, "Run lookup failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn get_run_audit(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_body(StatusCode::BAD_REQUEST, "Invalid run ID");
    };
    let store = state.trigger.store();
    match store.get_run(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, "Run not found"),
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
    match store.list_audit(id).await {
        Ok(entries) => (StatusCode::OK, Json(json!(entries))).into_response(),
        Err(e) => {
            error!(run_id = %id, error = %e, "Audit lookup failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::PipelineConfig;
    use crate::error::{ExtractionError, MailError};
    use crate::extraction::{DocumentInput, ExtractionAdapter, ExtractionBackend};
    use crate::mail::{FetchedMessage, MailSource, MessageSummary};
    use crate::pipeline::RunCoordinator;
    use crate::pipeline::calendar::{DayWindow, south_africa_offset};
    use crate::store::{IntakeStore, LibSqlBackend, TenantRoute};

    struct QuietMail;

    #[async_trait]
    impl MailSource for QuietMail {
        fn name(&self) -> &str {
            "quiet"
        }
        async fn list_messages(&self, _: &TenantRoute, _: &DayWindow) -> Result<Vec<MessageSummary>, MailError> {
            Ok(vec![])
        }
        async fn get_message(&self, _: &TenantRoute, id: &str) -> Result<FetchedMessage, MailError> {
            Err(MailError::MessageNotFound(id.into()))
        }
        async fn get_attachment(&self, _: &TenantRoute, m: &str, a: &str) -> Result<Vec<u8>, MailError> {
            Err(MailError::AttachmentNotFound {
                message_id: m.into(),
                attachment_id: a.into(),
            })
        }
    }

    struct NullExtractor;

    #[async_trait]
    impl ExtractionBackend for NullExtractor {
        fn name(&self) -> &str {
            "null"
        }
        async fn extract(&self, _: &DocumentInput) -> Result<String, ExtractionError> {
            Ok("{}".into())
        }
    }

    async fn app() -> Router {
        let store: Arc<dyn IntakeStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let coordinator = RunCoordinator::new(
            store,
            Arc::new(QuietMail),
            ExtractionAdapter::new(Arc::new(NullExtractor)),
            &PipelineConfig::default(),
        );
        intake_routes(Arc::new(RunTrigger::new(Arc::new(coordinator), south_africa_offset())))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_runs(body: &'static str) -> Request<Body> {
        Request::post("/api/runs")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_idle() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["run_active"], false);
    }

    #[tokio::test]
    async fn empty_body_runs_default_day() {
        let response = app().await.oneshot(post_runs("")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
        assert!(body["run_id"].is_string());
    }

    #[tokio::test]
    async fn explicit_day_is_used() {
        let response = app()
            .await
            .oneshot(post_runs(r#"{"target_day": "2024-03-15"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["target_day"], "2024-03-15");
    }

    #[tokio::test]
    async fn bad_day_is_rejected() {
        let response = app()
            .await
            .oneshot(post_runs(r#"{"target_day": "yesterday"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app().await.oneshot(post_runs("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn run_lookup_errors() {
        let router = app().await;
        let bad = router
            .clone()
            .oneshot(Request::get("/api/runs/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing = router
            .oneshot(
                Request::get(format!("/api/runs/{}/audit", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
