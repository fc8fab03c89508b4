//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post, put},
};
use serde::Serialize;

use crate::health::{Health, SetupResult};
use crate::probes::ProbeHelper;
use crate::runner::{PredictionRequest, Runner, RunnerError};
use crate::validation::InputValidator;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
    pub validator: Option<Arc<InputValidator>>,
    pub probes: Arc<ProbeHelper>,
}

impl AppState {
    pub fn new(runner: Arc<Runner>, validator: Option<InputValidator>, probes: ProbeHelper) -> Self {
        Self {
            runner,
            validator: validator.map(Arc::new),
            probes: Arc::new(probes),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthCheckResponse {
    status: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<SetupResult>,
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "augur",
        "version": env!("CARGO_PKG_VERSION"),
        "health_check_url": "/health-check",
    }))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.runner.health();

    if matches!(snapshot.status, Health::Ready | Health::Busy) {
        state.probes.ready();
    }

    Json(HealthCheckResponse {
        status: snapshot.status,
        setup: snapshot.setup,
    })
}

fn should_respond_async(headers: &HeaderMap) -> bool {
    headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "respond-async")
        .unwrap_or(false)
}

async fn create_prediction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<PredictionRequest>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let respond_async = should_respond_async(&headers);
    handle_prediction(state, request, respond_async).await
}

async fn create_prediction_idempotent(
    State(state): State<AppState>,
    Path(prediction_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<PredictionRequest>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut request = body.map(|Json(r)| r).unwrap_or_default();

    if let Some(ref body_id) = request.id
        && body_id != &prediction_id
    {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "detail": [{
                    "loc": ["body", "id"],
                    "msg": "prediction ID must match the ID supplied in the URL",
                    "type": "value_error"
                }]
            })),
        );
    }
    request.id = Some(prediction_id);

    let respond_async = should_respond_async(&headers);
    handle_prediction(state, request, respond_async).await
}

async fn handle_prediction(
    state: AppState,
    request: PredictionRequest,
    respond_async: bool,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Some(ref validator) = state.validator
        && let Err(errors) = validator.validate(&request.input)
    {
        let detail: Vec<serde_json::Value> = errors.iter().map(|e| e.to_detail()).collect();
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "detail": detail })),
        );
    }

    let handle = match state.runner.predict(request) {
        Ok(handle) => handle,
        Err(RunnerError::Busy { running_id }) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "detail": format!("already running a prediction: {running_id}")
                })),
            );
        }
        Err(e @ (RunnerError::NotReady | RunnerError::SetupFailed | RunnerError::Defunct)) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": e.to_string(),
                    "status": "failed"
                })),
            );
        }
    };

    if respond_async {
        return (StatusCode::ACCEPTED, Json(handle.document()));
    }

    // Sync mode: a dropped connection cancels the prediction, but the
    // slot stays alive until the worker acknowledges.
    let mut guard = CancelOnDisconnect::new(Arc::clone(&state.runner), handle.id().to_string());
    handle.wait().await;
    guard.disarm();

    // A fatal worker error mid-request surfaces as a 500-class response;
    // everything else (including failed and canceled predictions) is the
    // terminal document with 200.
    let document = handle.document();
    if state.runner.health().status == Health::Defunct {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(document));
    }
    (StatusCode::OK, Json(document))
}

/// Cancels the prediction if the response future is dropped before the
/// prediction finished (client disconnect in sync mode).
struct CancelOnDisconnect {
    runner: Arc<Runner>,
    prediction_id: Option<String>,
}

impl CancelOnDisconnect {
    fn new(runner: Arc<Runner>, prediction_id: String) -> Self {
        Self {
            runner,
            prediction_id: Some(prediction_id),
        }
    }

    fn disarm(&mut self) {
        self.prediction_id = None;
    }
}

impl Drop for CancelOnDisconnect {
    fn drop(&mut self) {
        if let Some(ref id) = self.prediction_id {
            tracing::info!(prediction_id = %id, "Client disconnected, cancelling");
            self.runner.cancel(id);
        }
    }
}

async fn cancel_prediction(
    State(state): State<AppState>,
    Path(prediction_id): Path<String>,
) -> impl IntoResponse {
    if state.runner.cancel(&prediction_id) {
        (StatusCode::OK, Json(serde_json::json!({})))
    } else {
        (StatusCode::NOT_FOUND, Json(serde_json::json!({})))
    }
}

async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    state.runner.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/predictions", post(create_prediction))
        .route("/predictions/{id}", put(create_prediction_idempotent))
        .route("/predictions/{id}/cancel", post(cancel_prediction))
        .with_state(state)
}
