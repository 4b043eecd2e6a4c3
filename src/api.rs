use std::sync::Arc;

use axum::Router;
use axum::extract::{Json, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::error::MenderError;
use crate::llm::LlmClient;
use crate::memory::Memory;
use crate::protocol::{
    ClearResponse, EpisodesResponse, FeedbackRequest, FeedbackResponse, ProcessRequest,
    StrategiesResponse,
};
use crate::workflow::WorkflowEngine;

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub memory: Arc<Memory>,
    pub llm: Arc<dyn LlmClient>,
}

/* ============================= ROUTER ============================= */

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/process-with-k8s-data", post(process_handler))
        .route("/execution-feedback", post(feedback_handler))
        .route(
            "/memory/strategies",
            get(strategies_handler).delete(clear_strategies_handler),
        )
        .route(
            "/memory/episodes",
            get(episodes_handler).delete(clear_episodes_handler),
        )
        .route("/memory/performance", get(performance_handler))
        .route("/memory/statistics", get(statistics_handler))
        .route("/memory/clear", delete(clear_all_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .with_state(state)
}

/// Client mistakes get a message; everything else stays generic so prompt
/// contents and internals never leak through the HTTP surface.
fn error_response(e: MenderError) -> (StatusCode, axum::Json<serde_json::Value>) {
    match e {
        MenderError::Permanent(msg) => {
            info!(error = %msg, "request_rejected");
            (StatusCode::BAD_REQUEST, Json(json!({"error": msg})))
        }
        other => {
            error!(error = %other, "request_failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        }
    }
}

/* ============================= WORKFLOW HANDLERS ============================= */

async fn process_handler(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> impl IntoResponse {
    match state.engine.process(request).await {
        Ok(response) => (
            StatusCode::OK,
            Json(serde_json::to_value(&response).unwrap_or_default()),
        ),
        Err(e) => error_response(e),
    }
}

async fn feedback_handler(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> impl IntoResponse {
    let workflow_id = request.workflow_id.clone();
    match state.engine.feedback(request).await {
        Ok(()) => (
            StatusCode::OK,
            Json(
                serde_json::to_value(FeedbackResponse {
                    ok: true,
                    workflow_id,
                })
                .unwrap_or_default(),
            ),
        ),
        Err(e) => error_response(e),
    }
}

/* ============================= MEMORY HANDLERS ============================= */

#[derive(Deserialize)]
struct EpisodesQuery {
    #[serde(default = "default_episode_limit")]
    limit: usize,
}

fn default_episode_limit() -> usize {
    50
}

#[derive(Deserialize)]
struct PerformanceQuery {
    #[serde(default = "default_performance_days")]
    days: u32,
}

fn default_performance_days() -> u32 {
    7
}

async fn strategies_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.memory.all_strategies() {
        Ok(strategies) => {
            let total_count = strategies.len();
            let strategies = strategies
                .iter()
                .map(|s| serde_json::to_value(s).unwrap_or_default())
                .collect();
            (
                StatusCode::OK,
                Json(
                    serde_json::to_value(StrategiesResponse {
                        strategies,
                        total_count,
                    })
                    .unwrap_or_default(),
                ),
            )
        }
        Err(e) => error_response(e),
    }
}

async fn episodes_handler(
    State(state): State<AppState>,
    Query(query): Query<EpisodesQuery>,
) -> impl IntoResponse {
    let result = state.memory.recent_episodes(query.limit).and_then(|episodes| {
        Ok(EpisodesResponse {
            episodes: episodes
                .iter()
                .map(|e| serde_json::to_value(e).unwrap_or_default())
                .collect(),
            total_episodes: state.memory.episode_count()?,
            memory_utilization: state.memory.utilization()?,
        })
    });

    match result {
        Ok(response) => (
            StatusCode::OK,
            Json(serde_json::to_value(response).unwrap_or_default()),
        ),
        Err(e) => error_response(e),
    }
}

async fn performance_handler(
    State(state): State<AppState>,
    Query(query): Query<PerformanceQuery>,
) -> impl IntoResponse {
    match state.memory.performance_since(query.days) {
        Ok(rows) => (
            StatusCode::OK,
            Json(json!({"days": query.days, "rows": rows})),
        ),
        Err(e) => error_response(e),
    }
}

async fn statistics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.memory.statistics() {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::to_value(stats).unwrap_or_default()),
        ),
        Err(e) => error_response(e),
    }
}

async fn clear_all_handler(State(state): State<AppState>) -> impl IntoResponse {
    clear_response(state.memory.clear_all())
}

async fn clear_strategies_handler(State(state): State<AppState>) -> impl IntoResponse {
    clear_response(state.memory.clear_strategies())
}

async fn clear_episodes_handler(State(state): State<AppState>) -> impl IntoResponse {
    clear_response(state.memory.clear_episodes())
}

fn clear_response(
    result: crate::error::Result<usize>,
) -> (StatusCode, axum::Json<serde_json::Value>) {
    match result {
        Ok(removed) => {
            info!(removed, "memory_cleared");
            (
                StatusCode::OK,
                Json(serde_json::to_value(ClearResponse { ok: true, removed }).unwrap_or_default()),
            )
        }
        Err(e) => error_response(e),
    }
}

/* ============================= HEALTH ============================= */

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let storage = state.memory.healthy();
    let llm = state.llm.healthy().await;
    let open_workflows = state.engine.open_count().await;

    let healthy = storage && llm;
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "storage": storage,
        "llm": llm,
        "llm_model": state.llm.model(),
        "open_workflows": open_workflows,
    });

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::diagnostics::DiagnosticAdapter;
    use crate::llm::ScriptedLlm;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    const CANNED: &str = r#"{"fix_commands": ["kubectl delete pod web-1 -n default"],
        "validation_commands": ["kubectl get pod web-1 -n default"],
        "approach": "recreate the pod",
        "reflection": "fine",
        "lessons": ["recreate works"]}"#;

    fn test_state() -> AppState {
        let cfg = Config {
            exploration_rate: 0.0,
            ..Config::default()
        };
        let memory = Arc::new(Memory::open_in_memory(&cfg).unwrap());
        let llm = ScriptedLlm::repeating(CANNED);
        let engine = Arc::new(WorkflowEngine::new(
            memory.clone(),
            llm.clone(),
            DiagnosticAdapter::new(None, Duration::from_secs(2)),
            cfg,
        ));
        AppState {
            engine,
            memory,
            llm,
        }
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = build_router(test_state());
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_dependencies() {
        let app = build_router(test_state());
        let (status, body) = send(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage"], true);
        assert_eq!(body["llm"], true);
    }

    #[tokio::test]
    async fn test_process_rejects_missing_fields() {
        let app = build_router(test_state());
        let (status, body) = send(
            app,
            "POST",
            "/process-with-k8s-data",
            Some(serde_json::json!({
                "pod_name": "", "namespace": "default",
                "error_type": "crash-loop", "real_k8s_data": {}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("required"));
    }

    #[tokio::test]
    async fn test_process_then_feedback_roundtrip() {
        let state = test_state();
        let app = build_router(state.clone());

        let (status, body) = send(
            app.clone(),
            "POST",
            "/process-with-k8s-data",
            Some(serde_json::json!({
                "pod_name": "web-1", "namespace": "default", "pod_uid": "u1",
                "error_type": "image-pull-failure", "real_k8s_data": {}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let workflow_id = body["workflow_id"].as_str().unwrap().to_string();
        assert!(body["plan"]["fix_commands"].as_array().unwrap().len() == 1);
        assert_eq!(body["requires_human_intervention"], false);

        let (status, body) = send(
            app,
            "POST",
            "/execution-feedback",
            Some(serde_json::json!({
                "workflow_id": workflow_id,
                "pod_name": "web-1", "namespace": "default",
                "error_type": "image-pull-failure", "strategy_used": "llm-only",
                "execution_result": {
                    "success": true, "partial_success": false,
                    "total_commands": 2, "success_count": 2, "failure_count": 0,
                    "status": "success", "commands": []
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        assert_eq!(state.memory.episode_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_feedback_unknown_workflow_is_client_error() {
        let app = build_router(test_state());
        let (status, _) = send(
            app,
            "POST",
            "/execution-feedback",
            Some(serde_json::json!({
                "workflow_id": "missing",
                "pod_name": "web-1", "namespace": "default",
                "error_type": "crash-loop", "strategy_used": "llm-only",
                "execution_result": {
                    "success": false, "partial_success": false,
                    "total_commands": 0, "success_count": 0, "failure_count": 0,
                    "status": "failure", "commands": []
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_memory_endpoints_empty_then_cleared() {
        let state = test_state();
        state.memory.seed_defaults().unwrap();
        let app = build_router(state.clone());

        let (status, body) = send(app.clone(), "GET", "/memory/strategies", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["total_count"].as_u64().unwrap() >= 5);

        let (status, body) = send(app.clone(), "DELETE", "/memory/clear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let (_, body) = send(app.clone(), "GET", "/memory/strategies", None).await;
        assert_eq!(body["total_count"], 0);

        let (_, body) = send(app, "GET", "/memory/episodes?limit=10", None).await;
        assert_eq!(body["total_episodes"], 0);
        assert_eq!(body["memory_utilization"], 0.0);
    }

    #[tokio::test]
    async fn test_statistics_endpoint_shape() {
        let app = build_router(test_state());
        let (status, body) = send(app, "GET", "/memory/statistics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("strategy_count").is_some());
        assert!(body.get("episode_count").is_some());
        assert!(body.get("categories").is_some());
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let app = build_router(test_state());
        let (status, _) = send(app, "GET", "/nonexistent", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
