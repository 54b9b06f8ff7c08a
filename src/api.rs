use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    config::{EngineConfig, RequestLimits},
    error::EngineError,
    metrics::MetricsSnapshot,
    models::{
        ExecutionRequest, ExecutionView, PendingResponse, ResultResponse, RunRequest, RunResponse,
    },
    orchestrator::Orchestrator,
};

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    api_tokens: Arc<Vec<Vec<u8>>>,
    default_language: String,
    limits: RequestLimits,
    max_wait: Duration,
}

pub fn routes(config: &EngineConfig, orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState {
        orchestrator,
        api_tokens: Arc::new(
            config
                .api_tokens
                .iter()
                .map(|t| t.as_bytes().to_vec())
                .collect(),
        ),
        default_language: config.default_language.clone(),
        limits: config.limits,
        max_wait: config.max_wait,
    };

    let protected = Router::new()
        .route("/run", post(run_code))
        .route("/result/{exec_id}", get(get_result))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let occupancy = state.orchestrator.occupancy();
    Json(serde_json::json!({
        "ok": true,
        "pending": occupancy.pending,
        "in_progress": occupancy.in_progress,
    }))
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.metrics())
}

async fn run_code(
    State(state): State<AppState>,
    Json(body): Json<RunRequest>,
) -> Result<Json<RunResponse>, EngineError> {
    validate_request(&body, &state.limits)?;
    let language = body
        .language
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| state.default_language.clone());

    let exec_id = state.orchestrator.submit(ExecutionRequest {
        code: body.code,
        inputs: body.inputs,
        language,
    })?;

    Ok(Json(RunResponse {
        exec_id,
        status: "started".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct ResultParams {
    wait_ms: Option<u64>,
}

async fn get_result(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
    Query(params): Query<ResultParams>,
) -> Response {
    // malformed ids cannot have been issued, so they read as unknown
    let view = match Uuid::parse_str(&exec_id) {
        Ok(id) => match params.wait_ms {
            Some(ms) if ms > 0 => {
                let timeout = Duration::from_millis(ms).min(state.max_wait);
                state.orchestrator.wait(&id, timeout).await
            }
            _ => state.orchestrator.query(&id),
        },
        Err(_) => ExecutionView::Unknown,
    };

    match view {
        ExecutionView::Completed { outcome, duration } => (
            StatusCode::OK,
            Json(ResultResponse {
                output: outcome,
                execution_time: duration,
            }),
        )
            .into_response(),
        ExecutionView::Pending | ExecutionView::Unknown => (
            StatusCode::ACCEPTED,
            Json(PendingResponse {
                status: "pending".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, EngineError> {
    authenticate(&state, request.headers())?;
    Ok(next.run(request).await)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<(), EngineError> {
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(EngineError::Unauthorized)?;
    if state
        .api_tokens
        .iter()
        .any(|expected| timing_safe_eq(expected, provided.as_bytes()))
    {
        return Ok(());
    }
    Err(EngineError::Unauthorized)
}

fn validate_request(request: &RunRequest, limits: &RequestLimits) -> Result<(), EngineError> {
    if request.code.trim().is_empty() {
        return Err(EngineError::InvalidRequest("code is empty".to_string()));
    }
    if request.code.len() > limits.max_code_bytes {
        return Err(EngineError::InvalidRequest("code too large".to_string()));
    }
    if request.inputs.len() > limits.max_inputs {
        return Err(EngineError::InvalidRequest(format!(
            "too many inputs; max is {}",
            limits.max_inputs
        )));
    }
    if request
        .inputs
        .iter()
        .any(|input| input.len() > limits.max_input_bytes)
    {
        return Err(EngineError::InvalidRequest("input too large".to_string()));
    }
    Ok(())
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());

    for idx in 0..max {
        let av = *a.get(idx).unwrap_or(&0);
        let bv = *b.get(idx).unwrap_or(&0);
        diff |= av ^ bv;
    }

    diff == 0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::{routes, timing_safe_eq};
    use crate::{
        config::EngineConfig,
        models::{InputResult, InputResults},
        orchestrator::Orchestrator,
        sandbox::{RunSpec, SandboxBackend, SandboxError},
    };

    const TOKEN: &str = "secret-token";

    struct UppercaseSandbox;

    #[async_trait]
    impl SandboxBackend for UppercaseSandbox {
        fn name(&self) -> &'static str {
            "uppercase"
        }

        async fn execute(&self, spec: RunSpec) -> Result<InputResults, SandboxError> {
            Ok(spec
                .inputs
                .into_iter()
                .map(|i| {
                    let upper = i.to_uppercase();
                    (i, InputResult::ok(upper))
                })
                .collect())
        }
    }

    fn app() -> Router {
        let log_dir = std::env::temp_dir()
            .join(format!("coderun-api-test-{}", Uuid::new_v4()))
            .display()
            .to_string();
        let config = EngineConfig::from_lookup(|key| match key {
            "API_TOKEN" => Some(TOKEN.to_string()),
            "LOG_DIR" => Some(log_dir.clone()),
            "MAX_INPUTS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();
        let orchestrator = Arc::new(Orchestrator::start(&config, Arc::new(UppercaseSandbox)));
        routes(&config, orchestrator)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn run_request(token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::post("/run").header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("x-api-key", token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn result_request(token: Option<&str>, path: &str) -> Request<Body> {
        let mut builder = Request::get(path);
        if let Some(token) = token {
            builder = builder.header("x-api-key", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn run_and_poll_result() {
        let app = app();
        let (status, body) = send(
            &app,
            run_request(
                Some(TOKEN),
                json!({ "code": "return input_str.upper()", "inputs": ["ab", "c"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "started");
        let exec_id = body["exec_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            result_request(Some(TOKEN), &format!("/result/{exec_id}?wait_ms=5000")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"]["ab"], json!({ "output": "AB" }));
        assert_eq!(body["output"]["c"], json!({ "output": "C" }));
        assert!(body["execution_time"].as_f64().unwrap() >= 0.0);

        let (status, metrics) = send(&app, result_request(None, "/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(metrics["total_executions"], 1);
        assert_eq!(metrics["successful_executions"], 1);
        assert_eq!(metrics["executions_by_language"]["python"], 1);
        assert!(metrics["execution_times"][exec_id.as_str()].is_number());
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_read_as_pending() {
        let app = app();
        for path in [format!("/result/{}", Uuid::new_v4()), "/result/not-a-uuid".to_string()] {
            let (status, body) = send(&app, result_request(Some(TOKEN), &path)).await;
            assert_eq!(status, StatusCode::ACCEPTED);
            assert_eq!(body, json!({ "status": "pending" }));
        }
    }

    #[tokio::test]
    async fn protected_routes_require_api_key() {
        let app = app();
        let body = json!({ "code": "return 1", "inputs": [] });

        let (status, payload) = send(&app, run_request(None, body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(payload["error"], "Unauthorized");

        let (status, _) = send(&app, run_request(Some("wrong"), body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let path = format!("/result/{}", Uuid::new_v4());
        let (status, _) = send(&app, result_request(None, &path)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, health) = send(&app, result_request(None, "/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["ok"], true);
        assert_eq!(health["pending"], health["in_progress"]);
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let app = app();
        let (status, body) = send(
            &app,
            run_request(Some(TOKEN), json!({ "code": "   ", "inputs": ["1"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid request: code is empty");

        let (status, _) = send(
            &app,
            run_request(
                Some(TOKEN),
                json!({ "code": "return 1", "inputs": ["1", "2", "3", "4"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn explicit_language_is_honoured() {
        let app = app();
        let (_, body) = send(
            &app,
            run_request(
                Some(TOKEN),
                json!({ "code": "return 1", "inputs": ["x"], "language": "brainfuck" }),
            ),
        )
        .await;
        let exec_id = body["exec_id"].as_str().unwrap().to_string();
        let (status, body) = send(
            &app,
            result_request(Some(TOKEN), &format!("/result/{exec_id}?wait_ms=5000")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], json!({ "error": "Unsupported language: brainfuck" }));
    }

    #[test]
    fn timing_safe_eq_compares_full_contents() {
        assert!(timing_safe_eq(b"token", b"token"));
        assert!(!timing_safe_eq(b"token", b"tokem"));
        assert!(!timing_safe_eq(b"token", b"token2"));
        assert!(!timing_safe_eq(b"", b"x"));
    }
}
