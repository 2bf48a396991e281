//! HTTP surface over a `PluginHost`: `GET /status` and `POST /invoke/:func`,
//! mapping pool state and invocation results onto status codes exactly as
//! laid out at the host's interface boundary. Grounded on the pack's axum
//! usage (`Router::new().route(...)`, `impl IntoResponse`, `State<Arc<_>>`)
//! in `golem-worker-gateway`'s integration tests.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use plugin_host::{PluginHost, PoolLifecycle};
use plugin_protocol::{ErrorDetails, PluginDescriptor};
use serde::Serialize;

pub struct AppState {
    pub host: Arc<PluginHost>,
    pub plugin: PluginDescriptor,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/invoke/{func}", post(invoke))
        .with_state(state)
}

#[derive(Serialize)]
struct StatusBody {
    module: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_usage: Option<u64>,
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pool_status = state.host.status().await;

    let (status, code) = match pool_status.lifecycle {
        PoolLifecycle::Ready => ("OK", StatusCode::OK),
        PoolLifecycle::Loading => ("Loading", StatusCode::SERVICE_UNAVAILABLE),
        PoolLifecycle::Failed => ("LoadFailed", StatusCode::INTERNAL_SERVER_ERROR),
        // A closing/closed host should no longer be reachable behind a live
        // listener, but report the same as a load failure rather than panic.
        PoolLifecycle::Closing | PoolLifecycle::Closed => ("LoadFailed", StatusCode::INTERNAL_SERVER_ERROR),
    };

    let function_names = (!pool_status.function_names.is_empty()).then(|| pool_status.function_names.clone());

    let body = StatusBody {
        module: state.plugin.module.clone(),
        status,
        error: pool_status.load_error,
        function_names,
        // Per-process memory introspection isn't tracked by this host; the
        // field is optional at the wire boundary and simply omitted.
        memory_usage: None,
    };

    (code, Json(body))
}

#[derive(Serialize)]
struct InvokeBody {
    module: String,
    #[serde(rename = "functionName")]
    function_name: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetails>,
    logs: Vec<plugin_protocol::LogRecord>,
    fetches: Vec<plugin_protocol::FetchRecord>,
}

async fn invoke(
    State(state): State<Arc<AppState>>,
    Path(func): Path<String>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> impl IntoResponse {
    let args = body.map(|Json(v)| v).unwrap_or(serde_json::Value::Null);
    let call_timeout = parse_timeout_header(&headers);
    let invocation_id = headers
        .get("x-invocation-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match state.host.invoke(&func, args, invocation_id, call_timeout).await {
        Ok(result) => {
            let (status, code) = if result.ok {
                ("OK", StatusCode::OK)
            } else {
                match result.error.as_ref() {
                    Some(ErrorDetails::NotFound { .. }) => ("NotFound", StatusCode::NOT_FOUND),
                    Some(ErrorDetails::InvalidArgument { .. }) => ("InvalidArgument", StatusCode::BAD_REQUEST),
                    Some(ErrorDetails::Runtime { .. })
                    | Some(ErrorDetails::Abort { .. })
                    | Some(ErrorDetails::Terminate { .. }) => ("RuntimeError", StatusCode::INTERNAL_SERVER_ERROR),
                    _ => ("InternalError", StatusCode::INTERNAL_SERVER_ERROR),
                }
            };

            let body = InvokeBody {
                module: state.plugin.module.clone(),
                function_name: func,
                status,
                result: result.value,
                error: result.error,
                logs: result.logs,
                fetches: result.fetches,
            };
            (code, Json(body)).into_response()
        }
        Err(_not_ready_or_shutting_down) => {
            let body = InvokeBody {
                module: state.plugin.module.clone(),
                function_name: func,
                status: "Unavailable",
                result: None,
                error: None,
                logs: vec![],
                fetches: vec![],
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

/// Parses the caller-side `X-Timeout: <milliseconds>` header (spec §6). A
/// missing or malformed header means no caller timeout is applied.
fn parse_timeout_header(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("x-timeout")?.to_str().ok()?;
    let millis: u64 = raw.parse().ok()?;
    Some(Duration::from_millis(millis))
}
