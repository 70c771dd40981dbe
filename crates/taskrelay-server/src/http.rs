//! HTTP routes besides MCP.
//!
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use taskrelay_engine::metrics::collect_metrics;
use taskrelay_engine::{InMemoryMetrics, TaskEngine};

/// Shared state for the observability routes.
#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<TaskEngine>,
    pub counters: Arc<InMemoryMetrics>,
}

/// Create the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let body = collect_metrics(&state.engine, Some(&state.counters));
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::to_bytes;
    use serde_json::{json, Value};
    use taskrelay_core::{Engine, TaskType};
    use taskrelay_engine::{
        CreateTaskRequest, DispatchError, DispatchRequest, EngineConfig, EngineExecutor,
    };

    struct OkExecutor;

    #[async_trait]
    impl EngineExecutor for OkExecutor {
        async fn dispatch(&self, _request: DispatchRequest) -> Result<Value, DispatchError> {
            Ok(json!({ "ok": true }))
        }
    }

    #[tokio::test]
    async fn test_metrics_include_counters() {
        let counters = Arc::new(InMemoryMetrics::new());
        let engine = Arc::new(TaskEngine::with_metrics(
            EngineConfig::default(),
            Arc::new(OkExecutor),
            counters.clone(),
        ));
        let created = engine
            .create_task(
                CreateTaskRequest::new(TaskType::Analysis, json!({ "prompt": "p" }))
                    .with_engine(Engine::Gemini),
            )
            .unwrap();
        engine.run_task(&created.task_id).await.unwrap();

        let response = metrics_handler(State(HttpState { engine, counters }))
            .await
            .into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("taskrelay_tasks_total{status=\"succeeded\"} 1"));
        assert!(text.contains("taskrelay_runs_total{engine=\"gemini\",outcome=\"succeeded\"} 1"));
    }
}
