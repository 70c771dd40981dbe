//! MCP (Model Context Protocol) server implementation.
//!
//! Provides MCP tools for the task lifecycle:
//! - `create_task` - Validate, compress and store a task
//! - `run_task` - Execute a task on an admitted engine
//! - `get_task_result` - Task status, result or error
//! - `list_tasks` - Tasks filtered by type, status and engine
//! - `delete_task` - Remove a task
//! - `engine_status` - Circuit breaker and coalescer statistics
//!
//! Tool failures are returned as error results carrying a JSON body with a
//! stable `code`, never as protocol errors.

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, SecondsFormat, Utc};
use rmcp::{
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    },
    ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use taskrelay_core::{
    CoreError, Engine, EngineChoice, OriginContext, Task, TaskId, TaskStatus, TaskType,
};
use taskrelay_engine::{
    BreakerStats, CoalescerStats, CreateTaskRequest, EngineError, TaskEngine, TaskFilter,
};

/// Client name recorded when the caller does not identify itself.
const DEFAULT_ORIGIN_CLIENT: &str = "mcp";

/// MCP server for TaskRelay operations.
#[derive(Clone)]
pub struct TaskRelayMcpServer {
    engine: Arc<TaskEngine>,
    tool_router: rmcp::handler::server::router::tool::ToolRouter<Self>,
}

// ============================================================================
// Tool Parameter Types
// ============================================================================

/// Parameters for create_task tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateTaskParams {
    /// Task type: web_search, code_review, code_generation, analysis or custom.
    #[serde(rename = "type")]
    pub task_type: String,

    /// Task payload (JSON object). `prompt`, `description` and `max_tokens`
    /// feed engine selection.
    pub payload: Value,

    /// Engine name, or "auto" (default) to let the analyzer choose.
    #[serde(default)]
    pub engine: Option<String>,

    /// Priority from 1 (lowest) to 10 (highest). Defaults to 5.
    #[serde(default)]
    pub priority: Option<u8>,

    /// Hours until the task expires. Clamped to 1..=168, default 24.
    #[serde(default)]
    pub ttl_hours: Option<u32>,

    /// Name of the calling client.
    #[serde(default)]
    pub origin_client: Option<String>,

    /// Clients that delegated this request, outermost first.
    #[serde(default)]
    pub call_chain: Option<Vec<String>>,
}

/// Parameters for tools addressing a single task.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct TaskIdParams {
    /// Task ID.
    pub task_id: String,
}

/// Parameters for list_tasks tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct ListTasksParams {
    /// Only tasks of this type.
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,

    /// Only tasks with this status (expired tasks report "expired").
    #[serde(default)]
    pub status: Option<String>,

    /// Only tasks on this engine (resolved, else estimated).
    #[serde(default)]
    pub engine: Option<String>,

    /// Maximum number of tasks returned, newest first.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Parameters for engine_status tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct EngineStatusParams {
    /// Only this engine's breaker.
    #[serde(default)]
    pub engine: Option<String>,
}

// ============================================================================
// Response Types
// ============================================================================

/// Result of creating a task.
#[derive(Debug, Serialize)]
pub struct CreateTaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub estimated_engine: Option<Engine>,
    pub expires_at: String,
    pub payload_size_bytes: usize,
    pub compression_ratio: f64,
}

/// Task details returned by run_task, get_task_result and list_tasks.
#[derive(Debug, Serialize)]
pub struct TaskDetails {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub engine: Option<Engine>,
    pub priority: u8,
    pub attempts: u32,
    pub created_at: String,
    pub expires_at: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,

    pub origin_client: String,
    pub delegation_depth: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Task> for TaskDetails {
    fn from(task: Task) -> Self {
        let engine = task.engine();
        Self {
            task_id: task.id.into_inner(),
            task_type: task.task_type,
            status: task.status,
            engine,
            priority: task.priority,
            attempts: task.attempts,
            created_at: rfc3339(task.created_at),
            expires_at: rfc3339(task.expires_at),
            started_at: task.started_at.map(rfc3339),
            finished_at: task.finished_at.map(rfc3339),
            origin_client: task.origin.origin_client,
            delegation_depth: task.origin.depth,
            result: task.result,
            error: task.error,
        }
    }
}

/// Result of engine_status.
#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub breakers: Vec<BreakerStats>,
    pub coalescer: CoalescerStats,
}

// ============================================================================
// Tool Implementations
// ============================================================================

#[tool_router]
impl TaskRelayMcpServer {
    /// Create a new MCP server backed by `engine`.
    pub fn new(engine: Arc<TaskEngine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    /// Create a task without running it.
    #[tool(description = "Create a task for later execution. Requires a task type and a JSON object payload. Engine defaults to auto.")]
    async fn create_task(
        &self,
        Parameters(params): Parameters<CreateTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.do_create_task(params)))
    }

    /// Execute a task.
    #[tool(description = "Execute a pending or failed task on an available engine and return the finished task.")]
    async fn run_task(
        &self,
        Parameters(params): Parameters<TaskIdParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.do_run_task(params).await))
    }

    /// Get a task's status and result.
    #[tool(description = "Get a task's status, result or error. Expired tasks report status expired.")]
    async fn get_task_result(
        &self,
        Parameters(params): Parameters<TaskIdParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.do_get_task_result(params)))
    }

    /// List tasks.
    #[tool(description = "List tasks, newest first. Optionally filter by type, status and engine, and limit the count.")]
    async fn list_tasks(
        &self,
        Parameters(params): Parameters<ListTasksParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.do_list_tasks(params)))
    }

    /// Delete a task.
    #[tool(description = "Delete a task by ID. Reports deleted=false when no such task exists.")]
    async fn delete_task(
        &self,
        Parameters(params): Parameters<TaskIdParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.do_delete_task(params)))
    }

    /// Report breaker and coalescer state.
    #[tool(description = "Show circuit breaker state per engine and request coalescing statistics.")]
    async fn engine_status(
        &self,
        Parameters(params): Parameters<EngineStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        Ok(respond(self.do_engine_status(params)))
    }
}

impl TaskRelayMcpServer {
    fn do_create_task(&self, params: CreateTaskParams) -> Result<CreateTaskResult, EngineError> {
        let task_type: TaskType = params.task_type.parse().map_err(EngineError::from)?;
        let engine: EngineChoice = params
            .engine
            .as_deref()
            .unwrap_or("auto")
            .parse()
            .map_err(EngineError::from)?;

        let client = params
            .origin_client
            .unwrap_or_else(|| DEFAULT_ORIGIN_CLIENT.to_string());
        let origin = OriginContext::from_chain(client, params.call_chain.unwrap_or_default());

        let mut request = CreateTaskRequest::new(task_type, params.payload)
            .with_engine(engine)
            .with_origin(origin);
        request.priority = params.priority;
        request.ttl_hours = params.ttl_hours;

        let created = self.engine.create_task(request)?;
        info!(task_id = %created.task_id, "Created task via MCP");

        Ok(CreateTaskResult {
            task_id: created.task_id.into_inner(),
            status: created.status,
            estimated_engine: created.estimated_engine,
            expires_at: rfc3339(created.expires_at),
            payload_size_bytes: created.payload_size_bytes,
            compression_ratio: created.compression_ratio,
        })
    }

    async fn do_run_task(&self, params: TaskIdParams) -> Result<TaskDetails, EngineError> {
        let task = self.engine.run_task(&TaskId::new(params.task_id)).await?;
        Ok(task.into())
    }

    fn do_get_task_result(&self, params: TaskIdParams) -> Result<TaskDetails, EngineError> {
        let task = self.engine.get_task_result(&TaskId::new(params.task_id))?;
        Ok(task.into())
    }

    fn do_list_tasks(&self, params: ListTasksParams) -> Result<Vec<TaskDetails>, EngineError> {
        let filter = TaskFilter {
            task_type: parse_opt::<TaskType>(params.task_type.as_deref())?,
            status: parse_opt::<TaskStatus>(params.status.as_deref())?,
            engine: parse_opt::<Engine>(params.engine.as_deref())?,
            limit: params.limit,
        };
        Ok(self
            .engine
            .list_tasks(&filter)
            .into_iter()
            .map(TaskDetails::from)
            .collect())
    }

    fn do_delete_task(&self, params: TaskIdParams) -> Result<Value, EngineError> {
        let task_id = TaskId::new(params.task_id);
        let deleted = self.engine.delete_task(&task_id);
        Ok(json!({ "task_id": task_id, "deleted": deleted }))
    }

    fn do_engine_status(&self, params: EngineStatusParams) -> Result<EngineStatus, EngineError> {
        let only = parse_opt::<Engine>(params.engine.as_deref())?;
        let breakers = self
            .engine
            .breaker_stats()
            .into_iter()
            .filter(|s| only.map_or(true, |e| s.engine == e))
            .collect();
        Ok(EngineStatus {
            breakers,
            coalescer: self.engine.coalescer_stats(),
        })
    }
}

// ============================================================================
// Server Handler Implementation
// ============================================================================

#[tool_handler]
impl ServerHandler for TaskRelayMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation {
                name: "taskrelay-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "TaskRelay MCP Server - Run tasks on AI engines with circuit breaking \
                 and request coalescing. Use create_task then run_task, and \
                 get_task_result to read results later."
                    .to_string(),
            ),
        }
    }
}

// ============================================================================
// HTTP Server Setup
// ============================================================================

/// Create an axum Router serving MCP at `/mcp` over Streamable HTTP.
pub fn create_mcp_router(engine: Arc<TaskEngine>, ct: CancellationToken) -> Router {
    let service = StreamableHttpService::new(
        move || Ok(TaskRelayMcpServer::new(engine.clone())),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig {
            cancellation_token: ct,
            ..Default::default()
        },
    );

    info!("MCP server initialized with Streamable HTTP transport");

    Router::new().nest_service("/mcp", service)
}

// ============================================================================
// Helpers
// ============================================================================

fn respond<T: Serialize>(result: Result<T, EngineError>) -> CallToolResult {
    match result {
        Ok(value) => {
            let body = serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
            CallToolResult::success(vec![Content::text(body)])
        }
        Err(err) => CallToolResult::error(vec![Content::text(error_body(&err).to_string())]),
    }
}

/// JSON error body: `{"error": {"code", "message", "retry_after_ms"?}}`.
fn error_body(err: &EngineError) -> Value {
    let mut error = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    if let Some(retry_after) = err.retry_after() {
        error["retry_after_ms"] = json!(retry_after.as_millis() as u64);
    }
    json!({ "error": error })
}

fn parse_opt<T>(value: Option<&str>) -> Result<Option<T>, EngineError>
where
    T: std::str::FromStr<Err = CoreError>,
{
    value
        .filter(|v| !v.is_empty())
        .map(str::parse)
        .transpose()
        .map_err(EngineError::from)
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use taskrelay_engine::{DispatchError, DispatchRequest, EngineConfig, EngineExecutor};

    struct EchoExecutor;

    #[async_trait]
    impl EngineExecutor for EchoExecutor {
        async fn dispatch(&self, request: DispatchRequest) -> Result<Value, DispatchError> {
            if request.payload.get("fail").is_some() {
                return Err(DispatchError::new("engine refused"));
            }
            Ok(json!({ "engine": request.engine, "echo": request.payload }))
        }
    }

    fn server() -> TaskRelayMcpServer {
        TaskRelayMcpServer::new(Arc::new(TaskEngine::new(
            EngineConfig::default(),
            Arc::new(EchoExecutor),
        )))
    }

    fn create(task_type: &str, payload: Value, engine: Option<&str>) -> CreateTaskParams {
        CreateTaskParams {
            task_type: task_type.to_string(),
            payload,
            engine: engine.map(str::to_string),
            priority: None,
            ttl_hours: None,
            origin_client: None,
            call_chain: None,
        }
    }

    fn id(task_id: &str) -> TaskIdParams {
        TaskIdParams {
            task_id: task_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_run_and_fetch() {
        let server = server();
        let created = server
            .do_create_task(create("code_review", json!({ "prompt": "check this" }), Some("claude")))
            .unwrap();
        assert_eq!(created.status, TaskStatus::Pending);
        assert_eq!(created.estimated_engine, Some(Engine::Claude));
        assert!(created.expires_at.ends_with('Z'));

        let ran = server.do_run_task(id(&created.task_id)).await.unwrap();
        assert_eq!(ran.status, TaskStatus::Succeeded);
        assert_eq!(ran.result.unwrap()["echo"]["prompt"], json!("check this"));

        let fetched = server.do_get_task_result(id(&created.task_id)).unwrap();
        assert_eq!(fetched.status, TaskStatus::Succeeded);
        assert_eq!(fetched.origin_client, "mcp");
        assert_eq!(fetched.attempts, 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_validation_errors() {
        let server = server();

        let err = server
            .do_create_task(create("translation", json!({}), None))
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = server
            .do_create_task(create("analysis", json!({}), Some("gpt")))
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = server
            .do_list_tasks(ListTasksParams {
                status: Some("paused".to_string()),
                ..ListTasksParams::default()
            })
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_call_chain_sets_depth() {
        let server = server();
        let mut params = create("custom", json!({ "prompt": "hi" }), Some("grok"));
        params.origin_client = Some("agent-d".to_string());
        params.call_chain = Some(vec![
            "agent-a".to_string(),
            "agent-b".to_string(),
            "agent-c".to_string(),
            "agent-x".to_string(),
        ]);

        let err = server.do_create_task(params).err().unwrap();
        assert_eq!(err, EngineError::DelegationDepthExceeded { depth: 4, max: 3 });
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let server = server();
        let a = server
            .do_create_task(create("web_search", json!({ "query": "x" }), Some("gemini")))
            .unwrap();
        server
            .do_create_task(create("analysis", json!({ "prompt": "y" }), Some("glm")))
            .unwrap();

        let listed = server
            .do_list_tasks(ListTasksParams {
                engine: Some("gemini".to_string()),
                ..ListTasksParams::default()
            })
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, a.task_id);

        let all = server.do_list_tasks(ListTasksParams::default()).unwrap();
        assert_eq!(all.len(), 2);

        let first = server.do_delete_task(id(&a.task_id)).unwrap();
        assert_eq!(first["deleted"], json!(true));
        let again = server.do_delete_task(id(&a.task_id)).unwrap();
        assert_eq!(again["deleted"], json!(false));
    }

    #[tokio::test]
    async fn test_engine_status_filters_by_engine() {
        let server = server();
        server.engine.force_open(Engine::Codex);

        let status = server
            .do_engine_status(EngineStatusParams {
                engine: Some("codex".to_string()),
            })
            .unwrap();
        assert_eq!(status.breakers.len(), 1);
        assert_eq!(status.breakers[0].engine, Engine::Codex);

        let all = server.do_engine_status(EngineStatusParams::default()).unwrap();
        assert_eq!(all.breakers.len(), Engine::ALL.len());
    }

    #[test]
    fn test_error_body() {
        let body = error_body(&EngineError::CircuitOpen {
            engine: Engine::Grok,
            retry_after: Duration::from_millis(1500),
        });
        assert_eq!(body["error"]["code"], json!("CIRCUIT_OPEN"));
        assert_eq!(body["error"]["retry_after_ms"], json!(1500));

        let body = error_body(&EngineError::TaskNotFound(TaskId::new("task_x")));
        assert_eq!(body["error"]["code"], json!("TASK_NOT_FOUND"));
        assert!(body["error"].get("retry_after_ms").is_none());
    }

    #[tokio::test]
    async fn test_failed_run_reports_engine_error() {
        let server = server();
        let created = server
            .do_create_task(create("custom", json!({ "prompt": "x", "fail": true }), Some("codex")))
            .unwrap();

        let err = server.do_run_task(id(&created.task_id)).await.err().unwrap();
        assert_eq!(err.code(), "ENGINE_EXECUTION_ERROR");

        let fetched = server.do_get_task_result(id(&created.task_id)).unwrap();
        assert_eq!(fetched.status, TaskStatus::Failed);
        assert!(fetched.error.unwrap().contains("engine refused"));
    }
}
