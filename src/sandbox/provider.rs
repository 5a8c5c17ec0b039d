use async_trait::async_trait;
use axum::http::{HeaderMap, Method, header};
use serde::{Deserialize, Serialize};

use super::agent_client::AgentRuntimeClient;
use super::error::SandboxError;
use super::types::{CreateSandboxRequest, ProviderInfo, SandboxRecord};

/// Factory and lifecycle manager for sandboxes on one backend.
///
/// One provider instance per backend kind lives in the registry. The
/// contract is uniform across backends:
///
/// - `create_sandbox` is not idempotent — callers check non-existence
///   first; on partial provisioning failure the provider rolls back
///   whatever it created before returning the error.
/// - `start`/`stop`/`delete` return once the backend acknowledges the
///   transition, not necessarily after full convergence. Some backends
///   treat `stop` as a no-op (auto-hibernation); callers that need the
///   converged state must poll `get_sandbox`.
/// - `get_sandbox` returns `Ok(None)` for a missing sandbox, never an
///   error.
/// - `health_check` never fails — probe errors and timeouts degrade to
///   `false`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Metadata about this provider (backend kind, capability flags).
    fn info(&self) -> ProviderInfo;

    async fn create_sandbox(&self, req: CreateSandboxRequest)
    -> Result<SandboxRecord, SandboxError>;

    async fn start_sandbox(&self, id: &str) -> Result<(), SandboxError>;

    async fn stop_sandbox(&self, id: &str) -> Result<(), SandboxError>;

    async fn delete_sandbox(&self, id: &str) -> Result<(), SandboxError>;

    async fn get_sandbox(&self, id: &str) -> Result<Option<SandboxRecord>, SandboxError>;

    async fn list_sandboxes(&self, owner_id: &str) -> Result<Vec<SandboxRecord>, SandboxError>;

    /// Thin client bound to the sandbox's current internal address.
    /// Fails fast with `Proxy` when the sandbox has no usable address.
    async fn agent_runtime_client(&self, id: &str) -> Result<AgentRuntimeClient, SandboxError>;

    /// Forward a request to the sandbox's internal agent-runtime
    /// endpoint. The response body is streamed, never buffered whole.
    async fn proxy_request(
        &self,
        id: &str,
        req: ProxyRequest,
    ) -> Result<reqwest::Response, SandboxError>;

    /// Bounded-time liveness probe (≤ 5s). Failures become `false`.
    async fn health_check(&self, id: &str) -> bool;

    /// Workflow surface, for backends that dispatch long-running jobs.
    /// Callers must check this instead of probing methods for errors.
    fn workflow_ops(&self) -> Option<&dyn WorkflowOps> {
        None
    }
}

// ── Proxy plumbing ──────────────────────────────────────────────────

/// An inbound request to relay into a sandbox. The body is a streaming
/// `reqwest::Body`, so arbitrarily large uploads pass through in chunks.
pub struct ProxyRequest {
    pub method: Method,
    /// Path + query to rewrite onto the sandbox's base URL, with a
    /// leading slash (e.g. `/v1/messages?stream=true`).
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

/// Shared forwarding path used by every backend: rewrite onto the base
/// URL, strip hop-by-hop headers, send, hand back the streaming
/// response.
pub(crate) async fn forward_request(
    client: &reqwest::Client,
    base_url: &str,
    req: ProxyRequest,
) -> Result<reqwest::Response, SandboxError> {
    let url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        req.path_and_query.trim_start_matches('/')
    );

    let mut headers = req.headers;
    // Hop-by-hop headers must not be forwarded; reqwest recomputes them.
    for name in [
        header::HOST,
        header::CONNECTION,
        header::TRANSFER_ENCODING,
        header::CONTENT_LENGTH,
    ] {
        headers.remove(&name);
    }

    client
        .request(req.method, &url)
        .headers(headers)
        .body(req.body)
        .send()
        .await
        .map_err(|e| SandboxError::Proxy(format!("upstream {url} unreachable: {e}")))
}

// ── Workflow executions ─────────────────────────────────────────────

/// Long-running jobs dispatched through a backend's workflow engine.
/// `execute` returns immediately with a queued execution; this surface
/// never blocks on completion — callers poll `status`.
#[async_trait]
pub trait WorkflowOps: Send + Sync {
    async fn execute(
        &self,
        sandbox_id: &str,
        req: WorkflowRequest,
    ) -> Result<WorkflowExecution, SandboxError>;

    async fn status(&self, workflow_id: &str) -> Result<WorkflowExecution, SandboxError>;

    async fn pause(&self, workflow_id: &str) -> Result<(), SandboxError>;

    async fn resume(&self, workflow_id: &str) -> Result<(), SandboxError>;

    async fn terminate(&self, workflow_id: &str) -> Result<(), SandboxError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub sandbox_id: String,
    pub state: WorkflowState,
    pub detail: Option<String>,
}

/// `queued → running → (paused ⇄ running) → {complete | errored |
/// terminated}`. Backend statuses we don't recognize fold to `Unknown`,
/// never to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Queued,
    Running,
    Paused,
    Complete,
    Errored,
    Terminated,
    Unknown,
}

impl WorkflowState {
    pub fn from_backend(raw: &str) -> Self {
        match raw {
            "queued" => WorkflowState::Queued,
            "running" => WorkflowState::Running,
            "paused" => WorkflowState::Paused,
            "complete" => WorkflowState::Complete,
            "errored" => WorkflowState::Errored,
            "terminated" => WorkflowState::Terminated,
            _ => WorkflowState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Complete | WorkflowState::Errored | WorkflowState::Terminated
        )
    }
}
