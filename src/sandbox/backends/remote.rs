//! Remote worker-pool sandbox backend.
//!
//! Talks to a hosted worker control API over HTTPS. Every response is a
//! `{success, error, data}` envelope and the flag is checked on every
//! call — a 200 with `success: false` is a backend failure, not a
//! success. Workers auto-hibernate on idle, so `stop_sandbox` is an
//! acknowledged no-op and `start_sandbox` wakes a hibernated worker.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::sandbox::agent_client::AgentRuntimeClient;
use crate::sandbox::error::SandboxError;
use crate::sandbox::provider::{
    ProxyRequest, SandboxProvider, WorkflowExecution, WorkflowOps, WorkflowRequest, WorkflowState,
    forward_request,
};
use crate::sandbox::types::{
    CreateSandboxRequest, ProviderInfo, ProviderKind, SandboxRecord, SandboxStatus,
};
use crate::settings::WorkerAuthConfig;

#[derive(Debug, Clone)]
pub struct RemoteWorkerConfig {
    pub base_url: String,
    pub api_token: String,
}

pub struct RemoteWorkerProvider {
    base_url: String,
    api_token: String,
    http: reqwest::Client,
}

// ── Wire types ──────────────────────────────────────────────────────

/// Envelope wrapping every control-API response.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    // No `default` attribute here: it would put a `T: Default` bound on
    // the Deserialize impl, and a missing field is `None` regardless.
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct CreateWorkerBody {
    image: String,
    cpu: u32,
    memory_mb: u64,
    workspace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    git_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    git_branch: Option<String>,
    owner_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RemoteWorker {
    id: String,
    #[serde(default)]
    owner_id: String,
    status: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WorkerList {
    workers: Vec<RemoteWorker>,
}

#[derive(Debug, Serialize)]
struct ExecuteWorkflowBody<'a> {
    sandbox_id: &'a str,
    name: &'a str,
    input: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RemoteWorkflow {
    id: String,
    #[serde(default)]
    sandbox_id: String,
    status: String,
    #[serde(default)]
    detail: Option<String>,
}

// ── Status mapping ──────────────────────────────────────────────────

/// Every status string the worker control API documents, for the
/// totality test.
pub const NATIVE_STATUSES: [&str; 8] = [
    "provisioning",
    "waking",
    "active",
    "hibernating",
    "hibernated",
    "stopped",
    "failed",
    "unknown",
];

/// Total mapping from worker-native status strings to the unified enum.
/// Strings outside the documented set fold to `Error`, never `Running`.
pub fn map_remote_status(raw: &str) -> SandboxStatus {
    match raw {
        "provisioning" => SandboxStatus::Creating,
        "waking" => SandboxStatus::Starting,
        "active" => SandboxStatus::Running,
        "hibernating" => SandboxStatus::Stopping,
        "hibernated" => SandboxStatus::Sleeping,
        "stopped" => SandboxStatus::Stopped,
        _ => SandboxStatus::Error,
    }
}

impl RemoteWorkerProvider {
    pub fn new(config: RemoteWorkerConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send a request and unwrap the `{success, error, data}` envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<T, SandboxError> {
        let resp = req
            .bearer_auth(&self.api_token)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("{context}: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(context.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Backend(format!(
                "{context}: HTTP {status}: {body}"
            )));
        }

        let envelope: ApiEnvelope<T> = resp
            .json()
            .await
            .map_err(|e| SandboxError::Serde(format!("{context}: malformed envelope: {e}")))?;

        if !envelope.success {
            return Err(SandboxError::Backend(format!(
                "{context}: {}",
                envelope.error.unwrap_or_else(|| "unspecified backend error".to_string())
            )));
        }
        envelope
            .data
            .ok_or_else(|| SandboxError::Serde(format!("{context}: success envelope without data")))
    }

    /// Same as `call` but for endpoints whose envelopes carry no data.
    async fn call_ack(&self, req: reqwest::RequestBuilder, context: &str) -> Result<(), SandboxError> {
        match self.call::<serde_json::Value>(req, context).await {
            Ok(_) => Ok(()),
            // Ack-only envelopes legitimately omit `data`.
            Err(SandboxError::Serde(msg)) if msg.contains("without data") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn record_from_worker(worker: RemoteWorker) -> SandboxRecord {
        let status = map_remote_status(&worker.status);
        let agent_runtime_url = if status == SandboxStatus::Running {
            worker.url.clone()
        } else {
            None
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("native_status".to_string(), serde_json::json!(worker.status));
        if let Some(image) = &worker.image {
            metadata.insert("image".to_string(), serde_json::json!(image));
        }

        SandboxRecord {
            id: worker.id,
            owner_id: worker.owner_id,
            provider: ProviderKind::RemoteWorker,
            status,
            resource_tier_id: String::new(),
            flavor_id: String::new(),
            addon_ids: Vec::new(),
            agent_runtime_url,
            created_at: worker.created_at.unwrap_or_else(Utc::now),
            last_active_at: Utc::now(),
            metadata,
        }
    }

    async fn push_auth_config(
        &self,
        id: &str,
        config: &WorkerAuthConfig,
    ) -> Result<(), SandboxError> {
        self.call_ack(
            self.http
                .post(self.url(&format!("/v1/sandboxes/{id}/config")))
                .json(config),
            "push sandbox config",
        )
        .await
    }

    async fn fetch_worker(&self, id: &str) -> Result<RemoteWorker, SandboxError> {
        self.call(
            self.http.get(self.url(&format!("/v1/sandboxes/{id}"))),
            "get sandbox",
        )
        .await
    }

    async fn require_running_url(&self, id: &str) -> Result<String, SandboxError> {
        let record = Self::record_from_worker(self.fetch_worker(id).await?);
        if record.status != SandboxStatus::Running {
            return Err(SandboxError::Proxy(format!(
                "sandbox {id} is not running (status: {:?})",
                record.status
            )));
        }
        record
            .agent_runtime_url
            .ok_or_else(|| SandboxError::Proxy(format!("sandbox {id} has no usable address")))
    }
}

#[async_trait]
impl SandboxProvider for RemoteWorkerProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::RemoteWorker,
            supports_hibernate: true,
            supports_workflows: true,
        }
    }

    async fn create_sandbox(
        &self,
        req: CreateSandboxRequest,
    ) -> Result<SandboxRecord, SandboxError> {
        let body = CreateWorkerBody {
            image: req.spec.image.clone(),
            cpu: req.spec.cpu_limit,
            memory_mb: req.spec.memory_mb,
            workspace: req.directory.clone(),
            git_url: req.git_url.clone(),
            git_branch: req.branch.clone(),
            owner_id: req.owner_id.clone(),
            env: req.env.clone(),
        };

        tracing::info!(
            image = %req.spec.image,
            owner_id = %req.owner_id,
            "provisioning remote worker"
        );

        let worker: RemoteWorker = self
            .call(
                self.http.post(self.url("/v1/sandboxes")).json(&body),
                "create sandbox",
            )
            .await?;
        let id = worker.id.clone();

        // Push credentials before the caller sees the sandbox; a worker
        // without its config is unusable, so roll it back on failure.
        if let Some(auth) = &req.auth {
            if let Err(e) = self.push_auth_config(&id, auth).await {
                tracing::warn!(sandbox_id = %id, error = %e, "config push failed, rolling back worker");
                let _ = self
                    .call_ack(
                        self.http.delete(self.url(&format!("/v1/sandboxes/{id}"))),
                        "rollback sandbox",
                    )
                    .await;
                return Err(e);
            }
        }

        let mut record = Self::record_from_worker(worker);
        record.resource_tier_id = req.spec.tier_id;
        record.flavor_id = req.spec.flavor_id;
        record.addon_ids = req.spec.addon_ids;
        Ok(record)
    }

    async fn start_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        // Waking an already-active worker is acknowledged by the API.
        self.call_ack(
            self.http
                .post(self.url(&format!("/v1/sandboxes/{id}/wake"))),
            "wake sandbox",
        )
        .await
    }

    async fn stop_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        // Workers hibernate on idle by themselves; there is no stop
        // endpoint. Acknowledge and let auto-hibernation converge.
        tracing::debug!(sandbox_id = %id, "stop acknowledged; worker hibernates on idle");
        Ok(())
    }

    async fn delete_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        match self
            .call_ack(
                self.http.delete(self.url(&format!("/v1/sandboxes/{id}"))),
                "delete sandbox",
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(SandboxError::NotFound(_)) => {
                tracing::warn!(sandbox_id = %id, "worker already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_sandbox(&self, id: &str) -> Result<Option<SandboxRecord>, SandboxError> {
        match self.fetch_worker(id).await {
            Ok(worker) => Ok(Some(Self::record_from_worker(worker))),
            Err(SandboxError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_sandboxes(&self, owner_id: &str) -> Result<Vec<SandboxRecord>, SandboxError> {
        let list: WorkerList = self
            .call(
                self.http
                    .get(self.url("/v1/sandboxes"))
                    .query(&[("owner_id", owner_id)]),
                "list sandboxes",
            )
            .await?;
        Ok(list
            .workers
            .into_iter()
            .map(Self::record_from_worker)
            .collect())
    }

    async fn agent_runtime_client(&self, id: &str) -> Result<AgentRuntimeClient, SandboxError> {
        let url = self.require_running_url(id).await?;
        Ok(AgentRuntimeClient::new(&url, self.http.clone()))
    }

    async fn proxy_request(
        &self,
        id: &str,
        req: ProxyRequest,
    ) -> Result<reqwest::Response, SandboxError> {
        let url = self.require_running_url(id).await?;
        forward_request(&self.http, &url, req).await
    }

    async fn health_check(&self, id: &str) -> bool {
        let probe = async {
            matches!(
                self.fetch_worker(id).await,
                Ok(worker) if map_remote_status(&worker.status) == SandboxStatus::Running
            )
        };
        tokio::time::timeout(Duration::from_secs(5), probe)
            .await
            .unwrap_or(false)
    }

    fn workflow_ops(&self) -> Option<&dyn WorkflowOps> {
        Some(self)
    }
}

#[async_trait]
impl WorkflowOps for RemoteWorkerProvider {
    async fn execute(
        &self,
        sandbox_id: &str,
        req: WorkflowRequest,
    ) -> Result<WorkflowExecution, SandboxError> {
        let body = ExecuteWorkflowBody {
            sandbox_id,
            name: &req.name,
            input: &req.input,
        };
        let wf: RemoteWorkflow = self
            .call(
                self.http.post(self.url("/v1/workflows")).json(&body),
                "execute workflow",
            )
            .await?;
        tracing::info!(workflow_id = %wf.id, sandbox_id = %sandbox_id, name = %req.name, "workflow queued");
        Ok(workflow_execution(wf))
    }

    async fn status(&self, workflow_id: &str) -> Result<WorkflowExecution, SandboxError> {
        let wf: RemoteWorkflow = self
            .call(
                self.http
                    .get(self.url(&format!("/v1/workflows/{workflow_id}"))),
                "workflow status",
            )
            .await?;
        Ok(workflow_execution(wf))
    }

    async fn pause(&self, workflow_id: &str) -> Result<(), SandboxError> {
        self.call_ack(
            self.http
                .post(self.url(&format!("/v1/workflows/{workflow_id}/pause"))),
            "pause workflow",
        )
        .await
    }

    async fn resume(&self, workflow_id: &str) -> Result<(), SandboxError> {
        self.call_ack(
            self.http
                .post(self.url(&format!("/v1/workflows/{workflow_id}/resume"))),
            "resume workflow",
        )
        .await
    }

    async fn terminate(&self, workflow_id: &str) -> Result<(), SandboxError> {
        self.call_ack(
            self.http
                .post(self.url(&format!("/v1/workflows/{workflow_id}/terminate"))),
            "terminate workflow",
        )
        .await
    }
}

fn workflow_execution(wf: RemoteWorkflow) -> WorkflowExecution {
    WorkflowExecution {
        id: wf.id,
        sandbox_id: wf.sandbox_id,
        state: WorkflowState::from_backend(&wf.status),
        detail: wf.detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_mapping_is_total_over_documented_set() {
        for raw in NATIVE_STATUSES {
            let mapped = map_remote_status(raw);
            // No documented status may be left unmapped in a way that
            // reports a sandbox as running when it is not.
            if raw != "active" {
                assert_ne!(mapped, SandboxStatus::Running, "{raw} must not map to running");
            }
        }
        assert_eq!(map_remote_status("active"), SandboxStatus::Running);
    }

    #[test]
    fn documented_statuses_map_as_expected() {
        assert_eq!(map_remote_status("provisioning"), SandboxStatus::Creating);
        assert_eq!(map_remote_status("waking"), SandboxStatus::Starting);
        assert_eq!(map_remote_status("hibernating"), SandboxStatus::Stopping);
        assert_eq!(map_remote_status("hibernated"), SandboxStatus::Sleeping);
        assert_eq!(map_remote_status("stopped"), SandboxStatus::Stopped);
        assert_eq!(map_remote_status("failed"), SandboxStatus::Error);
        assert_eq!(map_remote_status("unknown"), SandboxStatus::Error);
    }

    #[test]
    fn undocumented_status_folds_to_error() {
        for raw in ["", "ACTIVE", "paused", "terminated", "zombie"] {
            assert_eq!(map_remote_status(raw), SandboxStatus::Error);
        }
    }

    #[test]
    fn envelope_with_success_false_carries_error() {
        let raw = r#"{"success": false, "error": "quota exceeded"}"#;
        let envelope: ApiEnvelope<RemoteWorker> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.error.as_deref(), Some("quota exceeded"));
        assert!(envelope.data.is_none());
    }

    #[test]
    fn envelope_without_data_field_deserializes() {
        // RemoteWorker has no Default impl; the envelope must not need
        // one to treat an absent `data` field as None.
        let envelope: ApiEnvelope<RemoteWorker> =
            serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(envelope.success);
        assert!(envelope.data.is_none());
        assert!(envelope.error.is_none());
    }

    #[test]
    fn envelope_with_data_deserializes_worker() {
        let raw = r#"{
            "success": true,
            "data": {
                "id": "wk-42",
                "owner_id": "owner-1",
                "status": "active",
                "url": "https://wk-42.workers.example.com"
            }
        }"#;
        let envelope: ApiEnvelope<RemoteWorker> = serde_json::from_str(raw).unwrap();
        assert!(envelope.success);
        let worker = envelope.data.unwrap();
        assert_eq!(worker.id, "wk-42");
        assert_eq!(worker.status, "active");
    }

    #[test]
    fn record_hides_url_unless_running() {
        let hibernated = RemoteWorker {
            id: "wk-1".into(),
            owner_id: "o".into(),
            status: "hibernated".into(),
            url: Some("https://wk-1.workers.example.com".into()),
            image: None,
            created_at: None,
        };
        let record = RemoteWorkerProvider::record_from_worker(hibernated);
        assert_eq!(record.status, SandboxStatus::Sleeping);
        assert!(record.agent_runtime_url.is_none());
        assert_eq!(record.metadata["native_status"], "hibernated");
    }

    #[test]
    fn record_exposes_url_when_active() {
        let active = RemoteWorker {
            id: "wk-2".into(),
            owner_id: "o".into(),
            status: "active".into(),
            url: Some("https://wk-2.workers.example.com".into()),
            image: Some("ghcr.io/agentbox/sandbox-python:latest".into()),
            created_at: None,
        };
        let record = RemoteWorkerProvider::record_from_worker(active);
        assert_eq!(
            record.agent_runtime_url.as_deref(),
            Some("https://wk-2.workers.example.com")
        );
    }

    #[tokio::test]
    async fn stop_is_a_no_op_that_never_touches_the_network() {
        // Nothing listens here; if stop issued any HTTP call it would
        // fail instead of acknowledging.
        let provider = RemoteWorkerProvider::new(RemoteWorkerConfig {
            base_url: "http://127.0.0.1:1".into(),
            api_token: "tok".into(),
        });
        provider.stop_sandbox("wk-1").await.unwrap();
    }

    #[test]
    fn create_body_omits_empty_optionals() {
        let body = CreateWorkerBody {
            image: "img".into(),
            cpu: 2,
            memory_mb: 4096,
            workspace: "/workspace".into(),
            git_url: None,
            git_branch: None,
            owner_id: "o".into(),
            env: BTreeMap::new(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("git_url").is_none());
        assert!(json.get("env").is_none());
    }
}
