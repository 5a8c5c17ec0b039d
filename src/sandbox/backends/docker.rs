//! Local container-engine sandbox backend.
//!
//! Drives a container engine through its HTTP API via `bollard`. Every
//! sandbox is one container, labeled for ownership so listing never
//! relies on backend isolation alone. Creation rolls back the container
//! on any failure after the create call, so a failed provision leaves
//! no orphaned engine resources.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum, HostConfig};
use chrono::{DateTime, Utc};

use crate::sandbox::agent_client::AgentRuntimeClient;
use crate::sandbox::error::SandboxError;
use crate::sandbox::provider::{ProxyRequest, SandboxProvider, forward_request};
use crate::sandbox::types::{
    AGENT_RUNTIME_PORT, CreateSandboxRequest, ProviderInfo, ProviderKind, SandboxRecord,
    SandboxStatus,
};

const MANAGED_LABEL: &str = "agentbox.managed";
const OWNER_LABEL: &str = "agentbox.owner";
const TIER_LABEL: &str = "agentbox.tier";
const FLAVOR_LABEL: &str = "agentbox.flavor";
const ADDONS_LABEL: &str = "agentbox.addons";
const CREATED_LABEL: &str = "agentbox.created-at";

#[derive(Debug, Clone)]
pub struct LocalContainerConfig {
    /// Engine endpoint. `None` = platform default socket; `http://` or
    /// `tcp://` targets a remote engine.
    pub engine_host: Option<String>,
    /// Container network to attach sandboxes to.
    pub network: Option<String>,
    pub readiness_timeout: Duration,
}

impl Default for LocalContainerConfig {
    fn default() -> Self {
        Self {
            engine_host: None,
            network: None,
            readiness_timeout: Duration::from_secs(30),
        }
    }
}

pub struct LocalContainerProvider {
    docker: Docker,
    http: reqwest::Client,
    config: LocalContainerConfig,
}

impl LocalContainerProvider {
    pub fn new(config: LocalContainerConfig) -> Result<Self, SandboxError> {
        let docker = match &config.engine_host {
            Some(host) if host.starts_with("http://") || host.starts_with("tcp://") => {
                Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            }
            _ => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| SandboxError::Backend(format!("container engine unreachable: {e}")))?;

        Ok(Self {
            docker,
            http: reqwest::Client::new(),
            config,
        })
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, SandboxError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_engine_err(id, e))
    }

    /// Force-remove a partially provisioned container. Best effort — the
    /// original error is what the caller sees.
    async fn rollback(&self, id: &str) {
        tracing::warn!(sandbox_id = %id, "rolling back partially provisioned container");
        let _ = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    /// Poll until the engine reports the container running (and healthy,
    /// when an image health check exists), bounded by the configured
    /// readiness timeout.
    async fn wait_ready(&self, id: &str) -> Result<ContainerInspectResponse, SandboxError> {
        let deadline = tokio::time::Instant::now() + self.config.readiness_timeout;

        loop {
            let inspect = self.inspect(id).await?;
            let state = inspect.state.clone().unwrap_or_default();

            match state.status {
                Some(ContainerStateStatusEnum::RUNNING) => {
                    let healthy = match state.health.and_then(|h| h.status) {
                        None | Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) => true,
                        Some(HealthStatusEnum::HEALTHY) => true,
                        Some(HealthStatusEnum::STARTING) => false,
                        Some(HealthStatusEnum::UNHEALTHY) => {
                            return Err(SandboxError::Backend(format!(
                                "container {id} reported unhealthy during startup"
                            )));
                        }
                    };
                    if healthy {
                        return Ok(inspect);
                    }
                }
                Some(ContainerStateStatusEnum::DEAD) | Some(ContainerStateStatusEnum::EXITED) => {
                    return Err(SandboxError::Backend(format!(
                        "container {id} exited before becoming ready"
                    )));
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SandboxError::Backend(format!(
                    "container {id} did not become ready within {:?}",
                    self.config.readiness_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    fn internal_url(inspect: &ContainerInspectResponse) -> Option<String> {
        let settings = inspect.network_settings.as_ref()?;
        let ip = settings
            .ip_address
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .or_else(|| {
                settings.networks.as_ref()?.values().find_map(|n| {
                    n.ip_address
                        .as_deref()
                        .filter(|ip| !ip.is_empty())
                        .map(str::to_string)
                })
            })?;
        Some(format!("http://{ip}:{AGENT_RUNTIME_PORT}"))
    }

    fn record_from_inspect(inspect: &ContainerInspectResponse) -> SandboxRecord {
        let id = inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(map_engine_status)
            .unwrap_or(SandboxStatus::Error);

        let agent_runtime_url = if status == SandboxStatus::Running {
            Self::internal_url(inspect)
        } else {
            None
        };

        let created_at = labels
            .get(CREATED_LABEL)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut metadata = BTreeMap::new();
        if let Some(cid) = &inspect.id {
            metadata.insert("container_id".to_string(), serde_json::json!(cid));
        }

        SandboxRecord {
            id,
            owner_id: labels.get(OWNER_LABEL).cloned().unwrap_or_default(),
            provider: ProviderKind::LocalContainer,
            status,
            resource_tier_id: labels.get(TIER_LABEL).cloned().unwrap_or_default(),
            flavor_id: labels.get(FLAVOR_LABEL).cloned().unwrap_or_default(),
            addon_ids: labels
                .get(ADDONS_LABEL)
                .map(|v| v.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
                .unwrap_or_default(),
            agent_runtime_url,
            created_at,
            last_active_at: Utc::now(),
            metadata,
        }
    }

    async fn require_running_url(&self, id: &str) -> Result<String, SandboxError> {
        let inspect = self.inspect(id).await?;
        let record = Self::record_from_inspect(&inspect);
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

    async fn probe(&self, id: &str) -> bool {
        let Ok(inspect) = self.inspect(id).await else {
            return false;
        };

        // Prefer the engine's own health verdict when the image defines one.
        if let Some(health) = inspect.state.as_ref().and_then(|s| s.health.as_ref()) {
            match health.status {
                Some(HealthStatusEnum::HEALTHY) => return true,
                Some(HealthStatusEnum::UNHEALTHY) | Some(HealthStatusEnum::STARTING) => {
                    return false;
                }
                _ => {} // no verdict — fall through to the HTTP probe
            }
        }

        match Self::internal_url(&inspect) {
            Some(url) => AgentRuntimeClient::new(&url, self.http.clone())
                .health()
                .await
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalContainerProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            kind: ProviderKind::LocalContainer,
            supports_hibernate: false,
            supports_workflows: false,
        }
    }

    async fn create_sandbox(
        &self,
        req: CreateSandboxRequest,
    ) -> Result<SandboxRecord, SandboxError> {
        let id = format!("sbx-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let now = Utc::now();

        let mut labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (OWNER_LABEL.to_string(), req.owner_id.clone()),
            (TIER_LABEL.to_string(), req.spec.tier_id.clone()),
            (FLAVOR_LABEL.to_string(), req.spec.flavor_id.clone()),
            (CREATED_LABEL.to_string(), now.to_rfc3339()),
        ]);
        labels.insert(ADDONS_LABEL.to_string(), req.spec.addon_ids.join(","));

        let mut env: Vec<String> = req
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(format!("AGENTBOX_WORKSPACE={}", req.directory));
        if let Some(git_url) = &req.git_url {
            env.push(format!("AGENTBOX_GIT_URL={git_url}"));
        }
        if let Some(branch) = &req.branch {
            env.push(format!("AGENTBOX_GIT_BRANCH={branch}"));
        }

        let exposed_ports: HashMap<String, HashMap<(), ()>> = req
            .spec
            .exposed_ports
            .iter()
            .map(|p| (format!("{p}/tcp"), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            memory: Some(req.spec.memory_mb as i64 * 1024 * 1024),
            cpu_quota: Some(req.spec.cpu_limit as i64 * 100_000),
            cpu_period: Some(100_000),
            network_mode: self.config.network.clone(),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(req.spec.image.clone()),
            working_dir: Some(req.directory.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        tracing::info!(
            sandbox_id = %id,
            image = %req.spec.image,
            cpu = req.spec.cpu_limit,
            memory_mb = req.spec.memory_mb,
            "creating sandbox container"
        );

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: id.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| map_engine_err(&id, e))?;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.rollback(&id).await;
            return Err(map_engine_err(&id, e));
        }

        let inspect = match self.wait_ready(&id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                self.rollback(&id).await;
                return Err(e);
            }
        };

        let record = Self::record_from_inspect(&inspect);
        tracing::info!(
            sandbox_id = %id,
            url = record.agent_runtime_url.as_deref().unwrap_or("-"),
            "sandbox container running"
        );
        Ok(record)
    }

    async fn start_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        let inspect = self.inspect(id).await?;
        let status = inspect.state.as_ref().and_then(|s| s.status);
        if status == Some(ContainerStateStatusEnum::RUNNING) {
            tracing::debug!(sandbox_id = %id, "start: already running");
            return Ok(());
        }

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_engine_err(id, e))
    }

    async fn stop_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        let inspect = self.inspect(id).await?;
        let status = inspect.state.as_ref().and_then(|s| s.status);
        if matches!(
            status,
            Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::CREATED)
        ) {
            tracing::debug!(sandbox_id = %id, "stop: already stopped");
            return Ok(());
        }

        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 5 }))
            .await
            .map_err(|e| map_engine_err(id, e))
    }

    async fn delete_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone — not an error.
            Err(e) if is_engine_404(&e) => {
                tracing::warn!(sandbox_id = %id, "container already removed");
                Ok(())
            }
            Err(e) => Err(map_engine_err(id, e)),
        }
    }

    async fn get_sandbox(&self, id: &str) -> Result<Option<SandboxRecord>, SandboxError> {
        match self.inspect(id).await {
            Ok(inspect) => Ok(Some(Self::record_from_inspect(&inspect))),
            Err(SandboxError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_sandboxes(&self, owner_id: &str) -> Result<Vec<SandboxRecord>, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{MANAGED_LABEL}=true"),
                format!("{OWNER_LABEL}={owner_id}"),
            ],
        )]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::Backend(format!("container list failed: {e}")))?;

        let mut records = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(name) = summary
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };
            // Inspect gives the same record shape as get_sandbox,
            // including the internal address when running.
            if let Ok(inspect) = self.inspect(&name).await {
                records.push(Self::record_from_inspect(&inspect));
            }
        }
        Ok(records)
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
        tokio::time::timeout(Duration::from_secs(5), self.probe(id))
            .await
            .unwrap_or(false)
    }
}

// ── Status mapping ──────────────────────────────────────────────────

/// Every engine-native container state, for the totality test.
pub const ENGINE_STATES: [ContainerStateStatusEnum; 8] = [
    ContainerStateStatusEnum::EMPTY,
    ContainerStateStatusEnum::CREATED,
    ContainerStateStatusEnum::RUNNING,
    ContainerStateStatusEnum::PAUSED,
    ContainerStateStatusEnum::RESTARTING,
    ContainerStateStatusEnum::REMOVING,
    ContainerStateStatusEnum::EXITED,
    ContainerStateStatusEnum::DEAD,
];

/// Total mapping from engine-native states to the unified enum. No
/// default arm: a new engine state must be mapped here explicitly or
/// the build fails.
pub fn map_engine_status(status: ContainerStateStatusEnum) -> SandboxStatus {
    match status {
        ContainerStateStatusEnum::CREATED => SandboxStatus::Creating,
        ContainerStateStatusEnum::RESTARTING => SandboxStatus::Starting,
        ContainerStateStatusEnum::RUNNING => SandboxStatus::Running,
        ContainerStateStatusEnum::REMOVING => SandboxStatus::Stopping,
        ContainerStateStatusEnum::PAUSED => SandboxStatus::Sleeping,
        ContainerStateStatusEnum::EXITED => SandboxStatus::Stopped,
        ContainerStateStatusEnum::DEAD => SandboxStatus::Error,
        ContainerStateStatusEnum::EMPTY => SandboxStatus::Error,
    }
}

fn is_engine_404(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn map_engine_err(id: &str, e: bollard::errors::Error) -> SandboxError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::NotFound(id.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => SandboxError::AlreadyExists(format!("{id}: {message}")),
        other => SandboxError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_status_mapping_is_total() {
        // Every native state maps to exactly one unified value.
        for state in ENGINE_STATES {
            let _ = map_engine_status(state);
        }
    }

    #[test]
    fn unmapped_states_fold_to_error_never_running() {
        assert_eq!(
            map_engine_status(ContainerStateStatusEnum::EMPTY),
            SandboxStatus::Error
        );
        assert_eq!(
            map_engine_status(ContainerStateStatusEnum::DEAD),
            SandboxStatus::Error
        );
    }

    #[test]
    fn lifecycle_states_map_as_documented() {
        assert_eq!(
            map_engine_status(ContainerStateStatusEnum::CREATED),
            SandboxStatus::Creating
        );
        assert_eq!(
            map_engine_status(ContainerStateStatusEnum::RESTARTING),
            SandboxStatus::Starting
        );
        assert_eq!(
            map_engine_status(ContainerStateStatusEnum::RUNNING),
            SandboxStatus::Running
        );
        assert_eq!(
            map_engine_status(ContainerStateStatusEnum::REMOVING),
            SandboxStatus::Stopping
        );
        assert_eq!(
            map_engine_status(ContainerStateStatusEnum::PAUSED),
            SandboxStatus::Sleeping
        );
        assert_eq!(
            map_engine_status(ContainerStateStatusEnum::EXITED),
            SandboxStatus::Stopped
        );
    }

    #[test]
    fn record_from_inspect_reads_labels() {
        let inspect = ContainerInspectResponse {
            id: Some("deadbeef".into()),
            name: Some("/sbx-abc123".into()),
            config: Some(bollard::models::ContainerConfig {
                labels: Some(HashMap::from([
                    (OWNER_LABEL.to_string(), "owner-1".to_string()),
                    (TIER_LABEL.to_string(), "creator".to_string()),
                    (FLAVOR_LABEL.to_string(), "python".to_string()),
                    (ADDONS_LABEL.to_string(), "code-server,gpu".to_string()),
                ])),
                ..Default::default()
            }),
            state: Some(bollard::models::ContainerState {
                status: Some(ContainerStateStatusEnum::EXITED),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = LocalContainerProvider::record_from_inspect(&inspect);
        assert_eq!(record.id, "sbx-abc123");
        assert_eq!(record.owner_id, "owner-1");
        assert_eq!(record.provider, ProviderKind::LocalContainer);
        assert_eq!(record.status, SandboxStatus::Stopped);
        assert_eq!(record.resource_tier_id, "creator");
        assert_eq!(record.addon_ids, vec!["code-server", "gpu"]);
        // Stopped sandboxes expose no address.
        assert!(record.agent_runtime_url.is_none());
    }

    #[test]
    fn running_record_resolves_internal_url() {
        let inspect = ContainerInspectResponse {
            name: Some("/sbx-xyz".into()),
            state: Some(bollard::models::ContainerState {
                status: Some(ContainerStateStatusEnum::RUNNING),
                ..Default::default()
            }),
            network_settings: Some(bollard::models::NetworkSettings {
                ip_address: Some("172.17.0.5".into()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let record = LocalContainerProvider::record_from_inspect(&inspect);
        assert_eq!(record.status, SandboxStatus::Running);
        assert_eq!(
            record.agent_runtime_url.as_deref(),
            Some("http://172.17.0.5:7700")
        );
    }

    #[test]
    fn empty_addon_label_yields_empty_list() {
        let inspect = ContainerInspectResponse {
            name: Some("/sbx-1".into()),
            config: Some(bollard::models::ContainerConfig {
                labels: Some(HashMap::from([(
                    ADDONS_LABEL.to_string(),
                    String::new(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let record = LocalContainerProvider::record_from_inspect(&inspect);
        assert!(record.addon_ids.is_empty());
    }
}
