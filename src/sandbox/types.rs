use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::WorkerAuthConfig;

/// The agent runtime listens on this port inside every sandbox,
/// regardless of flavor or add-ons.
pub const AGENT_RUNTIME_PORT: u16 = 7700;

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    LocalContainer,
    RemoteWorker,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::LocalContainer => write!(f, "local-container"),
            ProviderKind::RemoteWorker => write!(f, "remote-worker"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-container" => Ok(ProviderKind::LocalContainer),
            "remote-worker" => Ok(ProviderKind::RemoteWorker),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

// ── Unified status ──────────────────────────────────────────────────

/// Unified sandbox status. Every backend-native state folds into exactly
/// one of these values; unmapped native values fold to `Error`, never
/// silently to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Sleeping,
    Error,
}

// ── Provider info ───────────────────────────────────────────────────

/// Capability flags reported by each provider. Callers check these
/// before invoking optional surfaces instead of probing for errors.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub supports_hibernate: bool,
    pub supports_workflows: bool,
}

// ── Composed image spec (derived, not persisted) ────────────────────

/// Output of the resource composer: a fully resolved image reference
/// plus aggregate limits. Providers only ever see valid compositions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposedImageSpec {
    pub image: String,
    pub tier_id: String,
    pub flavor_id: String,
    /// Alphabetically sorted, deduplicated.
    pub addon_ids: Vec<String>,
    pub cpu_limit: u32,
    pub memory_mb: u64,
    pub exposed_ports: Vec<u16>,
}

// ── Sandbox record ──────────────────────────────────────────────────

/// Unified view of a sandbox across backends.
///
/// `provider` is immutable after creation. `agent_runtime_url` is only
/// trusted when `status == Running`.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxRecord {
    pub id: String,
    pub owner_id: String,
    pub provider: ProviderKind,
    pub status: SandboxStatus,
    pub resource_tier_id: String,
    pub flavor_id: String,
    pub addon_ids: Vec<String>,
    pub agent_runtime_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Backend-specific opaque bag (container name, remote ids, …).
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// ── Create request (input to providers) ─────────────────────────────

#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub owner_id: String,
    pub spec: ComposedImageSpec,
    pub directory: String,
    pub git_url: Option<String>,
    pub branch: Option<String>,
    /// Environment injected into the sandbox (local backend).
    pub env: BTreeMap<String, String>,
    /// Wire-format auth config (remote backend). `None` when the caller
    /// supplied no credentials at all.
    pub auth: Option<WorkerAuthConfig>,
}
