use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Append-only event emitted by the sandbox lifecycle, consumed by the
/// observability/webhook surface.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxEvent {
    pub sandbox_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: SandboxEventType,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxEventType {
    Created,
    Started,
    Stopped,
    Hibernated,
    Woken,
    Deleted,
    Error,
    WorkspaceSynced,
}

impl SandboxEventType {
    pub fn as_sse_event(&self) -> &'static str {
        match self {
            SandboxEventType::Created => "sandbox.created",
            SandboxEventType::Started => "sandbox.started",
            SandboxEventType::Stopped => "sandbox.stopped",
            SandboxEventType::Hibernated => "sandbox.hibernated",
            SandboxEventType::Woken => "sandbox.woken",
            SandboxEventType::Deleted => "sandbox.deleted",
            SandboxEventType::Error => "sandbox.error",
            SandboxEventType::WorkspaceSynced => "workspace.synced",
        }
    }
}

/// Broadcast publisher for sandbox events. Cheap to clone; dropping all
/// receivers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SandboxEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, sandbox_id: &str, event_type: SandboxEventType, data: Value) {
        let event = SandboxEvent {
            sandbox_id: sandbox_id.to_string(),
            timestamp: Utc::now(),
            event_type,
            data,
        };
        // No subscribers is fine — events are best-effort notifications.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.tx.subscribe()
    }
}
