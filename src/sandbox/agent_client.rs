//! Thin HTTP client for the agent runtime embedded in every sandbox.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::error::SandboxError;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentHealth {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Client bound to one sandbox's internal agent-runtime address.
///
/// The address is only valid while the sandbox is running; providers
/// refuse to hand out a client for a sandbox without a usable URL.
#[derive(Debug, Clone)]
pub struct AgentRuntimeClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentRuntimeClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe the runtime's health endpoint with a short timeout.
    pub async fn health(&self) -> Result<AgentHealth, SandboxError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("agent health probe failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(SandboxError::Backend(format!(
                "agent health probe returned {}",
                resp.status()
            )));
        }

        resp.json::<AgentHealth>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse agent health: {e}")))
    }

    /// Send a message to the agent and return its JSON reply.
    pub async fn send_message(&self, message: Value) -> Result<Value, SandboxError> {
        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&message)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("agent message failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Backend(format!(
                "agent returned {status}: {body}"
            )));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| SandboxError::Serde(format!("failed to parse agent reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let c = AgentRuntimeClient::new("http://172.17.0.2:7700/", reqwest::Client::new());
        assert_eq!(c.base_url(), "http://172.17.0.2:7700");
    }

    #[test]
    fn agent_health_deserializes() {
        let json = r#"{"status":"ok","version":"0.4.2"}"#;
        let h: AgentHealth = serde_json::from_str(json).unwrap();
        assert_eq!(h.status, "ok");
        assert_eq!(h.version.as_deref(), Some("0.4.2"));
    }

    #[test]
    fn agent_health_without_version() {
        let h: AgentHealth = serde_json::from_str(r#"{"status":"degraded"}"#).unwrap();
        assert!(h.version.is_none());
    }
}
