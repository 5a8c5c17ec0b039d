//! Config adapter between the platform's internal credential/settings
//! shape and the backends' wire formats.
//!
//! The remote worker treats an empty-but-present `providers` map as "no
//! providers available" and disables default model discovery, so an
//! internal credential set with zero usable secrets must omit the map
//! entirely rather than send `{}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Internal representation ─────────────────────────────────────────

/// Per-provider credentials plus arbitrary user settings, as stored by
/// the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCredentials {
    /// Model-provider id → API key.
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
    /// Model-provider id → OAuth access token.
    #[serde(default)]
    pub oauth_tokens: BTreeMap<String, String>,
    /// Free-form user settings forwarded verbatim.
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl AgentCredentials {
    /// True when no provider entry carries a usable (non-empty) secret.
    pub fn has_no_usable_secrets(&self) -> bool {
        !self.api_keys.values().any(|v| !v.is_empty())
            && !self.oauth_tokens.values().any(|v| !v.is_empty())
    }
}

// ── Remote worker wire format ───────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerProviderAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerAuthConfig {
    /// Absent (not `{}`) when no provider has a usable secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<BTreeMap<String, WorkerProviderAuth>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, Value>,
}

// ── Translation ─────────────────────────────────────────────────────

/// Internal → remote worker wire format. Only emits a provider entry
/// when it has a non-empty secret.
pub fn to_worker_config(creds: &AgentCredentials) -> WorkerAuthConfig {
    let mut providers: BTreeMap<String, WorkerProviderAuth> = BTreeMap::new();

    for (id, key) in &creds.api_keys {
        if key.is_empty() {
            continue;
        }
        providers.entry(id.clone()).or_default().api_key = Some(key.clone());
    }
    for (id, token) in &creds.oauth_tokens {
        if token.is_empty() {
            continue;
        }
        providers.entry(id.clone()).or_default().oauth_token = Some(token.clone());
    }

    WorkerAuthConfig {
        providers: if providers.is_empty() {
            None
        } else {
            Some(providers)
        },
        settings: creds.settings.clone(),
    }
}

/// Remote worker wire format → internal. Every field the wire format can
/// represent survives the trip.
pub fn from_worker_config(config: &WorkerAuthConfig) -> AgentCredentials {
    let mut creds = AgentCredentials {
        settings: config.settings.clone(),
        ..Default::default()
    };

    if let Some(providers) = &config.providers {
        for (id, auth) in providers {
            if let Some(key) = &auth.api_key {
                creds.api_keys.insert(id.clone(), key.clone());
            }
            if let Some(token) = &auth.oauth_token {
                creds.oauth_tokens.insert(id.clone(), token.clone());
            }
        }
    }

    creds
}

/// Internal → container environment. The local backend injects secrets
/// as `{PROVIDER}_API_KEY` / `{PROVIDER}_OAUTH_TOKEN` variables.
pub fn to_container_env(creds: &AgentCredentials) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for (id, key) in &creds.api_keys {
        if !key.is_empty() {
            env.insert(format!("{}_API_KEY", env_prefix(id)), key.clone());
        }
    }
    for (id, token) in &creds.oauth_tokens {
        if !token.is_empty() {
            env.insert(format!("{}_OAUTH_TOKEN", env_prefix(id)), token.clone());
        }
    }

    env
}

fn env_prefix(provider_id: &str) -> String {
    provider_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
