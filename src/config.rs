use std::collections::HashMap;

use crate::sandbox::types::ProviderKind;

/// Server configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub sentry_dsn: Option<String>,

    /// Container engine endpoint for the local backend. `None` = default
    /// local socket.
    pub engine_host: Option<String>,
    /// Container network to attach sandboxes to.
    pub sandbox_network: Option<String>,

    /// Image coordinate parts for the resource composer.
    pub image_registry: String,
    pub image_owner: String,
    pub image_product: String,
    pub image_version: String,

    /// Remote worker control API. Both must be set for the remote
    /// backend to register.
    pub remote_worker_url: Option<String>,
    pub remote_worker_token: Option<String>,

    pub default_provider: ProviderKind,
    /// Degrade an unavailable requested provider to the default instead
    /// of failing the request.
    pub auto_select_provider: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_raw_values(&vars)
    }

    pub fn from_raw_values(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| vars.get(key).filter(|v| !v.is_empty()).cloned();

        Self {
            port: get("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8081),
            environment: get("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            sentry_dsn: get("SENTRY_DSN"),
            engine_host: get("CONTAINER_ENGINE_HOST"),
            sandbox_network: get("SANDBOX_NETWORK"),
            image_registry: get("IMAGE_REGISTRY").unwrap_or_else(|| "ghcr.io".to_string()),
            image_owner: get("IMAGE_OWNER").unwrap_or_else(|| "agentbox".to_string()),
            image_product: get("IMAGE_PRODUCT").unwrap_or_else(|| "sandbox".to_string()),
            image_version: get("IMAGE_VERSION").unwrap_or_else(|| "latest".to_string()),
            remote_worker_url: get("REMOTE_WORKER_URL"),
            remote_worker_token: get("REMOTE_WORKER_TOKEN"),
            default_provider: get("DEFAULT_PROVIDER")
                .and_then(|v| v.parse().ok())
                .unwrap_or(ProviderKind::LocalContainer),
            auto_select_provider: get("AUTO_SELECT_PROVIDER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        }
    }

    pub fn remote_worker_configured(&self) -> bool {
        self.remote_worker_url.is_some() && self.remote_worker_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = Config::from_raw_values(&HashMap::new());
        assert_eq!(config.port, 8081);
        assert_eq!(config.environment, "development");
        assert_eq!(config.image_registry, "ghcr.io");
        assert_eq!(config.default_provider, ProviderKind::LocalContainer);
        assert!(config.auto_select_provider);
        assert!(!config.remote_worker_configured());
    }

    #[test]
    fn values_override_defaults() {
        let vars = HashMap::from([
            ("PORT".to_string(), "9000".to_string()),
            ("DEFAULT_PROVIDER".to_string(), "remote-worker".to_string()),
            ("AUTO_SELECT_PROVIDER".to_string(), "false".to_string()),
            ("REMOTE_WORKER_URL".to_string(), "https://workers.example.com".to_string()),
            ("REMOTE_WORKER_TOKEN".to_string(), "tok".to_string()),
        ]);
        let config = Config::from_raw_values(&vars);
        assert_eq!(config.port, 9000);
        assert_eq!(config.default_provider, ProviderKind::RemoteWorker);
        assert!(!config.auto_select_provider);
        assert!(config.remote_worker_configured());
    }

    #[test]
    fn empty_strings_count_as_unset() {
        let vars = HashMap::from([
            ("SENTRY_DSN".to_string(), String::new()),
            ("PORT".to_string(), String::new()),
        ]);
        let config = Config::from_raw_values(&vars);
        assert!(config.sentry_dsn.is_none());
        assert_eq!(config.port, 8081);
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        let vars = HashMap::from([("PORT".to_string(), "not-a-port".to_string())]);
        assert_eq!(Config::from_raw_values(&vars).port, 8081);
    }

    #[test]
    fn unknown_default_provider_falls_back() {
        let vars = HashMap::from([("DEFAULT_PROVIDER".to_string(), "firecracker".to_string())]);
        assert_eq!(
            Config::from_raw_values(&vars).default_provider,
            ProviderKind::LocalContainer
        );
    }
}
