pub mod agent_client;
pub mod backends;
pub mod error;
pub mod provider;
pub mod registry;
pub mod types;

use std::sync::Arc;

use crate::config::Config;

use self::backends::docker::{LocalContainerConfig, LocalContainerProvider};
use self::backends::remote::{RemoteWorkerConfig, RemoteWorkerProvider};
use self::error::SandboxError;
use self::registry::ProviderRegistry;

/// Build the provider registry from configuration. The local backend is
/// skipped when the container engine is unreachable; the remote backend
/// registers only when both its URL and token are configured. Fails if
/// nothing ends up registered.
pub fn build_registry(config: &Config) -> Result<ProviderRegistry, SandboxError> {
    let mut registry = ProviderRegistry::new(config.default_provider, config.auto_select_provider);

    match LocalContainerProvider::new(LocalContainerConfig {
        engine_host: config.engine_host.clone(),
        network: config.sandbox_network.clone(),
        ..Default::default()
    }) {
        Ok(provider) => registry.register(Arc::new(provider)),
        Err(e) => {
            tracing::warn!(error = %e, "local container backend unavailable, skipping");
        }
    }

    if config.remote_worker_configured() {
        // Both checked by remote_worker_configured.
        if let (Some(base_url), Some(api_token)) = (
            config.remote_worker_url.clone(),
            config.remote_worker_token.clone(),
        ) {
            registry.register(Arc::new(RemoteWorkerProvider::new(RemoteWorkerConfig {
                base_url,
                api_token,
            })));
        }
    }

    if registry.registered().is_empty() {
        return Err(SandboxError::ProviderUnavailable(
            "no sandbox backend could be registered".to_string(),
        ));
    }

    Ok(registry)
}
