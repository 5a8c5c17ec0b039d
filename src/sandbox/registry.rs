//! Provider selection.
//!
//! Resolution order: explicit request, then use-case hint, then the
//! configured default. Selection only consults registration state and
//! capability flags — it never calls into a backend, so choosing a
//! provider is always cheap and infallible network-wise.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::SandboxError;
use super::provider::SandboxProvider;
use super::types::ProviderKind;

/// Outcome of a selection. `fell_back` is true when the requested
/// backend was unavailable and the default was substituted; callers
/// surface that to the user (response header, event) rather than
/// silently honoring a different backend.
pub struct Selection {
    pub kind: ProviderKind,
    pub provider: Arc<dyn SandboxProvider>,
    pub fell_back: bool,
}

pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn SandboxProvider>>,
    default_kind: ProviderKind,
    /// When set, an unavailable explicit/use-case choice degrades to the
    /// default instead of failing the request.
    auto_select: bool,
}

impl ProviderRegistry {
    pub fn new(default_kind: ProviderKind, auto_select: bool) -> Self {
        Self {
            providers: HashMap::new(),
            default_kind,
            auto_select,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn SandboxProvider>) {
        let kind = provider.info().kind;
        tracing::info!(provider = %kind, "registered sandbox provider");
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn SandboxProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn default_kind(&self) -> ProviderKind {
        self.default_kind
    }

    /// Capability flags for a registered backend, without touching it.
    pub fn capabilities(&self, kind: ProviderKind) -> Option<crate::sandbox::types::ProviderInfo> {
        self.providers.get(&kind).map(|p| p.info())
    }

    /// All registered providers, for the capability listing endpoint.
    pub fn registered(&self) -> Vec<Arc<dyn SandboxProvider>> {
        self.providers.values().cloned().collect()
    }

    pub fn select(
        &self,
        explicit: Option<ProviderKind>,
        use_case: Option<&str>,
    ) -> Result<Selection, SandboxError> {
        // The use-case table is a heuristic; it only participates when
        // auto-selection is enabled.
        let hinted = if self.auto_select {
            use_case.and_then(kind_for_use_case)
        } else {
            None
        };
        let wanted = explicit.or(hinted);

        if let Some(kind) = wanted {
            if let Some(provider) = self.get(kind) {
                return Ok(Selection {
                    kind,
                    provider,
                    fell_back: false,
                });
            }
            if !self.auto_select {
                return Err(SandboxError::ProviderUnavailable(format!(
                    "provider {kind} is not registered"
                )));
            }
            tracing::warn!(
                requested = %kind,
                fallback = %self.default_kind,
                "requested provider unavailable, falling back to default"
            );
            let provider = self.require_default()?;
            return Ok(Selection {
                kind: self.default_kind,
                provider,
                fell_back: true,
            });
        }

        let provider = self.require_default()?;
        Ok(Selection {
            kind: self.default_kind,
            provider,
            fell_back: false,
        })
    }

    fn require_default(&self) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
        self.get(self.default_kind).ok_or_else(|| {
            SandboxError::ProviderUnavailable(format!(
                "default provider {} is not registered",
                self.default_kind
            ))
        })
    }
}

/// Use-case hint → preferred backend. Unrecognized hints select nothing
/// and fall through to the default.
fn kind_for_use_case(use_case: &str) -> Option<ProviderKind> {
    match use_case {
        "batch" | "ci" => Some(ProviderKind::RemoteWorker),
        "development" | "interactive" => Some(ProviderKind::LocalContainer),
        _ => None,
    }
}
