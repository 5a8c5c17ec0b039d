pub mod middleware;
pub mod proxy;
pub mod routes;
pub mod sandbox_routes;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use tokio::sync::RwLock;

use crate::catalog::Catalog;
use crate::compose::ImageCoordinates;
use crate::events::EventBus;
use crate::sandbox::registry::ProviderRegistry;
use crate::sandbox::types::SandboxRecord;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub catalog: Arc<Catalog>,
    pub image_coords: ImageCoordinates,
    /// Control-plane view of known sandboxes. Providers stay the source
    /// of truth for status; this index maps ids to their backend.
    pub sandboxes: Arc<RwLock<HashMap<String, SandboxRecord>>>,
    pub events: EventBus,
}

impl AppState {
    pub fn new(registry: ProviderRegistry, catalog: Catalog, image_coords: ImageCoordinates) -> Self {
        Self {
            registry: Arc::new(registry),
            catalog: Arc::new(catalog),
            image_coords,
            sandboxes: Arc::new(RwLock::new(HashMap::new())),
            events: EventBus::new(256),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
