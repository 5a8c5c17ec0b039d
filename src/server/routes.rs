use std::convert::Infallible;

use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{any, get, post};
use axum::Json;
use futures::stream::Stream;
use hyper::StatusCode;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

use super::{AppState, middleware, proxy, sandbox_routes};
use crate::sandbox::error::SandboxError;

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async {
            Json(json!({
                "status": "ok",
            }))
        }),
    );

    Router::new()
        .nest("/health", health_routes)
        .route("/api/catalog", get(get_catalog))
        .route("/api/providers", get(list_providers))
        .route("/api/events", get(event_stream))
        .route(
            "/api/sandboxes",
            get(sandbox_routes::list_sandboxes).post(sandbox_routes::create_sandbox),
        )
        .route(
            "/api/sandboxes/{id}",
            get(sandbox_routes::get_sandbox).delete(sandbox_routes::delete_sandbox),
        )
        .route("/api/sandboxes/{id}/start", post(sandbox_routes::start_sandbox))
        .route("/api/sandboxes/{id}/stop", post(sandbox_routes::stop_sandbox))
        .route("/api/sandboxes/{id}/health", get(sandbox_routes::sandbox_health))
        .route(
            "/api/sandboxes/{id}/workflows",
            post(sandbox_routes::execute_workflow),
        )
        .route(
            "/api/sandboxes/{id}/workflows/{workflow_id}",
            get(sandbox_routes::workflow_status),
        )
        .route(
            "/api/sandboxes/{id}/workflows/{workflow_id}/pause",
            post(sandbox_routes::pause_workflow),
        )
        .route(
            "/api/sandboxes/{id}/workflows/{workflow_id}/resume",
            post(sandbox_routes::resume_workflow),
        )
        .route(
            "/api/sandboxes/{id}/workflows/{workflow_id}/terminate",
            post(sandbox_routes::terminate_workflow),
        )
        .route("/api/sandboxes/{id}/proxy/{*path}", any(proxy::proxy_to_sandbox))
        .route("/api/sandboxes/{id}/stream/{*path}", get(proxy::relay_sse))
        .fallback(not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Map domain errors onto HTTP responses. Backend messages pass through
/// so callers see what the backend actually said.
pub fn error_response(err: SandboxError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::AlreadyExists(_) => StatusCode::CONFLICT,
        SandboxError::IncompatibleComposition(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SandboxError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SandboxError::Proxy(_) => StatusCode::BAD_GATEWAY,
        SandboxError::Backend(_) | SandboxError::Io(_) | SandboxError::Serde(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}

// --- Catalog & providers ---

async fn get_catalog(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "tiers": state.catalog.tiers,
        "flavors": state.catalog.flavors,
        "addons": state.catalog.addons,
    }))
}

async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<Value> = state
        .registry
        .registered()
        .iter()
        .map(|p| serde_json::to_value(p.info()).unwrap_or(Value::Null))
        .collect();
    Json(json!({
        "default": state.registry.default_kind(),
        "providers": providers,
    }))
}

// --- Lifecycle event stream ---

async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default()
                .event(event.event_type.as_sse_event())
                .data(data)))
        }
        // Lagged receivers skip missed events rather than erroring the
        // whole stream.
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_map_by_variant() {
        let cases = [
            (SandboxError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (SandboxError::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (
                SandboxError::IncompatibleComposition("x".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                SandboxError::ProviderUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (SandboxError::Proxy("x".into()), StatusCode::BAD_GATEWAY),
            (
                SandboxError::Backend("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(err).0, expected);
        }
    }

    #[test]
    fn error_body_carries_message() {
        let (_, Json(body)) = error_response(SandboxError::NotFound("sbx-9".into()));
        assert_eq!(body["error"], "sandbox not found: sbx-9");
    }
}
