use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use super::routes::error_response;
use crate::compose;
use crate::events::SandboxEventType;
use crate::sandbox::error::SandboxError;
use crate::sandbox::provider::{SandboxProvider, WorkflowRequest};
use crate::sandbox::types::{
    CreateSandboxRequest, ProviderKind, SandboxRecord, SandboxStatus,
};
use crate::settings::{AgentCredentials, to_container_env, to_worker_config};

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

// --- Create ---

#[derive(Debug, Deserialize)]
pub struct CreateSandboxBody {
    pub owner_id: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub addons: Vec<String>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub use_case: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub credentials: Option<AgentCredentials>,
}

#[tracing::instrument(skip_all, fields(owner_id = %body.owner_id))]
pub async fn create_sandbox(
    State(state): State<AppState>,
    Json(body): Json<CreateSandboxBody>,
) -> ApiResult {
    let catalog = &state.catalog;

    let tier = match &body.tier {
        Some(id) => catalog.tier(id).ok_or_else(|| {
            error_response(SandboxError::IncompatibleComposition(format!(
                "unknown resource tier '{id}'"
            )))
        })?,
        None => catalog.default_tier(),
    };
    let flavor = match &body.flavor {
        Some(id) => catalog.flavor(id).ok_or_else(|| {
            error_response(SandboxError::IncompatibleComposition(format!(
                "unknown flavor '{id}'"
            )))
        })?,
        None => catalog.default_flavor(),
    };
    let mut addons = Vec::with_capacity(body.addons.len());
    for id in &body.addons {
        addons.push(catalog.addon(id).ok_or_else(|| {
            error_response(SandboxError::IncompatibleComposition(format!(
                "unknown addon '{id}'"
            )))
        })?);
    }

    let spec =
        compose::compose(&state.image_coords, tier, flavor, &addons).map_err(error_response)?;

    let selection = state
        .registry
        .select(body.provider, body.use_case.as_deref())
        .map_err(error_response)?;

    let (env, auth) = adapt_credentials(body.credentials);
    let request = CreateSandboxRequest {
        owner_id: body.owner_id.clone(),
        spec,
        directory: body.directory.unwrap_or_else(|| "/workspace".to_string()),
        git_url: body.git_url,
        branch: body.branch,
        env,
        auth,
    };

    tracing::info!(
        provider = %selection.kind,
        fell_back = selection.fell_back,
        image = %request.spec.image,
        "creating sandbox"
    );

    let record = selection
        .provider
        .create_sandbox(request)
        .await
        .map_err(error_response)?;

    state
        .sandboxes
        .write()
        .await
        .insert(record.id.clone(), record.clone());

    state.events.emit(
        &record.id,
        SandboxEventType::Created,
        json!({
            "owner_id": record.owner_id,
            "provider": record.provider,
            "provider_fallback": selection.fell_back,
            "image_tier": record.resource_tier_id,
        }),
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "sandbox": record,
            "provider_fallback": selection.fell_back,
        })),
    ))
}

// --- Read ---

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner_id: String,
}

pub async fn list_sandboxes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let mut records: Vec<SandboxRecord> = Vec::new();

    for provider in state.registry.registered() {
        match provider.list_sandboxes(&query.owner_id).await {
            Ok(mut found) => records.append(&mut found),
            // One broken backend must not hide the others' sandboxes.
            Err(e) => {
                tracing::warn!(provider = %provider.info().kind, error = %e, "list failed, skipping backend");
            }
        }
    }

    let mut store = state.sandboxes.write().await;
    for record in &mut records {
        if let Some(known) = store.get(&record.id) {
            merge_descriptor(record, known);
        }
        store.insert(record.id.clone(), record.clone());
    }

    Json(json!({ "sandboxes": records }))
}

pub async fn get_sandbox(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let (known, provider) = lookup(&state, &id).await?;

    match provider.get_sandbox(&id).await.map_err(error_response)? {
        Some(mut fresh) => {
            merge_descriptor(&mut fresh, &known);
            state
                .sandboxes
                .write()
                .await
                .insert(id.clone(), fresh.clone());
            Ok((StatusCode::OK, Json(json!({ "sandbox": fresh }))))
        }
        None => {
            // Backend no longer knows it; drop the stale index entry.
            state.sandboxes.write().await.remove(&id);
            Err(error_response(SandboxError::NotFound(id)))
        }
    }
}

pub async fn sandbox_health(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let (_, provider) = lookup(&state, &id).await?;
    let healthy = provider.health_check(&id).await;
    Ok((StatusCode::OK, Json(json!({ "id": id, "healthy": healthy }))))
}

// --- Lifecycle ---

#[tracing::instrument(skip(state))]
pub async fn start_sandbox(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let (known, provider) = lookup(&state, &id).await?;
    let was_sleeping = known.status == SandboxStatus::Sleeping;

    provider.start_sandbox(&id).await.map_err(error_response)?;
    let record = refresh(&state, &id, &known, provider.as_ref()).await?;

    let event = if was_sleeping {
        SandboxEventType::Woken
    } else {
        SandboxEventType::Started
    };
    state
        .events
        .emit(&id, event, json!({ "status": record.status }));

    Ok((StatusCode::OK, Json(json!({ "sandbox": record }))))
}

#[tracing::instrument(skip(state))]
pub async fn stop_sandbox(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let (known, provider) = lookup(&state, &id).await?;

    provider.stop_sandbox(&id).await.map_err(error_response)?;
    let record = refresh(&state, &id, &known, provider.as_ref()).await?;

    let event = if provider.info().supports_hibernate {
        SandboxEventType::Hibernated
    } else {
        SandboxEventType::Stopped
    };
    state
        .events
        .emit(&id, event, json!({ "status": record.status }));

    Ok((StatusCode::OK, Json(json!({ "sandbox": record }))))
}

#[tracing::instrument(skip(state))]
pub async fn delete_sandbox(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let (known, provider) = lookup(&state, &id).await?;

    match provider.delete_sandbox(&id).await {
        Ok(()) => {
            state.sandboxes.write().await.remove(&id);
            state
                .events
                .emit(&id, SandboxEventType::Deleted, json!({}));
            Ok((StatusCode::OK, Json(json!({ "deleted": id }))))
        }
        Err(e) => {
            // Keep the record visible in Error state so the teardown
            // failure can be retried or inspected.
            let mut record = known;
            record.status = SandboxStatus::Error;
            state.sandboxes.write().await.insert(id.clone(), record);
            state
                .events
                .emit(&id, SandboxEventType::Error, json!({ "error": e.to_string() }));
            Err(error_response(e))
        }
    }
}

// --- Workflows ---

pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<WorkflowRequest>,
) -> ApiResult {
    let (_, provider) = lookup(&state, &id).await?;
    let ops = workflow_ops(provider.as_ref())?;

    let execution = ops.execute(&id, body).await.map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "workflow": execution })),
    ))
}

pub async fn workflow_status(
    State(state): State<AppState>,
    Path((id, workflow_id)): Path<(String, String)>,
) -> ApiResult {
    let (_, provider) = lookup(&state, &id).await?;
    let ops = workflow_ops(provider.as_ref())?;

    let execution = ops.status(&workflow_id).await.map_err(error_response)?;
    Ok((StatusCode::OK, Json(json!({ "workflow": execution }))))
}

pub async fn pause_workflow(
    State(state): State<AppState>,
    Path((id, workflow_id)): Path<(String, String)>,
) -> ApiResult {
    let (_, provider) = lookup(&state, &id).await?;
    let ops = workflow_ops(provider.as_ref())?;
    ops.pause(&workflow_id).await.map_err(error_response)?;
    Ok((StatusCode::OK, Json(json!({ "workflow": workflow_id, "action": "pause" }))))
}

pub async fn resume_workflow(
    State(state): State<AppState>,
    Path((id, workflow_id)): Path<(String, String)>,
) -> ApiResult {
    let (_, provider) = lookup(&state, &id).await?;
    let ops = workflow_ops(provider.as_ref())?;
    ops.resume(&workflow_id).await.map_err(error_response)?;
    Ok((StatusCode::OK, Json(json!({ "workflow": workflow_id, "action": "resume" }))))
}

pub async fn terminate_workflow(
    State(state): State<AppState>,
    Path((id, workflow_id)): Path<(String, String)>,
) -> ApiResult {
    let (_, provider) = lookup(&state, &id).await?;
    let ops = workflow_ops(provider.as_ref())?;
    ops.terminate(&workflow_id).await.map_err(error_response)?;
    Ok((StatusCode::OK, Json(json!({ "workflow": workflow_id, "action": "terminate" }))))
}

// --- Helpers ---

/// A caller that sent no credentials at all gets `auth: None`, so remote
/// backends skip the config push entirely instead of pushing `{}`.
fn adapt_credentials(
    credentials: Option<AgentCredentials>,
) -> (
    std::collections::BTreeMap<String, String>,
    Option<crate::settings::WorkerAuthConfig>,
) {
    match credentials {
        Some(creds) => (to_container_env(&creds), Some(to_worker_config(&creds))),
        None => (Default::default(), None),
    }
}

/// Resolve a sandbox id to its last-known record and its backend.
pub(super) async fn lookup(
    state: &AppState,
    id: &str,
) -> Result<(SandboxRecord, Arc<dyn SandboxProvider>), (StatusCode, Json<Value>)> {
    let known = state
        .sandboxes
        .read()
        .await
        .get(id)
        .cloned()
        .ok_or_else(|| error_response(SandboxError::NotFound(id.to_string())))?;

    let provider = state.registry.get(known.provider).ok_or_else(|| {
        error_response(SandboxError::ProviderUnavailable(format!(
            "provider {} is not registered",
            known.provider
        )))
    })?;

    Ok((known, provider))
}

async fn refresh(
    state: &AppState,
    id: &str,
    known: &SandboxRecord,
    provider: &dyn SandboxProvider,
) -> Result<SandboxRecord, (StatusCode, Json<Value>)> {
    let mut fresh = provider
        .get_sandbox(id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(SandboxError::NotFound(id.to_string())))?;

    merge_descriptor(&mut fresh, known);
    state
        .sandboxes
        .write()
        .await
        .insert(id.to_string(), fresh.clone());
    Ok(fresh)
}

/// Backends are authoritative for status and address; the control plane
/// is authoritative for the composition descriptor, which some backends
/// do not persist.
fn merge_descriptor(fresh: &mut SandboxRecord, known: &SandboxRecord) {
    if fresh.resource_tier_id.is_empty() {
        fresh.resource_tier_id = known.resource_tier_id.clone();
    }
    if fresh.flavor_id.is_empty() {
        fresh.flavor_id = known.flavor_id.clone();
    }
    if fresh.addon_ids.is_empty() {
        fresh.addon_ids = known.addon_ids.clone();
    }
    if fresh.owner_id.is_empty() {
        fresh.owner_id = known.owner_id.clone();
    }
    fresh.created_at = known.created_at;
}

fn workflow_ops(
    provider: &dyn SandboxProvider,
) -> Result<&dyn crate::sandbox::provider::WorkflowOps, (StatusCode, Json<Value>)> {
    provider.workflow_ops().ok_or_else(|| {
        (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({
                "error": format!(
                    "provider {} does not support workflows",
                    provider.info().kind
                )
            })),
        )
    })
}
