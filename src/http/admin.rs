use std::collections::HashMap;

use ::http::StatusCode;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::errors::{DistributionErrorCode, Error, Result};

use super::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/api/registry/state", get(registry_state))
        .route("/api/registry/health", get(registry_health))
        .route("/api/registry/blobs", get(registry_blobs))
        .route("/api/registry/sessions", get(registry_sessions))
        .route("/api/registry/repositories/*name", get(repository_detail))
        .route("/api/registry/recovery/reset", post(recovery_reset))
        .route("/api/garbage-collect", post(garbage_collect))
        .route("/api/garbage-collect/stats", get(garbage_collect_stats))
}

async fn registry_state(State(state): State<AppState>) -> Result<Response> {
    let registry_state = state.registry.state().await?;
    Ok((StatusCode::OK, Json(registry_state)).into_response())
}

async fn registry_health(State(state): State<AppState>) -> Result<Response> {
    let report = state.registry.health().await?;
    let status = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(report)).into_response())
}

async fn registry_blobs(State(state): State<AppState>) -> Result<Response> {
    let rows = state.registry.scan_blobs().await?;
    Ok((StatusCode::OK, Json(rows)).into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    uuid: String,
    repository: String,
    created_at: String,
    last_active_at: String,
    chunks: i64,
    bytes_received: u64,
}

async fn registry_sessions(State(state): State<AppState>) -> Result<Response> {
    let sessions: Vec<SessionView> = state
        .registry
        .sessions_snapshot()
        .into_iter()
        .map(|(uuid, s)| SessionView {
            uuid: uuid.to_string(),
            repository: s.repository,
            created_at: s.created_at.to_rfc3339(),
            last_active_at: s.last_active.to_rfc3339(),
            chunks: s.chunks,
            bytes_received: s.bytes_received,
        })
        .collect();
    Ok((StatusCode::OK, Json(sessions)).into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestView {
    tag: String,
    digest: String,
    size: i64,
    media_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryView {
    name: String,
    tags: Vec<String>,
    manifests: Vec<ManifestView>,
}

async fn repository_detail(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let name = path_params
        .get("name")
        .ok_or(Error::MissingPathParameter("name"))?
        .trim_start_matches('/')
        .to_string();

    let tags = state.registry.list_tags(&name).await?;
    if tags.is_empty() {
        return Err(Error::DistributionSpecError(
            DistributionErrorCode::NameUnknown,
        ));
    }

    let mut manifests = Vec::with_capacity(tags.len());
    for tag in &tags {
        let reference = crate::metadata::ManifestRef::Tag(tag.clone());
        if let Some(record) = state.registry.get_manifest(&name, &reference).await? {
            manifests.push(ManifestView {
                tag: tag.clone(),
                digest: String::from(&record.digest),
                size: record.size(),
                media_type: record.media_type(),
            });
        }
    }

    Ok((
        StatusCode::OK,
        Json(RepositoryView {
            name,
            tags,
            manifests,
        }),
    )
        .into_response())
}

async fn recovery_reset(State(state): State<AppState>) -> Result<Response> {
    state.registry.reset_recovery();
    Ok((StatusCode::OK, "{}").into_response())
}

async fn garbage_collect(State(state): State<AppState>) -> Result<Response> {
    let report = state.registry.run_gc().await?;
    Ok((StatusCode::OK, Json(report)).into_response())
}

async fn garbage_collect_stats(State(state): State<AppState>) -> Result<Response> {
    let stats = state.registry.gc_stats().await?;
    Ok((StatusCode::OK, Json(stats)).into_response())
}
