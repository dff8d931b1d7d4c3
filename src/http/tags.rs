use std::collections::HashMap;

use ::http::StatusCode;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::errors::{DistributionErrorCode, Error, Result};

use super::{repository_name, AppState};

#[derive(Serialize)]
struct TagsResponse {
    name: String,
    tags: Vec<String>,
}

#[derive(Serialize)]
struct CatalogResponse {
    repositories: Vec<String>,
}

pub(crate) async fn list_tags(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let name = repository_name(&path_params)?;

    let tags = state.registry.list_tags(&name).await?;
    // repositories are derived from manifests, so no tags means no repo
    if tags.is_empty() {
        return Err(Error::DistributionSpecError(
            DistributionErrorCode::NameUnknown,
        ));
    }

    Ok((StatusCode::OK, Json(TagsResponse { name, tags })).into_response())
}

pub(crate) async fn list_repositories(State(state): State<AppState>) -> Result<Response> {
    let repositories = state.registry.list_repositories().await?;
    Ok((StatusCode::OK, Json(CatalogResponse { repositories })).into_response())
}
