use std::collections::HashMap;
use std::str::FromStr;

use ::http::StatusCode;
use axum::extract::{Path, State, TypedHeader};
use axum::headers::ContentType;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Serialize;

use crate::errors::{DistributionErrorCode, Error, Result};
use crate::metadata::ManifestRef;

use super::{repository_name, AppState};

fn manifest_ref(path_params: &HashMap<String, String>) -> Result<ManifestRef> {
    let reference = path_params
        .get("reference")
        .ok_or(Error::MissingPathParameter("reference"))?;
    ManifestRef::from_str(reference)
}

pub(crate) async fn put_manifest(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
    content_type: Option<TypedHeader<ContentType>>,
    bytes: Bytes,
) -> Result<Response> {
    let name = repository_name(&path_params)?;
    let reference = manifest_ref(&path_params)?;
    let content_type = content_type
        .ok_or(Error::MissingHeader("Content-Type"))?
        .0
        .to_string();

    let outcome = state
        .registry
        .put_manifest(&name, &reference, &content_type, bytes)
        .await?;

    let location = format!("/v2/{}/manifests/{}", name, outcome.digest);
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
    headers.insert(
        HeaderName::from_static("docker-content-digest"),
        HeaderValue::from_str(&String::from(&outcome.digest))?,
    );

    Ok((StatusCode::CREATED, headers, "").into_response())
}

pub(crate) async fn get_manifest(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let name = repository_name(&path_params)?;
    let reference = manifest_ref(&path_params)?;

    if let Some(manifest) = state.registry.get_manifest(&name, &reference).await? {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&manifest.media_type())?,
        );
        headers.insert(
            HeaderName::from_static("docker-content-digest"),
            HeaderValue::from_str(&String::from(&manifest.digest))?,
        );
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(manifest.size().to_string().as_str())?,
        );
        Ok((StatusCode::OK, headers, manifest.bytes).into_response())
    } else {
        Err(Error::DistributionSpecError(
            DistributionErrorCode::ManifestUnknown,
        ))
    }
}

pub(crate) async fn head_manifest(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let name = repository_name(&path_params)?;
    let reference = manifest_ref(&path_params)?;

    // existence probe only; the stored document is not fetched
    if let Some(digest) = state.registry.manifest_digest(&name, &reference).await? {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("docker-content-digest"),
            HeaderValue::from_str(&String::from(&digest))?,
        );
        Ok((StatusCode::OK, headers, "").into_response())
    } else {
        Err(Error::DistributionSpecError(
            DistributionErrorCode::ManifestUnknown,
        ))
    }
}

pub(crate) async fn delete_manifest(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let name = repository_name(&path_params)?;
    let reference = manifest_ref(&path_params)?;

    if state.registry.delete_manifest(&name, &reference).await? {
        Ok((StatusCode::ACCEPTED, "").into_response())
    } else {
        Err(Error::DistributionSpecError(
            DistributionErrorCode::ManifestUnknown,
        ))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryDeleted {
    manifests_deleted: u64,
}

pub(crate) async fn delete_repository(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let name = repository_name(&path_params)?;

    let deleted = state.registry.delete_repository(&name).await?;
    if deleted == 0 {
        return Err(Error::DistributionSpecError(
            DistributionErrorCode::NameUnknown,
        ));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(RepositoryDeleted {
            manifests_deleted: deleted,
        }),
    )
        .into_response())
}
