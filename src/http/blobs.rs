use std::collections::HashMap;

use ::http::StatusCode;
use axum::body::StreamBody;
use axum::extract::{Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use headers::Header;
use hyper::body::Body;
use uuid::Uuid;

use crate::errors::{DistributionErrorCode, Error, Result};
use crate::oci_digest::OciDigest;
use crate::registry::StartUpload;

use super::headers::Range;
use super::{repository_name, AppState};

// /v2/<name>/blobs/uploads/
//
// Initiates an upload session. With a `digest` query parameter naming an
// already-finalized blob, short-circuits to 201 without minting a session.
pub(crate) async fn uploads_post(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
    Query(query_params): Query<HashMap<String, String>>,
) -> Result<Response> {
    let name = repository_name(&path_params)?;
    let digest = query_params.get("digest").map(String::as_str);

    match state.registry.start_upload(&name, digest).await? {
        StartUpload::AlreadyExists { location } => {
            let mut headers = HeaderMap::new();
            headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
            Ok((StatusCode::CREATED, headers, "").into_response())
        }
        StartUpload::Started { session, location } => {
            let mut headers = HeaderMap::new();
            headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
            headers.insert(
                HeaderName::from_static("docker-upload-uuid"),
                HeaderValue::from_str(session.to_string().as_str())?,
            );
            Ok((StatusCode::ACCEPTED, headers, "").into_response())
        }
    }
}

fn session_params(path_params: &HashMap<String, String>) -> Result<(Uuid, i64)> {
    let session = path_params
        .get("session")
        .ok_or(Error::MissingPathParameter("session"))?;
    let session = Uuid::parse_str(session)?;

    let index = path_params
        .get("index")
        .ok_or(Error::MissingPathParameter("index"))?;
    let index = index.parse::<i64>().map_err(|_| {
        Error::DistributionSpecError(DistributionErrorCode::BlobUploadInvalid)
    })?;

    Ok((session, index))
}

// PATCH /v2/uploads/<session>/<index>
//
// The index must equal the session's current chunk count.
pub(crate) async fn uploads_patch(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
    request: Request<Body>,
) -> Result<Response> {
    let (session, index) = session_params(&path_params)?;

    let appended = state
        .registry
        .append_chunk(&session, index, request.into_body())
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, HeaderValue::from_str(&appended.location)?);
    headers.insert(
        HeaderName::from_static("docker-upload-uuid"),
        HeaderValue::from_str(session.to_string().as_str())?,
    );
    let range = Range::received(appended.total_bytes);
    headers.insert(Range::name(), HeaderValue::from_str(&range.to_string())?);

    Ok((StatusCode::ACCEPTED, headers, "").into_response())
}

// PUT /v2/uploads/<session>/<index>?digest=sha256:...
//
// Stitches, verifies and finalizes. On digest mismatch or a chunk gap the
// session survives for a retry.
pub(crate) async fn uploads_put(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
    Query(query_params): Query<HashMap<String, String>>,
) -> Result<Response> {
    let (session, _) = session_params(&path_params)?;
    let digest = query_params
        .get("digest")
        .ok_or(Error::MissingQueryParameter("digest"))?;

    let finalized = state.registry.finalize_upload(&session, digest).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&finalized.location)?,
    );
    headers.insert(
        HeaderName::from_static("docker-content-digest"),
        HeaderValue::from_str(&String::from(&finalized.digest))?,
    );

    Ok((StatusCode::CREATED, headers, "").into_response())
}

pub(crate) async fn get_blob(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let digest: &str = path_params
        .get("digest")
        .ok_or(Error::MissingPathParameter("digest"))?;
    let oci_digest: OciDigest = digest.try_into()?;

    if let Some((blob, body)) = state.registry.get_blob(&oci_digest).await? {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("docker-content-digest"),
            HeaderValue::from_str(digest)?,
        );
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(blob.size.to_string().as_str())?,
        );
        Ok((StatusCode::OK, headers, StreamBody::new(body)).into_response())
    } else {
        Err(Error::DistributionSpecError(
            DistributionErrorCode::BlobUnknown,
        ))
    }
}

pub(crate) async fn head_blob(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let digest: &str = path_params
        .get("digest")
        .ok_or(Error::MissingPathParameter("digest"))?;
    let oci_digest: OciDigest = digest.try_into()?;

    if state.registry.blob_exists(&oci_digest).await? {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("docker-content-digest"),
            HeaderValue::from_str(digest)?,
        );
        Ok((StatusCode::OK, headers, "").into_response())
    } else {
        Err(Error::DistributionSpecError(
            DistributionErrorCode::BlobUnknown,
        ))
    }
}

pub(crate) async fn delete_blob(
    State(state): State<AppState>,
    Path(path_params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let digest: &str = path_params
        .get("digest")
        .ok_or(Error::MissingPathParameter("digest"))?;
    let oci_digest: OciDigest = digest.try_into()?;

    if state.registry.delete_blob(&oci_digest).await? {
        Ok((StatusCode::ACCEPTED, "").into_response())
    } else {
        Err(Error::DistributionSpecError(
            DistributionErrorCode::BlobUnknown,
        ))
    }
}
