//! The Distribution API v2 facade plus the admin/observability surface,
//! mapped onto the registry engine.

use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::State;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::middleware::{self as axum_middleware, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{self, TraceLayer};

pub mod headers;

mod admin;
pub(crate) mod blobs;
mod manifests;
mod tags;

use crate::config::AuthConfig;
use crate::errors::{Error, Result};
use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub auth: AuthConfig,
}

/// HTTP Basic check over every `/v2/*` and `/api/*` route when enabled.
async fn require_auth<B>(
    State(state): State<AppState>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    if !state.auth.enabled {
        return next.run(req).await;
    }

    let expected = format!(
        "Basic {}",
        base64::encode(format!("{}:{}", state.auth.username, state.auth.password))
    );
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        return next.run(req).await;
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Docker Registry\""),
    );
    (StatusCode::UNAUTHORIZED, headers, "authentication required").into_response()
}

async fn api_version() -> Result<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str("application/json")?,
    );
    Ok((StatusCode::OK, headers, "{}").into_response())
}

/// Repository names may span one or two path segments
/// (`busybox`, `dockage/mailcatcher`); routes register both shapes and
/// handlers join the segments back together.
pub(crate) fn repository_name(params: &HashMap<String, String>) -> Result<String> {
    let name = params
        .get("name")
        .ok_or(Error::MissingPathParameter("name"))?;
    Ok(match params.get("name2") {
        Some(second) => format!("{name}/{second}"),
        None => name.clone(),
    })
}

pub fn router(state: AppState) -> Result<Router> {
    let app = Router::new()
        .route("/v2/", get(api_version))
        .route("/v2/_catalog", get(tags::list_repositories))
        .route(
            "/v2/uploads/:session/:index",
            patch(blobs::uploads_patch).put(blobs::uploads_put),
        )
        .route("/v2/:name/blobs/uploads/", post(blobs::uploads_post))
        .route("/v2/:name/:name2/blobs/uploads/", post(blobs::uploads_post))
        .route(
            "/v2/:name/blobs/:digest",
            get(blobs::get_blob)
                .head(blobs::head_blob)
                .delete(blobs::delete_blob),
        )
        .route(
            "/v2/:name/:name2/blobs/:digest",
            get(blobs::get_blob)
                .head(blobs::head_blob)
                .delete(blobs::delete_blob),
        )
        .route(
            "/v2/:name/manifests/:reference",
            get(manifests::get_manifest)
                .head(manifests::head_manifest)
                .put(manifests::put_manifest)
                .delete(manifests::delete_manifest),
        )
        .route(
            "/v2/:name/:name2/manifests/:reference",
            get(manifests::get_manifest)
                .head(manifests::head_manifest)
                .put(manifests::put_manifest)
                .delete(manifests::delete_manifest),
        )
        .route("/v2/:name/tags/list", get(tags::list_tags))
        .route("/v2/:name/:name2/tags/list", get(tags::list_tags))
        .route("/v2/:name", delete(manifests::delete_repository))
        .route("/v2/:name/:name2", delete(manifests::delete_repository))
        .merge(admin::router())
        .layer(
            TraceLayer::new_for_http()
                .on_response(trace::DefaultOnResponse::new())
                .on_request(trace::DefaultOnRequest::new()),
        )
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_str("docker-distribution-api-version")?,
            HeaderValue::from_str("registry/2.0")?,
        ))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ))
        .with_state(state);

    Ok(app)
}
