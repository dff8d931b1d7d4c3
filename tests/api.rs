use std::sync::Arc;

use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use hyper::body::Body;
use serde_json::Value;
use tower::ServiceExt;

use stevedore::http::{router, AppState};
use stevedore::metadata::{MemoryStore, DOCKER_MANIFEST_V2};
use stevedore::registry::Registry;
use stevedore::{AuthConfig, CleanupConfig, OciDigest};

fn test_router(auth: AuthConfig) -> Router {
    let registry = Registry::new(Arc::new(MemoryStore::new()), CleanupConfig::default());
    router(AppState { registry, auth }).unwrap()
}

fn open_router() -> Router {
    test_router(AuthConfig::default())
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn put_manifest_request(uri: &str, bytes: &[u8]) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::CONTENT_TYPE, DOCKER_MANIFEST_V2)
        .body(Body::from(bytes.to_vec()))
        .unwrap()
}

fn header_str<'r>(response: &'r Response, name: &str) -> &'r str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
}

#[tokio::test]
async fn api_probe_carries_version_header() {
    let app = open_router();
    let response = send(&app, get("/v2/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "docker-distribution-api-version"),
        "registry/2.0"
    );
}

#[tokio::test]
async fn chunked_push_and_pull_over_http() {
    let app = open_router();
    let content = b"the quick brown fox";
    let digest = OciDigest::from_content(content);

    // initiate
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/dockage/mailcatcher/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let session = header_str(&response, "docker-upload-uuid").to_string();
    let location = header_str(&response, header::LOCATION.as_str()).to_string();
    assert_eq!(location, format!("/v2/uploads/{session}/0"));

    // append two chunks
    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(location.as_str())
            .body(Body::from(&content[..9]))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-9");
    let location = header_str(&response, header::LOCATION.as_str()).to_string();
    assert_eq!(location, format!("/v2/uploads/{session}/1"));

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(location.as_str())
            .body(Body::from(&content[9..]))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-19");
    let location = header_str(&response, header::LOCATION.as_str()).to_string();

    // finalize
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_str(&response, "docker-content-digest"),
        String::from(&digest)
    );
    assert_eq!(
        header_str(&response, header::LOCATION.as_str()),
        format!("/v2/dockage/mailcatcher/blobs/{digest}")
    );

    // pull
    let response = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri(format!("/v2/dockage/mailcatcher/blobs/{digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(&app, get(&format!("/v2/dockage/mailcatcher/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(bytes.as_ref(), content);
}

#[tokio::test]
async fn initiate_with_known_digest_short_circuits() {
    let app = open_router();
    let content = b"layer bytes";
    let digest = OciDigest::from_content(content);

    // push once
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/cache/repo/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let location = header_str(&response, header::LOCATION.as_str()).to_string();
    send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(location.as_str())
            .body(Body::from(content.to_vec()))
            .unwrap(),
    )
    .await;
    let session = header_str(&response, "docker-upload-uuid");
    send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/uploads/{session}/1?digest={digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    // POST with the digest now short-circuits, repeatably
    for _ in 0..2 {
        let response = send(
            &app,
            Request::builder()
                .method("POST")
                .uri(format!("/v2/cache/repo/blobs/uploads/?digest={digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            header_str(&response, header::LOCATION.as_str()),
            format!("/v2/cache/repo/blobs/{digest}")
        );
    }
}

#[tokio::test]
async fn digest_mismatch_rejected_session_survives() {
    let app = open_router();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/test/repo/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let session = header_str(&response, "docker-upload-uuid").to_string();

    send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(format!("/v2/uploads/{session}/0"))
            .body(Body::from("hello"))
            .unwrap(),
    )
    .await;

    let bogus = format!("sha256:{}", "deadbeef".repeat(8));
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/uploads/{session}/1?digest={bogus}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // nothing was finalized
    let response = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri(format!("/v2/test/repo/blobs/{bogus}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // the session kept its chunk; a corrected PUT succeeds
    let digest = OciDigest::from_content(b"hello");
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/uploads/{session}/1?digest={digest}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn manifest_lifecycle_and_ghost_prevention() {
    let app = open_router();
    let manifest = br#"{"schemaVersion":2}"#;

    for tag in ["tag1", "tag2"] {
        let response = send(
            &app,
            put_manifest_request(&format!("/v2/multi/repo/manifests/{tag}"), manifest),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let catalog = body_json(send(&app, get("/v2/_catalog")).await).await;
    assert_eq!(catalog["repositories"], serde_json::json!(["multi/repo"]));

    let tags = body_json(send(&app, get("/v2/multi/repo/tags/list")).await).await;
    assert_eq!(tags["name"], "multi/repo");
    assert_eq!(tags["tags"], serde_json::json!(["tag1", "tag2"]));

    // manifest GET round-trips with digest header and inferred media type
    let response = send(&app, get("/v2/multi/repo/manifests/tag1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "docker-content-digest"),
        String::from(&OciDigest::from_content(manifest))
    );
    assert_eq!(
        header_str(&response, header::CONTENT_TYPE.as_str()),
        DOCKER_MANIFEST_V2
    );

    // deleting one tag keeps the repository listed
    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/v2/multi/repo/manifests/tag1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let catalog = body_json(send(&app, get("/v2/_catalog")).await).await;
    assert_eq!(catalog["repositories"], serde_json::json!(["multi/repo"]));

    // deleting a missing manifest is a 404
    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/v2/multi/repo/manifests/tag1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // deleting the last tag removes the repository from the catalog
    send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/v2/multi/repo/manifests/tag2")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let catalog = body_json(send(&app, get("/v2/_catalog")).await).await;
    assert_eq!(catalog["repositories"], serde_json::json!([]));
}

#[tokio::test]
async fn manifest_bad_content_type_rejected() {
    let app = open_router();
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri("/v2/test/repo/manifests/latest")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(r#"{"schemaVersion":2}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn repository_delete_reports_count() {
    let app = open_router();
    let manifest = br#"{"schemaVersion":2}"#;
    for tag in ["a", "b"] {
        send(
            &app,
            put_manifest_request(&format!("/v2/doomed/repo/manifests/{tag}"), manifest),
        )
        .await;
    }

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/v2/doomed/repo")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["manifestsDeleted"], 2);

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/v2/doomed/repo")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn basic_auth_enforced_when_enabled() {
    let app = test_router(AuthConfig {
        enabled: true,
        username: "admin".to_string(),
        password: "hunter2".to_string(),
    });

    let response = send(&app, get("/v2/")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        header_str(&response, header::WWW_AUTHENTICATE.as_str()),
        "Basic realm=\"Docker Registry\""
    );

    let credentials = base64::encode("admin:hunter2");
    let response = send(
        &app,
        Request::builder()
            .uri("/v2/")
            .header(header::AUTHORIZATION, format!("Basic {credentials}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let wrong = base64::encode("admin:wrong");
    let response = send(
        &app,
        Request::builder()
            .uri("/v2/_catalog")
            .header(header::AUTHORIZATION, format!("Basic {wrong}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_surface_reports_state_and_gc() {
    let app = open_router();
    let manifest = br#"{"schemaVersion":2}"#;
    send(
        &app,
        put_manifest_request("/v2/admin/repo/manifests/latest", manifest),
    )
    .await;

    let state = body_json(send(&app, get("/api/registry/state")).await).await;
    assert_eq!(state["repositories"], 1);
    assert_eq!(state["manifests"], 1);
    assert_eq!(state["activeSessions"], 0);

    let health = send(&app, get("/api/registry/health")).await;
    assert_eq!(health.status(), StatusCode::OK);
    let health = body_json(health).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["storageWritable"], true);

    let detail = body_json(send(&app, get("/api/registry/repositories/admin/repo")).await).await;
    assert_eq!(detail["name"], "admin/repo");
    assert_eq!(detail["tags"], serde_json::json!(["latest"]));

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/garbage-collect")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["blobsRemoved"], 0);
    assert_eq!(report["manifestsRemoved"], 0);

    let stats = body_json(send(&app, get("/api/garbage-collect/stats")).await).await;
    assert_eq!(stats["manifests"], 1);
    assert_eq!(stats["unreferencedBlobs"], 0);

    let sessions = body_json(send(&app, get("/api/registry/sessions")).await).await;
    assert_eq!(sessions, serde_json::json!([]));
}

#[tokio::test]
async fn single_segment_repository_names_work() {
    let app = open_router();
    let manifest = br#"{"schemaVersion":2}"#;

    let response = send(
        &app,
        put_manifest_request("/v2/busybox/manifests/latest", manifest),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let tags = body_json(send(&app, get("/v2/busybox/tags/list")).await).await;
    assert_eq!(tags["name"], "busybox");

    let response = send(&app, get("/v2/busybox/manifests/latest")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_blob_and_manifest_are_404() {
    let app = open_router();
    let digest = OciDigest::from_content(b"missing");

    let response = send(&app, get(&format!("/v2/nowhere/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, get("/v2/nowhere/manifests/latest")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, get("/v2/nowhere/tags/list")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
