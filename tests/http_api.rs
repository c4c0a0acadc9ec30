use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use file_storage_server::{
    config::Config, create_app, database::MemoryUsageStore, handlers::AppState,
};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    _temp_dir: TempDir,
    state: AppState,
    router: Router,
    token: String,
}

async fn setup(quota: i64) -> TestApp {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_root: temp_dir.path().to_path_buf(),
        watcher_enabled: false,
        ..Config::default()
    };
    let store = Arc::new(MemoryUsageStore::new().with_user("alice", quota));
    let state = AppState::build(config, store).await.unwrap();
    let token = state
        .jwt
        .issue_token("alice", chrono::Duration::hours(1))
        .unwrap();

    TestApp {
        _temp_dir: temp_dir,
        router: create_app(state.clone()),
        state,
        token,
    }
}

fn metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{} {}", key, general_purpose::STANDARD.encode(value)))
        .collect::<Vec<_>>()
        .join(",")
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> axum::response::Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    fn authed(&self) -> axum::http::request::Builder {
        Request::builder().header(header::AUTHORIZATION, format!("Bearer {}", self.token))
    }

    async fn create(&self, length: u64, meta: &str) -> axum::response::Response {
        self.send(
            self.authed()
                .method("POST")
                .uri("/api/uploads")
                .header("Upload-Length", length.to_string())
                .header("Upload-Metadata", meta)
                .header("Tus-Resumable", "1.0.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = setup(1000).await;
    let response = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .send(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_capability_discovery() {
    let app = setup(1000).await;
    let response = app
        .send(
            Request::builder()
                .method("OPTIONS")
                .uri("/api/uploads")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(headers["tus-resumable"], "1.0.0");
    assert_eq!(headers["tus-version"], "1.0.0");
    assert!(headers["tus-extension"]
        .to_str()
        .unwrap()
        .contains("creation-with-upload"));
    assert_eq!(
        headers["tus-max-size"],
        Config::default().max_upload_size.to_string().as_str()
    );
}

#[tokio::test]
async fn test_requests_without_token_are_unauthorized() {
    let app = setup(1000).await;
    let response = app
        .send(Request::builder().uri("/api/usage").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(
            Request::builder()
                .uri("/api/usage")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_resumable_upload_over_http() {
    let app = setup(1000).await;

    let response = app
        .create(13, &metadata(&[("filename", "hello.txt"), ("path", "/docs")]))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["upload-offset"], "0");
    let location = response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with("/api/uploads/"));

    let response = app
        .send(
            app.authed()
                .method("PATCH")
                .uri(&location)
                .header("Upload-Offset", "0")
                .header(header::CONTENT_TYPE, "application/offset+octet-stream")
                .body(Body::from("Hello, "))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()["upload-offset"], "7");
    assert_eq!(response.headers()["tus-resumable"], "1.0.0");

    let response = app
        .send(app.authed().method("HEAD").uri(&location).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["upload-offset"], "7");
    assert_eq!(response.headers()["upload-length"], "13");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

    let response = app
        .send(
            app.authed()
                .method("PATCH")
                .uri(&location)
                .header("Upload-Offset", "7")
                .header(header::CONTENT_TYPE, "application/offset+octet-stream")
                .body(Body::from("World!"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()["upload-offset"], "13");

    let written = std::fs::read(app.state.layout.home_dir("alice").join("docs/hello.txt")).unwrap();
    assert_eq!(written, b"Hello, World!");

    let response = app
        .send(app.authed().uri("/api/usage").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let usage = json_body(response).await;
    assert_eq!(usage["homeUsed"], 13);
    assert_eq!(usage["totalUsed"], 13);
    assert_eq!(usage["quota"], 1000);
    assert_eq!(usage["cached"], false);
    assert_eq!(usage["stale"], false);
}

#[tokio::test]
async fn test_creation_with_upload() {
    let app = setup(1000).await;
    let response = app
        .send(
            app.authed()
                .method("POST")
                .uri("/api/uploads")
                .header("Upload-Length", "5")
                .header("Upload-Metadata", metadata(&[("filename", "five.txt")]))
                .header(header::CONTENT_TYPE, "application/offset+octet-stream")
                .body(Body::from("12345"))
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["upload-offset"], "5");
    assert!(app.state.layout.home_dir("alice").join("five.txt").exists());
}

#[tokio::test]
async fn test_failed_creation_with_upload_keeps_no_reservation() {
    let app = setup(1000).await;
    let create_with_body = |length: &str, body: Vec<u8>| {
        app.authed()
            .method("POST")
            .uri("/api/uploads")
            .header("Upload-Length", length)
            .header("Upload-Metadata", metadata(&[("filename", "big.bin")]))
            .header(header::CONTENT_TYPE, "application/offset+octet-stream")
            .body(Body::from(body))
            .unwrap()
    };

    let response = app.send(create_with_body("900", vec![1u8; 901])).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(app.state.admission.outstanding("alice"), 0);
    assert_eq!(app.state.uploads.tracked_sessions(), 0);

    // the first chunk fails at promotion: nothing stays reserved either
    let home = app.state.layout.home_dir("alice");
    std::fs::create_dir_all(&home).unwrap();
    std::fs::write(home.join("blocker"), b"x").unwrap();
    let response = app
        .send(
            app.authed()
                .method("POST")
                .uri("/api/uploads")
                .header("Upload-Length", "3")
                .header("Upload-Metadata", metadata(&[("path", "blocker/a.bin")]))
                .header(header::CONTENT_TYPE, "application/offset+octet-stream")
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(app.state.admission.outstanding("alice"), 0);
    assert_eq!(app.state.uploads.tracked_sessions(), 0);

    let response = app.send(create_with_body("900", vec![1u8; 900])).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["upload-offset"], "900");
}

#[tokio::test]
async fn test_quota_rejection_body() {
    let app = setup(1000).await;
    assert_eq!(
        app.create(600, &metadata(&[("filename", "a.bin")])).await.status(),
        StatusCode::CREATED
    );

    let response = app.create(500, &metadata(&[("filename", "b.bin")])).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["tus-resumable"], "1.0.0");

    let body = json_body(response).await;
    assert_eq!(body["error"], "Storage quota exceeded");
    assert_eq!(body["quota"], 1000);
    assert_eq!(body["used"], 600);
    assert_eq!(body["requested"], 500);
}

#[tokio::test]
async fn test_protocol_errors() {
    let app = setup(1000).await;
    let response = app.create(10, &metadata(&[("filename", "a.bin")])).await;
    let location = response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();

    let wrong_type = app
        .send(
            app.authed()
                .method("PATCH")
                .uri(&location)
                .header("Upload-Offset", "0")
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await;
    assert_eq!(wrong_type.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let wrong_offset = app
        .send(
            app.authed()
                .method("PATCH")
                .uri(&location)
                .header("Upload-Offset", "4")
                .header(header::CONTENT_TYPE, "application/offset+octet-stream")
                .body(Body::from("abc"))
                .unwrap(),
        )
        .await;
    assert_eq!(wrong_offset.status(), StatusCode::CONFLICT);
    let body = json_body(wrong_offset).await;
    assert_eq!(body["expected"], 0);
    assert_eq!(body["got"], 4);

    let missing_length = app
        .send(
            app.authed()
                .method("POST")
                .uri("/api/uploads")
                .header("Upload-Metadata", metadata(&[("filename", "x")]))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(missing_length.status(), StatusCode::BAD_REQUEST);

    let someone_else = app
        .create(1, &metadata(&[("filename", "x"), ("username", "bob")]))
        .await;
    assert_eq!(someone_else.status(), StatusCode::FORBIDDEN);

    let terminated = app
        .send(app.authed().method("DELETE").uri(&location).body(Body::empty()).unwrap())
        .await;
    assert_eq!(terminated.status(), StatusCode::NO_CONTENT);

    let gone = app
        .send(app.authed().method("HEAD").uri(&location).body(Body::empty()).unwrap())
        .await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_trash_delete_and_restore() {
    let app = setup(1000).await;
    let home = app.state.layout.home_dir("alice");
    std::fs::create_dir_all(home.join("docs")).unwrap();
    std::fs::write(home.join("docs/a.txt"), b"abc").unwrap();

    let response = app
        .send(
            app.authed()
                .method("DELETE")
                .uri("/api/files/docs/a.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let entry = json_body(response).await;
    assert_eq!(entry["originalPath"], "docs/a.txt");
    let id = entry["id"].as_str().unwrap().to_string();
    assert!(!home.join("docs/a.txt").exists());

    let listed = json_body(
        app.send(app.authed().uri("/api/trash").body(Body::empty()).unwrap())
            .await,
    )
    .await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let restore_uri = format!("/api/trash/{}/restore", id);
    let response = app
        .send(app.authed().method("POST").uri(&restore_uri).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(home.join("docs/a.txt").exists());

    let response = app
        .send(app.authed().method("POST").uri(&restore_uri).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup(1000).await;
    app.create(10, &metadata(&[("filename", "a.bin")])).await;

    let response = app
        .send(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("uploads_total{outcome=\"created\"} 1"));
    assert!(text.contains("uploads_active 1"));
}
