#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request};
use measured_launch::engine::{PodmanEngine, WorkloadEngine};
use measured_launch::measurement::testing::InMemoryBackend;
use measured_launch::{AppState, ServiceConfig};

pub const BOUNDARY: &str = "measured-launch-test-boundary";

pub fn config_for(dir: &Path) -> ServiceConfig {
    ServiceConfig {
        provision_dir: dir.to_path_buf(),
        max_artifact_bytes: 1024,
        ..ServiceConfig::default()
    }
}

pub async fn state_with(
    dir: &Path,
    engine: Arc<dyn WorkloadEngine>,
) -> (Arc<InMemoryBackend>, Arc<AppState>) {
    let backend = Arc::new(InMemoryBackend::default());
    let state = AppState::initialize(&config_for(dir), backend.clone(), engine)
        .await
        .expect("initialize state");
    (backend, state)
}

/// Engine that runs `body` with `sh`, after `play kube` and before the spec path.
pub fn script_engine(dir: &Path, body: &str) -> Arc<PodmanEngine> {
    let script = dir.join("engine.sh");
    std::fs::write(&script, body).expect("write engine script");
    Arc::new(PodmanEngine::new(
        "sh",
        vec![
            script.to_string_lossy().into_owned(),
            "play".to_string(),
            "kube".to_string(),
        ],
    ))
}

pub fn multipart_body(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, content) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn upload_request(parts: &[(&str, &[u8])]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

pub fn start_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/start")
        .body(Body::empty())
        .unwrap()
}
