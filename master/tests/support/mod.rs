#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use common::{JobParameters, PublicState, StatusView};
use http_body_util::BodyExt;
use master::{build_router, AppState, Config, Orchestrator, UploadedNetwork};
use tempfile::TempDir;
use tower::ServiceExt;

/// Red de prueba: 10 aristas en formato edge list.
pub const EDGE_LIST: &str = "a b\nb c\nc d\nd e\ne a\na c\nb d\nc e\nd a\ne b\n";

pub const DEFAULT_PARAMS: JobParameters = JobParameters {
    graphlet_size: 4,
    density: 0.5,
    fractional_overlap: 0.2,
};

/// Directorio temporal con store, cola y un binario de análisis falso.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    /// `body` es el cuerpo de un script /bin/sh que hace de binario.
    pub fn new(body: &str, workers: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = write_script(dir.path(), "analysis", body);
        let config = test_config(dir.path(), binary, workers);
        Self { dir, config }
    }

    pub fn with_binary(binary: PathBuf, workers: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), binary, workers);
        Self { dir, config }
    }

    pub fn open(&self) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::open(&self.config).unwrap())
    }

    pub fn upload(&self, name: &str) -> UploadedNetwork {
        let path = self.dir.path().join(format!("{name}.incoming"));
        std::fs::write(&path, EDGE_LIST).unwrap();
        UploadedNetwork {
            original_name: name.to_string(),
            path,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn test_config(root: &Path, binary: PathBuf, workers: usize) -> Config {
    Config {
        process_root: root.join("process"),
        queue_dir: root.join("queue"),
        analysis_binary: binary,
        worker_concurrency: workers,
        kill_grace: Duration::from_millis(300),
        cancel_wait: Duration::from_secs(5),
        poll_interval: Duration::from_secs(1),
        ..Config::default()
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Consulta el estado hasta que `done` se cumpla o pasen 10 s.
pub async fn wait_for<F>(orch: &Orchestrator, id: &str, done: F) -> StatusView
where
    F: Fn(&StatusView) -> bool,
{
    for _ in 0..400 {
        let view = orch.get_status(id).unwrap();
        if done(&view) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("el job {id} no llegó al estado esperado");
}

pub async fn wait_terminal(orch: &Orchestrator, id: &str) -> StatusView {
    wait_for(orch, id, |v| v.state.is_terminal()).await
}

pub async fn wait_active(orch: &Orchestrator, id: &str) -> StatusView {
    wait_for(orch, id, |v| v.state == PublicState::Active).await
}

/* ---------------- HTTP ---------------- */

pub fn app(orch: Arc<Orchestrator>) -> Router {
    build_router(AppState::new(orch, 1_000_000))
}

pub async fn get(app: Router, uri: &str) -> Response {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

pub async fn delete(app: Router, uri: &str) -> Response {
    send(app, Request::delete(uri).body(Body::empty()).unwrap()).await
}

pub async fn send(app: Router, request: Request<Body>) -> Response {
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

const BOUNDARY: &str = "orchestrator-test-boundary";

/// Arma un POST multipart con los campos de texto y el archivo dados.
pub fn multipart_request(fields: &[(&str, &str)], file: Option<(&str, &str)>) -> Request<Body> {
    multipart_request_with_files(fields, file.as_slice())
}

pub fn multipart_request_with_files(
    fields: &[(&str, &str)],
    files: &[(&str, &str)],
) -> Request<Body> {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    for (file_name, contents) in files {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{contents}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));

    Request::post("/api/v1/jobs")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn assert_status(response: &Response, status: StatusCode) {
    assert_eq!(response.status(), status, "status HTTP inesperado");
}
