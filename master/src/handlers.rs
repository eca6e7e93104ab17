use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    ApiResponse, CancelResponse, JobParameters, OrchestratorError, PublicState, StatusView,
    SubmitResponse,
};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::AppState;
use crate::submit::UploadedNetwork;

/// Directorio (dentro de la raíz del store) para los uploads en curso.
/// Empieza con punto para que `JobStore::list` no lo tome como job.
const UPLOAD_DIR: &str = ".uploads";

/// Margen para los headers y campos de texto del multipart.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD;
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job).delete(cancel_job))
        .route("/api/v1/jobs/:id/result", get(download_result))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let status = match &e {
            OrchestratorError::NotFound(_) | OrchestratorError::StoreCorruption { .. } => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
            OrchestratorError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Io(_) | OrchestratorError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        // Para afuera un manifest corrupto es un job que no existe
        let message = match &e {
            OrchestratorError::StoreCorruption { id, .. } => {
                OrchestratorError::NotFound(id.clone()).to_string()
            }
            other => other.to_string(),
        };
        Self::new(status, message)
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::new(e.status(), e.body_text())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("tarea interna falló: {e}"))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        OrchestratorError::Io(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("{} {}", self.status, self.message);
        }
        (self.status, Json(ApiResponse::<()>::error(self.message, None))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/* ---------------- handlers HTTP ---------------- */

#[derive(Serialize)]
struct Health {
    status: &'static str,
    queued: usize,
    active: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let queue = state.orchestrator.queue();
    Json(Health {
        status: "ok",
        queued: queue.pending_len(),
        active: queue.leased_len(),
    })
}

/// Campos del formulario multipart, todos obligatorios.
#[derive(Default)]
struct SubmitForm {
    upload: Option<UploadedNetwork>,
    graphlet_size: Option<u8>,
    density: Option<f64>,
    fractional_overlap: Option<f64>,
}

impl SubmitForm {
    fn parameters(&self) -> ApiResult<JobParameters> {
        Ok(JobParameters {
            graphlet_size: self.graphlet_size.ok_or_else(|| missing("graphlet_size"))?,
            density: self.density.ok_or_else(|| missing("density"))?,
            fractional_overlap: self
                .fractional_overlap
                .ok_or_else(|| missing("fractional_overlap"))?,
        })
    }
}

fn missing(field: &str) -> ApiError {
    ApiError::bad_request(format!("falta el campo {field}"))
}

fn parse_field<T: std::str::FromStr>(name: &str, raw: &str) -> ApiResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("valor inválido para {name}: {raw:?}")))
}

// Recibe la red y los parámetros, guarda el archivo en un temporal y se lo
// pasa al orquestador
async fn create_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<ApiResponse<SubmitResponse>>)> {
    let upload_dir = state.orchestrator.store().root().join(UPLOAD_DIR);
    tokio::fs::create_dir_all(&upload_dir).await?;

    let mut form = SubmitForm::default();
    let read = read_form(multipart, &upload_dir, state.max_upload_bytes, &mut form).await;
    let temp = form.upload.as_ref().map(|u| u.path.clone());

    let result = match read {
        Ok(()) => submit_form(&state, form).await,
        Err(e) => Err(e),
    };

    // si el submit salió bien el archivo ya se movió al job
    if let Some(temp) = temp {
        let _ = tokio::fs::remove_file(temp).await;
    }
    result
}

async fn read_form(
    mut multipart: Multipart,
    upload_dir: &std::path::Path,
    max_upload_bytes: usize,
    form: &mut SubmitForm,
) -> ApiResult<()> {
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if form.upload.is_some() {
                    return Err(ApiError::bad_request("se envió más de un archivo"));
                }
                let original_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::bad_request("el campo file no trae nombre"))?;
                let path: PathBuf =
                    upload_dir.join(format!("{}.upload", uuid::Uuid::new_v4()));
                // se registra antes de escribir para poder limpiarlo si falla
                form.upload = Some(UploadedNetwork {
                    original_name,
                    path: path.clone(),
                });

                let mut file = tokio::fs::File::create(&path).await?;
                let mut written = 0usize;
                while let Some(chunk) = field.chunk().await? {
                    written += chunk.len();
                    if written > max_upload_bytes {
                        return Err(ApiError::new(
                            StatusCode::PAYLOAD_TOO_LARGE,
                            format!("el archivo supera {max_upload_bytes} bytes"),
                        ));
                    }
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
            }
            "graphlet_size" => form.graphlet_size = Some(parse_field(&name, &field.text().await?)?),
            "density" => form.density = Some(parse_field(&name, &field.text().await?)?),
            "fractional_overlap" => {
                form.fractional_overlap = Some(parse_field(&name, &field.text().await?)?)
            }
            other => warn!("campo multipart desconocido: {}", other),
        }
    }
    Ok(())
}

async fn submit_form(
    state: &AppState,
    form: SubmitForm,
) -> ApiResult<(StatusCode, Json<ApiResponse<SubmitResponse>>)> {
    let parameters = form.parameters()?;
    let upload = form.upload.ok_or_else(|| missing("file"))?;

    let orch = state.orchestrator.clone();
    let manifest = tokio::task::spawn_blocking(move || orch.submit(parameters, &upload)).await??;
    info!("job {} recibido", manifest.id);

    let response = SubmitResponse {
        status_url: common::status_path(&manifest.id),
        job_id: manifest.id,
        status: manifest.status,
        parameters: manifest.parameters,
    };
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("job encolado", response)),
    ))
}

// Estado del job. Mientras no termine la respuesta es un redirect a la misma URL
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<StatusView>>> {
    let orch = state.orchestrator.clone();
    let view = tokio::task::spawn_blocking(move || orch.get_status(&id)).await??;

    let response = match view.state {
        PublicState::Queued | PublicState::Active => {
            let redirect = view
                .redirect
                .clone()
                .unwrap_or_else(|| common::status_path(&view.job_id));
            let message = if view.state == PublicState::Queued {
                "job en cola"
            } else {
                "job en ejecución"
            };
            ApiResponse::redirect(message, view, redirect)
        }
        PublicState::Completed => ApiResponse::success("job completado", view),
        PublicState::Failed => {
            let error_log = view.error.clone();
            ApiResponse::failed("el job falló", view, error_log)
        }
    };
    Ok(Json(response))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<CancelResponse>>> {
    let outcome = state.orchestrator.cancel(&id).await?;
    info!("cancel de {}: {:?}", id, outcome);
    Ok(Json(ApiResponse::success(
        "ok",
        CancelResponse {
            ok: true,
            job_id: id,
            result: outcome.result(),
            final_status: outcome.final_status(),
        },
    )))
}

// Descarga el archivo de resultados de un job completado
async fn download_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let orch = state.orchestrator.clone();
    let lookup_id = id.clone();
    let path = tokio::task::spawn_blocking(move || orch.store().result_path(&lookup_id))
        .await??
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("el job {id} no tiene resultados"),
            )
        })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{id}.zip"));
    let bytes = tokio::fs::read(&path).await?;

    Ok((
        [
            (header::CONTENT_TYPE, content_type(&file_name).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

fn content_type(file_name: &str) -> &'static str {
    if file_name.ends_with(".zip") {
        "application/zip"
    } else if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
        "application/gzip"
    } else {
        "application/octet-stream"
    }
}
