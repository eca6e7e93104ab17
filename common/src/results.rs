use serde::{Deserialize, Serialize};

use crate::job::{FailureKind, JobId, JobStatus};

/// Estado visible desde afuera. `preprocessing` se muestra como `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl PublicState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PublicState::Completed | PublicState::Failed)
    }
}

impl From<JobStatus> for PublicState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Preprocessing | JobStatus::Queued => PublicState::Queued,
            JobStatus::Active => PublicState::Active,
            JobStatus::Completed => PublicState::Completed,
            JobStatus::Failed => PublicState::Failed,
        }
    }
}

/// Referencia al archivo de resultados de un job completado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRef {
    pub file_name: String,
    /// Ruta relativa de descarga, ej: "/api/v1/jobs/<id>/result"
    pub download_path: String,
}

/// Foto del estado de un job en el momento de la consulta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub job_id: JobId,
    pub state: PublicState,
    /// Log parcial (activo) o completo (terminal)
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Posición en la cola mientras espera (0 = el próximo)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// Mientras no sea terminal: a dónde volver a consultar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    /// Intervalo sugerido antes de la próxima consulta
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_after_secs: Option<u64>,
}

pub fn status_path(job_id: &str) -> String {
    format!("/api/v1/jobs/{job_id}")
}

pub fn result_download_path(job_id: &str) -> String {
    format!("/api/v1/jobs/{job_id}/result")
}
