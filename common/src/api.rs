// Tipos que viajan por HTTP entre el master y el cliente.

use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobParameters, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Success,
    Redirect,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log: Option<String>,
}

/// Sobre común de todas las respuestas JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: EnvelopeStatus,
    pub message: String,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            status: EnvelopeStatus::Success,
            message: message.into(),
            data: Some(data),
            error: None,
            redirect: None,
        }
    }

    pub fn redirect(message: impl Into<String>, data: T, redirect: String) -> Self {
        Self {
            status: EnvelopeStatus::Redirect,
            message: message.into(),
            data: Some(data),
            error: None,
            redirect: Some(redirect),
        }
    }

    /// Error que además trae datos, ej: la vista de un job que falló.
    pub fn failed(message: impl Into<String>, data: T, error_log: Option<String>) -> Self {
        let message = message.into();
        Self {
            status: EnvelopeStatus::Error,
            error: Some(ErrorDetails {
                message: message.clone(),
                error_log,
            }),
            message,
            data: Some(data),
            redirect: None,
        }
    }

    pub fn error(message: impl Into<String>, error_log: Option<String>) -> Self {
        let message = message.into();
        Self {
            status: EnvelopeStatus::Error,
            error: Some(ErrorDetails {
                message: message.clone(),
                error_log,
            }),
            message,
            data: None,
            redirect: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub parameters: JobParameters,
    pub status_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelResult {
    /// Estaba en cola: se borró todo rastro
    Removed,
    /// Estaba corriendo: quedó en el estado terminal indicado
    Terminated,
    /// Ya era terminal, no se hizo nada
    AlreadyTerminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub job_id: JobId,
    pub result: CancelResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_status: Option<JobStatus>,
}
