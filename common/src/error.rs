use thiserror::Error;

use crate::job::JobId;

/// Errores que ven los llamadores del orquestador. Las fallas del cómputo
/// en sí (spawn, exit != 0) no son errores: quedan como `Failed` en el job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job {0} no encontrado")]
    NotFound(JobId),

    #[error("el job {0} ya existe")]
    Conflict(JobId),

    #[error("manifest corrupto para el job {id}: {reason}")]
    StoreCorruption { id: JobId, reason: String },

    #[error("parámetros inválidos: {0}")]
    InvalidParameters(String),

    #[error("cola de tareas no disponible: {0}")]
    QueueUnavailable(String),

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// `StoreCorruption` se presenta afuera como si el job no existiera.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestratorError::NotFound(_) | OrchestratorError::StoreCorruption { .. }
        )
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
