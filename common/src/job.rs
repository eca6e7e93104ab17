use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::OrchestratorError;

pub type JobId = String;

/// Longitud del id en hex (mismo largo que un md5).
const JOB_ID_HEX_LEN: usize = 32;

pub const MIN_GRAPHLET_SIZE: u8 = 3;
pub const MAX_GRAPHLET_SIZE: u8 = 7;
pub const MIN_DENSITY_EXCLUSIVE: f64 = 0.01;

/// Parámetros numéricos del análisis. La capa de upload ya los validó,
/// pero `validate` se vuelve a llamar en el borde del orquestador.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    /// Tamaño del graphlet (3..=7)
    pub graphlet_size: u8,
    /// Umbral de densidad, en (0.01, 1]
    pub density: f64,
    /// Solapamiento fraccional, en [0, 1)
    pub fractional_overlap: f64,
}

impl JobParameters {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !(MIN_GRAPHLET_SIZE..=MAX_GRAPHLET_SIZE).contains(&self.graphlet_size) {
            return Err(OrchestratorError::InvalidParameters(format!(
                "graphlet_size debe estar entre {} y {} (recibido {})",
                MIN_GRAPHLET_SIZE, MAX_GRAPHLET_SIZE, self.graphlet_size
            )));
        }
        if !(self.density > MIN_DENSITY_EXCLUSIVE && self.density <= 1.0) {
            return Err(OrchestratorError::InvalidParameters(format!(
                "density debe estar en (0.01, 1] (recibido {})",
                self.density
            )));
        }
        if !(self.fractional_overlap >= 0.0 && self.fractional_overlap < 1.0) {
            return Err(OrchestratorError::InvalidParameters(format!(
                "fractional_overlap debe estar en [0, 1) (recibido {})",
                self.fractional_overlap
            )));
        }
        Ok(())
    }

    /// Argumentos posicionales para el binario, en el orden que espera.
    pub fn to_args(&self) -> [String; 3] {
        [
            self.graphlet_size.to_string(),
            self.density.to_string(),
            self.fractional_overlap.to_string(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Preprocessing,
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Preprocessing => 0,
            JobStatus::Queued => 1,
            JobStatus::Active => 2,
            JobStatus::Completed | JobStatus::Failed => 3,
        }
    }

    /// Transiciones permitidas: siempre hacia adelante, `Failed` desde
    /// cualquier estado no terminal, `Completed` solo desde `Active`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed => true,
            JobStatus::Completed => self == JobStatus::Active,
            _ => next.rank() > self.rank(),
        }
    }
}

/// Motivo de un `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// El binario no se pudo lanzar (no existe, sin permisos...)
    SpawnFailure,
    /// Exit code distinto de 0
    ExecutionFailure,
    /// Cancelado por el usuario
    Cancelled,
    /// Se superó el deadline del lease
    TimedOut,
    /// El orquestador se cayó con el job en vuelo
    Interrupted,
    /// Falla local (log, cola, disco)
    Infrastructure,
}

impl FailureKind {
    /// Etiqueta que se antepone a las entradas sintéticas del log.
    pub fn tag(self) -> &'static str {
        match self {
            FailureKind::SpawnFailure => "[SpawnFailure]",
            FailureKind::ExecutionFailure => "[ExecutionFailure]",
            FailureKind::Cancelled => "[Cancelled]",
            FailureKind::TimedOut => "[TimedOut]",
            FailureKind::Interrupted => "[Interrupted]",
            FailureKind::Infrastructure => "[Infrastructure]",
        }
    }
}

/// Registro durable de un job (`info.json`). El log vive aparte en `run.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub id: JobId,
    pub status: JobStatus,
    pub parameters: JobParameters,

    /// Nombre de la red sin extensión, ej: "yeast"
    pub network_name: String,
    /// Extensión con punto, ej: ".el"
    pub extension: String,
    /// Ruta relativa al directorio del job, ej: "networks/yeast.el"
    pub network_file: PathBuf,
    /// Directorio exclusivo del job
    pub location: PathBuf,

    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// -------- Resultado --------
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    /// Extracto legible del error (cola de stderr o mensaje sintético)
    #[serde(default)]
    pub error: Option<String>,
    /// Archivo de resultados dentro de `location`
    #[serde(default)]
    pub result_file: Option<String>,
}

impl JobManifest {
    pub fn network_path(&self) -> PathBuf {
        self.location.join(&self.network_file)
    }
}

/// Separa "yeast.el" en ("yeast", ".el"). Devuelve None si falta nombre o
/// extensión.
pub fn split_network_name(original_name: &str) -> Option<(String, String)> {
    let dot = original_name.rfind('.')?;
    let (stem, ext) = original_name.split_at(dot);
    if stem.is_empty() || ext.len() < 2 {
        return None;
    }
    Some((stem.to_string(), ext.to_lowercase()))
}

/// Id determinístico a partir del instante de envío y el nombre de la red.
/// El riesgo de colisión se acepta; `JobStore::create` lo detecta igual.
pub fn derive_job_id(submitted_at: DateTime<Utc>, network_name: &str) -> JobId {
    let seed = format!("{}-{}", submitted_at.timestamp_millis(), network_name);
    let digest = Sha256::digest(seed.as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(JOB_ID_HEX_LEN);
    hex
}
