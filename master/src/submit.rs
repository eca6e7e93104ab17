// Alta de jobs: valida, crea el directorio, importa la red y encola.

use chrono::Utc;
use common::error::Result;
use common::{
    derive_job_id, split_network_name, FailureKind, JobManifest, JobParameters, JobStatus,
    OrchestratorError,
};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::state::Orchestrator;

/// Formatos de red que entiende el binario.
pub const ALLOWED_EXTENSIONS: [&str; 2] = [".el", ".gw"];

/// Archivo ya recibido por la capa HTTP y guardado en un temporal.
#[derive(Debug, Clone)]
pub struct UploadedNetwork {
    pub original_name: String,
    pub path: PathBuf,
}

pub fn validate_network_name(name: &str) -> Result<()> {
    if name.chars().any(char::is_whitespace) {
        return Err(OrchestratorError::InvalidParameters(
            "el nombre del archivo no puede tener espacios".to_string(),
        ));
    }
    let (_, extension) = split_network_name(name).ok_or_else(|| {
        OrchestratorError::InvalidParameters(format!("nombre de red inválido: {name}"))
    })?;
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(OrchestratorError::InvalidParameters(format!(
            "extensión {extension} no soportada (se acepta {})",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }
    Ok(())
}

impl Orchestrator {
    /// Registra un job nuevo y lo deja en la cola. Devuelve el manifest tal
    /// como quedó (normalmente `queued`; `active` si un worker ya lo tomó).
    pub fn submit(&self, parameters: JobParameters, upload: &UploadedNetwork) -> Result<JobManifest> {
        parameters.validate()?;
        validate_network_name(&upload.original_name)?;

        let id = derive_job_id(Utc::now(), &upload.original_name);
        let manifest = self.store.create(&id, parameters, &upload.original_name)?;

        if let Err(e) = self.store.import_network(&id, &upload.path) {
            warn!("job {}: no se pudo importar la red: {}", id, e);
            if let Err(e) = self.store.delete(&id) {
                warn!("job {}: no se pudo limpiar el directorio: {}", id, e);
            }
            return Err(e);
        }

        let payload = json!({
            "network": format!("{}{}", manifest.network_name, manifest.extension),
        });
        if let Err(e) = self.queue.enqueue(&id, payload) {
            error!("job {}: no se pudo encolar: {}", id, e);
            let message = format!("no se pudo encolar el job: {e}");
            let note = format!("{} {}", FailureKind::Infrastructure.tag(), message);
            let failed = self.store.transition(&id, JobStatus::Failed, |m| {
                m.failure = Some(FailureKind::Infrastructure);
                m.error = Some(message);
            });
            if matches!(failed, Ok(ref t) if t.applied()) {
                let _ = self.store.append_log_note(&id, &note);
            }
            return Err(match e {
                OrchestratorError::QueueUnavailable(_) => e,
                other => OrchestratorError::QueueUnavailable(other.to_string()),
            });
        }

        let manifest = self
            .store
            .transition(&id, JobStatus::Queued, |_| {})?
            .into_manifest();
        info!(
            "job {} encolado (red {}{}, k={}, d={}, o={})",
            id,
            manifest.network_name,
            manifest.extension,
            parameters.graphlet_size,
            parameters.density,
            parameters.fractional_overlap
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn network_names_are_checked() {
        assert!(validate_network_name("yeast.el").is_ok());
        assert!(validate_network_name("Human.GW").is_ok());
        assert_matches!(
            validate_network_name("my net.el"),
            Err(OrchestratorError::InvalidParameters(_))
        );
        assert_matches!(
            validate_network_name("yeast.txt"),
            Err(OrchestratorError::InvalidParameters(_))
        );
        assert_matches!(
            validate_network_name("yeast"),
            Err(OrchestratorError::InvalidParameters(_))
        );
    }
}
