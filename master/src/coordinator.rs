//! Status Coordinator: une lo que dice la cola con lo que dice el Job
//! Store en una sola vista. Nunca espera a un worker; devuelve la mejor foto
//! disponible y el cliente vuelve a consultar.

use common::error::Result;
use common::{
    result_download_path, status_path, EntryState, JobManifest, PublicState, ResultRef,
    StatusView,
};
use tracing::warn;

use crate::state::Orchestrator;

impl Orchestrator {
    pub fn get_status(&self, id: &str) -> Result<StatusView> {
        let manifest = self.store.read(id).inspect_err(|e| {
            if !matches!(e, common::OrchestratorError::NotFound(_)) {
                warn!("job {}: estado no disponible: {}", id, e);
            }
        })?;
        if manifest.status.is_terminal() {
            return self.terminal_view(manifest);
        }

        match self.queue.peek(id).map(|h| h.state) {
            Some(EntryState::Pending { position }) => {
                self.pending_view(&manifest, PublicState::Queued, Some(position))
            }
            Some(EntryState::Leased { .. }) => {
                self.pending_view(&manifest, PublicState::Active, None)
            }
            None => {
                // Sin entrada: o recién terminó, o está entre pasos del submit
                let manifest = self.store.read(id)?;
                if manifest.status.is_terminal() {
                    self.terminal_view(manifest)
                } else {
                    let state = PublicState::from(manifest.status);
                    self.pending_view(&manifest, state, None)
                }
            }
        }
    }

    fn terminal_view(&self, manifest: JobManifest) -> Result<StatusView> {
        let id = manifest.id.as_str();
        let result = self.store.result_path(id)?.and_then(|path| {
            let file_name = path.file_name()?.to_string_lossy().into_owned();
            Some(ResultRef {
                file_name,
                download_path: result_download_path(id),
            })
        });

        Ok(StatusView {
            job_id: manifest.id.clone(),
            state: PublicState::from(manifest.status),
            log: self.store.read_log(id)?,
            result,
            failure: manifest.failure,
            error: manifest.error,
            queue_position: None,
            redirect: None,
            poll_after_secs: None,
        })
    }

    fn pending_view(
        &self,
        manifest: &JobManifest,
        state: PublicState,
        queue_position: Option<usize>,
    ) -> Result<StatusView> {
        Ok(StatusView {
            job_id: manifest.id.clone(),
            state,
            log: self.store.read_log_snapshot(&manifest.id)?,
            result: None,
            failure: None,
            error: None,
            queue_position,
            redirect: Some(status_path(&manifest.id)),
            poll_after_secs: Some(self.poll_interval.as_secs().max(1)),
        })
    }
}
