//! Cancellation Controller.
//!
//! Un job en cola se borra sin dejar rastro; uno en curso se termina vía
//! su lease y queda `failed/cancelled`.

use common::error::Result;
use common::{CancelResult, FailureKind, JobStatus, OrchestratorError, RemoveOutcome, Transition};
use tracing::{info, warn};

use crate::state::Orchestrator;

const CANCELLED_MESSAGE: &str = "job cancelado por el usuario";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Estaba en cola: se borró la entrada y el directorio
    Removed,
    /// Estaba en curso (o a mitad del submit) y quedó en este estado
    Terminated(JobStatus),
    /// Ya era terminal, no se tocó
    AlreadyTerminal(JobStatus),
}

impl CancelOutcome {
    pub fn result(self) -> CancelResult {
        match self {
            CancelOutcome::Removed => CancelResult::Removed,
            CancelOutcome::Terminated(_) => CancelResult::Terminated,
            CancelOutcome::AlreadyTerminal(_) => CancelResult::AlreadyTerminal,
        }
    }

    pub fn final_status(self) -> Option<JobStatus> {
        match self {
            CancelOutcome::Removed => None,
            CancelOutcome::Terminated(s) | CancelOutcome::AlreadyTerminal(s) => Some(s),
        }
    }
}

/// Dónde estaba el job al pedir la cancelación.
enum Found {
    Terminal(JobStatus),
    Removed,
    Entry(RemoveOutcome),
}

impl Orchestrator {
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let job = id.to_string();
        let found = self
            .blocking(move |store, queue| {
                let manifest = store.read(&job)?;
                if manifest.status.is_terminal() {
                    return Ok(Found::Terminal(manifest.status));
                }
                match queue.remove(&job)? {
                    RemoveOutcome::Removed => {
                        match store.delete(&job) {
                            Ok(()) | Err(OrchestratorError::NotFound(_)) => {}
                            Err(e) => return Err(e),
                        }
                        Ok(Found::Removed)
                    }
                    other => Ok(Found::Entry(other)),
                }
            })
            .await?;

        match found {
            Found::Terminal(status) => Ok(CancelOutcome::AlreadyTerminal(status)),
            Found::Removed => {
                info!("job {} cancelado antes de empezar", id);
                Ok(CancelOutcome::Removed)
            }
            Found::Entry(RemoveOutcome::Leased(mut control)) => {
                control.cancel();
                if !control.wait_finished(self.cancel_wait).await {
                    warn!(
                        "job {}: el worker no soltó el job en {:?}, se fuerza el estado",
                        id, self.cancel_wait
                    );
                }
                self.settle_cancel(id).await
            }
            Found::Entry(_) => self.settle_cancel(id).await,
        }
    }

    /// Lleva el job a `failed/cancelled` si nadie lo llevó antes a un
    /// estado terminal.
    async fn settle_cancel(&self, id: &str) -> Result<CancelOutcome> {
        let job = id.to_string();
        self.blocking(move |store, _| {
            let transition = store.transition(&job, JobStatus::Failed, |m| {
                m.failure = Some(FailureKind::Cancelled);
                m.error = Some(CANCELLED_MESSAGE.to_string());
            })?;

            match transition {
                Transition::Applied(m) => {
                    let note = format!("{} {}", FailureKind::Cancelled.tag(), CANCELLED_MESSAGE);
                    if let Err(e) = store.append_log_note(&job, &note) {
                        warn!("job {}: no se pudo anotar el log: {}", job, e);
                    }
                    info!("job {} cancelado", job);
                    Ok(CancelOutcome::Terminated(m.status))
                }
                // El worker ya dejó su estado terminal
                Transition::Ignored(m) => match m.status {
                    JobStatus::Failed => Ok(CancelOutcome::Terminated(m.status)),
                    status => Ok(CancelOutcome::AlreadyTerminal(status)),
                },
            }
        })
        .await
    }
}
