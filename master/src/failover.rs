use chrono::Utc;
use std::time::Duration;

use tracing::{debug, info, warn};

use common::error::Result;
use common::{FailureKind, JobId, JobStatus, RemoveOutcome};

use crate::state::Orchestrator;

/// Qué hizo una pasada de reconciliación.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs llevados a `failed/interrupted`
    pub interrupted: Vec<JobId>,
    /// Entradas de la cola descartadas por apuntar a jobs sin sentido
    pub dropped_entries: Vec<JobId>,
}

impl Orchestrator {
    /// Una pasada de chequeo sobre todos los jobs del store:
    /// 1. `active` sin lease vivo => failed/interrupted
    /// 2. `preprocessing|queued` sin entrada en la cola y más viejo que
    ///    `stale_after` => failed/interrupted
    pub fn sweep_once(&self, stale_after: Duration) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for id in self.store.list()? {
            let manifest = match self.store.read(&id) {
                Ok(m) => m,
                Err(e) => {
                    // corrupto o borrado en paralelo; no se repara solo
                    debug!("barrido: se saltea {}: {}", id, e);
                    continue;
                }
            };

            let handle = self.queue.peek(&id);
            match manifest.status {
                JobStatus::Active => {
                    if handle.as_ref().is_some_and(|h| h.is_leased()) {
                        continue;
                    }
                    if handle.is_some() {
                        // entrada durable de una ejecución que ya no existe
                        self.drop_entry(&id, &mut report);
                    }
                    self.interrupt(&id, "el job quedó activo sin un worker", &mut report);
                }
                JobStatus::Preprocessing | JobStatus::Queued => {
                    if handle.is_some() {
                        continue;
                    }
                    let age = (now - manifest.updated_at).to_std().unwrap_or_default();
                    if age >= stale_after {
                        self.interrupt(&id, "el job nunca llegó a la cola", &mut report);
                    }
                }
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }

        if !report.interrupted.is_empty() || !report.dropped_entries.is_empty() {
            info!(
                "barrido: {} jobs interrumpidos, {} entradas descartadas",
                report.interrupted.len(),
                report.dropped_entries.len()
            );
        }
        Ok(report)
    }

    /// Reconciliación al arrancar, antes de levantar los workers. Todo lo que
    /// estaba en vuelo cuando se cayó el proceso anterior queda como
    /// `interrupted`; lo pendiente sigue en la cola.
    pub fn recover(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for id in self.queue.pending_ids() {
            match self.store.read(&id) {
                Ok(m) if m.status == JobStatus::Queued => {}
                Ok(m) if m.status == JobStatus::Preprocessing => {
                    // el enqueue llegó a disco pero no el cambio de estado
                    self.store.transition(&id, JobStatus::Queued, |_| {})?;
                }
                Ok(m) if m.status == JobStatus::Active => {
                    self.drop_entry(&id, &mut report);
                    self.interrupt(&id, "el orquestador se reinició con el job en curso", &mut report);
                }
                Ok(_) => self.drop_entry(&id, &mut report),
                Err(e) if e.is_not_found() => {
                    warn!("cola: el job {} no existe en el store ({}), se descarta", id, e);
                    self.drop_entry(&id, &mut report);
                }
                Err(e) => return Err(e),
            }
        }

        let swept = self.sweep_once(Duration::ZERO)?;
        report.interrupted.extend(swept.interrupted);
        report.dropped_entries.extend(swept.dropped_entries);
        Ok(report)
    }

    fn interrupt(&self, id: &str, reason: &str, report: &mut SweepReport) {
        let result = self.store.transition(id, JobStatus::Failed, |m| {
            m.failure = Some(FailureKind::Interrupted);
            m.error = Some(reason.to_string());
        });
        match result {
            Ok(t) if t.applied() => {
                warn!("job {} marcado como interrumpido: {}", id, reason);
                let note = format!("{} {}", FailureKind::Interrupted.tag(), reason);
                if let Err(e) = self.store.append_log_note(id, &note) {
                    warn!("job {}: no se pudo anotar el log: {}", id, e);
                }
                report.interrupted.push(id.to_string());
            }
            Ok(_) => {}
            Err(e) => warn!("job {}: no se pudo marcar como interrumpido: {}", id, e),
        }
    }

    fn drop_entry(&self, id: &str, report: &mut SweepReport) {
        match self.queue.remove(id) {
            Ok(RemoveOutcome::Removed) => report.dropped_entries.push(id.to_string()),
            Ok(_) => {}
            Err(e) => warn!("cola: no se pudo descartar la entrada de {}: {}", id, e),
        }
    }
}
