//! Task Queue: cola FIFO durable de referencias a jobs.
//!
//! Cada entrada es un archivo `<seq>-<id>.json` en `dir`, escrito de forma
//! atómica antes de confirmar el `enqueue`, así sobrevive a un reinicio del
//! orquestador. En memoria se separan las entradas pendientes de las que ya
//! tiene un worker (lease). Un id está en uno solo de los dos lados, y pasar
//! de pendiente a lease ocurre bajo el mismo lock: un job nunca se entrega a
//! dos workers a la vez.
//!
//! La cantidad de leases simultáneos está acotada por un semáforo; un
//! `dequeue` sin slot libre o sin entradas espera sin hacer polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::fsutil;
use crate::job::JobId;

/// Lo único que viaja por la cola: el id y un payload chico. El estado del
/// job vive solo en el Job Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: JobId,
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl QueueEntry {
    fn file_name(&self) -> String {
        format!("{:020}-{}.json", self.seq, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Esperando worker; `position` 0 = el próximo en salir
    Pending { position: usize },
    Leased {
        worker_id: String,
        leased_at: DateTime<Utc>,
    },
}

/// Vista de una entrada para consultas de estado (no la saca de la cola).
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    pub state: EntryState,
}

impl JobHandle {
    pub fn is_leased(&self) -> bool {
        matches!(self.state, EntryState::Leased { .. })
    }
}

/// Control sobre un lease ajeno: permite pedir la cancelación y esperar a
/// que el worker lo suelte.
#[derive(Debug, Clone)]
pub struct LeaseControl {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl LeaseControl {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Espera a que el worker termine el lease. Devuelve false si se agotó
    /// `timeout` antes.
    pub async fn wait_finished(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.done.wait_for(|finished| *finished)).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }
}

#[derive(Debug)]
pub enum RemoveOutcome {
    /// Estaba pendiente y se borró
    Removed,
    /// Lo tiene un worker: no se borra, se devuelve el control del lease
    Leased(LeaseControl),
    /// No hay entrada para ese id
    Absent,
}

struct LeaseSlot {
    entry: QueueEntry,
    worker_id: String,
    leased_at: DateTime<Utc>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<QueueEntry>,
    leased: HashMap<JobId, LeaseSlot>,
    next_seq: u64,
}

pub struct TaskQueue {
    dir: PathBuf,
    inner: Mutex<Inner>,
    available: Notify,
    slots: Arc<Semaphore>,
    capacity: usize,
    lease_timeout: Option<Duration>,
}

impl TaskQueue {
    /// Abre (o crea) la cola en `dir` y recarga las entradas persistidas en
    /// orden de secuencia. `capacity` es el máximo de leases simultáneos.
    pub fn open(
        dir: impl Into<PathBuf>,
        capacity: usize,
        lease_timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(unavailable)?;
        let capacity = capacity.max(1);

        let mut restored: Vec<QueueEntry> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(unavailable)?.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<QueueEntry>(&b).map_err(|e| e.to_string()))
            {
                Ok(e) => restored.push(e),
                Err(e) => warn!("entrada de cola ilegible {}: {}", path.display(), e),
            }
        }
        restored.sort_by_key(|e| e.seq);

        let mut inner = Inner::default();
        for entry in restored {
            inner.next_seq = inner.next_seq.max(entry.seq + 1);
            if inner.pending.iter().any(|e| e.id == entry.id) {
                warn!("entrada duplicada para el job {} (seq={}), se ignora", entry.id, entry.seq);
                continue;
            }
            inner.pending.push_back(entry);
        }

        info!(
            "cola de tareas en {} ({} entradas recuperadas, capacity={})",
            dir.display(),
            inner.pending.len(),
            capacity
        );

        Ok(Arc::new(Self {
            dir,
            inner: Mutex::new(inner),
            available: Notify::new(),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            lease_timeout,
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry_path(&self, entry: &QueueEntry) -> PathBuf {
        self.dir.join(entry.file_name())
    }

    /// Persiste la referencia y la deja al final de la cola. Una vez que
    /// devuelve Ok la entrada sobrevive a un reinicio.
    pub fn enqueue(&self, id: &str, payload: serde_json::Value) -> Result<QueueEntry> {
        let entry = {
            let mut inner = self.lock();
            if inner.leased.contains_key(id) || inner.pending.iter().any(|e| e.id == id) {
                return Err(OrchestratorError::Conflict(id.to_string()));
            }

            let entry = QueueEntry {
                id: id.to_string(),
                seq: inner.next_seq,
                enqueued_at: Utc::now(),
                payload,
            };
            fsutil::write_json_atomic(&self.entry_path(&entry), &entry).map_err(unavailable)?;

            inner.next_seq += 1;
            inner.pending.push_back(entry.clone());
            entry
        };

        debug!("job {} encolado (seq={})", entry.id, entry.seq);
        self.available.notify_one();
        Ok(entry)
    }

    /// Entrega la próxima entrada a `worker_id`. Espera primero un slot de
    /// concurrencia y después una entrada.
    pub async fn dequeue(self: &Arc<Self>, worker_id: &str) -> Result<Lease> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::QueueUnavailable("cola cerrada".to_string()))?;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let leased = {
                let mut inner = self.lock();
                inner.pending.pop_front().map(|entry| {
                    let cancel = CancellationToken::new();
                    let (done_tx, done_rx) = watch::channel(false);
                    let leased_at = Utc::now();
                    inner.leased.insert(
                        entry.id.clone(),
                        LeaseSlot {
                            entry: entry.clone(),
                            worker_id: worker_id.to_string(),
                            leased_at,
                            cancel: cancel.clone(),
                            done: done_rx,
                        },
                    );
                    (entry, cancel, done_tx)
                })
            };

            if let Some((entry, cancel, done)) = leased {
                debug!("job {} entregado al worker {}", entry.id, worker_id);
                return Ok(Lease {
                    queue: Arc::clone(self),
                    deadline: self.lease_timeout.map(|t| Instant::now() + t),
                    entry,
                    worker_id: worker_id.to_string(),
                    cancel,
                    done,
                    _permit: permit,
                    finished: false,
                });
            }

            notified.await;
        }
    }

    pub fn peek(&self, id: &str) -> Option<JobHandle> {
        let inner = self.lock();
        if let Some(slot) = inner.leased.get(id) {
            return Some(JobHandle {
                id: slot.entry.id.clone(),
                seq: slot.entry.seq,
                enqueued_at: slot.entry.enqueued_at,
                state: EntryState::Leased {
                    worker_id: slot.worker_id.clone(),
                    leased_at: slot.leased_at,
                },
            });
        }
        inner
            .pending
            .iter()
            .enumerate()
            .find(|(_, e)| e.id == id)
            .map(|(position, e)| JobHandle {
                id: e.id.clone(),
                seq: e.seq,
                enqueued_at: e.enqueued_at,
                state: EntryState::Pending { position },
            })
    }

    /// Borra una entrada pendiente. Una entrada con lease no se borra: se
    /// devuelve su control para que el llamador la cancele.
    pub fn remove(&self, id: &str) -> Result<RemoveOutcome> {
        let mut inner = self.lock();

        if let Some(slot) = inner.leased.get(id) {
            return Ok(RemoveOutcome::Leased(LeaseControl {
                cancel: slot.cancel.clone(),
                done: slot.done.clone(),
            }));
        }

        let Some(index) = inner.pending.iter().position(|e| e.id == id) else {
            return Ok(RemoveOutcome::Absent);
        };

        let path = self.entry_path(&inner.pending[index]);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable(e)),
        }
        inner.pending.remove(index);
        debug!("job {} sacado de la cola", id);
        Ok(RemoveOutcome::Removed)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn leased_len(&self) -> usize {
        self.lock().leased.len()
    }

    pub fn pending_ids(&self) -> Vec<JobId> {
        self.lock().pending.iter().map(|e| e.id.clone()).collect()
    }

    pub fn leased_ids(&self) -> Vec<JobId> {
        self.lock().leased.keys().cloned().collect()
    }

    /// Suelta el lease en memoria. Con `delete_entry` también borra la
    /// entrada durable; sin él la entrada queda para la reconciliación al
    /// arrancar.
    fn release(&self, id: &str, delete_entry: bool) -> Result<()> {
        let mut inner = self.lock();
        let Some(slot) = inner.leased.remove(id) else {
            return Ok(());
        };
        if delete_entry {
            match fs::remove_file(self.entry_path(&slot.entry)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(unavailable(e)),
            }
        }
        Ok(())
    }
}

fn unavailable(e: io::Error) -> OrchestratorError {
    OrchestratorError::QueueUnavailable(e.to_string())
}

/// Un job en manos de un worker. Ocupa un slot de concurrencia hasta que
/// se termina (`finish`) o se descarta.
pub struct Lease {
    queue: Arc<TaskQueue>,
    entry: QueueEntry,
    worker_id: String,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    deadline: Option<Instant>,
    _permit: OwnedSemaphorePermit,
    finished: bool,
}

impl Lease {
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Token que se dispara cuando alguien cancela este job.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Momento límite de ejecución, si la cola tiene timeout configurado.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Termina el lease: borra la entrada durable y libera el slot.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.queue.release(&self.entry.id, true)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "lease del job {} descartado sin terminar (worker {})",
                self.entry.id, self.worker_id
            );
            if let Err(e) = self.queue.release(&self.entry.id, false) {
                warn!("error soltando lease del job {}: {}", self.entry.id, e);
            }
        }
        self.done.send_replace(true);
    }
}
