// master/src/state.rs

use common::error::Result;
use common::{JobStore, OrchestratorError, TaskQueue};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use worker::{Engine, ExecutionSettings, SupervisionSettings, WorkerPool};

use crate::config::Config;

/// Núcleo del orquestador: Job Store, cola y motor de ejecución
/// compartidos. Las operaciones (submit, estado, cancelación, barrido)
/// viven en sus propios módulos como `impl Orchestrator`.
pub struct Orchestrator {
    pub(crate) store: Arc<JobStore>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) engine: Arc<Engine>,
    pub(crate) worker_concurrency: usize,
    pub(crate) cancel_wait: Duration,
    pub(crate) poll_interval: Duration,
}

impl Orchestrator {
    pub fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(JobStore::open(&config.process_root)?);
        let queue = TaskQueue::open(
            &config.queue_dir,
            config.worker_concurrency,
            config.job_timeout,
        )?;

        let settings = ExecutionSettings {
            binary: config.analysis_binary.clone(),
            supervision: SupervisionSettings {
                kill_grace: config.kill_grace,
                log_channel_capacity: config.log_channel_capacity,
                ..SupervisionSettings::default()
            },
        };
        let engine = Arc::new(Engine::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            settings,
        ));

        Ok(Self {
            store,
            queue,
            engine,
            worker_concurrency: config.worker_concurrency,
            cancel_wait: config.cancel_wait,
            poll_interval: config.poll_interval,
        })
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Corre `f` contra el store y la cola fuera del runtime async.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&JobStore, &TaskQueue) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let queue = Arc::clone(&self.queue);
        tokio::task::spawn_blocking(move || f(&store, &queue))
            .await
            .map_err(|e| OrchestratorError::Io(io::Error::other(e.to_string())))?
    }

    /// Arranca los N workers. Llamar después de `recover`.
    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(Arc::clone(&self.engine), self.worker_concurrency)
    }
}

/// Estado compartido de los handlers HTTP.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, max_upload_bytes: usize) -> Self {
        Self {
            orchestrator,
            max_upload_bytes,
        }
    }
}
