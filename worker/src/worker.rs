//! Execution Engine y pool de workers.
//!
//! Cada worker del pool toma un lease de la cola, marca el job como
//! `active`, corre el binario supervisado y deja el estado terminal en el
//! Job Store antes de soltar el lease.

use common::{
    FailureKind, JobManifest, JobStatus, JobStore, Lease, LogAppender, OrchestratorError,
    TaskQueue,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::process::{self, ExitReason, Invocation, RunReport, SupervisionSettings};

/// Pausa tras un error de la cola antes de volver a pedir trabajo.
const DEQUEUE_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Ruta absoluta del binario de análisis
    pub binary: PathBuf,
    pub supervision: SupervisionSettings,
}

/// Cómo terminó un job, en términos del Job Store.
#[derive(Debug)]
struct Outcome {
    status: JobStatus,
    failure: Option<FailureKind>,
    error: Option<String>,
    exit_code: Option<i32>,
    /// Línea sintética para el log del job
    note: Option<String>,
}

impl Outcome {
    fn failed(kind: FailureKind, message: String) -> Self {
        Self {
            status: JobStatus::Failed,
            failure: Some(kind),
            note: Some(format!("{} {}", kind.tag(), message)),
            error: Some(message),
            exit_code: None,
        }
    }
}

pub struct Engine {
    store: Arc<JobStore>,
    queue: Arc<TaskQueue>,
    settings: ExecutionSettings,
}

impl Engine {
    pub fn new(store: Arc<JobStore>, queue: Arc<TaskQueue>, settings: ExecutionSettings) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Corre `f` contra el Job Store fuera del runtime async.
    async fn with_store<T, F>(&self, f: F) -> common::error::Result<T>
    where
        F: FnOnce(&JobStore) -> common::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| OrchestratorError::Io(io::Error::other(e.to_string())))?
    }

    /// Corre el job del lease hasta un estado terminal. Nunca devuelve error:
    /// cualquier problema termina como `failed` con su causa.
    pub async fn execute(&self, lease: Lease) {
        let id = lease.id().to_string();

        let job = id.clone();
        let activated = self
            .with_store(move |store| store.transition(&job, JobStatus::Active, |_| {}))
            .await;
        let manifest = match activated {
            Ok(t) if t.applied() => t.into_manifest(),
            Ok(t) => {
                // cancelado o barrido mientras esperaba en la cola
                info!(
                    "job {} ya está en {:?}, se descarta el lease",
                    id,
                    t.manifest().status
                );
                self.finish(lease).await;
                return;
            }
            Err(e) => {
                warn!("job {} no se pudo activar: {}", id, e);
                self.finish(lease).await;
                return;
            }
        };

        info!(
            "worker {} ejecutando job {} (intento {})",
            lease.worker_id(),
            id,
            manifest.attempts
        );

        let outcome = self.run(&manifest, &lease).await;
        self.record(&id, outcome).await;
        self.finish(lease).await;
    }

    async fn run(&self, manifest: &JobManifest, lease: &Lease) -> Outcome {
        let id = manifest.id.as_str();

        let mut log = match self.store.open_log(id).await {
            Ok(log) => log,
            Err(e) => {
                return Outcome::failed(
                    FailureKind::Infrastructure,
                    format!("no se pudo abrir el log: {e}"),
                )
            }
        };

        let invocation = Invocation::for_job(&self.settings.binary, manifest);
        debug!("job {}: {:?}", id, invocation);

        let child = match invocation.spawn().await {
            Ok(child) => child,
            Err(e) => {
                let outcome = Outcome::failed(
                    FailureKind::SpawnFailure,
                    format!(
                        "no se pudo lanzar {}: {}",
                        self.settings.binary.display(),
                        e
                    ),
                );
                write_note(&mut log, &outcome).await;
                return outcome;
            }
        };

        let report = process::supervise(
            child,
            log,
            lease.cancel_token(),
            lease.deadline(),
            &self.settings.supervision,
        )
        .await;

        let mut outcome = classify(&report);
        match report.log {
            Some(mut log) => write_note(&mut log, &outcome).await,
            None => {
                if let Some(note) = outcome.note.take() {
                    let job = id.to_string();
                    let noted = self
                        .with_store(move |store| store.append_log_note(&job, &note))
                        .await;
                    if let Err(e) = noted {
                        warn!("job {}: no se pudo anotar el log: {}", id, e);
                    }
                }
            }
        }
        outcome
    }

    async fn record(&self, id: &str, outcome: Outcome) {
        let status = outcome.status;
        let job = id.to_string();
        let result = self
            .with_store(move |store| {
                let result_file = match status {
                    JobStatus::Completed => store.find_result_artifact(&job),
                    _ => None,
                };
                store.transition(&job, status, move |m| {
                    m.failure = outcome.failure;
                    m.error = outcome.error;
                    m.exit_code = outcome.exit_code;
                    m.result_file = result_file;
                })
            })
            .await;
        match result {
            Ok(t) if t.applied() => info!("job {} terminó en {:?}", id, status),
            Ok(t) => info!(
                "job {}: {:?} ignorado, ya estaba en {:?}",
                id,
                status,
                t.manifest().status
            ),
            Err(e) => error!("job {}: no se pudo registrar {:?}: {}", id, status, e),
        }
    }

    async fn finish(&self, lease: Lease) {
        let id = lease.id().to_string();
        match tokio::task::spawn_blocking(move || lease.finish()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("job {}: error liberando el lease: {}", id, e),
            Err(e) => warn!("job {}: error liberando el lease: {}", id, e),
        }
    }
}

fn classify(report: &RunReport) -> Outcome {
    if let Some(e) = &report.log_error {
        return Outcome::failed(
            FailureKind::Infrastructure,
            format!("error escribiendo el log: {e}"),
        );
    }

    match &report.reason {
        ExitReason::Cancelled => Outcome::failed(
            FailureKind::Cancelled,
            "job cancelado por el usuario".to_string(),
        ),
        ExitReason::TimedOut => Outcome::failed(
            FailureKind::TimedOut,
            "se superó el tiempo máximo de ejecución".to_string(),
        ),
        ExitReason::LogFailed => Outcome::failed(
            FailureKind::Infrastructure,
            "el log dejó de aceptar escrituras".to_string(),
        ),
        ExitReason::Lost(e) => Outcome::failed(
            FailureKind::Infrastructure,
            format!("se perdió el proceso: {e}"),
        ),
        ExitReason::Exited(Some(0)) => Outcome {
            status: JobStatus::Completed,
            failure: None,
            error: None,
            exit_code: Some(0),
            note: None,
        },
        ExitReason::Exited(code) => {
            let tail = report.stderr_tail.trim_end();
            let message = if tail.is_empty() {
                match code {
                    Some(c) => format!("el binario terminó con código {c}"),
                    None => "el binario terminó por una señal".to_string(),
                }
            } else {
                tail.to_string()
            };
            Outcome {
                status: JobStatus::Failed,
                failure: Some(FailureKind::ExecutionFailure),
                error: Some(message),
                exit_code: *code,
                note: None,
            }
        }
    }
}

async fn write_note(log: &mut LogAppender, outcome: &Outcome) {
    if let Some(note) = &outcome.note {
        if let Err(e) = log.append_line(note).await {
            warn!("no se pudo escribir en {}: {}", log.path().display(), e);
        }
    }
}

/// Id estable de un worker del pool: `<hostname>-w<n>`.
pub fn worker_id(index: usize) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "local".to_string());
    format!("{host}-w{index}")
}

/// N workers consumiendo la misma cola.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(engine: Arc<Engine>, size: usize) -> Self {
        let shutdown = CancellationToken::new();
        let size = size.max(1);

        let handles = (0..size)
            .map(|index| {
                let engine = Arc::clone(&engine);
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(engine, worker_id(index), shutdown))
            })
            .collect();

        info!("pool de {} workers iniciado", size);
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Detiene el pool. Un job en curso se corta y su entrada queda en la
    /// cola para la reconciliación del próximo arranque.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("worker terminó con error: {}", e);
            }
        }
        info!("pool de workers detenido");
    }
}

async fn worker_loop(engine: Arc<Engine>, id: String, shutdown: CancellationToken) {
    debug!("worker {} esperando trabajo", id);
    loop {
        let lease = tokio::select! {
            _ = shutdown.cancelled() => break,
            lease = engine.queue().dequeue(&id) => lease,
        };

        match lease {
            Ok(lease) => {
                let job = lease.id().to_string();
                let engine = Arc::clone(&engine);
                let task = tokio::spawn(async move { engine.execute(lease).await });
                if !await_execution(&id, &job, task, &shutdown).await {
                    break;
                }
            }
            Err(e) => {
                warn!("worker {}: error pidiendo trabajo: {}", id, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(DEQUEUE_RETRY) => {}
                }
            }
        }
    }
    debug!("worker {} detenido", id);
}

/// Espera la ejecución de un job, que corre en su propia tarea: si esa tarea
/// entra en panic el worker sigue tomando trabajo. Devuelve false si llegó
/// el apagado; en ese caso la ejecución se aborta y su lease se descarta.
async fn await_execution(
    worker: &str,
    job: &str,
    mut task: JoinHandle<()>,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => {
            warn!("worker {}: apagado con el job {} en curso", worker, job);
            task.abort();
            let _ = task.await;
            false
        }
        joined = &mut task => {
            if let Err(e) = joined {
                // el lease se soltó sin terminar; el barrido marca el job
                error!("worker {}: la ejecución del job {} falló: {}", worker, job, e);
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use common::{JobParameters, RemoveOutcome};
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<JobStore>,
        queue: Arc<TaskQueue>,
    }

    impl Fixture {
        fn new(capacity: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(JobStore::open(dir.path().join("process")).unwrap());
            let queue = TaskQueue::open(dir.path().join("queue"), capacity, None).unwrap();
            Self {
                dir,
                store,
                queue,
            }
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn engine(&self, binary: &Path) -> Arc<Engine> {
            Arc::new(Engine::new(
                Arc::clone(&self.store),
                Arc::clone(&self.queue),
                ExecutionSettings {
                    binary: binary.to_path_buf(),
                    supervision: SupervisionSettings {
                        kill_grace: Duration::from_millis(300),
                        ..SupervisionSettings::default()
                    },
                },
            ))
        }

        fn submit(&self, id: &str) {
            self.store
                .create(
                    id,
                    JobParameters {
                        graphlet_size: 4,
                        density: 0.5,
                        fractional_overlap: 0.2,
                    },
                    "net.el",
                )
                .unwrap();
            self.queue.enqueue(id, json!({})).unwrap();
            self.store.transition(id, JobStatus::Queued, |_| {}).unwrap();
        }

        async fn wait_terminal(&self, id: &str) -> JobManifest {
            for _ in 0..200 {
                let m = self.store.read(id).unwrap();
                if m.status.is_terminal() {
                    return m;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("job {id} no llegó a un estado terminal");
        }
    }

    #[tokio::test]
    async fn successful_run_completes_with_artifact() {
        let fx = Fixture::new(1);
        let bin = fx.script("ok", "echo \"k=$1\"\necho zip > result.zip\nexit 0");
        fx.submit("job1");

        let engine = fx.engine(&bin);
        let lease = fx.queue.dequeue("w0").await.unwrap();
        engine.execute(lease).await;

        let m = fx.store.read("job1").unwrap();
        assert_eq!(m.status, JobStatus::Completed);
        assert_eq!(m.attempts, 1);
        assert_eq!(m.exit_code, Some(0));
        assert_eq!(m.result_file.as_deref(), Some("result.zip"));
        assert!(fx.store.read_log("job1").unwrap().contains("k=4"));
        assert_eq!(fx.queue.leased_len(), 0);
        assert_eq!(fx.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_stderr() {
        let fx = Fixture::new(1);
        let bin = fx.script("bad", "echo 'bad density' >&2\nexit 2");
        fx.submit("job1");

        let engine = fx.engine(&bin);
        let lease = fx.queue.dequeue("w0").await.unwrap();
        engine.execute(lease).await;

        let m = fx.store.read("job1").unwrap();
        assert_eq!(m.status, JobStatus::Failed);
        assert_eq!(m.failure, Some(FailureKind::ExecutionFailure));
        assert_eq!(m.exit_code, Some(2));
        assert_eq!(m.error.as_deref(), Some("bad density"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let fx = Fixture::new(1);
        fx.submit("job1");

        let engine = fx.engine(Path::new("/nonexistent/blant-clusters"));
        let lease = fx.queue.dequeue("w0").await.unwrap();
        engine.execute(lease).await;

        let m = fx.store.read("job1").unwrap();
        assert_eq!(m.status, JobStatus::Failed);
        assert_eq!(m.failure, Some(FailureKind::SpawnFailure));
        assert!(fx.store.read_log("job1").unwrap().contains("[SpawnFailure]"));
    }

    #[tokio::test]
    async fn stale_lease_for_terminal_job_is_dropped() {
        let fx = Fixture::new(1);
        let bin = fx.script("never", "touch ran\nexit 0");
        fx.submit("job1");
        fx.store
            .transition("job1", JobStatus::Failed, |m| {
                m.failure = Some(FailureKind::Interrupted)
            })
            .unwrap();

        let engine = fx.engine(&bin);
        let lease = fx.queue.dequeue("w0").await.unwrap();
        engine.execute(lease).await;

        let m = fx.store.read("job1").unwrap();
        assert_eq!(m.failure, Some(FailureKind::Interrupted));
        assert_eq!(m.attempts, 0);
        assert!(!fx.store.job_dir("job1").join("ran").exists());
        assert_eq!(fx.queue.leased_len(), 0);
    }

    #[tokio::test]
    async fn cancelling_a_lease_fails_the_job() {
        let fx = Fixture::new(1);
        let bin = fx.script("stubborn", "trap '' TERM\necho started\nwhile true; do sleep 1; done");
        fx.submit("job1");

        let pool = WorkerPool::start(fx.engine(&bin), 1);
        while fx.store.read("job1").unwrap().status != JobStatus::Active {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut control = match fx.queue.remove("job1").unwrap() {
            RemoveOutcome::Leased(c) => c,
            other => panic!("se esperaba un lease, llegó {other:?}"),
        };

        control.cancel();
        assert!(control.wait_finished(Duration::from_secs(5)).await);

        let m = fx.store.read("job1").unwrap();
        assert_eq!(m.status, JobStatus::Failed);
        assert_eq!(m.failure, Some(FailureKind::Cancelled));
        assert!(fx.store.read_log("job1").unwrap().contains("[Cancelled]"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn single_worker_runs_jobs_one_at_a_time() {
        let fx = Fixture::new(1);
        let trace = fx.dir.path().join("trace");
        let bin = fx.script(
            "record",
            &format!(
                "echo start >> {t}\nsleep 0.2\necho end >> {t}\nexit 0",
                t = trace.display()
            ),
        );
        fx.submit("job1");
        fx.submit("job2");

        let pool = WorkerPool::start(fx.engine(&bin), 1);
        assert_matches!(fx.wait_terminal("job1").await.status, JobStatus::Completed);
        assert_matches!(fx.wait_terminal("job2").await.status, JobStatus::Completed);
        pool.shutdown().await;

        let lines = std::fs::read_to_string(&trace).unwrap();
        assert_eq!(lines, "start\nend\nstart\nend\n");
    }

    #[test]
    fn log_failure_is_an_infrastructure_error() {
        let report = RunReport {
            reason: ExitReason::LogFailed,
            log: None,
            stderr_tail: String::new(),
            bytes: 0,
            log_error: Some(io::Error::other("disco lleno")),
        };
        let outcome = classify(&report);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureKind::Infrastructure));
        assert!(outcome.note.unwrap().starts_with("[Infrastructure]"));
    }

    #[tokio::test]
    async fn worker_survives_a_panicking_execution() {
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(async { panic!("falla en la ejecución") });
        assert!(await_execution("w0", "job1", task, &shutdown).await);

        let task = tokio::spawn(async {});
        assert!(await_execution("w0", "job2", task, &shutdown).await);

        let task = tokio::spawn(std::future::pending::<()>());
        shutdown.cancel();
        assert!(!await_execution("w0", "job3", task, &shutdown).await);
    }

    #[test]
    fn worker_ids_are_indexed() {
        assert!(worker_id(3).ends_with("-w3"));
    }
}
