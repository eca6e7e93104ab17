//! Supervisión del proceso externo.
//!
//! El binario se invoca con una lista de argumentos (sin shell):
//! `<binary> <graphletSize> <density> <fractionalOverlap> <networkFilePath>`,
//! con cwd en el directorio del job y en su propio grupo de procesos, para
//! poder terminarlo junto con sus hijos.

use common::{JobManifest, LogAppender};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::logsink::{self, Stream};

/// Cuánto esperamos a que los lectores vacíen los pipes después de que el
/// proceso terminó (un nieto puede haberse quedado con el pipe abierto).
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const SPAWN_BUSY_RETRIES: u32 = 5;
const SPAWN_BUSY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SupervisionSettings {
    /// Espera entre SIGTERM y SIGKILL
    pub kill_grace: Duration,
    pub log_channel_capacity: usize,
    pub stderr_tail_bytes: usize,
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            log_channel_capacity: 256,
            stderr_tail_bytes: 8 * 1024,
        }
    }
}

/// Invocación concreta del binario para un job. Solo depende de los
/// parámetros y la red de ese job.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

impl Invocation {
    pub fn for_job(binary: &Path, manifest: &JobManifest) -> Self {
        let mut args: Vec<OsString> = manifest
            .parameters
            .to_args()
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(manifest.network_path().into_os_string());

        Self {
            program: binary.to_path_buf(),
            args,
            cwd: manifest.location.clone(),
        }
    }

    /// Lanza el proceso. Un error acá es un `SpawnFailure`.
    pub async fn spawn(&self) -> io::Result<Child> {
        let mut attempt = 0;
        loop {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args)
                .current_dir(&self.cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            #[cfg(unix)]
            cmd.process_group(0);

            match cmd.spawn() {
                // ETXTBSY: el binario todavía está abierto para escritura
                // (por ejemplo, se está reemplazando); se reintenta un poco.
                #[cfg(unix)]
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_BUSY_RETRIES => {
                    attempt += 1;
                    debug!("binario ocupado, reintento {} de spawn", attempt);
                    tokio::time::sleep(SPAWN_BUSY_BACKOFF).await;
                }
                other => return other,
            }
        }
    }
}

#[derive(Debug)]
pub enum ExitReason {
    /// Terminó solo; `None` si lo mató una señal externa
    Exited(Option<i32>),
    Cancelled,
    TimedOut,
    /// Se dejó de poder escribir el log; el proceso se terminó
    LogFailed,
    /// No se pudo esperar al proceso
    Lost(io::Error),
}

pub struct RunReport {
    pub reason: ExitReason,
    /// `None` solo si la tarea escritora murió
    pub log: Option<LogAppender>,
    pub stderr_tail: String,
    /// Bytes de salida que llegaron al log
    pub bytes: u64,
    pub log_error: Option<io::Error>,
}

/// Corre el proceso ya lanzado hasta que termina, se cancela, vence el
/// deadline o falla el log, volcando stdout y stderr al log a medida que
/// llegan.
pub async fn supervise(
    mut child: Child,
    log: LogAppender,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    settings: &SupervisionSettings,
) -> RunReport {
    let (tx, rx) = mpsc::channel(settings.log_channel_capacity.max(1));
    let log_failed = CancellationToken::new();
    let writer =
        logsink::spawn_log_writer(log, rx, settings.stderr_tail_bytes, log_failed.clone());

    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(logsink::pump(out, Stream::Stdout, tx.clone())));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(logsink::pump(err, Stream::Stderr, tx.clone())));
    }
    drop(tx);

    let deadline_reached = async {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    let reason = tokio::select! {
        status = child.wait() => match status {
            Ok(s) => ExitReason::Exited(s.code()),
            Err(e) => ExitReason::Lost(e),
        },
        _ = cancel.cancelled() => {
            debug!("cancelación recibida, terminando el proceso");
            if let Err(e) = graceful_kill(&mut child, settings.kill_grace).await {
                warn!("error terminando el proceso: {}", e);
            }
            ExitReason::Cancelled
        }
        _ = deadline_reached => {
            debug!("deadline vencido, terminando el proceso");
            if let Err(e) = graceful_kill(&mut child, settings.kill_grace).await {
                warn!("error terminando el proceso: {}", e);
            }
            ExitReason::TimedOut
        }
        _ = log_failed.cancelled() => {
            warn!("el log dejó de aceptar escrituras, terminando el proceso");
            if let Err(e) = graceful_kill(&mut child, settings.kill_grace).await {
                warn!("error terminando el proceso: {}", e);
            }
            ExitReason::LogFailed
        }
    };

    for reader in readers {
        let abort = reader.abort_handle();
        match tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("error leyendo salida del proceso: {}", e),
            Ok(Err(e)) => warn!("tarea lectora falló: {}", e),
            Err(_) => {
                warn!("los pipes siguen abiertos tras la salida del proceso, se cortan");
                abort.abort();
            }
        }
    }

    match writer.await {
        Ok(sink) => RunReport {
            reason,
            log: Some(sink.log),
            stderr_tail: sink.stderr_tail,
            bytes: sink.bytes,
            log_error: sink.error,
        },
        // El appender se perdió con la tarea escritora
        Err(e) => RunReport {
            reason,
            log: None,
            stderr_tail: String::new(),
            bytes: 0,
            log_error: Some(io::Error::other(format!("la tarea escritora del log falló: {e}"))),
        },
    }
}

/// SIGTERM al grupo de procesos, espera `grace` y si sigue vivo SIGKILL.
#[cfg(unix)]
async fn graceful_kill(child: &mut Child, grace: Duration) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // ya terminó y fue cosechado
        return Ok(());
    };
    let pgid = pid as libc::pid_t;

    // SAFETY: kill(2) con pid negativo apunta al grupo creado en el spawn
    // (process_group(0) => pgid == pid del hijo).
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }

    tokio::select! {
        status = child.wait() => return status.map(|_| ()),
        _ = tokio::time::sleep(grace) => {}
    }

    warn!("el proceso {} ignoró SIGTERM, se envía SIGKILL", pid);
    // SAFETY: idem arriba
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    child.wait().await.map(|_| ())
}

#[cfg(not(unix))]
async fn graceful_kill(child: &mut Child, _grace: Duration) -> io::Result<()> {
    child.kill().await
}
