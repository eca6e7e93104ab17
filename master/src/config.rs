// Configuración por variables de entorno (con .env opcional).

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Raíz del Job Store, un directorio por job
    pub process_root: PathBuf,
    pub queue_dir: PathBuf,
    /// Siempre absoluta: el binario corre con cwd en el directorio del job
    pub analysis_binary: PathBuf,
    pub worker_concurrency: usize,
    pub kill_grace: Duration,
    /// Cuánto espera un cancel a que el worker suelte el job
    pub cancel_wait: Duration,
    pub job_timeout: Option<Duration>,
    pub log_channel_capacity: usize,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub poll_interval: Duration,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let kill_grace = Duration::from_secs(DEFAULT_KILL_GRACE_SECS);
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            process_root: PathBuf::from("./process"),
            queue_dir: PathBuf::from("./queue"),
            analysis_binary: PathBuf::from("./blant-clusters"),
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            kill_grace,
            cancel_wait: kill_grace + Duration::from_secs(10),
            job_timeout: None,
            log_channel_capacity: 256,
            stale_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(3),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Config {
    /// Lee `.env` (si existe) y las variables de entorno.
    pub fn from_env() -> Result<Self> {
        // sin .env se usan solo las variables del proceso
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let kill_grace = Duration::from_secs(parse_or(
            &lookup,
            "KILL_GRACE_SECS",
            DEFAULT_KILL_GRACE_SECS,
        )?);
        let cancel_wait = match parse::<u64>(&lookup, "CANCEL_WAIT_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => kill_grace + Duration::from_secs(10),
        };

        let binary = lookup("ANALYSIS_BINARY")
            .map(PathBuf::from)
            .unwrap_or(defaults.analysis_binary);

        Ok(Self {
            listen_addr: lookup("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            process_root: lookup("PROCESS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.process_root),
            queue_dir: lookup("QUEUE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.queue_dir),
            analysis_binary: absolute(&binary)?,
            worker_concurrency: parse_or(
                &lookup,
                "WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?
            .max(1),
            kill_grace,
            cancel_wait,
            job_timeout: parse::<u64>(&lookup, "JOB_TIMEOUT_SECS")?.map(Duration::from_secs),
            log_channel_capacity: parse_or(
                &lookup,
                "LOG_CHANNEL_CAPACITY",
                defaults.log_channel_capacity,
            )?,
            stale_after: Duration::from_secs(parse_or(&lookup, "STALE_AFTER_SECS", 600)?),
            sweep_interval: Duration::from_secs(parse_or(&lookup, "SWEEP_INTERVAL_SECS", 30)?),
            poll_interval: Duration::from_secs(parse_or(&lookup, "POLL_INTERVAL_SECS", 3)?),
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("valor inválido para {key}: {raw:?}")),
        _ => Ok(None),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse(lookup, key)?.unwrap_or(default))
}

/// No se canonicaliza: un binario que no existe tiene que llegar hasta el
/// spawn y fallar ahí, no al arrancar.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().context("no se pudo leer el directorio actual")?;
    Ok(cwd.join(path))
}
