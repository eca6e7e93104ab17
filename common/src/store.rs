//! Job Store: registro durable de cada job sobre el filesystem.
//!
//! Un directorio por job bajo `root`:
//!
//! ```text
//! <root>/<id>/info.json      manifest (estado + parámetros + timestamps)
//! <root>/<id>/run.log        salida del binario, solo append
//! <root>/<id>/networks/...   copia de la red subida
//! <root>/<id>/<archivo>      resultado (zip / tar.gz), si lo hubo
//! ```
//!
//! El manifest se reemplaza de forma atómica y las escrituras se serializan
//! con un lock del store; las lecturas no toman el lock.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::error::{OrchestratorError, Result};
use crate::fsutil;
use crate::job::{split_network_name, JobId, JobManifest, JobParameters, JobStatus};

pub const MANIFEST_FILE: &str = "info.json";
pub const LOG_FILE: &str = "run.log";
pub const NETWORKS_DIR: &str = "networks";

/// Patrones de archivo que cuentan como resultado del análisis.
const RESULT_PATTERNS: [&str; 3] = ["*.zip", "*.tar.gz", "*.tgz"];

/// Resultado de `JobStore::transition`. `Ignored` significa que el guard
/// monótono rechazó el cambio (alguien llegó antes a un estado terminal).
#[derive(Debug, Clone)]
pub enum Transition {
    Applied(JobManifest),
    Ignored(JobManifest),
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn manifest(&self) -> &JobManifest {
        match self {
            Transition::Applied(m) | Transition::Ignored(m) => m,
        }
    }

    pub fn into_manifest(self) -> JobManifest {
        match self {
            Transition::Applied(m) | Transition::Ignored(m) => m,
        }
    }
}

pub struct JobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// Los ids vienen de URLs: solo aceptamos [A-Za-z0-9_-] para que nunca
/// salgan del directorio raíz.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl JobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        // Rutas absolutas: el binario corre con cwd en el directorio del job
        let root = fs::canonicalize(&root)?;
        info!("job store en {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(MANIFEST_FILE)
    }

    fn log_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join(LOG_FILE)
    }

    fn check_id(id: &str) -> Result<()> {
        if is_valid_id(id) {
            Ok(())
        } else {
            Err(OrchestratorError::NotFound(id.to_string()))
        }
    }

    /// Crea el directorio y el manifest inicial (`preprocessing`).
    /// Falla con `Conflict` si el id ya existe.
    pub fn create(
        &self,
        id: &str,
        parameters: JobParameters,
        original_name: &str,
    ) -> Result<JobManifest> {
        Self::check_id(id)?;
        parameters.validate()?;
        let (network_name, extension) = split_network_name(original_name).ok_or_else(|| {
            OrchestratorError::InvalidParameters(format!(
                "nombre de red inválido: {original_name}"
            ))
        })?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.job_dir(id);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(OrchestratorError::Conflict(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(dir.join(NETWORKS_DIR))?;

        let now = Utc::now();
        let manifest = JobManifest {
            id: id.to_string(),
            status: JobStatus::Preprocessing,
            parameters,
            network_file: Path::new(NETWORKS_DIR).join(format!("{network_name}{extension}")),
            network_name,
            extension,
            location: dir.clone(),
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure: None,
            error: None,
            result_file: None,
        };

        if let Err(e) = fsutil::write_json_atomic(&self.manifest_path(id), &manifest) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e.into());
        }

        debug!("job {} creado en {}", id, dir.display());
        Ok(manifest)
    }

    /// Mueve el archivo subido a `networks/` dentro del directorio del job.
    pub fn import_network(&self, id: &str, source: &Path) -> Result<PathBuf> {
        let manifest = self.read(id)?;
        let target = manifest.network_path();
        fsutil::move_file(source, &target)?;
        Ok(target)
    }

    pub fn read(&self, id: &str) -> Result<JobManifest> {
        Self::check_id(id)?;
        let dir = self.job_dir(id);
        if !dir.is_dir() {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }

        let bytes = match fs::read(self.manifest_path(id)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(OrchestratorError::NotFound(id.to_string()));
            }
            Err(e) => {
                error!("no se pudo leer el manifest del job {}: {}", id, e);
                return Err(OrchestratorError::StoreCorruption {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            error!("manifest malformado para el job {}: {}", id, e);
            OrchestratorError::StoreCorruption {
                id: id.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Lee, aplica `patch` y persiste. Actualiza `updated_at`.
    pub fn update<F>(&self, id: &str, patch: F) -> Result<JobManifest>
    where
        F: FnOnce(&mut JobManifest),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut manifest = self.read(id)?;
        patch(&mut manifest);
        manifest.updated_at = Utc::now();
        fsutil::write_json_atomic(&self.manifest_path(id), &manifest)?;
        Ok(manifest)
    }

    /// Cambia el estado respetando el guard monótono. Si el cambio no está
    /// permitido no se escribe nada y se devuelve `Ignored`.
    pub fn transition<F>(&self, id: &str, next: JobStatus, patch: F) -> Result<Transition>
    where
        F: FnOnce(&mut JobManifest),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut manifest = self.read(id)?;

        if !manifest.status.can_transition_to(next) {
            debug!(
                "job {}: transición {:?} -> {:?} ignorada",
                id, manifest.status, next
            );
            return Ok(Transition::Ignored(manifest));
        }

        let now = Utc::now();
        manifest.status = next;
        manifest.updated_at = now;
        match next {
            JobStatus::Active => {
                manifest.attempts += 1;
                manifest.started_at = Some(now);
            }
            JobStatus::Completed | JobStatus::Failed => {
                manifest.finished_at = Some(now);
            }
            _ => {}
        }
        patch(&mut manifest);

        fsutil::write_json_atomic(&self.manifest_path(id), &manifest)?;
        Ok(Transition::Applied(manifest))
    }

    /// Abre el log del job en modo append. Solo el worker activo lo usa.
    pub async fn open_log(&self, id: &str) -> Result<LogAppender> {
        Self::check_id(id)?;
        Ok(LogAppender::open(&self.log_path(id)).await?)
    }

    /// Agrega una línea al log sin pasar por un worker (barrido, cancelación
    /// forzada). Solo se usa cuando no hay un worker vivo para el job.
    pub fn append_log_note(&self, id: &str, line: &str) -> Result<()> {
        Self::check_id(id)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.log_path(id))?;
        let len = file.metadata()?.len();
        let mut bytes = Vec::new();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                bytes.push(b'\n');
            }
        }
        bytes.extend_from_slice(&terminated(line.as_bytes()));
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    /// Log completo.
    pub fn read_log(&self, id: &str) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read_log_bytes(id)?).into_owned())
    }

    /// Log hasta la última línea completa. Con un worker escribiendo en
    /// paralelo, el resultado siempre es prefijo del log final.
    pub fn read_log_snapshot(&self, id: &str) -> Result<String> {
        let mut bytes = self.read_log_bytes(id)?;
        let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        bytes.truncate(keep);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_log_bytes(&self, id: &str) -> Result<Vec<u8>> {
        Self::check_id(id)?;
        match fs::read(self.log_path(id)) {
            Ok(b) => Ok(b),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Busca el archivo de resultados que dejó el binario en el directorio
    /// del job. Si hay varios se toma el primero en orden alfabético.
    pub fn find_result_artifact(&self, id: &str) -> Option<String> {
        let dir = self.job_dir(id);
        let escaped = glob::Pattern::escape(&dir.to_string_lossy());

        let mut found: Vec<String> = Vec::new();
        for pattern in RESULT_PATTERNS {
            let Ok(entries) = glob::glob(&format!("{escaped}/{pattern}")) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.is_file() {
                    if let Some(name) = entry.file_name().and_then(|n| n.to_str()) {
                        found.push(name.to_string());
                    }
                }
            }
        }
        found.sort();
        found.into_iter().next()
    }

    /// Ruta absoluta del resultado de un job completado, si existe en disco.
    pub fn result_path(&self, id: &str) -> Result<Option<PathBuf>> {
        let manifest = self.read(id)?;
        if manifest.status != JobStatus::Completed {
            return Ok(None);
        }
        Ok(manifest
            .result_file
            .map(|name| self.job_dir(id).join(name))
            .filter(|p| p.is_file()))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        Self::check_id(id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_dir_all(self.job_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(OrchestratorError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ids de todos los directorios de job.
    pub fn list(&self) -> Result<Vec<JobId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)?.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_id(name) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn terminated(chunk: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(chunk.len() + 1);
    buf.extend_from_slice(chunk);
    if !buf.ends_with(b"\n") {
        buf.push(b'\n');
    }
    buf
}

/// Handle de append sobre `run.log`.
pub struct LogAppender {
    file: tokio::fs::File,
    path: PathBuf,
    /// El último byte escrito fue '\n' (o el log está vacío)
    at_line_start: bool,
}

impl LogAppender {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();
        let at_line_start = if len == 0 {
            true
        } else {
            file.seek(SeekFrom::Start(len - 1)).await?;
            file.read_u8().await? == b'\n'
        };
        Ok(Self {
            file,
            path: path.to_path_buf(),
            at_line_start,
        })
    }

    /// Escribe el chunk tal cual llegó y hace flush antes de volver, así el
    /// próximo chunk nunca queda delante de este.
    pub async fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        let Some(last) = chunk.last() else {
            return Ok(());
        };
        self.file.write_all(chunk).await?;
        self.file.flush().await?;
        self.at_line_start = *last == b'\n';
        Ok(())
    }

    /// Cierra la línea en curso si quedó abierta.
    pub async fn break_line(&mut self) -> io::Result<()> {
        if self.at_line_start {
            return Ok(());
        }
        self.append(b"\n").await
    }

    /// Línea completa, siempre empezando en una línea nueva.
    pub async fn append_line(&mut self, line: &str) -> io::Result<()> {
        self.break_line().await?;
        self.append(&terminated(line.as_bytes())).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FailureKind;
    use assert_matches::assert_matches;

    fn params() -> JobParameters {
        JobParameters {
            graphlet_size: 4,
            density: 0.5,
            fractional_overlap: 0.2,
        }
    }

    fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("process")).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_read() {
        let (_dir, store) = store();
        let created = store.create("job1", params(), "yeast.el").unwrap();
        assert_eq!(created.status, JobStatus::Preprocessing);
        assert_eq!(created.network_name, "yeast");
        assert_eq!(created.extension, ".el");
        assert_eq!(created.attempts, 0);

        let read = store.read("job1").unwrap();
        assert_eq!(read.id, "job1");
        assert_eq!(read.parameters, params());
        assert!(store.job_dir("job1").join(NETWORKS_DIR).is_dir());
    }

    #[test]
    fn duplicate_create_is_conflict() {
        let (_dir, store) = store();
        store.create("job1", params(), "yeast.el").unwrap();
        assert_matches!(
            store.create("job1", params(), "yeast.el"),
            Err(OrchestratorError::Conflict(id)) if id == "job1"
        );
    }

    #[test]
    fn missing_and_corrupt_manifests() {
        let (_dir, store) = store();
        assert_matches!(store.read("nope"), Err(OrchestratorError::NotFound(_)));
        assert_matches!(store.read("../etc"), Err(OrchestratorError::NotFound(_)));

        fs::create_dir(store.job_dir("empty")).unwrap();
        assert_matches!(store.read("empty"), Err(OrchestratorError::NotFound(_)));

        store.create("bad", params(), "yeast.el").unwrap();
        fs::write(store.job_dir("bad").join(MANIFEST_FILE), b"{ not json").unwrap();
        let err = store.read("bad").unwrap_err();
        assert_matches!(err, OrchestratorError::StoreCorruption { .. });
        assert!(err.is_not_found());
    }

    #[test]
    fn transition_guard_is_monotonic() {
        let (_dir, store) = store();
        store.create("job1", params(), "yeast.el").unwrap();

        assert!(store.transition("job1", JobStatus::Queued, |_| {}).unwrap().applied());
        let active = store.transition("job1", JobStatus::Active, |_| {}).unwrap();
        assert!(active.applied());
        assert_eq!(active.manifest().attempts, 1);
        assert!(active.manifest().started_at.is_some());

        // retroceso ignorado
        let back = store.transition("job1", JobStatus::Queued, |_| {}).unwrap();
        assert!(!back.applied());
        assert_eq!(back.manifest().status, JobStatus::Active);

        let done = store
            .transition("job1", JobStatus::Completed, |m| m.exit_code = Some(0))
            .unwrap();
        assert!(done.applied());

        // el perdedor de la carrera no pisa el estado terminal
        let late = store
            .transition("job1", JobStatus::Failed, |m| {
                m.failure = Some(FailureKind::Cancelled)
            })
            .unwrap();
        assert!(!late.applied());
        let final_state = store.read("job1").unwrap();
        assert_eq!(final_state.status, JobStatus::Completed);
        assert_eq!(final_state.failure, None);
        assert!(final_state.finished_at.is_some());
    }

    #[tokio::test]
    async fn log_snapshot_is_prefix_of_final_log() {
        let (_dir, store) = store();
        store.create("job1", params(), "yeast.el").unwrap();
        let mut log = store.open_log("job1").await.unwrap();

        log.append(b"line 1\nline 2\n").await.unwrap();
        let snapshot = store.read_log_snapshot("job1").unwrap();

        // chunk sin '\n' ya en disco: el snapshot lo descarta
        log.append(b"progress 50%").await.unwrap();
        assert_eq!(store.read_log_snapshot("job1").unwrap(), snapshot);
        assert_eq!(store.read_log("job1").unwrap(), "line 1\nline 2\nprogress 50%");

        log.append(b" done\n").await.unwrap();
        let final_log = store.read_log("job1").unwrap();
        assert_eq!(snapshot, "line 1\nline 2\n");
        assert_eq!(final_log, "line 1\nline 2\nprogress 50% done\n");
        assert!(final_log.starts_with(&snapshot));
    }

    #[tokio::test]
    async fn notes_always_start_on_a_new_line() {
        let (_dir, store) = store();
        store.create("job1", params(), "yeast.el").unwrap();
        let mut log = store.open_log("job1").await.unwrap();

        log.append(b"50%").await.unwrap();
        log.append_line("[TimedOut] corte").await.unwrap();
        log.append(b"80%").await.unwrap();
        drop(log);
        store.append_log_note("job1", "[Interrupted] nota").unwrap();

        // al reabrir se detecta que el log termina en '\n'
        let mut log = store.open_log("job1").await.unwrap();
        log.append_line("fin").await.unwrap();
        assert_eq!(
            store.read_log("job1").unwrap(),
            "50%\n[TimedOut] corte\n80%\n[Interrupted] nota\nfin\n"
        );
    }

    #[test]
    fn log_of_new_job_is_empty() {
        let (_dir, store) = store();
        store.create("job1", params(), "yeast.el").unwrap();
        assert_eq!(store.read_log("job1").unwrap(), "");
        store.append_log_note("job1", "[Interrupted] nota").unwrap();
        assert_eq!(store.read_log("job1").unwrap(), "[Interrupted] nota\n");
    }

    #[test]
    fn finds_result_artifact() {
        let (_dir, store) = store();
        store.create("job1", params(), "yeast.el").unwrap();
        assert_eq!(store.find_result_artifact("job1"), None);

        fs::write(store.job_dir("job1").join("yeast-results.zip"), b"PK").unwrap();
        assert_eq!(
            store.find_result_artifact("job1"),
            Some("yeast-results.zip".to_string())
        );
    }

    #[test]
    fn import_delete_and_list() {
        let (dir, store) = store();
        let upload = dir.path().join("upload-123");
        fs::write(&upload, "1 2\n2 3\n").unwrap();

        store.create("job1", params(), "yeast.el").unwrap();
        store.create("job2", params(), "human.gw").unwrap();
        let target = store.import_network("job1", &upload).unwrap();
        assert!(target.ends_with("networks/yeast.el"));
        assert_eq!(fs::read_to_string(target).unwrap(), "1 2\n2 3\n");

        assert_eq!(store.list().unwrap(), vec!["job1".to_string(), "job2".to_string()]);
        store.delete("job1").unwrap();
        assert_eq!(store.list().unwrap(), vec!["job2".to_string()]);
        assert_matches!(store.delete("job1"), Err(OrchestratorError::NotFound(_)));
    }
}
