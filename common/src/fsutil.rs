// Escrituras atómicas de JSON: archivo temporal -> fsync -> rename.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    // Nombre único: dos escritores nunca comparten el temporal
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
}

/// Escribe `data` como JSON de forma atómica. Un lector concurrente ve el
/// archivo viejo o el nuevo, nunca uno a medio escribir.
pub fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
    let temp_path = temp_path_for(path);

    let result = (|| {
        let mut temp_file = File::create(&temp_path)?;
        temp_file.write_all(&bytes)?;
        temp_file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result?;

    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

/// fsync del directorio para que el rename sobreviva a un corte.
/// Best-effort: en algunas plataformas no se puede abrir un directorio.
pub fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

/// Mueve un archivo; si `rename` falla (otro filesystem) copia y borra.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
