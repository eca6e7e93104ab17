// Captura de salida: dos lectores (stdout/stderr) -> canal acotado -> un
// único escritor del log. El orden de llegada al canal es el orden del log.

use common::LogAppender;
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Tamaño máximo de un chunk leído de un pipe.
pub const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub struct LogChunk {
    pub stream: Stream,
    pub bytes: Vec<u8>,
}

/// Lo que devuelve el escritor al cerrarse el canal.
pub struct SinkReport {
    /// El appender vuelve al worker para las entradas sintéticas finales
    pub log: LogAppender,
    pub stderr_tail: String,
    pub bytes: u64,
    /// Primer error de escritura, si hubo
    pub error: Option<io::Error>,
}

/// Últimos bytes de stderr.
struct TailBuffer {
    bytes: VecDeque<u8>,
    max_bytes: usize,
    /// Se descartó el comienzo de una línea que todavía está en el buffer
    cut_mid_line: bool,
}

impl TailBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            max_bytes: max_bytes.max(1),
            cut_mid_line: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        let excess = self.bytes.len().saturating_sub(self.max_bytes);
        if excess > 0 {
            let last_dropped = self.bytes.drain(..excess).last();
            self.cut_mid_line = last_dropped != Some(b'\n');
        }
    }

    fn into_string(self) -> String {
        let mut bytes: Vec<u8> = self.bytes.into();
        if self.cut_mid_line {
            // se saltea la línea truncada si hay alguna completa después
            if let Some(i) = bytes.iter().position(|b| *b == b'\n') {
                if i + 1 < bytes.len() {
                    bytes.drain(..=i);
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Lee `reader` de a chunks de hasta `CHUNK_SIZE` bytes y manda cada uno al
/// canal apenas llega, con o sin '\n'. Se bloquea si el escritor va atrasado
/// (el canal es acotado).
pub async fn pump<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<LogChunk>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = LogChunk {
            stream,
            bytes: buf[..n].to_vec(),
        };
        if tx.send(chunk).await.is_err() {
            // el escritor ya no está; no tiene sentido seguir leyendo
            return Ok(());
        }
    }
}

/// Lanza la tarea escritora. Cada chunk se escribe y se hace flush antes de
/// recibir el siguiente; al cambiar de stream se cierra la línea abierta del
/// otro. Ante el primer error de escritura se dispara `failed` y se sigue
/// vaciando el canal sin escribir, para no trabar al proceso hijo.
pub fn spawn_log_writer(
    mut log: LogAppender,
    mut rx: mpsc::Receiver<LogChunk>,
    stderr_tail_bytes: usize,
    failed: CancellationToken,
) -> JoinHandle<SinkReport> {
    tokio::spawn(async move {
        let mut tail = TailBuffer::new(stderr_tail_bytes);
        let mut written: u64 = 0;
        let mut error: Option<io::Error> = None;
        let mut last_stream: Option<Stream> = None;

        while let Some(chunk) = rx.recv().await {
            if chunk.stream == Stream::Stderr {
                tail.push(&chunk.bytes);
            }
            if error.is_some() {
                continue;
            }

            let mut result = Ok(());
            if last_stream.is_some_and(|s| s != chunk.stream) {
                result = log.break_line().await;
            }
            if result.is_ok() {
                result = log.append(&chunk.bytes).await;
            }
            last_stream = Some(chunk.stream);

            match result {
                Ok(()) => written += chunk.bytes.len() as u64,
                Err(e) => {
                    warn!("no se pudo escribir en {}: {}", log.path().display(), e);
                    error = Some(e);
                    failed.cancel();
                }
            }
        }

        SinkReport {
            log,
            stderr_tail: tail.into_string(),
            bytes: written,
            error,
        }
    })
}
