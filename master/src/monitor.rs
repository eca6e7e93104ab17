use crate::state::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Loop de reconciliación en segundo plano: repite `sweep_once` cada
/// `interval` hasta que se dispare `shutdown`.
pub async fn monitor_jobs(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    stale_after: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let orch = Arc::clone(&orchestrator);
        // el barrido toca disco; fuera del runtime async
        match tokio::task::spawn_blocking(move || orch.sweep_once(stale_after)).await {
            Ok(Ok(report)) => debug!(
                "barrido ok ({} interrumpidos)",
                report.interrupted.len()
            ),
            Ok(Err(e)) => warn!("error en el barrido de jobs: {}", e),
            Err(e) => warn!("el barrido de jobs falló: {}", e),
        }
    }
    debug!("monitor de jobs detenido");
}
