use anyhow::{Context, Result};
use master::{build_router, monitor, AppState, Config, Orchestrator};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "master=debug,worker=debug,common=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!(
        "binario de análisis: {}, {} workers",
        config.analysis_binary.display(),
        config.worker_concurrency
    );

    let orchestrator = Arc::new(Orchestrator::open(&config).context("no se pudo abrir el store")?);

    // lo que quedó en vuelo de la corrida anterior, antes de tomar trabajo
    let recovered = orchestrator.recover().context("reconciliación inicial")?;
    if !recovered.interrupted.is_empty() {
        info!(
            "{} jobs marcados como interrumpidos al arrancar",
            recovered.interrupted.len()
        );
    }

    let pool = orchestrator.start_workers();

    // barrido periódico en segundo plano
    let shutdown = CancellationToken::new();
    let monitor_handle = tokio::spawn(monitor::monitor_jobs(
        Arc::clone(&orchestrator),
        config.sweep_interval,
        config.stale_after,
        shutdown.clone(),
    ));

    let app = build_router(AppState::new(
        Arc::clone(&orchestrator),
        config.max_upload_bytes,
    ));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.listen_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("señal de apagado recibida");
        })
        .await?;

    shutdown.cancel();
    let _ = monitor_handle.await;
    pool.shutdown().await;
    Ok(())
}
