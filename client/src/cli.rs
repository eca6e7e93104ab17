use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    ApiResponse, CancelResponse, EnvelopeStatus, PublicState, StatusView, SubmitResponse,
};
use reqwest::{multipart, Client, Response};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ORCHESTRATOR_URL: &str = "http://localhost:8080";

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar y seguir análisis de redes")]
struct Cli {
    /// URL base del orquestador
    #[arg(long, env = "ORCHESTRATOR_URL", default_value = DEFAULT_ORCHESTRATOR_URL)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una red (.el o .gw) para analizar
    Submit {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
        #[arg(long, default_value_t = 4)]
        graphlet_size: u8,
        #[arg(long, default_value_t = 0.5)]
        density: f64,
        #[arg(long, default_value_t = 0.2)]
        overlap: f64,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Sigue el log de un job hasta que termine
    Watch {
        #[arg(value_name = "JOB_ID")]
        id: String,
        /// Segundos entre consultas (por defecto, lo que sugiera el servidor)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Cancela un job
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Descarga el archivo de resultados
    Download {
        #[arg(value_name = "JOB_ID")]
        id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Submit {
            file,
            graphlet_size,
            density,
            overlap,
        } => submit(&client, &base_url, &file, graphlet_size, density, overlap).await,
        Commands::Status { id } => {
            let (envelope, view) = fetch_status(&client, &base_url, &id).await?;
            print_view(&view);
            if let Some(error) = envelope.error {
                if let Some(log) = error.error_log {
                    println!("  error: {log}");
                }
            }
            Ok(())
        }
        Commands::Watch { id, interval } => watch(&client, &base_url, &id, interval).await,
        Commands::Cancel { id } => {
            let url = format!("{base_url}{}", common::status_path(&id));
            let resp = client.delete(&url).send().await?;
            let cancel: CancelResponse = decode(resp).await?;
            println!("Job {}: {:?}", cancel.job_id, cancel.result);
            if let Some(status) = cancel.final_status {
                println!("  estado final: {:?}", status);
            }
            Ok(())
        }
        Commands::Download { id, output } => download(&client, &base_url, &id, output).await,
    }
}

async fn submit(
    client: &Client,
    base_url: &str,
    file: &Path,
    graphlet_size: u8,
    density: f64,
    overlap: f64,
) -> Result<()> {
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("ruta sin nombre de archivo: {}", file.display()))?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("no se pudo leer {}", file.display()))?;

    let form = multipart::Form::new()
        .text("graphlet_size", graphlet_size.to_string())
        .text("density", density.to_string())
        .text("fractional_overlap", overlap.to_string())
        .part("file", multipart::Part::bytes(bytes).file_name(file_name));

    let url = format!("{base_url}/api/v1/jobs");
    let resp = client.post(&url).multipart(form).send().await?;
    let job: SubmitResponse = decode(resp).await?;

    println!("Job creado:");
    println!("  id: {}", job.job_id);
    println!("  estado: {:?}", job.status);
    println!(
        "  parámetros: k={} d={} o={}",
        job.parameters.graphlet_size, job.parameters.density, job.parameters.fractional_overlap
    );
    println!("  seguimiento: {base_url}{}", job.status_url);
    Ok(())
}

async fn fetch_status(
    client: &Client,
    base_url: &str,
    id: &str,
) -> Result<(ApiResponse<StatusView>, StatusView)> {
    let url = format!("{base_url}{}", common::status_path(id));
    let resp = client.get(&url).send().await?;
    let status = resp.status();
    let mut envelope: ApiResponse<StatusView> = resp
        .json()
        .await
        .with_context(|| format!("respuesta inválida del servidor (status {status})"))?;
    match envelope.data.take() {
        Some(view) => Ok((envelope, view)),
        None => bail!("{} (status {status})", envelope.message),
    }
}

async fn watch(client: &Client, base_url: &str, id: &str, interval: Option<u64>) -> Result<()> {
    let mut printed = 0usize;
    loop {
        let (_, view) = fetch_status(client, base_url, id).await?;
        let fresh = unseen_log(&view.log, printed);
        if !fresh.is_empty() {
            print!("{fresh}");
        }
        printed = view.log.len();

        if view.state.is_terminal() {
            println!("---");
            print_view(&view);
            return Ok(());
        }

        let secs = interval.or(view.poll_after_secs).unwrap_or(3).max(1);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

async fn download(
    client: &Client,
    base_url: &str,
    id: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let url = format!("{base_url}{}", common::result_download_path(id));
    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let envelope: ApiResponse<serde_json::Value> = resp.json().await?;
        bail!("{} (status {status})", envelope.message);
    }

    let file_name = attachment_name(&resp).unwrap_or_else(|| format!("{id}.zip"));
    let target = output.unwrap_or_else(|| PathBuf::from(file_name));
    let bytes = resp.bytes().await?;
    tokio::fs::write(&target, &bytes)
        .await
        .with_context(|| format!("no se pudo escribir {}", target.display()))?;
    println!("Resultados guardados en {} ({} bytes)", target.display(), bytes.len());
    Ok(())
}

/// Desarma el sobre JSON y devuelve `data`, o el mensaje de error.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let envelope: ApiResponse<T> = resp
        .json()
        .await
        .with_context(|| format!("respuesta inválida del servidor (status {status})"))?;
    match (envelope.status, envelope.data) {
        (EnvelopeStatus::Error, _) | (_, None) => bail!("{} (status {status})", envelope.message),
        (_, Some(data)) => Ok(data),
    }
}

fn attachment_name(resp: &Response) -> Option<String> {
    let value = resp
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    filename_from_disposition(value)
}

fn filename_from_disposition(value: &str) -> Option<String> {
    let raw = value.split("filename=").nth(1)?;
    let name = raw.trim().trim_matches('"');
    // nunca escribir fuera del directorio actual
    let name = Path::new(name).file_name()?.to_string_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}

/// Parte del log que todavía no se mostró. El log de un job solo crece,
/// así que lo ya impreso siempre es un prefijo.
fn unseen_log(log: &str, printed: usize) -> &str {
    log.get(printed..).unwrap_or("")
}

fn print_view(view: &StatusView) {
    println!("Job {}:", view.job_id);
    println!("  estado: {}", state_label(view.state));
    if let Some(position) = view.queue_position {
        println!("  posición en cola: {position}");
    }
    if let Some(failure) = view.failure {
        println!("  causa: {}", failure.tag());
    }
    if let Some(error) = &view.error {
        println!("  detalle: {error}");
    }
    if let Some(result) = &view.result {
        println!("  resultado: {} ({})", result.file_name, result.download_path);
    }
}

fn state_label(state: PublicState) -> &'static str {
    match state {
        PublicState::Queued => "en cola",
        PublicState::Active => "en ejecución",
        PublicState::Completed => "completado",
        PublicState::Failed => "fallido",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_log_skips_printed_prefix() {
        assert_eq!(unseen_log("a\nb\n", 0), "a\nb\n");
        assert_eq!(unseen_log("a\nb\n", 2), "b\n");
        assert_eq!(unseen_log("a\nb\n", 4), "");
        assert_eq!(unseen_log("a\n", 10), "");
    }

    #[test]
    fn attachment_names_stay_local() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"clusters.zip\"").as_deref(),
            Some("clusters.zip")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=\"../../etc/passwd\"").as_deref(),
            Some("passwd")
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn cli_parses_submit_flags() {
        let cli = Cli::try_parse_from([
            "client",
            "--url",
            "http://orq:9000",
            "submit",
            "yeast.el",
            "--graphlet-size",
            "5",
            "--density",
            "0.3",
        ])
        .unwrap();
        assert_eq!(cli.url, "http://orq:9000");
        match cli.command {
            Commands::Submit {
                file,
                graphlet_size,
                density,
                overlap,
            } => {
                assert_eq!(file, PathBuf::from("yeast.el"));
                assert_eq!(graphlet_size, 5);
                assert_eq!(density, 0.3);
                assert_eq!(overlap, 0.2);
            }
            _ => panic!("se esperaba submit"),
        }
    }
}
