use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{
    CapacityRequest, GridExtents, JobSummary, ProfileParameters, RegionalAnalysisStatus,
    RegionalJobRequest, SinglePointRequest, SinglePointResponse, SurfaceFormat,
    TravelTimeSurfaceTask, WorkerCategory, WorkerObservation, WorkerTags,
};
use reqwest::{Client, StatusCode};
use std::env;
use std::path::PathBuf;

/// - Local: default http://localhost:7070
/// - En otra máquina: BROKER_URL=http://broker:7070
fn broker_base_url() -> String {
    env::var("BROKER_URL").unwrap_or_else(|_| "http://localhost:7070".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar análisis regionales al broker y consultarlos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un análisis regional nuevo
    Submit(SubmitArgs),
    /// Lista los jobs activos (la última fila es la suma)
    Jobs,
    /// Progreso de un job según el ensamblador
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Borra un job; los resultados que sigan llegando se descartan
    Delete {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los workers vistos en los últimos minutos
    Workers,
    /// Pide capacidad a mano para una categoría
    Capacity {
        #[command(flatten)]
        category: CategoryArgs,
        #[arg(long, default_value_t = 0)]
        on_demand: i32,
        #[arg(long, default_value_t = 0)]
        spot: i32,
    },
    /// Pide la dirección de un worker para un cálculo single-point
    Single {
        #[command(flatten)]
        category: CategoryArgs,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Descarga un resultado terminado (gzip)
    Result {
        #[arg(value_name = "JOB_ID")]
        id: String,
        /// Con --cutoff baja la grilla de accesibilidad; sin ambos, la matriz de tiempos
        #[arg(long)]
        percentile: Option<u32>,
        #[arg(long)]
        cutoff: Option<u32>,
        #[arg(long, short)]
        output: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct CategoryArgs {
    /// Id de la red de transporte
    #[arg(long)]
    graph: String,
    #[arg(long = "worker-version", default_value = "v5.0")]
    worker_version: String,
}

impl CategoryArgs {
    fn category(&self) -> WorkerCategory {
        WorkerCategory::new(self.graph.clone(), self.worker_version.clone())
    }
}

#[derive(Args, Debug, Clone)]
struct SubmitArgs {
    #[command(flatten)]
    category: CategoryArgs,
    #[arg(long, default_value_t = 9)]
    zoom: u32,
    #[arg(long, allow_hyphen_values = true)]
    west: i64,
    #[arg(long, allow_hyphen_values = true)]
    north: i64,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    /// Se puede repetir: --percentile 25 --percentile 50
    #[arg(long = "percentile", default_values_t = vec![50])]
    percentiles: Vec<u32>,
    /// Con al menos un cutoff se calculan grillas de accesibilidad
    #[arg(long = "cutoff")]
    cutoffs: Vec<u32>,
    /// Con destinos > 0 se guarda la matriz de tiempos de viaje
    #[arg(long, default_value_t = 0)]
    destinations: u32,
    #[arg(long, default_value = "")]
    project: String,
    #[arg(long, default_value = "")]
    user: String,
}

fn build_job_request(args: &SubmitArgs) -> RegionalJobRequest {
    RegionalJobRequest {
        graph_id: args.category.graph.clone(),
        worker_version: args.category.worker_version.clone(),
        extents: GridExtents {
            zoom: args.zoom,
            west: args.west,
            north: args.north,
            width: args.width,
            height: args.height,
        },
        percentiles: args.percentiles.clone(),
        cutoffs_minutes: args.cutoffs.clone(),
        destination_point_set_keys: Vec::new(),
        n_destinations: args.destinations,
        record_access: !args.cutoffs.is_empty(),
        record_times: args.destinations > 0,
        profile: ProfileParameters::default(),
        tags: WorkerTags {
            project_id: args.project.clone(),
            created_by: args.user.clone(),
            ..WorkerTags::default()
        },
    }
}

/// Cuerpo de error del broker: `{"message": ...}`.
async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<serde_json::Value>().await {
        Ok(body) => body["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = broker_base_url();

    match cli.command {
        Commands::Submit(args) => {
            let url = format!("{}/api/jobs", base_url);
            let resp = client.post(&url).json(&build_job_request(&args)).send().await?;
            if !resp.status().is_success() {
                bail!("el broker rechazó el job: {}", error_message(resp).await);
            }
            let summary: JobSummary = resp.json().await?;

            println!("Job creado:");
            println!("  id: {}", summary.job_id);
            println!("  red: {} ({})", summary.graph_id, summary.worker_version);
            println!("  tareas: {}", summary.n_tasks_total);
        }
        Commands::Jobs => {
            let url = format!("{}/api/jobs", base_url);
            let jobs: Vec<JobSummary> = client.get(&url).send().await?.json().await?;
            println!(
                "{:<34} {:>8} {:>8} {:>9} {:>6}",
                "JOB", "TOTAL", "HECHAS", "ENTREG.", "PASADA"
            );
            for job in jobs {
                println!(
                    "{:<34} {:>8} {:>8} {:>9} {:>6}{}",
                    job.job_id,
                    job.n_tasks_total,
                    job.n_tasks_completed,
                    job.n_tasks_delivered,
                    job.delivery_pass,
                    if job.stalled { "  TRABADO" } else { "" }
                );
            }
        }
        Commands::Status { id } => {
            let url = format!("{}/api/jobs/{id}", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let status: RegionalAnalysisStatus = resp.json().await?;
                println!("Job {id}: {} de {} orígenes", status.complete, status.total);
            } else {
                println!("No se encontró el job con id {id}");
            }
        }
        Commands::Delete { id } => {
            let url = format!("{}/api/jobs/{id}", base_url);
            let resp = client.delete(&url).send().await?;
            if resp.status().is_success() {
                println!("Job {id} borrado");
            } else {
                println!("No se encontró el job con id {id}");
            }
        }
        Commands::Workers => {
            let url = format!("{}/api/workers", base_url);
            let workers: Vec<WorkerObservation> = client.get(&url).send().await?.json().await?;
            if workers.is_empty() {
                println!("No hay workers activos");
            }
            for w in workers {
                println!(
                    "{}  {}  {}  cpus={}  visto {}",
                    w.worker_id,
                    w.category,
                    w.ip_address,
                    w.processors,
                    w.last_seen.format("%H:%M:%S")
                );
            }
        }
        Commands::Capacity {
            category,
            on_demand,
            spot,
        } => {
            let url = format!("{}/api/capacity", base_url);
            let req = CapacityRequest {
                category: category.category(),
                tags: WorkerTags::default(),
                n_on_demand: on_demand,
                n_spot: spot,
            };
            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                bail!("pedido rechazado: {}", error_message(resp).await);
            }
            let outcome: serde_json::Value = resp.json().await?;
            println!("Pedido de capacidad: {}", outcome);
        }
        Commands::Single { category, lat, lon } => {
            let url = format!("{}/api/single", base_url);
            let req = SinglePointRequest {
                tags: WorkerTags::default(),
                task: TravelTimeSurfaceTask {
                    graph_id: category.graph.clone(),
                    worker_version: category.worker_version.clone(),
                    extents: GridExtents {
                        zoom: 9,
                        west: 0,
                        north: 0,
                        width: 0,
                        height: 0,
                    },
                    from_lat: lat,
                    from_lon: lon,
                    percentiles: vec![50],
                    format: SurfaceFormat::Grid,
                    profile: ProfileParameters::default(),
                },
            };
            let resp = client.post(&url).json(&req).send().await?;
            match resp.status() {
                StatusCode::OK => {
                    let worker: SinglePointResponse = resp.json().await?;
                    println!("Worker listo en {} ({})", worker.address, worker.url);
                }
                StatusCode::ACCEPTED => {
                    let retry = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("30")
                        .to_string();
                    println!("Arrancando un worker, reintentar en {} s", retry);
                }
                _ => bail!("el broker respondió: {}", error_message(resp).await),
            }
        }
        Commands::Result {
            id,
            percentile,
            cutoff,
            output,
        } => {
            let mut url = format!("{}/api/results/{id}", base_url);
            match (percentile, cutoff) {
                (Some(p), Some(c)) => url.push_str(&format!("?percentile={p}&cutoff={c}")),
                (None, None) => {}
                _ => bail!("--percentile y --cutoff van juntos"),
            }
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!("no se pudo bajar el resultado: {}", error_message(resp).await);
            }
            let bytes = resp.bytes().await?;
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("no se pudo escribir {}", output.display()))?;
            println!("{} bytes guardados en {}", bytes.len(), output.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_arma_el_pedido_desde_los_argumentos() {
        let cli = Cli::try_parse_from([
            "client", "submit", "--graph", "net-1", "--west", "-10", "--north", "20", "--width",
            "4", "--height", "3", "--percentile", "25", "--percentile", "75", "--cutoff", "45",
            "--project", "p-1",
        ])
        .unwrap();

        let Commands::Submit(args) = cli.command else {
            panic!("se esperaba submit");
        };
        let req = build_job_request(&args);
        assert_eq!(req.graph_id, "net-1");
        assert_eq!(req.worker_version, "v5.0");
        assert_eq!(req.extents.west, -10);
        assert_eq!(req.extents.width * req.extents.height, 12);
        assert_eq!(req.percentiles, vec![25, 75]);
        assert!(req.record_access);
        assert!(!req.record_times);
        assert_eq!(req.tags.project_id, "p-1");
    }

    #[test]
    fn submit_sin_percentiles_usa_la_mediana() {
        let cli = Cli::try_parse_from([
            "client", "submit", "--graph", "g", "--west", "0", "--north", "0", "--width", "1",
            "--height", "1", "--destinations", "10",
        ])
        .unwrap();
        let Commands::Submit(args) = cli.command else {
            panic!("se esperaba submit");
        };
        let req = build_job_request(&args);
        assert_eq!(req.percentiles, vec![50]);
        assert!(req.record_times);
        assert_eq!(req.n_destinations, 10);
    }
}
