use anyhow::{bail, Context, Result};
use common::{
    AnalysisWorkerTask, RegionalTask, RegionalWorkResult, WorkerCategory, WorkerStatus,
    UNKNOWN_WORKER_VERSION,
};
use reqwest::{Client, StatusCode};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};
use std::{env, sync::Arc, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const DEFAULT_POLL_SECS: u64 = 10;

/// Destinos sintéticos cuando el job solo pide accesibilidad.
const SYNTHETIC_DESTINATIONS: u32 = 100;

/// Tiempo de viaje máximo que inventa el worker, en minutos.
const MAX_SYNTHETIC_MINUTES: u64 = 120;

/// Configuración del worker, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker_url: String,
    pub worker_id: String,
    pub category: WorkerCategory,
    pub ip_address: String,
    pub poll_interval: Duration,
    /// Porcentaje de resultados que se tiran a propósito para ejercitar las re-entregas.
    pub drop_percent: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let poll_secs = match env::var("WORKER_POLL_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("WORKER_POLL_SECS inválido: {:?}", raw))?,
            Err(_) => DEFAULT_POLL_SECS,
        };
        let drop_percent = match env::var("WORKER_DROP_PERCENT") {
            Ok(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("WORKER_DROP_PERCENT inválido: {:?}", raw))?,
            Err(_) => 0,
        };
        if drop_percent > 100 {
            bail!("WORKER_DROP_PERCENT tiene que estar entre 0 y 100, llegó {}", drop_percent);
        }

        Ok(Self {
            broker_url: env::var("BROKER_URL").unwrap_or_else(|_| "http://localhost:7070".to_string()),
            worker_id: env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("{}-{}", hostname, std::process::id())),
            category: WorkerCategory::new(
                env::var("WORKER_GRAPH_ID").unwrap_or_default(),
                env::var("WORKER_VERSION").unwrap_or_else(|_| UNKNOWN_WORKER_VERSION.to_string()),
            ),
            ip_address: env::var("WORKER_IP").unwrap_or_else(|_| {
                if hostname.is_empty() {
                    "localhost".to_string()
                } else {
                    hostname.clone()
                }
            }),
            poll_interval: Duration::from_secs(poll_secs.max(1)),
            drop_percent,
        })
    }
}

fn hash_of<T: Hash>(value: T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Resultado sintético y determinístico de una tarea, con las dimensiones
/// que pide su template. El motor de ruteo real no forma parte de este repo.
pub fn compute_result(task: &RegionalTask) -> RegionalWorkResult {
    let template = &task.template;
    let n_destinations = if template.n_destinations > 0 {
        template.n_destinations
    } else {
        SYNTHETIC_DESTINATIONS
    };

    // [percentil][destino], no decreciente en el percentil como un cálculo real
    let times: Vec<Vec<i32>> = template
        .percentiles
        .iter()
        .enumerate()
        .map(|(p_index, _)| {
            (0..n_destinations)
                .map(|d| {
                    let base = hash_of((&template.job_id, task.task_id, d)) % MAX_SYNTHETIC_MINUTES;
                    (base + p_index as u64).min(MAX_SYNTHETIC_MINUTES) as i32
                })
                .collect()
        })
        .collect();

    let mut result = RegionalWorkResult::new(template.job_id.clone(), task.task_id);
    if template.record_access {
        let access = times
            .iter()
            .map(|row| {
                template
                    .cutoffs_minutes
                    .iter()
                    .map(|cutoff| row.iter().filter(|t| **t <= *cutoff as i32).count() as i32)
                    .collect()
            })
            .collect();
        result = result.with_accessibility(access);
    }
    if template.record_times {
        result = result.with_travel_times(times);
    }
    result
}

/// Decide si tirar un resultado. `salt` cambia en cada intento, así una
/// tarea tirada puede salir bien en la re-entrega.
pub fn should_drop(result: &RegionalWorkResult, drop_percent: u32, salt: u64) -> bool {
    if drop_percent == 0 {
        return false;
    }
    hash_of((&result.job_id, result.task_id, salt)) % 100 < drop_percent as u64
}

fn salt() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Loop principal del worker.
/// - Cada poll manda quién es, sus métricas y los resultados pendientes.
/// - Si el broker no contesta, los resultados se guardan para el próximo poll.
/// - Las tareas recibidas se calculan en paralelo, hasta un hilo por CPU.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let client = Client::new();
    let poll_url = format!("{}/internal/poll", config.broker_url);

    let mut sys = System::new_all();
    sys.refresh_cpu();
    let processors = sys.cpus().len().max(1);
    let sem = Arc::new(Semaphore::new(processors));

    info!(
        "worker {} ({}) haciendo poll a {} cada {:?}",
        config.worker_id, config.category, poll_url, config.poll_interval
    );
    if config.drop_percent > 0 {
        warn!("se van a tirar el {}% de los resultados", config.drop_percent);
    }

    let mut pending: Vec<RegionalWorkResult> = Vec::new();

    loop {
        // --------- Métricas de la máquina ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let status = WorkerStatus {
            worker_id: config.worker_id.clone(),
            category: config.category.clone(),
            networks: if config.category.graph_id.is_empty() {
                Vec::new()
            } else {
                vec![config.category.graph_id.clone()]
            },
            ip_address: config.ip_address.clone(),
            processors: processors as u32,
            load_percent: Some(sys.global_cpu_info().cpu_usage()),
            // sysinfo 0.29 devuelve bytes
            memory_total_bytes: sys.total_memory(),
            memory_free_bytes: sys.available_memory(),
            results: pending.clone(),
        };

        let response = match client.post(&poll_url).json(&status).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "no se pudo contactar al broker ({}), {} resultados quedan pendientes",
                    e,
                    pending.len()
                );
                sleep(config.poll_interval).await;
                continue;
            }
        };

        if !response.status().is_success() {
            warn!("el broker respondió {} al poll", response.status());
            sleep(config.poll_interval).await;
            continue;
        }
        // el broker ya recibió los resultados
        pending.clear();

        if response.status() == StatusCode::NO_CONTENT {
            debug!("no hay tareas, esperando {:?}", config.poll_interval);
            sleep(config.poll_interval).await;
            continue;
        }

        let tasks: Vec<AnalysisWorkerTask> = match response.json().await {
            Ok(t) => t,
            Err(e) => {
                warn!("respuesta de poll ilegible: {}", e);
                sleep(config.poll_interval).await;
                continue;
            }
        };
        info!("recibí {} tareas", tasks.len());

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let task = match task {
                AnalysisWorkerTask::RegionalAnalysis(t) => t,
                AnalysisWorkerTask::TravelTimeSurface(t) => {
                    warn!("tarea single-point para {} llegó por la cola, se ignora", t.category());
                    continue;
                }
            };
            let permit = sem.clone().acquire_owned().await?;
            handles.push(tokio::task::spawn_blocking(move || {
                let result = compute_result(&task);
                drop(permit);
                result
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(result) => {
                    if should_drop(&result, config.drop_percent, salt()) {
                        debug!("tirando resultado {} / {}", result.job_id, result.task_id);
                        continue;
                    }
                    pending.push(result);
                }
                Err(e) => warn!("panic o join error calculando una tarea: {:?}", e),
            }
        }
        // sin espera: se devuelven los resultados y se piden más enseguida
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{GridExtents, ProfileParameters, RegionalTemplate};

    fn template(record_access: bool, record_times: bool) -> RegionalTemplate {
        RegionalTemplate {
            job_id: "job-1".to_string(),
            graph_id: "net-1".to_string(),
            worker_version: "v5.0".to_string(),
            extents: GridExtents {
                zoom: 9,
                west: 0,
                north: 0,
                width: 3,
                height: 3,
            },
            percentiles: vec![25, 50, 75],
            cutoffs_minutes: vec![30, 60],
            destination_point_set_keys: vec![],
            n_destinations: 4,
            record_access,
            record_times,
            profile: ProfileParameters::default(),
        }
    }

    #[test]
    fn resultado_tiene_las_dimensiones_del_template() {
        let task = template(true, true).make_task(5);
        let result = compute_result(&task);
        assert_eq!(result.task_id, 5);

        let times = result.travel_times.unwrap();
        assert_eq!(times.len(), 3);
        assert!(times.iter().all(|row| row.len() == 4));

        let access = result.accessibility_values.unwrap();
        assert_eq!(access.len(), 3);
        assert!(access.iter().all(|row| row.len() == 2));
        // más minutos nunca llegan a menos destinos
        assert!(access.iter().all(|row| row[0] <= row[1]));
    }

    #[test]
    fn resultado_es_deterministico_y_solo_lo_pedido() {
        let task = template(false, true).make_task(2);
        assert_eq!(compute_result(&task), compute_result(&task));
        assert!(compute_result(&task).accessibility_values.is_none());

        let task = template(true, false).make_task(2);
        assert!(compute_result(&task).travel_times.is_none());
    }

    #[test]
    fn drop_percent_en_los_extremos() {
        let result = RegionalWorkResult::new("job-1", 7);
        assert!((0..50).all(|salt| !should_drop(&result, 0, salt)));
        assert!((0..50).all(|salt| should_drop(&result, 100, salt)));
    }
}
