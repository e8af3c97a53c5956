use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::WorkerTags;
use crate::results::RegionalWorkResult;
use crate::task::TravelTimeSurfaceTask;

pub type WorkerId = String;

/// Versión que reportan los workers locales que no saben qué build corren.
pub const UNKNOWN_WORKER_VERSION: &str = "UNKNOWN";

/// Red (graph) + versión del software del worker.
///
/// Jobs, workers y peticiones single-point se agrupan por esta clave:
/// un worker solo puede procesar tareas de su misma categoría.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerCategory {
    pub graph_id: String,
    pub worker_version: String,
}

impl WorkerCategory {
    pub fn new(graph_id: impl Into<String>, worker_version: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            worker_version: worker_version.into(),
        }
    }

    /// Un worker sin red cargada o sin versión conocida acepta tareas de cualquier job.
    pub fn is_unspecified(&self) -> bool {
        self.graph_id.is_empty() || self.worker_version.eq_ignore_ascii_case(UNKNOWN_WORKER_VERSION)
    }
}

impl fmt::Display for WorkerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.graph_id, self.worker_version)
    }
}

/// Lo que el worker manda en cada poll: quién es, qué tiene cargado
/// y los resultados de las tareas que terminó desde el poll anterior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub category: WorkerCategory,
    #[serde(default)]
    pub networks: Vec<String>,
    pub ip_address: String,

    // Métricas de la máquina
    #[serde(default)]
    pub processors: u32,
    #[serde(default)]
    pub load_percent: Option<f32>,
    #[serde(default)]
    pub memory_total_bytes: u64,
    #[serde(default)]
    pub memory_free_bytes: u64,

    #[serde(default)]
    pub results: Vec<RegionalWorkResult>,
}

/// Última vez que vimos a un worker. Se reconstruye en cada poll, no se persiste.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerObservation {
    pub worker_id: WorkerId,
    pub category: WorkerCategory,
    pub ip_address: String,
    pub networks: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub processors: u32,
    pub load_percent: Option<f32>,
    pub memory_total_bytes: u64,
    pub memory_free_bytes: u64,
}

impl WorkerObservation {
    /// Copia todo menos los resultados, que no deben quedar visibles en el listado de workers.
    pub fn from_status(status: &WorkerStatus, seen_at: DateTime<Utc>) -> Self {
        Self {
            worker_id: status.worker_id.clone(),
            category: status.category.clone(),
            ip_address: status.ip_address.clone(),
            networks: status.networks.clone(),
            last_seen: seen_at,
            processors: status.processors,
            load_percent: status.load_percent,
            memory_total_bytes: status.memory_total_bytes,
            memory_free_bytes: status.memory_free_bytes,
        }
    }
}

/// Pedido manual de capacidad. Los conteos son con signo para poder rechazar negativos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRequest {
    pub category: WorkerCategory,
    #[serde(default)]
    pub tags: WorkerTags,
    pub n_on_demand: i32,
    pub n_spot: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinglePointRequest {
    #[serde(default)]
    pub tags: WorkerTags,
    pub task: TravelTimeSurfaceTask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinglePointResponse {
    pub address: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreachableWorkerReport {
    pub category: WorkerCategory,
}
