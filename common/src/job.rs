use serde::{Deserialize, Serialize};

use crate::task::{GridExtents, ProfileParameters, RegionalTemplate};

pub type JobId = String;

/// Id fresco para cada envío: UUID sin guiones.
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().simple().to_string()
}

/// El id termina en nombres de archivo: no puede salir del directorio.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && !id.contains("..")
}

/// Etiquetas que solo sirven para clasificar workers (costos, consola del proveedor).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerTags {
    pub access_group: String,
    pub created_by: String,
    pub project_id: String,
    pub region_id: String,
}

/// Pedido de análisis regional tal como lo manda el cliente.
/// El broker le asigna el id y lo convierte en template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionalJobRequest {
    pub graph_id: String,
    pub worker_version: String,
    pub extents: GridExtents,
    pub percentiles: Vec<u32>,
    #[serde(default)]
    pub cutoffs_minutes: Vec<u32>,
    #[serde(default)]
    pub destination_point_set_keys: Vec<String>,
    #[serde(default)]
    pub n_destinations: u32,
    #[serde(default)]
    pub record_access: bool,
    #[serde(default)]
    pub record_times: bool,
    #[serde(default)]
    pub profile: ProfileParameters,
    #[serde(default)]
    pub tags: WorkerTags,
}

impl RegionalJobRequest {
    pub fn into_template(self, job_id: JobId) -> (RegionalTemplate, WorkerTags) {
        let template = RegionalTemplate {
            job_id,
            graph_id: self.graph_id,
            worker_version: self.worker_version,
            extents: self.extents,
            percentiles: self.percentiles,
            cutoffs_minutes: self.cutoffs_minutes,
            destination_point_set_keys: self.destination_point_set_keys,
            n_destinations: self.n_destinations,
            record_access: self.record_access,
            record_times: self.record_times,
            profile: self.profile,
        };
        (template, self.tags)
    }
}

/// Resumen de un job para el panel de administración.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub graph_id: String,
    pub worker_version: String,
    pub n_tasks_total: usize,
    pub n_tasks_completed: usize,
    pub n_tasks_delivered: usize,
    pub delivery_pass: u32,
    /// Se agotaron las pasadas de re-entrega y faltan tareas: el job no va a terminar solo.
    pub stalled: bool,
    #[serde(default)]
    pub tags: WorkerTags,
}

impl JobSummary {
    pub const AGGREGATE_ID: &'static str = "SUM";

    /// Fila extra con la suma de todos los jobs.
    pub fn aggregate(summaries: &[JobSummary]) -> JobSummary {
        let mut sum = JobSummary {
            job_id: Self::AGGREGATE_ID.to_string(),
            graph_id: String::new(),
            worker_version: String::new(),
            n_tasks_total: 0,
            n_tasks_completed: 0,
            n_tasks_delivered: 0,
            delivery_pass: 0,
            stalled: false,
            tags: WorkerTags::default(),
        };
        for s in summaries {
            sum.n_tasks_total += s.n_tasks_total;
            sum.n_tasks_completed += s.n_tasks_completed;
            sum.n_tasks_delivered += s.n_tasks_delivered;
            sum.delivery_pass = sum.delivery_pass.max(s.delivery_pass);
            sum.stalled |= s.stalled;
        }
        sum
    }

    pub fn is_complete(&self) -> bool {
        self.n_tasks_completed == self.n_tasks_total
    }
}

/// Progreso de un job visto desde el ensamblador de resultados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionalAnalysisStatus {
    pub total: usize,
    pub complete: usize,
}
