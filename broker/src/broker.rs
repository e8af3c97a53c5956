//! Cola de trabajo de los análisis regionales.
//!
//! El broker guarda los jobs agrupados por categoría, reparte tareas a los
//! workers que hacen poll y pasa los resultados al ensamblador de cada job.
//! Todo vive en memoria: si el proceso se reinicia hay que volver a enviar
//! los análisis que no terminaron.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use common::{
    is_valid_job_id, JobId, JobSummary, RegionalAnalysisStatus, RegionalTask, RegionalTemplate,
    RegionalWorkResult, TaskId, WorkerCategory, WorkerId, WorkerObservation, WorkerStatus,
    WorkerTags,
};

use crate::assembler::{access_grid_key, travel_time_key, ResultAssembler};
use crate::catalog::WorkerCatalog;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::job::Job;
use crate::scaler::FleetScaler;
use crate::storage::{FileStorage, FileStorageKey};

/// Máximo de tareas que se entregan en un poll.
pub const MAX_TASKS_PER_WORKER: usize = 16;

/// Cuando llega el resultado de esta tarea el job ya está andando y se
/// evalúa si conviene sumar máquinas spot.
pub const AUTO_START_SPOT_INSTANCES_AT_TASK: TaskId = 42;

/// Tareas por worker que se buscan al dimensionar la flota spot.
pub const TARGET_TASKS_PER_WORKER: usize = 800;

/// Después de pedir workers para una categoría no se vuelve a pedir durante este tiempo.
pub const WORKER_STARTUP_TIME_SECS: i64 = 60 * 60;

/// Qué pasó con un resultado reportado por un worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    /// Job desconocido (por ejemplo, borrado) o resultado inutilizable.
    Discarded,
    /// La tarea ya estaba completada.
    Duplicate,
    Accepted,
    /// Era la última tarea: el job salió de la tabla y se subieron los resultados.
    JobCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityOutcome {
    Requested,
    /// Ya se pidieron workers para esta categoría hace poco.
    Debounced,
    Offline,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// Dentro de cada categoría, en orden de llegada.
    jobs: BTreeMap<WorkerCategory, Vec<Job>>,
    assemblers: HashMap<JobId, Arc<ResultAssembler>>,
    /// Cuándo se pidieron workers por última vez para cada categoría.
    recently_requested: HashMap<WorkerCategory, DateTime<Utc>>,
}

impl BrokerState {
    fn find_job(&self, job_id: &str) -> Option<&Job> {
        self.jobs
            .values()
            .flat_map(|list| list.iter())
            .find(|job| job.job_id == job_id)
    }

    fn find_job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|job| job.job_id == job_id)
    }

    fn remove_job(&mut self, job_id: &str) -> Option<Job> {
        let category = self
            .jobs
            .iter()
            .find(|(_, list)| list.iter().any(|job| job.job_id == job_id))
            .map(|(category, _)| category.clone())?;
        let list = self.jobs.get_mut(&category)?;
        let position = list.iter().position(|job| job.job_id == job_id)?;
        let job = list.remove(position);
        if list.is_empty() {
            self.jobs.remove(&category);
        }
        Some(job)
    }
}

fn first_with_work<'a>(
    mut jobs: impl Iterator<Item = &'a mut Job>,
    now: DateTime<Utc>,
) -> Option<&'a mut Job> {
    jobs.find_map(|job| if job.has_tasks_to_deliver(now) { Some(job) } else { None })
}

/// Coordinador único del proceso. Se construye en `main` y se comparte
/// detrás de un `Arc`.
///
/// Cada operación toma el lock de la tabla de jobs durante toda su parte
/// en memoria. El catálogo de workers y cada ensamblador tienen su propio
/// lock; la escritura de resultados y la subida se hacen sin el lock del broker.
pub struct Broker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    catalog: WorkerCatalog,
    scaler: FleetScaler,
    storage: Arc<dyn FileStorage>,
}

impl Broker {
    pub fn new(config: BrokerConfig, scaler: FleetScaler, storage: Arc<dyn FileStorage>) -> Self {
        Self {
            config,
            state: Mutex::new(BrokerState::default()),
            catalog: WorkerCatalog::new(),
            scaler,
            storage,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue_job(
        &self,
        template: RegionalTemplate,
        tags: WorkerTags,
    ) -> Result<JobSummary, BrokerError> {
        self.enqueue_job_at(template, tags, Utc::now())
    }

    /// Registra un job nuevo con su ensamblador. Un id repetido es un error
    /// del que llama: los ids se generan frescos en cada envío.
    pub fn enqueue_job_at(
        &self,
        template: RegionalTemplate,
        tags: WorkerTags,
        now: DateTime<Utc>,
    ) -> Result<JobSummary, BrokerError> {
        template.validate().map_err(BrokerError::InvalidRequest)?;
        info!("encolando tareas del job {}", template.job_id);

        let assembler = self.reserve_job(&template)?;
        if let Err(e) = assembler.prepare() {
            self.lock().assemblers.remove(&template.job_id);
            return Err(e.into());
        }
        self.admit_job(template, tags, assembler, now)
    }

    /// Reserva el id con un ensamblador todavía sin preparar. Los archivos
    /// se crean después, sin el lock de la tabla.
    fn reserve_job(&self, template: &RegionalTemplate) -> Result<Arc<ResultAssembler>, BrokerError> {
        let job_id = &template.job_id;
        let mut state = self.lock();
        if state.assemblers.contains_key(job_id) || state.find_job(job_id).is_some() {
            error!("alguien intentó encolar el job {} pero ya existe", job_id);
            return Err(BrokerError::DuplicateJob(job_id.clone()));
        }
        let assembler = Arc::new(ResultAssembler::new(
            template,
            self.config.scratch_dir.join(job_id),
            self.config.results_bucket.clone(),
            self.storage.clone(),
        ));
        state.assemblers.insert(job_id.clone(), assembler.clone());
        Ok(assembler)
    }

    /// Pone el job en la cola si su reserva sigue en pie; un delete pudo
    /// llevársela mientras se preparaban los archivos.
    fn admit_job(
        &self,
        template: RegionalTemplate,
        tags: WorkerTags,
        assembler: Arc<ResultAssembler>,
        now: DateTime<Utc>,
    ) -> Result<JobSummary, BrokerError> {
        let job_id = template.job_id.clone();
        let mut state = self.lock();
        let reserved = state
            .assemblers
            .get(&job_id)
            .is_some_and(|current| Arc::ptr_eq(current, &assembler));
        if !reserved {
            drop(state);
            warn!("job {} borrado antes de terminar de encolarse", job_id);
            assembler.terminate();
            return Err(BrokerError::UnknownJob(job_id));
        }

        let job = Job::new(template, tags.clone());
        let category = job.category.clone();
        let summary = job.summary();
        info!(
            "job {}: {} tareas en {}",
            job_id,
            job.n_tasks_total(),
            category
        );
        state.jobs.entry(category.clone()).or_default().push(job);

        if self.catalog.is_empty(&category, false, now) {
            if let Err(e) =
                self.request_capacity_locked(&mut state, &category, &tags, 1, 0, true, now)
            {
                error!("job {} encolado pero no se pudieron pedir workers: {}", job_id, e);
            }
        } else {
            state.recently_requested.remove(&category);
        }
        Ok(summary)
    }

    pub fn poll_for_work(&self, category: &WorkerCategory) -> Vec<RegionalTask> {
        self.poll_for_work_at(category, Utc::now())
    }

    /// Hasta `MAX_TASKS_PER_WORKER` tareas del primer job con trabajo.
    /// En modo offline, o para un worker sin categoría definida, sirve
    /// cualquier job. Vacío significa que el worker duerma y vuelva a probar.
    pub fn poll_for_work_at(&self, category: &WorkerCategory, now: DateTime<Utc>) -> Vec<RegionalTask> {
        let shared_queue = self.config.offline || category.is_unspecified();
        let mut state = self.lock();

        let job = if shared_queue {
            first_with_work(state.jobs.values_mut().flat_map(|list| list.iter_mut()), now)
        } else {
            match state.jobs.get_mut(category) {
                Some(list) => first_with_work(list.iter_mut(), now),
                None => None,
            }
        };

        match job {
            Some(job) => {
                let batch = job.generate_batch(MAX_TASKS_PER_WORKER, now);
                debug!("entregando {} tareas del job {} a {}", batch.len(), job.job_id, category);
                batch
            }
            None => Vec::new(),
        }
    }

    pub fn record_worker(&self, status: &WorkerStatus) {
        self.record_worker_at(status, Utc::now())
    }

    pub fn record_worker_at(&self, status: &WorkerStatus, now: DateTime<Utc>) {
        self.catalog.record(WorkerObservation::from_status(status, now));
    }

    pub fn report_result(&self, result: &RegionalWorkResult) -> ResultOutcome {
        self.report_result_at(result, Utc::now())
    }

    /// Primero el ensamblador escribe el resultado, después se marca la
    /// tarea. Así, cuando el job queda completo, el ensamblador ya vio todos
    /// los resultados que pudieron completarlo.
    pub fn report_result_at(&self, result: &RegionalWorkResult, now: DateTime<Utc>) -> ResultOutcome {
        let assembler = self.lock().assemblers.get(&result.job_id).cloned();
        let Some(assembler) = assembler else {
            error!(
                "resultado de la tarea {} para el job {} que no existe, se descarta",
                result.task_id, result.job_id
            );
            return ResultOutcome::Discarded;
        };

        if let Err(e) = assembler.handle_result(result) {
            error!(
                "job {}: no se pudo ensamblar el resultado de la tarea {}: {}",
                result.job_id, result.task_id, e
            );
            return ResultOutcome::Discarded;
        }

        let mut state = self.lock();
        let Some(job) = state.find_job_mut(&result.job_id) else {
            error!(
                "job {} borrado mientras llegaba el resultado de la tarea {}",
                result.job_id, result.task_id
            );
            return ResultOutcome::Discarded;
        };

        if !job.mark_completed(result.task_id) {
            error!(
                "no se pudo marcar completada la tarea {} del job {}",
                result.task_id, result.job_id
            );
            return ResultOutcome::Duplicate;
        }

        let category = job.category.clone();
        let tags = job.tags.clone();
        let n_tasks_total = job.n_tasks_total();
        let complete = job.is_complete();
        if complete {
            job.verify_complete();
        }

        self.consider_scaling_up(&mut state, result.task_id, &category, &tags, n_tasks_total, now);

        if !complete {
            return ResultOutcome::Accepted;
        }

        state.remove_job(&result.job_id);
        let assembler = state.assemblers.remove(&result.job_id);
        drop(state);

        info!("job {} completo, subiendo resultados", result.job_id);
        if let Some(assembler) = assembler {
            if let Err(e) = assembler.finish() {
                error!("job {}: no se pudieron subir los resultados: {}", result.job_id, e);
            }
        }
        ResultOutcome::JobCompleted
    }

    /// Heurística de escalado: cuando llega cierta tarea temprana el job es
    /// real y avanza, así que se dimensiona la flota spot según su tamaño.
    /// Pasa una sola vez por job, así que no espera a que venza el pedido
    /// on-demand hecho al encolarlo.
    fn consider_scaling_up(
        &self,
        state: &mut BrokerState,
        task_id: TaskId,
        category: &WorkerCategory,
        tags: &WorkerTags,
        n_tasks_total: usize,
        now: DateTime<Utc>,
    ) {
        if self.config.offline || task_id != AUTO_START_SPOT_INSTANCES_AT_TASK {
            return;
        }
        let target = (n_tasks_total / TARGET_TASKS_PER_WORKER).min(self.config.max_workers);
        let running = self.catalog.count_in_category(category, now);
        if target <= running {
            return;
        }
        let n_spot = target - running;
        info!(
            "{} tareas en {}: {} workers corriendo, pidiendo {} spot",
            n_tasks_total, category, running, n_spot
        );
        if let Err(e) = self.request_capacity_locked(state, category, tags, 0, n_spot, false, now) {
            warn!("no se pudieron pedir workers spot para {}: {}", category, e);
        }
    }

    /// Saca el job de la tabla y descarta sus archivos temporales. Los
    /// workers que estén calculando tareas suyas no se enteran: sus
    /// resultados se descartan al llegar.
    pub fn delete_job(&self, job_id: &str) -> bool {
        let (job, assembler) = {
            let mut state = self.lock();
            (state.remove_job(job_id), state.assemblers.remove(job_id))
        };
        // un job a medio encolar solo tiene la reserva del ensamblador
        let found = job.is_some() || assembler.is_some();
        if let Some(assembler) = assembler {
            assembler.terminate();
        }
        if found {
            info!("job {} borrado", job_id);
        } else {
            warn!("se pidió borrar el job {} que no existe", job_id);
        }
        found
    }

    pub fn request_capacity(
        &self,
        category: &WorkerCategory,
        tags: &WorkerTags,
        n_on_demand: i32,
        n_spot: i32,
    ) -> Result<CapacityOutcome, BrokerError> {
        self.request_capacity_at(category, tags, n_on_demand, n_spot, Utc::now())
    }

    pub fn request_capacity_at(
        &self,
        category: &WorkerCategory,
        tags: &WorkerTags,
        n_on_demand: i32,
        n_spot: i32,
        now: DateTime<Utc>,
    ) -> Result<CapacityOutcome, BrokerError> {
        if n_on_demand < 0 || n_spot < 0 {
            error!(
                "pedido de workers negativo para {}: {} on-demand, {} spot",
                category, n_on_demand, n_spot
            );
            return Err(BrokerError::NegativeCapacity { n_on_demand, n_spot });
        }
        let mut state = self.lock();
        self.request_capacity_locked(
            &mut state,
            category,
            tags,
            n_on_demand as usize,
            n_spot as usize,
            true,
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn request_capacity_locked(
        &self,
        state: &mut BrokerState,
        category: &WorkerCategory,
        tags: &WorkerTags,
        n_on_demand: usize,
        n_spot: usize,
        debounce: bool,
        now: DateTime<Utc>,
    ) -> Result<CapacityOutcome, BrokerError> {
        if self.config.offline {
            info!("modo offline, no se piden workers para {}", category);
            return Ok(CapacityOutcome::Offline);
        }

        let running = self.catalog.total_count(now);
        let requested = n_on_demand + n_spot;
        if running + requested > self.config.max_workers {
            error!(
                "no se piden {} workers para {}: ya hay {} y el máximo es {}",
                requested, category, running, self.config.max_workers
            );
            return Err(BrokerError::FleetCapExceeded {
                category: category.clone(),
                requested,
                running,
                max: self.config.max_workers,
            });
        }

        let startup = Duration::seconds(WORKER_STARTUP_TIME_SECS);
        if let Some(requested_at) = state.recently_requested.get(category).filter(|_| debounce) {
            if *requested_at >= now - startup {
                info!("todavía arrancan workers de {}, no se piden más", category);
                return Ok(CapacityOutcome::Debounced);
            }
        }

        self.scaler.launch(category, tags, n_on_demand, n_spot);
        state.recently_requested.insert(category.clone(), now);
        Ok(CapacityOutcome::Requested)
    }

    pub fn single_point_address(&self, category: &WorkerCategory) -> Option<String> {
        self.single_point_address_at(category, Utc::now())
    }

    /// Dirección de un worker listo para una petición interactiva. `None`
    /// significa que quien llama pida capacidad y avise que reintente.
    pub fn single_point_address_at(&self, category: &WorkerCategory, now: DateTime<Utc>) -> Option<String> {
        if self.config.offline {
            return Some("localhost".to_string());
        }
        self.catalog.preferred_address_for(category, now)
    }

    pub fn reassign_preferred(&self, category: &WorkerCategory) -> Option<WorkerId> {
        self.catalog.reassign_preferred(category)
    }

    /// Resumen de cada job, en orden de categoría y de llegada.
    pub fn job_summaries(&self) -> Vec<JobSummary> {
        self.lock()
            .jobs
            .values()
            .flat_map(|list| list.iter().map(Job::summary))
            .collect()
    }

    pub fn job_status(&self, job_id: &str) -> Option<RegionalAnalysisStatus> {
        let assembler = self.lock().assemblers.get(job_id).cloned();
        assembler.map(|a| a.status())
    }

    pub fn partial_buffer(&self, job_id: &str) -> Option<PathBuf> {
        let assembler = self.lock().assemblers.get(job_id).cloned();
        assembler.and_then(|a| a.buffer_file())
    }

    pub fn worker_observations(&self) -> Vec<WorkerObservation> {
        self.catalog.observations(Utc::now())
    }

    /// Resultado ya subido. Con percentil y cutoff es una grilla de
    /// accesibilidad; sin ellos, la matriz de tiempos de viaje.
    pub fn stored_result(
        &self,
        job_id: &str,
        selector: Option<(u32, u32)>,
    ) -> Result<Vec<u8>, BrokerError> {
        if !is_valid_job_id(job_id) {
            return Err(BrokerError::InvalidRequest(format!("job_id inválido: {:?}", job_id)));
        }
        let path = match selector {
            Some((percentile, cutoff)) => access_grid_key(job_id, percentile, cutoff),
            None => travel_time_key(job_id),
        };
        let key = FileStorageKey::new(self.config.results_bucket.clone(), path);
        Ok(self.storage.get(&key)?)
    }
}
