use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

use common::{
    BitSet, JobId, JobSummary, RegionalTask, RegionalTemplate, TaskId, WorkerCategory, WorkerTags,
};

/// Silencio después de la última entrega antes de empezar a re-entregar.
pub const REDELIVERY_QUIET_PERIOD_SECS: i64 = 2 * 60;

/// Pasadas de re-entrega permitidas antes de dar el job por trabado.
pub const MAX_DELIVERY_PASSES: u32 = 5;

/// Todas las tareas (orígenes) de un análisis regional.
///
/// Las tareas no se guardan: se arman desde el template en el momento de
/// entregarlas. Lo único que se guarda por tarea es un bit de completada.
/// Un worker que muere no avisa nada, así que las tareas perdidas se
/// detectan por silencio: si pasado el período de espera siguen faltando
/// resultados, se vuelve a recorrer el job desde el principio.
#[derive(Debug)]
pub struct Job {
    pub job_id: JobId,
    pub category: WorkerCategory,
    pub tags: WorkerTags,
    template: RegionalTemplate,

    n_tasks_total: usize,
    completed_tasks: BitSet,
    n_tasks_completed: usize,
    /// Incluye re-entregas, así que puede superar al total.
    n_tasks_delivered: usize,

    /// Solo avanza dentro de una pasada; una pasada nueva lo vuelve a 0.
    next_task_to_deliver: usize,
    delivery_pass: u32,
    last_delivery_time: Option<DateTime<Utc>>,
    /// Se agotaron las pasadas con tareas pendientes.
    exhausted: bool,
}

impl Job {
    pub fn new(template: RegionalTemplate, tags: WorkerTags) -> Self {
        let n_tasks_total = template.n_tasks_total();
        Self {
            job_id: template.job_id.clone(),
            category: template.category(),
            tags,
            template,
            n_tasks_total,
            completed_tasks: BitSet::new(n_tasks_total),
            n_tasks_completed: 0,
            n_tasks_delivered: 0,
            next_task_to_deliver: 0,
            delivery_pass: 0,
            last_delivery_time: None,
            exhausted: false,
        }
    }

    pub fn n_tasks_total(&self) -> usize {
        self.n_tasks_total
    }

    pub fn n_tasks_completed(&self) -> usize {
        self.n_tasks_completed
    }

    pub fn delivery_pass(&self) -> u32 {
        self.delivery_pass
    }

    pub fn is_complete(&self) -> bool {
        self.n_tasks_completed == self.n_tasks_total
    }

    /// Marca la tarea como completada. Devuelve `false` sin tocar nada si
    /// el índice está fuera de rango o si ya estaba marcada: un resultado
    /// duplicado o re-entregado nunca cuenta dos veces.
    pub fn mark_completed(&mut self, task_id: TaskId) -> bool {
        if task_id < 0 || task_id as u64 >= self.n_tasks_total as u64 {
            return false;
        }
        if !self.completed_tasks.set(task_id as usize) {
            return false;
        }
        self.n_tasks_completed += 1;
        true
    }

    /// Hasta `max_tasks` tareas nuevas desde el cursor, salteando las completadas.
    /// El cursor avanza por cada índice inspeccionado, se entregue o no.
    pub fn generate_batch(&mut self, max_tasks: usize, now: DateTime<Utc>) -> Vec<RegionalTask> {
        let mut tasks = Vec::with_capacity(max_tasks.min(self.n_tasks_total));
        while self.next_task_to_deliver < self.n_tasks_total && tasks.len() < max_tasks {
            let index = self.next_task_to_deliver;
            if !self.completed_tasks.get(index) {
                tasks.push(self.template.make_task(index as TaskId));
            }
            self.next_task_to_deliver += 1;
        }
        if !tasks.is_empty() {
            self.last_delivery_time = Some(now);
        }
        self.n_tasks_delivered += tasks.len();
        tasks
    }

    /// Hay algo para entregar si el cursor no llegó al final, o si pasó el
    /// período de espera y quedan pasadas: en ese caso arranca una pasada
    /// nueva desde 0. Agotadas las pasadas devuelve `false` para siempre.
    pub fn has_tasks_to_deliver(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_complete() || self.exhausted {
            return false;
        }
        if self.next_task_to_deliver < self.n_tasks_total {
            return true;
        }
        let quiet = Duration::seconds(REDELIVERY_QUIET_PERIOD_SECS);
        let quiet_elapsed = match self.last_delivery_time {
            Some(last) => now >= last + quiet,
            None => true,
        };
        if !quiet_elapsed {
            return false;
        }
        if self.delivery_pass >= MAX_DELIVERY_PASSES {
            error!(
                "job {} entregado {} veces y todavía faltan {} resultados; no se re-entrega más",
                self.job_id,
                self.delivery_pass,
                self.n_tasks_total - self.n_tasks_completed
            );
            self.exhausted = true;
            return false;
        }
        self.next_task_to_deliver = 0;
        self.delivery_pass += 1;
        warn!(
            "job {}: {} s después de la última entrega faltan {} resultados, empezando pasada {}",
            self.job_id,
            REDELIVERY_QUIET_PERIOD_SECS,
            self.n_tasks_total - self.n_tasks_completed,
            self.delivery_pass
        );
        true
    }

    /// Control de seguridad: el contador tiene que coincidir con los bits marcados.
    pub fn verify_complete(&self) -> bool {
        let cardinality = self.completed_tasks.cardinality();
        if cardinality != self.n_tasks_completed {
            error!(
                "job {}: contador de completadas ({}) no coincide con el bitset ({})",
                self.job_id, self.n_tasks_completed, cardinality
            );
            return false;
        }
        true
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            graph_id: self.category.graph_id.clone(),
            worker_version: self.category.worker_version.clone(),
            n_tasks_total: self.n_tasks_total,
            n_tasks_completed: self.n_tasks_completed,
            n_tasks_delivered: self.n_tasks_delivered,
            delivery_pass: self.delivery_pass,
            stalled: self.exhausted,
            tags: self.tags.clone(),
        }
    }
}
