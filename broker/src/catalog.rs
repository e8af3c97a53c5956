use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use common::{WorkerCategory, WorkerId, WorkerObservation};

/// Un worker que no hace poll en este tiempo se da por muerto.
pub const WORKER_RECORD_DURATION_SECS: i64 = 2 * 60;

#[derive(Debug, Default)]
struct CatalogInner {
    /// Última observación de cada worker; una nueva reemplaza a la anterior.
    observations: HashMap<WorkerId, WorkerObservation>,
    by_category: HashMap<WorkerCategory, BTreeSet<WorkerId>>,
    /// Worker al que mandamos las peticiones single-point de cada categoría.
    /// Siempre el mismo mientras viva, para no re-enlazar redes y pointsets.
    single_point: HashMap<WorkerCategory, WorkerId>,
}

impl CatalogInner {
    fn remove_from_category(&mut self, category: &WorkerCategory, worker_id: &str) {
        if let Some(ids) = self.by_category.get_mut(category) {
            ids.remove(worker_id);
            if ids.is_empty() {
                self.by_category.remove(category);
            }
        }
        if self.single_point.get(category).map(String::as_str) == Some(worker_id) {
            self.single_point.remove(category);
        }
    }

    fn purge_stale(&mut self, now: DateTime<Utc>) {
        let oldest_acceptable = now - Duration::seconds(WORKER_RECORD_DURATION_SECS);
        let stale: Vec<(WorkerId, WorkerCategory)> = self
            .observations
            .values()
            .filter(|obs| obs.last_seen < oldest_acceptable)
            .map(|obs| (obs.worker_id.clone(), obs.category.clone()))
            .collect();

        for (worker_id, category) in stale {
            info!("worker {} sin poll desde hace más de {} s, lo saco del catálogo", worker_id, WORKER_RECORD_DURATION_SECS);
            self.observations.remove(&worker_id);
            self.remove_from_category(&category, &worker_id);
        }
    }

    /// Si la categoría se quedó sin worker single-point, elige otro vivo.
    fn ensure_single_point(&mut self, category: &WorkerCategory) -> Option<WorkerId> {
        if let Some(id) = self.single_point.get(category) {
            return Some(id.clone());
        }
        let id = self.by_category.get(category)?.iter().next()?.clone();
        self.single_point.insert(category.clone(), id.clone());
        Some(id)
    }
}

/// Catálogo de los workers que hicieron poll hace poco.
///
/// Tiene su propio lock, separado del de la tabla de jobs, así el registro
/// de workers no se serializa contra la asignación de tareas.
#[derive(Debug, Default)]
pub struct WorkerCatalog {
    inner: Mutex<CatalogInner>,
}

impl WorkerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CatalogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registra (o reemplaza) la observación de un worker. Si cambió de
    /// categoría lo saca de la anterior antes de agregarlo a la nueva.
    pub fn record(&self, observation: WorkerObservation) {
        let mut inner = self.lock();
        let worker_id = observation.worker_id.clone();
        let category = observation.category.clone();

        if let Some(old) = inner.observations.insert(worker_id.clone(), observation) {
            if old.category != category {
                debug!("worker {} pasó de {} a {}", worker_id, old.category, category);
                inner.remove_from_category(&old.category, &worker_id);
            }
        }

        inner
            .by_category
            .entry(category.clone())
            .or_default()
            .insert(worker_id.clone());
        inner.single_point.entry(category).or_insert(worker_id);
    }

    /// Dirección del worker single-point de la categoría, o `None` si no hay ninguno vivo.
    pub fn preferred_address_for(
        &self,
        category: &WorkerCategory,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let mut inner = self.lock();
        inner.purge_stale(now);
        let worker_id = inner.ensure_single_point(category)?;
        inner
            .observations
            .get(&worker_id)
            .map(|obs| obs.ip_address.clone())
    }

    /// El worker preferido no respondió: se elige otro de la misma categoría
    /// (si hay). Devuelve el nuevo preferido.
    pub fn reassign_preferred(&self, category: &WorkerCategory) -> Option<WorkerId> {
        let mut inner = self.lock();
        let previous = inner.single_point.remove(category);
        let next = inner
            .by_category
            .get(category)
            .and_then(|ids| ids.iter().find(|id| Some(*id) != previous.as_ref()).cloned());

        match (&previous, &next) {
            (Some(prev), Some(next)) => {
                info!("worker single-point {} de {} no responde, paso a {}", prev, category, next);
            }
            (Some(prev), None) => {
                info!("worker single-point {} de {} no responde y no hay otro", prev, category);
            }
            _ => {}
        }
        if let Some(id) = &next {
            inner.single_point.insert(category.clone(), id.clone());
        }
        next
    }

    /// `true` si no conocemos ningún worker vivo para la categoría.
    /// Con `ignore_version` alcanza con que alguno tenga la misma red.
    pub fn is_empty(&self, category: &WorkerCategory, ignore_version: bool, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        inner.purge_stale(now);
        if ignore_version {
            return !inner
                .observations
                .values()
                .any(|obs| obs.category.graph_id == category.graph_id);
        }
        inner
            .by_category
            .get(category)
            .map_or(true, |ids| ids.is_empty())
    }

    pub fn count_in_category(&self, category: &WorkerCategory, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        inner.purge_stale(now);
        inner.by_category.get(category).map_or(0, |ids| ids.len())
    }

    pub fn total_count(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        inner.purge_stale(now);
        inner.observations.len()
    }

    /// Copia de las observaciones vivas, ordenadas por id.
    pub fn observations(&self, now: DateTime<Utc>) -> Vec<WorkerObservation> {
        let mut inner = self.lock();
        inner.purge_stale(now);
        let mut out: Vec<WorkerObservation> = inner.observations.values().cloned().collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(id: &str, graph: &str, ip: &str, seen: DateTime<Utc>) -> WorkerObservation {
        WorkerObservation {
            worker_id: id.to_string(),
            category: WorkerCategory::new(graph, "v1"),
            ip_address: ip.to_string(),
            networks: vec![graph.to_string()],
            last_seen: seen,
            processors: 4,
            load_percent: None,
            memory_total_bytes: 0,
            memory_free_bytes: 0,
        }
    }

    #[test]
    fn primer_worker_de_la_categoria_queda_como_single_point() {
        let catalog = WorkerCatalog::new();
        let now = Utc::now();
        catalog.record(obs("w1", "net-a", "10.0.0.1", now));
        catalog.record(obs("w2", "net-a", "10.0.0.2", now));

        let cat = WorkerCategory::new("net-a", "v1");
        assert_eq!(catalog.preferred_address_for(&cat, now).as_deref(), Some("10.0.0.1"));
        assert_eq!(catalog.count_in_category(&cat, now), 2);
        assert_eq!(catalog.total_count(now), 2);
    }

    #[test]
    fn cambio_de_categoria_saca_al_worker_de_la_anterior() {
        let catalog = WorkerCatalog::new();
        let now = Utc::now();
        let a = WorkerCategory::new("net-a", "v1");
        let b = WorkerCategory::new("net-b", "v1");

        catalog.record(obs("w1", "net-a", "10.0.0.1", now));
        catalog.record(obs("w1", "net-b", "10.0.0.1", now));

        assert!(catalog.is_empty(&a, false, now));
        assert_eq!(catalog.preferred_address_for(&a, now), None);
        assert_eq!(catalog.count_in_category(&b, now), 1);
        assert_eq!(catalog.total_count(now), 1);
    }

    #[test]
    fn workers_viejos_se_purgan_antes_de_consultar() {
        let catalog = WorkerCatalog::new();
        let t0 = Utc::now();
        let cat = WorkerCategory::new("net-a", "v1");
        catalog.record(obs("w1", "net-a", "10.0.0.1", t0));

        let within = t0 + Duration::seconds(WORKER_RECORD_DURATION_SECS);
        assert!(!catalog.is_empty(&cat, false, within));

        let after = t0 + Duration::seconds(WORKER_RECORD_DURATION_SECS + 1);
        assert!(catalog.is_empty(&cat, false, after));
        assert_eq!(catalog.preferred_address_for(&cat, after), None);
        assert!(catalog.observations(after).is_empty());
    }

    #[test]
    fn is_empty_ignorando_version_mira_solo_la_red() {
        let catalog = WorkerCatalog::new();
        let now = Utc::now();
        catalog.record(obs("w1", "net-a", "10.0.0.1", now));

        let other_version = WorkerCategory::new("net-a", "v2");
        assert!(catalog.is_empty(&other_version, false, now));
        assert!(!catalog.is_empty(&other_version, true, now));
        assert!(catalog.is_empty(&WorkerCategory::new("net-z", "v1"), true, now));
    }

    #[test]
    fn reassign_preferred_elige_otro_worker_vivo() {
        let catalog = WorkerCatalog::new();
        let now = Utc::now();
        let cat = WorkerCategory::new("net-a", "v1");
        catalog.record(obs("w1", "net-a", "10.0.0.1", now));
        catalog.record(obs("w2", "net-a", "10.0.0.2", now));

        assert_eq!(catalog.reassign_preferred(&cat).as_deref(), Some("w2"));
        assert_eq!(catalog.preferred_address_for(&cat, now).as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn reassign_preferred_sin_alternativa_deja_la_categoria_sin_preferido() {
        let catalog = WorkerCatalog::new();
        let now = Utc::now();
        let cat = WorkerCategory::new("net-a", "v1");
        catalog.record(obs("w1", "net-a", "10.0.0.1", now));

        assert_eq!(catalog.reassign_preferred(&cat), None);
        // el mismo worker vuelve a hacer poll y se lo vuelve a asignar
        catalog.record(obs("w1", "net-a", "10.0.0.1", now));
        assert_eq!(catalog.preferred_address_for(&cat, now).as_deref(), Some("10.0.0.1"));
    }
}
