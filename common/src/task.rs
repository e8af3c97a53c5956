use serde::{Deserialize, Serialize};

use crate::grid::{pixel_to_center_lat, pixel_to_center_lon};
use crate::job::{is_valid_job_id, JobId};
use crate::results::TaskId;
use crate::worker::WorkerCategory;

/// Máximo de percentiles por tarea.
pub const MAX_PERCENTILES: usize = 5;

/// Máximo de cutoffs por tarea; demasiados generan archivos enormes.
pub const MAX_CUTOFFS: usize = 120;

/// Máximo de orígenes por job. Cada origen ocupa lugar en memoria y en
/// los archivos de salida aunque solo se pida accesibilidad.
pub const MAX_ORIGINS: usize = 4_000_000;

/// Extensión de una grilla web mercator, en píxeles a un zoom dado.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridExtents {
    pub zoom: u32,
    pub west: i64,
    pub north: i64,
    pub width: u32,
    pub height: u32,
}

impl GridExtents {
    pub fn n_cells(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Parámetros de ruteo que el broker no interpreta, solo reenvía.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileParameters {
    pub date: String,
    pub from_time: u32,
    pub to_time: u32,
    pub access_modes: String,
    pub egress_modes: String,
    pub direct_modes: String,
    pub transit_modes: String,
    pub walk_speed: f64,
    pub bike_speed: f64,
    pub max_walk_time: u32,
    pub max_trip_duration_minutes: u32,
    pub monte_carlo_draws: u32,
    pub scenario_id: Option<String>,
}

impl Default for ProfileParameters {
    fn default() -> Self {
        Self {
            date: "2024-01-10".to_string(),
            from_time: 7 * 3600,
            to_time: 9 * 3600,
            access_modes: "WALK".to_string(),
            egress_modes: "WALK".to_string(),
            direct_modes: "WALK".to_string(),
            transit_modes: "TRANSIT".to_string(),
            walk_speed: 1.3,
            bike_speed: 4.1,
            max_walk_time: 20,
            max_trip_duration_minutes: 120,
            monte_carlo_draws: 200,
            scenario_id: None,
        }
    }
}

/// Todo lo que comparten las tareas de un job regional.
/// Cada tarea se arma a partir de esto más su índice de origen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalTemplate {
    pub job_id: JobId,
    pub graph_id: String,
    pub worker_version: String,
    pub extents: GridExtents,
    pub percentiles: Vec<u32>,
    #[serde(default)]
    pub cutoffs_minutes: Vec<u32>,
    #[serde(default)]
    pub destination_point_set_keys: Vec<String>,
    /// Cantidad de destinos por origen cuando se piden tiempos de viaje.
    #[serde(default)]
    pub n_destinations: u32,
    #[serde(default)]
    pub record_access: bool,
    #[serde(default)]
    pub record_times: bool,
    #[serde(default)]
    pub profile: ProfileParameters,
}

impl RegionalTemplate {
    pub fn category(&self) -> WorkerCategory {
        WorkerCategory::new(self.graph_id.clone(), self.worker_version.clone())
    }

    /// Un origen por celda de la grilla.
    pub fn n_tasks_total(&self) -> usize {
        self.extents.n_cells()
    }

    /// Arma la tarea `task_id`: solo cambian las coordenadas del origen.
    pub fn make_task(&self, task_id: TaskId) -> RegionalTask {
        let width = self.extents.width.max(1) as i64;
        let x = task_id % width;
        let y = task_id / width;
        RegionalTask {
            template: self.clone(),
            task_id,
            x: x as u32,
            y: y as u32,
            from_lat: pixel_to_center_lat(self.extents.north + y, self.extents.zoom),
            from_lon: pixel_to_center_lon(self.extents.west + x, self.extents.zoom),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_job_id(&self.job_id) {
            return Err(format!("job_id inválido: {:?}", self.job_id));
        }
        if self.graph_id.is_empty() {
            return Err("graph_id vacío".to_string());
        }
        if self.n_tasks_total() == 0 {
            return Err("la grilla de orígenes no tiene celdas".to_string());
        }
        if self.n_tasks_total() > MAX_ORIGINS {
            return Err(format!(
                "{} orígenes supera el máximo de {}",
                self.n_tasks_total(),
                MAX_ORIGINS
            ));
        }
        if self.percentiles.is_empty() || self.percentiles.len() > MAX_PERCENTILES {
            return Err(format!(
                "se esperaban entre 1 y {} percentiles, llegaron {}",
                MAX_PERCENTILES,
                self.percentiles.len()
            ));
        }
        if self.cutoffs_minutes.len() > MAX_CUTOFFS {
            return Err(format!(
                "máximo {} cutoffs, llegaron {}",
                MAX_CUTOFFS,
                self.cutoffs_minutes.len()
            ));
        }
        if !self.record_access && !self.record_times {
            return Err("el job no pide ningún resultado (record_access / record_times)".to_string());
        }
        if self.record_access && self.cutoffs_minutes.is_empty() {
            return Err("record_access requiere al menos un cutoff".to_string());
        }
        if self.record_times && self.n_destinations == 0 {
            return Err("record_times requiere n_destinations > 0".to_string());
        }
        Ok(())
    }
}

/// Una tarea regional: un origen de la grilla.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalTask {
    pub template: RegionalTemplate,
    pub task_id: TaskId,
    pub x: u32,
    pub y: u32,
    pub from_lat: f64,
    pub from_lon: f64,
}

impl RegionalTask {
    pub fn job_id(&self) -> &str {
        &self.template.job_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfaceFormat {
    Grid,
    Geotiff,
}

/// Tarea interactiva de un solo origen. No pasa por la cola de jobs:
/// se manda directo a un worker que ya tenga la red cargada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelTimeSurfaceTask {
    pub graph_id: String,
    pub worker_version: String,
    pub extents: GridExtents,
    pub from_lat: f64,
    pub from_lon: f64,
    pub percentiles: Vec<u32>,
    pub format: SurfaceFormat,
    #[serde(default)]
    pub profile: ProfileParameters,
}

impl TravelTimeSurfaceTask {
    pub fn category(&self) -> WorkerCategory {
        WorkerCategory::new(self.graph_id.clone(), self.worker_version.clone())
    }
}

/// Lo que recibe un worker. El campo `type` del JSON decide la variante.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisWorkerTask {
    TravelTimeSurface(TravelTimeSurfaceTask),
    RegionalAnalysis(RegionalTask),
}

impl AnalysisWorkerTask {
    pub fn category(&self) -> WorkerCategory {
        match self {
            AnalysisWorkerTask::TravelTimeSurface(t) => t.category(),
            AnalysisWorkerTask::RegionalAnalysis(t) => t.template.category(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(width: u32, height: u32) -> RegionalTemplate {
        RegionalTemplate {
            job_id: "job-1".to_string(),
            graph_id: "net-1".to_string(),
            worker_version: "v5.0".to_string(),
            extents: GridExtents {
                zoom: 9,
                west: 150,
                north: 190,
                width,
                height,
            },
            percentiles: vec![50],
            cutoffs_minutes: vec![30, 60],
            destination_point_set_keys: vec!["region/jobs.grid".to_string()],
            n_destinations: 2,
            record_access: true,
            record_times: true,
            profile: ProfileParameters::default(),
        }
    }

    #[test]
    fn make_task_calcula_x_y_desde_el_indice() {
        let tpl = template(4, 3);
        assert_eq!(tpl.n_tasks_total(), 12);

        let task = tpl.make_task(6);
        assert_eq!((task.x, task.y), (2, 1));
        assert_eq!(task.task_id, 6);
        assert_eq!(task.job_id(), "job-1");
        assert_eq!(task.from_lon, pixel_to_center_lon(152, 9));
        assert_eq!(task.from_lat, pixel_to_center_lat(191, 9));
    }

    #[test]
    fn validate_rechaza_grillas_vacias_y_demasiados_percentiles() {
        assert!(template(4, 3).validate().is_ok());
        assert!(template(0, 3).validate().is_err());

        let mut tpl = template(2, 2);
        tpl.percentiles = vec![5, 25, 50, 75, 95, 99];
        assert!(tpl.validate().is_err());

        let mut tpl = template(2, 2);
        tpl.record_access = false;
        tpl.record_times = false;
        assert!(tpl.validate().is_err());
    }

    #[test]
    fn validate_limita_los_origenes_aunque_solo_se_pida_accesibilidad() {
        let mut tpl = template(40_000, 40_000);
        tpl.record_times = false;
        assert!(tpl.validate().unwrap_err().contains("orígenes"));

        let mut tpl = template(2000, 2000);
        tpl.record_times = false;
        assert!(tpl.validate().is_ok());
    }

    #[test]
    fn validate_rechaza_ids_que_salen_del_directorio() {
        for id in ["", "../otro", "a/b", "a\\b", ".."] {
            let mut tpl = template(2, 2);
            tpl.job_id = id.to_string();
            assert!(tpl.validate().is_err(), "{:?}", id);
        }
    }

    #[test]
    fn tarea_serializa_con_etiqueta_de_tipo() {
        let task = AnalysisWorkerTask::RegionalAnalysis(template(2, 2).make_task(1));
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "REGIONAL_ANALYSIS");
        assert_eq!(json["task_id"], 1);

        let back: AnalysisWorkerTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.category(), WorkerCategory::new("net-1", "v5.0"));
    }
}
