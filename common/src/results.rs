use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Índice de la tarea dentro de su job (= índice del origen).
///
/// Con signo a propósito: lo manda el worker y el broker tiene que poder
/// rechazar valores negativos en vez de fallar al deserializar.
pub type TaskId = i64;

/// Resultado de un origen, tal cual lo devuelve el worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalWorkResult {
    pub job_id: JobId,
    pub task_id: TaskId,

    /// Accesibilidad indexada `[percentil][cutoff]`.
    #[serde(default)]
    pub accessibility_values: Option<Vec<Vec<i32>>>,

    /// Tiempos de viaje en minutos indexados `[percentil][destino]`.
    #[serde(default)]
    pub travel_times: Option<Vec<Vec<i32>>>,

    /// Mensaje si el worker no pudo calcular este origen.
    #[serde(default)]
    pub error: Option<String>,
}

impl RegionalWorkResult {
    pub fn new(job_id: impl Into<JobId>, task_id: TaskId) -> Self {
        Self {
            job_id: job_id.into(),
            task_id,
            accessibility_values: None,
            travel_times: None,
            error: None,
        }
    }

    pub fn with_travel_times(mut self, travel_times: Vec<Vec<i32>>) -> Self {
        self.travel_times = Some(travel_times);
        self
    }

    pub fn with_accessibility(mut self, values: Vec<Vec<i32>>) -> Self {
        self.accessibility_values = Some(values);
        self
    }
}
