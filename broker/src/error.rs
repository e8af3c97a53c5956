//! Errores del broker.
//!
//! Solo los errores de admisión (job duplicado, pedidos de capacidad
//! inválidos) llegan al cliente. Resultados malformados o para jobs
//! desconocidos se loguean y se descartan sin error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use common::{JobId, WorkerCategory};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("ya existe un job con id {0}")]
    DuplicateJob(JobId),

    #[error("no existe el job {0}")]
    UnknownJob(JobId),

    #[error("pedido inválido: {0}")]
    InvalidRequest(String),

    #[error("cantidad negativa de workers pedida ({n_on_demand} on-demand, {n_spot} spot)")]
    NegativeCapacity { n_on_demand: i32, n_spot: i32 },

    #[error(
        "pedir {requested} workers en {category} supera el máximo de {max} ({running} ya corriendo)"
    )]
    FleetCapExceeded {
        category: WorkerCategory,
        requested: usize,
        running: usize,
        max: usize,
    },

    #[error("ensamblador de resultados: {0}")]
    Assembler(#[from] AssemblerError),

    #[error("almacenamiento: {0}")]
    Storage(#[from] StorageError),

    #[error("error interno: {0}")]
    Internal(String),
}

impl BrokerError {
    fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::DuplicateJob(_) => StatusCode::CONFLICT,
            BrokerError::UnknownJob(_) => StatusCode::NOT_FOUND,
            BrokerError::InvalidRequest(_) | BrokerError::NegativeCapacity { .. } => {
                StatusCode::BAD_REQUEST
            }
            BrokerError::FleetCapExceeded { .. } => StatusCode::FORBIDDEN,
            BrokerError::Assembler(AssemblerError::TooManyPairs { .. }) => StatusCode::BAD_REQUEST,
            BrokerError::Assembler(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            BrokerError::Storage(StorageError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            BrokerError::Storage(_) | BrokerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("{origins} orígenes x {destinations} destinos supera el límite de {limit} pares")]
    TooManyPairs {
        origins: usize,
        destinations: usize,
        limit: usize,
    },

    #[error("operación {operation} inválida en estado {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("I/O en {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no existe {0}")]
    NotFound(String),

    #[error("clave inválida {0}")]
    InvalidKey(String),

    #[error("I/O en {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("el proveedor rechazó el pedido: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("valor inválido para {key}: {value:?}")]
    Invalid { key: String, value: String },
}
