//! Tipos compartidos entre broker, workers y cliente.
//!
//! Todo lo que viaja por HTTP vive aquí para que los tres binarios
//! serialicen exactamente lo mismo.

pub mod bitset;
pub mod grid;
pub mod job;
pub mod results;
pub mod task;
pub mod worker;

pub use bitset::BitSet;
pub use job::{
    is_valid_job_id, new_job_id, JobId, JobSummary, RegionalAnalysisStatus, RegionalJobRequest, WorkerTags,
};
pub use results::{RegionalWorkResult, TaskId};
pub use task::{
    AnalysisWorkerTask, GridExtents, ProfileParameters, RegionalTask, RegionalTemplate,
    SurfaceFormat, TravelTimeSurfaceTask,
};
pub use worker::{
    CapacityRequest, SinglePointRequest, SinglePointResponse, UnreachableWorkerReport,
    WorkerCategory, WorkerId, WorkerObservation, WorkerStatus, UNKNOWN_WORKER_VERSION,
};
