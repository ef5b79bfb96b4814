use crate::store::StoreError;
use crate::types::{ChunkCoords, ChunkingError, NodeId};
use std::time::Duration;

/// Errors reported by graph construction, planning and execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("incompatible shapes: {0}")]
    IncompatibleShapes(String),

    #[error("invalid chunking: {0}")]
    InvalidChunking(#[from] ChunkingError),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no rechunking plan with at most {max_stages} stages fits within {max_mem} bytes per task")]
    PlanInfeasible { max_stages: usize, max_mem: u64 },

    #[error("{operand} chunks need {chunk_bytes} bytes per task, exceeding the limit of {max_mem} bytes")]
    ChunkTooLarge {
        operand: &'static str,
        chunk_bytes: u64,
        max_mem: u64,
    },

    #[error("{node} ({name}) needs {projected} bytes per task, exceeding the limit of {max_mem} bytes")]
    MemoryBudgetExceeded {
        node: NodeId,
        name: String,
        projected: u64,
        max_mem: u64,
    },

    #[error("task for chunk {chunk:?} of {node} ({array}) failed after {attempts} attempt(s): {cause:#}")]
    TaskFailed {
        node: NodeId,
        array: String,
        chunk: ChunkCoords,
        attempts: u32,
        cause: anyhow::Error,
    },

    #[error("store error: {0}")]
    StoreIo(#[from] StoreError),

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("{0} has not been computed")]
    NotMaterialized(NodeId),
}

pub type Result<T = (), E = Error> = std::result::Result<T, E>;
