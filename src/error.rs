// src/error.rs
//! Error types for the scheduler and its workers.

use crate::worker::WorkerId;
use std::fmt;

/// Which half of a worker's tick failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Compute,
    Render,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compute => write!(f, "compute"),
            Phase::Render => write!(f, "render"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to construct worker #{index}: {source:#}")]
    ConstructionFailure {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("worker {worker} failed during {phase}: {message}")]
    UserCodeFailure {
        worker: WorkerId,
        phase: Phase,
        message: String,
    },

    #[error("scheduler has been shut down")]
    ShutDown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SchedulerError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
