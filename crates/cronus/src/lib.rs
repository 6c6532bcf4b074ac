pub mod cache;
pub mod cluster;
pub mod config;
pub mod hierarchy;
pub mod logs;
pub mod metrics;
pub mod records;
pub mod report;
pub mod request;
pub mod resolver;
pub mod schedule;
pub mod server;
pub mod service;

use std::time::Duration;

use thiserror::Error;

pub use cluster::ObjectKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("CronJob cache did not sync within {0:?}")]
    SyncTimeout(Duration),
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },
    #[error("Failed to resolve children of {parent}: {message}")]
    Resolution { parent: ObjectKey, message: String },
    #[error("Failed to fetch logs for pod {pod}: {message}")]
    LogFetch { pod: ObjectKey, message: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Request deadline exceeded")]
    DeadlineExceeded,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that must stop the process instead of serving a stale or empty view.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SyncTimeout(_) | Error::Config(_))
    }

    /// The request was cancelled or ran out of time; nothing failed upstream.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::Kubernetes(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
