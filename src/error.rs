use std::path::PathBuf;

use thiserror::Error;

use crate::cluster::ClusterError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to spawn job {job}: {source}")]
    SpawnFailure {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cluster submission denied: {0}")]
    SubmissionDenied(String),

    #[error("Job {job} finished without its completion marker{}", exhausted_suffix(.exhausted))]
    ExecutionFailure { job: String, exhausted: bool },

    #[error("Expected output not found: {}", .0.display())]
    MissingExpectedOutput(PathBuf),

    #[error("Completion marker incomplete: {}", .0.display())]
    MarkerIncomplete(PathBuf),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Job {job} depends on unknown job #{dependency}")]
    UnknownDependency { job: String, dependency: usize },

    #[error("Concurrency limit must be > 0 (stage {0})")]
    InvalidConcurrency(String),

    #[error("Native specification template: unknown placeholder ${0}")]
    Template(String),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Failures that leave a job reported as failed. Informational
    /// conditions such as a missing output file are not among them.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            PipelineError::MissingExpectedOutput(_) | PipelineError::SubmissionDenied(_)
        )
    }
}

fn exhausted_suffix(exhausted: &bool) -> &'static str {
    if *exhausted {
        " (restarts exhausted)"
    } else {
        ""
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
