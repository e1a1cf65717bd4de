use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    /// The resource manager refused the submission. Usually transient
    /// (queue limits, maintenance windows).
    #[error("submission denied by resource manager: {0}")]
    Denied(String),

    /// The resource manager could not be reached.
    #[error("cannot communicate with resource manager: {0}")]
    Communication(String),

    #[error("invalid job or template: {0}")]
    InvalidJob(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Descriptor for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTemplate {
    /// Submission script to execute on the remote host.
    pub remote_command: PathBuf,
    pub job_name: String,
    /// Merged stdout/stderr destination.
    pub output_path: PathBuf,
    pub native_specification: Option<String>,
}

/// Session-local handle to a created template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId(pub u64);

/// Resource-manager job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteJobId(pub String);

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteJobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl RemoteJobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RemoteJobState::Done | RemoteJobState::Failed)
    }
}

/// A live session with a batch resource manager.
///
/// Every method is a query or a submission that returns promptly. There
/// is no "wait for any job" call: one session is shared by every batch in
/// the process.
#[async_trait]
pub trait ClusterSession: Send + Sync {
    async fn create_template(&self, template: JobTemplate) -> ClusterResult<TemplateId>;

    async fn delete_template(&self, template: TemplateId) -> ClusterResult<()>;

    async fn run_job(&self, template: TemplateId) -> ClusterResult<RemoteJobId>;

    async fn job_state(&self, job: &RemoteJobId) -> ClusterResult<RemoteJobState>;

    /// Release the session. Called once by the owner at teardown.
    async fn exit(&self) -> ClusterResult<()>;
}
