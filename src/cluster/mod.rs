//! Remote execution on a batch resource manager.
//!
//! - [`ClusterSession`]: the resource-manager seam (templates, submit, query)
//! - [`GridEngineSession`]: session backed by the Grid Engine clients
//! - [`ClusterGateway`]: lazily opened, process-wide session plus the
//!   retry policies around it
//!
//! Two retry loops live here and are independent of a job's restart
//! budget: denied submissions are retried forever after a fixed backoff,
//! and state queries that hit a communication fault are retried forever
//! after a short pause.

pub mod grid_engine;
pub mod script;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::ClusterConfig;
use crate::error::{PipelineError, Result};

pub use grid_engine::GridEngineSession;
pub use script::SpecParams;
pub use session::{
    ClusterError, ClusterResult, ClusterSession, JobTemplate, RemoteJobId, RemoteJobState,
    TemplateId,
};

type SessionFactory = Box<dyn Fn() -> ClusterResult<Arc<dyn ClusterSession>> + Send + Sync>;

/// A submitted job: the live template and the resource-manager id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub template: TemplateId,
    pub job: RemoteJobId,
}

/// Owner of the cluster session shared by every batch of a pipeline.
pub struct ClusterGateway {
    config: ClusterConfig,
    status_log: Option<PathBuf>,
    session: OnceCell<Arc<dyn ClusterSession>>,
    factory: SessionFactory,
}

impl std::fmt::Debug for ClusterGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterGateway")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClusterGateway {
    /// Gateway that opens a [`GridEngineSession`] on first use.
    pub fn new(config: ClusterConfig) -> Self {
        Self::with_factory(config, || {
            Ok(Arc::new(GridEngineSession::new()) as Arc<dyn ClusterSession>)
        })
    }

    pub fn with_factory<F>(config: ClusterConfig, factory: F) -> Self
    where
        F: Fn() -> ClusterResult<Arc<dyn ClusterSession>> + Send + Sync + 'static,
    {
        Self {
            config,
            status_log: None,
            session: OnceCell::new(),
            factory: Box::new(factory),
        }
    }

    /// Gateway bound to an already open session.
    pub fn with_session(config: ClusterConfig, session: Arc<dyn ClusterSession>) -> Self {
        Self {
            config,
            status_log: None,
            session: OnceCell::new_with(Some(session)),
            factory: Box::new(|| {
                Err(ClusterError::InvalidJob("session already provided".to_string()))
            }),
        }
    }

    pub fn with_status_log(mut self, path: PathBuf) -> Self {
        self.status_log = Some(path);
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session.initialized()
    }

    /// The shared session, opened on first call.
    pub async fn session(&self) -> ClusterResult<Arc<dyn ClusterSession>> {
        let session = self
            .session
            .get_or_try_init(|| async {
                tracing::info!("Opening cluster session");
                (self.factory)()
            })
            .await?;
        Ok(session.clone())
    }

    fn log_dir(&self) -> Result<&PathBuf> {
        self.config.log_dir.as_ref().ok_or_else(|| {
            PipelineError::Internal("cluster job without a cluster log directory".to_string())
        })
    }

    /// Submission script path for the job tagged `tag`.
    pub fn script_path(&self, tag: &str) -> Result<PathBuf> {
        Ok(self.log_dir()?.join(format!("{}.sh", tag)))
    }

    /// Merged output log path for the job tagged `tag`.
    pub fn log_path(&self, tag: &str) -> Result<PathBuf> {
        Ok(self.log_dir()?.join(format!("{}.log", tag)))
    }

    /// Write the submission script for `tag`; returns its path.
    pub async fn write_script(&self, tag: &str, prefix: &[String], args: &[String]) -> Result<PathBuf> {
        let path = self.script_path(tag)?;
        let log = self.log_path(tag)?;
        let contents = script::render_script(tag, &log, &self.config.exports, prefix, args);
        script::write_script(&path, &contents).await?;
        Ok(path)
    }

    /// The native specification for one attempt, if a template is configured.
    pub fn native_spec(&self, threads: u32, restart_count: u32) -> Result<Option<String>> {
        let Some(template) = &self.config.native_spec else {
            return Ok(None);
        };
        let status_log = self
            .status_log
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        script::render_native_spec(
            template,
            &SpecParams {
                threads,
                status_log: &status_log,
                restart_count,
            },
        )
        .map(Some)
    }

    /// Create a template and submit it. Denied submissions are retried
    /// with a fixed backoff for as long as it takes; any other failure
    /// releases the template and is returned.
    pub async fn submit(&self, template: JobTemplate) -> ClusterResult<Submission> {
        let session = self.session().await?;
        let name = template.job_name.clone();
        let spec = template.native_specification.clone().unwrap_or_default();
        let template_id = session.create_template(template).await?;

        loop {
            match session.run_job(template_id).await {
                Ok(job) => {
                    tracing::debug!(job = %name, remote_id = %job, "Cluster job submitted");
                    return Ok(Submission {
                        template: template_id,
                        job,
                    });
                }
                Err(ClusterError::Denied(reason)) => {
                    let denied = PipelineError::SubmissionDenied(reason);
                    tracing::warn!(
                        job = %name,
                        native_spec = %spec,
                        error = %denied,
                        backoff_ms = self.config.submit_backoff_ms,
                        "Submission denied, retrying"
                    );
                    tokio::time::sleep(self.config.submit_backoff()).await;
                }
                Err(e) => {
                    self.release(template_id).await;
                    return Err(e);
                }
            }
        }
    }

    /// Query a job's state. Communication faults are retried after a
    /// short pause; a non-terminal answer is followed by the configured
    /// query sleep.
    pub async fn poll(&self, job: &RemoteJobId) -> ClusterResult<RemoteJobState> {
        let session = self.session().await?;
        loop {
            match session.job_state(job).await {
                Ok(state) => {
                    if !state.is_terminal() && self.config.query_sleep_ms > 0 {
                        tokio::time::sleep(self.config.query_sleep()).await;
                    }
                    return Ok(state);
                }
                Err(ClusterError::Communication(reason)) => {
                    tracing::warn!(
                        remote_id = %job,
                        reason = %reason,
                        "Could not communicate with the cluster scheduler to check job status"
                    );
                    tokio::time::sleep(self.config.comm_retry()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Destroy a template. Failures are logged only.
    pub async fn release(&self, template: TemplateId) {
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "No session to release template");
                return;
            }
        };
        if let Err(e) = session.delete_template(template).await {
            tracing::warn!(template = template.0, error = %e, "Failed to delete job template");
        }
    }

    /// Exit the session if one was opened.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.get() {
            if let Err(e) = session.exit().await {
                tracing::warn!(error = %e, "Cluster session exit failed");
            } else {
                tracing::info!("Cluster session closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Denies the first `denials` submissions and fails the first
    /// `comm_faults` state queries.
    #[derive(Default)]
    struct FlakySession {
        denials: AtomicU32,
        comm_faults: AtomicU32,
        runs: AtomicU32,
        queries: AtomicU32,
        deleted: Mutex<Vec<TemplateId>>,
    }

    #[async_trait]
    impl ClusterSession for FlakySession {
        async fn create_template(&self, _template: JobTemplate) -> ClusterResult<TemplateId> {
            Ok(TemplateId(7))
        }

        async fn delete_template(&self, template: TemplateId) -> ClusterResult<()> {
            self.deleted.lock().unwrap().push(template);
            Ok(())
        }

        async fn run_job(&self, _template: TemplateId) -> ClusterResult<RemoteJobId> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.denials.load(Ordering::SeqCst) > 0 {
                self.denials.fetch_sub(1, Ordering::SeqCst);
                return Err(ClusterError::Denied("queue full".to_string()));
            }
            Ok(RemoteJobId("100".to_string()))
        }

        async fn job_state(&self, _job: &RemoteJobId) -> ClusterResult<RemoteJobState> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.comm_faults.load(Ordering::SeqCst) > 0 {
                self.comm_faults.fetch_sub(1, Ordering::SeqCst);
                return Err(ClusterError::Communication("qmaster down".to_string()));
            }
            Ok(RemoteJobState::Done)
        }

        async fn exit(&self) -> ClusterResult<()> {
            Ok(())
        }
    }

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            log_dir: Some(PathBuf::from("/scratch/logs")),
            native_spec: Some("-pe openmp $numthreads -v R=$restart_count".to_string()),
            submit_backoff_ms: 1,
            comm_retry_ms: 1,
            query_sleep_ms: 0,
            ..Default::default()
        }
    }

    fn template() -> JobTemplate {
        JobTemplate {
            remote_command: PathBuf::from("/scratch/logs/a.sh"),
            job_name: "a".to_string(),
            output_path: PathBuf::from("/scratch/logs/a.log"),
            native_specification: None,
        }
    }

    #[tokio::test]
    async fn session_opened_lazily_once() {
        let opened = Arc::new(AtomicU32::new(0));
        let counter = opened.clone();
        let gateway = ClusterGateway::with_factory(fast_config(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FlakySession::default()) as Arc<dyn ClusterSession>)
        });

        assert!(!gateway.is_connected());
        gateway.session().await.unwrap();
        gateway.session().await.unwrap();
        assert!(gateway.is_connected());
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denied_submissions_retried_until_accepted() {
        let session = Arc::new(FlakySession::default());
        session.denials.store(3, Ordering::SeqCst);
        let gateway = ClusterGateway::with_session(fast_config(), session.clone());

        let submission = gateway.submit(template()).await.unwrap();
        assert_eq!(submission.job, RemoteJobId("100".to_string()));
        assert_eq!(session.runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn communication_faults_retried_while_polling() {
        let session = Arc::new(FlakySession::default());
        session.comm_faults.store(2, Ordering::SeqCst);
        let gateway = ClusterGateway::with_session(fast_config(), session.clone());

        let state = gateway.poll(&RemoteJobId("100".to_string())).await.unwrap();
        assert_eq!(state, RemoteJobState::Done);
        assert_eq!(session.queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn native_spec_and_paths() {
        let gateway = ClusterGateway::new(fast_config()).with_status_log(PathBuf::from("/s.log"));
        assert_eq!(
            gateway.native_spec(4, 1).unwrap().as_deref(),
            Some("-pe openmp 4 -v R=1")
        );
        assert_eq!(
            gateway.script_path("sv_2").unwrap(),
            PathBuf::from("/scratch/logs/sv_2.sh")
        );
        assert_eq!(
            gateway.log_path("sv_2").unwrap(),
            PathBuf::from("/scratch/logs/sv_2.log")
        );

        let bare = ClusterGateway::new(ClusterConfig::default());
        assert!(bare.native_spec(4, 0).unwrap().is_none());
        assert!(bare.script_path("sv_2").is_err());
    }

    #[tokio::test]
    async fn release_deletes_template() {
        let session = Arc::new(FlakySession::default());
        let gateway = ClusterGateway::with_session(fast_config(), session.clone());
        gateway.release(TemplateId(7)).await;
        assert_eq!(*session.deleted.lock().unwrap(), vec![TemplateId(7)]);
    }
}
