use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{ClusterGateway, JobTemplate, RemoteJobState, Submission};
use crate::config::MarkerConfig;
use crate::error::{PipelineError, Result};
use crate::worker::instrument::{ExecContext, PerformanceRecorder, PerformanceSample};
use crate::worker::marker::check_completion_marker;
use crate::worker::process::{LocalProcess, ProcessRunner};

/// Index of a job within its batch.
pub type JobId = usize;

/// Lines of stderr kept after a job ends, enough for any instrumentation trailer.
const STDERR_TAIL_LINES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Started,
    Running,
    Restarting,
    Complete,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Started => write!(f, "started"),
            JobState::Running => write!(f, "running"),
            JobState::Restarting => write!(f, "restarting"),
            JobState::Complete => write!(f, "complete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTarget {
    #[default]
    Local,
    Cluster,
}

/// Result of asking a job to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Running locally or submitted to the cluster.
    Started,
    /// Cluster start failed but the restart budget allows another
    /// attempt; the job is pending again.
    Deferred,
    /// Could not start; the job is complete and failed.
    Failed,
}

/// Collaborators a job needs to start and to be polled.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub recorder: &'a PerformanceRecorder,
    pub marker: &'a MarkerConfig,
    pub cluster: Option<&'a ClusterGateway>,
}

#[derive(Debug)]
enum Execution {
    Local(LocalProcess),
    Cluster(Submission),
}

/// One external command and its lifecycle.
#[derive(Debug)]
pub struct Job {
    seq: usize,
    name: String,
    tag: String,
    args: Vec<String>,
    cost: u32,
    dependency: Option<JobId>,
    throttled: bool,
    target: JobTarget,
    expected_output: Option<PathBuf>,
    marker: Option<PathBuf>,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
    max_restarts: u32,
    remaining_restarts: u32,

    state: JobState,
    execution: Option<Execution>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    clock: Option<Instant>,
    run_time: Option<Duration>,
    output_found: bool,
    marker_complete: bool,
    failure: Option<PipelineError>,
    stderr_tail: Option<String>,
    sample: Option<PerformanceSample>,
}

impl Job {
    /// A local job with a generated unique tag.
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        let name = name.into();
        let suffix = Uuid::new_v4().simple().to_string();
        let tag = format!("{}_{}", sanitize(&name), &suffix[..8]);
        Self {
            seq: 0,
            name,
            tag,
            args,
            cost: 1,
            dependency: None,
            throttled: false,
            target: JobTarget::Local,
            expected_output: None,
            marker: None,
            stdout_path: None,
            stderr_path: None,
            max_restarts: 3,
            remaining_restarts: 3,
            state: JobState::Pending,
            execution: None,
            started_at: None,
            finished_at: None,
            clock: None,
            run_time: None,
            output_found: false,
            marker_complete: false,
            failure: None,
            stderr_tail: None,
            sample: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Thread units consumed while running locally. Zero is raised to one.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost.max(1);
        self
    }

    /// Admit only once job `dependency` of the same batch is complete.
    pub fn after(mut self, dependency: JobId) -> Self {
        self.dependency = Some(dependency);
        self
    }

    /// Subject this job to the batch's throttle sub-limit.
    pub fn throttled(mut self) -> Self {
        self.throttled = true;
        self
    }

    pub fn on_cluster(mut self) -> Self {
        self.target = JobTarget::Cluster;
        self
    }

    pub fn with_target(mut self, target: JobTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_expected_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_output = Some(path.into());
        self
    }

    pub fn with_marker(mut self, path: impl Into<PathBuf>) -> Self {
        self.marker = Some(path.into());
        self
    }

    pub fn with_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }

    /// Stderr file for local runs. Cluster jobs always log to
    /// `<log_dir>/<tag>.log`.
    pub fn with_stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_path = Some(path.into());
        self
    }

    pub fn with_max_restarts(mut self, restarts: u32) -> Self {
        self.max_restarts = restarts;
        self.remaining_restarts = restarts;
        self
    }

    pub(crate) fn assign_seq(&mut self, seq: usize) {
        self.seq = seq;
    }

    pub(crate) fn clamp_cost(&mut self, limit: u32) {
        if self.cost > limit {
            tracing::warn!(job = %self.name, cost = self.cost, limit, "Job cost exceeds concurrency limit, clamping");
            self.cost = limit;
        }
    }

    /// 1-based position in the batch.
    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn dependency(&self) -> Option<JobId> {
        self.dependency
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn target(&self) -> JobTarget {
        self.target
    }

    pub fn expected_output(&self) -> Option<&Path> {
        self.expected_output.as_deref()
    }

    pub fn marker(&self) -> Option<&Path> {
        self.marker.as_deref()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == JobState::Complete
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn run_time(&self) -> Option<Duration> {
        self.run_time
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    pub fn remaining_restarts(&self) -> u32 {
        self.remaining_restarts
    }

    /// Resubmissions performed so far.
    pub fn restarts(&self) -> u32 {
        self.max_restarts - self.remaining_restarts
    }

    pub fn output_found(&self) -> bool {
        self.output_found
    }

    /// The authoritative success flag.
    pub fn marker_complete(&self) -> bool {
        self.marker_complete
    }

    pub fn failure(&self) -> Option<&PipelineError> {
        self.failure.as_ref()
    }

    /// Last lines of the job's stderr, kept once the job is complete.
    pub fn stderr_tail(&self) -> Option<&str> {
        self.stderr_tail.as_deref()
    }

    /// Exit status of a finished local process.
    pub fn exit_code(&self) -> Option<i32> {
        match &self.execution {
            Some(Execution::Local(process)) => process.exit_status().and_then(|s| s.code()),
            _ => None,
        }
    }

    /// The full command line as it will be executed, instrumentation included.
    pub fn command_line(&self, recorder: &PerformanceRecorder) -> String {
        let context = match self.target {
            JobTarget::Local => ExecContext::Local,
            JobTarget::Cluster => ExecContext::Script,
        };
        recorder.wrap(&self.args, context).join(" ")
    }

    /// Log a failure. The first terminal one is kept for the report;
    /// informational ones are only logged.
    fn record_failure(&mut self, error: PipelineError) {
        if !error.is_terminal() {
            tracing::warn!(job = %self.name, tag = %self.tag, error = %error, "Job warning");
            return;
        }
        tracing::error!(job = %self.name, tag = %self.tag, error = %error, "Job failed");
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn mark_started(&mut self) {
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        self.clock = Some(Instant::now());
    }

    /// Start the job. The caller guarantees the dependency is complete.
    ///
    /// A local spawn error is terminal. A cluster submission error
    /// consumes one restart and leaves the job pending for the next
    /// admission scan, until the budget is gone.
    pub async fn start(&mut self, ctx: &JobContext<'_>) -> StartOutcome {
        self.state = JobState::Started;
        match self.target {
            JobTarget::Local => self.start_local(ctx.recorder),
            JobTarget::Cluster => {
                let result = match ctx.cluster {
                    Some(gateway) => self.submit(gateway, ctx.recorder, true).await,
                    None => Err(PipelineError::Internal(
                        "cluster job in a batch without a cluster gateway".to_string(),
                    )),
                };
                match result {
                    Ok(()) => StartOutcome::Started,
                    Err(e) if self.remaining_restarts > 0 => {
                        self.remaining_restarts -= 1;
                        tracing::warn!(
                            job = %self.name,
                            error = %e,
                            remaining_restarts = self.remaining_restarts,
                            "Cluster start failed, will retry"
                        );
                        self.state = JobState::Pending;
                        StartOutcome::Deferred
                    }
                    Err(e) => {
                        self.record_failure(e);
                        self.fail_without_running();
                        StartOutcome::Failed
                    }
                }
            }
        }
    }

    fn start_local(&mut self, recorder: &PerformanceRecorder) -> StartOutcome {
        let args = recorder.wrap(&self.args, ExecContext::Local);
        match ProcessRunner::spawn(&args, self.stdout_path.as_deref(), self.stderr_path.as_deref()) {
            Ok(process) => {
                self.execution = Some(Execution::Local(process));
                self.mark_started();
                StartOutcome::Started
            }
            Err(source) => {
                self.record_failure(PipelineError::SpawnFailure {
                    job: self.name.clone(),
                    source,
                });
                self.fail_without_running();
                StartOutcome::Failed
            }
        }
    }

    fn fail_without_running(&mut self) {
        self.state = JobState::Complete;
        self.finished_at = Some(Utc::now());
    }

    /// Create a template for the current attempt and submit it. The
    /// submission script is written only on the first attempt.
    async fn submit(
        &mut self,
        gateway: &ClusterGateway,
        recorder: &PerformanceRecorder,
        write_script: bool,
    ) -> Result<()> {
        let script = if write_script {
            let prefix = recorder.wrap(&[], ExecContext::Script);
            gateway.write_script(&self.tag, &prefix, &self.args).await?
        } else {
            gateway.script_path(&self.tag)?
        };
        let log = gateway.log_path(&self.tag)?;

        let template = JobTemplate {
            remote_command: script,
            job_name: self.tag.clone(),
            output_path: log,
            native_specification: gateway.native_spec(self.cost, self.restarts())?,
        };
        let submission = gateway.submit(template).await?;
        tracing::debug!(job = %self.name, remote_id = %submission.job, attempt = self.restarts() + 1, "Cluster job running");
        self.execution = Some(Execution::Cluster(submission));
        self.mark_started();
        Ok(())
    }

    /// Non-blocking liveness check. Finalizes the job the first time it
    /// is observed finished; a cluster job that finished without its
    /// marker is resubmitted here while restarts remain.
    pub async fn is_still_running(&mut self, ctx: &JobContext<'_>) -> bool {
        match self.state {
            JobState::Running => {}
            JobState::Complete | JobState::Pending => return false,
            JobState::Started | JobState::Restarting => return true,
        }

        match &mut self.execution {
            Some(Execution::Local(process)) => {
                if process.poll().is_none() {
                    return true;
                }
                self.finalize(ctx).await;
                false
            }
            Some(Execution::Cluster(submission)) => {
                let remote = submission.job.clone();
                let template = submission.template;
                let Some(gateway) = ctx.cluster else {
                    self.record_failure(PipelineError::Internal(
                        "cluster job polled without a cluster gateway".to_string(),
                    ));
                    self.finalize(ctx).await;
                    return false;
                };
                match gateway.poll(&remote).await {
                    Ok(state) if !state.is_terminal() => true,
                    Ok(state) => self.on_cluster_terminal(ctx, gateway, template, state).await,
                    Err(e) => {
                        gateway.release(template).await;
                        self.record_failure(e.into());
                        self.finalize(ctx).await;
                        false
                    }
                }
            }
            None => {
                self.finalize(ctx).await;
                false
            }
        }
    }

    async fn on_cluster_terminal(
        &mut self,
        ctx: &JobContext<'_>,
        gateway: &ClusterGateway,
        template: crate::cluster::TemplateId,
        state: RemoteJobState,
    ) -> bool {
        let complete = self
            .check_completion_marker(&ctx.marker.success_token, ctx.marker.tries, ctx.marker.delay())
            .await;
        gateway.release(template).await;

        if complete {
            self.finalize(ctx).await;
            return false;
        }

        if self.marker.is_some() && self.remaining_restarts > 0 {
            self.remaining_restarts -= 1;
            self.state = JobState::Restarting;
            tracing::warn!(
                job = %self.name,
                remote_state = ?state,
                restart = self.restarts(),
                remaining_restarts = self.remaining_restarts,
                marker = ?self.marker,
                "Job was restarted"
            );
            match self.submit(gateway, ctx.recorder, false).await {
                Ok(()) => return true,
                Err(e) => self.record_failure(e),
            }
        } else {
            self.record_failure(PipelineError::ExecutionFailure {
                job: self.name.clone(),
                exhausted: self.remaining_restarts == 0,
            });
        }
        self.finalize(ctx).await;
        false
    }

    async fn finalize(&mut self, ctx: &JobContext<'_>) {
        self.finished_at = Some(Utc::now());
        self.run_time = self.clock.map(|c| c.elapsed());
        self.state = JobState::Complete;

        let stderr = match &mut self.execution {
            Some(Execution::Local(process)) => process.stderr_text().await,
            // The resource manager merges both streams into the job log.
            Some(Execution::Cluster(_)) => match ctx.cluster.map(|g| g.log_path(&self.tag)) {
                Some(Ok(path)) => tokio::fs::read_to_string(path).await.ok(),
                _ => None,
            },
            None => None,
        };
        self.stderr_tail = stderr.map(|text| tail(&text, STDERR_TAIL_LINES));

        if self.target == JobTarget::Local && self.marker.is_some() {
            self.check_completion_marker(&ctx.marker.success_token, 1, Duration::ZERO)
                .await;
        }
        self.performance_sample(ctx.recorder);
    }

    /// Whether the expected output file exists. Informational only.
    pub fn check_output_found(&mut self) -> bool {
        if let Some(path) = &self.expected_output {
            self.output_found = path.exists();
            if !self.output_found {
                self.record_failure(PipelineError::MissingExpectedOutput(path.clone()));
            }
        }
        self.output_found
    }

    /// Re-read the completion marker up to `tries` times. Sets the flag
    /// the batch success predicate is built from. A job without a marker
    /// path can never be marked complete.
    pub async fn check_completion_marker(&mut self, token: &str, tries: u32, delay: Duration) -> bool {
        let Some(path) = &self.marker else {
            return false;
        };
        self.marker_complete = check_completion_marker(path, token, tries, delay).await;
        self.marker_complete
    }

    pub(crate) fn note_incomplete_marker(&mut self) {
        if let (false, Some(path)) = (self.marker_complete, &self.marker) {
            let path = path.clone();
            self.record_failure(PipelineError::MarkerIncomplete(path));
        }
    }

    /// The job's performance row. Extracted on first call, cached after.
    pub fn performance_sample(&mut self, recorder: &PerformanceRecorder) -> &PerformanceSample {
        let started = self
            .started_at
            .map(|t| t.timestamp_micros() as f64 / 1_000_000.0)
            .unwrap_or(0.0);
        let tag = &self.tag;
        let stderr = self.stderr_tail.as_deref();
        self.sample
            .get_or_insert_with(|| recorder.sample(tag, started, stderr))
    }

    pub fn cached_sample(&self) -> Option<&PerformanceSample> {
        self.sample.as_ref()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
