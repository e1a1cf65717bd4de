use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cluster::ClusterGateway;
use crate::config::MarkerConfig;
use crate::error::{PipelineError, Result};
use crate::progress::ProgressReporter;
use crate::scheduler::job::{Job, JobContext, JobId, JobState, JobTarget, StartOutcome};
use crate::scheduler::report::format_duration;
use crate::worker::instrument::PerformanceRecorder;

/// Width of the job name in START/STOP lines.
const NAME_WIDTH: usize = 30;

/// Owns one batch of jobs and runs them to completion.
pub struct Scheduler {
    group: String,
    pub(crate) jobs: Vec<Job>,
    pub(crate) recorder: PerformanceRecorder,
    pub(crate) marker: MarkerConfig,
    cluster: Option<Arc<ClusterGateway>>,
    progress: Option<ProgressReporter>,
    throttle: Option<u32>,
    pub(crate) threads: u32,
    pub(crate) elapsed: Duration,
    pub(crate) cpu_time: Duration,
}

/// Loop counters. Signed so that an accounting bug shows up as a
/// negative value instead of wrapping.
#[derive(Debug, Default)]
struct Counters {
    active: i64,
    active_local: i64,
    pending: i64,
    finished: i64,
    throttled: i64,
    available: i64,
}

impl Scheduler {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            jobs: Vec::new(),
            recorder: PerformanceRecorder::default(),
            marker: MarkerConfig::default(),
            cluster: None,
            progress: None,
            throttle: None,
            threads: 0,
            elapsed: Duration::ZERO,
            cpu_time: Duration::ZERO,
        }
    }

    pub fn with_recorder(mut self, recorder: PerformanceRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_marker(mut self, marker: MarkerConfig) -> Self {
        self.marker = marker;
        self
    }

    pub fn with_cluster(mut self, gateway: Arc<ClusterGateway>) -> Self {
        self.cluster = Some(gateway);
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Cap on concurrently running throttle-class jobs.
    pub fn with_throttle(mut self, max: u32) -> Self {
        self.throttle = Some(max);
        self
    }

    pub fn set_throttle(&mut self, max: Option<u32>) {
        self.throttle = max;
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn recorder(&self) -> &PerformanceRecorder {
        &self.recorder
    }

    /// Append a job. Its dependency must already be in the batch, which
    /// also rules out cycles.
    pub fn add(&mut self, mut job: Job) -> Result<JobId> {
        let id = self.jobs.len();
        if let Some(dep) = job.dependency() {
            if dep >= id {
                return Err(PipelineError::UnknownDependency {
                    job: job.name().to_string(),
                    dependency: dep,
                });
            }
        }
        if job.marker().is_none() {
            tracing::warn!(job = %job.name(), "Job has no completion marker and can never be reported successful");
        }
        job.assign_seq(id + 1);
        self.jobs.push(job);
        Ok(id)
    }

    pub fn add_all(&mut self, jobs: impl IntoIterator<Item = Job>) -> Result<Vec<JobId>> {
        jobs.into_iter().map(|job| self.add(job)).collect()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Wall-clock time of the last run.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Sum of every job's run time in the last run.
    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    /// Overall success: every job's completion marker was found. Exit
    /// codes and output files play no part.
    pub fn succeeded(&self) -> bool {
        self.jobs.iter().all(|j| j.marker_complete())
    }

    /// Run the batch until every job is complete.
    ///
    /// Each iteration admits what it can, sleeps `poll_interval`, then
    /// polls each active job. Nothing blocks on child exit, so batches
    /// may run concurrently on separate tasks.
    pub async fn run(&mut self, concurrency_limit: u32, poll_interval: Duration) -> Result<()> {
        if self.jobs.is_empty() {
            tracing::warn!(group = %self.group, "Number of jobs is 0, skipping stage");
            return Ok(());
        }
        if concurrency_limit == 0 {
            return Err(PipelineError::InvalidConcurrency(self.group.clone()));
        }

        for job in &mut self.jobs {
            if job.target() == JobTarget::Local {
                job.clamp_cost(concurrency_limit);
            }
        }

        let started = Instant::now();
        let total = self.jobs.len();
        let limit = i64::from(concurrency_limit);
        self.threads = concurrency_limit;

        let mut active: Vec<JobId> = Vec::new();
        let mut c = Counters {
            available: limit,
            ..Default::default()
        };
        // Jobs left in flight by an interrupted run are polled again.
        for (id, job) in self.jobs.iter().enumerate() {
            match job.state() {
                JobState::Pending => c.pending += 1,
                JobState::Complete => c.finished += 1,
                _ => {
                    active.push(id);
                    c.active += 1;
                    if job.target() == JobTarget::Local {
                        c.active_local += 1;
                        c.available -= i64::from(job.cost());
                    }
                    if job.is_throttled() && self.throttle.is_some() {
                        c.throttled += 1;
                    }
                }
            }
        }

        tracing::info!(group = %self.group, jobs = total, threads = concurrency_limit, "Starting multi-threaded process");
        if let Some(progress) = &mut self.progress {
            progress.jobs(0, total);
        }

        let outcome = loop {
            let mut progressed = false;
            if c.pending > 0 {
                progressed = self.admit(&mut active, &mut c, limit).await;
            }

            tokio::time::sleep(poll_interval).await;

            self.reap(&mut active, &mut c, limit).await;

            if let Some(progress) = &mut self.progress {
                progress.jobs(c.finished as usize, total);
            }

            if c.active == 0 && c.pending == 0 {
                break Ok(());
            }
            let stalled = !progressed && c.active == 0 && c.pending > 0;
            if stalled || c.active < 0 || c.pending < 0 || c.available < 0 {
                tracing::error!(
                    group = %self.group,
                    active = c.active,
                    pending = c.pending,
                    available = c.available,
                    "Invalid scheduler state"
                );
                break Err(PipelineError::Internal(format!(
                    "invalid scheduler state: active={} pending={} available={}",
                    c.active, c.pending, c.available
                )));
            }
        };

        self.elapsed = started.elapsed();
        self.cpu_time = self.jobs.iter().filter_map(|j| j.run_time()).sum();
        tracing::info!(
            group = %self.group,
            clock = %format_duration(self.elapsed),
            cpu = %format_duration(self.cpu_time),
            "Finished multi-threaded process"
        );
        outcome
    }

    /// Admission scan in insertion order. Returns whether any job was
    /// started or had a cluster start deferred.
    ///
    /// A dependency is satisfied once it is complete and the reap scan
    /// has removed it from `active`; a job that failed to start is
    /// still active until then.
    async fn admit(&mut self, active: &mut Vec<JobId>, c: &mut Counters, limit: i64) -> bool {
        let ctx = JobContext {
            recorder: &self.recorder,
            marker: &self.marker,
            cluster: self.cluster.as_deref(),
        };
        let total = self.jobs.len();
        let mut progressed = false;

        for id in 0..total {
            let job = &self.jobs[id];
            if job.state() != JobState::Pending {
                continue;
            }
            if let Some(dep) = job.dependency() {
                if !self.jobs[dep].is_complete() || active.contains(&dep) {
                    continue;
                }
            }
            let local = job.target() == JobTarget::Local;
            let cost = i64::from(job.cost());
            if local && (c.active_local >= limit || c.available < cost) {
                continue;
            }
            let throttled = job.is_throttled() && self.throttle.is_some();
            if let (true, Some(max)) = (throttled, self.throttle) {
                if c.throttled >= i64::from(max) {
                    continue;
                }
            }

            let job = &mut self.jobs[id];
            progressed = true;
            if job.start(&ctx).await == StartOutcome::Deferred {
                continue;
            }

            active.push(id);
            c.active += 1;
            c.pending -= 1;
            if local {
                c.active_local += 1;
                c.available -= cost;
            }
            if throttled {
                c.throttled += 1;
            }
            tracing::info!(
                "   START{:>5}: {:>width$},{:>4}Thr,{:>5}R,{:>5}T,{:>5}F,{:>5}Q",
                job.seq(),
                truncate(job.name(), NAME_WIDTH),
                limit,
                c.active,
                total,
                c.finished,
                c.pending,
                width = NAME_WIDTH
            );
        }
        progressed
    }

    /// Reap scan, newest first so removal doesn't disturb the iteration.
    async fn reap(&mut self, active: &mut Vec<JobId>, c: &mut Counters, limit: i64) {
        let ctx = JobContext {
            recorder: &self.recorder,
            marker: &self.marker,
            cluster: self.cluster.as_deref(),
        };
        let total = self.jobs.len();

        for i in (0..active.len()).rev() {
            let id = active[i];
            let job = &mut self.jobs[id];
            if job.is_still_running(&ctx).await {
                continue;
            }

            active.remove(i);
            c.active -= 1;
            c.finished += 1;
            if job.target() == JobTarget::Local {
                c.active_local -= 1;
                c.available = (c.available + i64::from(job.cost())).min(limit);
            }
            if job.is_throttled() && self.throttle.is_some() {
                c.throttled -= 1;
            }
            tracing::info!(
                "   STOP {:>5}: {:>width$},{:>4}Thr,{:>5}R,{:>5}T,{:>5}F,{:>5}Q {}",
                job.seq(),
                truncate(job.name(), NAME_WIDTH),
                limit,
                c.active,
                total,
                c.finished,
                c.pending,
                format_duration(job.run_time().unwrap_or_default()),
                width = NAME_WIDTH
            );
        }
    }
}

fn truncate(name: &str, width: usize) -> &str {
    match name.char_indices().nth(width) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn add_assigns_sequence_numbers() {
        let mut batch = Scheduler::new("Pairwise");
        let a = batch.add(Job::new("a", sh("true"))).unwrap();
        let b = batch.add(Job::new("b", sh("true")).after(a)).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(batch.job(a).unwrap().seq(), 1);
        assert_eq!(batch.job(b).unwrap().seq(), 2);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn forward_and_self_dependencies_rejected() {
        let mut batch = Scheduler::new("Pairwise");
        assert!(matches!(
            batch.add(Job::new("a", sh("true")).after(0)),
            Err(PipelineError::UnknownDependency { dependency: 0, .. })
        ));
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_skipped() {
        let mut batch = Scheduler::new("Empty");
        batch.run(4, Duration::from_millis(1)).await.unwrap();
        assert!(batch.succeeded());
        assert_eq!(batch.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn zero_concurrency_rejected() {
        let mut batch = Scheduler::new("Bad");
        batch.add(Job::new("a", sh("true"))).unwrap();
        assert!(matches!(
            batch.run(0, Duration::from_millis(1)).await,
            Err(PipelineError::InvalidConcurrency(_))
        ));
    }

    #[tokio::test]
    async fn oversized_job_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("big.stdout");
        let mut batch = Scheduler::new("Big");
        batch
            .add(
                Job::new("big", sh("echo 'END of output'"))
                    .with_cost(32)
                    .with_stdout(&marker)
                    .with_marker(&marker),
            )
            .unwrap();

        batch.run(2, Duration::from_millis(1)).await.unwrap();
        assert!(batch.succeeded());
        assert_eq!(batch.jobs()[0].cost(), 2);
    }

    #[test]
    fn name_truncation() {
        assert_eq!(truncate("short", 30), "short");
        assert_eq!(truncate("abcdef", 3), "abc");
    }
}
