use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Admission-loop settings for one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum number of concurrently running local jobs. Also the size
    /// of the thread budget.
    pub concurrency_limit: u32,
    /// Sleep between the admission and reap scans.
    pub poll_interval_ms: u64,
    /// Ceiling on concurrently running throttle-class jobs.
    pub throttle: Option<u32>,
    /// Emit progress events while running.
    pub report_progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            poll_interval_ms: 10,
            throttle: None,
            report_progress: true,
        }
    }
}

impl RunConfig {
    pub fn new(concurrency_limit: u32, poll_interval: Duration) -> Self {
        Self {
            concurrency_limit,
            poll_interval_ms: poll_interval.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn with_throttle(mut self, throttle: u32) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Which instrumentation wrappers prefix each job's command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Wrap commands with the timing tool.
    pub time: bool,
    /// Wrap commands with the hardware-counter profiler.
    pub perf: bool,
    pub time_binary: PathBuf,
    pub perf_binary: PathBuf,
    /// Number of counter lines expected from the profiler.
    pub perf_counter_lines: usize,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            time: false,
            perf: false,
            time_binary: PathBuf::from("/usr/bin/time"),
            perf_binary: PathBuf::from("/usr/bin/perf"),
            perf_counter_lines: 12,
        }
    }
}

/// How completion markers are recognised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// A marker file is complete once one of its lines contains this token.
    pub success_token: String,
    /// Read attempts for cluster jobs, whose markers may lag on shared
    /// filesystems.
    pub tries: u32,
    pub delay_ms: u64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            success_token: "END of output".to_string(),
            tries: 20,
            delay_ms: 5000,
        }
    }
}

impl MarkerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Remote resource-manager settings. Jobs only target the cluster when
/// `log_dir` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Directory receiving submission scripts and merged job logs.
    pub log_dir: Option<PathBuf>,
    /// Native specification template. Supports `$numthreads`,
    /// `$status_log_filename` and `$restart_count`.
    pub native_spec: Option<String>,
    /// Backoff after the resource manager denies a submission.
    pub submit_backoff_ms: u64,
    /// Backoff after a communication fault while querying job state.
    pub comm_retry_ms: u64,
    /// Pause after each state query that finds a job still active.
    pub query_sleep_ms: u64,
    /// Restart budget for cluster jobs that don't set their own.
    pub max_restarts: u32,
    /// Environment exports written into every submission script.
    pub exports: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            native_spec: None,
            submit_backoff_ms: 100_000,
            comm_retry_ms: 1000,
            query_sleep_ms: 50,
            max_restarts: 3,
            exports: vec!["O64_OMP_SET_AFFINITY=false".to_string()],
        }
    }
}

impl ClusterConfig {
    pub fn is_enabled(&self) -> bool {
        self.log_dir.is_some()
    }

    pub fn submit_backoff(&self) -> Duration {
        Duration::from_millis(self.submit_backoff_ms)
    }

    pub fn comm_retry(&self) -> Duration {
        Duration::from_millis(self.comm_retry_ms)
    }

    pub fn query_sleep(&self) -> Duration {
        Duration::from_millis(self.query_sleep_ms)
    }
}

/// Top-level configuration for a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub run: RunConfig,
    pub instrument: InstrumentConfig,
    pub marker: MarkerConfig,
    pub cluster: ClusterConfig,
    /// Human-readable pipeline report that stage reports are appended to.
    pub report_path: Option<PathBuf>,
    /// JSON-lines file receiving progress events.
    pub status_log: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
