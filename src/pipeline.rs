//! Top-level orchestrator.
//!
//! A [`Pipeline`] owns everything that outlives a single stage: the
//! configuration, the instrumentation stack, the cluster gateway with its
//! lazily opened session, the progress sink and the pipeline report file.
//! Stages borrow that state; nothing is looked up through globals.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cluster::ClusterGateway;
use crate::config::{PipelineConfig, RunConfig};
use crate::error::Result;
use crate::progress::{MultiSink, ProgressReporter, ProgressSink, StatusLogSink, TracingSink};
use crate::scheduler::{Job, Scheduler};
use crate::worker::PerformanceRecorder;

pub struct Pipeline {
    config: PipelineConfig,
    recorder: PerformanceRecorder,
    gateway: Option<Arc<ClusterGateway>>,
    sink: Arc<dyn ProgressSink>,
    report_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let recorder = PerformanceRecorder::from_config(&config.instrument);

        let gateway = config.cluster.is_enabled().then(|| {
            let mut gateway = ClusterGateway::new(config.cluster.clone());
            if let Some(path) = &config.status_log {
                gateway = gateway.with_status_log(path.clone());
            }
            Arc::new(gateway)
        });

        let mut sinks: Vec<Arc<dyn ProgressSink>> = vec![Arc::new(TracingSink)];
        if let Some(path) = &config.status_log {
            sinks.push(Arc::new(StatusLogSink::new(path.clone())));
        }

        Self {
            config,
            recorder,
            gateway,
            sink: Arc::new(MultiSink::new(sinks)),
            report_lock: Mutex::new(()),
        }
    }

    /// Replace the progress sink.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use an existing gateway; every job created afterwards targets the cluster.
    pub fn with_gateway(mut self, gateway: Arc<ClusterGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gateway(&self) -> Option<&Arc<ClusterGateway>> {
        self.gateway.as_ref()
    }

    pub fn recorder(&self) -> &PerformanceRecorder {
        &self.recorder
    }

    /// An empty batch wired to this pipeline's shared state.
    pub fn stage(&self, name: &str) -> Scheduler {
        let mut batch = Scheduler::new(name)
            .with_recorder(self.recorder.clone())
            .with_marker(self.config.marker.clone());
        if let Some(gateway) = &self.gateway {
            batch = batch.with_cluster(gateway.clone());
        }
        if self.config.run.report_progress {
            batch = batch.with_progress(ProgressReporter::new(self.sink.clone(), name));
        }
        if let Some(max) = self.config.run.throttle {
            batch = batch.with_throttle(max);
        }
        batch
    }

    /// A job targeting the cluster when one is configured, local otherwise.
    pub fn job(&self, name: impl Into<String>, args: Vec<String>) -> Job {
        let job = Job::new(name, args);
        match &self.gateway {
            Some(_) => job
                .on_cluster()
                .with_max_restarts(self.config.cluster.max_restarts),
            None => job,
        }
    }

    /// Run one stage with the configured run settings.
    pub async fn run_stage(&self, batch: &mut Scheduler) -> Result<bool> {
        let run = self.config.run.clone();
        self.run_stage_with(batch, &run).await
    }

    /// Run one stage and append its reports to the pipeline report.
    /// Returns the batch success predicate.
    pub async fn run_stage_with(&self, batch: &mut Scheduler, run: &RunConfig) -> Result<bool> {
        let events = ProgressReporter::new(self.sink.clone(), batch.group());
        events.stage_start();

        if let Some(first) = batch.jobs().first() {
            let line = format!("{}: {}\n", batch.group(), first.command_line(&self.recorder));
            self.append_report(&line).await?;
        }
        if run.throttle.is_some() {
            batch.set_throttle(run.throttle);
        }

        batch.run(run.concurrency_limit, run.poll_interval()).await?;

        if !batch.is_empty() {
            let mut report = batch.run_report().await;
            report.push_str(&batch.parse_report());
            self.append_report(&report).await?;
        }

        let succeeded = batch.succeeded();
        if succeeded {
            tracing::info!(stage = %batch.group(), "Stage complete");
        } else {
            tracing::error!(stage = %batch.group(), "Stage failed");
        }
        events.stage_complete();
        Ok(succeeded)
    }

    /// Run a stage on its own task. The batch comes back with the outcome
    /// so its reports can be read afterwards.
    pub fn spawn_stage(
        self: &Arc<Self>,
        mut batch: Scheduler,
        run: RunConfig,
    ) -> JoinHandle<(Scheduler, Result<bool>)> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = pipeline.run_stage_with(&mut batch, &run).await;
            (batch, outcome)
        })
    }

    async fn append_report(&self, text: &str) -> Result<()> {
        let Some(path) = &self.config.report_path else {
            return Ok(());
        };
        let _guard = self.report_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Close the cluster session if one was opened.
    pub async fn shutdown(&self) {
        if let Some(gateway) = &self.gateway {
            gateway.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("gateway", &self.gateway)
            .finish()
    }
}
