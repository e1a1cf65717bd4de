use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stage_runner::config::PipelineConfig;
use stage_runner::manifest::Manifest;
use stage_runner::pipeline::Pipeline;
use stage_runner::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "stage-runner")]
#[command(version)]
#[command(about = "Runs batches of external-process jobs locally or on a Grid Engine cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run every stage of a manifest
    Run(RunArgs),

    /// Validate a manifest and print each stage's first command line
    Check {
        /// Path to the JSON manifest
        #[arg(long, short = 'm')]
        manifest: PathBuf,

        /// JSON configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the JSON manifest
    #[arg(long, short = 'm')]
    manifest: PathBuf,

    /// JSON configuration file; flags below override it
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Concurrency limit for stages that don't set their own
    #[arg(long, short = 'T')]
    threads: Option<u32>,

    /// Sleep between admission and reap scans, in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Cap on concurrently running throttle-class jobs
    #[arg(long)]
    throttle: Option<u32>,

    /// Wrap each command with the timing tool
    #[arg(long)]
    time: bool,

    /// Wrap each command with the hardware-counter profiler
    #[arg(long)]
    perf: bool,

    /// Run jobs on the cluster, writing scripts and logs here
    #[arg(long)]
    cluster_log_dir: Option<PathBuf>,

    /// Native specification template ($numthreads, $status_log_filename, $restart_count)
    #[arg(long, requires = "cluster_log_dir")]
    native_spec: Option<String>,

    /// Token that marks a job's output as complete
    #[arg(long)]
    success_token: Option<String>,

    /// Pipeline report that stage reports are appended to
    #[arg(long)]
    report: Option<PathBuf>,

    /// JSON-lines file receiving progress events
    #[arg(long)]
    status_log: Option<PathBuf>,
}

impl RunArgs {
    fn pipeline_config(&self) -> stage_runner::error::Result<PipelineConfig> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(threads) = self.threads {
            config.run.concurrency_limit = threads;
        }
        if let Some(ms) = self.poll_ms {
            config.run.poll_interval_ms = ms;
        }
        if self.throttle.is_some() {
            config.run.throttle = self.throttle;
        }
        config.instrument.time |= self.time;
        config.instrument.perf |= self.perf;
        if self.cluster_log_dir.is_some() {
            config.cluster.log_dir = self.cluster_log_dir.clone();
        }
        if self.native_spec.is_some() {
            config.cluster.native_spec = self.native_spec.clone();
        }
        if let Some(token) = &self.success_token {
            config.marker.success_token = token.clone();
        }
        if self.report.is_some() {
            config.report_path = self.report.clone();
        }
        if self.status_log.is_some() {
            config.status_log = self.status_log.clone();
        }
        Ok(config)
    }
}

fn load_config(path: Option<&std::path::Path>) -> stage_runner::error::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path),
        None => Ok(PipelineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run) => {
            if !run_manifest(run).await? {
                std::process::exit(1);
            }
        }
        Commands::Check { manifest, config } => check_manifest(&manifest, config.as_deref())?,
    }
    Ok(())
}

/// Run every stage; returns whether all of them succeeded.
async fn run_manifest(args: RunArgs) -> Result<bool, Box<dyn std::error::Error>> {
    let manifest = Manifest::load(&args.manifest)?;
    let config = args.pipeline_config()?;
    let pipeline = Arc::new(Pipeline::new(config));

    let started = std::time::Instant::now();
    let mut succeeded = true;
    let mut background = Vec::new();

    for stage in &manifest.stages {
        let mut batch = stage.build(&pipeline)?;
        let run = stage.run_config(&pipeline.config().run);
        if stage.background {
            tracing::info!(stage = %stage.name, "Starting stage in background");
            background.push(pipeline.spawn_stage(batch, run));
            continue;
        }

        let ok = pipeline.run_stage_with(&mut batch, &run).await?;
        succeeded &= report_stage(&batch, ok);
    }

    for handle in background {
        let (batch, outcome) = handle.await?;
        succeeded &= report_stage(&batch, outcome?);
    }

    pipeline.shutdown().await;
    tracing::info!(
        elapsed = %stage_runner::scheduler::format_duration(started.elapsed()),
        succeeded,
        "Pipeline finished"
    );
    Ok(succeeded)
}

fn report_stage(batch: &Scheduler, ok: bool) -> bool {
    if !ok {
        eprintln!("Stage {} failed", batch.group());
        eprint!("{}", batch.simple_report());
    }
    ok
}

fn check_manifest(
    path: &std::path::Path,
    config: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = Manifest::load(path)?;
    let pipeline = Pipeline::new(load_config(config)?);

    for stage in &manifest.stages {
        let batch = stage.build(&pipeline)?;
        let run = stage.run_config(&pipeline.config().run);
        println!(
            "{} ({} jobs, {} threads, poll {:?}{})",
            stage.name,
            batch.len(),
            run.concurrency_limit,
            run.poll_interval(),
            if stage.background { ", background" } else { "" }
        );
        if let Some(first) = batch.jobs().first() {
            println!("  {}", first.command_line(pipeline.recorder()));
        }
    }
    Ok(())
}
