//! JSON description of the stages and jobs the binary runs.
//!
//! ```json
//! { "stages": [
//!     { "name": "Pairwise", "threads": 4,
//!       "jobs": [ { "name": "pair_1", "args": ["RefAligner", "-i", "a.cmap"],
//!                   "marker": "pair_1.stdout", "stdout": "pair_1.stdout" } ] }
//! ] }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::scheduler::{JobId, JobTarget, Scheduler};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// Concurrency limit; falls back to the run configuration.
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub throttle: Option<u32>,
    /// Run on its own task alongside the stages that follow.
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    pub args: Vec<String>,
    #[serde(default)]
    pub cost: Option<u32>,
    /// Name or tag of an earlier job in the same stage.
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub throttled: bool,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub marker: Option<PathBuf>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub target: Option<JobTarget>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        std::fs::read_to_string(path)?.parse()
    }

    fn validate(&self) -> Result<()> {
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(PipelineError::InvalidManifest("stage without a name".to_string()));
            }
            if stage.threads == Some(0) {
                return Err(PipelineError::InvalidConcurrency(stage.name.clone()));
            }
            if let Some(job) = stage.jobs.iter().find(|j| j.args.is_empty()) {
                return Err(PipelineError::InvalidManifest(format!(
                    "job {} in stage {} has no arguments",
                    job.name, stage.name
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for Manifest {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(s)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

impl StageSpec {
    /// `base` with this stage's thread count and throttle applied.
    pub fn run_config(&self, base: &RunConfig) -> RunConfig {
        let mut run = base.clone();
        if let Some(threads) = self.threads {
            run.concurrency_limit = threads;
        }
        if self.throttle.is_some() {
            run.throttle = self.throttle;
        }
        run
    }

    /// Build the stage's batch, resolving `after` references.
    pub fn build(&self, pipeline: &Pipeline) -> Result<Scheduler> {
        let mut batch = pipeline.stage(&self.name);
        let mut ids: HashMap<&str, JobId> = HashMap::new();

        for spec in &self.jobs {
            let mut job = pipeline.job(&spec.name, spec.args.clone());
            if let Some(tag) = &spec.tag {
                job = job.with_tag(tag.clone());
            }
            if let Some(cost) = spec.cost {
                job = job.with_cost(cost);
            }
            if let Some(after) = &spec.after {
                let Some(&dep) = ids.get(after.as_str()) else {
                    return Err(PipelineError::InvalidManifest(format!(
                        "job {} runs after unknown job {}",
                        spec.name, after
                    )));
                };
                job = job.after(dep);
            }
            if spec.throttled {
                job = job.throttled();
            }
            if let Some(path) = &spec.output {
                job = job.with_expected_output(path);
            }
            if let Some(path) = &spec.marker {
                job = job.with_marker(path);
            }
            if let Some(path) = &spec.stdout {
                job = job.with_stdout(path);
            }
            if let Some(path) = &spec.stderr {
                job = job.with_stderr(path);
            }
            if let Some(target) = spec.target {
                if target == JobTarget::Cluster && pipeline.gateway().is_none() {
                    return Err(PipelineError::InvalidManifest(format!(
                        "job {} targets the cluster but no cluster log directory is configured",
                        spec.name
                    )));
                }
                job = job.with_target(target);
            }
            if let Some(restarts) = spec.max_restarts {
                job = job.with_max_restarts(restarts);
            }

            let id = batch.add(job)?;
            ids.insert(spec.name.as_str(), id);
            if let Some(tag) = &spec.tag {
                ids.insert(tag.as_str(), id);
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    const MANIFEST: &str = r#"{
        "stages": [
            { "name": "Pairwise", "threads": 4, "throttle": 1,
              "jobs": [
                { "name": "a", "args": ["sh", "-c", "true"], "marker": "/tmp/a.stdout" },
                { "name": "b", "tag": "b_tag", "args": ["sh", "-c", "true"], "after": "a", "cost": 2, "throttled": true }
              ] },
            { "name": "Assembly", "background": true, "jobs": [] }
        ]
    }"#;

    #[test]
    fn parses_and_builds() {
        let manifest: Manifest = MANIFEST.parse().unwrap();
        assert_eq!(manifest.stages.len(), 2);
        assert!(manifest.stages[1].background);

        let pipeline = Pipeline::new(PipelineConfig::default());
        let batch = manifest.stages[0].build(&pipeline).unwrap();
        assert_eq!(batch.len(), 2);
        let b = batch.job(1).unwrap();
        assert_eq!(b.dependency(), Some(0));
        assert_eq!(b.tag(), "b_tag");
        assert_eq!(b.cost(), 2);
        assert!(b.is_throttled());

        let run = manifest.stages[0].run_config(&RunConfig::default());
        assert_eq!(run.concurrency_limit, 4);
        assert_eq!(run.throttle, Some(1));
        let run = manifest.stages[1].run_config(&RunConfig::default());
        assert_eq!(run.concurrency_limit, 1);
    }

    #[test]
    fn unknown_after_rejected() {
        let manifest: Manifest = r#"{ "stages": [ { "name": "S", "jobs": [
            { "name": "b", "args": ["true"], "after": "missing" } ] } ] }"#
            .parse()
            .unwrap();
        let pipeline = Pipeline::new(PipelineConfig::default());
        assert!(matches!(
            manifest.stages[0].build(&pipeline),
            Err(PipelineError::InvalidManifest(_))
        ));
    }

    #[test]
    fn invalid_manifests() {
        assert!(matches!(
            r#"{ "stages": [ { "name": "S", "threads": 0 } ] }"#.parse::<Manifest>(),
            Err(PipelineError::InvalidConcurrency(_))
        ));
        assert!(matches!(
            r#"{ "stages": [ { "name": "S", "jobs": [ { "name": "a", "args": [] } ] } ] }"#
                .parse::<Manifest>(),
            Err(PipelineError::InvalidManifest(_))
        ));
        assert!(matches!(
            "{ not json".parse::<Manifest>(),
            Err(PipelineError::Manifest(_))
        ));
    }

    #[test]
    fn cluster_target_needs_cluster() {
        let manifest: Manifest = r#"{ "stages": [ { "name": "S", "jobs": [
            { "name": "a", "args": ["true"], "target": "cluster" } ] } ] }"#
            .parse()
            .unwrap();
        let pipeline = Pipeline::new(PipelineConfig::default());
        assert!(manifest.stages[0].build(&pipeline).is_err());
    }
}
