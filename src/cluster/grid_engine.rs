//! Grid Engine session driven through its command-line clients.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use super::session::{
    ClusterError, ClusterResult, ClusterSession, JobTemplate, RemoteJobId, RemoteJobState,
    TemplateId,
};

/// Talks to Grid Engine via `qsub`, `qstat` and `qacct`.
///
/// Templates live only in this process; `qsub` receives the script path
/// and the template's name, output path and native specification as
/// options.
#[derive(Debug)]
pub struct GridEngineSession {
    bin_dir: Option<PathBuf>,
    templates: Mutex<HashMap<TemplateId, JobTemplate>>,
    next_template: AtomicU64,
}

impl Default for GridEngineSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GridEngineSession {
    pub fn new() -> Self {
        Self {
            bin_dir: None,
            templates: Mutex::new(HashMap::new()),
            next_template: AtomicU64::new(1),
        }
    }

    /// Use the client binaries in `dir` instead of those on `PATH`.
    pub fn with_bin_dir(mut self, dir: PathBuf) -> Self {
        self.bin_dir = Some(dir);
        self
    }

    fn client(&self, name: &str) -> Command {
        match &self.bin_dir {
            Some(dir) => Command::new(dir.join(name)),
            None => Command::new(name),
        }
    }

    fn template(&self, id: TemplateId) -> ClusterResult<JobTemplate> {
        let templates = self
            .templates
            .lock()
            .map_err(|_| ClusterError::InvalidJob("template registry poisoned".to_string()))?;
        templates
            .get(&id)
            .cloned()
            .ok_or_else(|| ClusterError::InvalidJob(format!("unknown template {}", id.0)))
    }

    fn qsub_args(template: &JobTemplate) -> Vec<String> {
        let mut args = vec![
            "-terse".to_string(),
            "-N".to_string(),
            template.job_name.clone(),
            "-o".to_string(),
            template.output_path.display().to_string(),
            "-j".to_string(),
            "y".to_string(),
        ];
        if let Some(spec) = &template.native_specification {
            args.extend(spec.split_whitespace().map(str::to_string));
        }
        args.push(template.remote_command.display().to_string());
        args
    }

    async fn accounting_state(&self, job: &RemoteJobId) -> RemoteJobState {
        match self.client("qacct").arg("-j").arg(&job.0).output().await {
            Ok(output) if output.status.success() => {
                parse_accounting(&String::from_utf8_lossy(&output.stdout))
            }
            // Accounting records can lag behind qstat; the job is gone either way.
            _ => RemoteJobState::Done,
        }
    }
}

/// Map a failed client invocation's diagnostics onto an error class.
fn classify_failure(stderr: &str) -> ClusterError {
    let lower = stderr.to_lowercase();
    let permanent = ["permission denied", "not readable", "unable to read script", "no such file"];
    let refused = ["job rejected", "denied: ", "exceed", "rejected by"];
    if permanent.iter().any(|p| lower.contains(p)) {
        ClusterError::InvalidJob(stderr.trim().to_string())
    } else if refused.iter().any(|p| lower.contains(p)) {
        ClusterError::Denied(stderr.trim().to_string())
    } else if lower.contains("unable to contact")
        || lower.contains("commlib error")
        || lower.contains("can't connect")
        || lower.contains("timeout")
    {
        ClusterError::Communication(stderr.trim().to_string())
    } else {
        ClusterError::InvalidJob(stderr.trim().to_string())
    }
}

/// `qsub -terse` prints `<id>` or `<id>.<task range>` for array jobs.
fn parse_job_id(stdout: &str) -> Option<RemoteJobId> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split('.').next()?.trim();
    if id.is_empty() {
        None
    } else {
        Some(RemoteJobId(id.to_string()))
    }
}

fn parse_accounting(stdout: &str) -> RemoteJobState {
    let value = |key: &str| {
        stdout.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next() == Some(key) {
                parts.next().map(str::to_string)
            } else {
                None
            }
        })
    };
    let failed = value("failed").map(|v| v != "0").unwrap_or(false);
    let exit_nonzero = value("exit_status").map(|v| v != "0").unwrap_or(false);
    if failed || exit_nonzero {
        RemoteJobState::Failed
    } else {
        RemoteJobState::Done
    }
}

#[async_trait]
impl ClusterSession for GridEngineSession {
    async fn create_template(&self, template: JobTemplate) -> ClusterResult<TemplateId> {
        let id = TemplateId(self.next_template.fetch_add(1, Ordering::Relaxed));
        self.templates
            .lock()
            .map_err(|_| ClusterError::InvalidJob("template registry poisoned".to_string()))?
            .insert(id, template);
        Ok(id)
    }

    async fn delete_template(&self, template: TemplateId) -> ClusterResult<()> {
        self.templates
            .lock()
            .map_err(|_| ClusterError::InvalidJob("template registry poisoned".to_string()))?
            .remove(&template)
            .map(|_| ())
            .ok_or_else(|| ClusterError::InvalidJob(format!("unknown template {}", template.0)))
    }

    async fn run_job(&self, template: TemplateId) -> ClusterResult<RemoteJobId> {
        let template = self.template(template)?;
        let output = self
            .client("qsub")
            .args(Self::qsub_args(&template))
            .output()
            .await
            .map_err(|e| ClusterError::Communication(format!("qsub: {}", e)))?;

        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        parse_job_id(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ClusterError::Communication("qsub returned no job id".to_string())
        })
    }

    async fn job_state(&self, job: &RemoteJobId) -> ClusterResult<RemoteJobState> {
        let output = self
            .client("qstat")
            .arg("-j")
            .arg(&job.0)
            .output()
            .await
            .map_err(|e| ClusterError::Communication(format!("qstat: {}", e)))?;

        if output.status.success() {
            return Ok(RemoteJobState::Running);
        }

        let diagnostics = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if diagnostics.contains("do not exist") || diagnostics.contains("does not exist") {
            Ok(self.accounting_state(job).await)
        } else {
            Err(ClusterError::Communication(diagnostics.trim().to_string()))
        }
    }

    async fn exit(&self) -> ClusterResult<()> {
        if let Ok(mut templates) = self.templates.lock() {
            if !templates.is_empty() {
                tracing::warn!(count = templates.len(), "Session exiting with live job templates");
            }
            templates.clear();
        }
        Ok(())
    }
}
