//! Batch reports: the human-readable run report, the machine-parsable
//! performance table and the short failure list.

use std::fmt::Write as _;
use std::time::Duration;

use crate::scheduler::batch::Scheduler;

/// Hours and fractional minutes, e.g. `  0h 1.50m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    let hours = (secs / 3600.0).floor();
    let minutes = (secs - hours * 3600.0) / 60.0;
    format!("{:>3}h {:.2}m", hours as u64, minutes)
}

impl Scheduler {
    /// Per-job status followed by aggregate timing.
    ///
    /// Output files and completion markers are re-checked once; jobs
    /// whose marker is still missing are recorded as failed, with their
    /// full argument vector in the report.
    pub async fn run_report(&mut self) -> String {
        let token = self.marker.success_token.clone();
        let mut out = String::new();
        for job in &mut self.jobs {
            let seconds = job.run_time().unwrap_or_default().as_secs_f64();
            let _ = write!(out, "   {} completed in: {:6.1}s", job.name(), seconds);

            if let Some(path) = job.expected_output().map(|p| p.to_path_buf()) {
                if job.check_output_found() {
                    out.push_str("  Result Found");
                } else {
                    let _ = write!(out, "  Result NOT Found: {} ", path.display());
                }
            }

            if job.marker().is_some() && !job.marker_complete() {
                job.check_completion_marker(&token, 1, Duration::ZERO).await;
            }
            if let (false, Some(path)) = (job.marker_complete(), job.marker()) {
                let _ = write!(out, "  Stdout INCOMPLETE: {} ", path.display());
                job.note_incomplete_marker();
            }

            if let Some(err) = job.failure() {
                let _ = write!(out, "  {}", err);
            }
            out.push('\n');

            if !job.marker_complete() {
                out.push_str("\n   OFFENDING ARGUMENTS:\n");
                out.push_str(&job.command_line(&self.recorder));
                out.push_str("\n\n");
            }
        }

        let _ = write!(
            out,
            "  Completed {} jobs on {} threads\n  Clock time: {}\n  CPU time  : {}\n",
            self.jobs.len(),
            self.threads,
            format_duration(self.elapsed),
            format_duration(self.cpu_time)
        );
        out
    }

    /// One header row (taken from the first job) and one row per job,
    /// failed jobs included.
    pub fn parse_report(&mut self) -> String {
        let mut out = format!("\n  Begin machine parsable segment for: {}\n", self.group());
        let recorder = &self.recorder;
        for (i, job) in self.jobs.iter_mut().enumerate() {
            let sample = job.performance_sample(recorder);
            if i == 0 {
                out.push_str(&sample.header());
                out.push('\n');
            }
            out.push_str(&sample.row());
            out.push('\n');
        }
        out
    }

    /// `Job failed: <path>` for every job without a complete marker,
    /// naming the marker path when there is one. Empty on success.
    pub fn simple_report(&self) -> String {
        let mut out = String::new();
        for job in self.jobs() {
            if job.marker_complete() {
                continue;
            }
            let path = job
                .marker()
                .or_else(|| job.expected_output())
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| job.name().to_string());
            let _ = writeln!(out, "Job failed: {}", path);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Job;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn duration_format() {
        assert_eq!(format_duration(Duration::from_secs(90)), "  0h 1.50m");
        assert_eq!(format_duration(Duration::from_secs(3600 + 30)), "  1h 0.50m");
        assert_eq!(format_duration(Duration::ZERO), "  0h 0.00m");
    }

    #[tokio::test]
    async fn reports_for_mixed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.stdout");
        let missing = dir.path().join("missing.cmap");
        let mut batch = Scheduler::new("Refine");
        batch
            .add(
                Job::new("good", sh("echo 'END of output'"))
                    .with_stdout(&good)
                    .with_marker(&good),
            )
            .unwrap();
        batch
            .add(Job::new("bad", sh("exit 0")).with_expected_output(&missing))
            .unwrap();

        batch.run(2, Duration::from_millis(1)).await.unwrap();
        assert!(!batch.succeeded());

        let run = batch.run_report().await;
        assert!(run.contains("   good completed in:"));
        assert!(run.contains(&format!("  Result NOT Found: {} ", missing.display())));
        assert!(run.contains("OFFENDING ARGUMENTS:\nsh -c exit 0"));
        assert!(run.contains("  Completed 2 jobs on 2 threads"));

        let parse = batch.parse_report();
        let lines: Vec<&str> = parse.lines().collect();
        assert_eq!(lines[1], "  Begin machine parsable segment for: Refine");
        assert!(lines[2].starts_with("time_header\tJob\tt0"));
        assert_eq!(lines.len(), 5);

        assert_eq!(
            batch.simple_report(),
            format!("Job failed: {}\n", missing.display())
        );
    }

    #[tokio::test]
    async fn simple_report_empty_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("a.stdout");
        let mut batch = Scheduler::new("Pairwise");
        batch
            .add(
                Job::new("a", sh("echo 'END of output'"))
                    .with_stdout(&marker)
                    .with_marker(&marker),
            )
            .unwrap();
        batch.run(1, Duration::from_millis(1)).await.unwrap();
        assert!(batch.succeeded());
        assert!(batch.simple_report().is_empty());
    }
}
