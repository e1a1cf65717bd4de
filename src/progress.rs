//! Progress events for an external status tracker.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    StageStart,
    StageComplete,
    JobsOutstanding,
    StagePctDone,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::StageStart => write!(f, "stage_start"),
            Phase::StageComplete => write!(f, "stage_complete"),
            Phase::JobsOutstanding => write!(f, "jobs_outstanding"),
            Phase::StagePctDone => write!(f, "stage_pct_done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub group: String,
    pub value: String,
    pub at: DateTime<Utc>,
}

/// Destination for progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: &ProgressEvent) {
        tracing::info!(phase = %event.phase, group = %event.group, value = %event.value, "progress");
    }
}

/// Appends events as JSON lines to a status log file.
#[derive(Debug)]
pub struct StatusLogSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StatusLogSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

impl ProgressSink for StatusLogSink {
    fn emit(&self, event: &ProgressEvent) {
        let _guard = self.lock.lock();
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot serialize progress event");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "Cannot write status log");
        }
    }
}

/// Forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: &ProgressEvent) {
        // Receiver dropped: nobody is tracking anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Fans events out to several sinks.
#[derive(Default, Clone)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

impl ProgressSink for MultiSink {
    fn emit(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Per-batch reporter: stamps events with the batch's group label and
/// suppresses repeats of an unchanged (percentage, outstanding) pair.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    group: String,
    last: Option<(u64, usize)>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, group: impl Into<String>) -> Self {
        Self {
            sink,
            group: group.into(),
            last: None,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn emit(&self, phase: Phase, value: impl Into<String>) {
        self.sink.emit(&ProgressEvent {
            phase,
            group: self.group.clone(),
            value: value.into(),
            at: Utc::now(),
        });
    }

    pub fn stage_start(&self) {
        self.emit(Phase::StageStart, self.group.clone());
    }

    pub fn stage_complete(&self) {
        self.emit(Phase::StageComplete, self.group.clone());
    }

    /// Report finished/total, emitting only when something changed.
    pub fn jobs(&mut self, finished: usize, total: usize) {
        let pct = if total > 0 {
            finished as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        let outstanding = total - finished.min(total);
        // Compare at the displayed precision.
        let key = ((pct * 10.0).round() as u64, outstanding);
        if self.last == Some(key) {
            return;
        }
        self.last = Some(key);
        self.emit(Phase::JobsOutstanding, outstanding.to_string());
        self.emit(Phase::StagePctDone, format!("{:.1}", pct));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<(Phase, String)> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((event.phase, event.value));
        }
        events
    }

    #[test]
    fn phase_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Phase::StagePctDone).unwrap(),
            "\"stage_pct_done\""
        );
        assert_eq!(Phase::JobsOutstanding.to_string(), "jobs_outstanding");
    }

    #[test]
    fn job_progress_deduplicated() {
        let (sink, mut rx) = ChannelSink::new();
        let mut reporter = ProgressReporter::new(Arc::new(sink), "Pairwise");

        reporter.jobs(0, 4);
        reporter.jobs(0, 4);
        reporter.jobs(1, 4);

        assert_eq!(
            drain(&mut rx),
            vec![
                (Phase::JobsOutstanding, "4".to_string()),
                (Phase::StagePctDone, "0.0".to_string()),
                (Phase::JobsOutstanding, "3".to_string()),
                (Phase::StagePctDone, "25.0".to_string()),
            ]
        );
    }

    #[test]
    fn stage_events_carry_group() {
        let (sink, mut rx) = ChannelSink::new();
        let reporter = ProgressReporter::new(Arc::new(sink), "SV detect");
        reporter.stage_start();
        reporter.stage_complete();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.phase, Phase::StageStart);
        assert_eq!(first.group, "SV detect");
        assert_eq!(rx.try_recv().unwrap().phase, Phase::StageComplete);
    }

    #[test]
    fn status_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.log");
        let sink = StatusLogSink::new(path.clone());
        let reporter = ProgressReporter::new(Arc::new(sink), "Refine");
        reporter.stage_start();
        reporter.emit(Phase::StagePctDone, "50.0");

        let text = std::fs::read_to_string(&path).unwrap();
        let events: Vec<ProgressEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].phase, Phase::StagePctDone);
        assert_eq!(events[1].value, "50.0");
    }

    #[test]
    fn multi_sink_fans_out() {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let reporter = ProgressReporter::new(
            Arc::new(MultiSink::new(vec![Arc::new(a), Arc::new(b), Arc::new(TracingSink)])),
            "Characterize",
        );
        reporter.stage_start();
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }
}
