use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Where a local job's stderr ends up.
#[derive(Debug)]
enum StderrCapture {
    File(PathBuf),
    Pipe(JoinHandle<Vec<u8>>),
    Collected(String),
}

/// Handle to one spawned local process.
///
/// The process is only ever observed through [`LocalProcess::poll`], which
/// checks this child's own pid. Nothing here waits on "any child", so
/// several batches can share the process table without stealing each
/// other's exit statuses.
#[derive(Debug)]
pub struct LocalProcess {
    child: Child,
    exit: Option<ExitStatus>,
    stderr: StderrCapture,
}

/// Spawns local processes with their output streams redirected.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Spawn `args` as a process, sending stdout to `stdout_path` (or the
    /// null device) and stderr to `stderr_path` (or an in-memory capture).
    ///
    /// A redirect file that can't be created falls back to the null device
    /// for stdout and to the capture for stderr.
    pub fn spawn(
        args: &[String],
        stdout_path: Option<&Path>,
        stderr_path: Option<&Path>,
    ) -> std::io::Result<LocalProcess> {
        let (program, rest) = args.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argument vector")
        })?;

        let stdout = match stdout_path {
            Some(path) => match File::create(path) {
                Ok(file) => Stdio::from(file),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot open stdout file, discarding stdout");
                    Stdio::null()
                }
            },
            None => Stdio::null(),
        };

        let mut stderr_file = None;
        if let Some(path) = stderr_path {
            match File::create(path) {
                Ok(file) => stderr_file = Some((file, path.to_path_buf())),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot open stderr file, capturing stderr");
                }
            }
        }

        let mut command = Command::new(program);
        command.args(rest).stdin(Stdio::null()).stdout(stdout);
        let file_target = match stderr_file {
            Some((file, path)) => {
                command.stderr(Stdio::from(file));
                Some(path)
            }
            None => {
                command.stderr(Stdio::piped());
                None
            }
        };

        let mut child = command.spawn()?;

        let stderr = match file_target {
            Some(path) => StderrCapture::File(path),
            None => {
                let mut pipe = child.stderr.take();
                // Drain continuously so a chatty child never blocks on a full pipe.
                StderrCapture::Pipe(tokio::spawn(async move {
                    let mut buf = Vec::new();
                    if let Some(pipe) = pipe.as_mut() {
                        if let Err(e) = pipe.read_to_end(&mut buf).await {
                            tracing::debug!(error = %e, "stderr capture ended early");
                        }
                    }
                    buf
                }))
            }
        };

        tracing::debug!(pid = ?child.id(), program = %program, "Process spawned");

        Ok(LocalProcess {
            child,
            exit: None,
            stderr,
        })
    }
}

impl LocalProcess {
    /// Non-blocking exit check. Returns the exit status once the process
    /// has terminated; `None` while it is still running.
    ///
    /// An OS error while polling is treated as termination with an
    /// unknown status, so the job can be finalized instead of spinning.
    pub fn poll(&mut self) -> Option<Option<ExitStatus>> {
        if let Some(status) = self.exit {
            return Some(Some(status));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                Some(Some(status))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!(pid = ?self.child.id(), error = %e, "Failed to poll process");
                Some(None)
            }
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Everything the process wrote to stderr. Only meaningful after it
    /// has exited; the in-memory capture is collected on first call.
    pub async fn stderr_text(&mut self) -> Option<String> {
        if let StderrCapture::Pipe(handle) = &mut self.stderr {
            let bytes = match handle.await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "stderr capture task failed");
                    Vec::new()
                }
            };
            self.stderr = StderrCapture::Collected(String::from_utf8_lossy(&bytes).into_owned());
        }

        match &self.stderr {
            StderrCapture::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot read stderr file");
                    None
                }
            },
            StderrCapture::Collected(text) => Some(text.clone()),
            StderrCapture::Pipe(_) => None,
        }
    }
}
