use std::time::Duration;

use stage_runner::worker::{
    check_completion_marker, ExecContext, Field, PerfStatWrapper, PerformanceRecorder,
    ProcessRunner, TimeWrapper,
};
use std::path::PathBuf;
use std::sync::Arc;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

async fn wait_for_exit(process: &mut stage_runner::worker::LocalProcess) {
    for _ in 0..500 {
        if process.poll().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("process did not exit");
}

#[tokio::test]
async fn test_stdout_redirected_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("job.stdout");

    let mut process = ProcessRunner::spawn(&sh("echo hello"), Some(&out), None).unwrap();
    wait_for_exit(&mut process).await;

    assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
    assert!(process.exit_status().unwrap().success());
}

#[tokio::test]
async fn test_stderr_captured_in_memory() {
    let mut process = ProcessRunner::spawn(&sh("echo oops >&2; exit 2"), None, None).unwrap();
    wait_for_exit(&mut process).await;

    assert_eq!(process.exit_status().unwrap().code(), Some(2));
    assert_eq!(process.stderr_text().await.as_deref(), Some("oops\n"));
    // Collected once, served again afterwards.
    assert_eq!(process.stderr_text().await.as_deref(), Some("oops\n"));
}

#[tokio::test]
async fn test_stderr_redirected_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = dir.path().join("job.stderr");

    let mut process = ProcessRunner::spawn(&sh("echo warn >&2"), None, Some(&err)).unwrap();
    wait_for_exit(&mut process).await;

    assert_eq!(std::fs::read_to_string(&err).unwrap(), "warn\n");
    assert_eq!(process.stderr_text().await.as_deref(), Some("warn\n"));
}

#[tokio::test]
async fn test_large_stderr_does_not_block() {
    let mut process = ProcessRunner::spawn(&sh("seq 1 200000 >&2"), None, None).unwrap();
    wait_for_exit(&mut process).await;

    let text = process.stderr_text().await.unwrap();
    assert_eq!(text.lines().count(), 200000);
}

#[tokio::test]
async fn test_poll_is_non_blocking() {
    let mut process = ProcessRunner::spawn(&sh("sleep 0.3"), None, None).unwrap();
    assert!(process.poll().is_none());
    wait_for_exit(&mut process).await;
    assert!(process.poll().is_some());
}

#[test]
fn test_spawn_errors() {
    assert!(ProcessRunner::spawn(&[], None, None).is_err());
    let missing = vec!["/nonexistent/binary".to_string()];
    assert!(ProcessRunner::spawn(&missing, None, None).is_err());
}

#[tokio::test]
async fn test_unwritable_stdout_falls_back() {
    let bad = PathBuf::from("/nonexistent/dir/job.stdout");
    let mut process = ProcessRunner::spawn(&sh("echo hello"), Some(&bad), None).unwrap();
    wait_for_exit(&mut process).await;
    assert!(process.exit_status().unwrap().success());
}

#[tokio::test]
async fn test_completion_marker_detection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.stdout");

    assert!(!check_completion_marker(&path, "END of output", 2, Duration::from_millis(1)).await);

    std::fs::write(&path, "Iteration 3\nMaxMem\n").unwrap();
    assert!(!check_completion_marker(&path, "END of output", 1, Duration::ZERO).await);

    std::fs::write(&path, "Iteration 3\nEND of output (1.2 s)\n").unwrap();
    assert!(check_completion_marker(&path, "END of output", 1, Duration::ZERO).await);
}

#[tokio::test]
async fn test_marker_appearing_between_tries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lagging.stdout");
    let writer_path = path.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(writer_path, "END of output\n").unwrap();
    });

    assert!(check_completion_marker(&path, "END of output", 20, Duration::from_millis(20)).await);
}

#[test]
fn test_instrumented_command_lines() {
    let recorder = PerformanceRecorder::new(vec![
        Arc::new(TimeWrapper::new(PathBuf::from("/usr/bin/time"))),
        Arc::new(PerfStatWrapper::new(PathBuf::from("/usr/bin/perf"), 2)),
    ]);
    let args = vec!["RefAligner".to_string(), "-i".to_string(), "a.cmap".to_string()];

    let local = recorder.wrap(&args, ExecContext::Local);
    assert_eq!(local[0], "/usr/bin/time");
    assert!(local.iter().any(|a| a == "/usr/bin/perf"));
    assert_eq!(&local[local.len() - 3..], &args[..]);

    let script = recorder.wrap(&args, ExecContext::Script).join(" ");
    assert!(script.starts_with("${TIME_BINARY:=/usr/bin/time}"));
    assert!(script.contains("${PERF_BINARY:=/usr/bin/perf}"));
}

#[test]
fn test_counter_field_parsing() {
    assert_eq!(Field::parse_counter("1234"), Field::Int(1234));
    assert_eq!(Field::parse_counter("0.75"), Field::Float(0.75));
    assert_eq!(Field::parse_counter("<not counted>"), Field::Missing);
    assert_eq!(Field::Missing.to_string(), "N/A");
}
