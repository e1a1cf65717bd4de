use std::path::Path;
use std::time::Duration;

/// True once `path` exists and one of its lines contains `token`.
async fn marker_present(path: &Path, token: &str) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => text.lines().any(|line| line.contains(token)),
        Err(_) => false,
    }
}

/// Check a completion marker, re-reading up to `tries` times with `delay`
/// in between. Shared filesystems can surface a finished job's output well
/// after the job itself is gone. At least one read is
/// always made.
pub async fn check_completion_marker(
    path: &Path,
    token: &str,
    tries: u32,
    delay: Duration,
) -> bool {
    let tries = tries.max(1);
    for attempt in 1..=tries {
        if marker_present(path, token).await {
            return true;
        }
        if attempt < tries {
            tracing::debug!(path = %path.display(), attempt, "Completion marker not found yet");
            tokio::time::sleep(delay).await;
        }
    }
    false
}
