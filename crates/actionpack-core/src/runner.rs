//! Process runner: spawn with captured output, bounded buffers, and a
//! kill-on-expiry timeout.
//!
//! The child gets `/dev/null` on stdin and pipes on stdout/stderr; each
//! stream accumulates up to `max_bytes`, with overflow read and silently
//! discarded so a chatty child never blocks on a full pipe. The working
//! directory is applied by the spawn action, never by a process-global
//! `chdir`, and the runtime opens its pipe descriptors close-on-exec so
//! the child inherits nothing beyond the three stdio mappings.
//!
//! A nonzero `timeout_ms` bounds wall-clock time from spawn: on expiry the
//! child is killed, `timed_out` is set, and whatever output was captured
//! so far is returned.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Grace period for the capture tasks to observe EOF after the child
/// exits or is killed; covers grandchildren that keep the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of one spawned process.
#[derive(Debug, Default)]
pub struct CaptureResult {
    /// Child exit code; 1 when the child was signaled, timed out, or
    /// failed to spawn.
    pub exit_code: i32,
    /// `exit_code == 0 && !timed_out`.
    pub ok: bool,
    /// The wall-clock timeout expired and the child was killed.
    pub timed_out: bool,
    /// Captured stdout, truncated at the configured cap.
    pub stdout: Vec<u8>,
    /// Captured stderr, truncated at the configured cap.
    pub stderr: Vec<u8>,
    /// Spawn/wait failure detail, when the process never ran to completion.
    pub error: Option<String>,
}

impl CaptureResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Reads a stream to EOF, keeping at most `max` bytes.
async fn drain_capped(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    sink: Arc<Mutex<Vec<u8>>>,
    max: usize,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut dst = sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if dst.len() < max {
                    let take = n.min(max - dst.len());
                    dst.extend_from_slice(&buf[..take]);
                }
            },
        }
    }
}

fn take_bytes(sink: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    std::mem::take(&mut *sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
}

/// Spawns `argv` and captures its output.
///
/// `env_add` entries are applied on top of the inherited environment;
/// an empty `cwd` inherits the daemon's working directory. `timeout_ms`
/// of 0 means no timeout; `max_bytes` caps each captured stream.
pub async fn run_capture(
    argv: &[String],
    env_add: &BTreeMap<String, String>,
    cwd: &str,
    timeout_ms: u32,
    max_bytes: usize,
) -> CaptureResult {
    let Some((program, args)) = argv.split_first() else {
        return CaptureResult::failed("empty command");
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !cwd.is_empty() {
        cmd.current_dir(cwd);
    }
    for (k, v) in env_add {
        cmd.env(k, v);
    }

    let start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return CaptureResult::failed(format!("failed to spawn command: {e}")),
    };

    let out_sink = Arc::new(Mutex::new(Vec::new()));
    let err_sink = Arc::new(Mutex::new(Vec::new()));
    let out_task = child
        .stdout
        .take()
        .map(|s| tokio::spawn(drain_capped(s, Arc::clone(&out_sink), max_bytes)));
    let err_task = child
        .stderr
        .take()
        .map(|s| tokio::spawn(drain_capped(s, Arc::clone(&err_sink), max_bytes)));

    let mut result = CaptureResult::default();

    if timeout_ms == 0 {
        match child.wait().await {
            Ok(status) => result.exit_code = status.code().unwrap_or(1),
            Err(e) => {
                result.exit_code = 1;
                result.error = Some(format!("wait failed: {e}"));
            },
        }
    } else {
        let deadline = start + Duration::from_millis(u64::from(timeout_ms));
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => result.exit_code = status.code().unwrap_or(1),
                Err(e) => {
                    result.exit_code = 1;
                    result.error = Some(format!("wait failed: {e}"));
                },
            },
            () = tokio::time::sleep_until(deadline.into()) => {
                result.timed_out = true;
                result.exit_code = 1;
                let _ = child.start_kill();
                let _ = child.wait().await;
            },
        }
    }

    // Let the capture tasks see EOF; abort them if a grandchild holds the
    // pipes open past the grace period. Partial output stays available
    // through the shared sinks either way.
    let mut tasks: Vec<_> = [out_task, err_task].into_iter().flatten().collect();
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        for task in &mut tasks {
            let _ = task.await;
        }
    })
    .await;
    if drained.is_err() {
        for task in &tasks {
            task.abort();
        }
    }

    result.stdout = take_bytes(&out_sink);
    result.stderr = take_bytes(&err_sink);
    result.ok = result.exit_code == 0 && !result.timed_out;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let r = run_capture(&argv(&["/bin/echo", "hello"]), &BTreeMap::new(), "", 0, 65536).await;
        assert!(r.ok);
        assert_eq!(r.exit_code, 0);
        assert_eq!(r.stdout, b"hello\n");
        assert!(r.stderr.is_empty());
        assert!(!r.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_ok() {
        let r = run_capture(
            &argv(&["/bin/sh", "-c", "exit 3"]),
            &BTreeMap::new(),
            "",
            0,
            65536,
        )
        .await;
        assert!(!r.ok);
        assert_eq!(r.exit_code, 3);
    }

    #[tokio::test]
    async fn captures_stderr() {
        let r = run_capture(
            &argv(&["/bin/sh", "-c", "echo oops >&2"]),
            &BTreeMap::new(),
            "",
            0,
            65536,
        )
        .await;
        assert_eq!(r.stderr, b"oops\n");
    }

    #[tokio::test]
    async fn env_additions_reach_the_child() {
        let mut env = BTreeMap::new();
        env.insert("PACK_TEST_VAR".to_string(), "forty-two".to_string());
        let r = run_capture(
            &argv(&["/bin/sh", "-c", "printf %s \"$PACK_TEST_VAR\""]),
            &env,
            "",
            0,
            65536,
        )
        .await;
        assert_eq!(r.stdout, b"forty-two");
    }

    #[tokio::test]
    async fn cwd_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let canon = std::fs::canonicalize(dir.path()).unwrap();
        let r = run_capture(
            &argv(&["/bin/pwd"]),
            &BTreeMap::new(),
            &canon.to_string_lossy(),
            0,
            65536,
        )
        .await;
        assert_eq!(
            String::from_utf8_lossy(&r.stdout).trim_end(),
            canon.to_string_lossy()
        );
    }

    #[tokio::test]
    async fn output_is_truncated_at_cap() {
        let r = run_capture(
            &argv(&["/bin/sh", "-c", "yes x | head -c 100000"]),
            &BTreeMap::new(),
            "",
            0,
            1024,
        )
        .await;
        assert!(r.ok);
        assert_eq!(r.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let start = Instant::now();
        let r = run_capture(
            &argv(&["/bin/sh", "-c", "sleep 30"]),
            &BTreeMap::new(),
            "",
            200,
            65536,
        )
        .await;
        assert!(r.timed_out);
        assert!(!r.ok);
        assert_eq!(r.exit_code, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let r = run_capture(
            &argv(&["/no/such/binary/anywhere"]),
            &BTreeMap::new(),
            "",
            0,
            65536,
        )
        .await;
        assert!(!r.ok);
        assert_eq!(r.exit_code, 1);
        assert!(r.error.unwrap().starts_with("failed to spawn command"));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let r = run_capture(&[], &BTreeMap::new(), "", 0, 65536).await;
        assert_eq!(r.error.as_deref(), Some("empty command"));
    }
}
