//! Child process spawning under resource limits.
//!
//! Every scanner runs in its own process group with a minimal environment
//! and, on POSIX, hard rlimits on CPU time, address space, file descriptors,
//! and core dumps. Output is capped while it is read so a chatty child can
//! neither fill memory nor deadlock on a full pipe.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Exit code reported for timed-out executions (shell convention).
pub const TIMEOUT_RETURN_CODE: i32 = 124;
/// Exit code reported when the binary is missing.
pub const NOT_FOUND_RETURN_CODE: i32 = 127;

/// Extra CPU seconds allowed past the wall-clock timeout before the kernel
/// steps in.
const CPU_GRACE_SECS: u64 = 5;

/// Wait after the group SIGKILL before reaping.
const KILL_SETTLE: Duration = Duration::from_millis(100);

/// Resource caps applied to each child.
#[derive(Debug, Clone)]
pub struct SpawnLimits {
    pub memory_mb: u64,
    pub file_descriptors: u64,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
}

/// What came back from one child process run.
#[derive(Debug)]
pub struct SpawnOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated_stdout: bool,
    pub truncated_stderr: bool,
    pub return_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Spawn-level failures, before any output exists.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("binary not found: {command}")]
    BinaryNotFound { command: String },

    #[error("failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error while running {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `command` with `argv`, waiting up to `timeout`.
///
/// On expiry the whole process group is SIGKILLed and the outcome carries
/// `timed_out = true` with return code 124, plus whatever output the child
/// managed to produce.
pub async fn run_with_limits(
    command: &str,
    argv: &[String],
    timeout: Duration,
    limits: &SpawnLimits,
    tracker: &super::ProcessTracker,
) -> Result<SpawnOutcome, SpawnError> {
    let start = Instant::now();

    let mut cmd = Command::new(command);
    cmd.args(argv)
        .env_clear()
        .env(
            "PATH",
            std::env::var_os("PATH").unwrap_or_else(|| "/usr/sbin:/usr/bin:/sbin:/bin".into()),
        )
        .env("LANG", "C.UTF-8")
        .env("LC_ALL", "C.UTF-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    apply_pre_exec(&mut cmd, timeout, limits);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SpawnError::BinaryNotFound {
                command: command.to_string(),
            }
        } else {
            SpawnError::SpawnFailed {
                command: command.to_string(),
                source: e,
            }
        }
    })?;

    let pid = child.id();
    if let Some(pid) = pid {
        tracker.register(pid);
    }

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let stdout_handle = read_capped(stdout, limits.max_stdout_bytes);
    let stderr_handle = read_capped(stderr, limits.max_stderr_bytes);

    let (return_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
        Ok(Err(e)) => {
            return Err(SpawnError::Io {
                command: command.to_string(),
                source: e,
            });
        }
        Err(_) => {
            tracing::warn!(command, pid, timeout_sec = timeout.as_secs_f64(), "execution timed out, killing process group");
            kill_group(pid);
            tokio::time::sleep(KILL_SETTLE).await;
            // Best-effort fallback; the group signal normally already took it.
            let _ = child.kill().await;
            let _ = child.wait().await;
            (TIMEOUT_RETURN_CODE, true)
        }
    };

    if let Some(pid) = pid {
        tracker.unregister(pid);
    }

    // Readers finish at pipe EOF, which the kill guarantees.
    let (stdout, truncated_stdout) = stdout_handle.await.unwrap_or((Vec::new(), false));
    let (stderr, truncated_stderr) = stderr_handle.await.unwrap_or((Vec::new(), false));

    Ok(SpawnOutcome {
        stdout,
        stderr,
        truncated_stdout,
        truncated_stderr,
        return_code,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Read from a pipe up to `cap` bytes, then keep draining without storing so
/// the child never blocks on a full pipe.
fn read_capped<R>(mut reader: R, cap: usize) -> JoinHandle<(Vec<u8>, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if collected.len() < cap {
                        let keep = n.min(cap - collected.len());
                        collected.extend_from_slice(&buf[..keep]);
                        if keep < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }
        (collected, truncated)
    })
}

/// New process group plus rlimits, applied between fork and exec.
#[cfg(unix)]
fn apply_pre_exec(cmd: &mut Command, timeout: Duration, limits: &SpawnLimits) {
    let cpu_soft = timeout.as_secs().max(1);
    let cpu_hard = cpu_soft + CPU_GRACE_SECS;
    let memory_bytes = limits.memory_mb * 1024 * 1024;
    let nofile = limits.file_descriptors;

    unsafe {
        cmd.pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            set_rlimit(libc::RLIMIT_CPU, cpu_soft, cpu_hard)?;
            set_rlimit(libc::RLIMIT_AS, memory_bytes, memory_bytes)?;
            set_rlimit(libc::RLIMIT_NOFILE, nofile, nofile)?;
            set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_pre_exec(_cmd: &mut Command, _timeout: Duration, _limits: &SpawnLimits) {}

#[cfg(all(unix, target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(target_env = "gnu")))]
type RlimitResource = libc::c_int;

#[cfg(unix)]
fn set_rlimit(resource: RlimitResource, soft: u64, hard: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// SIGKILL the child's whole process group.
#[cfg(unix)]
pub fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> super::super::ProcessTracker {
        super::super::ProcessTracker::default()
    }

    fn limits() -> SpawnLimits {
        SpawnLimits {
            memory_mb: 512,
            file_descriptors: 256,
            max_stdout_bytes: 1024 * 1024,
            max_stderr_bytes: 256 * 1024,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = run_with_limits(
            "/bin/sh",
            &["-c".to_string(), "echo hello".to_string()],
            Duration::from_secs(5),
            &limits(),
            &tracker(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.return_code, 0);
        assert!(!outcome.timed_out);
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let err = run_with_limits(
            "/nonexistent/scanner-binary",
            &[],
            Duration::from_secs(5),
            &limits(),
            &tracker(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SpawnError::BinaryNotFound { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports_124() {
        let start = Instant::now();
        let outcome = run_with_limits(
            "/bin/sh",
            &["-c".to_string(), "sleep 10".to_string()],
            Duration::from_secs(1),
            &limits(),
            &tracker(),
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.return_code, TIMEOUT_RETURN_CODE);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_kills_whole_process_group() {
        // The sleep grandchild inherits the group; after the kill no reader
        // should keep the pipe open, so the await below must not hang.
        let outcome = run_with_limits(
            "/bin/sh",
            &["-c".to_string(), "sleep 30 & wait".to_string()],
            Duration::from_secs(1),
            &limits(),
            &tracker(),
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn stdout_truncated_at_cap() {
        let mut small = limits();
        small.max_stdout_bytes = 1024;
        let outcome = run_with_limits(
            "/bin/sh",
            &[
                "-c".to_string(),
                "head -c 100000 /dev/zero | tr '\\0' 'x'".to_string(),
            ],
            Duration::from_secs(5),
            &small,
            &tracker(),
        )
        .await
        .unwrap();
        assert!(outcome.truncated_stdout);
        assert_eq!(outcome.stdout.len(), 1024);
        assert_eq!(outcome.return_code, 0);
    }

    #[tokio::test]
    async fn stderr_captured_separately() {
        let outcome = run_with_limits(
            "/bin/sh",
            &["-c".to_string(), "echo oops >&2; exit 3".to_string()],
            Duration::from_secs(5),
            &limits(),
            &tracker(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.return_code, 3);
        assert_eq!(String::from_utf8_lossy(&outcome.stderr).trim(), "oops");
        assert!(outcome.stdout.is_empty());
    }

    #[tokio::test]
    async fn environment_is_minimal() {
        let outcome = run_with_limits(
            "/usr/bin/env",
            &[],
            Duration::from_secs(5),
            &limits(),
            &tracker(),
        )
        .await
        .unwrap();
        let env = String::from_utf8_lossy(&outcome.stdout);
        for line in env.lines() {
            let key = line.split('=').next().unwrap_or_default();
            assert!(
                matches!(key, "PATH" | "LANG" | "LC_ALL" | "PWD" | "SHLVL" | "_"),
                "unexpected env var leaked to child: {key}"
            );
        }
        assert!(env.contains("LC_ALL=C.UTF-8"));
    }
}
