//! Tool execution engine.
//!
//! Takes a vetted argument vector and runs the tool under admission control:
//! a per-tool concurrency semaphore bounds parallelism, the child runs with
//! resource caps in its own process group, and the outcome is assembled into
//! a structured [`ToolResult`]. Circuit-breaker gating and metrics emission
//! happen one layer up in the gateway.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::config::LimitsConfig;
use crate::error::{ErrorContext, ErrorKind};
use crate::policy::redact_args;
use crate::types::ToolResult;

pub mod spawn;

pub use spawn::{NOT_FOUND_RETURN_CODE, SpawnError, SpawnLimits, TIMEOUT_RETURN_CODE};

/// Live child process groups, so shutdown can force-kill residuals.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    pids: Mutex<HashSet<u32>>,
}

impl ProcessTracker {
    pub fn register(&self, pid: u32) {
        self.lock().insert(pid);
    }

    pub fn unregister(&self, pid: u32) {
        self.lock().remove(&pid);
    }

    /// SIGKILL every live process group. Called after the shutdown grace
    /// period expires.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = self.lock().iter().copied().collect();
        for pid in pids {
            tracing::warn!(pid, "force-killing residual process group at shutdown");
            spawn::kill_group(Some(pid));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        match self.pids.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Executes validated requests for the registry.
pub struct ExecutionEngine {
    limits: LimitsConfig,
    // Semaphores are created lazily under one lock and cached per tool, so
    // every execution of a tool contends on the same semaphore regardless of
    // which transport task created it first.
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    tracker: Arc<ProcessTracker>,
    active: AtomicUsize,
}

impl ExecutionEngine {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            semaphores: Mutex::new(HashMap::new()),
            tracker: Arc::new(ProcessTracker::default()),
            active: AtomicUsize::new(0),
        }
    }

    pub fn tracker(&self) -> Arc<ProcessTracker> {
        Arc::clone(&self.tracker)
    }

    /// Number of executions currently holding a semaphore permit.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run one validated execution to completion.
    ///
    /// `argv` must already contain the target in its vetted position; this
    /// layer never re-interprets arguments.
    pub async fn execute(
        &self,
        tool_name: &str,
        command: &str,
        concurrency_cap: usize,
        argv: &[String],
        target: &str,
        timeout: Duration,
        correlation_id: &str,
    ) -> ToolResult {
        let semaphore = self.semaphore(tool_name, concurrency_cap);
        let _permit = semaphore
            .acquire()
            .await
            .expect("execution semaphore is never closed");

        self.active.fetch_add(1, Ordering::SeqCst);
        let _active = decrement_on_drop(&self.active);

        tracing::info!(
            tool = tool_name,
            correlation_id,
            argv = ?redact_args(argv),
            timeout_sec = timeout.as_secs_f64(),
            "executing tool"
        );

        let spawn_limits = SpawnLimits {
            memory_mb: self.limits.max_memory_mb,
            file_descriptors: self.limits.max_file_descriptors,
            max_stdout_bytes: self.limits.max_stdout_bytes,
            max_stderr_bytes: self.limits.max_stderr_bytes,
        };

        let started = std::time::Instant::now();
        let outcome =
            spawn::run_with_limits(command, argv, timeout, &spawn_limits, &self.tracker).await;

        match outcome {
            Ok(outcome) => {
                let error = outcome.timed_out.then(|| {
                    ErrorContext::new(
                        ErrorKind::Timeout,
                        format!("{tool_name} timed out after {:.1}s", timeout.as_secs_f64()),
                        tool_name,
                        target,
                    )
                    .with_hint("Increase timeout_sec or narrow the scan scope")
                });
                let result = ToolResult {
                    stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
                    return_code: outcome.return_code,
                    truncated_stdout: outcome.truncated_stdout,
                    truncated_stderr: outcome.truncated_stderr,
                    timed_out: outcome.timed_out,
                    error_kind: outcome.timed_out.then_some(ErrorKind::Timeout),
                    error,
                    execution_time: outcome.duration.as_secs_f64(),
                    correlation_id: correlation_id.to_string(),
                    timestamp: Utc::now(),
                    metadata: serde_json::Value::Null,
                };
                tracing::info!(
                    tool = tool_name,
                    correlation_id,
                    return_code = result.return_code,
                    timed_out = result.timed_out,
                    truncated_stdout = result.truncated_stdout,
                    duration_ms = (result.execution_time * 1000.0) as u64,
                    "execution finished"
                );
                result
            }
            Err(err) => {
                let (kind, return_code, hint) = match &err {
                    SpawnError::BinaryNotFound { command } => (
                        ErrorKind::NotFound,
                        NOT_FOUND_RETURN_CODE,
                        format!("Install {command} or check PATH"),
                    ),
                    _ => (
                        ErrorKind::ExecutionError,
                        1,
                        "Check tool installation and system resources".to_string(),
                    ),
                };
                tracing::error!(tool = tool_name, correlation_id, error = %err, "spawn failed");
                let ctx =
                    ErrorContext::new(kind, err.to_string(), tool_name, target).with_hint(hint);
                let mut result =
                    ToolResult::from_error(ctx, return_code, correlation_id.to_string());
                result.execution_time = started.elapsed().as_secs_f64();
                result
            }
        }
    }

    fn semaphore(&self, tool_name: &str, cap: usize) -> Arc<Semaphore> {
        let mut map = match self.semaphores.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            map.entry(tool_name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(cap.max(1)))),
        )
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("active", &self.active_count())
            .finish()
    }
}

fn decrement_on_drop(counter: &AtomicUsize) -> impl Drop + '_ {
    struct Guard<'a>(&'a AtomicUsize);
    impl Drop for Guard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }
    Guard(counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(LimitsConfig {
            max_args_len: 2048,
            max_stdout_bytes: 1024 * 1024,
            max_stderr_bytes: 256 * 1024,
            default_timeout: Duration::from_secs(30),
            default_concurrency: 2,
            max_memory_mb: 512,
            max_file_descriptors: 256,
        })
    }

    #[tokio::test]
    async fn successful_run_produces_structured_result() {
        let engine = engine();
        let result = engine
            .execute(
                "echo",
                "/bin/echo",
                2,
                &["hello".to_string()],
                "10.0.0.1",
                Duration::from_secs(5),
                "corr-1",
            )
            .await;
        assert_eq!(result.return_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.correlation_id, "corr-1");
        assert!(result.error_kind.is_none());
        assert!(result.execution_time > 0.0);
    }

    #[tokio::test]
    async fn missing_binary_yields_not_found_127() {
        let engine = engine();
        let result = engine
            .execute(
                "ghost",
                "/nonexistent/ghost-scanner",
                1,
                &[],
                "10.0.0.1",
                Duration::from_secs(5),
                "corr-2",
            )
            .await;
        assert_eq!(result.return_code, NOT_FOUND_RETURN_CODE);
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
        let ctx = result.error.unwrap();
        assert!(ctx.recovery_hint.contains("PATH"));
    }

    #[tokio::test]
    async fn timeout_yields_124_and_timeout_kind() {
        let engine = engine();
        let result = engine
            .execute(
                "sleeper",
                "/bin/sh",
                1,
                &["-c".to_string(), "sleep 10".to_string()],
                "10.0.0.1",
                Duration::from_secs(1),
                "corr-3",
            )
            .await;
        assert!(result.timed_out);
        assert_eq!(result.return_code, TIMEOUT_RETURN_CODE);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(result.execution_time >= 1.0 && result.execution_time < 3.0);
    }

    #[tokio::test]
    async fn semaphore_serializes_same_tool() {
        let engine = Arc::new(engine());
        let start = std::time::Instant::now();
        let mut handles = Vec::new();
        for i in 0..3 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .execute(
                        "serial",
                        "/bin/sh",
                        1,
                        &["-c".to_string(), "sleep 0.3".to_string()],
                        "10.0.0.1",
                        Duration::from_secs(5),
                        &format!("corr-{i}"),
                    )
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().return_code, 0);
        }
        // Three 0.3s runs through a 1-permit semaphore cannot overlap.
        assert!(start.elapsed() >= Duration::from_millis(850));
    }

    #[tokio::test]
    async fn different_tools_run_in_parallel() {
        let engine = Arc::new(engine());
        let start = std::time::Instant::now();
        let a = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .execute(
                        "tool-a",
                        "/bin/sh",
                        1,
                        &["-c".to_string(), "sleep 0.4".to_string()],
                        "10.0.0.1",
                        Duration::from_secs(5),
                        "a",
                    )
                    .await
            })
        };
        let b = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .execute(
                        "tool-b",
                        "/bin/sh",
                        1,
                        &["-c".to_string(), "sleep 0.4".to_string()],
                        "10.0.0.1",
                        Duration::from_secs(5),
                        "b",
                    )
                    .await
            })
        };
        a.await.unwrap();
        b.await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(750));
    }

    #[tokio::test]
    async fn active_count_returns_to_zero() {
        let engine = engine();
        assert_eq!(engine.active_count(), 0);
        let _ = engine
            .execute(
                "echo",
                "/bin/echo",
                2,
                &["x".to_string()],
                "10.0.0.1",
                Duration::from_secs(5),
                "c",
            )
            .await;
        assert_eq!(engine.active_count(), 0);
        assert!(engine.tracker().is_empty());
    }
}
