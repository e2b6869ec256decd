//! Health monitoring.
//!
//! Checks carry a priority (0 = critical, 1 = important, 2 = informational)
//! and run concurrently under a soft timeout. The overall status is the
//! worst result weighted by priority: a critical check failing makes the
//! gateway unhealthy, anything else failing degrades it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sysinfo::{Disks, ProcessesToUpdate, System};

use crate::config::HealthConfig;

/// Soft-timeout safety margin added on top of the configured per-check
/// timeout before a check is declared overdue.
const CHECK_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// Health states, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Check priorities. Critical failures take the whole gateway unhealthy;
/// everything else can only degrade it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPriority {
    Critical = 0,
    Important = 1,
    Informational = 2,
}

/// Outcome of one check invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub priority: u8,
    pub duration_sec: f64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Aggregated gateway health.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub timestamp: DateTime<Utc>,
    pub uptime_sec: f64,
    pub version: &'static str,
}

/// One health check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> CheckPriority;
    async fn run(&self) -> HealthCheckResult;
}

/// Runs checks concurrently on a fixed interval, guarding against overlap.
pub struct HealthMonitor {
    checks: Vec<Arc<dyn HealthCheck>>,
    config: HealthConfig,
    running: AtomicBool,
    last: Mutex<Option<SystemHealth>>,
    started_at: Instant,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, checks: Vec<Arc<dyn HealthCheck>>) -> Arc<Self> {
        Arc::new(Self {
            checks,
            config,
            running: AtomicBool::new(false),
            last: Mutex::new(None),
            started_at: Instant::now(),
        })
    }

    /// Built-in check set for the gateway.
    pub fn with_builtin_checks(config: HealthConfig, tool_commands: Vec<String>) -> Arc<Self> {
        let checks: Vec<Arc<dyn HealthCheck>> = vec![
            Arc::new(SystemResourceCheck {
                cpu_threshold: config.cpu_threshold,
                memory_threshold: config.memory_threshold,
                disk_threshold: config.disk_threshold,
            }),
            Arc::new(ProcessCheck),
            Arc::new(ToolAvailabilityCheck {
                commands: tool_commands,
            }),
            Arc::new(DependencyCheck {
                dependencies: config.dependencies.clone(),
            }),
        ];
        Self::new(config, checks)
    }

    /// Run all checks and aggregate.
    ///
    /// If a run is already in progress (overlapping tick or concurrent
    /// health request), the previous snapshot is reused.
    pub async fn check(&self) -> SystemHealth {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("health check already running, reusing previous snapshot");
            if let Some(last) = self.last_snapshot() {
                return last;
            }
            // First-ever run raced; fall through and run anyway.
        }

        let result = self.run_all().await;
        *self.lock_last() = Some(result.clone());
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_all(&self) -> SystemHealth {
        let soft_timeout = self.config.check_timeout + CHECK_TIMEOUT_MARGIN;
        let futures = self.checks.iter().map(|check| {
            let check = Arc::clone(check);
            async move {
                let started = Instant::now();
                match tokio::time::timeout(soft_timeout, check.run()).await {
                    Ok(result) => result,
                    Err(_) => HealthCheckResult {
                        name: check.name().to_string(),
                        status: HealthStatus::Unhealthy,
                        message: format!(
                            "check timed out after {:.1}s",
                            soft_timeout.as_secs_f64()
                        ),
                        priority: check.priority() as u8,
                        duration_sec: started.elapsed().as_secs_f64(),
                        metadata: serde_json::Value::Null,
                    },
                }
            }
        });
        let checks = futures::future::join_all(futures).await;

        let mut status = HealthStatus::Healthy;
        for check in &checks {
            let weighted = match (check.status, check.priority) {
                (HealthStatus::Unhealthy, 0) => HealthStatus::Unhealthy,
                (HealthStatus::Unhealthy, _) => HealthStatus::Degraded,
                (s, _) => s,
            };
            status = status.max(weighted);
        }

        SystemHealth {
            status,
            checks,
            timestamp: Utc::now(),
            uptime_sec: self.started_at.elapsed().as_secs_f64(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Most recent snapshot, if any run completed.
    pub fn last_snapshot(&self) -> Option<SystemHealth> {
        self.lock_last().clone()
    }

    /// Monitor loop: tick every `check_interval` until shutdown.
    pub fn spawn_loop(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.check_interval.max(Duration::from_secs(5));
            let tick_budget = interval.mul_f64(0.9);
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let monitor = Arc::clone(&self);
                        if tokio::time::timeout(tick_budget, monitor.check()).await.is_err() {
                            tracing::warn!("health tick exceeded its budget");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("health monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn lock_last(&self) -> std::sync::MutexGuard<'_, Option<SystemHealth>> {
        match self.last.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// --- Built-in checks ---

/// CPU, memory, and disk pressure against configured thresholds.
struct SystemResourceCheck {
    cpu_threshold: f32,
    memory_threshold: f32,
    disk_threshold: f32,
}

#[async_trait]
impl HealthCheck for SystemResourceCheck {
    fn name(&self) -> &'static str {
        "system_resources"
    }

    fn priority(&self) -> CheckPriority {
        CheckPriority::Critical
    }

    async fn run(&self) -> HealthCheckResult {
        let started = Instant::now();

        let mut sys = System::new();
        sys.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu = sys.global_cpu_usage();
        let total_mem = sys.total_memory();
        let memory = if total_mem > 0 {
            (sys.used_memory() as f32 / total_mem as f32) * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space() - d.available_space();
                (used as f32 / d.total_space() as f32) * 100.0
            })
            .fold(0.0f32, f32::max);

        if total_mem == 0 && disks.list().is_empty() {
            return HealthCheckResult {
                name: self.name().to_string(),
                status: HealthStatus::Degraded,
                message: "system probes unavailable on this platform".to_string(),
                priority: self.priority() as u8,
                duration_sec: started.elapsed().as_secs_f64(),
                metadata: serde_json::Value::Null,
            };
        }

        let mut over = Vec::new();
        if cpu > self.cpu_threshold {
            over.push(format!("cpu {cpu:.0}%"));
        }
        if memory > self.memory_threshold {
            over.push(format!("memory {memory:.0}%"));
        }
        if disk > self.disk_threshold {
            over.push(format!("disk {disk:.0}%"));
        }

        let (status, message) = if over.is_empty() {
            (
                HealthStatus::Healthy,
                format!("cpu {cpu:.0}%, memory {memory:.0}%, disk {disk:.0}%"),
            )
        } else if cpu > 95.0 || memory > 95.0 || disk > 95.0 {
            (
                HealthStatus::Unhealthy,
                format!("resources critically exhausted: {}", over.join(", ")),
            )
        } else {
            (
                HealthStatus::Degraded,
                format!("over threshold: {}", over.join(", ")),
            )
        };

        HealthCheckResult {
            name: self.name().to_string(),
            status,
            message,
            priority: self.priority() as u8,
            duration_sec: started.elapsed().as_secs_f64(),
            metadata: json!({
                "cpu_percent": cpu,
                "memory_percent": memory,
                "disk_percent": disk,
            }),
        }
    }
}

/// Liveness and footprint of the gateway process itself.
struct ProcessCheck;

#[async_trait]
impl HealthCheck for ProcessCheck {
    fn name(&self) -> &'static str {
        "process"
    }

    fn priority(&self) -> CheckPriority {
        CheckPriority::Important
    }

    async fn run(&self) -> HealthCheckResult {
        let started = Instant::now();
        let result = sysinfo::get_current_pid().ok().and_then(|pid| {
            let mut sys = System::new();
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid).map(|p| {
                (
                    p.memory() / (1024 * 1024),
                    p.cpu_usage(),
                    p.run_time(),
                )
            })
        });

        match result {
            Some((rss_mb, cpu, run_time_sec)) => HealthCheckResult {
                name: self.name().to_string(),
                status: HealthStatus::Healthy,
                message: format!("rss {rss_mb} MB, cpu {cpu:.1}%, up {run_time_sec}s"),
                priority: self.priority() as u8,
                duration_sec: started.elapsed().as_secs_f64(),
                metadata: json!({
                    "rss_mb": rss_mb,
                    "cpu_percent": cpu,
                    "uptime_sec": run_time_sec,
                }),
            },
            None => HealthCheckResult {
                name: self.name().to_string(),
                status: HealthStatus::Degraded,
                message: "could not inspect own process".to_string(),
                priority: self.priority() as u8,
                duration_sec: started.elapsed().as_secs_f64(),
                metadata: serde_json::Value::Null,
            },
        }
    }
}

/// Every enabled tool's command must resolve on PATH.
struct ToolAvailabilityCheck {
    commands: Vec<String>,
}

#[async_trait]
impl HealthCheck for ToolAvailabilityCheck {
    fn name(&self) -> &'static str {
        "tool_availability"
    }

    fn priority(&self) -> CheckPriority {
        CheckPriority::Informational
    }

    async fn run(&self) -> HealthCheckResult {
        let started = Instant::now();
        let missing: Vec<&str> = self
            .commands
            .iter()
            .filter(|c| which::which(c.as_str()).is_err())
            .map(String::as_str)
            .collect();

        let (status, message) = if missing.is_empty() {
            (
                HealthStatus::Healthy,
                format!("{} tools resolved on PATH", self.commands.len()),
            )
        } else {
            (
                HealthStatus::Degraded,
                format!("missing from PATH: {}", missing.join(", ")),
            )
        };

        HealthCheckResult {
            name: self.name().to_string(),
            status,
            message,
            priority: self.priority() as u8,
            duration_sec: started.elapsed().as_secs_f64(),
            metadata: json!({ "missing": missing }),
        }
    }
}

/// Operator-configured external dependencies that must be present.
struct DependencyCheck {
    dependencies: Vec<String>,
}

#[async_trait]
impl HealthCheck for DependencyCheck {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn priority(&self) -> CheckPriority {
        CheckPriority::Informational
    }

    async fn run(&self) -> HealthCheckResult {
        let started = Instant::now();
        let missing: Vec<&str> = self
            .dependencies
            .iter()
            .filter(|d| which::which(d.as_str()).is_err())
            .map(String::as_str)
            .collect();

        let (status, message) = if self.dependencies.is_empty() {
            (HealthStatus::Healthy, "no dependencies configured".to_string())
        } else if missing.is_empty() {
            (
                HealthStatus::Healthy,
                format!("{} dependencies present", self.dependencies.len()),
            )
        } else {
            (
                HealthStatus::Unhealthy,
                format!("missing dependencies: {}", missing.join(", ")),
            )
        };

        HealthCheckResult {
            name: self.name().to_string(),
            status,
            message,
            priority: self.priority() as u8,
            duration_sec: started.elapsed().as_secs_f64(),
            metadata: json!({ "missing": missing }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HealthConfig {
        HealthConfig {
            check_interval: Duration::from_secs(30),
            cpu_threshold: 80.0,
            memory_threshold: 80.0,
            disk_threshold: 80.0,
            check_timeout: Duration::from_secs(5),
            dependencies: Vec::new(),
        }
    }

    struct StaticCheck {
        name: &'static str,
        status: HealthStatus,
        priority: CheckPriority,
    }

    #[async_trait]
    impl HealthCheck for StaticCheck {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> CheckPriority {
            self.priority
        }
        async fn run(&self) -> HealthCheckResult {
            HealthCheckResult {
                name: self.name.to_string(),
                status: self.status,
                message: String::new(),
                priority: self.priority as u8,
                duration_sec: 0.0,
                metadata: serde_json::Value::Null,
            }
        }
    }

    fn check(
        name: &'static str,
        status: HealthStatus,
        priority: CheckPriority,
    ) -> Arc<dyn HealthCheck> {
        Arc::new(StaticCheck {
            name,
            status,
            priority,
        })
    }

    #[tokio::test]
    async fn all_healthy_aggregates_healthy() {
        let monitor = HealthMonitor::new(
            config(),
            vec![
                check("a", HealthStatus::Healthy, CheckPriority::Critical),
                check("b", HealthStatus::Healthy, CheckPriority::Informational),
            ],
        );
        let health = monitor.check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.checks.len(), 2);
    }

    #[tokio::test]
    async fn critical_unhealthy_takes_gateway_unhealthy() {
        let monitor = HealthMonitor::new(
            config(),
            vec![
                check("a", HealthStatus::Unhealthy, CheckPriority::Critical),
                check("b", HealthStatus::Healthy, CheckPriority::Important),
            ],
        );
        assert_eq!(monitor.check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn important_unhealthy_only_degrades() {
        let monitor = HealthMonitor::new(
            config(),
            vec![
                check("a", HealthStatus::Healthy, CheckPriority::Critical),
                check("b", HealthStatus::Unhealthy, CheckPriority::Important),
            ],
        );
        assert_eq!(monitor.check().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn informational_unhealthy_only_degrades() {
        let monitor = HealthMonitor::new(
            config(),
            vec![check("a", HealthStatus::Unhealthy, CheckPriority::Informational)],
        );
        assert_eq!(monitor.check().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn any_degraded_degrades() {
        let monitor = HealthMonitor::new(
            config(),
            vec![
                check("a", HealthStatus::Healthy, CheckPriority::Critical),
                check("b", HealthStatus::Degraded, CheckPriority::Informational),
            ],
        );
        assert_eq!(monitor.check().await.status, HealthStatus::Degraded);
    }

    struct SlowCheck;

    #[async_trait]
    impl HealthCheck for SlowCheck {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn priority(&self) -> CheckPriority {
            CheckPriority::Critical
        }
        async fn run(&self) -> HealthCheckResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            unreachable!("check should have been timed out")
        }
    }

    #[tokio::test]
    async fn overdue_check_marked_unhealthy() {
        let mut cfg = config();
        cfg.check_timeout = Duration::from_millis(50);
        let monitor = HealthMonitor::new(cfg, vec![Arc::new(SlowCheck)]);
        let health = monitor.check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.checks[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn builtin_checks_produce_a_snapshot() {
        let monitor =
            HealthMonitor::with_builtin_checks(config(), vec!["sh".to_string()]);
        let health = monitor.check().await;
        assert_eq!(health.checks.len(), 4);
        assert!(health.uptime_sec >= 0.0);
        assert!(
            health
                .checks
                .iter()
                .all(|c| c.duration_sec >= 0.0 && c.priority <= 2)
        );
    }

    #[tokio::test]
    async fn tool_availability_flags_missing_binaries() {
        let check = ToolAvailabilityCheck {
            commands: vec!["sh".to_string(), "definitely-not-a-binary-xyz".to_string()],
        };
        let result = check.run().await;
        assert_eq!(result.status, HealthStatus::Degraded);
        assert!(result.message.contains("definitely-not-a-binary-xyz"));
    }

    #[tokio::test]
    async fn missing_dependency_is_unhealthy() {
        let check = DependencyCheck {
            dependencies: vec!["definitely-not-a-binary-xyz".to_string()],
        };
        let result = check.run().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn snapshot_cached_after_check() {
        let monitor = HealthMonitor::new(
            config(),
            vec![check("a", HealthStatus::Healthy, CheckPriority::Critical)],
        );
        assert!(monitor.last_snapshot().is_none());
        monitor.check().await;
        assert!(monitor.last_snapshot().is_some());
    }
}
