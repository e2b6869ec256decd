//! Per-tool execution metrics and the Prometheus bridge.
//!
//! Each tool gets a thread-safe record of counts, timings, and a bounded
//! ring of recent executions from which percentile snapshots are computed.
//! The registry caps itself at 1000 records, evicting the longest-idle tool,
//! and a background sweep drops records idle for more than 24 hours.
//!
//! Prometheus exposition rides on the `metrics` facade: when the exporter is
//! not installed the macros are no-ops, so recording is unconditional here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::error::ErrorKind;

/// Ring size for recent executions.
const RECENT_RING: usize = 100;

/// Maximum tool records kept before eviction.
const MAX_TOOL_RECORDS: usize = 1000;

/// Idle age after which the sweep drops a record.
const SWEEP_MAX_IDLE: Duration = Duration::from_secs(24 * 3600);

/// One recorded execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSample {
    pub at: DateTime<Utc>,
    pub duration_sec: f64,
    pub success: bool,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Default)]
struct Record {
    execution_count: u64,
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    total_time_sec: f64,
    min_time_sec: f64,
    max_time_sec: f64,
    last_execution: Option<DateTime<Utc>>,
    recent: VecDeque<ExecutionSample>,
}

/// Thread-safe metrics record for one tool.
#[derive(Debug)]
pub struct ToolMetrics {
    name: String,
    inner: Mutex<Record>,
}

/// Point-in-time view of a tool's metrics. Pure read: two consecutive
/// snapshots with no execution in between are equal.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub tool: String,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_time_sec: Option<f64>,
    pub max_time_sec: f64,
    pub avg_time_sec: f64,
    pub p50_sec: f64,
    pub p95_sec: f64,
    pub p99_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
}

impl ToolMetrics {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Record {
                min_time_sec: f64::INFINITY,
                ..Record::default()
            }),
        }
    }

    /// Record one execution outcome.
    ///
    /// Non-finite durations are logged and recorded as zero so a broken
    /// clock cannot poison the aggregates.
    pub fn record(
        &self,
        duration_sec: f64,
        success: bool,
        timed_out: bool,
        error_kind: Option<ErrorKind>,
    ) {
        let duration_sec = if !duration_sec.is_finite() {
            tracing::warn!(tool = %self.name, value = %duration_sec, "non-finite duration sanitized to 0");
            0.0
        } else {
            duration_sec.max(0.0)
        };

        let mut rec = self.lock();
        rec.execution_count += 1;
        if success {
            rec.success_count += 1;
        } else {
            rec.failure_count += 1;
        }
        if timed_out {
            rec.timeout_count += 1;
        }
        rec.total_time_sec += duration_sec;
        rec.min_time_sec = rec.min_time_sec.min(duration_sec);
        rec.max_time_sec = rec.max_time_sec.max(duration_sec);
        rec.last_execution = Some(Utc::now());
        if rec.recent.len() == RECENT_RING {
            rec.recent.pop_front();
        }
        rec.recent.push_back(ExecutionSample {
            at: Utc::now(),
            duration_sec,
            success,
            timed_out,
            error_kind,
        });
        drop(rec);

        let status = if success { "success" } else { "failure" };
        let error_type = error_kind.map(|k| k.as_str()).unwrap_or("none");
        counter!(
            "mcp_tool_execution_total",
            "tool" => self.name.clone(),
            "status" => status,
            "error_type" => error_type,
        )
        .increment(1);
        histogram!("mcp_tool_execution_seconds", "tool" => self.name.clone())
            .record(duration_sec);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let rec = self.lock();
        let mut sorted: Vec<f64> = rec.recent.iter().map(|s| s.duration_sec).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let pct = |p: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = ((sorted.len() as f64) * p).floor() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        MetricsSnapshot {
            tool: self.name.clone(),
            execution_count: rec.execution_count,
            success_count: rec.success_count,
            failure_count: rec.failure_count,
            timeout_count: rec.timeout_count,
            min_time_sec: rec.min_time_sec.is_finite().then_some(rec.min_time_sec),
            max_time_sec: rec.max_time_sec,
            avg_time_sec: if rec.execution_count > 0 {
                rec.total_time_sec / rec.execution_count as f64
            } else {
                0.0
            },
            p50_sec: pct(0.50),
            p95_sec: pct(0.95),
            p99_sec: pct(0.99),
            last_execution: rec.last_execution,
        }
    }

    fn last_execution(&self) -> Option<DateTime<Utc>> {
        self.lock().last_execution
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Record> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Map of per-tool records with bounded size.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<HashMap<String, Arc<ToolMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the record for a tool, evicting the longest-idle record
    /// when the registry is at capacity.
    pub fn tool(&self, name: &str) -> Arc<ToolMetrics> {
        let mut map = self.lock();
        if let Some(existing) = map.get(name) {
            return Arc::clone(existing);
        }
        if map.len() >= MAX_TOOL_RECORDS {
            let oldest = map
                .iter()
                .min_by_key(|(_, m)| m.last_execution().unwrap_or(DateTime::<Utc>::MIN_UTC))
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                tracing::debug!(tool = %key, "evicting idle metrics record at capacity");
                map.remove(&key);
            }
        }
        let created = Arc::new(ToolMetrics::new(name));
        map.insert(name.to_string(), Arc::clone(&created));
        created
    }

    /// Snapshot every tracked tool.
    pub fn snapshot_all(&self) -> Vec<MetricsSnapshot> {
        let map = self.lock();
        let mut snaps: Vec<MetricsSnapshot> = map.values().map(|m| m.snapshot()).collect();
        snaps.sort_by(|a, b| a.tool.cmp(&b.tool));
        snaps
    }

    /// Drop records idle longer than `max_idle`. Records that never executed
    /// are kept; they cost nothing and disappear via capacity eviction.
    pub fn sweep_idle(&self, max_idle: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_idle).unwrap_or_default();
        let mut map = self.lock();
        map.retain(|name, m| match m.last_execution() {
            Some(at) if at < cutoff => {
                tracing::debug!(tool = %name, "dropping metrics record idle past 24h");
                false
            }
            _ => true,
        });
    }

    /// Hourly idle sweep until shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.sweep_idle(SWEEP_MAX_IDLE),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ToolMetrics>>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Track the active-execution gauge for one tool across an await.
pub struct ActiveGuard {
    tool: String,
}

impl ActiveGuard {
    pub fn enter(tool: &str) -> Self {
        gauge!("mcp_tool_active", "tool" => tool.to_string()).increment(1.0);
        Self {
            tool: tool.to_string(),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        gauge!("mcp_tool_active", "tool" => self.tool.clone()).decrement(1.0);
    }
}

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the process-global Prometheus recorder once; subsequent calls
/// return the existing handle. Returns `None` (and records become no-ops)
/// when installation fails, e.g. another recorder is already registered.
pub fn install_prometheus() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("prometheus recorder unavailable, skipping: {e}");
                None
            }
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_minmax_track_executions() {
        let m = ToolMetrics::new("nmap");
        m.record(1.0, true, false, None);
        m.record(3.0, false, true, Some(ErrorKind::Timeout));
        let snap = m.snapshot();
        assert_eq!(snap.execution_count, 2);
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.timeout_count, 1);
        assert_eq!(snap.min_time_sec, Some(1.0));
        assert_eq!(snap.max_time_sec, 3.0);
        assert_eq!(snap.avg_time_sec, 2.0);
    }

    #[test]
    fn min_is_unset_before_first_execution() {
        let m = ToolMetrics::new("nmap");
        let snap = m.snapshot();
        assert_eq!(snap.min_time_sec, None);
        assert_eq!(snap.p50_sec, 0.0);
    }

    #[test]
    fn non_finite_durations_sanitized() {
        let m = ToolMetrics::new("nmap");
        m.record(f64::NAN, true, false, None);
        m.record(f64::INFINITY, true, false, None);
        m.record(-5.0, true, false, None);
        let snap = m.snapshot();
        assert_eq!(snap.min_time_sec, Some(0.0));
        assert_eq!(snap.max_time_sec, 0.0);
    }

    #[test]
    fn recent_ring_bounded_at_one_hundred() {
        let m = ToolMetrics::new("nmap");
        for i in 0..150 {
            m.record(i as f64, true, false, None);
        }
        let rec = m.lock();
        assert_eq!(rec.recent.len(), 100);
        // oldest fifty dropped
        assert_eq!(rec.recent.front().unwrap().duration_sec, 50.0);
    }

    #[test]
    fn percentiles_from_recent_ring() {
        let m = ToolMetrics::new("nmap");
        for i in 1..=100 {
            m.record(i as f64, true, false, None);
        }
        let snap = m.snapshot();
        assert_eq!(snap.p50_sec, 51.0);
        assert_eq!(snap.p95_sec, 96.0);
        assert_eq!(snap.p99_sec, 100.0);
    }

    #[test]
    fn snapshot_is_a_pure_read() {
        let m = ToolMetrics::new("nmap");
        m.record(1.5, true, false, None);
        assert_eq!(m.snapshot(), m.snapshot());
    }

    #[test]
    fn registry_reuses_records() {
        let registry = MetricsRegistry::new();
        let a = registry.tool("nmap");
        a.record(1.0, true, false, None);
        let b = registry.tool("nmap");
        assert_eq!(b.snapshot().execution_count, 1);
    }

    #[test]
    fn registry_evicts_longest_idle_at_capacity() {
        let registry = MetricsRegistry::new();
        for i in 0..MAX_TOOL_RECORDS {
            registry.tool(&format!("tool-{i}")).record(0.1, true, false, None);
        }
        // Backdate one record so it is unambiguously the eviction candidate.
        {
            let map = registry.lock();
            let mut rec = map.get("tool-0").unwrap().lock();
            rec.last_execution = Some(Utc::now() - chrono::Duration::hours(1));
        }
        registry.tool("one-more").record(0.1, true, false, None);
        let map = registry.lock();
        assert_eq!(map.len(), MAX_TOOL_RECORDS);
        assert!(!map.contains_key("tool-0"));
        assert!(map.contains_key("one-more"));
    }

    #[test]
    fn sweep_drops_only_stale_records() {
        let registry = MetricsRegistry::new();
        registry.tool("fresh").record(0.1, true, false, None);
        registry.tool("stale").record(0.1, true, false, None);
        // Backdate the stale record.
        {
            let map = registry.lock();
            let mut rec = map.get("stale").unwrap().lock();
            rec.last_execution = Some(Utc::now() - chrono::Duration::hours(25));
        }
        registry.sweep_idle(SWEEP_MAX_IDLE);
        let map = registry.lock();
        assert!(map.contains_key("fresh"));
        assert!(!map.contains_key("stale"));
    }
}
