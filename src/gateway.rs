//! Request orchestration.
//!
//! One place owns the full pipeline for a request: registry lookup, grammar
//! validation, circuit-breaker gate, engine execution, metrics emission.
//! Both transports call into this and only decide how to serialize what
//! comes back.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use crate::breaker::{Admission, BreakerSnapshot};
use crate::config::Config;
use crate::error::{ErrorContext, ErrorKind};
use crate::exec::ExecutionEngine;
use crate::grammar::GrammarPolicy;
use crate::metrics::{ActiveGuard, MetricsRegistry, MetricsSnapshot};
use crate::registry::{ToolEntry, ToolRegistry};
use crate::types::{ToolRequest, ToolResult};

/// Return code attached to validation failures (no process ran).
const VALIDATION_RETURN_CODE: i32 = 2;

/// Failures the transports map to status codes before any result exists.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool {0} is disabled")]
    ToolDisabled(String),
}

/// Serializable per-tool status for listings.
#[derive(Debug, Serialize)]
pub struct ToolStatus {
    pub name: &'static str,
    pub command: &'static str,
    pub description: &'static str,
    pub enabled: bool,
    pub concurrency_cap: usize,
    pub default_timeout_sec: f64,
    pub breaker: BreakerSnapshot,
    pub metrics: MetricsSnapshot,
}

/// The tool execution gateway.
pub struct Gateway {
    registry: ToolRegistry,
    engine: ExecutionEngine,
    metrics: Arc<MetricsRegistry>,
    grammar_policy: GrammarPolicy,
    max_args_len: usize,
}

impl Gateway {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            registry: ToolRegistry::builtin(config),
            engine: ExecutionEngine::new(config.limits.clone()),
            metrics: MetricsRegistry::new(),
            grammar_policy: GrammarPolicy::from_config(&config.limits, &config.security),
            max_args_len: config.limits.max_args_len,
        })
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one request end to end.
    pub async fn execute(
        &self,
        tool_name: &str,
        request: &ToolRequest,
    ) -> Result<ToolResult, DispatchError> {
        let entry = self
            .registry
            .get(tool_name)
            .ok_or_else(|| DispatchError::UnknownTool(tool_name.to_string()))?;
        if !entry.is_enabled() {
            return Err(DispatchError::ToolDisabled(tool_name.to_string()));
        }

        let correlation_id = request.correlation_id_or_new();

        if let Err(err) = request.validate_shape(self.max_args_len) {
            return Ok(validation_result(&entry, err, request, correlation_id));
        }

        let argv = match entry.grammar.build_argv(
            &request.target,
            &request.extra_args,
            &self.grammar_policy,
        ) {
            Ok(argv) => argv,
            Err(err) => {
                tracing::warn!(
                    tool = tool_name,
                    correlation_id = %correlation_id,
                    target = %request.target,
                    error = %err,
                    "validation rejected request"
                );
                return Ok(validation_result(&entry, err, request, correlation_id));
            }
        };

        let permit = match entry.breaker.try_acquire() {
            Admission::Allowed(permit) => permit,
            Admission::Rejected { retry_after } => {
                tracing::warn!(
                    tool = tool_name,
                    correlation_id = %correlation_id,
                    retry_after_sec = retry_after.as_secs_f64(),
                    "circuit breaker rejected request"
                );
                let ctx = ErrorContext::new(
                    ErrorKind::CircuitBreakerOpen,
                    format!("{tool_name} circuit breaker is open"),
                    tool_name,
                    &request.target,
                )
                .with_hint("Wait for the recovery timeout or check service health")
                .with_metadata(json!({ "retry_after_sec": retry_after.as_secs_f64() }));
                return Ok(ToolResult::from_error(ctx, 1, correlation_id));
            }
        };

        let timeout = request
            .timeout_sec
            .map(Duration::from_secs_f64)
            .unwrap_or(entry.descriptor.default_timeout);

        let _active = ActiveGuard::enter(tool_name);
        let result = self
            .engine
            .execute(
                tool_name,
                entry.descriptor.command,
                entry.descriptor.concurrency_cap,
                &argv,
                &request.target,
                timeout,
                &correlation_id,
            )
            .await;

        match result.error_kind {
            None => permit.succeed(),
            Some(kind) => permit.fail(&format!("{kind}: rc={}", result.return_code)),
        }

        self.metrics.tool(tool_name).record(
            result.execution_time,
            result.error_kind.is_none() && result.return_code == 0,
            result.timed_out,
            result.error_kind,
        );

        Ok(result)
    }

    /// Enable or disable a tool.
    pub fn set_enabled(&self, tool_name: &str, enabled: bool) -> Result<(), DispatchError> {
        let entry = self
            .registry
            .get(tool_name)
            .ok_or_else(|| DispatchError::UnknownTool(tool_name.to_string()))?;
        entry.set_enabled(enabled);
        Ok(())
    }

    /// Status listing for `/tools`.
    pub fn tool_statuses(&self) -> Vec<ToolStatus> {
        self.registry
            .list()
            .into_iter()
            .map(|entry| ToolStatus {
                name: entry.descriptor.name,
                command: entry.descriptor.command,
                description: entry.descriptor.description,
                enabled: entry.is_enabled(),
                concurrency_cap: entry.descriptor.concurrency_cap,
                default_timeout_sec: entry.descriptor.default_timeout.as_secs_f64(),
                breaker: entry.breaker.snapshot(),
                metrics: self.metrics.tool(entry.descriptor.name).snapshot(),
            })
            .collect()
    }

    /// Wait for in-flight executions to finish, then force-kill residuals.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.engine.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    active = self.engine.active_count(),
                    "shutdown grace period expired with executions in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.engine.tracker().kill_all();
    }
}

fn validation_result(
    entry: &ToolEntry,
    err: crate::error::ValidationError,
    request: &ToolRequest,
    correlation_id: String,
) -> ToolResult {
    let ctx = err.into_context(entry.descriptor.name, &request.target);
    ToolResult::from_error(ctx, VALIDATION_RETURN_CODE, correlation_id)
}
