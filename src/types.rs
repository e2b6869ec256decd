//! Request and result types shared by the transports and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorContext, ErrorKind, ValidationError};

/// Maximum target length accepted on any transport.
pub const MAX_TARGET_LEN: usize = 255;
/// Maximum correlation ID length accepted on any transport.
pub const MAX_CORRELATION_ID_LEN: usize = 64;
/// Timeout bounds accepted on any transport, in seconds.
pub const TIMEOUT_RANGE_SEC: (f64, f64) = (1.0, 3600.0);

/// A single tool invocation request.
///
/// Constructed at the dispatcher after shape validation; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub target: String,
    #[serde(default)]
    pub extra_args: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ToolRequest {
    /// Validate the transport-level shape of the request.
    ///
    /// Grammar-level checks (forbidden characters, allowlists, target policy)
    /// happen later in the tool's grammar; this only enforces field bounds so
    /// malformed requests are rejected before any tool state is touched.
    pub fn validate_shape(&self, max_args_len: usize) -> Result<(), ValidationError> {
        if self.target.is_empty() || self.target.len() > MAX_TARGET_LEN {
            return Err(ValidationError::RequestShape {
                field: "target",
                message: format!("length must be 1..={MAX_TARGET_LEN}"),
            });
        }
        // The target lands in the child argv verbatim, so it obeys the same
        // metacharacter ban as extra_args.
        if let Some(found) = self
            .target
            .chars()
            .find(|c| crate::grammar::FORBIDDEN_CHARS.contains(c))
        {
            return Err(ValidationError::ForbiddenCharacter {
                found,
                token: self.target.clone(),
            });
        }
        if self.extra_args.len() > max_args_len {
            return Err(ValidationError::ArgsTooLong {
                length: self.extra_args.len(),
                max: max_args_len,
            });
        }
        if let Some(t) = self.timeout_sec {
            if !t.is_finite() || t < TIMEOUT_RANGE_SEC.0 || t > TIMEOUT_RANGE_SEC.1 {
                return Err(ValidationError::RequestShape {
                    field: "timeout_sec",
                    message: format!(
                        "must be in [{}, {}]",
                        TIMEOUT_RANGE_SEC.0, TIMEOUT_RANGE_SEC.1
                    ),
                });
            }
        }
        if let Some(ref id) = self.correlation_id {
            if id.len() > MAX_CORRELATION_ID_LEN {
                return Err(ValidationError::RequestShape {
                    field: "correlation_id",
                    message: format!("length must be 0..={MAX_CORRELATION_ID_LEN}"),
                });
            }
        }
        Ok(())
    }

    /// The correlation ID to thread through logs and the result, generating
    /// one when the caller did not supply it.
    pub fn correlation_id_or_new(&self) -> String {
        match self.correlation_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        }
    }
}

/// The structured outcome of one tool invocation.
///
/// Produced exactly once per request and never mutated. A failed invocation
/// is still a `ToolResult`: the failure class rides in `error_kind` and the
/// full context in `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    #[serde(default)]
    pub truncated_stdout: bool,
    #[serde(default)]
    pub truncated_stderr: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ToolResult {
    /// A result for an execution that never produced process output.
    pub fn from_error(ctx: ErrorContext, return_code: i32, correlation_id: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            return_code,
            truncated_stdout: false,
            truncated_stderr: false,
            timed_out: ctx.kind == ErrorKind::Timeout,
            error_kind: Some(ctx.kind),
            error: Some(ctx),
            execution_time: 0.0,
            correlation_id,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_kind.is_none() && !self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str) -> ToolRequest {
        ToolRequest {
            target: target.to_string(),
            extra_args: String::new(),
            timeout_sec: None,
            correlation_id: None,
        }
    }

    #[test]
    fn shape_accepts_boundary_lengths() {
        let mut req = request("10.0.0.1");
        req.extra_args = "a".repeat(2048);
        assert!(req.validate_shape(2048).is_ok());

        req.extra_args = "a".repeat(2049);
        assert!(matches!(
            req.validate_shape(2048),
            Err(ValidationError::ArgsTooLong { length: 2049, max: 2048 })
        ));
    }

    #[test]
    fn shape_rejects_empty_and_oversized_target() {
        assert!(request("").validate_shape(2048).is_err());
        assert!(request(&"x".repeat(256)).validate_shape(2048).is_err());
        assert!(request(&"x".repeat(255)).validate_shape(2048).is_ok());
    }

    #[test]
    fn shape_rejects_metacharacters_in_target() {
        assert!(request("10.0.0.1;id").validate_shape(2048).is_err());
        assert!(request("http://192.168.1.5/`id`").validate_shape(2048).is_err());
        assert!(request("192.168.1.10:http").validate_shape(2048).is_ok());
    }

    #[test]
    fn shape_bounds_timeout() {
        let mut req = request("10.0.0.1");
        req.timeout_sec = Some(0.5);
        assert!(req.validate_shape(2048).is_err());
        req.timeout_sec = Some(3601.0);
        assert!(req.validate_shape(2048).is_err());
        req.timeout_sec = Some(f64::NAN);
        assert!(req.validate_shape(2048).is_err());
        req.timeout_sec = Some(1.0);
        assert!(req.validate_shape(2048).is_ok());
    }

    #[test]
    fn correlation_id_generated_when_missing() {
        let req = request("10.0.0.1");
        let id = req.correlation_id_or_new();
        assert!(Uuid::parse_str(&id).is_ok());

        let mut req = request("10.0.0.1");
        req.correlation_id = Some("trace-7".to_string());
        assert_eq!(req.correlation_id_or_new(), "trace-7");
    }
}
