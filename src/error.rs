//! Error types for scangate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Top-level error type for the gateway binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed execution, surfaced to callers in results.
///
/// Every failure a caller can observe maps to exactly one kind; transports
/// use it to pick status codes and callers use it to decide whether a retry
/// makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    NotFound,
    ValidationError,
    ExecutionError,
    ResourceExhausted,
    CircuitBreakerOpen,
    Unknown,
}

impl ErrorKind {
    /// Stable string form used in metric labels and serialized results.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::CircuitBreakerOpen => "circuit_breaker_open",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured context attached to every failing result.
///
/// Carries a short actionable recovery hint alongside the machine-readable
/// kind so an orchestrator can both log something useful and branch on the
/// failure class. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub message: String,
    pub recovery_hint: String,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub target: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ErrorContext {
    pub fn new(kind: ErrorKind, message: impl Into<String>, tool_name: &str, target: &str) -> Self {
        Self {
            kind,
            message: message.into(),
            recovery_hint: String::new(),
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            target: target.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = hint.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to write response on {name}: {reason}")]
    WriteFailed { name: String, reason: String },
}

/// Argument/target validation failures.
///
/// Each variant knows its own recovery hint and, where the spec calls for
/// it, the offending token for result metadata.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("argument contains forbidden character {found:?}: {token:?}")]
    ForbiddenCharacter { found: char, token: String },

    #[error("extra_args is {length} bytes, limit is {max}")]
    ArgsTooLong { length: usize, max: usize },

    #[error("extra_args could not be tokenized: {reason}")]
    Tokenization { reason: String },

    #[error("token {token:?} is not an allowed flag or value for {tool}")]
    UnexpectedToken { tool: &'static str, token: String },

    #[error("flag {flag:?} is not in the {tool} allowlist")]
    FlagNotAllowed { tool: &'static str, flag: String },

    #[error("flag {flag:?} requires a value")]
    MissingFlagValue { flag: String },

    #[error("target {target:?} rejected: {reason}")]
    TargetRejected {
        target: String,
        reason: String,
        suggestion: Option<String>,
    },

    #[error("invalid port specification {spec:?}: {reason}")]
    InvalidPortSpec { spec: String, reason: String },

    #[error("invalid value {value:?} for {field}: {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("{tool} mode {mode:?} is not supported")]
    UnknownMode { tool: &'static str, mode: String },

    #[error("{tool} requires {what}")]
    MissingRequired {
        tool: &'static str,
        what: &'static str,
    },

    #[error("wordlist {path:?} rejected: {reason}")]
    WordlistRejected { path: String, reason: String },

    #[error("script selection is empty after policy filtering")]
    EmptyScriptSelection,

    #[error("service {service:?} is not an allowed hydra service")]
    ServiceNotAllowed { service: String },

    #[error("request field {field} invalid: {message}")]
    RequestShape {
        field: &'static str,
        message: String,
    },
}

impl ValidationError {
    /// Short actionable hint surfaced alongside the failure.
    pub fn recovery_hint(&self) -> String {
        match self {
            ValidationError::ForbiddenCharacter { .. } => {
                "Remove shell metacharacters from extra_args".to_string()
            }
            ValidationError::ArgsTooLong { max, .. } => {
                format!("Shorten extra_args to at most {max} bytes")
            }
            ValidationError::Tokenization { .. } => {
                "Balance quotes in extra_args".to_string()
            }
            ValidationError::UnexpectedToken { tool, .. } => {
                format!("Pass only allow-listed {tool} flags and their values")
            }
            ValidationError::FlagNotAllowed { tool, .. } => {
                format!("Consult the {tool} flag allowlist")
            }
            ValidationError::MissingFlagValue { flag } => {
                format!("Provide a value after {flag}")
            }
            ValidationError::TargetRejected { suggestion, .. } => match suggestion {
                Some(s) => format!("Use {s}"),
                None => "Use an RFC1918 address, loopback, or *.lab.internal".to_string(),
            },
            ValidationError::InvalidPortSpec { .. } => {
                "Use comma-separated ports in 1-65535 or a-b ranges".to_string()
            }
            ValidationError::InvalidFieldValue { field, .. } => {
                format!("Adjust the {field} value")
            }
            ValidationError::UnknownMode { tool, .. } => {
                format!("Pick a supported {tool} mode")
            }
            ValidationError::MissingRequired { what, .. } => {
                format!("Provide {what}")
            }
            ValidationError::WordlistRejected { .. } => {
                "Use an absolute wordlist path under an approved directory".to_string()
            }
            ValidationError::EmptyScriptSelection => {
                "Request at least one approved script or category".to_string()
            }
            ValidationError::ServiceNotAllowed { .. } => {
                "Pick a service from the hydra allowed-services set".to_string()
            }
            ValidationError::RequestShape { field, .. } => {
                format!("Fix the {field} field and resend")
            }
        }
    }

    /// Offending-token metadata for the structured result, where applicable.
    pub fn metadata(&self) -> serde_json::Value {
        match self {
            ValidationError::ForbiddenCharacter { token, found } => {
                json!({ "token": token, "character": found.to_string() })
            }
            ValidationError::UnexpectedToken { token, .. } => json!({ "token": token }),
            ValidationError::FlagNotAllowed { flag, .. } => json!({ "token": flag }),
            ValidationError::MissingFlagValue { flag } => json!({ "token": flag }),
            ValidationError::TargetRejected {
                suggestion: Some(s),
                ..
            } => json!({ "suggested_cidr": s }),
            ValidationError::InvalidPortSpec { spec, .. } => json!({ "token": spec }),
            ValidationError::ServiceNotAllowed { service } => json!({ "token": service }),
            ValidationError::WordlistRejected { path, .. } => json!({ "path": path }),
            _ => serde_json::Value::Null,
        }
    }

    /// Build the full error context for a failing result.
    pub fn into_context(self, tool_name: &str, target: &str) -> ErrorContext {
        let hint = self.recovery_hint();
        let metadata = self.metadata();
        ErrorContext::new(ErrorKind::ValidationError, self.to_string(), tool_name, target)
            .with_hint(hint)
            .with_metadata(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trips_through_serde() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::NotFound,
            ErrorKind::ValidationError,
            ErrorKind::ExecutionError,
            ErrorKind::ResourceExhausted,
            ErrorKind::CircuitBreakerOpen,
            ErrorKind::Unknown,
        ] {
            let s = serde_json::to_string(&kind).unwrap();
            assert_eq!(s.trim_matches('"'), kind.as_str());
            let back: ErrorKind = serde_json::from_str(&s).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::ForbiddenCharacter {
            found: ';',
            token: "80;id".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("80;id"), "should mention the token: {msg}");

        let err = ValidationError::ArgsTooLong {
            length: 3000,
            max: 2048,
        };
        let msg = err.to_string();
        assert!(msg.contains("2048"), "should mention the limit: {msg}");
    }

    #[test]
    fn target_rejection_carries_suggested_cidr() {
        let err = ValidationError::TargetRejected {
            target: "10.0.0.0/21".to_string(),
            reason: "network too large".to_string(),
            suggestion: Some("10.0.0.0/22".to_string()),
        };
        let ctx = err.into_context("nmap", "10.0.0.0/21");
        assert_eq!(ctx.kind, ErrorKind::ValidationError);
        assert_eq!(ctx.metadata["suggested_cidr"], "10.0.0.0/22");
        assert!(ctx.recovery_hint.contains("10.0.0.0/22"));
    }

    #[test]
    fn context_timestamp_is_recent_utc() {
        let ctx = ErrorContext::new(ErrorKind::Timeout, "timed out", "nmap", "10.0.0.1");
        let age = Utc::now() - ctx.timestamp;
        assert!(age.num_seconds() < 5);
    }
}
