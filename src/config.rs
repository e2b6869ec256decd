//! Configuration for scangate.
//!
//! All settings come from environment variables (a `.env` file is honored in
//! development). Out-of-range numeric values are clamped into their safe
//! range with a WARN naming the variable, so a typo degrades safely instead
//! of disabling a limit.

use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub security: SecurityConfig,
    pub breaker: BreakerSettings,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub tools: ToolFilterConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::from_env()?,
            limits: LimitsConfig::from_env()?,
            security: SecurityConfig::from_env()?,
            breaker: BreakerSettings::from_env()?,
            health: HealthConfig::from_env()?,
            metrics: MetricsConfig::from_env()?,
            tools: ToolFilterConfig::from_env()?,
        })
    }
}

/// Which transport the dispatcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Transport::Stdio),
            "http" => Ok(Transport::Http),
            other => Err(format!("unknown transport {other:?} (expected stdio|http)")),
        }
    }
}

/// Server/transport configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    /// How long shutdown waits for in-flight executions before group-killing.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let transport = optional_env("MCP_SERVER_TRANSPORT")?
            .map(|s| {
                s.parse::<Transport>()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "MCP_SERVER_TRANSPORT".to_string(),
                        message: e,
                    })
            })
            .transpose()?
            .unwrap_or(Transport::Stdio);

        Ok(Self {
            host: optional_env("MCP_SERVER_HOST")?.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_optional_env("MCP_SERVER_PORT", 8080u16)?,
            transport,
            shutdown_grace: Duration::from_secs_f64(parse_clamped_env(
                "MCP_SERVER_SHUTDOWN_GRACE_PERIOD",
                30.0,
                0.0,
                300.0,
            )?),
        })
    }
}

/// Per-execution resource and size limits.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Maximum accepted `extra_args` length in bytes.
    pub max_args_len: usize,
    /// Captured stdout cap in bytes.
    pub max_stdout_bytes: usize,
    /// Captured stderr cap in bytes.
    pub max_stderr_bytes: usize,
    /// Timeout applied when the request does not specify one.
    pub default_timeout: Duration,
    /// Semaphore size for tools without an explicit concurrency cap.
    pub default_concurrency: usize,
    /// RLIMIT_AS for child processes, in MiB.
    pub max_memory_mb: u64,
    /// RLIMIT_NOFILE for child processes.
    pub max_file_descriptors: u64,
}

impl LimitsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_args_len: parse_clamped_env("MCP_MAX_ARGS_LEN", 2048usize, 64, 65536)?,
            max_stdout_bytes: parse_clamped_env(
                "MCP_MAX_STDOUT_BYTES",
                1024 * 1024usize,
                1024,
                64 * 1024 * 1024,
            )?,
            max_stderr_bytes: parse_clamped_env(
                "MCP_MAX_STDERR_BYTES",
                256 * 1024usize,
                1024,
                16 * 1024 * 1024,
            )?,
            default_timeout: Duration::from_secs_f64(parse_clamped_env(
                "MCP_DEFAULT_TIMEOUT_SEC",
                300.0,
                1.0,
                3600.0,
            )?),
            default_concurrency: parse_clamped_env("MCP_DEFAULT_CONCURRENCY", 2usize, 1, 64)?,
            max_memory_mb: parse_clamped_env("MCP_MAX_MEMORY_MB", 512u64, 16, 16384)?,
            max_file_descriptors: parse_clamped_env("MCP_MAX_FILE_DESCRIPTORS", 256u64, 16, 4096)?,
        })
    }
}

/// Security policy knobs shared by all tool grammars.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Permit intrusive scanner features (`-A`, `--banners`, vuln scripts,
    /// non-approved extensions). Off by default.
    pub allow_intrusive: bool,
    /// Upper bound for masscan packet rates.
    pub max_scan_rate: u32,
    /// Masscan `--wait` default injected when absent, clamped to [0, 5].
    pub masscan_wait_sec: u32,
    /// Inject `-l admin -P <wordlist>` when a hydra request omits login or
    /// password specifiers. When off, such requests fail validation instead.
    pub hydra_inject_default_creds: bool,
}

impl SecurityConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            allow_intrusive: parse_optional_env("MCP_SECURITY_ALLOW_INTRUSIVE", false)?,
            max_scan_rate: parse_clamped_env("MCP_SECURITY_MAX_SCAN_RATE", 1000u32, 100, 100_000)?,
            masscan_wait_sec: parse_clamped_env("MCP_MASSCAN_WAIT_SEC", 0u32, 0, 5)?,
            hydra_inject_default_creds: parse_optional_env("MCP_HYDRA_INJECT_DEFAULT_CREDS", true)?,
        })
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_intrusive: false,
            max_scan_rate: 1000,
            masscan_wait_sec: 0,
            hydra_inject_default_creds: true,
        }
    }
}

/// Circuit-breaker tuning.
///
/// Only the failure threshold and initial recovery timeout are exposed as
/// environment variables; the adaptive-backoff parameters are fixed policy.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl BreakerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            failure_threshold: parse_clamped_env(
                "MCP_CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5u32,
                1,
                100,
            )?,
            recovery_timeout: Duration::from_secs_f64(parse_clamped_env(
                "MCP_CIRCUIT_BREAKER_RECOVERY_TIMEOUT",
                60.0,
                1.0,
                3600.0,
            )?),
        })
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Monitor tick interval, clamped to at least 5 seconds.
    pub check_interval: Duration,
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub disk_threshold: f32,
    /// Per-check soft timeout.
    pub check_timeout: Duration,
    /// External commands the dependency check requires on PATH.
    pub dependencies: Vec<String>,
}

impl HealthConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            check_interval: Duration::from_secs_f64(parse_clamped_env(
                "MCP_HEALTH_CHECK_INTERVAL",
                30.0,
                5.0,
                3600.0,
            )?),
            cpu_threshold: parse_clamped_env("MCP_HEALTH_CPU_THRESHOLD", 80.0f32, 1.0, 100.0)?,
            memory_threshold: parse_clamped_env(
                "MCP_HEALTH_MEMORY_THRESHOLD",
                80.0f32,
                1.0,
                100.0,
            )?,
            disk_threshold: parse_clamped_env("MCP_HEALTH_DISK_THRESHOLD", 80.0f32, 1.0, 100.0)?,
            check_timeout: Duration::from_secs_f64(parse_clamped_env(
                "MCP_HEALTH_TIMEOUT",
                10.0,
                1.0,
                120.0,
            )?),
            dependencies: comma_list(optional_env("MCP_HEALTH_DEPENDENCIES")?),
        })
    }
}

/// Metrics/Prometheus configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub prometheus_enabled: bool,
}

impl MetricsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            prometheus_enabled: parse_optional_env("MCP_METRICS_PROMETHEUS_ENABLED", true)?,
        })
    }
}

/// Tool include/exclude filtering applied at registry startup.
#[derive(Debug, Clone, Default)]
pub struct ToolFilterConfig {
    /// When non-empty, only these tools are enabled.
    pub include: Vec<String>,
    /// Tools disabled even if included.
    pub exclude: Vec<String>,
}

impl ToolFilterConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            include: comma_list(optional_env("TOOL_INCLUDE")?),
            exclude: comma_list(optional_env("TOOL_EXCLUDE")?),
        })
    }

    /// Whether a tool survives the include/exclude filters.
    pub fn permits(&self, name: &str) -> bool {
        if self.exclude.iter().any(|t| t.eq_ignore_ascii_case(name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|t| t.eq_ignore_ascii_case(name))
    }
}

fn comma_list(value: Option<String>) -> Vec<String> {
    value
        .map(|s| {
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

/// Parse a numeric env var and clamp it into `[min, max]`, warning when the
/// provided value fell outside the range.
pub(crate) fn parse_clamped_env<T>(key: &str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Copy + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let value = parse_optional_env(key, default)?;
    if value < min {
        tracing::warn!(key, %value, %min, "config value below range, clamping");
        Ok(min)
    } else if value > max {
        tracing::warn!(key, %value, %max, "config value above range, clamping");
        Ok(max)
    } else {
        Ok(value)
    }
}
