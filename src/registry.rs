//! Tool registry.
//!
//! Tools are declared in a startup-time table of descriptors rather than
//! discovered dynamically: each entry bundles the command, its grammar, its
//! limits, and the circuit breaker that guards it. Include/exclude filters
//! from the environment decide which descriptors are registered at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::Config;
use crate::grammar::{
    ToolGrammar, gobuster::GobusterGrammar, hydra::HydraGrammar, masscan::MasscanGrammar,
    nmap::NmapGrammar, sqlmap::SqlmapGrammar,
};

/// Static description of one tool.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub command: &'static str,
    pub description: &'static str,
    /// Maximum concurrent executions.
    pub concurrency_cap: usize,
    /// Timeout applied when the request carries none.
    pub default_timeout: Duration,
}

/// A registered tool: descriptor plus its grammar and breaker.
pub struct ToolEntry {
    pub descriptor: ToolDescriptor,
    pub grammar: Box<dyn ToolGrammar>,
    pub breaker: Arc<CircuitBreaker>,
    enabled: AtomicBool,
}

impl ToolEntry {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(tool = self.descriptor.name, enabled, "tool toggled");
    }
}

/// The set of registered tools.
pub struct ToolRegistry {
    entries: HashMap<&'static str, Arc<ToolEntry>>,
}

impl ToolRegistry {
    /// Build the built-in scanner registry, honoring include/exclude filters.
    pub fn builtin(config: &Config) -> Self {
        let breaker_config = BreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            initial_recovery_timeout: config.breaker.recovery_timeout,
            ..BreakerConfig::default()
        };

        let mut entries: HashMap<&'static str, Arc<ToolEntry>> = HashMap::new();
        for (descriptor, grammar) in builtin_tools(config) {
            if !config.tools.permits(descriptor.name) {
                tracing::info!(tool = descriptor.name, "tool filtered out by include/exclude");
                continue;
            }
            let name = descriptor.name;
            entries.insert(
                name,
                Arc::new(ToolEntry {
                    breaker: CircuitBreaker::new(name, breaker_config.clone()),
                    descriptor,
                    grammar,
                    enabled: AtomicBool::new(true),
                }),
            );
        }
        tracing::info!(tools = entries.len(), "tool registry initialized");
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolEntry>> {
        self.entries.get(name).map(Arc::clone)
    }

    /// All registered entries, name-sorted for stable listings.
    pub fn list(&self) -> Vec<Arc<ToolEntry>> {
        let mut entries: Vec<_> = self.entries.values().map(Arc::clone).collect();
        entries.sort_by_key(|e| e.descriptor.name);
        entries
    }

    /// Names of currently enabled tools.
    pub fn enabled_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.is_enabled())
            .map(|e| e.descriptor.name)
            .collect();
        names.sort_unstable();
        names
    }
}

fn builtin_tools(config: &Config) -> Vec<(ToolDescriptor, Box<dyn ToolGrammar>)> {
    let default_concurrency = config.limits.default_concurrency;
    vec![
        (
            ToolDescriptor {
                name: "nmap",
                command: "nmap",
                description: "Network discovery and service fingerprinting",
                concurrency_cap: default_concurrency,
                default_timeout: Duration::from_secs(600),
            },
            Box::new(NmapGrammar) as Box<dyn ToolGrammar>,
        ),
        (
            ToolDescriptor {
                name: "masscan",
                command: "masscan",
                description: "High-rate TCP port sweeps of lab networks",
                concurrency_cap: 1,
                default_timeout: Duration::from_secs(300),
            },
            Box::new(MasscanGrammar),
        ),
        (
            ToolDescriptor {
                name: "gobuster",
                command: "gobuster",
                description: "Directory, DNS, and virtual-host enumeration",
                concurrency_cap: default_concurrency,
                default_timeout: Duration::from_secs(600),
            },
            Box::new(GobusterGrammar),
        ),
        (
            ToolDescriptor {
                name: "hydra",
                command: "hydra",
                description: "Credential testing against lab services",
                concurrency_cap: 1,
                default_timeout: Duration::from_secs(900),
            },
            Box::new(HydraGrammar),
        ),
        (
            ToolDescriptor {
                name: "sqlmap",
                command: "sqlmap",
                description: "SQL injection assessment of lab web applications",
                concurrency_cap: 1,
                default_timeout: Duration::from_secs(1200),
            },
            Box::new(SqlmapGrammar),
        ),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{
        BreakerSettings, HealthConfig, LimitsConfig, MetricsConfig, SecurityConfig, ServerConfig,
        ToolFilterConfig, Transport,
    };

    pub(crate) fn test_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                transport: Transport::Http,
                shutdown_grace: Duration::from_secs(5),
            },
            limits: LimitsConfig {
                max_args_len: 2048,
                max_stdout_bytes: 1024 * 1024,
                max_stderr_bytes: 256 * 1024,
                default_timeout: Duration::from_secs(30),
                default_concurrency: 2,
                max_memory_mb: 512,
                max_file_descriptors: 256,
            },
            security: SecurityConfig::default(),
            breaker: BreakerSettings {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
            },
            health: HealthConfig {
                check_interval: Duration::from_secs(30),
                cpu_threshold: 80.0,
                memory_threshold: 80.0,
                disk_threshold: 80.0,
                check_timeout: Duration::from_secs(10),
                dependencies: Vec::new(),
            },
            metrics: MetricsConfig {
                prometheus_enabled: false,
            },
            tools: ToolFilterConfig::default(),
        }
    }

    #[test]
    fn builtin_registry_has_all_five_scanners() {
        let registry = ToolRegistry::builtin(&test_config());
        for tool in ["nmap", "masscan", "gobuster", "hydra", "sqlmap"] {
            let entry = registry.get(tool).unwrap_or_else(|| panic!("{tool} missing"));
            assert!(entry.is_enabled());
            assert!(entry.descriptor.concurrency_cap >= 1);
        }
        assert_eq!(registry.list().len(), 5);
    }

    #[test]
    fn include_filter_restricts_registry() {
        let mut config = test_config();
        config.tools.include = vec!["nmap".to_string()];
        let registry = ToolRegistry::builtin(&config);
        assert!(registry.get("nmap").is_some());
        assert!(registry.get("masscan").is_none());
        assert_eq!(registry.enabled_names(), vec!["nmap"]);
    }

    #[test]
    fn exclude_filter_removes_tool() {
        let mut config = test_config();
        config.tools.exclude = vec!["hydra".to_string()];
        let registry = ToolRegistry::builtin(&config);
        assert!(registry.get("hydra").is_none());
        assert_eq!(registry.list().len(), 4);
    }

    #[test]
    fn toggle_flips_enabled_state() {
        let registry = ToolRegistry::builtin(&test_config());
        let entry = registry.get("nmap").unwrap();
        entry.set_enabled(false);
        assert!(!entry.is_enabled());
        assert!(!registry.enabled_names().contains(&"nmap"));
        entry.set_enabled(true);
        assert!(entry.is_enabled());
    }

    #[test]
    fn heavy_scanners_are_serialized() {
        let registry = ToolRegistry::builtin(&test_config());
        for tool in ["masscan", "hydra", "sqlmap"] {
            assert_eq!(registry.get(tool).unwrap().descriptor.concurrency_cap, 1);
        }
    }
}
