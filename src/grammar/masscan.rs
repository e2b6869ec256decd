//! Masscan argument grammar.

use crate::error::ValidationError;
use crate::grammar::{
    Arg, FlagSpec, GrammarPolicy, ToolGrammar, UnknownFlagPolicy, check_universal, classify,
    flag_value, has_flag, set_flag_value, tokenize, validate_port_spec,
};
use crate::policy::parse_scan_target;

/// Absolute ceiling on one masscan sweep (4 × the preferred network size).
const MAX_NETWORK_SIZE: u64 = 65536;
const MAX_HOSTS: u64 = 4 * MAX_NETWORK_SIZE;

/// Floor applied to caller-supplied packet rates.
const MIN_RATE: u32 = 100;

const SPEC: FlagSpec = FlagSpec {
    tool: "masscan",
    allowed: &[
        "-p",
        "--ports",
        "--rate",
        "--max-rate",
        "--wait",
        "--retries",
        "--banners",
        "-e",
        "--interface",
        "--source-ip",
        "--source-port",
        "--router-ip",
        "--router-mac",
        "--exclude",
        "--excludefile",
        "-oG",
        "-oJ",
        "-oX",
        "-oL",
    ],
    requires_value: &[
        "-p",
        "--ports",
        "--rate",
        "--max-rate",
        "--wait",
        "--retries",
        "-e",
        "--interface",
        "--source-ip",
        "--source-port",
        "--router-ip",
        "--router-mac",
        "--exclude",
        "--excludefile",
        "-oG",
        "-oJ",
        "-oX",
        "-oL",
    ],
};

/// Ports swept when the caller names none.
const SAFE_PORTS: &str = "80,443,22,21,23,25,3306,3389,8080,8443";
const INTRUSIVE_EXTRA_PORTS: &str = "110,111,135,139,143,445,993,995,1723,5900";

pub struct MasscanGrammar;

impl ToolGrammar for MasscanGrammar {
    fn tool(&self) -> &'static str {
        "masscan"
    }

    fn build_argv(
        &self,
        target: &str,
        extra_args: &str,
        policy: &GrammarPolicy,
    ) -> Result<Vec<String>, ValidationError> {
        let parsed = parse_scan_target(target, MAX_HOSTS)?;
        if parsed.host_count() > MAX_NETWORK_SIZE {
            tracing::warn!(
                target,
                hosts = parsed.host_count(),
                preferred_max = MAX_NETWORK_SIZE,
                "large masscan sweep admitted over preferred network size"
            );
        }

        let tokens = tokenize(extra_args, policy.max_args_len)?;
        check_universal("masscan", &tokens)?;
        let mut args = classify(tokens, &SPEC, false, UnknownFlagPolicy::Reject)?;

        if !policy.allow_intrusive && has_flag(&args, &["--banners"]) {
            tracing::warn!(target, "banners_blocked: --banners requires intrusive policy");
            args.retain(|a| !matches!(a, Arg::Flag { name, .. } if name == "--banners"));
        }

        if let Some(ports) = flag_value(&args, &["-p", "--ports"]) {
            validate_port_spec(ports, 100, true)?;
        }

        for rate_flag in ["--rate", "--max-rate"] {
            if let Some(value) = flag_value(&args, &[rate_flag]) {
                let rate: u32 =
                    value
                        .parse()
                        .map_err(|_| ValidationError::InvalidFieldValue {
                            field: "rate",
                            value: value.to_string(),
                            reason: "not a decimal packets-per-second rate".to_string(),
                        })?;
                let clamped = rate.clamp(MIN_RATE, policy.max_scan_rate);
                if clamped != rate {
                    tracing::warn!(rate, clamped, "masscan rate clamped into policy range");
                    set_flag_value(&mut args, rate_flag, clamped.to_string());
                }
            }
        }

        if let Some(wait) = flag_value(&args, &["--wait"]) {
            let secs: u32 = wait
                .parse()
                .map_err(|_| ValidationError::InvalidFieldValue {
                    field: "--wait",
                    value: wait.to_string(),
                    reason: "not a decimal number of seconds".to_string(),
                })?;
            if secs > 5 {
                set_flag_value(&mut args, "--wait", "5".to_string());
                tracing::warn!(wait = secs, "masscan wait clamped to 5 seconds");
            }
        }

        let mut argv = Vec::new();
        for arg in &args {
            arg.push_onto(&mut argv);
        }

        if !has_flag(&args, &["--rate", "--max-rate"]) {
            argv.push("--rate".to_string());
            argv.push(policy.max_scan_rate.min(1000).to_string());
        }
        if !has_flag(&args, &["--wait"]) {
            argv.push("--wait".to_string());
            argv.push(policy.masscan_wait_sec.to_string());
        }
        if !has_flag(&args, &["--retries"]) {
            argv.push("--retries".to_string());
            argv.push("1".to_string());
        }
        if !has_flag(&args, &["-p", "--ports"]) {
            argv.push("-p".to_string());
            if policy.allow_intrusive {
                argv.push(format!("{SAFE_PORTS},{INTRUSIVE_EXTRA_PORTS}"));
            } else {
                argv.push(SAFE_PORTS.to_string());
            }
        }

        argv.push(target.to_string());
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(target: &str, extra: &str, intrusive: bool) -> Result<Vec<String>, ValidationError> {
        let policy = GrammarPolicy {
            allow_intrusive: intrusive,
            ..GrammarPolicy::default()
        };
        MasscanGrammar.build_argv(target, extra, &policy)
    }

    #[test]
    fn banners_dropped_without_intrusive_policy() {
        let argv = build("10.0.0.0/28", "--banners -p 80", false).unwrap();
        assert!(!argv.contains(&"--banners".to_string()));
        let p = argv.iter().position(|t| t == "-p").unwrap();
        assert_eq!(argv[p + 1], "80");
        let r = argv.iter().position(|t| t == "--rate").unwrap();
        assert!(argv[r + 1].parse::<u32>().unwrap() <= 1000);
        assert!(argv.windows(2).any(|w| w == ["--wait", "0"]));
        assert!(argv.windows(2).any(|w| w == ["--retries", "1"]));
    }

    #[test]
    fn banners_kept_with_intrusive_policy() {
        let argv = build("10.0.0.0/28", "--banners", true).unwrap();
        assert!(argv.contains(&"--banners".to_string()));
    }

    #[test]
    fn defaults_injected_for_bare_request() {
        let argv = build("192.168.0.0/24", "", false).unwrap();
        assert!(argv.windows(2).any(|w| w == ["--rate", "1000"]));
        assert!(argv.windows(2).any(|w| w == ["-p", SAFE_PORTS]));
        assert_eq!(argv.last().unwrap(), "192.168.0.0/24");
    }

    #[test]
    fn intrusive_default_ports_are_wider() {
        let argv = build("192.168.0.0/24", "", true).unwrap();
        let p = argv.iter().position(|t| t == "-p").unwrap();
        assert!(argv[p + 1].contains("445"));
    }

    #[test]
    fn port_spec_rules() {
        assert!(build("10.0.0.1", "-p T:80", false).is_ok());
        assert!(build("10.0.0.1", "-p 80-443", false).is_ok());
        assert!(build("10.0.0.1", "-p 0", false).is_err());
        assert!(build("10.0.0.1", "-p 80-79", false).is_err());
    }

    #[test]
    fn rate_clamped_into_policy_range() {
        let argv = build("10.0.0.1", "--rate 999999", false).unwrap();
        let r = argv.iter().position(|t| t == "--rate").unwrap();
        assert_eq!(argv[r + 1], "1000");

        let argv = build("10.0.0.1", "--rate 1", false).unwrap();
        let r = argv.iter().position(|t| t == "--rate").unwrap();
        assert_eq!(argv[r + 1], "100");
    }

    #[test]
    fn network_size_ceiling() {
        // 4 * 65536 hosts = /14 is the hard cap
        assert!(build("10.0.0.0/14", "", false).is_ok());
        assert!(build("10.0.0.0/13", "", false).is_err());
    }

    #[test]
    fn public_targets_rejected() {
        assert!(build("8.8.8.0/24", "", false).is_err());
    }

    #[test]
    fn forbidden_characters_rejected() {
        assert!(build("10.0.0.1", "-p \"80>out\"", false).is_err());
    }
}
