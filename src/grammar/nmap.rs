//! Nmap argument grammar.

use crate::error::ValidationError;
use crate::grammar::{
    Arg, FlagSpec, GrammarPolicy, PlaceholderBridge, ToolGrammar, UnknownFlagPolicy, check_universal,
    classify, flag_value, has_flag, tokenize, validate_port_spec,
};
use crate::policy::parse_scan_target;

/// Largest network an nmap request may cover (/22).
const MAX_HOSTS: u64 = 1024;

const SPEC: FlagSpec = FlagSpec {
    tool: "nmap",
    allowed: &[
        "-sV",
        "-sC",
        "-p",
        "--top-ports",
        "-Pn",
        "-O",
        "--script",
        "-oX",
        "-oN",
        "-oG",
        "--max-parallelism",
        "-T0",
        "-T1",
        "-T2",
        "-T3",
        "-T4",
        "-T5",
        "--min-rate",
        "--max-rate",
        "--max-retries",
        "--host-timeout",
        "-f",
        "--mtu",
        // admitted only under allow_intrusive; checked separately below
        "-A",
    ],
    requires_value: &[
        "-p",
        "--top-ports",
        "--script",
        "-oX",
        "-oN",
        "-oG",
        "--max-parallelism",
        "--min-rate",
        "--max-rate",
        "--max-retries",
        "--host-timeout",
        "--mtu",
    ],
};

const TIMING_FLAGS: &[&str] = &["-T0", "-T1", "-T2", "-T3", "-T4", "-T5"];

/// Script categories that never touch the target beyond what a scan already
/// does.
const SAFE_CATEGORIES: &[&str] = &["safe", "default", "discovery", "version"];

const SAFE_SCRIPTS: &[&str] = &[
    "banner",
    "http-headers",
    "http-title",
    "ssl-cert",
    "ssh-hostkey",
    "smb-os-discovery",
    "dns-service-discovery",
];

const INTRUSIVE_CATEGORIES: &[&str] = &["vuln", "exploit", "intrusive", "brute", "dos", "fuzzer"];

/// Intrusive scripts admitted by exact name under `allow_intrusive`.
const INTRUSIVE_SCRIPTS: &[&str] = &["ssl-heartbleed", "smb-brute", "http-brute", "ftp-anon"];

/// Wildcard families that are intrusive as a whole.
const INTRUSIVE_SCRIPT_PREFIXES: &[&str] = &["http-vuln-", "smb-vuln-", "mysql-vuln-"];

pub struct NmapGrammar;

impl ToolGrammar for NmapGrammar {
    fn tool(&self) -> &'static str {
        "nmap"
    }

    fn build_argv(
        &self,
        target: &str,
        extra_args: &str,
        policy: &GrammarPolicy,
    ) -> Result<Vec<String>, ValidationError> {
        parse_scan_target(target, MAX_HOSTS)?;

        let tokens = tokenize(extra_args, policy.max_args_len)?;
        check_universal("nmap", &tokens)?;
        let mut args = classify(tokens, &SPEC, false, UnknownFlagPolicy::Reject)?;

        if !policy.allow_intrusive && has_flag(&args, &["-A"]) {
            return Err(ValidationError::FlagNotAllowed {
                tool: "nmap",
                flag: "-A".to_string(),
            });
        }

        if let Some(ports) = flag_value(&args, &["-p"]) {
            validate_port_spec(ports, 100, false)?;
        }
        if let Some(top) = flag_value(&args, &["--top-ports"]) {
            let n: u32 = top.parse().map_err(|_| ValidationError::InvalidFieldValue {
                field: "--top-ports",
                value: top.to_string(),
                reason: "not a decimal count".to_string(),
            })?;
            if n == 0 || n > 65535 {
                return Err(ValidationError::InvalidFieldValue {
                    field: "--top-ports",
                    value: top.to_string(),
                    reason: "must be in 1-65535".to_string(),
                });
            }
        }

        filter_scripts(&mut args, policy.allow_intrusive)?;

        let mut argv = Vec::new();
        for arg in &args {
            arg.push_onto(&mut argv);
        }

        // Defaults injected when the caller did not choose their own.
        if !has_flag(&args, TIMING_FLAGS) {
            argv.push("-T4".to_string());
        }
        if !has_flag(&args, &["--max-parallelism"]) {
            argv.push("--max-parallelism".to_string());
            argv.push("10".to_string());
        }
        if !has_flag(&args, &["-Pn"]) {
            argv.push("-Pn".to_string());
        }
        if !has_flag(&args, &["-p", "--top-ports"]) {
            argv.push("--top-ports".to_string());
            argv.push("1000".to_string());
        }

        argv.push(target.to_string());
        // No bridged values in nmap, but restoring keeps the pipeline uniform.
        PlaceholderBridge::new().restore(argv)
    }
}

/// Filter `--script` selections down to approved categories and scripts.
///
/// Intrusive entries are silently dropped (WARN) unless the policy allows
/// them; unknown entries are always dropped. An empty surviving selection is
/// an error rather than an accidental full-default run.
fn filter_scripts(args: &mut Vec<Arg>, allow_intrusive: bool) -> Result<(), ValidationError> {
    let Some(selection) = flag_value(args, &["--script"]).map(str::to_string) else {
        return Ok(());
    };

    let mut kept = Vec::new();
    for item in selection.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if SAFE_CATEGORIES.contains(&item) || SAFE_SCRIPTS.contains(&item) {
            kept.push(item);
            continue;
        }
        let intrusive = INTRUSIVE_CATEGORIES.contains(&item)
            || INTRUSIVE_SCRIPTS.contains(&item)
            || INTRUSIVE_SCRIPT_PREFIXES
                .iter()
                .any(|prefix| item.starts_with(prefix));
        if intrusive {
            if allow_intrusive {
                kept.push(item);
            } else {
                tracing::warn!(script = item, "intrusive script filtered from selection");
            }
            continue;
        }
        tracing::warn!(script = item, "unknown script filtered from selection");
    }

    if kept.is_empty() {
        return Err(ValidationError::EmptyScriptSelection);
    }

    let joined = kept.join(",");
    for arg in args.iter_mut() {
        if let Arg::Flag { name, value } = arg {
            if name == "--script" {
                *value = Some(joined.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(target: &str, extra: &str, intrusive: bool) -> Result<Vec<String>, ValidationError> {
        let policy = GrammarPolicy {
            allow_intrusive: intrusive,
            ..GrammarPolicy::default()
        };
        NmapGrammar.build_argv(target, extra, &policy)
    }

    #[test]
    fn default_scan_matches_expected_argv() {
        let argv = build("192.168.2.132/32", "-sV --top-ports 200", false).unwrap();
        assert_eq!(
            argv,
            vec![
                "-sV",
                "--top-ports",
                "200",
                "-T4",
                "--max-parallelism",
                "10",
                "-Pn",
                "192.168.2.132/32"
            ]
        );
    }

    #[test]
    fn empty_args_get_full_defaults_with_target_last() {
        let argv = build("10.0.0.5", "", false).unwrap();
        assert_eq!(
            argv,
            vec![
                "-T4",
                "--max-parallelism",
                "10",
                "-Pn",
                "--top-ports",
                "1000",
                "10.0.0.5"
            ]
        );
    }

    #[test]
    fn user_timing_suppresses_default() {
        let argv = build("10.0.0.5", "-T2", false).unwrap();
        assert!(argv.contains(&"-T2".to_string()));
        assert!(!argv.contains(&"-T4".to_string()));
    }

    #[test]
    fn cidr_boundary() {
        assert!(build("10.0.0.0/22", "", false).is_ok());
        let err = build("10.0.0.0/21", "", false).unwrap_err();
        match err {
            ValidationError::TargetRejected { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("10.0.0.0/22"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn aggressive_flag_needs_intrusive_policy() {
        assert!(build("10.0.0.5", "-A", false).is_err());
        let argv = build("10.0.0.5", "-A", true).unwrap();
        assert!(argv.contains(&"-A".to_string()));
    }

    #[test]
    fn forbidden_characters_rejected() {
        for bad in ["-p 80;id", "-p \"80|id\"", "--script `id`"] {
            assert!(build("10.0.0.5", bad, false).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn port_zero_rejected() {
        assert!(build("10.0.0.5", "-p 0", false).is_err());
        assert!(build("10.0.0.5", "-p 0-80", false).is_err());
    }

    #[test]
    fn script_filtering_drops_intrusive_without_policy() {
        let argv = build("10.0.0.5", "--script safe,http-vuln-cve2017-5638", false).unwrap();
        let idx = argv.iter().position(|t| t == "--script").unwrap();
        assert_eq!(argv[idx + 1], "safe");
    }

    #[test]
    fn script_filtering_keeps_intrusive_with_policy() {
        let argv = build("10.0.0.5", "--script safe,http-vuln-cve2017-5638", true).unwrap();
        let idx = argv.iter().position(|t| t == "--script").unwrap();
        assert_eq!(argv[idx + 1], "safe,http-vuln-cve2017-5638");
    }

    #[test]
    fn empty_script_selection_is_an_error() {
        // everything filtered: unknown + intrusive without policy
        let err = build("10.0.0.5", "--script vuln,not-a-real-script", false).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyScriptSelection));
    }

    #[test]
    fn unknown_flag_rejected() {
        let err = build("10.0.0.5", "--datadir /tmp", false).unwrap_err();
        assert!(matches!(err, ValidationError::FlagNotAllowed { .. }));
    }

    #[test]
    fn stray_literal_rejected_as_injection() {
        let err = build("10.0.0.5", "-sV extra-target", false).unwrap_err();
        assert!(matches!(err, ValidationError::UnexpectedToken { .. }));
    }

    #[test]
    fn validation_is_idempotent_on_flag_set() {
        // Re-validating an already-vetted vector must not change it.
        let first = build("10.0.0.5", "-sV -p 80,443", false).unwrap();
        let joined = shell_words::join(&first[..first.len() - 1]);
        let second = build("10.0.0.5", &joined, false).unwrap();
        assert_eq!(first, second);
    }
}
