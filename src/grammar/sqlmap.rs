//! Sqlmap argument grammar.
//!
//! The target URL rides inside `extra_args` (`-u`), and its query string
//! legitimately carries `?`, `&`, and `=`, so the URL value goes through the
//! same placeholder bridge hydra uses for form payloads. Unlike the other
//! tools, non-allowlisted flags are skipped with a WARN instead of failing
//! the request.

use url::Url;

use crate::error::ValidationError;
use crate::grammar::{
    FlagSpec, GrammarPolicy, PlaceholderBridge, ToolGrammar, UnknownFlagPolicy, check_universal,
    classify, flag_value, has_flag, set_flag_value, tokenize,
};
use crate::policy::is_authorized_host;

const SPEC: FlagSpec = FlagSpec {
    tool: "sqlmap",
    allowed: &[
        "-u",
        "--url",
        "--batch",
        "--risk",
        "--level",
        "--technique",
        "--time-sec",
        "--threads",
        "--timeout",
        "--retries",
        "--dbms",
        "--random-agent",
    ],
    requires_value: &[
        "-u",
        "--url",
        "--risk",
        "--level",
        "--technique",
        "--time-sec",
        "--threads",
        "--timeout",
        "--retries",
        "--dbms",
    ],
};

const RISK_RANGE: (u32, u32) = (1, 2);
const LEVEL_RANGE: (u32, u32) = (1, 3);
const MAX_THREADS: u32 = 5;

pub struct SqlmapGrammar;

impl ToolGrammar for SqlmapGrammar {
    fn tool(&self) -> &'static str {
        "sqlmap"
    }

    fn build_argv(
        &self,
        target: &str,
        extra_args: &str,
        policy: &GrammarPolicy,
    ) -> Result<Vec<String>, ValidationError> {
        let tokens = tokenize(extra_args, policy.max_args_len)?;

        // Bridge pass: validate and hide every -u/--url value (inline or
        // separate) before the universal rules see the query string.
        let mut bridge = PlaceholderBridge::new();
        let mut bridged = Vec::with_capacity(tokens.len());
        let mut saw_url = false;
        let mut iter = tokens.into_iter().peekable();
        while let Some(token) = iter.next() {
            let (flag, inline) = match token.split_once('=') {
                Some((f, v)) if f == "-u" || f == "--url" => {
                    (f.to_string(), Some(v.to_string()))
                }
                _ => (token.clone(), None),
            };
            if flag == "-u" || flag == "--url" {
                let value = match inline {
                    Some(v) => v,
                    None => iter.next().ok_or(ValidationError::MissingFlagValue {
                        flag: flag.clone(),
                    })?,
                };
                validate_url(&value)?;
                saw_url = true;
                bridged.push(flag);
                bridged.push(bridge.hide(value));
            } else {
                bridged.push(flag);
            }
        }

        if !saw_url {
            return Err(ValidationError::MissingRequired {
                tool: "sqlmap",
                what: "a target URL via -u/--url",
            });
        }
        // The transport-level target must agree with the URL host policy but
        // carries no grammar of its own for sqlmap.
        if !target.is_empty() && Url::parse(target).is_ok() {
            validate_url(target)?;
        }

        check_universal("sqlmap", &bridged)?;
        let mut args = classify(bridged, &SPEC, false, UnknownFlagPolicy::Skip)?;

        for (flag, range) in [("--risk", RISK_RANGE), ("--level", LEVEL_RANGE)] {
            if let Some(value) = flag_value(&args, &[flag]) {
                let n: u32 = value
                    .parse()
                    .map_err(|_| ValidationError::InvalidFieldValue {
                        field: "flag",
                        value: value.to_string(),
                        reason: "not a decimal value".to_string(),
                    })?;
                let clamped = n.clamp(range.0, range.1);
                if clamped != n {
                    tracing::warn!(flag, value = n, clamped, "sqlmap value clamped");
                    set_flag_value(&mut args, flag, clamped.to_string());
                }
            }
        }
        if let Some(value) = flag_value(&args, &["--threads"]) {
            let n: u32 = value
                .parse()
                .map_err(|_| ValidationError::InvalidFieldValue {
                    field: "--threads",
                    value: value.to_string(),
                    reason: "not a decimal value".to_string(),
                })?;
            if n > MAX_THREADS {
                tracing::warn!(threads = n, max = MAX_THREADS, "sqlmap threads clamped");
                set_flag_value(&mut args, "--threads", MAX_THREADS.to_string());
            }
        }

        let mut argv = Vec::new();
        for arg in &args {
            arg.push_onto(&mut argv);
        }

        if !has_flag(&args, &["--batch"]) {
            argv.push("--batch".to_string());
        }
        if !has_flag(&args, &["--technique"]) {
            argv.push("--technique".to_string());
            argv.push("BEU".to_string());
        }
        if !has_flag(&args, &["--time-sec"]) {
            argv.push("--time-sec".to_string());
            argv.push("5".to_string());
        }
        if !has_flag(&args, &["--threads"]) {
            argv.push("--threads".to_string());
            argv.push("5".to_string());
        }

        bridge.restore(argv)
    }
}

fn validate_url(raw: &str) -> Result<(), ValidationError> {
    let reject = |reason: &str| ValidationError::TargetRejected {
        target: raw.to_string(),
        reason: reason.to_string(),
        suggestion: None,
    };
    let url = Url::parse(raw).map_err(|_| reject("not a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(reject("URL scheme must be http or https"));
    }
    let host = url.host_str().ok_or_else(|| reject("URL has no host"))?;
    if !is_authorized_host(host) {
        return Err(reject("URL host is neither private nor *.lab.internal"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(target: &str, extra: &str) -> Result<Vec<String>, ValidationError> {
        SqlmapGrammar.build_argv(target, extra, &GrammarPolicy::default())
    }

    #[test]
    fn url_query_string_survives_the_bridge() {
        let argv = build(
            "http://192.168.1.20/",
            "-u http://192.168.1.20/item.php?id=1&cat=2",
        )
        .unwrap();
        assert!(argv.contains(&"http://192.168.1.20/item.php?id=1&cat=2".to_string()));
        assert!(argv.contains(&"--batch".to_string()));
        assert!(argv.windows(2).any(|w| w == ["--technique", "BEU"]));
        assert!(argv.windows(2).any(|w| w == ["--time-sec", "5"]));
        assert!(argv.windows(2).any(|w| w == ["--threads", "5"]));
    }

    #[test]
    fn inline_url_form_accepted() {
        let argv = build(
            "http://10.0.0.4/",
            "--url=http://10.0.0.4/p.php?q=x",
        )
        .unwrap();
        assert!(argv.contains(&"http://10.0.0.4/p.php?q=x".to_string()));
    }

    #[test]
    fn missing_url_rejected() {
        assert!(matches!(
            build("http://10.0.0.4/", "--batch"),
            Err(ValidationError::MissingRequired { .. })
        ));
    }

    #[test]
    fn public_url_rejected() {
        assert!(build("http://10.0.0.4/", "-u http://example.com/x?id=1").is_err());
    }

    #[test]
    fn risk_and_level_clamped() {
        let argv = build("http://10.0.0.4/", "-u http://10.0.0.4/x --risk 3 --level 5").unwrap();
        assert!(argv.windows(2).any(|w| w == ["--risk", "2"]));
        assert!(argv.windows(2).any(|w| w == ["--level", "3"]));
    }

    #[test]
    fn threads_clamped_to_five() {
        let argv = build("http://10.0.0.4/", "-u http://10.0.0.4/x --threads 20").unwrap();
        assert!(argv.windows(2).any(|w| w == ["--threads", "5"]));
    }

    #[test]
    fn unknown_flags_skipped_not_fatal() {
        let argv = build(
            "http://10.0.0.4/",
            "-u http://10.0.0.4/x --os-shell --tamper space2comment",
        )
        .unwrap();
        assert!(!argv.iter().any(|t| t == "--os-shell" || t == "--tamper"));
    }

    #[test]
    fn user_batch_not_duplicated() {
        let argv = build("http://10.0.0.4/", "-u http://10.0.0.4/x --batch").unwrap();
        assert_eq!(argv.iter().filter(|t| *t == "--batch").count(), 1);
    }

    #[test]
    fn shell_metacharacters_in_non_url_tokens_rejected() {
        assert!(build("http://10.0.0.4/", "-u http://10.0.0.4/x --dbms mysql;drop").is_err());
    }
}
