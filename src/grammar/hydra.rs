//! Hydra argument grammar.
//!
//! Hydra is the one tool whose legitimate arguments carry shell
//! metacharacters: HTTP form payloads contain `^`, `&`, and `:`. The token
//! immediately following a form service name is hidden behind a placeholder
//! before universal sanitization and restored (re-validated) afterwards.

use crate::error::ValidationError;
use crate::grammar::{
    Arg, FlagSpec, GrammarPolicy, PlaceholderBridge, ToolGrammar, UnknownFlagPolicy,
    check_universal, classify, flag_value, has_flag, set_flag_value, tokenize,
};
use crate::policy::is_authorized_host;

const SPEC: FlagSpec = FlagSpec {
    tool: "hydra",
    allowed: &[
        "-l", "-L", "-p", "-P", "-t", "-w", "-W", "-f", "-V", "-s", "-e", "-I", "-F",
    ],
    requires_value: &["-l", "-L", "-p", "-P", "-t", "-w", "-W", "-s", "-e"],
};

/// Services a hydra request may name.
const ALLOWED_SERVICES: &[&str] = &[
    "ssh",
    "ftp",
    "ftps",
    "telnet",
    "http",
    "https",
    "http-get",
    "http-post",
    "http-head",
    "http-get-form",
    "http-post-form",
    "http-head-form",
    "smb",
    "smtp",
    "pop3",
    "imap",
    "mysql",
    "postgres",
    "mssql",
    "rdp",
    "vnc",
    "ldap2",
    "ldap3",
];

/// Services whose following token is a form payload eligible for bridging.
const FORM_SERVICES: &[&str] = &["http-post-form", "http-get-form", "http-head-form"];

/// Wordlist injected when the caller omits a password specifier.
const DEFAULT_PASSWORD_LIST: &str = "/usr/share/wordlists/common-passwords.txt";

const THREAD_RANGE: (u32, u32) = (1, 16);

pub struct HydraGrammar;

impl ToolGrammar for HydraGrammar {
    fn tool(&self) -> &'static str {
        "hydra"
    }

    fn build_argv(
        &self,
        target: &str,
        extra_args: &str,
        policy: &GrammarPolicy,
    ) -> Result<Vec<String>, ValidationError> {
        let (host, target_service) = parse_target(target)?;

        let mut tokens = tokenize(extra_args, policy.max_args_len)?;

        // Bridge pass: hide the payload token that follows each form service
        // so the universal rules can stay strict for everything else.
        let mut bridge = PlaceholderBridge::new();
        let mut i = 0;
        while i < tokens.len() {
            if FORM_SERVICES.contains(&tokens[i].as_str()) && i + 1 < tokens.len() {
                tokens[i + 1] = bridge.hide(std::mem::take(&mut tokens[i + 1]));
                i += 2;
            } else {
                i += 1;
            }
        }

        check_universal("hydra", &tokens)?;
        let mut args = classify(tokens, &SPEC, true, UnknownFlagPolicy::Reject)?;

        // The trailing service literal, when present, overrides the target's.
        let service = match trailing_service(&mut args)? {
            Some(s) => s,
            None => target_service.clone().ok_or(ValidationError::MissingRequired {
                tool: "hydra",
                what: "a service (in the target or as the last argument)",
            })?,
        };
        if !ALLOWED_SERVICES.contains(&service.as_str()) {
            return Err(ValidationError::ServiceNotAllowed { service });
        }

        // Any remaining literal must be a form service name or its payload.
        validate_literals(&args)?;

        if let Some(threads) = flag_value(&args, &["-t"]) {
            let n: u32 = threads
                .parse()
                .map_err(|_| ValidationError::InvalidFieldValue {
                    field: "-t",
                    value: threads.to_string(),
                    reason: "not a decimal thread count".to_string(),
                })?;
            let clamped = n.clamp(THREAD_RANGE.0, THREAD_RANGE.1);
            if clamped != n {
                tracing::warn!(threads = n, clamped, "hydra thread count clamped");
                set_flag_value(&mut args, "-t", clamped.to_string());
            }
        }

        let has_login = has_flag(&args, &["-l", "-L"]);
        let has_password = has_flag(&args, &["-p", "-P"]);
        if (!has_login || !has_password) && !policy.hydra_inject_default_creds {
            return Err(ValidationError::MissingRequired {
                tool: "hydra",
                what: "a login (-l/-L) and a password (-p/-P) specifier",
            });
        }

        let mut argv = Vec::new();
        if !has_login {
            argv.push("-l".to_string());
            argv.push("admin".to_string());
        }
        if !has_password {
            argv.push("-P".to_string());
            argv.push(DEFAULT_PASSWORD_LIST.to_string());
        }
        for arg in &args {
            arg.push_onto(&mut argv);
        }

        if !has_flag(&args, &["-t"]) {
            argv.push("-t".to_string());
            argv.push("4".to_string());
        }
        if !has_flag(&args, &["-w"]) {
            argv.push("-w".to_string());
            argv.push("2".to_string());
        }
        if !has_flag(&args, &["-W"]) {
            argv.push("-W".to_string());
            argv.push("5".to_string());
        }
        if !has_flag(&args, &["-f"]) {
            argv.push("-f".to_string());
        }
        if !has_flag(&args, &["-V"]) {
            argv.push("-V".to_string());
        }

        argv.push(host);
        argv.push(service);

        bridge.restore(argv)
    }
}

/// Parse `host:service` or `service://host[:port]`.
fn parse_target(target: &str) -> Result<(String, Option<String>), ValidationError> {
    let reject = |reason: &str| ValidationError::TargetRejected {
        target: target.to_string(),
        reason: reason.to_string(),
        suggestion: None,
    };

    let (host, service) = if let Some((service, rest)) = target.split_once("://") {
        let host = rest.split_once(':').map(|(h, _)| h).unwrap_or(rest);
        (host.to_string(), Some(service.to_string()))
    } else if let Some((host, service)) = target.rsplit_once(':') {
        if service.is_empty() {
            return Err(reject("empty service after colon"));
        }
        (host.to_string(), Some(service.to_string()))
    } else {
        return Err(reject("expected host:service or service://host[:port]"));
    };

    if host.is_empty() {
        return Err(reject("empty host"));
    }
    if !is_authorized_host(&host) {
        return Err(reject("host is neither private nor *.lab.internal"));
    }
    if let Some(ref s) = service {
        if !ALLOWED_SERVICES.contains(&s.as_str()) {
            return Err(ValidationError::ServiceNotAllowed {
                service: s.clone(),
            });
        }
    }
    Ok((host, service))
}

/// Pop the trailing service literal off the classified arguments, if the
/// last non-flag token is one (and not a form payload placeholder).
fn trailing_service(args: &mut Vec<Arg>) -> Result<Option<String>, ValidationError> {
    let last_literal = args
        .iter()
        .rposition(|a| matches!(a, Arg::Literal(_)));
    let Some(idx) = last_literal else {
        return Ok(None);
    };
    let Arg::Literal(ref token) = args[idx] else {
        unreachable!()
    };
    // A form service with a following payload stays in place; a bare service
    // name at the end is the service selector.
    if ALLOWED_SERVICES.contains(&token.as_str()) && !is_followed_by_payload(args, idx) {
        let Arg::Literal(service) = args.remove(idx) else {
            unreachable!()
        };
        return Ok(Some(service));
    }
    Ok(None)
}

fn is_followed_by_payload(args: &[Arg], idx: usize) -> bool {
    FORM_SERVICES.contains(&match &args[idx] {
        Arg::Literal(s) => s.as_str(),
        _ => return false,
    }) && matches!(args.get(idx + 1), Some(Arg::Literal(next)) if next.starts_with("@bridged"))
}

/// Remaining literals must be form services each followed by their payload
/// placeholder; anything else is potential injection.
fn validate_literals(args: &[Arg]) -> Result<(), ValidationError> {
    let mut expect_payload = false;
    for arg in args {
        let Arg::Literal(token) = arg else {
            if expect_payload {
                return Err(ValidationError::MissingRequired {
                    tool: "hydra",
                    what: "a form payload after the form service",
                });
            }
            continue;
        };
        if expect_payload {
            if !token.starts_with("@bridged") {
                return Err(ValidationError::UnexpectedToken {
                    tool: "hydra",
                    token: token.clone(),
                });
            }
            expect_payload = false;
            continue;
        }
        if FORM_SERVICES.contains(&token.as_str()) {
            expect_payload = true;
            continue;
        }
        return Err(ValidationError::UnexpectedToken {
            tool: "hydra",
            token: token.clone(),
        });
    }
    if expect_payload {
        return Err(ValidationError::MissingRequired {
            tool: "hydra",
            what: "a form payload after the form service",
        });
    }
    Ok(())
}
