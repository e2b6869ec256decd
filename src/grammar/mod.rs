//! Per-tool argument grammars.
//!
//! A grammar turns a raw `extra_args` string plus a target into a vetted
//! argument vector for one specific tool, or fails with a precise validation
//! error. Everything a child process will see on its command line passes
//! through here first.
//!
//! # Validation flow
//!
//! ```text
//! extra_args ──► tokenize ──► bridge form/URL values ──► universal checks
//!                                     │                        │
//!                                     │                        ├─► forbidden chars
//!                                     │                        └─► token pattern
//!                                     ▼
//!                         classify against allowlist ──► tool rules ──► argv
//!                                     │                      │
//!                                     │                      ├─► ports/CIDRs/scripts
//!                                     │                      └─► defaults injection
//!                                     └─► restore bridged tokens (re-validated)
//! ```
//!
//! The single most important rule: a token is either a known flag, the value
//! of the preceding value-taking flag, or a tool-specific permitted literal.
//! Anything else is rejected as potential injection.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::{LimitsConfig, SecurityConfig};
use crate::error::ValidationError;

pub mod gobuster;
pub mod hydra;
pub mod masscan;
pub mod nmap;
pub mod sqlmap;

/// Shell metacharacters forbidden anywhere in `extra_args`.
pub const FORBIDDEN_CHARS: &[char] = &[';', '&', '|', '`', '$', '>', '<', '\n', '\r'];

/// Forbidden subset re-checked on restored bridge tokens. Form payloads and
/// URL queries legitimately carry `&`, so it is excluded here; the bridged
/// token pattern already rules out everything else in the full set.
const BRIDGED_FORBIDDEN_CHARS: &[char] = &[';', '|', '`', '$', '>', '<', '\n', '\r'];

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.:/=+\-,@%_]+$").expect("valid token pattern"));

static BRIDGED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._/:\-,=@%^&?]+$").expect("valid bridged pattern"));

/// Policy knobs the grammars need, flattened out of the config sections.
#[derive(Debug, Clone)]
pub struct GrammarPolicy {
    pub allow_intrusive: bool,
    pub max_args_len: usize,
    pub max_scan_rate: u32,
    pub masscan_wait_sec: u32,
    pub hydra_inject_default_creds: bool,
}

impl GrammarPolicy {
    pub fn from_config(limits: &LimitsConfig, security: &SecurityConfig) -> Self {
        Self {
            allow_intrusive: security.allow_intrusive,
            max_args_len: limits.max_args_len,
            max_scan_rate: security.max_scan_rate,
            masscan_wait_sec: security.masscan_wait_sec,
            hydra_inject_default_creds: security.hydra_inject_default_creds,
        }
    }
}

#[cfg(test)]
impl Default for GrammarPolicy {
    fn default() -> Self {
        Self {
            allow_intrusive: false,
            max_args_len: 2048,
            max_scan_rate: 1000,
            masscan_wait_sec: 0,
            hydra_inject_default_creds: true,
        }
    }
}

/// One tool's argument grammar.
pub trait ToolGrammar: Send + Sync {
    /// Tool name as it appears in the registry.
    fn tool(&self) -> &'static str;

    /// Build the complete post-command argv, target placement included.
    fn build_argv(
        &self,
        target: &str,
        extra_args: &str,
        policy: &GrammarPolicy,
    ) -> Result<Vec<String>, ValidationError>;
}

/// Static flag allowlist for one tool.
pub(crate) struct FlagSpec {
    pub tool: &'static str,
    pub allowed: &'static [&'static str],
    pub requires_value: &'static [&'static str],
}

impl FlagSpec {
    pub fn is_allowed(&self, flag: &str) -> bool {
        self.allowed.contains(&flag)
    }

    pub fn requires_value(&self, flag: &str) -> bool {
        self.requires_value.contains(&flag)
    }
}

/// A classified argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Arg {
    Flag {
        name: String,
        value: Option<String>,
    },
    /// Tool-specific permitted literal (mode name, service name, bridged
    /// payload). Only produced when the tool opts in.
    Literal(String),
}

impl Arg {
    /// Append this argument to an argv under construction.
    pub fn push_onto(&self, argv: &mut Vec<String>) {
        match self {
            Arg::Flag { name, value } => {
                argv.push(name.clone());
                if let Some(v) = value {
                    argv.push(v.clone());
                }
            }
            Arg::Literal(tok) => argv.push(tok.clone()),
        }
    }
}

/// What to do with a flag outside the allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnknownFlagPolicy {
    /// Fail validation (default for every tool).
    Reject,
    /// Drop the flag with a WARN (sqlmap only).
    Skip,
}

/// Split `extra_args` with shell-style quoting after bounding its length.
pub(crate) fn tokenize(extra_args: &str, max_len: usize) -> Result<Vec<String>, ValidationError> {
    if extra_args.len() > max_len {
        return Err(ValidationError::ArgsTooLong {
            length: extra_args.len(),
            max: max_len,
        });
    }
    shell_words::split(extra_args).map_err(|e| ValidationError::Tokenization {
        reason: e.to_string(),
    })
}

/// Universal token checks: forbidden metacharacters, then the token pattern.
pub(crate) fn check_universal(tool: &'static str, tokens: &[String]) -> Result<(), ValidationError> {
    for token in tokens {
        if let Some(found) = token.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(ValidationError::ForbiddenCharacter {
                found,
                token: token.clone(),
            });
        }
        if !TOKEN_RE.is_match(token) {
            return Err(ValidationError::UnexpectedToken {
                tool,
                token: token.clone(),
            });
        }
    }
    Ok(())
}

/// Classify tokens into flags (with values) and permitted literals.
///
/// `allow_literals` is false for tools whose grammar admits no positional
/// tokens at all (nmap, masscan).
pub(crate) fn classify(
    tokens: Vec<String>,
    spec: &FlagSpec,
    allow_literals: bool,
    unknown: UnknownFlagPolicy,
) -> Result<Vec<Arg>, ValidationError> {
    let mut args = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter().peekable();

    while let Some(token) = iter.next() {
        if !token.starts_with('-') {
            if allow_literals {
                args.push(Arg::Literal(token));
                continue;
            }
            return Err(ValidationError::UnexpectedToken {
                tool: spec.tool,
                token,
            });
        }

        // Accept `--flag=value` as well as `--flag value`.
        let (name, inline_value) = match token.find('=') {
            Some(eq) => {
                let value = token[eq + 1..].to_string();
                let mut name = token;
                name.truncate(eq);
                (name, Some(value))
            }
            None => (token, None),
        };

        if !spec.is_allowed(&name) {
            match unknown {
                UnknownFlagPolicy::Reject => {
                    return Err(ValidationError::FlagNotAllowed {
                        tool: spec.tool,
                        flag: name,
                    });
                }
                UnknownFlagPolicy::Skip => {
                    tracing::warn!(tool = spec.tool, flag = %name, "skipping non-allowlisted flag");
                    // Drop a trailing value token so it cannot be
                    // misclassified as a positional literal.
                    if inline_value.is_none()
                        && iter.peek().is_some_and(|next| !next.starts_with('-'))
                    {
                        iter.next();
                    }
                    continue;
                }
            }
        }

        let value = if spec.requires_value(&name) {
            match inline_value {
                Some(v) => Some(v),
                None => Some(iter.next().ok_or(ValidationError::MissingFlagValue {
                    flag: name.clone(),
                })?),
            }
        } else {
            if inline_value.is_some() {
                return Err(ValidationError::InvalidFieldValue {
                    field: "flag",
                    value: name.clone(),
                    reason: "flag does not take a value".to_string(),
                });
            }
            None
        };

        args.push(Arg::Flag { name, value });
    }

    Ok(args)
}

/// Temporarily hides metacharacter-bearing values (HTTP form payloads, URL
/// queries) behind opaque tokens so the universal rules still apply to the
/// surrounding argv. Restored tokens are re-validated against the narrower
/// bridged pattern before they reach the final vector.
#[derive(Debug, Default)]
pub(crate) struct PlaceholderBridge {
    stash: Vec<String>,
}

impl PlaceholderBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `original` with an opaque placeholder carrying its index.
    pub fn hide(&mut self, original: String) -> String {
        let token = format!("@bridged{}@", self.stash.len());
        self.stash.push(original);
        token
    }

    fn lookup(&self, token: &str) -> Option<&str> {
        let idx: usize = token
            .strip_prefix("@bridged")?
            .strip_suffix('@')?
            .parse()
            .ok()?;
        self.stash.get(idx).map(String::as_str)
    }

    /// Swap placeholders in `argv` back for their originals, validating each
    /// original against the bridged token rules.
    pub fn restore(&self, argv: Vec<String>) -> Result<Vec<String>, ValidationError> {
        argv.into_iter()
            .map(|token| match self.lookup(&token) {
                None => Ok(token),
                Some(original) => {
                    if let Some(found) =
                        original.chars().find(|c| BRIDGED_FORBIDDEN_CHARS.contains(c))
                    {
                        return Err(ValidationError::ForbiddenCharacter {
                            found,
                            token: original.to_string(),
                        });
                    }
                    if !BRIDGED_TOKEN_RE.is_match(original) {
                        return Err(ValidationError::UnexpectedToken {
                            tool: "bridge",
                            token: original.to_string(),
                        });
                    }
                    Ok(original.to_string())
                }
            })
            .collect()
    }
}

/// Validate a comma-separated port specification.
///
/// Accepts single ports and `a-b` ranges, each within 1..=65535, at most
/// `max_segments` segments. Port 0 is always rejected. When
/// `allow_proto_prefix` is set, each segment may carry a `U:` or `T:` prefix
/// (masscan syntax).
pub(crate) fn validate_port_spec(
    spec: &str,
    max_segments: usize,
    allow_proto_prefix: bool,
) -> Result<(), ValidationError> {
    let reject = |reason: &str| ValidationError::InvalidPortSpec {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = spec.split(',').collect();
    if segments.len() > max_segments {
        return Err(reject(&format!("more than {max_segments} segments")));
    }

    for segment in segments {
        let segment = if allow_proto_prefix {
            segment
                .strip_prefix("U:")
                .or_else(|| segment.strip_prefix("T:"))
                .unwrap_or(segment)
        } else {
            segment
        };
        if segment.is_empty() {
            return Err(reject("empty segment"));
        }

        let parse_port = |s: &str| -> Result<u16, ValidationError> {
            let port: u32 = s.parse().map_err(|_| reject("not a decimal port"))?;
            if port == 0 || port > 65535 {
                return Err(reject("port out of range 1-65535"));
            }
            Ok(port as u16)
        };

        match segment.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_port(lo)?;
                let hi = parse_port(hi)?;
                if lo > hi {
                    return Err(reject("descending range"));
                }
            }
            None => {
                parse_port(segment)?;
            }
        }
    }
    Ok(())
}

/// Whether any of `flags` already occurs in the classified arguments.
pub(crate) fn has_flag(args: &[Arg], flags: &[&str]) -> bool {
    args.iter().any(|a| match a {
        Arg::Flag { name, .. } => flags.contains(&name.as_str()),
        Arg::Literal(_) => false,
    })
}

/// First value supplied for any of `flags`, if present.
pub(crate) fn flag_value<'a>(args: &'a [Arg], flags: &[&str]) -> Option<&'a str> {
    args.iter().find_map(|a| match a {
        Arg::Flag {
            name,
            value: Some(v),
        } if flags.contains(&name.as_str()) => Some(v.as_str()),
        _ => None,
    })
}

/// Rewrite the value of `flag` in place (used for clamping).
pub(crate) fn set_flag_value(args: &mut [Arg], flag: &str, new_value: String) {
    for a in args.iter_mut() {
        if let Arg::Flag { name, value } = a {
            if name == flag {
                *value = Some(new_value);
                return;
            }
        }
    }
}
