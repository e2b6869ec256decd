//! Gobuster argument grammar.

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::ValidationError;
use crate::grammar::{
    FlagSpec, GrammarPolicy, ToolGrammar, UnknownFlagPolicy, check_universal, classify, flag_value,
    has_flag, set_flag_value, tokenize,
};
use crate::policy::{is_authorized_host, is_lab_hostname};

const SPEC: FlagSpec = FlagSpec {
    tool: "gobuster",
    allowed: &[
        "-u",
        "-d",
        "-w",
        "-t",
        "-x",
        "-s",
        "-b",
        "-k",
        "-q",
        "-z",
        "--timeout",
        "--wildcard",
        "--append-domain",
        "--random-agent",
    ],
    requires_value: &["-u", "-d", "-w", "-t", "-x", "-s", "-b", "--timeout"],
};

/// Directories relative wordlist paths are resolved against, in order.
const WORDLIST_ROOTS: &[&str] = &["/usr/share/wordlists", "/opt/wordlists"];

const MAX_WORDLIST_BYTES: u64 = 50 * 1024 * 1024;
const MAX_WORDLIST_ENTRIES: usize = 1_000_000;

/// File extensions allowed in `-x` without the intrusive policy.
const APPROVED_EXTENSIONS: &[&str] = &["html", "htm", "php", "asp", "aspx", "txt", "xml", "json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Dir,
    Dns,
    Vhost,
}

impl Mode {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "dir" => Some(Mode::Dir),
            "dns" => Some(Mode::Dns),
            "vhost" => Some(Mode::Vhost),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Mode::Dir => "dir",
            Mode::Dns => "dns",
            Mode::Vhost => "vhost",
        }
    }

    fn thread_cap(self) -> u32 {
        match self {
            Mode::Dir => 30,
            Mode::Dns => 50,
            Mode::Vhost => 20,
        }
    }

    fn thread_default(self) -> u32 {
        match self {
            Mode::Dir => 10,
            Mode::Dns => 20,
            Mode::Vhost => 10,
        }
    }

    /// Flag that carries the target for this mode.
    fn target_flag(self) -> &'static str {
        match self {
            Mode::Dir | Mode::Vhost => "-u",
            Mode::Dns => "-d",
        }
    }
}

pub struct GobusterGrammar;

impl ToolGrammar for GobusterGrammar {
    fn tool(&self) -> &'static str {
        "gobuster"
    }

    fn build_argv(
        &self,
        target: &str,
        extra_args: &str,
        policy: &GrammarPolicy,
    ) -> Result<Vec<String>, ValidationError> {
        let mut tokens = tokenize(extra_args, policy.max_args_len)?;
        check_universal("gobuster", &tokens)?;

        // The mode is the mandatory first token; everything after it is
        // ordinary flag grammar with no further positional tokens.
        if tokens.is_empty() {
            return Err(ValidationError::MissingRequired {
                tool: "gobuster",
                what: "a mode (dir, dns, or vhost) as the first argument",
            });
        }
        let mode_token = tokens.remove(0);
        let mode = Mode::parse(&mode_token).ok_or(ValidationError::UnknownMode {
            tool: "gobuster",
            mode: mode_token.clone(),
        })?;

        let mut args = classify(tokens, &SPEC, false, UnknownFlagPolicy::Reject)?;

        validate_target(mode, target)?;

        if let Some(threads) = flag_value(&args, &["-t"]) {
            let n: u32 = threads
                .parse()
                .map_err(|_| ValidationError::InvalidFieldValue {
                    field: "-t",
                    value: threads.to_string(),
                    reason: "not a decimal thread count".to_string(),
                })?;
            let cap = mode.thread_cap();
            if n == 0 || n > cap {
                let clamped = n.clamp(1, cap);
                tracing::warn!(mode = mode.as_str(), threads = n, clamped, "thread count clamped");
                set_flag_value(&mut args, "-t", clamped.to_string());
            }
        }

        if let Some(wordlist) = flag_value(&args, &["-w"]).map(str::to_string) {
            let resolved = validate_wordlist(&wordlist)?;
            set_flag_value(&mut args, "-w", resolved);
        }

        validate_extensions(&mut args, mode, policy.allow_intrusive)?;

        let mut argv = vec![mode.as_str().to_string()];
        if !has_flag(&args, &[mode.target_flag()]) {
            argv.push(mode.target_flag().to_string());
            argv.push(target.to_string());
        }
        for arg in &args {
            arg.push_onto(&mut argv);
        }

        if !has_flag(&args, &["-t"]) {
            argv.push("-t".to_string());
            argv.push(mode.thread_default().to_string());
        }
        match mode {
            Mode::Dir => {
                if !has_flag(&args, &["-s"]) {
                    argv.push("-s".to_string());
                    argv.push("200,204,301,302,307,401,403".to_string());
                }
            }
            Mode::Dns => {
                if !has_flag(&args, &["--wildcard"]) {
                    argv.push("--wildcard".to_string());
                }
            }
            Mode::Vhost => {
                if !has_flag(&args, &["--append-domain"]) {
                    argv.push("--append-domain".to_string());
                }
            }
        }
        if !has_flag(&args, &["--timeout"]) {
            argv.push("--timeout".to_string());
            argv.push("10s".to_string());
        }
        if !has_flag(&args, &["-q"]) {
            argv.push("-q".to_string());
        }
        if !has_flag(&args, &["-z"]) {
            argv.push("-z".to_string());
        }

        Ok(argv)
    }
}

fn validate_target(mode: Mode, target: &str) -> Result<(), ValidationError> {
    match mode {
        Mode::Dir | Mode::Vhost => {
            let url = Url::parse(target).map_err(|_| ValidationError::TargetRejected {
                target: target.to_string(),
                reason: "not a valid URL".to_string(),
                suggestion: None,
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ValidationError::TargetRejected {
                    target: target.to_string(),
                    reason: "URL scheme must be http or https".to_string(),
                    suggestion: None,
                });
            }
            let host = url.host_str().ok_or_else(|| ValidationError::TargetRejected {
                target: target.to_string(),
                reason: "URL has no host".to_string(),
                suggestion: None,
            })?;
            if !is_authorized_host(host) {
                return Err(ValidationError::TargetRejected {
                    target: target.to_string(),
                    reason: "URL host is neither private nor *.lab.internal".to_string(),
                    suggestion: None,
                });
            }
            Ok(())
        }
        Mode::Dns => {
            if is_lab_hostname(target) {
                Ok(())
            } else {
                Err(ValidationError::TargetRejected {
                    target: target.to_string(),
                    reason: "dns mode requires a *.lab.internal domain".to_string(),
                    suggestion: None,
                })
            }
        }
    }
}

/// Validate a wordlist path and resolve it to the form passed to gobuster.
///
/// Size and entry-count checks only apply when the file exists; a missing
/// wordlist is gobuster's own error to report.
fn validate_wordlist(raw: &str) -> Result<String, ValidationError> {
    if raw.contains("..") {
        return Err(ValidationError::WordlistRejected {
            path: raw.to_string(),
            reason: "path traversal is not allowed".to_string(),
        });
    }

    let path = Path::new(raw);
    let resolved: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let mut found = None;
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        for root in std::iter::once(cwd.as_path()).chain(WORDLIST_ROOTS.iter().map(Path::new)) {
            let candidate = root.join(path);
            if candidate.exists() {
                found = Some(candidate);
                break;
            }
        }
        found.unwrap_or_else(|| path.to_path_buf())
    };

    if let Ok(meta) = std::fs::metadata(&resolved) {
        if meta.len() > MAX_WORDLIST_BYTES {
            return Err(ValidationError::WordlistRejected {
                path: raw.to_string(),
                reason: format!("file exceeds {MAX_WORDLIST_BYTES} bytes"),
            });
        }
        let contents =
            std::fs::read(&resolved).map_err(|e| ValidationError::WordlistRejected {
                path: raw.to_string(),
                reason: format!("unreadable: {e}"),
            })?;
        let mut entries = contents.iter().filter(|&&b| b == b'\n').count();
        if contents.last().is_some_and(|&b| b != b'\n') {
            entries += 1;
        }
        if entries > MAX_WORDLIST_ENTRIES {
            return Err(ValidationError::WordlistRejected {
                path: raw.to_string(),
                reason: format!("{entries} entries exceeds {MAX_WORDLIST_ENTRIES}"),
            });
        }
    }

    Ok(resolved.to_string_lossy().into_owned())
}

/// Validate `-x` extensions and, without the intrusive policy, narrow them to
/// the approved set. A selection that narrows to nothing drops the flag.
fn validate_extensions(
    args: &mut Vec<crate::grammar::Arg>,
    mode: Mode,
    allow_intrusive: bool,
) -> Result<(), ValidationError> {
    let Some(exts) = flag_value(args, &["-x"]).map(str::to_string) else {
        return Ok(());
    };
    if mode != Mode::Dir {
        return Err(ValidationError::InvalidFieldValue {
            field: "-x",
            value: exts,
            reason: "extensions are only valid in dir mode".to_string(),
        });
    }
    if !exts.chars().all(|c| c.is_ascii_alphanumeric() || c == ',') {
        return Err(ValidationError::InvalidFieldValue {
            field: "-x",
            value: exts,
            reason: "extensions must be alphanumeric, comma-separated".to_string(),
        });
    }

    if allow_intrusive {
        return Ok(());
    }

    let kept: Vec<&str> = exts
        .split(',')
        .filter(|e| APPROVED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .collect();
    if kept.len() != exts.split(',').count() {
        tracing::warn!(extensions = %exts, "non-approved extensions filtered");
    }
    if kept.is_empty() {
        args.retain(|a| !matches!(a, crate::grammar::Arg::Flag { name, .. } if name == "-x"));
    } else {
        set_flag_value(args, "-x", kept.join(","));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build(target: &str, extra: &str, intrusive: bool) -> Result<Vec<String>, ValidationError> {
        let policy = GrammarPolicy {
            allow_intrusive: intrusive,
            ..GrammarPolicy::default()
        };
        GobusterGrammar.build_argv(target, extra, &policy)
    }

    #[test]
    fn dns_mode_injects_domain_and_defaults() {
        let argv = build("lab.internal", "dns", false).unwrap();
        assert_eq!(
            argv,
            vec![
                "dns",
                "-d",
                "lab.internal",
                "-t",
                "20",
                "--wildcard",
                "--timeout",
                "10s",
                "-q",
                "-z"
            ]
        );
    }

    #[test]
    fn dir_mode_defaults() {
        let argv = build("http://192.168.1.50/", "dir", false).unwrap();
        assert_eq!(argv[0], "dir");
        assert!(argv.windows(2).any(|w| w == ["-u", "http://192.168.1.50/"]));
        assert!(argv.windows(2).any(|w| w == ["-t", "10"]));
        assert!(argv
            .windows(2)
            .any(|w| w == ["-s", "200,204,301,302,307,401,403"]));
        assert!(argv.windows(2).any(|w| w == ["--timeout", "10s"]));
        assert!(argv.contains(&"-q".to_string()) && argv.contains(&"-z".to_string()));
    }

    #[test]
    fn vhost_mode_appends_domain_flag() {
        let argv = build("https://app.lab.internal", "vhost", false).unwrap();
        assert!(argv.contains(&"--append-domain".to_string()));
        assert!(argv.windows(2).any(|w| w == ["-t", "10"]));
    }

    #[test]
    fn mode_is_mandatory_and_must_be_known() {
        assert!(matches!(
            build("lab.internal", "", false),
            Err(ValidationError::MissingRequired { .. })
        ));
        assert!(matches!(
            build("lab.internal", "fuzz", false),
            Err(ValidationError::UnknownMode { .. })
        ));
    }

    #[test]
    fn dir_mode_rejects_public_and_non_url_targets() {
        assert!(build("http://example.com/", "dir", false).is_err());
        assert!(build("not-a-url", "dir", false).is_err());
        assert!(build("ftp://192.168.1.2/", "dir", false).is_err());
    }

    #[test]
    fn dns_mode_rejects_non_lab_domains() {
        assert!(build("example.com", "dns", false).is_err());
    }

    #[test]
    fn thread_count_clamped_per_mode() {
        let argv = build("http://10.0.0.9/", "dir -t 300", false).unwrap();
        assert!(argv.windows(2).any(|w| w == ["-t", "30"]));
    }

    #[test]
    fn extensions_filtered_without_intrusive() {
        let argv = build("http://10.0.0.9/", "dir -x php,exe,txt", false).unwrap();
        let i = argv.iter().position(|t| t == "-x").unwrap();
        assert_eq!(argv[i + 1], "php,txt");
    }

    #[test]
    fn extensions_kept_with_intrusive() {
        let argv = build("http://10.0.0.9/", "dir -x php,exe", true).unwrap();
        let i = argv.iter().position(|t| t == "-x").unwrap();
        assert_eq!(argv[i + 1], "php,exe");
    }

    #[test]
    fn extension_charset_enforced() {
        assert!(build("http://10.0.0.9/", "dir -x php.bak", false).is_err());
    }

    #[test]
    fn wordlist_traversal_rejected() {
        assert!(build("http://10.0.0.9/", "dir -w ../../etc/passwd", false).is_err());
    }

    #[test]
    fn wordlist_entry_count_boundary() {
        let dir = tempfile::tempdir().unwrap();

        let ok_path = dir.path().join("ok.txt");
        let mut f = std::fs::File::create(&ok_path).unwrap();
        for i in 0..1_000_000u32 {
            writeln!(f, "w{i}").unwrap();
        }
        drop(f);
        let arg = format!("dir -w {}", ok_path.display());
        assert!(build("http://10.0.0.9/", &arg, false).is_ok());

        let big_path = dir.path().join("big.txt");
        let mut f = std::fs::File::create(&big_path).unwrap();
        for i in 0..1_000_001u32 {
            writeln!(f, "w{i}").unwrap();
        }
        drop(f);
        let arg = format!("dir -w {}", big_path.display());
        assert!(build("http://10.0.0.9/", &arg, false).is_err());
    }

    #[test]
    fn missing_wordlist_passes_validation() {
        let argv = build("http://10.0.0.9/", "dir -w /nonexistent/words.txt", false).unwrap();
        assert!(argv.contains(&"/nonexistent/words.txt".to_string()));
    }
}
