use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// The `tandem-orch` command line
    Cli,
    /// A long-lived host embedding the run registry
    Service,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Cli => "cli",
            ProcessKind::Service => "service",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub run_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub seq: Option<u64>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} sha256={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

/// First 16 hex chars of the SHA-256 of `input`
pub fn short_hash(input: &str) -> String {
    let mut hex = format!("{:x}", Sha256::digest(input.as_bytes()));
    hex.truncate(16);
    hex
}

const SECRET_PATH_MARKERS: [&str; 9] = [
    ".env",
    ".ssh",
    "id_rsa",
    "id_ed25519",
    ".netrc",
    ".npmrc",
    "credentials",
    ".aws",
    "shadow",
];
const SECRET_EXTENSIONS: [&str; 4] = [".pem", ".key", ".p12", ".pfx"];
const SECRET_WORDS: [&str; 5] = ["secret", "password", "token", "api_key", "apikey"];

fn token_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"sk-[A-Za-z0-9_\-]{16,}",
            r"gh[pousr]_[A-Za-z0-9]{20,}",
            r"AKIA[0-9A-Z]{16}",
            r"xox[abprs]-[A-Za-z0-9\-]{10,}",
            r"(?i)bearer\s+[A-Za-z0-9._\-]{16,}",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn assignment_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?i)\b([A-Za-z0-9_]*(?:api[_-]?key|token|password|secret)[A-Za-z0-9_]*)\s*[:=]\s*["']?([^\s"']+)"#).ok()
        })
        .as_ref()
}

/// Whether a path, command or URL names something that is likely a credential
pub fn looks_secret_like(input: &str) -> bool {
    let lowered = input.to_ascii_lowercase();
    SECRET_PATH_MARKERS.iter().any(|m| lowered.contains(m))
        || SECRET_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
        || SECRET_WORDS.iter().any(|w| lowered.contains(w))
        || token_patterns().iter().any(|re| re.is_match(input))
}

/// Mask credential-shaped substrings: well-known token formats and
/// `NAME=value` assignments whose name mentions a key, token or password.
pub fn scrub_secrets(input: &str) -> String {
    let mut out = input.to_string();
    for re in token_patterns() {
        out = re
            .replace_all(&out, |caps: &regex::Captures<'_>| redact_text(&caps[0]))
            .into_owned();
    }
    if let Some(re) = assignment_pattern() {
        out = re
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                if caps[2].starts_with("[redacted") {
                    caps[0].to_string()
                } else {
                    format!("{}={}", &caps[1], redact_text(&caps[2]))
                }
            })
            .into_owned();
    }
    out
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    let seq = event.seq.unwrap_or(0);
    match level {
        Level::ERROR => tracing::error!(
            target: "tandem.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_id = event.run_id.unwrap_or(""),
            task_id = event.task_id.unwrap_or(""),
            seq,
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "tandem.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_id = event.run_id.unwrap_or(""),
            task_id = event.task_id.unwrap_or(""),
            seq,
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "tandem.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_id = event.run_id.unwrap_or(""),
            task_id = event.task_id.unwrap_or(""),
            seq,
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

/// Install the process-wide subscriber: a daily JSONL file under `logs_dir`
/// (files older than `retention_days` are removed first) and, when
/// `console` is set, compact lines on stderr. `RUST_LOG` overrides the
/// default `info` filter. Keep the returned guard alive for the process
/// lifetime or buffered file lines are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
    console: bool,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let prefix = format!("tandem.{}", process.as_str());
    let removed = prune_expired_logs(logs_dir, &prefix, retention_days, Utc::now())?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // a second init in the same process (tests, embedding hosts) keeps the first
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init();

    Ok((
        guard,
        LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.display().to_string(),
            prefix,
            retention_days,
            pruned_files: removed,
            initialized_at: Utc::now(),
        },
    ))
}

/// Day encoded in a rotated log file name (`<prefix>.YYYY-MM-DD.jsonl`)
fn log_file_day(name: &str, prefix: &str) -> Option<NaiveDate> {
    let day = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn prune_expired_logs(
    logs_dir: &Path,
    prefix: &str,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let oldest_kept = (now - chrono::Duration::days(retention_days as i64)).date_naive();
    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| log_file_day(n, prefix))
            .is_some_and(|day| day < oldest_kept);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "super-secret-token-123";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len=22 sha256="));
        assert!(!redacted.contains("super-secret-token-123"));
        assert_eq!(redacted, redact_text(raw));
    }

    #[test]
    fn short_hash_is_the_digest_prefix() {
        // sha256("abc")
        assert_eq!(short_hash("abc"), "ba7816bf8f01cfea");
        assert_eq!(short_hash("").len(), 16);
    }

    #[test]
    fn secret_like_targets() {
        assert!(looks_secret_like(".env"));
        assert!(looks_secret_like("config/.env.production"));
        assert!(looks_secret_like("cat ~/.ssh/id_rsa"));
        assert!(looks_secret_like("certs/server.pem"));
        assert!(!looks_secret_like("README.md"));
        assert!(!looks_secret_like("src/lib.rs"));
    }

    #[test]
    fn scrub_masks_tokens_and_assignments() {
        let scrubbed = scrub_secrets("key sk-abcdefghijklmnopqrstuv and GH_TOKEN=ghx123456 ok");
        assert!(!scrubbed.contains("sk-abcdefghijklmnopqrstuv"));
        assert!(!scrubbed.contains("ghx123456"));
        assert!(scrubbed.contains("GH_TOKEN=[redacted len=9"));
        assert!(scrubbed.ends_with(" ok"));
        assert_eq!(scrub_secrets("plain text"), "plain text");
    }

    #[test]
    fn log_file_day_parses_rotated_names_only() {
        assert_eq!(
            log_file_day("tandem.cli.2026-03-04.jsonl", "tandem.cli"),
            NaiveDate::from_ymd_opt(2026, 3, 4)
        );
        assert_eq!(log_file_day("tandem.service.2026-03-04.jsonl", "tandem.cli"), None);
        assert_eq!(log_file_day("tandem.cli.latest.jsonl", "tandem.cli"), None);
    }

    #[test]
    fn prune_removes_only_expired_files_for_this_process() {
        let dir = std::env::temp_dir().join(format!("tandem-obs-prune-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        for name in [
            "tandem.cli.2020-01-01.jsonl",
            "tandem.cli.2026-10-15.jsonl",
            "tandem.service.2020-01-01.jsonl",
            "notes.txt",
        ] {
            fs::write(dir.join(name), "{}").unwrap();
        }
        let now = DateTime::parse_from_rfc3339("2026-10-16T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let removed = prune_expired_logs(&dir, "tandem.cli", 14, now).unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.join("tandem.cli.2020-01-01.jsonl").exists());
        assert!(dir.join("tandem.cli.2026-10-15.jsonl").exists());
        assert!(dir.join("tandem.service.2020-01-01.jsonl").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("C:/tmp/tandem");
        let logs = canonical_logs_dir_from_root(&root);
        assert_eq!(logs, PathBuf::from("C:/tmp/tandem").join("logs"));
    }
}
