//! Append-only audit log for every SSH command dispatched by the SSH executor.
//!
//! Each record is one JSON line: `{ts, host_id, op, argv_digest, duration_ms,
//! exit_code, ok, rate_limited}`. The raw argv and stdout/stderr are never
//! written — only a SHA-256 digest of the argv, so an operator can correlate
//! entries without the log itself becoming a secrets store.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    ts: String,
    host_id: &'a str,
    op: &'a str,
    argv_digest: String,
    duration_ms: u64,
    exit_code: i32,
    ok: bool,
    rate_limited: bool,
}

enum Sink {
    File(Mutex<std::fs::File>),
    Memory(Mutex<Vec<String>>),
}

/// Append-only JSONL writer. One instance is shared across every
/// [`crate::ssh::SshExecutor`] call for the process lifetime.
pub struct AuditLog {
    sink: Sink,
}

impl AuditLog {
    /// Open (creating if needed) the audit log at `path`, mode 0600.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }
        Ok(Self {
            sink: Sink::File(Mutex::new(file)),
        })
    }

    /// An in-memory sink for tests and for any component that does not have
    /// a state directory (e.g. unit tests of `ssh.rs`).
    pub fn in_memory() -> Self {
        Self {
            sink: Sink::Memory(Mutex::new(Vec::new())),
        }
    }

    fn digest(argv: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for token in argv {
            hasher.update(token.as_bytes());
            hasher.update(b"\0");
        }
        format!("{:x}", hasher.finalize())
    }

    fn write(&self, record: &AuditRecord<'_>) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit record");
                return;
            }
        };
        match &self.sink {
            Sink::File(file) => {
                let mut file = file.lock().unwrap();
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "failed to append audit record");
                }
            }
            Sink::Memory(lines) => {
                lines.lock().unwrap().push(line);
            }
        }
    }

    pub fn record(&self, host_id: &str, op: &str, argv: &[&str], duration_ms: u64, exit_code: i32, ok: bool) {
        self.write(&AuditRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            host_id,
            op,
            argv_digest: Self::digest(argv),
            duration_ms,
            exit_code,
            ok,
            rate_limited: false,
        });
    }

    pub fn record_rejected(&self, host_id: &str, op: &str, argv: &[&str], reason: &str) {
        warn!(host_id, reason, "ssh command rejected by rate limiter");
        self.write(&AuditRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            host_id,
            op,
            argv_digest: Self::digest(argv),
            duration_ms: 0,
            exit_code: -1,
            ok: false,
            rate_limited: true,
        });
    }

    /// Test-only accessor for the in-memory sink's recorded lines.
    #[cfg(test)]
    pub fn lines(&self) -> Vec<String> {
        match &self.sink {
            Sink::Memory(lines) => lines.lock().unwrap().clone(),
            Sink::File(_) => panic!("lines() is only valid for an in-memory audit log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_never_contains_raw_argv_tokens() {
        let log = AuditLog::in_memory();
        log.record(
            "prod-1",
            "docker",
            &["docker", "rm", "-f", "secret-container-name"],
            12,
            0,
            true,
        );
        let lines = log.lines();
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].contains("secret-container-name"));
        assert!(lines[0].contains("argv_digest"));
        assert!(lines[0].contains("\"op\":\"docker\""));
    }

    #[test]
    fn digest_is_stable_for_the_same_argv() {
        let a = AuditLog::digest(&["docker", "ps"]);
        let b = AuditLog::digest(&["docker", "ps"]);
        let c = AuditLog::digest(&["docker", "pa"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejected_entries_are_flagged() {
        let log = AuditLog::in_memory();
        log.record_rejected("prod-1", "docker", &["docker", "ps"], "60 commands/minute cap reached");
        let lines = log.lines();
        assert!(lines[0].contains("\"rate_limited\":true"));
    }
}
