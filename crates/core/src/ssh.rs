//! SSH Command Builder
//!
//! Turns `(host, argv...)` into a validated, shell-escaped, rate-limited
//! invocation of the system `ssh` binary and runs it with a timeout. This is the
//! only place in the codebase that is allowed to construct an SSH command line;
//! every other component depends on the narrow [`CommandExecutor`]/[`FileTransfer`]
//! traits so it can be exercised against a fake in tests (grounded on the
//! `CommandExecutor`/`FileTransfer` split used by `other_examples/g1ibby-dcd`).

use crate::audit::AuditLog;
use crate::config::Host;
use crate::errors::SshError;
use crate::rate_limit::{RateLimitRegistry, RateLimitResult};
use crate::retry::{retry_async, RetryConfig, RetryDecision};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

pub type Result<T> = std::result::Result<T, SshError>;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)*[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$|^[0-9]{1,3}(\.[0-9]{1,3}){3}$|^[0-9a-fA-F:]+$").unwrap()
});
static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]*\$?$").unwrap());
static STACK_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-]{0,62}$").unwrap());

/// Validate a hostname as an RFC 1123 label chain or an IP literal.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.len() > 253 || hostname.is_empty() {
        return Err(SshError::Security {
            field: "hostname".into(),
            message: format!("'{hostname}' exceeds 253 characters or is empty"),
        });
    }
    if HOSTNAME_RE.is_match(hostname) {
        Ok(())
    } else {
        Err(SshError::Security {
            field: "hostname".into(),
            message: format!("'{hostname}' is not a valid DNS name or IP literal"),
        })
    }
}

pub fn validate_username(username: &str) -> Result<()> {
    if username.len() > 32 || !USERNAME_RE.is_match(username) {
        return Err(SshError::Security {
            field: "username".into(),
            message: format!("'{username}' does not match ^[a-z_][a-z0-9_-]*\\$?$"),
        });
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(SshError::Security {
            field: "port".into(),
            message: "port must be in 1..=65535".into(),
        });
    }
    Ok(())
}

/// An absolute path, no `..` segments, no shell metacharacters, max 4096 chars.
pub fn validate_remote_path(path: &str) -> Result<()> {
    if path.len() > 4096 || !path.starts_with('/') {
        return Err(SshError::Security {
            field: "remote_path".into(),
            message: format!("'{path}' must be an absolute path under 4096 chars"),
        });
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(SshError::Security {
            field: "remote_path".into(),
            message: format!("'{path}' must not contain .. segments"),
        });
    }
    const FORBIDDEN: &[char] = &['$', '`', ';', '|', '&', '>', '<', '\n', '\r', '(', ')', '{', '}'];
    if path.chars().any(|c| FORBIDDEN.contains(&c)) {
        return Err(SshError::Security {
            field: "remote_path".into(),
            message: format!("'{path}' contains a shell metacharacter"),
        });
    }
    Ok(())
}

pub fn validate_stack_name(name: &str) -> Result<()> {
    if STACK_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(SshError::Security {
            field: "stack_name".into(),
            message: format!("'{name}' does not match ^[a-zA-Z0-9][a-zA-Z0-9_.-]{{0,62}}$"),
        })
    }
}

/// An absolute path that exists locally and is mode <= 0600.
pub fn validate_identity_file(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(SshError::Security {
            field: "identity_file".into(),
            message: format!("'{}' must be absolute", path.display()),
        });
    }
    let metadata = std::fs::metadata(path).map_err(|e| SshError::Security {
        field: "identity_file".into(),
        message: format!("'{}' does not exist locally: {e}", path.display()),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode > 0o600 {
            return Err(SshError::Security {
                field: "identity_file".into(),
                message: format!(
                    "'{}' has mode {:o}, must be <= 0600",
                    path.display(),
                    mode
                ),
            });
        }
    }
    let _ = metadata;
    Ok(())
}

fn validate_host(host: &Host) -> Result<()> {
    validate_hostname(&host.hostname)?;
    validate_username(&host.ssh_user)?;
    validate_port(host.ssh_port)?;
    if let Some(identity) = &host.identity_file {
        validate_identity_file(identity)?;
    }
    Ok(())
}

/// Output of a completed remote or local command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Narrow interface the rest of the codebase depends on instead of SSH
/// plumbing directly, so migration/discovery/cleanup logic can be unit tested
/// against a fake executor.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `argv` on `host` with `timeout`, shell-escaped and joined into the
    /// single remote command line.
    async fn run(&self, host: &Host, argv: &[&str], timeout: Duration) -> Result<CommandOutput>;
}

/// File transfer primitives layered on top of the same SSH channel (used by
/// stack deploy to write a compose file and by discovery to read probe output;
/// bulk data transfer itself is the Transfer Backends' job, not this trait's).
#[async_trait::async_trait]
pub trait FileTransfer: Send + Sync {
    async fn write_file(&self, host: &Host, remote_path: &str, content: &[u8]) -> Result<()>;
    async fn read_file(&self, host: &Host, remote_path: &str) -> Result<Vec<u8>>;
}

/// The real SSH-backed implementation. Validates, rate-limits, retries
/// transient failures, and writes an audit record for every call.
pub struct SshExecutor {
    state_dir: PathBuf,
    rate_limits: RateLimitRegistry,
    audit: Arc<AuditLog>,
    retry_config: RetryConfig,
}

impl SshExecutor {
    pub fn new(state_dir: impl Into<PathBuf>, audit: Arc<AuditLog>) -> Self {
        Self {
            state_dir: state_dir.into(),
            rate_limits: RateLimitRegistry::new(),
            audit,
            retry_config: RetryConfig::transient_default(),
        }
    }

    fn control_path_option(&self, host: &Host) -> String {
        format!(
            "ControlPath={}/ssh-%r@%h:%p",
            self.state_dir.display()
        )
    }

    fn build_argv(&self, host: &Host, remote_command: &str) -> Vec<String> {
        let mut argv = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            self.control_path_option(host),
            "-o".to_string(),
            "ControlPersist=10m".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-p".to_string(),
            host.ssh_port.to_string(),
        ];
        if let Some(identity) = &host.identity_file {
            argv.push("-i".to_string());
            argv.push(identity.display().to_string());
        }
        argv.push(format!("{}@{}", host.ssh_user, host.hostname));
        argv.push(remote_command.to_string());
        argv
    }

    /// Join shell-escaped tokens into the single remote command line. This is
    /// the one place a concatenated string is built, and only because `ssh`
    /// itself takes a single command argument executed by the remote shell.
    fn escape_remote_command(argv: &[&str]) -> String {
        argv.iter()
            .map(|token| shell_escape::escape(std::borrow::Cow::Borrowed(*token)).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn spawn_with_timeout(
        &self,
        argv: &[String],
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, (String, bool)> {
        let mut child = match Command::new("ssh")
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return Err((format!("failed to spawn ssh: {e}"), false)),
        };

        let wait = async {
            let output = child.wait_with_output().await;
            output.map_err(|e| format!("ssh wait failed: {e}"))
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(message)) => Err((message, false)),
            Err(_) => Err(("ssh command timed out".to_string(), true)),
        }
    }
}

#[async_trait::async_trait]
impl CommandExecutor for SshExecutor {
    #[instrument(skip(self, argv), fields(host = %host.host_id))]
    async fn run(&self, host: &Host, argv: &[&str], timeout: Duration) -> Result<CommandOutput> {
        validate_host(host)?;

        let op = argv.first().copied().unwrap_or("unknown");

        match self.rate_limits.acquire(&host.host_id) {
            RateLimitResult::Admitted => {}
            RateLimitResult::Rejected(reason) => {
                self.audit.record_rejected(&host.host_id, op, argv, &reason);
                return Err(SshError::RateLimited {
                    host_id: host.host_id.clone(),
                    reason,
                });
            }
        }
        let _permit = self.rate_limits.acquire_concurrency(&host.host_id).await;

        let remote_command = Self::escape_remote_command(argv);
        let ssh_argv = self.build_argv(host, &remote_command);
        let host_id = host.host_id.clone();

        let started = std::time::Instant::now();
        let result = retry_async(
            &self.retry_config,
            || async { self.spawn_with_timeout(&ssh_argv, timeout).await },
            |(_, is_timeout): &(String, bool)| {
                if *is_timeout {
                    RetryDecision::Retry
                } else {
                    RetryDecision::Stop
                }
            },
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                self.audit
                    .record(&host_id, op, argv, duration_ms, output.exit_code, output.success());
                if output.success() {
                    Ok(output)
                } else {
                    Err(SshError::CommandFailed {
                        host_id,
                        exit_code: output.exit_code,
                        stderr: output.stderr,
                    })
                }
            }
            Err((message, is_timeout)) => {
                self.audit.record(&host_id, op, argv, duration_ms, -1, false);
                if is_timeout {
                    Err(SshError::Timeout {
                        host_id,
                        timeout_secs: timeout.as_secs(),
                    })
                } else {
                    Err(SshError::Transient {
                        host_id,
                        attempts: self.retry_config.max_attempts + 1,
                        message,
                    })
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl FileTransfer for SshExecutor {
    #[instrument(skip(self, content), fields(host = %host.host_id, len = content.len()))]
    async fn write_file(&self, host: &Host, remote_path: &str, content: &[u8]) -> Result<()> {
        validate_host(host)?;
        validate_remote_path(remote_path)?;

        let remote_command = format!(
            "cat > {}",
            shell_escape::escape(std::borrow::Cow::Borrowed(remote_path))
        );
        let ssh_argv = self.build_argv(host, &remote_command);

        let mut child = Command::new("ssh")
            .args(&ssh_argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SshError::Transient {
                host_id: host.host_id.clone(),
                attempts: 1,
                message: format!("failed to spawn ssh: {e}"),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content).await.map_err(|e| SshError::Transient {
                host_id: host.host_id.clone(),
                attempts: 1,
                message: format!("failed to write remote file: {e}"),
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| SshError::Transient {
            host_id: host.host_id.clone(),
            attempts: 1,
            message: e.to_string(),
        })?;

        self.audit.record(
            &host.host_id,
            "write_file",
            &["write_file", remote_path],
            0,
            output.status.code().unwrap_or(-1),
            output.status.success(),
        );

        if output.status.success() {
            Ok(())
        } else {
            Err(SshError::CommandFailed {
                host_id: host.host_id.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    #[instrument(skip(self), fields(host = %host.host_id))]
    async fn read_file(&self, host: &Host, remote_path: &str) -> Result<Vec<u8>> {
        validate_host(host)?;
        validate_remote_path(remote_path)?;
        let output = self
            .run(host, &["cat", remote_path], DEFAULT_COMMAND_TIMEOUT)
            .await?;
        Ok(output.stdout.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn sample_host() -> Host {
        Host {
            host_id: "prod-1".into(),
            hostname: "10.0.0.10".into(),
            ssh_user: "docker".into(),
            ssh_port: 22,
            identity_file: None,
            description: String::new(),
            tags: BTreeSet::new(),
            compose_path: PathBuf::from("/opt/compose"),
            appdata_path: PathBuf::from("/opt/appdata"),
            zfs_capable: false,
            zfs_dataset: None,
            enabled: true,
        }
    }

    #[test]
    fn hostname_accepts_dns_and_ip() {
        assert!(validate_hostname("host.example.com").is_ok());
        assert!(validate_hostname("10.0.0.10").is_ok());
        assert!(validate_hostname("not a host").is_err());
    }

    #[test]
    fn username_rejects_leading_digit() {
        assert!(validate_username("docker").is_ok());
        assert!(validate_username("9docker").is_err());
    }

    #[test]
    fn remote_path_rejects_traversal_and_metacharacters() {
        assert!(validate_remote_path("/opt/compose/web").is_ok());
        assert!(validate_remote_path("/opt/../etc/passwd").is_err());
        assert!(validate_remote_path("/opt/compose; rm -rf /").is_err());
        assert!(validate_remote_path("relative/path").is_err());
    }

    #[test]
    fn escape_remote_command_quotes_each_token() {
        let joined = SshExecutor::escape_remote_command(&["docker", "ps", "--filter", "a b"]);
        assert!(joined.contains("'a b'"));
    }

    #[test]
    fn build_argv_applies_required_options() {
        let audit = Arc::new(AuditLog::in_memory());
        let executor = SshExecutor::new("/tmp/harborctl-test", audit);
        let host = sample_host();
        let argv = executor.build_argv(&host, "docker ps");
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert!(argv.iter().any(|a| a.contains("ControlMaster=auto")));
        assert_eq!(argv.last().unwrap(), "docker ps");
        assert!(argv.contains(&"docker@10.0.0.10".to_string()));
    }
}
