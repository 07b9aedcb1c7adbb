//! Core error taxonomy
//!
//! Every component returns `CoreError` (or a narrower error that converts into it)
//! rather than letting a panic or an opaque `anyhow::Error` escape the library
//! boundary. The MCP surface matches on `CoreError::kind()` to fill the
//! `{success, error}` envelope; it never needs to string-sniff a message.

use thiserror::Error;

/// Stable classification used by the surface layer and the audit log.
///
/// Each kind carries a fixed
/// retry/propagation policy that is enforced by the callers named in its doc
/// comment, not by this enum itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input: host_id pattern, port range, stack name, path shape.
    Validation,
    /// Unknown host_id, container, or stack.
    NotFound,
    /// SSH denied, bad key, permission denied. Never retried.
    Auth,
    /// Connect timeout, broken pipe, Docker API 5xx. Retried by the SSH/Docker
    /// layer before it ever reaches a caller as this kind.
    Transient,
    /// A rate limiter cap was hit. Surfaced immediately.
    RateLimited,
    /// Checksum or count mismatch during transfer verification. Never retried.
    Integrity,
    /// Source quiescence failed even after `docker kill` escalation.
    ContainersStillRunning,
    /// A target port binding would collide with a running container or an
    /// active reservation.
    PortConflict,
    /// A ZFS transfer path did not resolve to a dataset root and fallback was
    /// declined.
    NotADataset,
    /// Internal invariant violation. Always triggers a migration rollback.
    Fatal,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("internal invariant violated: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Config(e) => e.kind(),
            CoreError::Ssh(e) => e.kind(),
            CoreError::Docker(e) => e.kind(),
            CoreError::Transfer(e) => e.kind(),
            CoreError::Migration(e) => e.kind(),
            CoreError::Cleanup(_) => ErrorKind::Fatal,
            CoreError::RateLimited(_) => ErrorKind::RateLimited,
            CoreError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        CoreError::Fatal(msg.into())
    }
}

/// Config Store errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    NotFound { path: String },

    #[error("failed to parse configuration file: {message}")]
    Parse { message: String },

    #[error("configuration I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("configuration validation error: {message}")]
    Validation { message: String },

    #[error("SSH config import error: {message}")]
    SshConfigImport { message: String },
}

impl ConfigError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::NotFound { .. } => ErrorKind::NotFound,
            ConfigError::Parse { .. } => ErrorKind::Validation,
            ConfigError::Io { .. } => ErrorKind::Fatal,
            ConfigError::Validation { .. } => ErrorKind::Validation,
            ConfigError::SshConfigImport { .. } => ErrorKind::Validation,
        }
    }
}

/// SSH Command Builder errors.
#[derive(Error, Debug)]
pub enum SshError {
    #[error("invalid SSH input ({field}): {message}")]
    Security { field: String, message: String },

    #[error("SSH authentication failed for host {host_id}: {message}")]
    Auth { host_id: String, message: String },

    #[error("SSH command to {host_id} timed out after {timeout_secs}s")]
    Timeout { host_id: String, timeout_secs: u64 },

    #[error("SSH command to {host_id} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        host_id: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("transient SSH failure to {host_id} after {attempts} attempts: {message}")]
    Transient {
        host_id: String,
        attempts: u32,
        message: String,
    },

    #[error("rate limit exceeded for host {host_id}: {reason}")]
    RateLimited { host_id: String, reason: String },
}

impl SshError {
    fn kind(&self) -> ErrorKind {
        match self {
            SshError::Security { .. } => ErrorKind::Validation,
            SshError::Auth { .. } => ErrorKind::Auth,
            SshError::Timeout { .. } => ErrorKind::Transient,
            SshError::CommandFailed { .. } => ErrorKind::Fatal,
            SshError::Transient { .. } => ErrorKind::Transient,
            SshError::RateLimited { .. } => ErrorKind::RateLimited,
        }
    }
}

/// Docker Context Manager / Container Services errors.
#[derive(Error, Debug)]
pub enum DockerError {
    #[error("docker context error for host {host_id}: {message}")]
    Context { host_id: String, message: String },

    #[error("container not found: {container}")]
    ContainerNotFound { container: String },

    #[error("stack not found: {stack_name} on host {host_id}")]
    StackNotFound { host_id: String, stack_name: String },

    #[error("docker command failed: {message}")]
    CommandFailed { message: String },

    #[error("failed to parse docker output: {message}")]
    ParseError { message: String },

    #[error("deploy target already has a non-empty stack directory: {path}")]
    StackDirectoryExists { path: String },
}

impl DockerError {
    fn kind(&self) -> ErrorKind {
        match self {
            DockerError::Context { .. } => ErrorKind::Transient,
            DockerError::ContainerNotFound { .. } => ErrorKind::NotFound,
            DockerError::StackNotFound { .. } => ErrorKind::NotFound,
            DockerError::CommandFailed { .. } => ErrorKind::Fatal,
            DockerError::ParseError { .. } => ErrorKind::Fatal,
            DockerError::StackDirectoryExists { .. } => ErrorKind::Validation,
        }
    }
}

/// Transfer Backend errors.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("path does not exist on source: {path}")]
    SourcePathMissing { path: String },

    #[error("integrity check failed for {backend}: {detail}")]
    Integrity { backend: String, detail: String },

    #[error("rsync exited with status {code}: {stderr}")]
    RsyncFailed { code: i32, stderr: String },

    #[error("zfs command failed: {message}")]
    ZfsFailed { message: String },

    #[error("path {path} is not a ZFS dataset root and fallback is disabled")]
    NotADataset { path: String },
}

impl TransferError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransferError::SourcePathMissing { .. } => ErrorKind::Validation,
            TransferError::Integrity { .. } => ErrorKind::Integrity,
            TransferError::RsyncFailed { .. } => ErrorKind::Transient,
            TransferError::ZfsFailed { .. } => ErrorKind::Transient,
            TransferError::NotADataset { .. } => ErrorKind::NotADataset,
        }
    }
}

/// Migration Orchestrator errors.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("source and target host must differ")]
    SameHost,

    #[error("source compose file not found at {path}")]
    ComposeNotFound { path: String },

    #[error("port conflict on target host {host_id}: {ports:?}")]
    PortConflict { host_id: String, ports: Vec<u16> },

    #[error("source containers for stack {stack_name} still running after escalation")]
    ContainersStillRunning { stack_name: String },

    #[error("migration {migration_id} failed at step {step}: {message}")]
    StepFailed {
        migration_id: String,
        step: String,
        message: String,
    },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Compose(#[from] crate::compose::ComposeError),
}

impl MigrationError {
    fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::SameHost => ErrorKind::Validation,
            MigrationError::ComposeNotFound { .. } => ErrorKind::NotFound,
            MigrationError::PortConflict { .. } => ErrorKind::PortConflict,
            MigrationError::ContainersStillRunning { .. } => ErrorKind::ContainersStillRunning,
            MigrationError::StepFailed { .. } => ErrorKind::Fatal,
            MigrationError::Transfer(e) => e.kind(),
            MigrationError::Compose(_) => ErrorKind::Validation,
        }
    }
}

/// Cleanup Engine errors.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("docker system df parse error: {message}")]
    DfParseError { message: String },

    #[error("prune command failed: {message}")]
    PruneFailed { message: String },

    #[error("invalid schedule: {message}")]
    InvalidSchedule { message: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
