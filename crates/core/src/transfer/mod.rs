//! Transfer Backends
//!
//! A common contract (`transfer(...) -> TransferReport`) over two
//! implementations: [`rsync`] (the universal default) and [`zfs`] (used when
//! both hosts are ZFS-capable and every source path resolves to a dataset).
//! No close teacher analog exists for this component; the command-building
//! shape is grounded on [`crate::ssh`], and the tar-over-SSH fallback reuses
//! the `tar`+`flate2` feature-archive pairing used elsewhere in this crate.

pub mod rsync;
pub mod zfs;

use crate::config::Host;
use crate::errors::TransferError;
use crate::ssh::{CommandExecutor, FileTransfer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    Rsync,
    Zfs,
}

impl TransferMethod {
    pub fn id(&self) -> &'static str {
        match self {
            TransferMethod::Rsync => "rsync",
            TransferMethod::Zfs => "zfs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathChecksumSummary {
    pub path: String,
    pub algorithm: String,
    pub matched: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub backend: String,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub checksums: Vec<PathChecksumSummary>,
    pub ok: bool,
    pub failure_reason: Option<String>,
}

/// One path to move, plus its destination on the target host.
#[derive(Debug, Clone)]
pub struct TransferPath {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Critical files (relative to `source`) whose checksum must match after
    /// transfer. Empty means "check counts/sizes only".
    pub critical_files: Vec<PathBuf>,
}

/// Source-side byte/file-count/checksum inventory used for pre/post transfer
/// comparison.
#[derive(Debug, Clone, Default)]
pub struct PathInventory {
    pub file_count: u64,
    pub total_bytes: u64,
    pub critical_checksums: Vec<(PathBuf, String)>,
}

/// Checksum algorithm chosen per host capability: SHA-256 preferred, MD5
/// fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    pub fn remote_binary(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256sum",
            ChecksumAlgorithm::Md5 => "md5sum",
        }
    }
}

/// Probe which checksum binary is available on `host`, preferring SHA-256.
pub async fn detect_checksum_algorithm(
    executor: &dyn CommandExecutor,
    host: &Host,
) -> ChecksumAlgorithm {
    let sha256 = executor
        .run(host, &["which", "sha256sum"], std::time::Duration::from_secs(10))
        .await;
    if matches!(sha256, Ok(ref output) if output.success()) {
        ChecksumAlgorithm::Sha256
    } else {
        ChecksumAlgorithm::Md5
    }
}

/// Build a source-side inventory for a path: file count, total size, and
/// checksums of the caller-declared critical files.
pub async fn build_inventory(
    executor: &dyn CommandExecutor,
    host: &Host,
    path: &TransferPath,
    algorithm: ChecksumAlgorithm,
) -> Result<PathInventory> {
    let path_str = path.source.display().to_string();

    let count_output = executor
        .run(
            host,
            &["find", &path_str, "-type", "f", "-printf", "x\\n"],
            std::time::Duration::from_secs(60),
        )
        .await
        .map_err(|e| TransferError::RsyncFailed {
            code: -1,
            stderr: e.to_string(),
        })?;
    let file_count = count_output.stdout.lines().count() as u64;

    let size_output = executor
        .run(
            host,
            &["du", "-sb", &path_str],
            std::time::Duration::from_secs(60),
        )
        .await
        .map_err(|e| TransferError::RsyncFailed {
            code: -1,
            stderr: e.to_string(),
        })?;
    let total_bytes = size_output
        .stdout
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let mut critical_checksums = Vec::new();
    for critical in &path.critical_files {
        let full_path = path.source.join(critical).display().to_string();
        let output = executor
            .run(
                host,
                &[algorithm.remote_binary(), &full_path],
                std::time::Duration::from_secs(30),
            )
            .await;
        if let Ok(output) = output {
            if output.success() {
                if let Some(sum) = output.stdout.split_whitespace().next() {
                    critical_checksums.push((critical.clone(), sum.to_string()));
                }
            }
        }
    }

    Ok(PathInventory {
        file_count,
        total_bytes,
        critical_checksums,
    })
}

/// Compare a pre/post inventory pair per the published tolerance rules: file
/// counts equal, total size within 1%, every critical checksum matches.
pub fn compare_inventories(
    before: &PathInventory,
    after: &PathInventory,
) -> (bool, Option<String>) {
    if before.file_count != after.file_count {
        return (
            false,
            Some(format!(
                "file count mismatch: {} before, {} after",
                before.file_count, after.file_count
            )),
        );
    }

    if before.total_bytes > 0 {
        let diff = before.total_bytes.abs_diff(after.total_bytes);
        let tolerance = before.total_bytes / 100;
        if diff > tolerance {
            return (
                false,
                Some(format!(
                    "total size differs by more than 1%: {} before, {} after",
                    before.total_bytes, after.total_bytes
                )),
            );
        }
    }

    let after_map: std::collections::HashMap<_, _> = after.critical_checksums.iter().cloned().collect();
    for (path, checksum) in &before.critical_checksums {
        match after_map.get(path) {
            Some(after_checksum) if after_checksum == checksum => {}
            _ => {
                return (
                    false,
                    Some(format!("checksum mismatch for critical file {}", path.display())),
                )
            }
        }
    }

    (true, None)
}

/// A pluggable transfer implementation. `SshExecutor` doubles as the
/// `CommandExecutor`/`FileTransfer` the backend needs to drive both sides.
#[allow(async_fn_in_trait)]
pub trait TransferBackend {
    async fn transfer(
        &self,
        executor: &(dyn CommandExecutor + Send + Sync),
        file_transfer: &(dyn FileTransfer + Send + Sync),
        source_host: &Host,
        target_host: &Host,
        paths: &[TransferPath],
    ) -> Result<TransferReport>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn inventories_within_one_percent_are_equal() {
        let before = PathInventory {
            file_count: 100,
            total_bytes: 1_000_000,
            critical_checksums: vec![(PathBuf::from("a.db"), "abc".into())],
        };
        let after = PathInventory {
            file_count: 100,
            total_bytes: 1_005_000,
            critical_checksums: vec![(PathBuf::from("a.db"), "abc".into())],
        };
        let (ok, reason) = compare_inventories(&before, &after);
        assert!(ok, "{reason:?}");
    }

    #[test]
    fn file_count_mismatch_fails() {
        let before = PathInventory {
            file_count: 100,
            total_bytes: 1000,
            critical_checksums: vec![],
        };
        let after = PathInventory {
            file_count: 99,
            total_bytes: 1000,
            critical_checksums: vec![],
        };
        let (ok, reason) = compare_inventories(&before, &after);
        assert!(!ok);
        assert!(reason.unwrap().contains("file count"));
    }

    #[test]
    fn checksum_mismatch_fails() {
        let before = PathInventory {
            file_count: 1,
            total_bytes: 1,
            critical_checksums: vec![(PathBuf::from("a.db"), "abc".into())],
        };
        let after = PathInventory {
            file_count: 1,
            total_bytes: 1,
            critical_checksums: vec![(PathBuf::from("a.db"), "def".into())],
        };
        let (ok, _) = compare_inventories(&before, &after);
        assert!(!ok);
    }
}
