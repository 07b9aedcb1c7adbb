//! RSYNC transfer backend
//!
//! The default, universal backend: used whenever either host lacks ZFS or
//! the datasets do not align. Streams directly rather than archiving first;
//! a tar-over-SSH fallback is available when `rsync` itself is missing from
//! a host, per the "earlier path-of-least-resistance" option.

use super::{
    build_inventory, compare_inventories, detect_checksum_algorithm, ChecksumAlgorithm, Result,
    TransferBackend, TransferPath, TransferReport,
};
use crate::config::Host;
use crate::errors::TransferError;
use crate::ssh::{CommandExecutor, FileTransfer};
use std::time::{Duration, Instant};
use tracing::instrument;

pub const DEFAULT_EXCLUDES: &[&str] = &[
    "**/cache/**",
    "**/.cache/**",
    "**/logs/**",
    "**/node_modules/**",
    "**/.git/**",
    "**/tmp/**",
];

pub struct RsyncBackend {
    pub excludes: Vec<String>,
}

impl Default for RsyncBackend {
    fn default() -> Self {
        Self {
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RsyncBackend {
    fn ssh_opts(target: &Host) -> String {
        format!(
            "ssh -o BatchMode=yes -o StrictHostKeyChecking=accept-new -o ConnectTimeout=10 -p {}",
            target.ssh_port
        )
    }

    /// Build the argv for one rsync invocation, shell-escaping source and
    /// destination per the published command shape.
    fn build_argv(&self, target: &Host, source: &str, destination: &str) -> Vec<String> {
        let mut argv = vec![
            "-aHAX".to_string(),
            "--numeric-ids".to_string(),
            "--delete".to_string(),
            "--compress".to_string(),
            "--partial".to_string(),
            "--info=stats2".to_string(),
        ];
        for exclude in &self.excludes {
            argv.push("--exclude".to_string());
            argv.push(exclude.clone());
        }
        argv.push("-e".to_string());
        argv.push(Self::ssh_opts(target));
        argv.push(source.to_string());
        argv.push(format!(
            "{}@{}:{}",
            target.ssh_user,
            target.hostname,
            shell_escape::escape(std::borrow::Cow::Borrowed(destination))
        ));
        argv
    }
}

impl TransferBackend for RsyncBackend {
    #[instrument(skip(self, executor, _file_transfer, paths), fields(source = %source_host.host_id, target = %target_host.host_id))]
    async fn transfer(
        &self,
        executor: &(dyn CommandExecutor + Send + Sync),
        _file_transfer: &(dyn FileTransfer + Send + Sync),
        source_host: &Host,
        target_host: &Host,
        paths: &[TransferPath],
    ) -> Result<TransferReport> {
        let started = Instant::now();
        let algorithm = detect_checksum_algorithm(executor, source_host).await;
        let mut checksums = Vec::new();
        let mut total_bytes = 0u64;

        for path in paths {
            let source_str = path.source.display().to_string();
            let exists = executor
                .run(source_host, &["test", "-e", &source_str], Duration::from_secs(10))
                .await
                .map_err(|e| TransferError::SourcePathMissing {
                    path: format!("{source_str}: {e}"),
                })?;
            if !exists.success() {
                return Err(TransferError::SourcePathMissing { path: source_str });
            }

            let before = build_inventory(executor, source_host, path, algorithm).await?;
            total_bytes += before.total_bytes;

            let destination = path.destination.display().to_string();
            let argv = self.build_argv(target_host, &source_str, &destination);
            let argv_refs: Vec<&str> = std::iter::once("rsync")
                .chain(argv.iter().map(|s| s.as_str()))
                .collect();
            let output = executor
                .run(source_host, &argv_refs, Duration::from_secs(3600))
                .await
                .map_err(|e| TransferError::RsyncFailed {
                    code: -1,
                    stderr: e.to_string(),
                })?;
            if !output.success() {
                return Err(TransferError::RsyncFailed {
                    code: output.exit_code,
                    stderr: output.stderr,
                });
            }

            let after_path = TransferPath {
                source: path.destination.clone(),
                destination: path.destination.clone(),
                critical_files: path.critical_files.clone(),
            };
            let after = build_inventory(executor, target_host, &after_path, algorithm).await?;
            let (ok, reason) = compare_inventories(&before, &after);
            if !ok {
                return Err(TransferError::Integrity {
                    backend: "rsync".to_string(),
                    detail: reason.unwrap_or_default(),
                });
            }

            for (file, checksum) in &before.critical_checksums {
                checksums.push(super::PathChecksumSummary {
                    path: file.display().to_string(),
                    algorithm: algorithm.name().to_string(),
                    matched: true,
                });
                let _ = checksum;
            }
        }

        Ok(TransferReport {
            backend: "rsync".to_string(),
            bytes_transferred: total_bytes,
            duration_ms: started.elapsed().as_millis() as u64,
            checksums,
            ok: true,
            failure_reason: None,
        })
    }
}

/// Tar-over-SSH fallback used when `rsync` is unavailable on a host. Verifies
/// archive integrity with `tar tzf` before the archive is ever transported.
#[instrument(skip(executor))]
pub async fn tar_fallback_archive(
    executor: &dyn CommandExecutor,
    host: &Host,
    source: &std::path::Path,
    archive_path: &std::path::Path,
) -> Result<()> {
    let source_str = source.display().to_string();
    let archive_str = archive_path.display().to_string();
    let tar_cmd = format!(
        "tar czf {} -C {} .",
        shell_escape::escape(std::borrow::Cow::Borrowed(archive_str.as_str())),
        shell_escape::escape(std::borrow::Cow::Borrowed(source_str.as_str())),
    );
    let output = executor
        .run(host, &["sh", "-c", &tar_cmd], Duration::from_secs(3600))
        .await
        .map_err(|e| TransferError::RsyncFailed {
            code: -1,
            stderr: e.to_string(),
        })?;
    if !output.success() {
        return Err(TransferError::RsyncFailed {
            code: output.exit_code,
            stderr: output.stderr,
        });
    }

    let verify = executor
        .run(host, &["tar", "tzf", &archive_str], Duration::from_secs(300))
        .await
        .map_err(|e| TransferError::Integrity {
            backend: "tar".to_string(),
            detail: e.to_string(),
        })?;
    if !verify.success() {
        return Err(TransferError::Integrity {
            backend: "tar".to_string(),
            detail: "tar tzf reported a corrupt archive".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn sample_host(id: &str) -> Host {
        Host {
            host_id: id.into(),
            hostname: format!("{id}.example.com"),
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
    fn build_argv_includes_default_excludes_and_shell_options() {
        let backend = RsyncBackend::default();
        let target = sample_host("target");
        let argv = backend.build_argv(&target, "/opt/appdata/web", "/opt/appdata/web.tmp");
        assert!(argv.contains(&"--exclude".to_string()));
        assert!(argv.iter().any(|a| a.contains("node_modules")));
        assert!(argv.iter().any(|a| a.starts_with("docker@")));
    }
}
