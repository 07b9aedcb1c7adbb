//! ZFS send/receive transfer backend
//!
//! Requires both hosts to be `zfs_capable` with a dataset whose mountpoint
//! matches the path being transferred. Snapshots the source dataset, pipes
//! `zfs send` through SSH into `zfs receive` on the target, and always
//! destroys the source-side snapshot on exit regardless of outcome.

use super::{Result, TransferBackend, TransferPath, TransferReport};
use crate::config::Host;
use crate::errors::TransferError;
use crate::ssh::{CommandExecutor, FileTransfer};
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

/// Whether a bare directory (not already a dataset root) should be
/// materialized into its own child dataset before transfer, or the caller
/// should fall back to rsync for that path instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonDatasetPolicy {
    MaterializeAsChildDataset,
    FallBackToRsync,
}

pub struct ZfsBackend {
    pub migration_id: String,
    pub non_dataset_policy: NonDatasetPolicy,
}

impl ZfsBackend {
    pub fn new(migration_id: impl Into<String>) -> Self {
        Self {
            migration_id: migration_id.into(),
            non_dataset_policy: NonDatasetPolicy::MaterializeAsChildDataset,
        }
    }

    /// Resolve the ZFS dataset that owns `path`, by matching `zfs list`
    /// mountpoints against the path and its ancestors.
    async fn resolve_dataset(
        executor: &dyn CommandExecutor,
        host: &Host,
        path: &std::path::Path,
    ) -> Result<Option<String>> {
        let output = executor
            .run(
                host,
                &["zfs", "list", "-H", "-o", "name,mountpoint"],
                Duration::from_secs(30),
            )
            .await
            .map_err(|e| TransferError::ZfsFailed {
                message: e.to_string(),
            })?;
        if !output.success() {
            return Err(TransferError::ZfsFailed {
                message: output.stderr,
            });
        }

        let mut best: Option<(String, usize)> = None;
        for line in output.stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(name), Some(mountpoint)) = (fields.next(), fields.next()) else {
                continue;
            };
            if path.starts_with(mountpoint) {
                let depth = mountpoint.matches('/').count();
                if best.as_ref().map(|(_, d)| depth > *d).unwrap_or(true) {
                    best = Some((name.to_string(), depth));
                }
            }
        }
        Ok(best.map(|(name, _)| name))
    }

    async fn is_exact_dataset_root(
        executor: &dyn CommandExecutor,
        host: &Host,
        path: &std::path::Path,
        dataset: &str,
    ) -> Result<bool> {
        let output = executor
            .run(
                host,
                &["zfs", "get", "-H", "-o", "value", "mountpoint", dataset],
                Duration::from_secs(15),
            )
            .await
            .map_err(|e| TransferError::ZfsFailed {
                message: e.to_string(),
            })?;
        Ok(output.success() && output.stdout.trim() == path.display().to_string())
    }

    async fn materialize_as_dataset(
        &self,
        executor: &dyn CommandExecutor,
        host: &Host,
        parent_dataset: &str,
        path: &std::path::Path,
    ) -> Result<String> {
        let leaf = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::NotADataset {
                path: path.display().to_string(),
            })?;
        let child_dataset = format!("{parent_dataset}/{leaf}");
        let staging = format!("{}.zfs-stage-{}", path.display(), self.migration_id);
        let path_str = path.display().to_string();

        let script = format!(
            "set -e; mv {path} {staging}; zfs create {dataset}; mv {staging}/* {path}/ 2>/dev/null || true; rmdir {staging}",
            path = shell_escape::escape(std::borrow::Cow::Borrowed(path_str.as_str())),
            staging = shell_escape::escape(std::borrow::Cow::Borrowed(staging.as_str())),
            dataset = shell_escape::escape(std::borrow::Cow::Borrowed(child_dataset.as_str())),
        );
        let output = executor
            .run(host, &["sh", "-c", &script], Duration::from_secs(120))
            .await
            .map_err(|e| TransferError::ZfsFailed {
                message: e.to_string(),
            })?;
        if !output.success() {
            return Err(TransferError::ZfsFailed {
                message: output.stderr,
            });
        }
        Ok(child_dataset)
    }
}

impl TransferBackend for ZfsBackend {
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
        let mut total_bytes = 0u64;

        for path in paths {
            let dataset = match Self::resolve_dataset(executor, source_host, &path.source).await? {
                Some(dataset) => {
                    if Self::is_exact_dataset_root(executor, source_host, &path.source, &dataset)
                        .await?
                    {
                        dataset
                    } else {
                        match self.non_dataset_policy {
                            NonDatasetPolicy::MaterializeAsChildDataset => {
                                self.materialize_as_dataset(executor, source_host, &dataset, &path.source)
                                    .await?
                            }
                            NonDatasetPolicy::FallBackToRsync => {
                                return Err(TransferError::NotADataset {
                                    path: path.source.display().to_string(),
                                })
                            }
                        }
                    }
                }
                None => {
                    return Err(TransferError::NotADataset {
                        path: path.source.display().to_string(),
                    })
                }
            };

            let target_dataset =
                Self::resolve_dataset(executor, target_host, &path.destination)
                    .await?
                    .ok_or_else(|| TransferError::NotADataset {
                        path: path.destination.display().to_string(),
                    })?;

            let snapshot = format!("{dataset}@migration_{}", self.migration_id);
            let snap_output = executor
                .run(source_host, &["zfs", "snapshot", &snapshot], Duration::from_secs(30))
                .await
                .map_err(|e| TransferError::ZfsFailed {
                    message: e.to_string(),
                })?;
            if !snap_output.success() {
                return Err(TransferError::ZfsFailed {
                    message: snap_output.stderr,
                });
            }

            let transfer_result = self
                .send_and_receive(executor, source_host, target_host, &snapshot, &target_dataset)
                .await;

            let destroy_output = executor
                .run(source_host, &["zfs", "destroy", &snapshot], Duration::from_secs(30))
                .await;
            if let Ok(output) = destroy_output {
                if !output.success() {
                    warn!(snapshot = %snapshot, stderr = %output.stderr, "failed to destroy source snapshot");
                }
            }

            transfer_result?;

            let verify = executor
                .run(target_host, &["zfs", "list", &target_dataset], Duration::from_secs(15))
                .await
                .map_err(|e| TransferError::ZfsFailed {
                    message: e.to_string(),
                })?;
            if !verify.success() {
                return Err(TransferError::Integrity {
                    backend: "zfs".to_string(),
                    detail: format!("target dataset {target_dataset} did not verify after receive"),
                });
            }

            let size_output = executor
                .run(
                    source_host,
                    &["zfs", "get", "-H", "-p", "-o", "value", "used", &dataset],
                    Duration::from_secs(15),
                )
                .await
                .ok();
            if let Some(output) = size_output {
                if let Ok(bytes) = output.stdout.trim().parse::<u64>() {
                    total_bytes += bytes;
                }
            }
        }

        Ok(TransferReport {
            backend: "zfs".to_string(),
            bytes_transferred: total_bytes,
            duration_ms: started.elapsed().as_millis() as u64,
            checksums: Vec::new(),
            ok: true,
            failure_reason: None,
        })
    }
}

impl ZfsBackend {
    async fn send_and_receive(
        &self,
        executor: &dyn CommandExecutor,
        source_host: &Host,
        target_host: &Host,
        snapshot: &str,
        target_dataset: &str,
    ) -> Result<()> {
        let remote_receive = format!(
            "ssh -o BatchMode=yes -p {} {}@{} zfs receive -F {}",
            target_host.ssh_port,
            target_host.ssh_user,
            target_host.hostname,
            shell_escape::escape(std::borrow::Cow::Borrowed(target_dataset)),
        );
        let pipeline = format!(
            "zfs send {} | {}",
            shell_escape::escape(std::borrow::Cow::Borrowed(snapshot)),
            remote_receive,
        );
        let output = executor
            .run(source_host, &["sh", "-c", &pipeline], Duration::from_secs(7200))
            .await
            .map_err(|e| TransferError::ZfsFailed {
                message: e.to_string(),
            })?;
        if !output.success() {
            return Err(TransferError::ZfsFailed {
                message: output.stderr,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_materializes_bare_directories() {
        let backend = ZfsBackend::new("01J0000000000000000000000");
        assert_eq!(backend.non_dataset_policy, NonDatasetPolicy::MaterializeAsChildDataset);
    }
}
