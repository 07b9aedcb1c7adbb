//! Docker Context Manager
//!
//! Each host gets a named Docker context (`docker-mcp-{host_id}`, endpoint
//! `ssh://{user}@{host}:{port}`) so that `docker` CLI invocations dispatch to
//! the right remote daemon without re-deriving SSH options every call.
//! Contexts are created on first use and removed on host deletion; a drifted
//! context (wrong endpoint, stale socket) is simply recreated rather than
//! diagnosed.

use crate::config::Host;
use crate::errors::DockerError;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

pub type Result<T> = std::result::Result<T, DockerError>;

#[derive(Debug, Deserialize)]
struct DockerContextLsEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "DockerEndpoint")]
    docker_endpoint: String,
}

/// Owns the lifecycle of one host's local Docker CLI context. All container
/// and stack operations run `docker --context <name> ...` through this handle
/// rather than opening their own SSH session.
#[derive(Debug, Clone)]
pub struct DockerContext {
    name: String,
    endpoint: String,
}

impl DockerContext {
    pub fn for_host(host: &Host) -> Self {
        Self {
            name: host.docker_context_name(),
            endpoint: host.docker_context_endpoint(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ensure the context exists and points at the right endpoint, creating
    /// or recreating it as needed.
    #[instrument(skip(self), fields(context = %self.name))]
    pub async fn ensure(&self) -> Result<()> {
        match self.lookup().await? {
            Some(existing) if existing.docker_endpoint == self.endpoint => {
                debug!("docker context already points at the expected endpoint");
                Ok(())
            }
            Some(_) => {
                warn!("docker context endpoint has drifted, recreating");
                self.remove_if_present().await?;
                self.create().await
            }
            None => self.create().await,
        }
    }

    async fn lookup(&self) -> Result<Option<DockerContextLsEntry>> {
        let output = Command::new("docker")
            .args(["context", "ls", "--format", "json"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DockerError::CommandFailed {
                message: format!("failed to list docker contexts: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DockerError::CommandFailed {
                message: format!("docker context ls failed: {stderr}"),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: DockerContextLsEntry =
                serde_json::from_str(line).map_err(|e| DockerError::ParseError {
                    message: format!("failed to parse docker context ls output: {e}"),
                })?;
            if entry.name == self.name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn create(&self) -> Result<()> {
        let docker_host = format!("host={}", self.endpoint);
        let output = Command::new("docker")
            .args([
                "context",
                "create",
                &self.name,
                "--docker",
                &docker_host,
            ])
            .output()
            .await
            .map_err(|e| DockerError::Context {
                host_id: self.name.clone(),
                message: format!("failed to spawn docker context create: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DockerError::Context {
                host_id: self.name.clone(),
                message: format!("docker context create failed: {stderr}"),
            });
        }
        Ok(())
    }

    async fn remove_if_present(&self) -> Result<()> {
        let output = Command::new("docker")
            .args(["context", "rm", "-f", &self.name])
            .output()
            .await
            .map_err(|e| DockerError::Context {
                host_id: self.name.clone(),
                message: format!("failed to spawn docker context rm: {e}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(stderr = %stderr, "docker context rm reported a failure, ignoring");
        }
        Ok(())
    }

    /// Remove this host's context. Called when the host is deleted from the
    /// inventory.
    #[instrument(skip(self), fields(context = %self.name))]
    pub async fn remove(&self) -> Result<()> {
        self.remove_if_present().await
    }

    /// Run an arbitrary `docker` subcommand against this context and return
    /// captured stdout. Used by `container.rs`/`stack.rs` for operations the
    /// Docker API path does not cover (e.g. `compose`).
    #[instrument(skip(self, args), fields(context = %self.name))]
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        let mut full_args = vec!["--context", self.name.as_str()];
        full_args.extend_from_slice(args);

        let output = Command::new("docker")
            .args(&full_args)
            .output()
            .await
            .map_err(|e| DockerError::CommandFailed {
                message: format!("failed to run docker {}: {e}", args.join(" ")),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DockerError::CommandFailed {
                message: format!("docker {} failed: {}", args.join(" "), stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn sample_host() -> Host {
        Host {
            host_id: "prod-1".into(),
            hostname: "10.0.0.10".into(),
            ssh_user: "docker".into(),
            ssh_port: 2222,
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
    fn context_name_and_endpoint_follow_the_published_convention() {
        let host = sample_host();
        let ctx = DockerContext::for_host(&host);
        assert_eq!(ctx.name(), "docker-mcp-prod-1");
        assert_eq!(ctx.endpoint, "ssh://docker@10.0.0.10:2222");
    }
}
