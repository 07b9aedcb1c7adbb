//! Container Services (container half)
//!
//! Thin layer over the Docker Context Manager: list/inspect/start/stop/
//! restart/remove/logs/stats/pull against one host's context. Parses the same
//! `docker inspect`/`docker ps --format json` shapes the Docker CLI has
//! always produced.

use crate::config::Host;
use crate::docker_context::DockerContext;
use crate::errors::DockerError;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub type Result<T> = std::result::Result<T, DockerError>;

/// A published port binding read off `docker inspect`'s `NetworkSettings.Ports`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub status: String,
    pub state: String,
    pub labels: std::collections::HashMap<String, String>,
    pub port_mappings: Vec<PortMapping>,
}

/// Max `logs(...)` line count a caller may request.
pub const MAX_LOG_LINES: u32 = 10_000;

fn parse_port_mappings(container: &serde_json::Value) -> Vec<PortMapping> {
    let mut mappings = Vec::new();
    if let Some(ports_obj) = container
        .get("NetworkSettings")
        .and_then(|ns| ns.get("Ports"))
        .and_then(|p| p.as_object())
    {
        for (port_spec, bindings) in ports_obj.iter() {
            let Some((port_str, protocol)) = port_spec.split_once('/') else {
                continue;
            };
            let Ok(container_port) = port_str.parse::<u16>() else {
                continue;
            };
            let Some(bindings_array) = bindings.as_array() else {
                continue;
            };
            for binding in bindings_array {
                let host_port = binding
                    .get("HostPort")
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse::<u16>().ok());
                let Some(host_port) = host_port else { continue };
                let host_ip = binding
                    .get("HostIp")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let host_ip = if host_ip.is_empty() {
                    "0.0.0.0".to_string()
                } else {
                    host_ip.to_string()
                };
                mappings.push(PortMapping {
                    host_ip,
                    host_port,
                    container_port,
                    protocol: protocol.to_string(),
                });
            }
        }
    }
    mappings
}

fn parse_labels(container: &serde_json::Value) -> std::collections::HashMap<String, String> {
    container
        .get("Config")
        .and_then(|c| c.get("Labels"))
        .and_then(|l| l.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn container_info_from_inspect(container: &serde_json::Value) -> ContainerInfo {
    ContainerInfo {
        id: container
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        names: container
            .get("Name")
            .and_then(|v| v.as_str())
            .map(|name| vec![name.trim_start_matches('/').to_string()])
            .unwrap_or_default(),
        image: container
            .get("Config")
            .and_then(|c| c.get("Image"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        status: container
            .get("State")
            .and_then(|s| s.get("Status"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        state: container
            .get("State")
            .and_then(|s| s.get("Status"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        labels: parse_labels(container),
        port_mappings: parse_port_mappings(container),
    }
}

/// Container operations for a single host, dispatched through its Docker
/// context. One instance is cheap to construct per request.
pub struct ContainerService {
    context: DockerContext,
}

impl ContainerService {
    pub fn new(host: &Host) -> Self {
        Self {
            context: DockerContext::for_host(host),
        }
    }

    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn list(&self, label_filter: Option<&str>) -> Result<Vec<ContainerInfo>> {
        let mut args = vec!["ps", "--all", "--format", "json"];
        let label_arg;
        if let Some(label) = label_filter {
            label_arg = format!("label={label}");
            args.push("--filter");
            args.push(&label_arg);
        }
        let stdout = self.context.run(&args).await?;

        let mut result = Vec::new();
        for line in stdout.trim().lines() {
            if line.trim().is_empty() {
                continue;
            }
            let container: serde_json::Value =
                serde_json::from_str(line).map_err(|e| DockerError::ParseError {
                    message: format!("failed to parse docker ps output: {e}"),
                })?;
            result.push(ContainerInfo {
                id: container
                    .get("ID")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                names: container
                    .get("Names")
                    .and_then(|v| v.as_str())
                    .map(|s| s.split(',').map(|n| n.trim().to_string()).collect())
                    .unwrap_or_default(),
                image: container
                    .get("Image")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                status: container
                    .get("Status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                state: container
                    .get("State")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                labels: std::collections::HashMap::new(),
                port_mappings: Vec::new(),
            });
        }
        Ok(result)
    }

    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn inspect(&self, container: &str) -> Result<Option<ContainerInfo>> {
        let result = self.context.run(&["inspect", container]).await;
        let stdout = match result {
            Ok(stdout) => stdout,
            Err(DockerError::CommandFailed { message })
                if message.contains("No such object") || message.contains("No such container") =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let containers: Vec<serde_json::Value> =
            serde_json::from_str(&stdout).map_err(|e| DockerError::ParseError {
                message: format!("failed to parse docker inspect output: {e}"),
            })?;
        Ok(containers.first().map(container_info_from_inspect))
    }

    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn start(&self, container: &str) -> Result<()> {
        self.context.run(&["start", container]).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn stop(&self, container: &str) -> Result<()> {
        self.context.run(&["stop", container]).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn restart(&self, container: &str) -> Result<()> {
        self.context.run(&["restart", container]).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn remove(&self, container: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container);
        self.context.run(&args).await?;
        Ok(())
    }

    /// Non-follow log retrieval. `lines` is clamped to `MAX_LOG_LINES`.
    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn logs(&self, container: &str, lines: u32, since: Option<&str>) -> Result<String> {
        let tail = lines.min(MAX_LOG_LINES).to_string();
        let mut args = vec!["logs", "--tail", &tail];
        if let Some(since) = since {
            args.push("--since");
            args.push(since);
        }
        args.push(container);
        self.context.run(&args).await
    }

    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn stats(&self, container: &str) -> Result<String> {
        self.context
            .run(&[
                "stats",
                "--no-stream",
                "--format",
                "json",
                container,
            ])
            .await
    }

    #[instrument(skip(self), fields(context = %self.context.name()))]
    pub async fn pull(&self, image: &str) -> Result<()> {
        debug!(image, "pulling image");
        self.context.run(&["pull", image]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_mappings_normalizes_empty_host_ip_to_wildcard() {
        let container = serde_json::json!({
            "NetworkSettings": {
                "Ports": {
                    "80/tcp": [{"HostIp": "", "HostPort": "8080"}]
                }
            }
        });
        let mappings = parse_port_mappings(&container);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].host_ip, "0.0.0.0");
        assert_eq!(mappings[0].host_port, 8080);
        assert_eq!(mappings[0].container_port, 80);
    }

    #[test]
    fn container_info_from_inspect_trims_leading_slash_from_name() {
        let container = serde_json::json!({
            "Id": "abc123",
            "Name": "/web-1",
            "Config": {"Image": "nginx:latest"},
            "State": {"Status": "running"}
        });
        let info = container_info_from_inspect(&container);
        assert_eq!(info.names, vec!["web-1".to_string()]);
        assert_eq!(info.image, "nginx:latest");
    }
}
