//! Stack Services (stack half)
//!
//! Compose-project-level operations over a host's Docker context: deploy
//! (persist + optionally pull + `up -d`), `ps`, and `logs`. The
//! container-level primitives live in `container.rs`.

use crate::config::Host;
use crate::docker_context::DockerContext;
use crate::errors::DockerError;
use crate::ssh::FileTransfer;
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub type Result<T> = std::result::Result<T, DockerError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceState {
    pub service: String,
    pub state: String,
    pub published_ports: Vec<String>,
}

/// Persist `compose_text` to `{host.compose_path}/{stack_name}/docker-compose.yml`
/// over SSH, optionally pull images, then `docker compose up -d`. Rejects if
/// the target directory already exists and is non-empty unless `recreate` is
/// set.
#[instrument(skip(file_transfer, compose_text), fields(host = %host.host_id, stack_name))]
pub async fn deploy(
    file_transfer: &dyn FileTransfer,
    context: &DockerContext,
    host: &Host,
    stack_name: &str,
    compose_text: &str,
    pull: bool,
    recreate: bool,
) -> Result<()> {
    let stack_dir = host.compose_path.join(stack_name);
    let compose_file = stack_dir.join("docker-compose.yml");

    if !recreate {
        let listing = context
            .run(&["compose", "-f", &compose_file.display().to_string(), "config", "--services"])
            .await;
        if listing.is_ok() {
            return Err(DockerError::StackDirectoryExists {
                path: stack_dir.display().to_string(),
            });
        }
    }

    file_transfer
        .write_file(host, &compose_file.display().to_string(), compose_text.as_bytes())
        .await
        .map_err(|e| DockerError::CommandFailed {
            message: format!("failed to write compose file: {e}"),
        })?;

    if pull {
        context
            .run(&[
                "compose",
                "-f",
                &compose_file.display().to_string(),
                "-p",
                stack_name,
                "pull",
            ])
            .await?;
    }

    context
        .run(&[
            "compose",
            "-f",
            &compose_file.display().to_string(),
            "-p",
            stack_name,
            "up",
            "-d",
        ])
        .await?;

    Ok(())
}

/// Per-service state and published ports for a running stack.
#[instrument(skip(context), fields(context = %context.name(), stack_name))]
pub async fn ps(context: &DockerContext, stack_name: &str) -> Result<Vec<ServiceState>> {
    let stdout = context
        .run(&["compose", "-p", stack_name, "ps", "--format", "json"])
        .await?;
    parse_ps_output(&stdout)
}

/// `docker compose ps --format json` emits one JSON object per line (not a
/// JSON array), so each line is parsed independently and blank lines skipped.
fn parse_ps_output(stdout: &str) -> Result<Vec<ServiceState>> {
    let mut states = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: serde_json::Value =
            serde_json::from_str(line).map_err(|e| DockerError::ParseError {
                message: format!("failed to parse docker compose ps output: {e}"),
            })?;
        let service = entry
            .get("Service")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let state = entry
            .get("State")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let published_ports = entry
            .get("Publishers")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| {
                        let port = p.get("PublishedPort").and_then(|v| v.as_u64())?;
                        Some(port.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        states.push(ServiceState {
            service,
            state,
            published_ports,
        });
    }
    Ok(states)
}

/// Tear down a stack. `remove_volumes` corresponds to `--volumes`.
#[instrument(skip(context), fields(context = %context.name(), stack_name))]
pub async fn down(context: &DockerContext, stack_name: &str, remove_volumes: bool) -> Result<()> {
    let mut args = vec!["compose", "-p", stack_name, "down", "--remove-orphans"];
    if remove_volumes {
        args.push("--volumes");
    }
    context.run(&args).await?;
    Ok(())
}

/// Non-follow log retrieval for the whole stack (all services interleaved).
#[instrument(skip(context), fields(context = %context.name(), stack_name))]
pub async fn logs(context: &DockerContext, stack_name: &str, lines: u32) -> Result<String> {
    let tail = lines.min(crate::container::MAX_LOG_LINES).to_string();
    context
        .run(&["compose", "-p", stack_name, "logs", "--tail", &tail])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_json_object_per_line() {
        let stdout = r#"{"Service":"web","State":"running","Publishers":[{"PublishedPort":8080}]}
{"Service":"db","State":"exited","Publishers":[]}
"#;
        let states = parse_ps_output(stdout).unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].service, "web");
        assert_eq!(states[0].state, "running");
        assert_eq!(states[0].published_ports, vec!["8080".to_string()]);
        assert_eq!(states[1].service, "db");
        assert!(states[1].published_ports.is_empty());
    }

    #[test]
    fn skips_blank_lines() {
        let stdout = "\n{\"Service\":\"web\",\"State\":\"running\",\"Publishers\":[]}\n\n";
        let states = parse_ps_output(stdout).unwrap();
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_ps_output("not json").unwrap_err();
        assert!(matches!(err, DockerError::ParseError { .. }));
    }

    #[test]
    fn empty_output_yields_no_services() {
        assert!(parse_ps_output("").unwrap().is_empty());
    }
}
