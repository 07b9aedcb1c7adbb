//! Capability Discovery
//!
//! Read-only SSH probes run on host add and on the `discover` action: Docker
//! version, candidate compose/appdata directories ranked by stack count, and
//! ZFS dataset detection. Results are merged into the host record only where
//! fields are still empty; the caller always gets back a guidance message
//! alongside whatever was found. Probes run through the [`CommandExecutor`]
//! trait rather than a local `Command`, so they can be unit tested against a
//! fake.

use crate::config::Host;
use crate::errors::SshError;
use crate::ssh::CommandExecutor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, instrument};

pub type Result<T> = std::result::Result<T, SshError>;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const COMPOSE_SEARCH_ROOTS: &[&str] = &["/opt", "/srv", "/mnt", "/home"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateDirectory {
    pub path: String,
    pub stack_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub docker_version: Option<String>,
    pub compose_candidates: Vec<CandidateDirectory>,
    pub appdata_candidates: Vec<CandidateDirectory>,
    pub zfs_capable: bool,
    pub zfs_dataset: Option<String>,
    pub guidance: Vec<String>,
}

/// Probe `docker version --format '{{.Server.Version}}'` over SSH.
#[instrument(skip(executor))]
async fn probe_docker_version(executor: &dyn CommandExecutor, host: &Host) -> Option<String> {
    let output = executor
        .run(host, &["docker", "version", "--format", "{{.Server.Version}}"], PROBE_TIMEOUT)
        .await
        .ok()?;
    if output.success() {
        let version = output.stdout.trim().to_string();
        (!version.is_empty()).then_some(version)
    } else {
        None
    }
}

/// Scan `roots` for directories that have at least one immediate child that
/// itself has a compose file, ranked by how many such children it has.
#[instrument(skip(executor))]
async fn probe_compose_candidates(
    executor: &dyn CommandExecutor,
    host: &Host,
) -> Vec<CandidateDirectory> {
    let mut candidates = Vec::new();
    for root in COMPOSE_SEARCH_ROOTS {
        let find_cmd = format!(
            "find {root} -mindepth 2 -maxdepth 2 \\( -name docker-compose.yml -o -name compose.yaml \\) 2>/dev/null | sed 's#/[^/]*$##' | sed 's#/[^/]*$##' | sort | uniq -c | sort -rn"
        );
        let output = executor
            .run(host, &["sh", "-c", &find_cmd], PROBE_TIMEOUT)
            .await;
        let Ok(output) = output else { continue };
        if !output.success() {
            continue;
        }
        for line in output.stdout.lines() {
            let line = line.trim();
            let Some((count_str, path)) = line.split_once(' ') else {
                continue;
            };
            let Ok(stack_count) = count_str.trim().parse::<usize>() else {
                continue;
            };
            if !path.trim().is_empty() {
                candidates.push(CandidateDirectory {
                    path: path.trim().to_string(),
                    stack_count,
                });
            }
        }
    }
    candidates.sort_by(|a, b| b.stack_count.cmp(&a.stack_count));
    candidates
}

/// Same heuristic as compose candidates, but against directories with many
/// sibling per-service data subdirectories rather than compose files.
#[instrument(skip(executor))]
async fn probe_appdata_candidates(
    executor: &dyn CommandExecutor,
    host: &Host,
) -> Vec<CandidateDirectory> {
    let mut candidates = Vec::new();
    for root in COMPOSE_SEARCH_ROOTS {
        let find_cmd =
            format!("find {root} -mindepth 1 -maxdepth 1 -type d 2>/dev/null | while read -r d; do echo \"$(find \"$d\" -mindepth 1 -maxdepth 1 -type d 2>/dev/null | wc -l) $d\"; done | sort -rn");
        let output = executor
            .run(host, &["sh", "-c", &find_cmd], PROBE_TIMEOUT)
            .await;
        let Ok(output) = output else { continue };
        if !output.success() {
            continue;
        }
        for line in output.stdout.lines() {
            let line = line.trim();
            let Some((count_str, path)) = line.split_once(' ') else {
                continue;
            };
            let Ok(stack_count) = count_str.trim().parse::<usize>() else {
                continue;
            };
            if stack_count > 0 && !path.trim().is_empty() {
                candidates.push(CandidateDirectory {
                    path: path.trim().to_string(),
                    stack_count,
                });
            }
        }
    }
    candidates.sort_by(|a, b| b.stack_count.cmp(&a.stack_count));
    candidates
}

/// `zfs version` success gates dataset listing; the dataset whose mountpoint
/// matches `host.appdata_path` (if set) is preferred.
#[instrument(skip(executor))]
async fn probe_zfs(executor: &dyn CommandExecutor, host: &Host) -> (bool, Option<String>) {
    let version_check = executor
        .run(host, &["zfs", "version"], PROBE_TIMEOUT)
        .await;
    let zfs_capable = matches!(version_check, Ok(ref output) if output.success());
    if !zfs_capable {
        return (false, None);
    }

    let list = executor
        .run(
            host,
            &["zfs", "list", "-H", "-o", "name,mountpoint"],
            PROBE_TIMEOUT,
        )
        .await;
    let Ok(list) = list else {
        return (true, None);
    };
    if !list.success() {
        return (true, None);
    }

    let appdata = host.appdata_path.display().to_string();
    for line in list.stdout.lines() {
        let mut fields = line.split_whitespace();
        let name = fields.next();
        let mountpoint = fields.next();
        if let (Some(name), Some(mountpoint)) = (name, mountpoint) {
            if mountpoint == appdata {
                return (true, Some(name.to_string()));
            }
        }
    }
    (true, None)
}

/// Run every probe against `host` and return merged guidance. Does not
/// mutate `host`; callers apply results into the config store themselves so
/// the "fill only if empty" rule can be enforced against the live record.
#[instrument(skip(executor, host), fields(host = %host.host_id))]
pub async fn discover(executor: &dyn CommandExecutor, host: &Host) -> Result<DiscoveryResult> {
    let docker_version = probe_docker_version(executor, host).await;
    let compose_candidates = probe_compose_candidates(executor, host).await;
    let appdata_candidates = probe_appdata_candidates(executor, host).await;
    let (zfs_capable, zfs_dataset) = probe_zfs(executor, host).await;

    let mut guidance = Vec::new();
    if docker_version.is_none() {
        guidance.push("could not determine the remote Docker version; is docker installed and reachable over SSH?".to_string());
    }
    if compose_candidates.is_empty() {
        guidance.push("no directories with compose files were found under the default search roots".to_string());
    }
    if appdata_candidates.is_empty() {
        guidance.push("no likely appdata directories were found under the default search roots".to_string());
    }
    if !zfs_capable {
        guidance.push("ZFS is not available on this host; transfers will use rsync".to_string());
    } else if zfs_dataset.is_none() {
        guidance.push("ZFS is available but no dataset's mountpoint matches the configured appdata_path".to_string());
    }

    debug!(
        docker_version = ?docker_version,
        compose_candidates = compose_candidates.len(),
        appdata_candidates = appdata_candidates.len(),
        zfs_capable,
        "discovery complete"
    );

    Ok(DiscoveryResult {
        docker_version,
        compose_candidates,
        appdata_candidates,
        zfs_capable,
        zfs_dataset,
        guidance,
    })
}

/// Apply a [`DiscoveryResult`] into `host`, filling only fields that are
/// currently empty/default, per the published merge rule.
pub fn merge_into_host(host: &mut Host, result: &DiscoveryResult) {
    if host.compose_path.as_os_str().is_empty() {
        if let Some(top) = result.compose_candidates.first() {
            host.compose_path = PathBuf::from(&top.path);
        }
    }
    if host.appdata_path.as_os_str().is_empty() {
        if let Some(top) = result.appdata_candidates.first() {
            host.appdata_path = PathBuf::from(&top.path);
        }
    }

    if !result.zfs_capable {
        return;
    }
    if !host.zfs_capable {
        host.zfs_capable = true;
    }
    if host.zfs_dataset.is_none() {
        host.zfs_dataset = result.zfs_dataset.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::CommandOutput;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct FakeExecutor {
        responses: Mutex<std::collections::HashMap<String, CommandOutput>>,
    }

    impl FakeExecutor {
        fn new() -> Self {
            Self {
                responses: Mutex::new(std::collections::HashMap::new()),
            }
        }

        fn set(&self, argv: &[&str], output: CommandOutput) {
            self.responses
                .lock()
                .unwrap()
                .insert(argv.join(" "), output);
        }
    }

    #[async_trait::async_trait]
    impl CommandExecutor for FakeExecutor {
        async fn run(
            &self,
            _host: &Host,
            argv: &[&str],
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(&argv.join(" "))
                .cloned()
                .unwrap_or(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "not stubbed".into(),
                }))
        }
    }

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

    #[tokio::test]
    async fn merges_zfs_capability_when_probe_succeeds() {
        let executor = FakeExecutor::new();
        executor.set(
            &["docker", "version", "--format", "{{.Server.Version}}"],
            CommandOutput {
                exit_code: 0,
                stdout: "24.0.7\n".into(),
                stderr: String::new(),
            },
        );
        executor.set(
            &["zfs", "version"],
            CommandOutput {
                exit_code: 0,
                stdout: "zfs-2.1.5\n".into(),
                stderr: String::new(),
            },
        );
        executor.set(
            &["zfs", "list", "-H", "-o", "name,mountpoint"],
            CommandOutput {
                exit_code: 0,
                stdout: "tank/appdata\t/opt/appdata\n".into(),
                stderr: String::new(),
            },
        );

        let host = sample_host();
        let result = discover(&executor, &host).await.unwrap();
        assert_eq!(result.docker_version.as_deref(), Some("24.0.7"));
        assert!(result.zfs_capable);
        assert_eq!(result.zfs_dataset.as_deref(), Some("tank/appdata"));

        let mut mutable_host = sample_host();
        merge_into_host(&mut mutable_host, &result);
        assert!(mutable_host.zfs_capable);
        assert_eq!(mutable_host.zfs_dataset.as_deref(), Some("tank/appdata"));
    }

    #[test]
    fn merge_fills_compose_and_appdata_path_from_top_candidate() {
        let mut host = sample_host();
        host.compose_path = PathBuf::new();
        host.appdata_path = PathBuf::new();

        let result = DiscoveryResult {
            docker_version: Some("24.0.7".into()),
            compose_candidates: vec![
                CandidateDirectory { path: "/opt/compose".into(), stack_count: 5 },
                CandidateDirectory { path: "/srv/compose".into(), stack_count: 2 },
            ],
            appdata_candidates: vec![CandidateDirectory {
                path: "/opt/appdata".into(),
                stack_count: 5,
            }],
            zfs_capable: false,
            zfs_dataset: None,
            guidance: Vec::new(),
        };

        merge_into_host(&mut host, &result);
        assert_eq!(host.compose_path, PathBuf::from("/opt/compose"));
        assert_eq!(host.appdata_path, PathBuf::from("/opt/appdata"));
    }

    #[test]
    fn merge_leaves_existing_paths_untouched() {
        let mut host = sample_host();
        let original_compose = host.compose_path.clone();

        let result = DiscoveryResult {
            docker_version: None,
            compose_candidates: vec![CandidateDirectory {
                path: "/srv/other".into(),
                stack_count: 9,
            }],
            appdata_candidates: Vec::new(),
            zfs_capable: false,
            zfs_dataset: None,
            guidance: Vec::new(),
        };

        merge_into_host(&mut host, &result);
        assert_eq!(host.compose_path, original_compose);
    }

    #[tokio::test]
    async fn missing_docker_produces_guidance() {
        let executor = FakeExecutor::new();
        let host = sample_host();
        let result = discover(&executor, &host).await.unwrap();
        assert!(result.docker_version.is_none());
        assert!(result
            .guidance
            .iter()
            .any(|g| g.contains("Docker version")));
    }
}
