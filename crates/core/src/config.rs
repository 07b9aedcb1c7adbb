//! Config Store
//!
//! Loads, validates, and atomically persists the host inventory and cleanup
//! schedules that back every other component. `hosts.yml` is the on-disk format;
//! `Config` is the in-memory, validated representation. Hot reload is a poll loop
//! that re-parses on mtime change and publishes a new immutable snapshot — readers
//! never block a writer and never see a half-applied edit.

use crate::errors::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

pub type Result<T> = std::result::Result<T, ConfigError>;

static HOST_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,62}$").unwrap());
static STACK_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-]{0,62}$").unwrap());

/// Validate a host_id against the inventory slug rule.
pub fn validate_host_id(id: &str) -> Result<()> {
    if HOST_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(ConfigError::Validation {
            message: format!(
                "host_id '{id}' does not match ^[a-z0-9][a-z0-9_-]{{0,62}}$"
            ),
        })
    }
}

/// Validate a stack_name against the stack slug rule (shared with the SSH
/// builder's own check in `ssh::validate_stack_name`).
pub fn validate_stack_name(name: &str) -> Result<()> {
    if STACK_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::Validation {
            message: format!(
                "stack_name '{name}' does not match ^[a-zA-Z0-9][a-zA-Z0-9_.-]{{0,62}}$"
            ),
        })
    }
}

/// A remote Docker host in the inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    pub host_id: String,
    pub hostname: String,
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub compose_path: PathBuf,
    pub appdata_path: PathBuf,
    #[serde(default)]
    pub zfs_capable: bool,
    #[serde(default)]
    pub zfs_dataset: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl Host {
    /// The derived Docker context name this host is reachable under.
    pub fn docker_context_name(&self) -> String {
        format!("docker-mcp-{}", self.host_id)
    }

    /// The `ssh://` endpoint the context points at.
    pub fn docker_context_endpoint(&self) -> String {
        format!("ssh://{}@{}:{}", self.ssh_user, self.hostname, self.ssh_port)
    }

    pub fn validate(&self) -> Result<()> {
        validate_host_id(&self.host_id).map_err(|_| ConfigError::Validation {
            message: format!(
                "host '{}': host_id does not match ^[a-z0-9][a-z0-9_-]{{0,62}}$",
                self.host_id
            ),
        })?;

        if self.ssh_port == 0 {
            return Err(ConfigError::Validation {
                message: format!("host '{}': ssh_port must be in 1..=65535", self.host_id),
            });
        }

        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: format!("host '{}': hostname must not be empty", self.host_id),
            });
        }

        if let Some(identity) = &self.identity_file {
            if !identity.is_absolute() {
                return Err(ConfigError::Validation {
                    message: format!(
                        "host '{}': identity_file must be an absolute path",
                        self.host_id
                    ),
                });
            }
        }

        if self.zfs_capable && self.zfs_dataset.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Validation {
                message: format!(
                    "host '{}': zfs_capable requires a non-empty zfs_dataset",
                    self.host_id
                ),
            });
        }

        Ok(())
    }
}

/// Frequency for a cleanup schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFrequency {
    Daily,
    Weekly,
}

/// Risk tier a scheduled cleanup run should execute at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupTier {
    Check,
    Safe,
    Moderate,
    Aggressive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupSchedule {
    pub host_id: String,
    pub frequency: ScheduleFrequency,
    /// "HH:MM" in UTC.
    pub time: String,
    pub tier: CleanupTier,
}

impl CleanupSchedule {
    pub fn validate(&self) -> Result<()> {
        let parts: Vec<&str> = self.time.split(':').collect();
        let valid = match parts.as_slice() {
            [h, m] => h
                .parse::<u32>()
                .ok()
                .zip(m.parse::<u32>().ok())
                .is_some_and(|(h, m)| h < 24 && m < 60),
            _ => false,
        };
        if !valid {
            return Err(ConfigError::Validation {
                message: format!("cleanup schedule time '{}' is not HH:MM", self.time),
            });
        }
        Ok(())
    }
}

/// The fully validated in-memory configuration. Unknown top-level keys in
/// `hosts.yml` are ignored for forward compatibility; unknown fields inside a
/// host record are rejected by `Host`'s `#[serde(deny_unknown_fields)]` and
/// surface as a `ConfigError::Parse`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hosts: indexmap::IndexMap<String, Host>,
    #[serde(default)]
    pub cleanup_schedules: indexmap::IndexMap<String, CleanupSchedule>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        for (key, host) in &self.hosts {
            if key != &host.host_id {
                return Err(ConfigError::Validation {
                    message: format!(
                        "host map key '{key}' does not match embedded host_id '{}'",
                        host.host_id
                    ),
                });
            }
            host.validate()?;
        }
        for schedule in self.cleanup_schedules.values() {
            schedule.validate()?;
            if !self.hosts.contains_key(&schedule.host_id) {
                return Err(ConfigError::Validation {
                    message: format!(
                        "cleanup schedule references unknown host '{}'",
                        schedule.host_id
                    ),
                });
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Write `path.tmp`, fsync, rename over `path` with mode 0600.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let yaml = self.to_yaml()?;
        let tmp_path = path.with_extension("yml.tmp");

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(yaml.as_bytes())?;
        file.sync_all()?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp_path, path)?;
        debug!("saved config to {}", path.display());
        Ok(())
    }
}

/// A hosted reader/writer handle over the live config snapshot: readers stay
/// lock-free, `save`/`import_ssh` serialize through the sender side. Implemented
/// as an `ArcSwap`-free `tokio::sync::watch` channel: the writer replaces the
/// pointer, readers observe it on their next `current()` call without blocking
/// a concurrent reload.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    tx: Arc<watch::Sender<Config>>,
    rx: watch::Receiver<Config>,
    last_mtime: Arc<std::sync::Mutex<Option<SystemTime>>>,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Config::load(&path)?;
        let mtime = mtime_of(&path);
        let (tx, rx) = watch::channel(config);
        Ok(Self {
            path,
            tx: Arc::new(tx),
            rx,
            last_mtime: Arc::new(std::sync::Mutex::new(mtime)),
        })
    }

    pub fn current(&self) -> Config {
        self.rx.borrow().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self))]
    pub fn save(&self, config: &Config) -> Result<()> {
        config.save(&self.path)?;
        *self.last_mtime.lock().unwrap() = mtime_of(&self.path);
        self.tx.send_replace(config.clone());
        Ok(())
    }

    /// Re-parse if the file's mtime has advanced since the last observed value.
    /// A bad reload is logged and the previous snapshot retained.
    #[instrument(skip(self))]
    pub fn poll_reload(&self) -> bool {
        let current_mtime = mtime_of(&self.path);
        let mut last = self.last_mtime.lock().unwrap();
        if current_mtime == *last {
            return false;
        }
        match Config::load(&self.path) {
            Ok(config) => {
                *last = current_mtime;
                self.tx.send_replace(config);
                debug!("hot-reloaded config from {}", self.path.display());
                true
            }
            Err(e) => {
                warn!("config reload failed, retaining previous snapshot: {e}");
                *last = current_mtime;
                false
            }
        }
    }

    /// Run `poll_reload` on `interval` until cancelled. Intended to be spawned
    /// as a background task by the process entrypoint.
    pub async fn watch(self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.poll_reload();
        }
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Default location for `hosts.yml` under the per-user config directory,
/// falling back to `./hosts.yml` when no home directory can be resolved.
pub fn default_config_path() -> PathBuf {
    match directories::ProjectDirs::from("io", "harborctl", "harborctl") {
        Some(dirs) => dirs.config_dir().join("hosts.yml"),
        None => PathBuf::from("hosts.yml"),
    }
}

/// Default location for SSH control sockets and the audit log, under the
/// per-user state (or, where unsupported, cache) directory.
pub fn default_state_dir() -> PathBuf {
    match directories::ProjectDirs::from("io", "harborctl", "harborctl") {
        Some(dirs) => dirs
            .state_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dirs.cache_dir().join("state")),
        None => PathBuf::from(".harborctl-state"),
    }
}

/// Hosts known to be code-hosting, never Docker targets; skipped during
/// `import_ssh_config`.
const SKIPPED_SSH_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org", "localhost"];

/// A host candidate produced by parsing `~/.ssh/config`, not yet added to the
/// inventory — the caller decides which candidates to keep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCandidate {
    pub host_id: String,
    pub hostname: String,
    pub ssh_user: Option<String>,
    pub ssh_port: Option<u16>,
}

/// Parse an OpenSSH client config file into host candidates.
///
/// Wildcard patterns (containing `*` or `?`), `localhost`, and common VCS hosts
/// are skipped. `selected_hosts`, if given, restricts the result to those
/// `Host` entries (matched case-sensitively against the raw `Host` alias).
#[instrument(skip_all, fields(path = %path.display()))]
pub fn import_ssh_config(
    path: &Path,
    selected_hosts: Option<&[String]>,
) -> Result<Vec<HostCandidate>> {
    let content = std::fs::read_to_string(path)?;
    let mut candidates = Vec::new();
    let mut current: Option<(String, Option<String>, Option<String>, Option<u16>)> = None;

    fn flush(
        current: Option<(String, Option<String>, Option<String>, Option<u16>)>,
        out: &mut Vec<HostCandidate>,
    ) {
        if let Some((alias, hostname, user, port)) = current {
            if alias.contains('*') || alias.contains('?') {
                return;
            }
            if SKIPPED_SSH_HOSTS.contains(&alias.to_lowercase().as_str()) {
                return;
            }
            let host_id = slugify_host_id(&alias);
            out.push(HostCandidate {
                host_id,
                hostname: hostname.unwrap_or(alias),
                ssh_user: user,
                ssh_port: port,
            });
        }
    }

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default().trim();
        match key.to_lowercase().as_str() {
            "host" => {
                flush(current.take(), &mut candidates);
                current = Some((value.to_string(), None, None, None));
            }
            "hostname" if current.is_some() => {
                current.as_mut().unwrap().1 = Some(value.to_string());
            }
            "user" if current.is_some() => {
                current.as_mut().unwrap().2 = Some(value.to_string());
            }
            "port" if current.is_some() => {
                current.as_mut().unwrap().3 = value.parse().ok();
            }
            _ => {}
        }
    }
    flush(current, &mut candidates);

    let candidates = match selected_hosts {
        None => candidates,
        Some(selected) => candidates
            .into_iter()
            .filter(|c| selected.iter().any(|s| s == &c.host_id))
            .collect(),
    };

    Ok(candidates)
}

fn slugify_host_id(alias: &str) -> String {
    let mut slug: String = alias
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        slug = "host".to_string();
    }
    if !slug.chars().next().unwrap().is_ascii_alphanumeric() {
        slug = format!("h{slug}");
    }
    slug.truncate(63);
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_host(id: &str) -> Host {
        Host {
            host_id: id.to_string(),
            hostname: "10.0.0.10".to_string(),
            ssh_user: "docker".to_string(),
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
    fn validates_host_id_pattern() {
        assert!(validate_host_id("prod-1").is_ok());
        assert!(validate_host_id("Prod-1").is_err());
        assert!(validate_host_id("").is_err());
    }

    #[test]
    fn zfs_capable_requires_dataset() {
        let mut host = sample_host("prod-1");
        host.zfs_capable = true;
        assert!(host.validate().is_err());
        host.zfs_dataset = Some("tank/appdata".to_string());
        assert!(host.validate().is_ok());
    }

    #[test]
    fn round_trips_through_yaml() {
        let mut config = Config::default();
        config.hosts.insert("prod-1".to_string(), sample_host("prod-1"));
        let yaml = config.to_yaml().unwrap();
        let reloaded = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config, reloaded);
    }

    #[test]
    fn rejects_host_map_key_mismatch() {
        let mut config = Config::default();
        config.hosts.insert("wrong-key".to_string(), sample_host("prod-1"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn import_ssh_config_skips_wildcards_and_vcs_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            "Host *\n  ForwardAgent yes\n\nHost github.com\n  User git\n\nHost prod-1\n  HostName 10.0.0.10\n  User docker\n  Port 2222\n",
        )
        .unwrap();
        let candidates = import_ssh_config(&path, None).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].host_id, "prod-1");
        assert_eq!(candidates[0].hostname, "10.0.0.10");
        assert_eq!(candidates[0].ssh_port, Some(2222));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.yml");
        let mut config = Config::default();
        config.hosts.insert("prod-1".to_string(), sample_host("prod-1"));
        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(config, reloaded);
    }
}
