//! Shared state wiring for every CLI subcommand and MCP tool call.
//!
//! One [`AppContext`] is constructed at process start and handed by reference
//! to whichever surface (CLI dispatch or MCP tool handler) is driving it.

use anyhow::{Context, Result};
use harborctl_core::audit::AuditLog;
use harborctl_core::config::{Config, ConfigStore, Host};
use harborctl_core::migration::MigrationLocks;
use harborctl_core::ssh::SshExecutor;
use std::path::PathBuf;
use std::sync::Arc;

pub struct AppContext {
    pub config_store: ConfigStore,
    pub executor: SshExecutor,
    pub migration_locks: MigrationLocks,
    pub state_dir: PathBuf,
}

impl AppContext {
    /// Open the config store at `config_path`, creating an empty inventory if
    /// none exists yet, and wire up the SSH executor against `state_dir`
    /// (control sockets + audit log).
    pub fn open(config_path: PathBuf, state_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        if !config_path.exists() {
            Config::default()
                .save(&config_path)
                .with_context(|| format!("failed to initialize {}", config_path.display()))?;
        }
        let config_store = ConfigStore::open(&config_path)
            .with_context(|| format!("failed to open {}", config_path.display()))?;

        let audit = Arc::new(
            AuditLog::open(state_dir.join("audit.jsonl"))
                .with_context(|| format!("failed to open audit log under {}", state_dir.display()))?,
        );
        let executor = SshExecutor::new(state_dir.clone(), audit);

        Ok(Self {
            config_store,
            executor,
            migration_locks: MigrationLocks::new(),
            state_dir,
        })
    }

    pub fn host(&self, host_id: &str) -> Result<Host> {
        self.config_store
            .current()
            .hosts
            .get(host_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown host_id '{host_id}'"))
    }
}
