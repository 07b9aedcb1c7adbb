//! Host inventory subcommands
//!
//! Implements `harborctl host add|edit|remove|list|discover|import-ssh`.

use crate::context::AppContext;
use anyhow::{bail, Result};
use clap::Args;
use harborctl_core::config::Host;
use harborctl_core::discovery;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Args)]
pub struct HostAddArgs {
    /// Unique inventory slug, e.g. "prod-1"
    pub host_id: String,
    pub hostname: String,
    #[arg(long, default_value = "docker")]
    pub ssh_user: String,
    #[arg(long, default_value_t = 22)]
    pub ssh_port: u16,
    #[arg(long)]
    pub identity_file: Option<PathBuf>,
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,
    /// Defaults to empty; `--discover` fills it from the most populated
    /// candidate directory found by the capability probe.
    #[arg(long)]
    pub compose_path: Option<PathBuf>,
    /// Defaults to empty; `--discover` fills it the same way as `compose_path`.
    #[arg(long)]
    pub appdata_path: Option<PathBuf>,
    /// Run capability discovery against the new host before saving it.
    #[arg(long)]
    pub discover: bool,
}

#[instrument(skip(ctx, args), fields(host_id = %args.host_id))]
pub async fn execute_add(ctx: &AppContext, args: HostAddArgs) -> Result<()> {
    let mut config = ctx.config_store.current();
    if config.hosts.contains_key(&args.host_id) {
        bail!("host '{}' already exists", args.host_id);
    }

    let mut host = Host {
        host_id: args.host_id.clone(),
        hostname: args.hostname,
        ssh_user: args.ssh_user,
        ssh_port: args.ssh_port,
        identity_file: args.identity_file,
        description: args.description,
        tags: args.tags.into_iter().collect::<BTreeSet<_>>(),
        compose_path: args.compose_path.unwrap_or_default(),
        appdata_path: args.appdata_path.unwrap_or_default(),
        zfs_capable: false,
        zfs_dataset: None,
        enabled: true,
    };
    host.validate()?;

    if args.discover {
        let result = discovery::discover(&ctx.executor, &host).await?;
        discovery::merge_into_host(&mut host, &result);
        for line in &result.guidance {
            warn!("{line}");
        }
    }

    config.hosts.insert(host.host_id.clone(), host);
    ctx.config_store.save(&config)?;
    info!("host added");
    println!("added host '{}'", args.host_id);
    Ok(())
}

#[derive(Debug, Clone, Args)]
pub struct HostEditArgs {
    pub host_id: String,
    #[arg(long)]
    pub hostname: Option<String>,
    #[arg(long)]
    pub ssh_user: Option<String>,
    #[arg(long)]
    pub ssh_port: Option<u16>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub enabled: Option<bool>,
}

#[instrument(skip(ctx, args), fields(host_id = %args.host_id))]
pub async fn execute_edit(ctx: &AppContext, args: HostEditArgs) -> Result<()> {
    let mut config = ctx.config_store.current();
    let host = config
        .hosts
        .get_mut(&args.host_id)
        .ok_or_else(|| anyhow::anyhow!("unknown host_id '{}'", args.host_id))?;

    if let Some(hostname) = args.hostname {
        host.hostname = hostname;
    }
    if let Some(ssh_user) = args.ssh_user {
        host.ssh_user = ssh_user;
    }
    if let Some(ssh_port) = args.ssh_port {
        host.ssh_port = ssh_port;
    }
    if let Some(description) = args.description {
        host.description = description;
    }
    if let Some(enabled) = args.enabled {
        host.enabled = enabled;
    }
    host.validate()?;

    ctx.config_store.save(&config)?;
    println!("updated host '{}'", args.host_id);
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_remove(ctx: &AppContext, host_id: &str) -> Result<()> {
    let mut config = ctx.config_store.current();
    let host = config
        .hosts
        .shift_remove(host_id)
        .ok_or_else(|| anyhow::anyhow!("unknown host_id '{host_id}'"))?;
    config
        .cleanup_schedules
        .retain(|_, schedule| schedule.host_id != host_id);
    ctx.config_store.save(&config)?;

    let context = harborctl_core::docker_context::DockerContext::for_host(&host);
    if let Err(e) = context.remove().await {
        warn!(error = %e, "failed to remove docker context for deleted host, continuing");
    }

    println!("removed host '{host_id}'");
    Ok(())
}

pub async fn execute_list(ctx: &AppContext) -> Result<()> {
    let config = ctx.config_store.current();
    let json = serde_json::to_string_pretty(&config.hosts.values().collect::<Vec<_>>())?;
    println!("{json}");
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_discover(ctx: &AppContext, host_id: &str, apply: bool) -> Result<()> {
    let host = ctx.host(host_id)?;
    let result = discovery::discover(&ctx.executor, &host).await?;

    if apply {
        let mut config = ctx.config_store.current();
        if let Some(stored) = config.hosts.get_mut(host_id) {
            discovery::merge_into_host(stored, &result);
            ctx.config_store.save(&config)?;
        }
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[derive(Debug, Clone, Args)]
pub struct ImportSshArgs {
    #[arg(long, default_value = "~/.ssh/config")]
    pub path: PathBuf,
    #[arg(long, value_delimiter = ',')]
    pub hosts: Option<Vec<String>>,
}

pub async fn execute_import_ssh(args: ImportSshArgs) -> Result<()> {
    let path = shellexpand_home(&args.path);
    let candidates = harborctl_core::config::import_ssh_config(&path, args.hosts.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&candidates)?);
    Ok(())
}

fn shellexpand_home(path: &std::path::Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(stripped),
        None => path.to_path_buf(),
    }
}
