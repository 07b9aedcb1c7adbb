//! Command line surface.
//!
//! Parses argv into a [`Cli`] and dispatches into `crate::commands`. Every
//! subcommand takes a shared [`AppContext`] built from `--config`/`--state-dir`
//! (or their XDG-style defaults).

use crate::commands::cleanup::CleanupTierArg;
use crate::commands::migrate::MigrateRunArgs;
use crate::commands::{cleanup, container, host, migrate, ports, stack};
use crate::context::AppContext;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Remote multi-host Docker control plane")]
pub struct Cli {
    /// Path to the host inventory file. Defaults to a per-user config dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Directory for SSH control sockets and the audit log.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host inventory management.
    Host {
        #[command(subcommand)]
        command: HostCommand,
    },
    /// Published port inventory for a host.
    Ports { host_id: String },
    /// Container lifecycle operations.
    Container {
        #[command(subcommand)]
        command: ContainerCommand,
    },
    /// Compose stack operations.
    Stack {
        #[command(subcommand)]
        command: StackCommand,
    },
    /// Docker resource cleanup.
    Cleanup {
        #[command(subcommand)]
        command: CleanupCommand,
    },
    /// Move a stack from one host to another.
    Migrate(MigrateRunArgs),
    /// Run the MCP server on stdio.
    Serve,
}

#[derive(Subcommand, Debug)]
pub enum HostCommand {
    Add(host::HostAddArgs),
    Edit(host::HostEditArgs),
    Remove { host_id: String },
    List,
    Discover {
        host_id: String,
        /// Persist discovered capabilities back into the inventory.
        #[arg(long)]
        apply: bool,
    },
    ImportSsh(host::ImportSshArgs),
}

#[derive(Subcommand, Debug)]
pub enum ContainerCommand {
    List {
        host_id: String,
        #[arg(long)]
        label: Option<String>,
    },
    Inspect { host_id: String, container: String },
    Start { host_id: String, container: String },
    Stop { host_id: String, container: String },
    Restart { host_id: String, container: String },
    Rm {
        host_id: String,
        container: String,
        #[arg(long)]
        force: bool,
    },
    Logs {
        host_id: String,
        container: String,
        #[arg(long, default_value_t = 200)]
        lines: u32,
        #[arg(long)]
        since: Option<String>,
    },
    Pull { host_id: String, image: String },
}

#[derive(Subcommand, Debug)]
pub enum StackCommand {
    Deploy {
        host_id: String,
        stack_name: String,
        compose_file: PathBuf,
        #[arg(long)]
        pull: bool,
        #[arg(long)]
        recreate: bool,
    },
    Ps { host_id: String, stack_name: String },
    Down {
        host_id: String,
        stack_name: String,
        #[arg(long)]
        remove_volumes: bool,
    },
    Logs {
        host_id: String,
        stack_name: String,
        #[arg(long, default_value_t = 200)]
        lines: u32,
    },
}

#[derive(Subcommand, Debug)]
pub enum CleanupCommand {
    Run {
        host_id: String,
        #[arg(long, value_enum, default_value = "check")]
        tier: CleanupTierArg,
        #[arg(long)]
        dry_run: bool,
    },
    ScheduleList,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let config_path = self
            .config
            .unwrap_or_else(harborctl_core::config::default_config_path);
        let state_dir = self
            .state_dir
            .unwrap_or_else(harborctl_core::config::default_state_dir);
        let ctx = AppContext::open(config_path, state_dir)?;

        match self.command {
            Command::Host { command } => match command {
                HostCommand::Add(args) => host::execute_add(&ctx, args).await,
                HostCommand::Edit(args) => host::execute_edit(&ctx, args).await,
                HostCommand::Remove { host_id } => host::execute_remove(&ctx, &host_id).await,
                HostCommand::List => host::execute_list(&ctx).await,
                HostCommand::Discover { host_id, apply } => {
                    host::execute_discover(&ctx, &host_id, apply).await
                }
                HostCommand::ImportSsh(args) => host::execute_import_ssh(args).await,
            },
            Command::Ports { host_id } => ports::execute_list(&ctx, &host_id).await,
            Command::Container { command } => match command {
                ContainerCommand::List { host_id, label } => {
                    container::execute_list(&ctx, &host_id, label.as_deref()).await
                }
                ContainerCommand::Inspect { host_id, container } => {
                    container::execute_inspect(&ctx, &host_id, &container).await
                }
                ContainerCommand::Start { host_id, container } => {
                    container::execute_start(&ctx, &host_id, &container).await
                }
                ContainerCommand::Stop { host_id, container } => {
                    container::execute_stop(&ctx, &host_id, &container).await
                }
                ContainerCommand::Restart { host_id, container } => {
                    container::execute_restart(&ctx, &host_id, &container).await
                }
                ContainerCommand::Rm { host_id, container, force } => {
                    container::execute_remove(&ctx, &host_id, &container, force).await
                }
                ContainerCommand::Logs { host_id, container, lines, since } => {
                    container::execute_logs(&ctx, &host_id, &container, lines, since.as_deref()).await
                }
                ContainerCommand::Pull { host_id, image } => {
                    container::execute_pull(&ctx, &host_id, &image).await
                }
            },
            Command::Stack { command } => match command {
                StackCommand::Deploy { host_id, stack_name, compose_file, pull, recreate } => {
                    stack::execute_deploy(&ctx, &host_id, &stack_name, &compose_file, pull, recreate).await
                }
                StackCommand::Ps { host_id, stack_name } => {
                    stack::execute_ps(&ctx, &host_id, &stack_name).await
                }
                StackCommand::Down { host_id, stack_name, remove_volumes } => {
                    stack::execute_down(&ctx, &host_id, &stack_name, remove_volumes).await
                }
                StackCommand::Logs { host_id, stack_name, lines } => {
                    stack::execute_logs(&ctx, &host_id, &stack_name, lines).await
                }
            },
            Command::Cleanup { command } => match command {
                CleanupCommand::Run { host_id, tier, dry_run } => {
                    cleanup::execute_run(&ctx, &host_id, tier.into(), dry_run).await
                }
                CleanupCommand::ScheduleList => cleanup::execute_schedule_list(&ctx).await,
            },
            Command::Migrate(args) => migrate::execute_run(&ctx, args).await,
            Command::Serve => crate::mcp::serve(ctx).await,
        }
    }
}
