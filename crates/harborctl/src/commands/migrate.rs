//! Migration subcommand
//!
//! Implements `harborctl migrate run`, driving [`MigrationOrchestrator`] with
//! the shared executor and per-process lock registry.

use crate::context::AppContext;
use anyhow::Result;
use clap::Args;
use harborctl_core::migration::{MigrationOptions, MigrationOrchestrator};
use harborctl_core::transfer::TransferMethod;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Clone, Args)]
pub struct MigrateRunArgs {
    pub source_host_id: String,
    pub target_host_id: String,
    pub stack_name: String,
    #[arg(long)]
    pub skip_stop_source: bool,
    /// Leave the migrated stack stopped on the target instead of bringing it up.
    #[arg(long)]
    pub no_start_target: bool,
    #[arg(long)]
    pub remove_source: bool,
    #[arg(long)]
    pub delete_source_appdata: bool,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long, value_enum)]
    pub transfer_method: Option<TransferMethodArg>,
    #[arg(long, default_value_t = 60)]
    pub verification_window_secs: u64,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum TransferMethodArg {
    Rsync,
    Zfs,
}

impl From<TransferMethodArg> for TransferMethod {
    fn from(value: TransferMethodArg) -> Self {
        match value {
            TransferMethodArg::Rsync => TransferMethod::Rsync,
            TransferMethodArg::Zfs => TransferMethod::Zfs,
        }
    }
}

#[instrument(skip(ctx, args), fields(source = %args.source_host_id, target = %args.target_host_id, stack_name = %args.stack_name))]
pub async fn execute_run(ctx: &AppContext, args: MigrateRunArgs) -> Result<()> {
    let source = ctx.host(&args.source_host_id)?;
    let target = ctx.host(&args.target_host_id)?;

    let options = MigrationOptions {
        skip_stop_source: args.skip_stop_source,
        start_target: !args.no_start_target,
        remove_source: args.remove_source,
        delete_source_appdata: args.delete_source_appdata,
        dry_run: args.dry_run,
        transfer_method: args.transfer_method.map(Into::into),
        verification_window: Duration::from_secs(args.verification_window_secs),
    };

    let orchestrator = MigrationOrchestrator {
        executor: &ctx.executor,
        file_transfer: &ctx.executor,
        locks: &ctx.migration_locks,
    };

    let report = orchestrator
        .migrate(&source, &target, &args.stack_name, options)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
