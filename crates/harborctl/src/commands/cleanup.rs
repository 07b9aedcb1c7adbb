//! Cleanup subcommands
//!
//! Implements `harborctl cleanup run|schedule-list`.

use crate::context::AppContext;
use anyhow::Result;
use harborctl_core::cleanup;
use harborctl_core::config::CleanupTier;
use harborctl_core::docker_context::DockerContext;
use tracing::instrument;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CleanupTierArg {
    Check,
    Safe,
    Moderate,
    Aggressive,
}

impl From<CleanupTierArg> for CleanupTier {
    fn from(value: CleanupTierArg) -> Self {
        match value {
            CleanupTierArg::Check => CleanupTier::Check,
            CleanupTierArg::Safe => CleanupTier::Safe,
            CleanupTierArg::Moderate => CleanupTier::Moderate,
            CleanupTierArg::Aggressive => CleanupTier::Aggressive,
        }
    }
}

#[instrument(skip(ctx))]
pub async fn execute_run(ctx: &AppContext, host_id: &str, tier: CleanupTier, dry_run: bool) -> Result<()> {
    let host = ctx.host(host_id)?;
    let context = DockerContext::for_host(&host);
    let analysis = cleanup::run(&context, tier, dry_run).await?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

pub async fn execute_schedule_list(ctx: &AppContext) -> Result<()> {
    let config = ctx.config_store.current();
    let schedules = config.cleanup_schedules.values().collect::<Vec<_>>();
    println!("{}", serde_json::to_string_pretty(&schedules)?);
    Ok(())
}
