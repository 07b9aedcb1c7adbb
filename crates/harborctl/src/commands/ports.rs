//! Port inventory subcommand
//!
//! Implements `harborctl ports list <host_id>`.

use crate::context::AppContext;
use anyhow::Result;
use harborctl_core::container::ContainerService;
use harborctl_core::ports;
use tracing::instrument;

#[instrument(skip(ctx))]
pub async fn execute_list(ctx: &AppContext, host_id: &str) -> Result<()> {
    let host = ctx.host(host_id)?;
    let containers = ContainerService::new(&host).list(None).await?;
    let inventory = ports::build_inventory(&containers);
    println!("{}", serde_json::to_string_pretty(&inventory)?);
    Ok(())
}
