//! Container subcommands
//!
//! Implements `harborctl container list|inspect|start|stop|restart|rm|logs|pull`.

use crate::context::AppContext;
use anyhow::Result;
use harborctl_core::container::ContainerService;
use tracing::instrument;

#[instrument(skip(ctx))]
pub async fn execute_list(ctx: &AppContext, host_id: &str, label_filter: Option<&str>) -> Result<()> {
    let host = ctx.host(host_id)?;
    let containers = ContainerService::new(&host).list(label_filter).await?;
    println!("{}", serde_json::to_string_pretty(&containers)?);
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_inspect(ctx: &AppContext, host_id: &str, container: &str) -> Result<()> {
    let host = ctx.host(host_id)?;
    let info = ContainerService::new(&host).inspect(container).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_start(ctx: &AppContext, host_id: &str, container: &str) -> Result<()> {
    let host = ctx.host(host_id)?;
    ContainerService::new(&host).start(container).await?;
    println!("started {container}");
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_stop(ctx: &AppContext, host_id: &str, container: &str) -> Result<()> {
    let host = ctx.host(host_id)?;
    ContainerService::new(&host).stop(container).await?;
    println!("stopped {container}");
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_restart(ctx: &AppContext, host_id: &str, container: &str) -> Result<()> {
    let host = ctx.host(host_id)?;
    ContainerService::new(&host).restart(container).await?;
    println!("restarted {container}");
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_remove(ctx: &AppContext, host_id: &str, container: &str, force: bool) -> Result<()> {
    let host = ctx.host(host_id)?;
    ContainerService::new(&host).remove(container, force).await?;
    println!("removed {container}");
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_logs(
    ctx: &AppContext,
    host_id: &str,
    container: &str,
    lines: u32,
    since: Option<&str>,
) -> Result<()> {
    let host = ctx.host(host_id)?;
    let logs = ContainerService::new(&host).logs(container, lines, since).await?;
    print!("{logs}");
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_pull(ctx: &AppContext, host_id: &str, image: &str) -> Result<()> {
    let host = ctx.host(host_id)?;
    ContainerService::new(&host).pull(image).await?;
    println!("pulled {image}");
    Ok(())
}
