//! Stack subcommands
//!
//! Implements `harborctl stack deploy|ps|down|logs`.

use crate::context::AppContext;
use anyhow::Result;
use harborctl_core::docker_context::DockerContext;
use harborctl_core::stack;
use tracing::instrument;

#[instrument(skip(ctx))]
pub async fn execute_deploy(
    ctx: &AppContext,
    host_id: &str,
    stack_name: &str,
    compose_file: &std::path::Path,
    pull: bool,
    recreate: bool,
) -> Result<()> {
    let host = ctx.host(host_id)?;
    let compose_text = std::fs::read_to_string(compose_file)?;
    let context = DockerContext::for_host(&host);
    context.ensure().await?;
    stack::deploy(&ctx.executor, &context, &host, stack_name, &compose_text, pull, recreate).await?;
    println!("deployed stack '{stack_name}' on '{host_id}'");
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_ps(ctx: &AppContext, host_id: &str, stack_name: &str) -> Result<()> {
    let host = ctx.host(host_id)?;
    let context = DockerContext::for_host(&host);
    let states = stack::ps(&context, stack_name).await?;
    println!("{}", serde_json::to_string_pretty(&states)?);
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_down(ctx: &AppContext, host_id: &str, stack_name: &str, remove_volumes: bool) -> Result<()> {
    let host = ctx.host(host_id)?;
    let context = DockerContext::for_host(&host);
    stack::down(&context, stack_name, remove_volumes).await?;
    println!("stack '{stack_name}' on '{host_id}' down");
    Ok(())
}

#[instrument(skip(ctx))]
pub async fn execute_logs(ctx: &AppContext, host_id: &str, stack_name: &str, lines: u32) -> Result<()> {
    let host = ctx.host(host_id)?;
    let context = DockerContext::for_host(&host);
    let logs = stack::logs(&context, stack_name, lines).await?;
    print!("{logs}");
    Ok(())
}
