//! MCP tool surface.
//!
//! Three tools, each keyed by an `action` discriminator with a typed request
//! per action: `host_inventory` (inventory lifecycle + port auditing),
//! `container_ops` (container lifecycle), and `stack_ops` (compose stacks,
//! cross-host migration, and cleanup). Every action dispatches into the same
//! `harborctl_core` operation the CLI in `commands::*` calls, and every
//! response is wrapped in a `{success, data?, error?}` envelope built from
//! [`CoreError::kind`] so a client can branch on failure class without
//! string-sniffing a message. The core itself never sees this enum — it is
//! assembled and torn down entirely in this file.

use crate::context::AppContext;
use harborctl_core::config::{CleanupTier, Host};
use harborctl_core::container::ContainerService;
use harborctl_core::docker_context::DockerContext;
use harborctl_core::errors::CoreError;
use harborctl_core::migration::{MigrationOptions, MigrationOrchestrator};
use harborctl_core::transfer::TransferMethod;
use harborctl_core::{cleanup, discovery, ports, stack};
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Wraps a result in the `{success, data?, error?}` envelope every tool returns.
fn envelope<T: Serialize>(result: Result<T, CoreError>) -> CallToolResult {
    let body = match result {
        Ok(data) => serde_json::json!({ "success": true, "data": data }),
        Err(e) => serde_json::json!({
            "success": false,
            "error": e.to_string(),
            "kind": format!("{:?}", e.kind()),
        }),
    };
    let text = serde_json::to_string(&body).unwrap_or_else(|_| body.to_string());
    CallToolResult::success(vec![Content::text(text)])
}

fn default_ssh_user() -> String {
    "docker".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_log_lines() -> u32 {
    200
}

fn default_true() -> bool {
    true
}

fn default_verification_window() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTierParam {
    Check,
    Safe,
    Moderate,
    Aggressive,
}

impl From<CleanupTierParam> for CleanupTier {
    fn from(value: CleanupTierParam) -> Self {
        match value {
            CleanupTierParam::Check => CleanupTier::Check,
            CleanupTierParam::Safe => CleanupTier::Safe,
            CleanupTierParam::Moderate => CleanupTier::Moderate,
            CleanupTierParam::Aggressive => CleanupTier::Aggressive,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethodParam {
    Rsync,
    Zfs,
}

impl From<TransferMethodParam> for TransferMethod {
    fn from(value: TransferMethodParam) -> Self {
        match value {
            TransferMethodParam::Rsync => TransferMethod::Rsync,
            TransferMethodParam::Zfs => TransferMethod::Zfs,
        }
    }
}

/// `host_inventory` actions: everything that reads or mutates the host
/// inventory, plus the per-host port audit (it is a read derived entirely
/// from a host's running containers, not from stack or container state).
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HostInventoryRequest {
    List,
    Add {
        host_id: String,
        hostname: String,
        #[serde(default = "default_ssh_user")]
        ssh_user: String,
        #[serde(default = "default_ssh_port")]
        ssh_port: u16,
        #[serde(default)]
        description: String,
        #[serde(default)]
        tags: Vec<String>,
        /// Defaults to empty; `discover: true` fills it from the most populated
        /// candidate directory found by the capability probe.
        #[serde(default)]
        compose_path: PathBuf,
        #[serde(default)]
        appdata_path: PathBuf,
        #[serde(default)]
        discover: bool,
    },
    Edit {
        host_id: String,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        ssh_user: Option<String>,
        #[serde(default)]
        ssh_port: Option<u16>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        enabled: Option<bool>,
    },
    Remove {
        host_id: String,
    },
    Discover {
        host_id: String,
        #[serde(default)]
        apply: bool,
    },
    Ports {
        host_id: String,
    },
    ImportSsh {
        path: PathBuf,
        #[serde(default)]
        hosts: Option<Vec<String>>,
    },
}

/// `container_ops` actions: lifecycle operations against a single container
/// on a single host.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ContainerOpsRequest {
    List {
        host_id: String,
        #[serde(default)]
        label_filter: Option<String>,
    },
    Inspect {
        host_id: String,
        container: String,
    },
    Start {
        host_id: String,
        container: String,
    },
    Stop {
        host_id: String,
        container: String,
    },
    Restart {
        host_id: String,
        container: String,
    },
    Remove {
        host_id: String,
        container: String,
        #[serde(default)]
        force: bool,
    },
    Logs {
        host_id: String,
        container: String,
        #[serde(default = "default_log_lines")]
        lines: u32,
        #[serde(default)]
        since: Option<String>,
    },
    Pull {
        host_id: String,
        image: String,
    },
}

/// `stack_ops` actions: compose stack lifecycle, cross-host migration, and
/// cleanup. These three share a tool because each operates on a whole stack
/// (or the Docker resources backing one) rather than a single container.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StackOpsRequest {
    Deploy {
        host_id: String,
        stack_name: String,
        compose_text: String,
        #[serde(default)]
        pull: bool,
        #[serde(default)]
        recreate: bool,
    },
    Ps {
        host_id: String,
        stack_name: String,
    },
    Down {
        host_id: String,
        stack_name: String,
        #[serde(default)]
        remove_volumes: bool,
    },
    Logs {
        host_id: String,
        stack_name: String,
        #[serde(default = "default_log_lines")]
        lines: u32,
    },
    Migrate {
        source_host_id: String,
        target_host_id: String,
        stack_name: String,
        #[serde(default)]
        skip_stop_source: bool,
        #[serde(default = "default_true")]
        start_target: bool,
        #[serde(default)]
        remove_source: bool,
        #[serde(default)]
        delete_source_appdata: bool,
        #[serde(default)]
        dry_run: bool,
        #[serde(default)]
        transfer_method: Option<TransferMethodParam>,
        #[serde(default = "default_verification_window")]
        verification_window_secs: u64,
    },
    CleanupRun {
        host_id: String,
        tier: CleanupTierParam,
        #[serde(default)]
        dry_run: bool,
    },
    CleanupScheduleList,
}

#[derive(Clone)]
pub struct HarborServer {
    ctx: std::sync::Arc<AppContext>,
    tool_router: ToolRouter<HarborServer>,
}

#[tool_router]
impl HarborServer {
    fn new(ctx: AppContext) -> Self {
        Self {
            ctx: std::sync::Arc::new(ctx),
            tool_router: Self::tool_router(),
        }
    }

    async fn host_by_id(&self, host_id: &str) -> Result<Host, CoreError> {
        self.ctx
            .config_store
            .current()
            .hosts
            .get(host_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("unknown host_id '{host_id}'")))
    }

    #[tool(description = "Host inventory management and per-host port auditing.")]
    async fn host_inventory(
        &self,
        Parameters(req): Parameters<HostInventoryRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(envelope(self.handle_host_inventory(req).await))
    }

    async fn handle_host_inventory(&self, req: HostInventoryRequest) -> Result<serde_json::Value, CoreError> {
        match req {
            HostInventoryRequest::List => {
                let hosts: Vec<Host> = self.ctx.config_store.current().hosts.values().cloned().collect();
                Ok(serde_json::to_value(hosts).unwrap())
            }
            HostInventoryRequest::Add {
                host_id,
                hostname,
                ssh_user,
                ssh_port,
                description,
                tags,
                compose_path,
                appdata_path,
                discover,
            } => {
                let mut config = self.ctx.config_store.current();
                if config.hosts.contains_key(&host_id) {
                    return Err(CoreError::validation(format!("host '{host_id}' already exists")));
                }
                let mut host = Host {
                    host_id: host_id.clone(),
                    hostname,
                    ssh_user,
                    ssh_port,
                    identity_file: None,
                    description,
                    tags: tags.into_iter().collect::<BTreeSet<_>>(),
                    compose_path,
                    appdata_path,
                    zfs_capable: false,
                    zfs_dataset: None,
                    enabled: true,
                };
                host.validate().map_err(CoreError::from)?;

                if discover {
                    let result = discovery::discover(&self.ctx.executor, &host)
                        .await
                        .map_err(CoreError::from)?;
                    discovery::merge_into_host(&mut host, &result);
                }

                config.hosts.insert(host.host_id.clone(), host.clone());
                self.ctx.config_store.save(&config).map_err(CoreError::from)?;
                Ok(serde_json::to_value(host).unwrap())
            }
            HostInventoryRequest::Edit {
                host_id,
                hostname,
                ssh_user,
                ssh_port,
                description,
                enabled,
            } => {
                let mut config = self.ctx.config_store.current();
                let host = config
                    .hosts
                    .get_mut(&host_id)
                    .ok_or_else(|| CoreError::not_found(format!("unknown host_id '{host_id}'")))?;
                if let Some(v) = hostname {
                    host.hostname = v;
                }
                if let Some(v) = ssh_user {
                    host.ssh_user = v;
                }
                if let Some(v) = ssh_port {
                    host.ssh_port = v;
                }
                if let Some(v) = description {
                    host.description = v;
                }
                if let Some(v) = enabled {
                    host.enabled = v;
                }
                host.validate().map_err(CoreError::from)?;
                let updated = host.clone();
                self.ctx.config_store.save(&config).map_err(CoreError::from)?;
                Ok(serde_json::to_value(updated).unwrap())
            }
            HostInventoryRequest::Remove { host_id } => {
                let mut config = self.ctx.config_store.current();
                let host = config
                    .hosts
                    .shift_remove(&host_id)
                    .ok_or_else(|| CoreError::not_found(format!("unknown host_id '{host_id}'")))?;
                config.cleanup_schedules.retain(|_, schedule| schedule.host_id != host_id);
                self.ctx.config_store.save(&config).map_err(CoreError::from)?;
                let _ = DockerContext::for_host(&host).remove().await;
                Ok(serde_json::json!({ "removed": host_id }))
            }
            HostInventoryRequest::Discover { host_id, apply } => {
                let host = self.host_by_id(&host_id).await?;
                let discovered = discovery::discover(&self.ctx.executor, &host)
                    .await
                    .map_err(CoreError::from)?;
                if apply {
                    let mut config = self.ctx.config_store.current();
                    if let Some(stored) = config.hosts.get_mut(&host_id) {
                        discovery::merge_into_host(stored, &discovered);
                        self.ctx.config_store.save(&config).map_err(CoreError::from)?;
                    }
                }
                Ok(serde_json::to_value(discovered).unwrap())
            }
            HostInventoryRequest::Ports { host_id } => {
                let host = self.host_by_id(&host_id).await?;
                let containers = ContainerService::new(&host).list(None).await.map_err(CoreError::from)?;
                Ok(serde_json::to_value(ports::build_inventory(&containers)).unwrap())
            }
            HostInventoryRequest::ImportSsh { path, hosts } => {
                let candidates = harborctl_core::config::import_ssh_config(&path, hosts.as_deref())
                    .map_err(CoreError::from)?;
                Ok(serde_json::to_value(candidates).unwrap())
            }
        }
    }

    #[tool(description = "Container lifecycle operations on a single host.")]
    async fn container_ops(
        &self,
        Parameters(req): Parameters<ContainerOpsRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(envelope(self.handle_container_ops(req).await))
    }

    async fn handle_container_ops(&self, req: ContainerOpsRequest) -> Result<serde_json::Value, CoreError> {
        match req {
            ContainerOpsRequest::List { host_id, label_filter } => {
                let host = self.host_by_id(&host_id).await?;
                let containers = ContainerService::new(&host)
                    .list(label_filter.as_deref())
                    .await
                    .map_err(CoreError::from)?;
                Ok(serde_json::to_value(containers).unwrap())
            }
            ContainerOpsRequest::Inspect { host_id, container } => {
                let host = self.host_by_id(&host_id).await?;
                let info = ContainerService::new(&host).inspect(&container).await.map_err(CoreError::from)?;
                Ok(serde_json::to_value(info).unwrap())
            }
            ContainerOpsRequest::Start { host_id, container } => {
                let host = self.host_by_id(&host_id).await?;
                ContainerService::new(&host).start(&container).await.map_err(CoreError::from)?;
                Ok(serde_json::json!({ "started": container }))
            }
            ContainerOpsRequest::Stop { host_id, container } => {
                let host = self.host_by_id(&host_id).await?;
                ContainerService::new(&host).stop(&container).await.map_err(CoreError::from)?;
                Ok(serde_json::json!({ "stopped": container }))
            }
            ContainerOpsRequest::Restart { host_id, container } => {
                let host = self.host_by_id(&host_id).await?;
                ContainerService::new(&host).restart(&container).await.map_err(CoreError::from)?;
                Ok(serde_json::json!({ "restarted": container }))
            }
            ContainerOpsRequest::Remove { host_id, container, force } => {
                let host = self.host_by_id(&host_id).await?;
                ContainerService::new(&host)
                    .remove(&container, force)
                    .await
                    .map_err(CoreError::from)?;
                Ok(serde_json::json!({ "removed": container }))
            }
            ContainerOpsRequest::Logs { host_id, container, lines, since } => {
                let host = self.host_by_id(&host_id).await?;
                let logs = ContainerService::new(&host)
                    .logs(&container, lines, since.as_deref())
                    .await
                    .map_err(CoreError::from)?;
                Ok(serde_json::json!({ "logs": logs }))
            }
            ContainerOpsRequest::Pull { host_id, image } => {
                let host = self.host_by_id(&host_id).await?;
                ContainerService::new(&host).pull(&image).await.map_err(CoreError::from)?;
                Ok(serde_json::json!({ "pulled": image }))
            }
        }
    }

    #[tool(description = "Compose stack lifecycle, cross-host migration, and cleanup.")]
    async fn stack_ops(&self, Parameters(req): Parameters<StackOpsRequest>) -> Result<CallToolResult, McpError> {
        Ok(envelope(self.handle_stack_ops(req).await))
    }

    async fn handle_stack_ops(&self, req: StackOpsRequest) -> Result<serde_json::Value, CoreError> {
        match req {
            StackOpsRequest::Deploy { host_id, stack_name, compose_text, pull, recreate } => {
                let host = self.host_by_id(&host_id).await?;
                let context = DockerContext::for_host(&host);
                context.ensure().await.map_err(CoreError::from)?;
                stack::deploy(&self.ctx.executor, &context, &host, &stack_name, &compose_text, pull, recreate)
                    .await
                    .map_err(CoreError::from)?;
                Ok(serde_json::json!({ "deployed": stack_name }))
            }
            StackOpsRequest::Ps { host_id, stack_name } => {
                let host = self.host_by_id(&host_id).await?;
                let context = DockerContext::for_host(&host);
                let states = stack::ps(&context, &stack_name).await.map_err(CoreError::from)?;
                Ok(serde_json::to_value(states).unwrap())
            }
            StackOpsRequest::Down { host_id, stack_name, remove_volumes } => {
                let host = self.host_by_id(&host_id).await?;
                let context = DockerContext::for_host(&host);
                stack::down(&context, &stack_name, remove_volumes).await.map_err(CoreError::from)?;
                Ok(serde_json::json!({ "down": stack_name }))
            }
            StackOpsRequest::Logs { host_id, stack_name, lines } => {
                let host = self.host_by_id(&host_id).await?;
                let context = DockerContext::for_host(&host);
                let logs = stack::logs(&context, &stack_name, lines).await.map_err(CoreError::from)?;
                Ok(serde_json::json!({ "logs": logs }))
            }
            StackOpsRequest::Migrate {
                source_host_id,
                target_host_id,
                stack_name,
                skip_stop_source,
                start_target,
                remove_source,
                delete_source_appdata,
                dry_run,
                transfer_method,
                verification_window_secs,
            } => {
                let source = self.host_by_id(&source_host_id).await?;
                let target = self.host_by_id(&target_host_id).await?;
                let options = MigrationOptions {
                    skip_stop_source,
                    start_target,
                    remove_source,
                    delete_source_appdata,
                    dry_run,
                    transfer_method: transfer_method.map(Into::into),
                    verification_window: Duration::from_secs(verification_window_secs),
                };
                let orchestrator = MigrationOrchestrator {
                    executor: &self.ctx.executor,
                    file_transfer: &self.ctx.executor,
                    locks: &self.ctx.migration_locks,
                };
                let report = orchestrator
                    .migrate(&source, &target, &stack_name, options)
                    .await
                    .map_err(CoreError::from)?;
                Ok(serde_json::to_value(report).unwrap())
            }
            StackOpsRequest::CleanupRun { host_id, tier, dry_run } => {
                let host = self.host_by_id(&host_id).await?;
                let context = DockerContext::for_host(&host);
                let analysis = cleanup::run(&context, tier.into(), dry_run).await.map_err(CoreError::from)?;
                Ok(serde_json::to_value(analysis).unwrap())
            }
            StackOpsRequest::CleanupScheduleList => {
                let config = self.ctx.config_store.current();
                Ok(serde_json::to_value(config.cleanup_schedules.values().collect::<Vec<_>>()).unwrap())
            }
        }
    }
}

#[tool_handler]
impl ServerHandler for HarborServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Remote multi-host Docker control plane: inventory, container and stack \
                 lifecycle, port auditing, cleanup, and cross-host stack migration."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Block on stdio transport, serving `ctx` until the peer disconnects.
pub async fn serve(ctx: AppContext) -> anyhow::Result<()> {
    let server = HarborServer::new(ctx).serve(stdio()).await?;
    server.waiting().await?;
    Ok(())
}
