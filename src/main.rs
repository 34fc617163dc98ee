//! scuttle daemon: wire config, bus, provider chain, tools, and the
//! agent loop together, then run until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scuttle::agent::{AgentLoop, ContextBuilder, SubagentExecutor};
use scuttle::bus::MessageBus;
use scuttle::config::Config;
use scuttle::providers::fallback::FallbackChain;
use scuttle::tools::fs::{
    AppendFileTool, EditFileTool, FsToolConfig, ListDirTool, ReadFileTool, WriteFileTool,
};
use scuttle::tools::shell::ExecTool;
use scuttle::tools::spawn::SpawnTool;
use scuttle::tools::ToolRegistry;

#[derive(Parser, Debug)]
#[command(name = "scuttle", version, about = "Resource-minimal personal AI assistant")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;

    let workspace = PathBuf::from(&config.agent.workspace);
    tokio::fs::create_dir_all(&workspace)
        .await
        .with_context(|| format!("creating workspace {}", workspace.display()))?;

    let bus = Arc::new(MessageBus::new());
    let chain = Arc::new(FallbackChain::from_config(
        &config.fallback_chain,
        &config.model_map(),
    ));
    let context = Arc::new(ContextBuilder::new(&workspace));

    // Tools shared by parent and child agents.
    let fs_cfg = FsToolConfig {
        workspace: workspace.clone(),
        restrict_to_workspace: config.tools.restrict_to_workspace,
    };
    let exec_tool = Arc::new(ExecTool::with_config(
        &workspace,
        config.tools.restrict_to_workspace,
        &config.tools.exec,
    )?);

    // Child registry first: everything except the spawn tool, so
    // sub-agents cannot recurse.
    let mut child_registry = ToolRegistry::new();
    child_registry.register(Arc::new(ReadFileTool(fs_cfg.clone())));
    child_registry.register(Arc::new(WriteFileTool(fs_cfg.clone())));
    child_registry.register(Arc::new(EditFileTool(fs_cfg.clone())));
    child_registry.register(Arc::new(AppendFileTool(fs_cfg.clone())));
    child_registry.register(Arc::new(ListDirTool(fs_cfg.clone())));
    child_registry.register(exec_tool.clone());
    let child_registry = Arc::new(child_registry);

    let subagent = Arc::new(SubagentExecutor {
        chain: chain.clone(),
        registry: child_registry.clone(),
        context: context.clone(),
        max_iterations: config.agent.max_iterations,
        tool_timeout: Duration::from_secs(config.tools.exec.timeout_secs),
    });

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool(fs_cfg.clone())));
    registry.register(Arc::new(WriteFileTool(fs_cfg.clone())));
    registry.register(Arc::new(EditFileTool(fs_cfg.clone())));
    registry.register(Arc::new(AppendFileTool(fs_cfg.clone())));
    registry.register(Arc::new(ListDirTool(fs_cfg)));
    registry.register(exec_tool);
    registry.register(Arc::new(SpawnTool::new(subagent)));
    let registry = Arc::new(registry);

    info!(
        workspace = %workspace.display(),
        tools = ?registry.names(),
        chain = config.fallback_chain.len(),
        "scuttle starting"
    );

    let agent = Arc::new(AgentLoop::new(
        config,
        bus.clone(),
        chain,
        registry,
        context,
    ));

    // Expired-session janitor: once a day, drop sessions idle > 30 days.
    {
        let sessions = agent.sessions();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                match sessions
                    .cleanup_expired(Duration::from_secs(30 * 24 * 60 * 60))
                    .await
                {
                    Ok(0) => {}
                    Ok(n) => info!(removed = n, "expired sessions cleaned up"),
                    Err(e) => warn!(error = %e, "session cleanup failed"),
                }
            }
        });
    }

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(agent.run(cancel.clone()));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = loop_handle.await;

    Ok(())
}
