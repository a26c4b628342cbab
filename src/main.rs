use std::sync::Arc;

use actix_web::web;
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use oj_runner::config::CliArgs;
use oj_runner::executor::{Executor, ExecutorSettings};
use oj_runner::language::LanguageRegistry;
use oj_runner::sandbox::create_sandbox_runner;
use oj_runner::web_server::build_server;
use oj_runner::workspace::WorkspaceManager;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    let registry = Arc::new(
        LanguageRegistry::from_configs(&config.languages).context("Invalid language table")?,
    );
    log::info!("Loaded {} languages", registry.len());

    let workspace_root = match &config.execution.workspace_root {
        Some(root) => root.clone(),
        None => WorkspaceManager::default_root()?,
    };
    let workspaces = WorkspaceManager::new(&workspace_root)
        .with_context(|| format!("Failed to set up workspace root {}", workspace_root.display()))?;
    workspaces.sweep_stale(config.execution.stale_workspace_age.as_duration());
    log::info!("Workspaces live under {}", workspace_root.display());

    let shutdown_token = CancellationToken::new();
    let runner = create_sandbox_runner(
        config.execution.runner,
        &config.docker,
        config.execution.max_diagnostics_size.as_usize(),
        shutdown_token.clone(),
    )?;

    // An unavailable engine is not fatal: executions report it until it recovers
    if let Err(e) = runner.health_check().await {
        log::warn!("Sandbox runner {} is not ready: {e}", runner.name());
    } else if !cli.skip_pull {
        if let Err(e) = runner.prepare(&registry.list()).await {
            log::warn!("Image preparation incomplete: {e}");
        }
    }

    let executor = web::Data::new(Executor::new(
        registry,
        workspaces,
        runner,
        ExecutorSettings::from_config(&config),
    ));

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(&config.server, executor).context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Let in-flight executions finish and stop accepting new ones
    server_handle.stop(true).await;

    // 2. Abort whatever sandbox is still running
    shutdown_token.cancel();

    log::info!("Shutdown complete");
    Ok(())
}
