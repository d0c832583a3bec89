// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Thin CLI entry point: load config, build an `Orchestrator`, then either
//! run one headless turn against stdin or start the optional WebSocket
//! control server. The interactive terminal renderer is a View collaborator
//! out of scope for this binary (spec.md §1) — this binary's only job is to
//! exist, compile, and wire the collaborators together.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use north_core::{Orchestrator, Session, ShellService};
use north_tools::{
    DeleteFileTool, EditFileTool, GlobFileSearchTool, GrepTool, ListDirTool, ReadFileTool,
    RunTerminalCommandTool, ToolRegistry, WriteTool,
};

/// North: a single-session conversation orchestrator driving an LLM against
/// a local repo.
#[derive(Parser, Debug)]
#[command(name = "north", version)]
struct Cli {
    /// Explicit config file, overriding the usual system/XDG/workspace search.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory the orchestrator's tools operate against.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
    /// Start the optional JSON-over-WebSocket control server instead of
    /// reading one message from stdin.
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = north_config::load(cli.config.as_deref()).context("loading configuration")?;

    if cli.serve {
        if !config.web.enabled {
            anyhow::bail!("--serve given but config.web.enabled is false");
        }
        let config = Arc::new(config);
        let token = north_web::serve(config).await?;
        println!("control socket auth token: {token}");
        return Ok(());
    }

    run_headless(&config, &cli.repo_root).await
}

/// Read one user message from stdin, drive a single orchestrator turn, and
/// print the resulting transcript tail. Any review gate the turn suspends at
/// is reported and left unresolved — headless mode has no View to resolve it.
async fn run_headless(config: &north_config::Config, repo_root: &std::path::Path) -> Result<()> {
    let mut message = String::new();
    std::io::stdin().read_to_string(&mut message).context("reading message from stdin")?;

    let provider: Arc<dyn north_model::ModelProvider> =
        Arc::from(north_model::from_config(&config.model)?);
    let default_window =
        north_model::catalog::context_window(&config.model.provider, &config.model.name, 128_000);
    let context_limit = provider.catalog_context_window().unwrap_or(default_window) as usize;

    let shell: Arc<dyn north_tools::ShellDispatcher> = Arc::new(ShellService::new());
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(DeleteFileTool);
    registry.register(GlobFileSearchTool);
    registry.register(GrepTool);
    registry.register(ListDirTool);
    registry.register(RunTerminalCommandTool::new(shell.clone(), repo_root.to_string_lossy().to_string()));

    let session = Session::new(config.model.name.clone(), context_limit);
    let mut orchestrator = Orchestrator::new(
        session,
        Arc::new(registry),
        provider,
        shell,
        &config.tools,
        config.agent.clone(),
        repo_root,
        config.agent.default_mode,
    );

    orchestrator.send_message(message.trim().to_string()).await?;

    if let Some(entry_id) = orchestrator.handle().pending_review_id().await {
        println!("turn suspended at review gate {entry_id}; headless mode cannot resolve it");
        return Ok(());
    }

    for entry in &orchestrator.session.transcript {
        if let north_core::Entry::Assistant { text, .. } = entry {
            println!("{text}");
        }
    }
    Ok(())
}
