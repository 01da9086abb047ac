//! pstream - panel request aggregation driver
//!
//! Validates panel configurations and runs page sessions against a batch endpoint.

use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use tokio::sync::mpsc;
use tracing::info;

use panelstream::cli::{Cli, Command};
use panelstream::config::Config;
use panelstream::domain::Payload;
use panelstream::graph::PanelDependencyGraph;
use panelstream::session::{PageSession, PanelUpdate};
use panelstream::transport::HttpTransport;

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre!("Failed to install subscriber: {}", e))?;

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Check => cmd_check(&config),
        Command::Run { root_url, tag } => cmd_run(config, root_url, tag).await,
    }
}

fn cmd_check(config: &Config) -> Result<()> {
    config.validate()?;
    let graph = PanelDependencyGraph::from_config(&config.panels)?;

    println!("{} {} panels", "✓".green(), graph.len());
    for id in graph.activation_order() {
        let Some(node) = graph.node(id) else {
            continue;
        };
        let blockers: Vec<String> = node
            .blocking_on
            .iter()
            .filter_map(|b| graph.node(*b).map(|n| n.name.clone()))
            .collect();
        if blockers.is_empty() {
            println!("  {} {}", id.to_string().dimmed(), node.name.cyan());
        } else {
            println!(
                "  {} {} {} {}",
                id.to_string().dimmed(),
                node.name.cyan(),
                "after".dimmed(),
                blockers.join(", ")
            );
        }
    }
    Ok(())
}

async fn cmd_run(mut config: Config, root_url: Option<String>, tag: Option<String>) -> Result<()> {
    if let Some(root_url) = root_url {
        config.streaming.root_url = Some(root_url);
    }
    if let Some(tag) = tag {
        config.streaming.tag = Some(serde_json::from_str(&tag).context("Invalid --tag JSON")?);
    }
    config.validate()?;

    let transport = HttpTransport::new(config.streaming.request_timeout())?;
    let (session, coordinator) = PageSession::launch(&config, Arc::new(transport))?;
    let registry = session.registry().clone();
    let names: Vec<String> = config.panels.iter().map(|p| p.name.clone()).collect();
    let name_of = |idx: u32| names.get(idx as usize).cloned().unwrap_or_else(|| idx.to_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = tokio::spawn(session.run(tx));

    while let Some(update) = rx.recv().await {
        match update {
            PanelUpdate::Activated { panel, group } => {
                println!("{} {} in {}", "→".blue(), name_of(panel.value()).cyan(), group);
            }
            PanelUpdate::Data { key, payload } => {
                println!("{} {} {}", "•".green(), name_of(key.panel.value()).cyan(), describe(&payload));
            }
            PanelUpdate::Failed { key, error } => {
                println!("{} {} {}", "✗".red(), name_of(key.panel.value()).cyan(), error.red());
            }
            PanelUpdate::Finished { panel } => {
                println!("{} {} finished", "✓".green(), name_of(panel.value()).cyan());
            }
        }
    }

    let summary = run.await.context("Session task failed")??;
    registry.shutdown().await?;
    coordinator.await.context("Coordinator task failed")?;

    println!(
        "{} panels finished, {} failed",
        summary.finished.to_string().green(),
        summary.failed.to_string().red()
    );
    Ok(())
}

fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Json(value) => {
            let text = value.to_string();
            if text.len() > 80 {
                format!("{}...", text.chars().take(80).collect::<String>())
            } else {
                text
            }
        }
        Payload::Text(text) => format!("{} chars of text", text.chars().count()),
        Payload::Bytes(bytes) => format!("{} bytes", bytes.len()),
    }
}
