use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weaver_agent::graph::{GraphSpec, SessionState};
use weaver_agent::SecurityGuard;
use weaver_core::config::EngineConfig;

#[derive(Parser)]
#[command(name = "weaver", version, about = "Graph execution engine for AI-agent workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weaver.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph definition (JSON or TOML) for structural errors
    Validate {
        /// Graph file
        graph: PathBuf,
        /// Comma-separated names of the tools available at run time
        #[arg(long, value_delimiter = ',')]
        tools: Option<Vec<String>>,
    },
    /// Show where a saved session paused and what memory it carries
    InspectSession {
        /// Session state file written when a run paused
        state: PathBuf,
    },
    /// Show the effective configuration
    Config,
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(EngineConfig::default());
    }
    let config = EngineConfig::load(path)?;
    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Every problem that would stop `graph` from running.
fn graph_errors(graph: &GraphSpec, config: &EngineConfig, tools: Option<&[String]>) -> Vec<String> {
    let mut errors = graph.validate();

    for node in &graph.nodes {
        if let Err(e) = node.node_kind() {
            errors.push(format!("Node '{}': {}", node.id, e));
        }
        if let Some(available) = tools {
            for tool in node.tools.iter().filter(|t| !available.contains(t)) {
                errors.push(format!("Node '{}' declares unregistered tool '{}'", node.id, tool));
            }
        }
    }

    let guard = SecurityGuard::new(config.security.clone());
    errors.extend(guard.validate_tool_names(
        graph
            .nodes
            .iter()
            .flat_map(|n| n.tools.iter().map(move |t| (n.id.as_str(), t.as_str()))),
    ));
    errors
}

fn cmd_validate(config: &EngineConfig, path: &Path, tools: Option<&[String]>) -> anyhow::Result<()> {
    let graph = GraphSpec::load(path)?;
    let errors = graph_errors(&graph, config, tools);

    if errors.is_empty() {
        println!(
            "Graph '{}' is valid: {} nodes, {} edges, entry '{}'",
            graph.id,
            graph.nodes.len(),
            graph.edges.len(),
            graph.entry_node
        );
        return Ok(());
    }

    for error in &errors {
        println!("  - {}", error);
    }
    anyhow::bail!("graph '{}' has {} error(s)", graph.id, errors.len())
}

fn cmd_inspect_session(path: &Path) -> anyhow::Result<()> {
    let state = SessionState::load(path)?;
    println!("Paused at:   {}", state.paused_at.as_deref().unwrap_or("-"));
    println!("Resume from: {}", state.resume_from.as_deref().unwrap_or("-"));

    let mut keys: Vec<&String> = state.memory.keys().collect();
    keys.sort();
    println!("Memory ({} keys):", keys.len());
    for key in keys {
        let preview = state.memory[key].to_string();
        let preview: String = preview.chars().take(80).collect();
        println!("  {} = {}", key, preview);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weaver=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { graph, tools } => cmd_validate(&config, &graph, tools.as_deref()),
        Commands::InspectSession { state } => cmd_inspect_session(&state),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
