use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

use pathindex::{refresh_once, EngineConfig, IndexEngine, Leaf, PathNode, RefreshOutcome};

#[derive(Debug, Parser)]
#[command(name = "pathindex", about = "Index files under configured roots and look them up")]
struct Cli {
    /// TOML config file.
    #[arg(long, short, default_value = "pathindex.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one full refresh cycle and print its outcome.
    Refresh,
    /// Print every indexed file with this exact name.
    Find { name: String },
    /// Print the tree of one root.
    Root { name: String },
    /// Print every file whose parent folder has this name.
    Folder { name: String },
    /// Keep the index fresh until interrupted.
    Serve,
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            tracing::error!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> pathindex::Result<ExitCode> {
    let config = EngineConfig::load(&cli.config)?;
    match cli.command {
        Command::Serve => serve(cli.config),
        Command::Refresh => {
            let (_, outcome) = refresh_once(&config)?;
            println!("{outcome}");
            Ok(exit_code(&outcome))
        }
        Command::Find { name } => {
            let (index, outcome) = refresh_once(&config)?;
            if outcome.is_failure() {
                return Ok(exit_code(&outcome));
            }
            let leaves: Vec<Value> = index.find_by_filename(&name).iter().map(leaf_json).collect();
            print_json(&Value::Array(leaves));
            Ok(ExitCode::SUCCESS)
        }
        Command::Root { name } => {
            let (index, outcome) = refresh_once(&config)?;
            print_node(index.find_by_root(&name), &outcome)
        }
        Command::Folder { name } => {
            let (index, outcome) = refresh_once(&config)?;
            print_node(index.find_by_parent_folder(&name), &outcome)
        }
    }
}

fn serve(config: PathBuf) -> pathindex::Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let engine = IndexEngine::start_from_file(&config)?;
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {error}");
        }
        tracing::info!("shutting down");
        engine.shutdown().await;
        Ok(ExitCode::SUCCESS)
    })
}

fn print_node(node: Option<Arc<PathNode>>, outcome: &RefreshOutcome) -> pathindex::Result<ExitCode> {
    if outcome.is_failure() {
        return Ok(exit_code(outcome));
    }
    match node {
        Some(node) => {
            print_json(&node_json(&node));
            Ok(ExitCode::SUCCESS)
        }
        None => {
            print_json(&Value::Null);
            Ok(ExitCode::from(2))
        }
    }
}

fn exit_code(outcome: &RefreshOutcome) -> ExitCode {
    if let RefreshOutcome::Failed { reason } = outcome {
        tracing::error!("refresh failed: {reason}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Directories become objects, leaves their absolute path.
fn node_json(node: &PathNode) -> Value {
    match node {
        PathNode::Leaf(leaf) => Value::String(leaf.path.to_string_lossy().into_owned()),
        PathNode::Directory(children) => Value::Object(
            children
                .iter()
                .map(|(name, child)| (name.clone(), node_json(child)))
                .collect::<Map<_, _>>(),
        ),
    }
}

fn leaf_json(leaf: &Leaf) -> Value {
    json!({
        "path": leaf.path.to_string_lossy(),
        "classification": leaf.classification,
    })
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(error) => tracing::error!("failed to render output: {error}"),
    }
}
