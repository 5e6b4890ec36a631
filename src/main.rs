//! Polycode CLI
//!
//! Runs one collaborating peer against a workspace directory.
//!
//! ## Usage
//!
//! ```bash
//! # First peer on the default topic
//! polycode serve --workspace ./project --name ada
//!
//! # Second peer, joining through the first one's endpoint id
//! polycode serve --workspace ./other --bootstrap <endpoint id>
//!
//! # Print the 32-byte discovery topic
//! polycode topic --topic polycode
//! ```
//!
//! While serving, commands are read from stdin; type `help` for the list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use polycode_core::edit::resolve_document_path;
use polycode_core::logging::JsonlLayer;
use polycode_core::{
    topic_hex, ClientId, CollabNode, EditOperation, EditSource, FsDocuments,
    NodeBuilder, NodeConfig, NodeEvent, Position, Range, DEFAULT_TOPIC_NAME,
};
use tokio::io::AsyncBufReadExt;
use tracing::info;
use tracing_subscriber::prelude::*;

/// Polycode - serverless collaborative editing
#[derive(Parser)]
#[command(name = "polycode")]
#[command(version = "0.1.0")]
#[command(about = "Polycode - serverless collaborative editing")]
#[command(
    long_about = "Peers discover each other on a shared topic, flood edits across a direct overlay, and resync from git after a peer saves."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a peer and read commands from stdin
    Serve(ServeArgs),

    /// Print the discovery topic for a name as hex
    Topic {
        /// Topic name
        #[arg(short, long, default_value = DEFAULT_TOPIC_NAME)]
        topic: String,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace directory (default: current directory)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Topic name
    #[arg(short, long)]
    topic: Option<String>,

    /// Display name announced to peers
    #[arg(short, long)]
    name: Option<String>,

    /// Endpoint id to join through (repeatable)
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Hop budget for envelopes this peer originates
    #[arg(long)]
    ttl: Option<u8>,

    /// Write a JSONL session log into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl ServeArgs {
    /// Config file (or defaults) with command-line overrides applied
    fn resolve_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(workspace) = &self.workspace {
            config.workspace = workspace.clone();
        }
        if let Some(topic) = &self.topic {
            config.topic = topic.clone();
        }
        if let Some(name) = &self.name {
            config.display_name = Some(name.clone());
        }
        if let Some(ttl) = self.ttl {
            config.ttl = ttl;
        }
        config.bootstrap.extend(self.bootstrap.iter().cloned());
        config.workspace = std::fs::canonicalize(&config.workspace).with_context(|| {
            format!("Workspace {} is not accessible", config.workspace.display())
        })?;
        config.validate()?;
        Ok(config)
    }
}

fn setup_logging(verbosity: u8, log_dir: Option<&Path>, instance: &str) -> Result<Option<PathBuf>> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let jsonl = log_dir
        .map(|dir| JsonlLayer::new(dir, instance))
        .transpose()
        .context("Failed to open session log")?;
    let log_path = jsonl.as_ref().map(|layer| layer.log_path().to_path_buf());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(jsonl)
        .init();
    Ok(log_path)
}

const HELP: &str = "\
Commands:
  status [json]                          Connection and sync state
  peers                                  Connected peers
  ping [message]                         Ping every peer
  identify                               Ask peers to reveal themselves
  name <display name>                    Change and announce display name
  save <commit message>                  Commit, push and notify peers
  resync                                 Pull now and ask peers to pull
  insert <path> <line> <char> <text>     Type text into a document
  delete <path> <line> <char> <len>      Delete characters from a document
  cat <path>                             Print a document
  test                                   Send the legacy test line
  quit                                   Stop the peer";

fn parse_u32(value: Option<&str>, what: &str) -> Result<u32> {
    let value = value.ok_or_else(|| anyhow!("missing {}", what))?;
    value
        .parse()
        .map_err(|e| anyhow!("invalid {} '{}': {}", what, value, e))
}

/// Resolve a console path against the workspace
fn document_path(node: &CollabNode, path: Option<&str>) -> Result<PathBuf> {
    let path = path.ok_or_else(|| anyhow!("missing path"))?;
    Ok(resolve_document_path(node.store().root(), Path::new(path))?)
}

/// Run one console line; returns `false` on quit
async fn run_command(node: &CollabNode, line: &str) -> Result<bool> {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "" => {}
        "help" | "?" => println!("{}", HELP),
        "quit" | "exit" => return Ok(false),
        "status" => {
            let status = node.get_status();
            if rest == "json" {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status);
            }
        }
        "peers" => {
            let peers = node.list_peers();
            if peers.is_empty() {
                println!("No peers connected.");
            }
            for peer in peers {
                println!(
                    "  #{} {} ({}) via {}",
                    peer.index, peer.client_id, peer.display_name, peer.remote_prefix
                );
            }
        }
        "ping" => {
            let message = if rest.is_empty() { "ping" } else { rest };
            println!("Ping sent to {} connection(s)", node.ping_peers(message));
        }
        "identify" => {
            println!("Identify sent to {} connection(s)", node.identify_peers());
        }
        "name" => {
            if rest.is_empty() {
                bail!("usage: name <display name>");
            }
            node.set_display_name(rest);
            println!("Display name set to {}", rest);
        }
        "save" => {
            if rest.is_empty() {
                bail!("usage: save <commit message>");
            }
            if node.broadcast_save(rest).await? {
                println!("Saved and announced.");
            } else {
                println!("Save failed; nothing was announced.");
            }
        }
        "resync" => {
            let report = node.request_resync().await?;
            if report.success() {
                println!("Resync finished.");
            } else {
                println!("Resync failed at: {}", report.failed_steps().join(", "));
            }
        }
        "insert" => {
            let mut parts = rest.splitn(4, ' ');
            let path = document_path(node, parts.next())?;
            let line = parse_u32(parts.next(), "line")?;
            let character = parse_u32(parts.next(), "character")?;
            let text = parts.next().ok_or_else(|| anyhow!("missing text"))?;
            node.store().create(&path)?;
            node.store().apply(
                &path,
                &EditOperation::insert(Position::new(line, character), text),
                EditSource::Local,
            )?;
        }
        "delete" => {
            let mut parts = rest.split_whitespace();
            let path = document_path(node, parts.next())?;
            let line = parse_u32(parts.next(), "line")?;
            let character = parse_u32(parts.next(), "character")?;
            let length = parse_u32(parts.next(), "length")?;
            node.store().apply(
                &path,
                &EditOperation::delete(Range::on_line(line, character, length), length),
                EditSource::Local,
            )?;
        }
        "cat" => {
            let path = document_path(node, Some(rest).filter(|r| !r.is_empty()))?;
            print!("{}", node.store().read(&path)?);
            println!();
        }
        "test" => {
            println!("Test line sent to {} connection(s)", node.send_test_message());
        }
        other => bail!("unknown command '{}' (try 'help')", other),
    }
    Ok(true)
}

async fn serve(args: ServeArgs, verbosity: u8) -> Result<()> {
    let config = args.resolve_config()?;
    let client_id = ClientId::new();
    let log_path = setup_logging(verbosity, args.log_dir.as_deref(), client_id.as_str())?;

    println!("Starting Polycode...");
    println!();

    let store = Arc::new(FsDocuments::new(&config.workspace));
    let topic = config.topic.clone();
    let node = NodeBuilder::new(config, store)
        .client_id(client_id)
        .start()
        .await?;

    info!(client = %node.client_id(), endpoint = %node.peer_id(), "Serving");
    println!("Node:");
    println!("  Client: {}", node.client_id());
    println!("  Endpoint: {}", node.peer_id());
    println!("  Topic: {} ({})", topic, topic_hex(&topic));
    println!("  Workspace: {}", node.store().root().display());
    if let Some(path) = log_path {
        println!("  Log: {}", path.display());
    }
    println!();
    println!("Others can join with: polycode serve --bootstrap {}", node.peer_id());
    println!("Type 'help' for commands.");
    println!();

    let mut events = node.subscribe_events();
    let printer = tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match events.recv().await {
                Ok(NodeEvent::Notification { level, message }) => {
                    println!("[{}] {}", level, message);
                }
                Ok(NodeEvent::PeerConnected { index, .. }) => {
                    println!("[peer] #{} connected", index);
                }
                Ok(NodeEvent::PeerDisconnected { index, .. }) => {
                    println!("[peer] #{} disconnected", index);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_command(&node, &line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("error: {:#}", e),
                }
            }
        }
    }

    println!("Shutting down...");
    info!("Console closed, stopping node");
    printer.abort();
    node.stop().await;
    println!("Goodbye.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args, cli.verbose).await?,
        Commands::Topic { topic } => {
            println!("{}", topic_hex(&topic));
        }
    }

    Ok(())
}
