//! meshd — mesh peer node with an interactive console.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use mesh_core::config::MeshConfig;
use mesh_services::{Node, TransferOutcome};

mod console;

use console::ConsoleCommand;

#[derive(Parser, Debug)]
#[command(name = "meshd", version, about = "Mesh peer node")]
struct Args {
    /// Rendezvous host (overrides rendezvous.host)
    #[arg(long)]
    rendezvous_host: Option<String>,

    /// Rendezvous port (overrides rendezvous.port)
    #[arg(long)]
    rendezvous_port: Option<u16>,

    /// Mesh listening port, 0 for any (overrides node.listen_port)
    #[arg(long, short)]
    port: Option<u16>,

    /// Host advertised to peers (overrides node.advertise_host)
    #[arg(long)]
    host: Option<String>,

    /// Discover peers but do not stay registered
    #[arg(long)]
    no_join: bool,

    /// Directory that holds the per-node workspace
    #[arg(long)]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    if let Err(e) = MeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = MeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshConfig::default()
    });
    apply_args(&mut config, args);

    let node = Node::start(config).await?;
    println!("node {} up, {} peer(s) connected", node.me(), node.connections().len());
    println!("{}", console::USAGE);

    tokio::spawn(print_deliveries(node.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };

        match console::parse(&line) {
            None => {}
            Some(ConsoleCommand::Exit) => break,
            Some(command) => run_command(&node, command).await,
        }
    }

    if node.config().node.join_bootstrap {
        if let Err(e) = node.leave().await {
            tracing::warn!(error = %e, "failed to deregister");
        }
    }
    node.shutdown();
    Ok(())
}

async fn run_command(node: &Arc<Node>, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Message(text) => {
            if let Err(e) = node.broadcast_message(&text).await {
                println!("broadcast failed: {e:#}");
            }
        }
        ConsoleCommand::File(path) => match node.broadcast_file(&path).await {
            Ok((file_id, reports)) => {
                println!("{file_id}: sent to {} peer(s)", reports.len());
                for report in reports {
                    let status = match report.result {
                        Ok(TransferOutcome::Delivered) => "delivered".to_string(),
                        Ok(TransferOutcome::Busy) => "busy".to_string(),
                        Ok(TransferOutcome::Ignored) => "already had it".to_string(),
                        Err(e) => format!("failed: {e}"),
                    };
                    println!("  {} {status}", report.peer);
                }
            }
            Err(e) => println!("file broadcast failed: {e:#}"),
        },
        ConsoleCommand::Peers => {
            let conns = node.connections().snapshot();
            println!("{} connection(s)", conns.len());
            for conn in conns {
                println!("  {} ({})", conn.peer(), conn.direction());
            }
        }
        ConsoleCommand::Help => println!("{}", console::USAGE),
        ConsoleCommand::Exit => {}
    }
}

/// Print every delivered message as `[originator] content`.
async fn print_deliveries(node: Arc<Node>) {
    let mut feed = node.inbox().subscribe();
    loop {
        match feed.recv().await {
            Ok(message) => println!("[{}] {}", message.originator, message.content),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "console fell behind, messages skipped")
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn apply_args(config: &mut MeshConfig, args: Args) {
    if let Some(host) = args.rendezvous_host {
        config.rendezvous.host = host;
    }
    if let Some(port) = args.rendezvous_port {
        config.rendezvous.port = port;
    }
    if let Some(port) = args.port {
        config.node.listen_port = port;
    }
    if let Some(host) = args.host {
        config.node.advertise_host = host;
    }
    if args.no_join {
        config.node.join_bootstrap = false;
    }
    if let Some(dir) = args.workspace {
        config.node.workspace_root = dir;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
