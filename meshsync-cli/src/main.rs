//! meshsync node
//!
//! Runs one mesh node over TCP and exposes its shared state on a console and
//! an optional HTTP status endpoint.
//!
//! Usage:
//!   meshsync --id alice --listen 127.0.0.1:4100 --peer bob=127.0.0.1:4101
//!   meshsync --id bob --listen 127.0.0.1:4101 --peer alice=127.0.0.1:4100 --connect alice

use anyhow::{Context, Result};
use clap::Parser;
use meshsync_cli::{build_router, execute, parse_command, parse_peer, Command};
use meshsync_node::{
    MeshConfig, MeshNode, MeshNotification, TcpConfig, TcpTransport, DEFAULT_DEDUP_CAPACITY,
};
use meshsync_types::{Identity, IdentityCodec, NamespaceCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "meshsync")]
#[command(about = "Run a meshsync node over TCP")]
struct Args {
    /// Mesh identity to claim (random when omitted)
    #[arg(short, long)]
    id: Option<String>,

    /// Address to accept links on
    #[arg(short, long, default_value = "127.0.0.1:4100")]
    listen: SocketAddr,

    /// Known peer as NAME=ADDR (repeatable)
    #[arg(short, long = "peer", value_parser = parse_peer)]
    peers: Vec<(String, SocketAddr)>,

    /// Peer to connect to at startup (repeatable)
    #[arg(short, long = "connect")]
    connect: Vec<String>,

    /// HTTP API port for the status endpoint
    #[arg(long)]
    http_port: Option<u16>,

    /// Number of recent events remembered for duplicate suppression
    #[arg(long, default_value_t = DEFAULT_DEDUP_CAPACITY)]
    dedup_capacity: usize,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn log_notification(notification: &MeshNotification) {
    match notification {
        MeshNotification::LinkConnected { link } => {
            info!("linked to {} ({})", link.remote, link.role)
        }
        MeshNotification::LinkClosed { link } => info!("link to {} closed", link.remote),
        MeshNotification::LinkError { link, reason } => {
            warn!("link to {} failed: {reason}", link.remote)
        }
        MeshNotification::VarChanged { key, value, origin } => match origin {
            Some(origin) => info!("{key} = {value:?} (from {origin})"),
            None => info!("{key} = {value:?}"),
        },
        other => debug!("{other:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let codec = NamespaceCodec::default();
    let identity = match &args.id {
        Some(id) => Identity::new(id.as_str()).context("invalid --id")?,
        None => Identity::generate(),
    };

    let mut tcp = TcpConfig::default().with_peer(codec.encode(&identity), args.listen);
    for (name, addr) in &args.peers {
        let peer = Identity::new(name.as_str())
            .with_context(|| format!("invalid peer name {name:?}"))?;
        tcp = tcp.with_peer(codec.encode(&peer), *addr);
    }

    let config = MeshConfig {
        dedup_capacity: args.dedup_capacity,
        ..MeshConfig::default()
    };
    let node = MeshNode::new(Arc::new(TcpTransport::new(tcp)), config);
    node.subscribe(log_notification).await?;
    node.subscribe_events(|event| {
        info!(
            "event {} from {}: {}",
            event.event_type, event.sender, event.payload
        )
    })
    .await?;

    let identity = node
        .open(identity.as_str())
        .await
        .context("failed to open mesh identity")?;
    info!("meshsync node {identity} listening on {}", args.listen);

    for remote in &args.connect {
        match node.connect(remote).await {
            Ok(link) => info!("connected to {}", link.remote),
            Err(e) => warn!("connect to {remote} failed: {e}"),
        }
    }

    if let Some(http_port) = args.http_port {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", http_port))
            .await
            .with_context(|| format!("failed to bind HTTP port {http_port}"))?;
        let app = build_router(node.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("HTTP server failed: {e}");
            }
        });
        info!("HTTP status endpoint listening on port {http_port}");
    }

    println!("\n========================================");
    println!("  meshsync node running");
    println!("========================================");
    println!("  Identity: {identity}");
    println!("  Listen:   {}", args.listen);
    println!("  Type `help` for commands");
    println!("========================================\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => match execute(&node, command).await {
                        Ok(output) if output.is_empty() => {}
                        Ok(output) => println!("{output}"),
                        Err(e) => println!("error: {e}"),
                    },
                    Err(e) => println!("error: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    node.shutdown().await;
    info!("meshsync node stopped");
    Ok(())
}
