//! and-node: a standalone node that opens or joins worlds over WebSockets.
//!
//! Incoming join requests are accepted automatically and world activity is
//! logged.

use and_core::{LocalIdentity, PeerUrl};
use and_host::{Host, HostConfig, SimplePathResolver, World, WorldEvent, WsTransport};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "and-node")]
#[command(about = "Peer-to-peer world membership node")]
struct Args {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to a JSON config file
    #[arg(short, long, default_value = "and-node.json")]
    config: PathBuf,

    /// Open a world and serve it at this path
    #[arg(long)]
    open: Option<String>,

    /// Join the world at this and:// URL
    #[arg(long)]
    join: Option<String>,

    /// Join deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Derive a stable identity from this seed (random if not provided)
    #[arg(long)]
    seed: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Accept every request and log what happens in the world.
async fn run_world(mut world: World) {
    let id = world.session_id();
    while let Some(event) = world.next_event().await {
        match event {
            WorldEvent::PeerRequest(request) => {
                info!("[{}] join request from {}", id, request.identity().short());
                if let Err(e) = request.accept() {
                    warn!("[{}] failed to accept {}: {}", id, request.identity().short(), e);
                }
            }
            WorldEvent::PeerReady(peer) => {
                info!("[{}] peer ready: {}", id, peer.identity().short());
            }
            WorldEvent::ObjectAppend { peer, objects } => {
                for object in objects {
                    info!("[{}] {} announced {} at {}", id, peer.short(), object.id, object.address);
                }
            }
            WorldEvent::ObjectDelete { peer, object_ids } => {
                for object_id in object_ids {
                    info!("[{}] {} withdrew {}", id, peer.short(), object_id);
                }
            }
            WorldEvent::PeerLeave(peer) => {
                info!("[{}] peer left: {}", id, peer.identity().short());
            }
            WorldEvent::Terminate => {
                info!("[{}] world closed", id);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,and_host=debug,and_core=debug"
    } else {
        "info,and_host=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting and-node");

    let mut config = HostConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    info!("Listen address: {}", config.listen);

    let identity = match &args.seed {
        Some(seed) => LocalIdentity::from_seed(seed),
        None => LocalIdentity::generate(),
    };
    info!("Identity: {}", identity.hash());

    let transport = WsTransport::bind(&config.listen, identity).await?;
    let resolver = Arc::new(SimplePathResolver::new());
    let join_timeout = args.timeout_ms.map(Duration::from_millis);
    let host = Host::new(config, transport, resolver.clone());

    let mut serving = tokio::spawn({
        let host = host.clone();
        async move { host.serve().await }
    });

    if let Some(path) = &args.open {
        let world = host.open_world(path).await?;
        resolver.set_mapping(path, world.session_id());
        info!("World open at {}", host.local_url().with_path(path));
        tokio::spawn(run_world(world));
    }

    if let Some(url) = &args.join {
        let url: PeerUrl = url.parse().with_context(|| format!("Invalid URL: {url}"))?;
        let world = host.join_world(&url, join_timeout).await?;
        info!("Joined {} as {}", url, world.session_id());
        tokio::spawn(run_world(world));
    }

    info!("Node running at {}. Press Ctrl+C to stop.", host.local_url());

    tokio::select! {
        result = &mut serving => {
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    host.shutdown();
    serving.await??;
    info!("Shutting down");
    Ok(())
}
