//! cairnd entry point: argument parsing, config, and task supervision.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use cairn_core::CairnConfig;
use cairnd::Node;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug cairnd ...
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 3 {
        bail!("usage: cairnd <listen_port> <peer_addr:port> <watched_dir>");
    }

    let port: u16 = args[0]
        .parse()
        .with_context(|| format!("listen port '{}' is not a number", args[0]))?;
    let peer: SocketAddr = args[1]
        .as_str()
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve peer address '{}'", args[1]))?
        .next()
        .with_context(|| format!("peer address '{}' resolved to nothing", args[1]))?;
    let dir = PathBuf::from(&args[2]);

    let config = CairnConfig::load().context("failed to load configuration")?;

    let listen: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    let node = Node::bind(config.protocol, dir.clone(), listen).await?;
    tracing::info!(
        listen = %node.local_addr()?,
        peer = %peer,
        dir = %dir.display(),
        "cairnd starting"
    );

    let mut handle = node.start(peer).await?;

    // The tasks run forever; this select catches panics and ctrl-c.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("ctrl-c received, shutting down"),
        r = &mut handle.monitor => tracing::error!("monitor task exited: {r:?}"),
        r = &mut handle.receiver => tracing::error!("receiver task exited: {r:?}"),
        r = &mut handle.sender => tracing::error!("sender task exited: {r:?}"),
    }

    handle.shutdown().await;
    Ok(())
}
