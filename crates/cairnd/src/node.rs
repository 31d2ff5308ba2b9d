//! Node assembly: binds the sockets and wires the monitor, receiver, and
//! sender tasks around the shared inventory.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use cairn_core::{Codec, ProtocolConfig};

use crate::ack::AckTable;
use crate::inventory::Inventory;
use crate::liveness::PeerAlive;
use crate::monitor::{monitor_loop, scan_directory};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// One synchronizer endpoint: a bound receive socket, a watched
/// directory, and the shared state the tasks communicate through.
pub struct Node {
    protocol: ProtocolConfig,
    codec: Codec,
    dir: PathBuf,
    socket: Arc<UdpSocket>,
    inventory: Arc<Inventory>,
    alive: PeerAlive,
}

impl Node {
    /// Validate the configuration and bind the receive socket. The watched
    /// directory is created if missing, since received files land there.
    pub async fn bind(protocol: ProtocolConfig, dir: PathBuf, listen: SocketAddr) -> Result<Self> {
        protocol.validate()?;

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create watched directory {}", dir.display()))?;

        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;

        let codec = Codec::new(protocol.max_packet_size, protocol.key.clone().into_bytes());
        let inventory = Arc::new(Inventory::new(AckTable::new(protocol.init_seq_number)));

        Ok(Node {
            protocol,
            codec,
            dir,
            socket: Arc::new(socket),
            inventory,
            alive: PeerAlive::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn inventory(&self) -> Arc<Inventory> {
        self.inventory.clone()
    }

    /// Spawn the three core tasks against a peer address.
    pub async fn start(self, peer: SocketAddr) -> Result<NodeHandle> {
        // Seed the local inventory before the first sender tick, so a
        // populated directory never announces itself as empty at boot.
        match scan_directory(&self.dir, self.codec.max_filename_len()) {
            Ok(records) => self.inventory.replace_local(records),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "initial scan failed");
            }
        }

        let bind_addr: SocketAddr = match peer {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let send_socket = UdpSocket::bind(bind_addr)
            .await
            .context("failed to bind send socket")?;
        send_socket
            .connect(peer)
            .await
            .with_context(|| format!("failed to set peer {peer}"))?;
        let send_socket = Arc::new(send_socket);

        let (shutdown, _) = broadcast::channel(1);

        let monitor = tokio::spawn(monitor_loop(
            self.dir.clone(),
            self.protocol.scan_interval_secs,
            self.codec.max_filename_len(),
            self.inventory.clone(),
            shutdown.subscribe(),
        ));

        let receiver = tokio::spawn(
            Receiver::new(
                self.socket.clone(),
                send_socket.clone(),
                self.codec.clone(),
                self.protocol.init_seq_number,
                self.dir.clone(),
                self.inventory.clone(),
                self.alive.clone(),
                shutdown.subscribe(),
            )
            .run(),
        );

        let sender = tokio::spawn(
            Sender::new(
                send_socket,
                self.codec,
                self.protocol,
                self.dir,
                self.inventory,
                self.alive,
                shutdown.subscribe(),
            )
            .run(),
        );

        Ok(NodeHandle {
            shutdown,
            monitor,
            receiver,
            sender,
        })
    }
}

/// Handles to a running node's tasks.
pub struct NodeHandle {
    shutdown: broadcast::Sender<()>,
    pub monitor: JoinHandle<Result<()>>,
    pub receiver: JoinHandle<Result<()>>,
    pub sender: JoinHandle<Result<()>>,
}

impl NodeHandle {
    /// Stop all tasks. Loops observe the broadcast at their next select
    /// point; anything parked on the liveness latch or mid-transfer is
    /// aborted outright.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in [self.monitor, self.receiver, self.sender] {
            task.abort();
            let _ = task.await;
        }
    }
}
