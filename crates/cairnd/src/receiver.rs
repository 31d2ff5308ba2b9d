//! Receiver loop: demultiplexes incoming datagrams by opcode.
//!
//! Metadata updates the remote inventory, data chunks feed per-file
//! assemblies and are acknowledged one by one, acks feed the sender's
//! bookkeeping. Every valid packet proves the peer alive. Malformed
//! datagrams are dropped silently; the peer retransmits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use cairn_core::{AckFrame, Codec, DataFrame, FileKey, MetaFrame, Packet};

use crate::inventory::Inventory;
use crate::liveness::PeerAlive;
use crate::monitor::now_ms;
use crate::transfer::{Assembly, AssemblyStatus, Chunk};

pub struct Receiver {
    socket: Arc<UdpSocket>,
    /// Acks travel over the send socket to the peer's listen port.
    ack_socket: Arc<UdpSocket>,
    codec: Codec,
    init_seq: u16,
    dir: PathBuf,
    inventory: Arc<Inventory>,
    alive: PeerAlive,
    shutdown: broadcast::Receiver<()>,
    assemblies: HashMap<FileKey, Assembly>,
    malformed: u64,
}

impl Receiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        ack_socket: Arc<UdpSocket>,
        codec: Codec,
        init_seq: u16,
        dir: PathBuf,
        inventory: Arc<Inventory>,
        alive: PeerAlive,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Receiver {
            socket,
            ack_socket,
            codec,
            init_seq,
            dir,
            inventory,
            alive,
            shutdown,
            assemblies: HashMap::new(),
            malformed: 0,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; self.codec.max_packet_size()];

        loop {
            let len = tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("receiver shutting down");
                    return Ok(());
                }

                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, _from)) => len,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                },
            };

            match self.codec.decode(&buf[..len]) {
                Ok(Packet::Meta(frame)) => self.handle_meta(frame).await,
                Ok(Packet::Data(frame)) => self.handle_data(frame).await,
                Ok(Packet::Ack(frame)) => self.handle_ack(frame).await,
                Err(e) => {
                    self.malformed += 1;
                    tracing::debug!(
                        error = %e,
                        dropped = self.malformed,
                        "malformed datagram dropped"
                    );
                }
            }
        }
    }

    async fn handle_meta(&mut self, frame: MetaFrame) {
        tracing::debug!(
            key = %frame.key,
            file = %frame.filename,
            has_next = frame.has_next,
            "remote metadata received"
        );
        self.inventory.ingest_remote(frame).await;
        self.alive.signal();
    }

    async fn handle_ack(&mut self, frame: AckFrame) {
        if frame.is_sentinel(self.init_seq) {
            tracing::info!("peer announced an empty directory");
            self.inventory.clear_remote().await;
        } else {
            self.inventory.acks().acknowledge(&frame.key, frame.seqnum);
            tracing::trace!(key = %frame.key, seqnum = frame.seqnum, "ack received");
        }
        self.alive.signal();
    }

    async fn handle_data(&mut self, frame: DataFrame) {
        let key = frame.key;
        let seq = self.inventory.acks().widen(frame.seqnum);

        if !self.assemblies.contains_key(&key) {
            if let Some(name) = self.inventory.received_filename(&key) {
                if self.dir.join(&name).exists() {
                    // Late retransmission of an already-completed file: the
                    // sender lost our ack, so answer again and move on.
                    self.send_ack(&key, frame.seqnum).await;
                    return;
                }
            }
            let Some(filename) = self.inventory.remote_filename(&key).await else {
                tracing::trace!(key = %key, "data for unknown file dropped");
                return;
            };
            match Assembly::create(&self.dir, &filename, self.inventory.acks().init_seq()) {
                Ok(assembly) => {
                    tracing::info!(key = %key, file = %filename, "incoming file transfer");
                    self.assemblies.insert(key, assembly);
                }
                Err(e) => {
                    tracing::warn!(key = %key, file = %filename, error = %e, "cannot open part file");
                    return;
                }
            }
        }

        let Some(assembly) = self.assemblies.get_mut(&key) else {
            return;
        };
        let chunk = Chunk {
            payload: frame.payload,
            has_next: frame.has_next,
        };

        match assembly.accept(seq, chunk) {
            Ok(AssemblyStatus::Complete) => {
                if let Some(assembly) = self.assemblies.remove(&key) {
                    self.inventory.pin_received(assembly.name(), key);
                    tracing::info!(key = %key, path = %assembly.path().display(), "file completed");
                }
                self.send_ack(&key, frame.seqnum).await;
            }
            Ok(AssemblyStatus::InProgress | AssemblyStatus::Duplicate) => {
                self.send_ack(&key, frame.seqnum).await;
            }
            Err(e) => {
                // One bad write ends this transfer; the file reappears in a
                // later send set if still missing.
                tracing::warn!(key = %key, error = %e, "chunk write failed, aborting assembly");
                if let Some(assembly) = self.assemblies.remove(&key) {
                    assembly.discard();
                }
            }
        }
    }

    async fn send_ack(&self, key: &FileKey, wire_seq: u16) {
        let frame = AckFrame {
            key: *key,
            seqnum: wire_seq,
            timestamp_ms: now_ms(),
        };
        let bytes = self.codec.encode_ack(&frame);
        if let Err(e) = self.ack_socket.send(&bytes).await {
            tracing::warn!(key = %key, seqnum = wire_seq, error = %e, "ack send failed");
        } else {
            tracing::trace!(key = %key, seqnum = wire_seq, "ack sent");
        }
    }
}
