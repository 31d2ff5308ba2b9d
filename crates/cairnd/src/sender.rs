//! Sender loop: the periodic two-phase drive.
//!
//! Each tick announces the local inventory (metadata phase) and then
//! streams every file the peer is missing (data phase). Chunk streams are
//! gated by the ack table: new chunks originate while the in-flight
//! window has room, and an ack-less round retransmits the earliest
//! unacknowledged chunk from the cache. Three ack-less rounds in a row
//! latch the peer dead and park the sender until it is heard again.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use cairn_core::{AckFrame, Codec, DataFrame, ProtocolConfig};

use crate::inventory::{Inventory, MetaRecord};
use crate::liveness::PeerAlive;
use crate::monitor::now_ms;
use crate::transfer::ChunkReader;

/// Delay before each metadata packet, letting the peer absorb the batch.
const META_GAP: Duration = Duration::from_millis(100);
/// Longer delay before the terminator, so the whole batch settles before
/// data transfer begins.
const META_TERMINATOR_GAP: Duration = Duration::from_millis(300);

pub struct Sender {
    socket: Arc<UdpSocket>,
    codec: Codec,
    protocol: ProtocolConfig,
    dir: PathBuf,
    inventory: Arc<Inventory>,
    alive: PeerAlive,
    shutdown: broadcast::Receiver<()>,
}

impl Sender {
    pub fn new(
        socket: Arc<UdpSocket>,
        codec: Codec,
        protocol: ProtocolConfig,
        dir: PathBuf,
        inventory: Arc<Inventory>,
        alive: PeerAlive,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Sender {
            socket,
            codec,
            protocol,
            dir,
            inventory,
            alive,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.protocol.send_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("sender shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    if let Err(e) = self.metadata_phase().await {
                        tracing::warn!(error = %e, "metadata phase failed");
                    }
                    self.data_phase().await;
                }
            }
        }
    }

    /// Announce the local inventory. An empty directory is announced with
    /// the sentinel ACK so the peer clears its remote view.
    async fn metadata_phase(&self) -> Result<()> {
        let list = self.inventory.send_metadata_list();

        if list.is_empty() {
            let frame = AckFrame::sentinel(self.protocol.init_seq_number, now_ms());
            self.socket
                .send(&self.codec.encode_ack(&frame))
                .await
                .context("sentinel send failed")?;
            tracing::info!("empty-folder signal sent");
            return Ok(());
        }

        let last = list.len() - 1;
        for (i, frame) in list.iter().enumerate() {
            if !self.alive.is_alive() {
                self.alive.wait_alive().await;
            }
            let gap = if i == last { META_TERMINATOR_GAP } else { META_GAP };
            tokio::time::sleep(gap).await;

            let bytes = match self.codec.encode_meta(frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(file = %frame.filename, error = %e, "metadata not encodable, skipped");
                    continue;
                }
            };
            self.socket.send(&bytes).await.context("metadata send failed")?;
            tracing::info!(
                key = %frame.key,
                file = %frame.filename,
                has_next = frame.has_next,
                "metadata sent"
            );
        }
        Ok(())
    }

    /// Stream every file the peer is missing. A failed transfer releases
    /// its tracker and is retried on a later pass if still missing.
    async fn data_phase(&self) {
        let set = self.inventory.send_set().await;
        if set.is_empty() {
            return;
        }
        tracing::debug!(files = set.len(), "data phase starting");

        for record in set {
            if let Err(e) = self.transfer_file(&record).await {
                tracing::warn!(
                    key = %record.key,
                    file = %record.filename,
                    error = %e,
                    "transfer failed, will retry on a later pass"
                );
                self.inventory.acks().release(&record.key);
            }
        }
    }

    async fn transfer_file(&self, record: &MetaRecord) -> Result<()> {
        let path = self.dir.join(&record.filename);
        let mut reader = ChunkReader::open(&path, self.protocol.data_size)?;

        let acks = self.inventory.acks();
        let key = record.key;
        let window = self.protocol.send_window;
        let mut next_fresh = acks.init_seq();
        let mut last_current = next_fresh;
        let mut tries: u32 = 0;

        while !(reader.finished() && acks.is_empty(&key)) {
            self.alive.wait_alive().await;

            let current = acks.current(&key);
            if current > last_current {
                tries = 0;
                last_current = current;
            }

            let mut progressed = false;
            while !reader.finished() && next_fresh - current < window {
                let chunk = reader.next_chunk()?;
                let frame = DataFrame {
                    key,
                    seqnum: next_fresh as u16,
                    has_next: chunk.has_next,
                    payload: chunk.payload,
                };
                let bytes = self.codec.encode_data(&frame)?;
                acks.record_sent(&key, next_fresh, bytes.clone());
                self.socket.send(&bytes).await.context("chunk send failed")?;
                tracing::info!(
                    key = %key,
                    seqnum = next_fresh,
                    len = frame.payload.len(),
                    has_next = frame.has_next,
                    "chunk sent"
                );
                next_fresh += 1;
                progressed = true;
            }

            if !progressed {
                if current < next_fresh {
                    // Window closed: nudge the earliest unacknowledged chunk.
                    if let Some(bytes) = acks.cached(&key, current) {
                        self.socket.send(&bytes).await.context("retransmit failed")?;
                        tracing::debug!(key = %key, seqnum = current, "chunk retransmitted");
                    }
                    tries += 1;
                    if tries >= self.protocol.retry_limit {
                        tracing::warn!(
                            key = %key,
                            rounds = tries,
                            "no acknowledgments, pausing until the peer is heard"
                        );
                        self.alive.interrupt();
                        tries = 0;
                    }
                } else {
                    // Nothing in flight and nothing left to read.
                    break;
                }
            }

            tokio::time::sleep(Duration::from_millis(self.protocol.estimated_rtt_ms)).await;
        }

        tracing::info!(key = %key, file = %record.filename, "file fully acknowledged");
        Ok(())
    }
}
