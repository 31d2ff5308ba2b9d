//! Inventory tracking: what we have, what the peer has, what to send.
//!
//! The local view is rebuilt from scratch by every monitor scan. The
//! remote view accumulates FILE_META batches; a record with
//! `has_next = false` terminates the batch and wakes anyone waiting to
//! compute a send set. Lock order is local, then remote, then ack.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, Notify};

use cairn_core::{FileKey, MetaFrame};

use crate::ack::AckTable;

/// One scanned file. Timestamps are ms since the epoch; remotely-ingested
/// records carry zeros because the wire format does not transmit them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    pub key: FileKey,
    pub filename: String,
    pub created_ms: u64,
    pub modified_ms: u64,
}

impl MetaRecord {
    fn from_frame(frame: &MetaFrame) -> Self {
        MetaRecord {
            key: frame.key,
            filename: frame.filename.clone(),
            created_ms: 0,
            modified_ms: 0,
        }
    }
}

#[derive(Default)]
struct RemoteView {
    files: HashMap<FileKey, MetaRecord>,
    /// True between the first record of a batch and its terminator.
    in_batch: bool,
}

/// Tracks both inventories and owns the ack table.
pub struct Inventory {
    local: StdMutex<HashMap<FileKey, MetaRecord>>,
    /// Keys pinned by completed transfers: a received file keeps the key
    /// it was announced under, whatever its on-disk timestamps say.
    received: StdMutex<HashMap<String, FileKey>>,
    remote: Mutex<RemoteView>,
    batch_done: Notify,
    acks: AckTable,
}

impl Inventory {
    pub fn new(acks: AckTable) -> Self {
        Inventory {
            local: StdMutex::new(HashMap::new()),
            received: StdMutex::new(HashMap::new()),
            remote: Mutex::new(RemoteView::default()),
            batch_done: Notify::new(),
            acks,
        }
    }

    pub fn acks(&self) -> &AckTable {
        &self.acks
    }

    /// Swap in a fresh scan of the watched directory. Files that arrived
    /// via the protocol keep their announced key.
    pub fn replace_local(&self, records: Vec<MetaRecord>) {
        let pinned = self.received.lock().expect("received lock poisoned");
        let mut local = self.local.lock().expect("local lock poisoned");
        local.clear();
        for mut record in records {
            if let Some(key) = pinned.get(&record.filename) {
                record.key = *key;
            }
            local.insert(record.key, record);
        }
    }

    /// Pin the announced key of a file that just completed transfer.
    pub fn pin_received(&self, filename: &str, key: FileKey) {
        self.received
            .lock()
            .expect("received lock poisoned")
            .insert(filename.to_owned(), key);
    }

    /// The filename a key was completed under, if this node already
    /// received it.
    pub fn received_filename(&self, key: &FileKey) -> Option<String> {
        self.received
            .lock()
            .expect("received lock poisoned")
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(name, _)| name.clone())
    }

    /// Absorb one remote inventory record. The first record after a
    /// terminator starts a new batch and clears the previous view; the
    /// terminator itself wakes every send-set waiter.
    pub async fn ingest_remote(&self, frame: MetaFrame) {
        let mut remote = self.remote.lock().await;
        if !remote.in_batch {
            remote.files.clear();
        }
        remote.files.insert(frame.key, MetaRecord::from_frame(&frame));
        remote.in_batch = frame.has_next;
        drop(remote);

        if !frame.has_next {
            self.batch_done.notify_waiters();
        }
    }

    /// The peer announced an empty directory: forget its inventory.
    pub async fn clear_remote(&self) {
        let mut remote = self.remote.lock().await;
        remote.files.clear();
        remote.in_batch = false;
        drop(remote);
        self.batch_done.notify_waiters();
    }

    /// Filename a remote key was announced under, used by the receiver to
    /// open an assembly for incoming chunks.
    pub async fn remote_filename(&self, key: &FileKey) -> Option<String> {
        self.remote
            .lock()
            .await
            .files
            .get(key)
            .map(|r| r.filename.clone())
    }

    /// Snapshot of the remote keys, for observation and tests.
    pub async fn remote_keys(&self) -> Vec<FileKey> {
        self.remote.lock().await.files.keys().copied().collect()
    }

    /// Local records ordered for announcement: every record carries
    /// `has_next = true` except the final terminator. Empty when the
    /// directory is empty.
    pub fn send_metadata_list(&self) -> Vec<MetaFrame> {
        let local = self.local.lock().expect("local lock poisoned");
        let mut records: Vec<&MetaRecord> = local.values().collect();
        records.sort_by(|a, b| a.filename.cmp(&b.filename));

        let count = records.len();
        records
            .iter()
            .enumerate()
            .map(|(i, record)| MetaFrame {
                key: record.key,
                filename: record.filename.clone(),
                has_next: i + 1 < count,
            })
            .collect()
    }

    /// Compute the files the peer is missing: snapshot the local keys,
    /// wait out any in-flight remote batch, diff, and rebuild the ack
    /// table with one fresh tracker per file to send.
    pub async fn send_set(&self) -> Vec<MetaRecord> {
        let snapshot: Vec<MetaRecord> = {
            let local = self.local.lock().expect("local lock poisoned");
            local.values().cloned().collect()
        };

        loop {
            let remote = self.remote.lock().await;
            if !remote.in_batch {
                let mut missing: Vec<MetaRecord> = snapshot
                    .iter()
                    .filter(|record| !remote.files.contains_key(&record.key))
                    .cloned()
                    .collect();
                drop(remote);

                missing.sort_by(|a, b| a.filename.cmp(&b.filename));
                self.acks.reset(missing.iter().map(|r| r.key));
                return missing;
            }

            // Register before releasing the lock so a terminator arriving
            // in between still wakes us.
            let notified = self.batch_done.notified();
            drop(remote);
            notified.await;
        }
    }
}
