//! Directory monitor: periodically rescans the watched directory into the
//! local inventory. Top-level regular files only; symlinks are not
//! followed and dot-files are skipped (the receiver parks in-progress
//! part files under a dot prefix in the same directory).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

use cairn_core::FileKey;

use crate::inventory::{Inventory, MetaRecord};

/// Rescan loop. One tick per `scan_interval_secs`; a failed scan logs and
/// leaves the previous inventory in place.
pub async fn monitor_loop(
    dir: PathBuf,
    scan_interval_secs: u64,
    max_filename_len: usize,
    inventory: Arc<Inventory>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(scan_interval_secs));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("directory monitor shutting down");
                return Ok(());
            }

            _ = interval.tick() => {
                match scan_directory(&dir, max_filename_len) {
                    Ok(records) => {
                        tracing::debug!(files = records.len(), "directory scanned");
                        inventory.replace_local(records);
                    }
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "directory scan failed");
                    }
                }
            }
        }
    }
}

/// One pass over the watched directory.
pub fn scan_directory(dir: &Path, max_filename_len: usize) -> std::io::Result<Vec<MetaRecord>> {
    let mut records = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        // file_type() does not traverse symlinks.
        if !entry.file_type()?.is_file() {
            continue;
        }

        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                tracing::warn!(name = ?raw, "skipping file with non-UTF-8 name");
                continue;
            }
        };
        if name.starts_with('.') {
            continue;
        }
        if name.len() > max_filename_len {
            tracing::warn!(name, "skipping file whose name does not fit a packet");
            continue;
        }

        let meta = entry.metadata()?;
        let modified_ms = meta.modified().map(epoch_ms).unwrap_or(0);
        // Creation time is not available on every filesystem; fall back to
        // the modification time so the key stays deterministic.
        let created_ms = meta.created().map(epoch_ms).unwrap_or(modified_ms);

        records.push(MetaRecord {
            key: FileKey::compute(&name, created_ms),
            filename: name,
            created_ms,
            modified_ms,
        });
    }

    Ok(records)
}

fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current wall clock in ms since the epoch, used for ACK timestamps.
pub fn now_ms() -> u64 {
    epoch_ms(SystemTime::now())
}
