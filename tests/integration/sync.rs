//! End-to-end synchronization scenarios over loopback UDP.

use anyhow::Result;

use crate::*;

/// Empty-folder handshake: A starts empty, B holds one file. A's sentinel
/// keeps B's remote view honest and B's announce-then-transfer cycle
/// lands the file in A's directory.
#[tokio::test]
async fn empty_folder_receives_peer_file() -> Result<()> {
    let dir_a = scratch_dir("empty-a");
    let dir_b = scratch_dir("empty-b");

    let content = b"synchronize me".to_vec();
    std::fs::write(dir_b.join("a.txt"), &content)?;

    let (a, b) = start_pair(&dir_a, &dir_b).await?;
    let result = wait_for_file(&dir_a, "a.txt", &content).await;

    a.shutdown().await;
    b.shutdown().await;
    cleanup(&[&dir_a, &dir_b]);
    result
}

/// A file spanning several chunks, including a short tail, arrives byte
/// for byte intact.
#[tokio::test]
async fn multi_chunk_file_arrives_intact() -> Result<()> {
    let dir_a = scratch_dir("chunks-a");
    let dir_b = scratch_dir("chunks-b");

    // Three full chunks plus a 17-byte tail at the test data_size of 512.
    let content: Vec<u8> = (0..3 * 512 + 17).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir_a.join("payload.bin"), &content)?;

    let (a, b) = start_pair(&dir_a, &dir_b).await?;
    let result = wait_for_file(&dir_b, "payload.bin", &content).await;

    a.shutdown().await;
    b.shutdown().await;
    cleanup(&[&dir_a, &dir_b]);
    result
}

/// A zero-byte file still transfers: one empty final chunk.
#[tokio::test]
async fn empty_file_transfers() -> Result<()> {
    let dir_a = scratch_dir("zero-a");
    let dir_b = scratch_dir("zero-b");

    std::fs::write(dir_a.join("hollow.bin"), b"")?;

    let (a, b) = start_pair(&dir_a, &dir_b).await?;
    let result = wait_for_file(&dir_b, "hollow.bin", b"").await;

    a.shutdown().await;
    b.shutdown().await;
    cleanup(&[&dir_a, &dir_b]);
    result
}

/// Batch reconciliation: A holds three files, B holds none. B's view of
/// the batch fills in and every file lands on B.
#[tokio::test]
async fn three_file_batch_reconciles() -> Result<()> {
    let dir_a = scratch_dir("batch-a");
    let dir_b = scratch_dir("batch-b");

    let files = [
        ("x.txt", b"ex".to_vec()),
        ("y.txt", b"why".to_vec()),
        ("z.txt", b"zed".to_vec()),
    ];
    for (name, content) in &files {
        std::fs::write(dir_a.join(name), content)?;
    }

    let (a, b) = start_pair(&dir_a, &dir_b).await?;
    let mut result = Ok(());
    for (name, content) in &files {
        result = wait_for_file(&dir_b, name, content).await;
        if result.is_err() {
            break;
        }
    }

    a.shutdown().await;
    b.shutdown().await;
    cleanup(&[&dir_a, &dir_b]);
    result
}

/// Both directories hold distinct files; after convergence each holds the
/// union.
#[tokio::test]
async fn two_sided_directories_converge() -> Result<()> {
    let dir_a = scratch_dir("union-a");
    let dir_b = scratch_dir("union-b");

    let from_a = b"written on a".to_vec();
    let from_b = b"written on b".to_vec();
    std::fs::write(dir_a.join("from-a.txt"), &from_a)?;
    std::fs::write(dir_b.join("from-b.txt"), &from_b)?;

    let (a, b) = start_pair(&dir_a, &dir_b).await?;
    let mut result = wait_for_file(&dir_b, "from-a.txt", &from_a).await;
    if result.is_ok() {
        result = wait_for_file(&dir_a, "from-b.txt", &from_b).await;
    }

    a.shutdown().await;
    b.shutdown().await;
    cleanup(&[&dir_a, &dir_b]);
    result
}

/// A file dropped into the directory after startup is picked up by a
/// later scan and synchronized.
#[tokio::test]
async fn late_file_is_synchronized() -> Result<()> {
    let dir_a = scratch_dir("late-a");
    let dir_b = scratch_dir("late-b");

    let (a, b) = start_pair(&dir_a, &dir_b).await?;

    // Let both sides settle into the empty-directory exchange first.
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    let content = b"appeared later".to_vec();
    std::fs::write(dir_a.join("late.txt"), &content)?;

    let result = wait_for_file(&dir_b, "late.txt", &content).await;

    a.shutdown().await;
    b.shutdown().await;
    cleanup(&[&dir_a, &dir_b]);
    result
}
