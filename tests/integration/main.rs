//! cairn integration test harness.
//!
//! Each test spawns two in-process nodes wired to each other over
//! loopback UDP, with scratch directories under the system temp dir, and
//! polls for convergence. Intervals are shortened so a full
//! announce-and-transfer cycle fits in a couple of seconds.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};

use cairn_core::ProtocolConfig;
use cairnd::{Node, NodeHandle};

mod sync;

// ── Test configuration ───────────────────────────────────────────────────────

/// Protocol constants tightened for loopback testing. Both nodes of a
/// pair must share these, like any real deployment.
pub fn test_protocol() -> ProtocolConfig {
    ProtocolConfig {
        max_packet_size: 1500,
        data_size: 512,
        init_seq_number: 0,
        send_window: 32,
        retry_limit: 3,
        scan_interval_secs: 1,
        send_interval_ms: 200,
        estimated_rtt_ms: 20,
        key: "integration-test-key".to_owned(),
    }
}

/// How long convergence may take before a test fails.
pub const CONVERGE_DEADLINE: Duration = Duration::from_secs(30);

// ── Directory helpers ────────────────────────────────────────────────────────

/// Fresh scratch directory, unique per test and process.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cairn-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn cleanup(dirs: &[&Path]) {
    for dir in dirs {
        let _ = std::fs::remove_dir_all(dir);
    }
}

// ── Node helpers ─────────────────────────────────────────────────────────────

/// Bind and start two nodes pointed at each other on loopback.
pub async fn start_pair(dir_a: &Path, dir_b: &Path) -> Result<(NodeHandle, NodeHandle)> {
    let loopback: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();

    let node_a = Node::bind(test_protocol(), dir_a.to_path_buf(), loopback).await?;
    let node_b = Node::bind(test_protocol(), dir_b.to_path_buf(), loopback).await?;
    let addr_a = node_a.local_addr()?;
    let addr_b = node_b.local_addr()?;

    let a = node_a.start(addr_b).await?;
    let b = node_b.start(addr_a).await?;
    Ok((a, b))
}

/// Poll until `dir/name` exists with exactly the wanted bytes.
pub async fn wait_for_file(dir: &Path, name: &str, want: &[u8]) -> Result<()> {
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(bytes) = std::fs::read(dir.join(name)) {
            if bytes == want {
                return Ok(());
            }
        }
        if start.elapsed() > CONVERGE_DEADLINE {
            bail!("{name} did not converge within {CONVERGE_DEADLINE:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
