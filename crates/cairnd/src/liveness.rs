//! Peer liveness latch.
//!
//! A single boolean per peer: any received ACK or FILE_META proves the
//! peer alive; retry exhaustion in the sender latches it dead. The sender
//! blocks on the latch and resumes as soon as the peer is heard again.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared peer-alive latch. Starts alive.
#[derive(Clone)]
pub struct PeerAlive {
    tx: Arc<watch::Sender<bool>>,
}

impl PeerAlive {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        PeerAlive { tx: Arc::new(tx) }
    }

    /// The peer was heard from.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    /// The peer went silent: park the sender until it is heard again.
    pub fn interrupt(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_alive(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the peer is considered alive. Returns immediately when
    /// the latch is already set.
    pub async fn wait_alive(&self) {
        let mut rx = self.tx.subscribe();
        // The sender half lives in self, so the channel cannot close.
        let _ = rx.wait_for(|alive| *alive).await;
    }
}

impl Default for PeerAlive {
    fn default() -> Self {
        Self::new()
    }
}
