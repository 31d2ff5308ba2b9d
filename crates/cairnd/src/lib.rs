//! cairnd: the cairn directory-synchronizer daemon.
//!
//! Two peers, each watching one directory, periodically announce their
//! file inventories over UDP and stream the files the other side is
//! missing as acknowledged chunk sequences. The pieces:
//!
//! * [`monitor`]   rescans the watched directory into the local inventory
//! * [`inventory`] local/remote views, batch ingestion, send-set diffing
//! * [`ack`]       per-file in-flight chunk bookkeeping
//! * [`sender`]    periodic metadata + data phases
//! * [`receiver`]  datagram demux, chunk assembly, ack emission
//! * [`liveness`]  the peer-alive latch gating sender progress
//! * [`node`]      binds the sockets and wires the tasks together

pub mod ack;
pub mod inventory;
pub mod liveness;
pub mod monitor;
pub mod node;
pub mod receiver;
pub mod sender;
pub mod transfer;

pub use node::{Node, NodeHandle};
