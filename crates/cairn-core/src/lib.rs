//! cairn-core: wire format, packet authentication, and configuration.
//! All other cairn crates depend on this one.

pub mod config;
pub mod wire;

pub use config::{CairnConfig, ProtocolConfig};
pub use wire::{AckFrame, Codec, DataFrame, FileKey, MetaFrame, Packet, WireError};
