//! Replication Module
//!
//! Write-and-broadcast replication between peers.

pub mod protocol;
mod registry;
mod server;

pub use protocol::Payload;
pub use registry::PeerRegistry;
pub use server::{FileServer, FileServerOpts, ServerState, ServerStats};
