//! WolfStore - Peer-to-Peer Replicated Content Store
//!
//! A node accepts local writes, persists them to a local store, and
//! propagates the written content to every connected peer so that the
//! peer set converges on the same data.
//!
//! # Architecture
//!
//! - [`store`]: key/stream write-through store on local disk
//! - [`network`]: peer and transport contracts, TCP implementation
//! - [`replication`]: payload codec, peer registry, and the [`FileServer`]
//!   controller that ties them together
//!
//! # Features
//!
//! - Write-then-broadcast with per-peer failure reporting
//! - Automatic peer registration and removal on disconnect
//! - Static bootstrap peers with optional dial retry
//! - Single-consumer inbound loop with graceful stop

pub mod config;
pub mod error;
pub mod network;
pub mod replication;
pub mod store;

pub use config::WolfStoreConfig;
pub use error::{Error, Result};
pub use replication::FileServer;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfStoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::network::{Peer, TcpTransport, TcpTransportOpts, Transport};
    pub use crate::replication::{FileServer, FileServerOpts, Payload};
    pub use crate::store::{DiskStore, PathTransform, Store};
}
