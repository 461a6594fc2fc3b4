//! WolfStore Configuration
//!
//! This module provides configuration structures for a WolfStore node:
//! where it stores data, how it names files on disk, which peers it joins
//! at startup, and transport limits.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::PathTransform;

/// Main WolfStore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfStoreConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Local store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier (used in logs only)
    pub id: String,

    /// Address to bind for peer connections
    pub bind_address: String,

    /// Root directory for stored content
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
}

/// Local store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// How keys are mapped to paths under the storage root
    #[serde(default)]
    pub path_transform: PathTransform,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Peer addresses dialed at startup, in order (empty entries are skipped)
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    /// Timeout for a single dial attempt in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Total time to keep retrying a failed bootstrap dial (0 = single attempt)
    #[serde(default)]
    pub dial_retry_max_elapsed_ms: u64,

    /// Write payloads received from peers into the local store
    #[serde(default = "default_true")]
    pub persist_inbound: bool,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest frame accepted from a peer
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Capacity of the inbound message queue
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/wolfstore")
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_inbound_queue() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            dial_timeout_ms: default_dial_timeout_ms(),
            dial_retry_max_elapsed_ms: 0,
            persist_inbound: true,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            inbound_queue: default_inbound_queue(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfStoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfStoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.node.storage_root.as_os_str().is_empty() {
            return Err(crate::Error::Config("node.storage_root cannot be empty".into()));
        }

        if self.cluster.dial_timeout_ms == 0 {
            return Err(crate::Error::Config("cluster.dial_timeout_ms must be positive".into()));
        }

        if self.transport.max_frame_bytes == 0 {
            return Err(crate::Error::Config("transport.max_frame_bytes must be positive".into()));
        }

        if self.transport.inbound_queue == 0 {
            return Err(crate::Error::Config("transport.inbound_queue must be positive".into()));
        }

        Ok(())
    }

    /// Bootstrap addresses with empty entries removed
    pub fn bootstrap_nodes(&self) -> Vec<String> {
        self.cluster
            .bootstrap_nodes
            .iter()
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Get the storage root path
    pub fn storage_root(&self) -> &PathBuf {
        &self.node.storage_root
    }

    /// Get dial timeout as Duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.dial_timeout_ms)
    }

    /// Get the bootstrap retry window, if retries are enabled
    pub fn dial_retry_window(&self) -> Option<Duration> {
        match self.cluster.dial_retry_max_elapsed_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
