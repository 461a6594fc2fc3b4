//! Replication Protocol
//!
//! Defines the record exchanged between nodes. Message boundaries are the
//! transport's concern; this module only encodes the record contents.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The unit of replication: content stored under a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Store key
    pub key: String,
    /// Stored bytes
    pub data: Vec<u8>,
}

/// Fixed-width little-endian integers, matching `bincode::serialize`
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

impl Payload {
    /// Create a new payload
    pub fn new(key: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }

    /// Serialize payload to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(wire_options().serialize(self)?)
    }

    /// Deserialize a payload, rejecting truncated input and trailing bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        wire_options()
            .with_limit(bytes.len() as u64)
            .deserialize(bytes)
            .map_err(|e| Error::Decode(e.to_string()))
    }
}
