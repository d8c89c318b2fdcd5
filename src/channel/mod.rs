//! Streaming channel protocol.
//!
//! A channel is a named, single-valued record: publishers replace the current
//! value, subscribers are pushed every new value. Subscribing delivers the
//! current value first, which consumers treat as a warm-up artifact.
//!
//! - `record`: the NDArray-shaped record and its value union
//! - `wire`: length-prefixed JSON framing
//! - `server`: TCP channel server (`RecordServer` implementation)
//! - `monitor`: TCP subscriber client

pub mod monitor;
pub mod record;
pub mod server;
pub mod wire;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};

pub use monitor::ChannelMonitor;
pub use record::{Attribute, Codec, Dimension, NdArrayRecord, TimeStamp};
pub use server::ChannelServer;

/// Publishing side of the channel protocol.
pub trait RecordServer: Send + Sync {
    /// Create a channel with an initial value. Fails if the channel exists.
    fn add_record(&self, channel: &str, record: NdArrayRecord) -> Result<()>;

    /// Replace the value of an existing channel and push it to subscribers.
    fn update(&self, channel: &str, record: NdArrayRecord) -> Result<()>;
}

/// Record server that keeps every published value in memory.
#[derive(Debug, Default)]
pub struct InMemoryRecordServer {
    channels: Mutex<HashMap<String, Vec<NdArrayRecord>>>,
}

impl InMemoryRecordServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every value published on a channel, in publish order, including the initial one.
    pub fn history(&self, channel: &str) -> Vec<NdArrayRecord> {
        self.channels
            .lock()
            .map(|channels| channels.get(channel).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn len(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .map(|channels| channels.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl RecordServer for InMemoryRecordServer {
    fn add_record(&self, channel: &str, record: NdArrayRecord) -> Result<()> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| anyhow!("record server lock poisoned"))?;
        if channels.contains_key(channel) {
            return Err(anyhow!("channel '{}' already exists", channel));
        }
        channels.insert(channel.to_string(), vec![record]);
        Ok(())
    }

    fn update(&self, channel: &str, record: NdArrayRecord) -> Result<()> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| anyhow!("record server lock poisoned"))?;
        let history = channels
            .get_mut(channel)
            .ok_or_else(|| anyhow!("channel '{}' does not exist", channel))?;
        history.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_server_requires_add_before_update() {
        let server = InMemoryRecordServer::new();
        assert!(server.update("a", NdArrayRecord::default()).is_err());
        server.add_record("a", NdArrayRecord::default()).unwrap();
        assert!(server.add_record("a", NdArrayRecord::default()).is_err());
        server.update("a", NdArrayRecord::default()).unwrap();
        assert_eq!(server.len("a"), 2);
    }
}
