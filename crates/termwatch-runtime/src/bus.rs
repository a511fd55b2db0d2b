//! Event bus publish contract and the two in-tree transports.

use std::io::Write;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event bus closed")]
    Closed,

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write event: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for PublishError {
    fn from(e: std::io::Error) -> Self {
        // A reader that went away is a closed bus, not a write fault.
        if e.kind() == std::io::ErrorKind::BrokenPipe {
            Self::Closed
        } else {
            Self::Io(e)
        }
    }
}

/// Fire-and-forget publish. Failures are reported, never retried here.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), PublishError>;
}

/// One published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// In-process bus over a tokio broadcast channel.
///
/// Publishing with no subscribers is not an error.
pub struct BroadcastBus {
    tx: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[cfg(test)]
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), PublishError> {
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        // send() only errors when there are no receivers.
        let _ = self.tx.send(message);
        Ok(())
    }
}

/// Writes each message as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct StdoutBus;

impl EventBus for StdoutBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<(), PublishError> {
        let line = serde_json::to_string(&BusMessage {
            topic: topic.to_string(),
            payload,
        })?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}
