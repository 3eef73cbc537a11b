//! Cross-node fan-out bus.
//!
//! Every published channel event is also handed to the bus so that sessions
//! held by other nodes see it. Each node tags what it publishes with its own
//! id and ignores its own echoes.

use async_trait::async_trait;
use parley_protocol::ServerEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Bus payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One channel event in transit between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Node that published the event.
    pub origin: String,
    pub channel: String,
    pub event: ServerEvent,
}

/// Publish/subscribe transport between nodes.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError>;

    /// Start receiving every message published on the bus, own ones included.
    async fn subscribe(&self) -> Result<mpsc::Receiver<BusMessage>, BusError>;
}

/// Buffer between a bus subscription and its consumer.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// In-process bus. Lets several notifiers in one process act as nodes.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(SUBSCRIPTION_BUFFER)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        // No subscribers is not an error.
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let mut rx = self.tx.subscribe();
        let (tx, out) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}
