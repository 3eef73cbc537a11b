//! Events in flight through the notifier.

use chrono::Utc;
use parley_protocol::ServerEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-process delivery sequence number.
pub type DeliveryId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a delivery id. Unique within this process.
#[must_use]
pub fn next_delivery_id() -> DeliveryId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One event on its way to the sessions of a channel.
///
/// The event is shared so a broadcast to many sessions does not copy it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: DeliveryId,
    pub channel: String,
    /// Node that published it, when it arrived over the bus.
    pub origin: Option<String>,
    pub event: Arc<ServerEvent>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Delivery {
    #[must_use]
    pub fn new(channel: impl Into<String>, event: Arc<ServerEvent>) -> Self {
        Self {
            id: next_delivery_id(),
            channel: channel.into(),
            origin: None,
            event,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}
