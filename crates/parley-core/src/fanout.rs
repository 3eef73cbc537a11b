//! Fan-out notifier.
//!
//! The notifier owns every channel on this node and routes server events to
//! the sessions subscribed to them. With a [`Bus`] configured, each publish
//! is also forwarded to other nodes, and events from other nodes are
//! delivered locally.

use crate::bus::{Bus, BusError, BusMessage};
use crate::channel::{validate_channel_name, Channel, ChannelId, DEFAULT_CHANNEL_CAPACITY};
use crate::delivery::Delivery;
use dashmap::{DashMap, DashSet};
use parley_protocol::ServerEvent;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Subscription errors.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Notifier configuration.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub max_subscriptions_per_connection: usize,
    /// Broadcast buffer per channel.
    pub channel_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 512,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Routes events to subscribed sessions, locally and across nodes.
pub struct Notifier {
    channels: DashMap<ChannelId, Channel>,
    /// socket id -> channels it is subscribed to.
    subscriptions: DashMap<String, DashSet<ChannelId>>,
    config: NotifierConfig,
    node_id: String,
    bus: Option<Arc<dyn Bus>>,
}

impl Notifier {
    /// Create a single-node notifier.
    #[must_use]
    pub fn new(config: NotifierConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a notifier that mirrors every publish onto `bus`.
    ///
    /// Call [`Notifier::start_bus_listener`] to also receive from other nodes.
    #[must_use]
    pub fn with_bus(config: NotifierConfig, bus: Arc<dyn Bus>) -> Self {
        Self::build(config, Some(bus))
    }

    fn build(config: NotifierConfig, bus: Option<Arc<dyn Bus>>) -> Self {
        let node_id = Uuid::new_v4().to_string();
        info!(node = %node_id, bus = bus.is_some(), "Creating notifier with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
            node_id,
            bus,
        }
    }

    /// Id this node stamps on bus traffic.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            channel_count: self.channels.len(),
            connection_count: self.subscriptions.len(),
            total_subscriptions: self.subscriptions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Subscribe a socket to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the socket is already
    /// subscribed, or it hit its subscription limit.
    pub fn subscribe(
        &self,
        socket_id: &str,
        channel_name: &str,
    ) -> Result<broadcast::Receiver<Arc<Delivery>>, FanoutError> {
        validate_channel_name(channel_name).map_err(FanoutError::InvalidChannel)?;

        let subs = self.subscriptions.entry(socket_id.to_string()).or_default();
        if subs.contains(channel_name) {
            return Err(FanoutError::AlreadySubscribed(channel_name.to_string()));
        }
        if subs.len() >= self.config.max_subscriptions_per_connection {
            return Err(FanoutError::MaxSubscriptionsReached);
        }

        let mut channel = self
            .channels
            .entry(channel_name.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel_name, "Creating channel");
                Channel::with_capacity(channel_name, self.config.channel_capacity)
            });
        let receiver = channel.subscribe(socket_id);
        subs.insert(channel_name.to_string());

        Ok(receiver)
    }

    /// Unsubscribe a socket from one channel.
    ///
    /// Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, socket_id: &str, channel_name: &str) -> bool {
        let removed = self
            .subscriptions
            .get(socket_id)
            .is_some_and(|subs| subs.remove(channel_name).is_some());
        if removed {
            self.detach(socket_id, channel_name);
        }
        removed
    }

    /// Unsubscribe a socket from everything.
    pub fn unsubscribe_all(&self, socket_id: &str) {
        if let Some((_, channels)) = self.subscriptions.remove(socket_id) {
            for name in channels.iter() {
                self.detach(socket_id, name.as_str());
            }
        }
        debug!(connection = %socket_id, "Unsubscribed from all channels");
    }

    fn detach(&self, socket_id: &str, channel_name: &str) {
        let empty = match self.channels.get_mut(channel_name) {
            Some(mut channel) => {
                channel.unsubscribe(socket_id);
                channel.is_empty()
            }
            None => false,
        };
        if empty {
            self.channels.remove_if(channel_name, |_, c| c.is_empty());
            debug!(channel = %channel_name, "Deleted empty channel");
        }
    }

    /// Deliver to sessions on this node only. Returns the local recipient count.
    pub fn deliver_local(&self, delivery: Delivery) -> usize {
        match self.channels.get(&delivery.channel) {
            Some(channel) => {
                let count = channel.send(Arc::new(delivery));
                trace!(channel = %channel.name(), recipients = count, "Delivered");
                count
            }
            None => 0,
        }
    }

    /// Publish an event to a channel on every node.
    ///
    /// Best effort: a bus failure is logged and the local delivery still
    /// counts. Returns the local recipient count.
    pub async fn publish(&self, channel: &str, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let count = self.deliver_local(Delivery::new(channel, Arc::clone(&event)));

        if let Some(bus) = &self.bus {
            let message = BusMessage {
                origin: self.node_id.clone(),
                channel: channel.to_string(),
                event: event.as_ref().clone(),
            };
            if let Err(e) = bus.publish(&message).await {
                warn!(channel, error = %e, "Bus publish failed");
            }
        }

        count
    }

    /// Start delivering events published by other nodes.
    ///
    /// Returns `None` when no bus is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscription cannot be established.
    pub async fn start_bus_listener(
        self: &Arc<Self>,
    ) -> Result<Option<JoinHandle<()>>, BusError> {
        let Some(bus) = &self.bus else {
            return Ok(None);
        };
        let mut rx = bus.subscribe().await?;
        let notifier = Arc::clone(self);
        info!(node = %self.node_id, "Listening for remote fan-out");

        Ok(Some(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if message.origin == notifier.node_id {
                    continue;
                }
                let delivery = Delivery::new(message.channel, Arc::new(message.event))
                    .with_origin(message.origin);
                notifier.deliver_local(delivery);
            }
            warn!(node = %notifier.node_id, "Bus listener stopped");
        })))
    }

    #[must_use]
    pub fn channel_exists(&self, channel_name: &str) -> bool {
        self.channels.contains_key(channel_name)
    }

    #[must_use]
    pub fn subscriber_count(&self, channel_name: &str) -> usize {
        self.channels
            .get(channel_name)
            .map_or(0, |c| c.subscriber_count())
    }

    /// Channels a socket is subscribed to.
    #[must_use]
    pub fn connection_channels(&self, socket_id: &str) -> Vec<ChannelId> {
        self.subscriptions
            .get(socket_id)
            .map(|s| s.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(NotifierConfig::default())
    }
}

/// Notifier statistics.
#[derive(Debug, Clone)]
pub struct NotifierStats {
    pub channel_count: usize,
    /// Sockets with at least one subscription.
    pub connection_count: usize,
    pub total_subscriptions: usize,
}
