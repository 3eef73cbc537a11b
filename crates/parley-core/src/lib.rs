//! # parley-core
//!
//! Rooms, messages, presence and fan-out for the Parley chat backbone.
//!
//! This crate provides the service behind a chat socket:
//!
//! - **Identity** - Bearer token verification at the handshake
//! - **Connection** - Session lifecycle and client operations
//! - **Rooms** - Direct and group room directory
//! - **Messages** - Message store with cached recent windows and unread counters
//! - **Presence** - TTL'd online markers OR'd across a user's sessions
//! - **Fan-out** - Channel pub/sub, optionally bridged across nodes by a bus
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│ Connection  │────▶│  Notifier   │──▶ Bus
//! └─────────────┘     │  Manager    │     └─────────────┘
//!                     └─────────────┘
//!                      │     │     │
//!                      ▼     ▼     ▼
//!                 Rooms  Messages  Presence
//!                      │     │     │
//!                      ▼     ▼     ▼
//!                   ChatStore / Cache
//! ```
//!
//! Storage, cache, bus and token verification are traits with in-memory
//! implementations; the `redis` feature adds Redis-backed cache and bus.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod bus;
pub mod cache;
pub mod channel;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod messages;
pub mod presence;
pub mod rooms;
pub mod session;
#[cfg(feature = "redis")]
pub mod shared;
pub mod store;

pub use bus::{Bus, BusError, BusMessage, LocalBus};
pub use cache::{Cache, CacheError, MemoryCache};
pub use channel::{Channel, ChannelId};
pub use connection::{Backends, ChatConfig, ConnectionManager, ServiceStats};
pub use delivery::Delivery;
pub use error::{AuthError, ChatError, ErrorKind};
pub use fanout::{FanoutError, Notifier, NotifierConfig};
pub use identity::{JwtVerifier, Verifier};
pub use messages::{MessageConfig, MessageStore};
pub use presence::{PresenceConfig, PresenceTracker};
pub use rooms::RoomDirectory;
pub use session::{Outbound, Session, SessionRegistry, SessionState};
#[cfg(feature = "redis")]
pub use shared::{RedisBus, RedisCache};
pub use store::{ChatStore, MemoryStore, StoreError, UserStore};
