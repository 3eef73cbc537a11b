//! Presence tracking.
//!
//! Each user has one TTL'd marker in the shared cache, next to a count of
//! their open sockets on every node. Live sockets refresh both on every
//! heartbeat, so a node that dies without closing its sockets lets them
//! expire on their own. The user goes offline when the shared count reaches
//! zero, not when one node runs out of sockets. Reads are reconciled with
//! the local session registry: a user with an open socket on this node is
//! online whatever the cache says, and the marker is rewritten.

use crate::cache::{keys, Cache, CacheError};
use crate::session::SessionRegistry;
use chrono::{DateTime, Utc};
use parley_protocol::{PresenceStatus, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Presence timing.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Lifetime of an online marker. Must exceed the heartbeat interval.
    pub ttl: Duration,
    /// How long an offline marker keeps `lastSeen` around.
    pub last_seen_ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(90),
            last_seen_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Cached presence marker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    #[must_use]
    pub fn online_now() -> Self {
        Self {
            online: true,
            last_seen: Utc::now(),
        }
    }

    #[must_use]
    pub fn offline_now() -> Self {
        Self {
            online: false,
            last_seen: Utc::now(),
        }
    }
}

/// Online/offline state per user, across all of their sessions.
pub struct PresenceTracker {
    cache: Arc<dyn Cache>,
    registry: Arc<SessionRegistry>,
    config: PresenceConfig,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, registry: Arc<SessionRegistry>, config: PresenceConfig) -> Self {
        Self {
            cache,
            registry,
            config,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn write(&self, user: &UserId, record: PresenceRecord, ttl: Duration) -> Result<(), CacheError> {
        let raw = serde_json::to_string(&record)
            .map_err(|e| CacheError::Unavailable(format!("presence encode: {e}")))?;
        self.cache.set(&keys::presence(user), raw, Some(ttl)).await
    }

    /// Mark the user online.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache write fails.
    pub async fn set_online(&self, user: &UserId) -> Result<(), CacheError> {
        debug!(user = %user, "Presence online");
        self.write(user, PresenceRecord::online_now(), self.config.ttl)
            .await
    }

    /// Mark the user offline, keeping `lastSeen` for a while.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache write fails.
    pub async fn set_offline(&self, user: &UserId) -> Result<PresenceRecord, CacheError> {
        debug!(user = %user, "Presence offline");
        let record = PresenceRecord::offline_now();
        self.write(user, record, self.config.last_seen_ttl).await?;
        Ok(record)
    }

    /// Count a new socket for the user and mark them online.
    ///
    /// Returns `true` when this is the user's only socket on any node.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn connected(&self, user: &UserId) -> Result<bool, CacheError> {
        let open = self
            .cache
            .incr(&keys::connections(user), 1, self.config.ttl)
            .await?;
        self.set_online(user).await?;
        Ok(open == 1)
    }

    /// Uncount a closed socket. When none is left on any node, marks the
    /// user offline and returns the offline record.
    ///
    /// Call after the socket has left the local registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the offline marker cannot be written.
    pub async fn disconnected(&self, user: &UserId) -> Result<Option<PresenceRecord>, CacheError> {
        let open = match self
            .cache
            .incr(&keys::connections(user), -1, self.config.ttl)
            .await
        {
            Ok(open) => open,
            Err(e) => {
                warn!(user = %user, error = %e, "Connection count unavailable, using local sessions");
                0
            }
        };
        if open > 0 || self.registry.is_connected(user) {
            debug!(user = %user, open, "Sockets remain, staying online");
            return Ok(None);
        }
        self.set_offline(user).await.map(Some)
    }

    /// Heartbeat: push the marker's and the count's expiry forward,
    /// recreating them if they already lapsed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn touch(&self, user: &UserId) -> Result<(), CacheError> {
        let count = keys::connections(user);
        if !self.cache.expire(&count, self.config.ttl).await? {
            let local = self.registry.connection_count(user);
            if local > 0 {
                debug!(user = %user, local, "Restoring lapsed connection count");
                let local = i64::try_from(local).unwrap_or(i64::MAX);
                self.cache.incr(&count, local, self.config.ttl).await?;
            }
        }

        match self.cache.get(&keys::presence(user)).await? {
            Some(raw) if decode(&raw).is_some_and(|r| r.online) => {
                if self.cache.expire(&keys::presence(user), self.config.ttl).await? {
                    return Ok(());
                }
                self.set_online(user).await
            }
            _ => self.set_online(user).await,
        }
    }

    /// Live presence of one user.
    ///
    /// # Errors
    ///
    /// Returns an error only if rewriting a stale marker fails.
    pub async fn status(&self, user: &UserId) -> Result<PresenceStatus, CacheError> {
        let statuses = self.bulk_status(std::slice::from_ref(user)).await?;
        Ok(statuses.into_iter().next().unwrap_or_else(|| PresenceStatus {
            user_id: user.clone(),
            is_online: false,
            last_seen: None,
        }))
    }

    /// Single-key online check.
    ///
    /// # Errors
    ///
    /// See [`PresenceTracker::status`].
    pub async fn is_online(&self, user: &UserId) -> Result<bool, CacheError> {
        Ok(self.status(user).await?.is_online)
    }

    /// Presence of many users in one cache round trip.
    ///
    /// # Errors
    ///
    /// Returns an error only if rewriting a stale marker fails.
    pub async fn bulk_status(&self, users: &[UserId]) -> Result<Vec<PresenceStatus>, CacheError> {
        let mut keys: Vec<String> = users.iter().map(keys::presence).collect();
        keys.extend(users.iter().map(keys::connections));
        let raw = match self.cache.get_many(&keys).await {
            Ok(raw) if raw.len() == keys.len() => raw,
            Ok(_) => {
                warn!("Bulk presence read came back short, using local sessions");
                vec![None; keys.len()]
            }
            Err(e) => {
                warn!(error = %e, "Bulk presence read failed, using local sessions");
                vec![None; keys.len()]
            }
        };
        let (markers, counts) = raw.split_at(users.len());

        let mut statuses = Vec::with_capacity(users.len());
        for ((user, marker), count) in users.iter().zip(markers).zip(counts) {
            let record = marker.as_deref().and_then(decode);
            let open = count
                .as_deref()
                .and_then(|c| c.trim().parse::<i64>().ok())
                .unwrap_or(0);
            statuses.push(self.reconcile(user, record, open).await?);
        }
        Ok(statuses)
    }

    /// Batched online check.
    ///
    /// # Errors
    ///
    /// See [`PresenceTracker::bulk_status`].
    pub async fn bulk_is_online(&self, users: &[UserId]) -> Result<Vec<bool>, CacheError> {
        Ok(self
            .bulk_status(users)
            .await?
            .into_iter()
            .map(|s| s.is_online)
            .collect())
    }

    /// Combine a cached marker and the shared socket count with the local
    /// sessions.
    async fn reconcile(
        &self,
        user: &UserId,
        record: Option<PresenceRecord>,
        open: i64,
    ) -> Result<PresenceStatus, CacheError> {
        let local = self.registry.is_connected(user);
        let marked_online = record.is_some_and(|r| r.online);
        if local && !marked_online {
            debug!(user = %user, "Restoring lapsed presence marker");
            self.set_online(user).await?;
        }
        Ok(PresenceStatus {
            user_id: user.clone(),
            is_online: local || marked_online || open > 0,
            last_seen: record.map(|r| r.last_seen),
        })
    }
}

fn decode(raw: &str) -> Option<PresenceRecord> {
    serde_json::from_str(raw).ok()
}
