//! Shared key-value cache.
//!
//! The cache is always a derived view of the durable store. Reads go through
//! [`fetch`], the single cache-aside path: check the cache, recompute on a
//! miss and write the result back. Writers either invalidate an entry or use
//! one of the two in-place patches ([`Cache::incr_if_exists`] and
//! [`Cache::list_push_trim`]), which only touch entries that already exist so
//! a missing value is always recomputed in full.
//!
//! Every key has a write version. Deletes bump it, and a store write that is
//! patched in afterwards is bracketed by [`PendingPatch`], which bumps it on
//! both ends and marks the key in flight in between. A loader reads the
//! version before it touches the store and writes back only if the version
//! is unchanged and nothing is in flight, so a snapshot taken before a
//! concurrent write is never stored.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How long a key stays in flight if its writer never finishes.
pub const PATCH_GUARD_TTL: Duration = Duration::from_secs(30);

/// Lifetime of a key's write version after its last bump.
pub const VERSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache backend could not be reached.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// Operation does not match the stored value type.
    #[error("Wrong value type at key {0}")]
    WrongType(String),

    /// Counter operation on a non-integer value.
    #[error("Value at key {0} is not an integer")]
    NotAnInteger(String),
}

/// Key-value cache with TTLs, counters and bounded lists.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Get several string values in one round trip.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    /// Set a string value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), CacheError>;

    /// Delete a key of any type and bump its write version.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Atomically add `delta` to an integer, starting from zero when absent,
    /// and reset its TTL.
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError>;

    /// Atomically add `delta` to an existing integer.
    ///
    /// Returns `None` and writes nothing when the key is absent.
    async fn incr_if_exists(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError>;

    /// Atomically push onto the tail of an existing list and trim it to the
    /// newest `keep` entries.
    ///
    /// Returns the new length, or `None` and writes nothing when the list is
    /// absent.
    async fn list_push_trim(
        &self,
        key: &str,
        value: String,
        keep: usize,
    ) -> Result<Option<usize>, CacheError>;

    /// All entries of a list, oldest first. Empty when absent.
    async fn list_range(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Atomically replace a list with `values`.
    async fn list_replace(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Reset the TTL of a key. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Current write version of `key`, or `None` while a write is in flight.
    async fn version(&self, key: &str) -> Result<Option<u64>, CacheError>;

    /// Bump the version and mark a write to `key` in flight.
    async fn begin_write(&self, key: &str) -> Result<(), CacheError>;

    /// Bump the version and clear one in-flight write.
    async fn end_write(&self, key: &str) -> Result<(), CacheError>;

    /// [`Cache::set`] only if the version is still `version` and nothing is
    /// in flight. Returns whether it wrote.
    async fn set_if_version(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        version: u64,
    ) -> Result<bool, CacheError>;

    /// [`Cache::list_replace`] under the same condition as
    /// [`Cache::set_if_version`].
    async fn list_replace_if_version(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
        version: u64,
    ) -> Result<bool, CacheError>;
}

/// Cache key layout.
pub mod keys {
    use parley_protocol::{RoomId, UserId};

    /// Presence marker of a user.
    #[must_use]
    pub fn presence(user: &UserId) -> String {
        format!("presence:{user}")
    }

    /// Open sockets of a user across every node.
    #[must_use]
    pub fn connections(user: &UserId) -> String {
        format!("presence:{user}:connections")
    }

    /// Room id of a direct pair, by canonical pair key.
    #[must_use]
    pub fn direct_room(pair_key: &str) -> String {
        format!("room:direct:{pair_key}")
    }

    /// Chat list of a user.
    #[must_use]
    pub fn user_rooms(user: &UserId) -> String {
        format!("rooms:user:{user}")
    }

    /// Recent message window of a room.
    #[must_use]
    pub fn recent_messages(room: &RoomId) -> String {
        format!("room:{room}:messages")
    }

    /// Unread counter of a reader in a room.
    #[must_use]
    pub fn unread(room: &RoomId, user: &UserId) -> String {
        format!("unread:{room}:{user}")
    }
}

/// Read-through lookup.
///
/// Serves `key` from the cache when present and decodable; otherwise runs
/// `load`, writes a `Some` result back with `ttl` and returns it. Cache
/// failures degrade to a recompute and are logged; loader errors propagate.
pub async fn fetch<T, E, F, Fut>(
    cache: &dyn Cache,
    key: &str,
    ttl: Duration,
    load: F,
) -> Result<Option<T>, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    match cache.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => {
                trace!(key, "Cache hit");
                return Ok(Some(value));
            }
            Err(e) => warn!(key, error = %e, "Discarding undecodable cache entry"),
        },
        Ok(None) => trace!(key, "Cache miss"),
        Err(e) => warn!(key, error = %e, "Cache read failed, recomputing"),
    }

    let version = read_version(cache, key).await;
    let loaded = load().await?;

    if let (Some(value), Some(version)) = (&loaded, version) {
        match serde_json::to_string(value) {
            Ok(raw) => match cache.set_if_version(key, raw, ttl, version).await {
                Ok(true) => {}
                Ok(false) => debug!(key, "Entry changed while loading, not cached"),
                Err(e) => warn!(key, error = %e, "Cache write-back failed"),
            },
            Err(e) => warn!(key, error = %e, "Cache value not serializable"),
        }
    }

    Ok(loaded)
}

/// Version to write back under; `None` skips the write-back.
async fn read_version(cache: &dyn Cache, key: &str) -> Option<u64> {
    match cache.version(key).await {
        Ok(Some(version)) => Some(version),
        Ok(None) => {
            debug!(key, "Write in flight, not caching");
            None
        }
        Err(e) => {
            warn!(key, error = %e, "Cache version read failed");
            None
        }
    }
}

/// Read-through lookup for list entries.
///
/// Same contract as [`fetch`]: an absent, unreadable or undecodable list is
/// rebuilt from `load` and written back whole; an empty result is not
/// stored.
pub async fn fetch_list<T, E, F, Fut>(
    cache: &dyn Cache,
    key: &str,
    ttl: Duration,
    load: F,
) -> Result<Vec<T>, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    match cache.list_range(key).await {
        Ok(raw) if !raw.is_empty() => {
            match raw
                .iter()
                .map(|item| serde_json::from_str(item))
                .collect::<Result<Vec<T>, _>>()
            {
                Ok(values) => {
                    trace!(key, len = values.len(), "Cache list hit");
                    return Ok(values);
                }
                Err(e) => warn!(key, error = %e, "Discarding undecodable cache list"),
            }
        }
        Ok(_) => trace!(key, "Cache list miss"),
        Err(e) => warn!(key, error = %e, "Cache list read failed, recomputing"),
    }

    let version = read_version(cache, key).await;
    let loaded = load().await?;

    if let (false, Some(version)) = (loaded.is_empty(), version) {
        match loaded
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(raw) => match cache.list_replace_if_version(key, raw, ttl, version).await {
                Ok(true) => {}
                Ok(false) => debug!(key, "List changed while loading, not cached"),
                Err(e) => warn!(key, error = %e, "Cache list write-back failed"),
            },
            Err(e) => warn!(key, error = %e, "Cache list not serializable"),
        }
    }

    Ok(loaded)
}

/// Drop a derived entry so the next read recomputes it.
///
/// # Errors
///
/// Returns the cache error after logging it.
pub async fn invalidate(cache: &dyn Cache, key: &str) -> Result<(), CacheError> {
    cache.delete(key).await.map_err(|e| {
        warn!(key, error = %e, "Cache invalidation failed");
        e
    })
}

/// Entries a store write is about to patch in place.
///
/// Open it before the store write and [`close`](PendingPatch::close) it
/// after the patches. Loaders of these keys do not write back while it is
/// open. A key that could not be marked is not [`guarded`](PendingPatch::is_guarded);
/// the writer must not patch it, and closing invalidates it instead.
pub struct PendingPatch<'a> {
    cache: &'a dyn Cache,
    keys: Vec<(String, bool)>,
}

impl<'a> PendingPatch<'a> {
    /// Mark every key in flight.
    pub async fn open(cache: &'a dyn Cache, keys: Vec<String>) -> PendingPatch<'a> {
        let mut marked = Vec::with_capacity(keys.len());
        for key in keys {
            let guarded = match cache.begin_write(&key).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "Could not mark cache write");
                    false
                }
            };
            marked.push((key, guarded));
        }
        Self {
            cache,
            keys: marked,
        }
    }

    /// Whether `key` may be patched.
    #[must_use]
    pub fn is_guarded(&self, key: &str) -> bool {
        self.keys.iter().any(|(k, guarded)| k == key && *guarded)
    }

    /// Finish the write: clear the marks, or drop the unmarked entries.
    pub async fn close(self) {
        for (key, guarded) in &self.keys {
            if *guarded {
                if let Err(e) = self.cache.end_write(key).await {
                    warn!(key = %key, error = %e, "Could not clear cache write mark");
                    let _ = invalidate(self.cache, key).await; // logged
                }
            } else {
                let _ = invalidate(self.cache, key).await; // logged
            }
        }
    }
}

impl fmt::Debug for PendingPatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPatch").field("keys", &self.keys).finish()
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

fn add(entry: &mut Entry, key: &str, delta: i64) -> Result<i64, CacheError> {
    match &mut entry.value {
        Value::Str(s) => {
            let current: i64 = s
                .trim()
                .parse()
                .map_err(|_| CacheError::NotAnInteger(key.to_string()))?;
            let next = current + delta;
            *s = next.to_string();
            Ok(next)
        }
        Value::List(_) => Err(CacheError::WrongType(key.to_string())),
    }
}

#[derive(Debug, Default)]
struct WriteVersion {
    version: u64,
    in_flight: u32,
    in_flight_until: Option<Instant>,
}

impl WriteVersion {
    fn in_flight(&self) -> bool {
        self.in_flight > 0 && self.in_flight_until.is_some_and(|at| Instant::now() < at)
    }
}

/// In-process cache backed by a concurrent map.
///
/// Expiry is checked lazily on access against the tokio clock, so paused
/// time in tests drives TTLs. Write versions live in a second map that is
/// always locked before the entry map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    versions: DashMap<String, WriteVersion>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, expired ones included until touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `f` on a live entry, evicting it if it has expired.
    fn read<R>(&self, key: &str, f: impl FnOnce(&Entry) -> R) -> Option<R> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(f(&entry)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        None
    }

    /// Run `f` on a live entry for mutation, evicting it if it has expired.
    fn write<R>(&self, key: &str, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => return Some(f(&mut entry)),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        None
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.read(key, |e| e.value.clone()) {
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(Value::List(_)) => Err(CacheError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        // Lists read as absent, matching MGET.
        Ok(keys
            .iter()
            .map(|key| match self.read(key, |e| e.value.clone()) {
                Some(Value::Str(s)) => Some(s),
                _ => None,
            })
            .collect())
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), Entry::new(Value::Str(value), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut version = self.versions.entry(key.to_string()).or_default();
        self.entries.remove(key);
        version.version += 1;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Str("0".to_string()), None));
        if entry.is_expired() {
            *entry = Entry::new(Value::Str("0".to_string()), None);
        }
        let next = add(&mut entry, key, delta)?;
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(next)
    }

    async fn incr_if_exists(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError> {
        self.write(key, |entry| add(entry, key, delta)).transpose()
    }

    async fn list_push_trim(
        &self,
        key: &str,
        value: String,
        keep: usize,
    ) -> Result<Option<usize>, CacheError> {
        self.write(key, |entry| match &mut entry.value {
            Value::List(list) => {
                list.push_back(value);
                while list.len() > keep {
                    list.pop_front();
                }
                Ok(list.len())
            }
            Value::Str(_) => Err(CacheError::WrongType(key.to_string())),
        })
        .transpose()
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, CacheError> {
        match self.read(key, |e| e.value.clone()) {
            Some(Value::List(list)) => Ok(list.into_iter().collect()),
            Some(Value::Str(_)) => Err(CacheError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn list_replace(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        if values.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(
                key.to_string(),
                Entry::new(Value::List(values.into_iter().collect()), ttl),
            );
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        Ok(self
            .write(key, |entry| entry.expires_at = Some(Instant::now() + ttl))
            .is_some())
    }

    async fn version(&self, key: &str) -> Result<Option<u64>, CacheError> {
        Ok(match self.versions.get(key) {
            Some(v) if v.in_flight() => None,
            Some(v) => Some(v.version),
            None => Some(0),
        })
    }

    async fn begin_write(&self, key: &str) -> Result<(), CacheError> {
        let mut v = self.versions.entry(key.to_string()).or_default();
        if !v.in_flight() {
            v.in_flight = 0;
        }
        v.version += 1;
        v.in_flight += 1;
        v.in_flight_until = Some(Instant::now() + PATCH_GUARD_TTL);
        Ok(())
    }

    async fn end_write(&self, key: &str) -> Result<(), CacheError> {
        let mut v = self.versions.entry(key.to_string()).or_default();
        v.version += 1;
        v.in_flight = v.in_flight.saturating_sub(1);
        Ok(())
    }

    async fn set_if_version(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        version: u64,
    ) -> Result<bool, CacheError> {
        let current = self.versions.entry(key.to_string()).or_default();
        if current.in_flight() || current.version != version {
            return Ok(false);
        }
        self.entries
            .insert(key.to_string(), Entry::new(Value::Str(value), Some(ttl)));
        Ok(true)
    }

    async fn list_replace_if_version(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
        version: u64,
    ) -> Result<bool, CacheError> {
        let current = self.versions.entry(key.to_string()).or_default();
        if current.in_flight() || current.version != version {
            return Ok(false);
        }
        if values.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(
                key.to_string(),
                Entry::new(Value::List(values.into_iter().collect()), Some(ttl)),
            );
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_get_set_delete() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("k").await.unwrap(), None);

        cache.set("k", "v".into(), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_extends_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.expire("k", Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.get("k").await.unwrap().is_some());
        assert!(!cache.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_only_touches_existing() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_if_exists("n", 1).await.unwrap(), None);
        assert_eq!(cache.get("n").await.unwrap(), None);

        cache.set("n", "2".into(), None).await.unwrap();
        assert_eq!(cache.incr_if_exists("n", 1).await.unwrap(), Some(3));
        assert_eq!(cache.incr_if_exists("n", -2).await.unwrap(), Some(1));

        cache.set("s", "abc".into(), None).await.unwrap();
        assert!(matches!(
            cache.incr_if_exists("s", 1).await,
            Err(CacheError::NotAnInteger(_))
        ));
    }

    #[tokio::test]
    async fn test_list_push_trim_bounds_length() {
        let cache = MemoryCache::new();
        assert_eq!(cache.list_push_trim("l", "a".into(), 3).await.unwrap(), None);
        assert!(cache.list_range("l").await.unwrap().is_empty());

        cache
            .list_replace("l", vec!["a".into(), "b".into()], None)
            .await
            .unwrap();
        for item in ["c", "d", "e"] {
            let len = cache.list_push_trim("l", item.into(), 3).await.unwrap();
            assert!(len.unwrap() <= 3);
        }
        assert_eq!(cache.list_range("l").await.unwrap(), vec!["c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_get_many_mixed() {
        let cache = MemoryCache::new();
        cache.set("a", "1".into(), None).await.unwrap();
        cache.list_replace("l", vec!["x".into()], None).await.unwrap();
        let values = cache
            .get_many(&["a".to_string(), "b".to_string(), "l".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, None]);
    }

    #[tokio::test]
    async fn test_fetch_reads_through_once() {
        let cache = MemoryCache::new();
        let loads = AtomicUsize::new(0);
        let counter = &loads;

        for _ in 0..3 {
            let value: Option<u64> = fetch(&cache, "count", Duration::from_secs(60), || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(Some(7))
            })
            .await
            .unwrap();
            assert_eq!(value, Some(7));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("count").await.unwrap(), Some("7".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_does_not_cache_none() {
        let cache = MemoryCache::new();
        let value: Option<String> = fetch(&cache, "missing", Duration::from_secs(60), || async {
            Ok::<_, CacheError>(None)
        })
        .await
        .unwrap();
        assert!(value.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_recovers_from_corrupt_entry() {
        let cache = MemoryCache::new();
        cache.set("count", "{not json".into(), None).await.unwrap();
        let value: Option<u64> = fetch(&cache, "count", Duration::from_secs(60), || async {
            Ok::<_, CacheError>(Some(3))
        })
        .await
        .unwrap();
        assert_eq!(value, Some(3));
        assert_eq!(cache.get("count").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_incr_creates_and_counts() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(cache.incr("n", 1, ttl).await.unwrap(), 1);
        assert_eq!(cache.incr("n", 1, ttl).await.unwrap(), 2);
        assert_eq!(cache.incr("n", -2, ttl).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_skips_write_back_after_concurrent_delete() {
        let cache = MemoryCache::new();
        let value: Option<u64> = fetch(&cache, "count", Duration::from_secs(60), || async {
            // A writer commits and invalidates while this snapshot is in hand.
            cache.delete("count").await.unwrap();
            Ok::<_, CacheError>(Some(1))
        })
        .await
        .unwrap();
        assert_eq!(value, Some(1));
        assert_eq!(cache.get("count").await.unwrap(), None);

        // Nothing racing: the next load is cached.
        let value: Option<u64> = fetch(&cache, "count", Duration::from_secs(60), || async {
            Ok::<_, CacheError>(Some(2))
        })
        .await
        .unwrap();
        assert_eq!(value, Some(2));
        assert_eq!(cache.get("count").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_pending_patch_blocks_write_back() {
        let cache = MemoryCache::new();
        let pending = PendingPatch::open(&cache, vec!["l".to_string()]).await;
        assert!(pending.is_guarded("l"));
        assert!(!pending.is_guarded("other"));
        assert_eq!(cache.version("l").await.unwrap(), None);

        let loaded: Vec<String> = fetch_list(&cache, "l", Duration::from_secs(60), || async {
            Ok::<_, CacheError>(vec!["old".to_string()])
        })
        .await
        .unwrap();
        assert_eq!(loaded, vec!["old"]);
        assert!(cache.list_range("l").await.unwrap().is_empty());

        pending.close().await;
        assert!(cache.version("l").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_started_during_load_discards_snapshot() {
        let cache = MemoryCache::new();
        let loaded: Vec<String> = fetch_list(&cache, "l", Duration::from_secs(60), || async {
            let pending = PendingPatch::open(&cache, vec!["l".to_string()]).await;
            // The patch finds no list and skips it.
            cache.list_push_trim("l", "\"new\"".into(), 10).await.unwrap();
            pending.close().await;
            Ok::<_, CacheError>(vec!["old".to_string()])
        })
        .await
        .unwrap();
        assert_eq!(loaded, vec!["old"]);
        assert!(cache.list_range("l").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_write_mark_expires() {
        let cache = MemoryCache::new();
        cache.begin_write("k").await.unwrap();
        assert_eq!(cache.version("k").await.unwrap(), None);
        tokio::time::advance(PATCH_GUARD_TTL + Duration::from_secs(1)).await;
        assert_eq!(cache.version("k").await.unwrap(), Some(1));
    }
}
