//! Redis-backed cache and bus, for running several nodes against shared
//! state.

use crate::bus::{Bus, BusError, BusMessage, SUBSCRIPTION_BUFFER};
use crate::cache::{Cache, CacheError, PATCH_GUARD_TTL, VERSION_TTL};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const INCR_IF_EXISTS: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return false
";

// KEYS: value, version. ARGV: version ttl.
const DELETE_AND_BUMP: &str = r"
redis.call('DEL', KEYS[1])
redis.call('INCR', KEYS[2])
redis.call('PEXPIRE', KEYS[2], ARGV[1])
return 1
";

// KEYS: version, in-flight counter. ARGV: version ttl, in-flight ttl.
const BEGIN_WRITE: &str = r"
redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
redis.call('INCR', KEYS[2])
redis.call('PEXPIRE', KEYS[2], ARGV[2])
return 1
";

// KEYS: version, in-flight counter. ARGV: version ttl.
const END_WRITE: &str = r"
redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
if tonumber(redis.call('GET', KEYS[2]) or '0') > 1 then
    redis.call('DECR', KEYS[2])
else
    redis.call('DEL', KEYS[2])
end
return 1
";

// KEYS: version, in-flight counter.
const VERSION: &str = r"
if tonumber(redis.call('GET', KEYS[2]) or '0') > 0 then
    return false
end
return tonumber(redis.call('GET', KEYS[1]) or '0')
";

// KEYS: value, version, in-flight counter. ARGV: expected version, ttl, value.
const SET_IF_VERSION: &str = r"
if tonumber(redis.call('GET', KEYS[3]) or '0') > 0 then
    return 0
end
if tonumber(redis.call('GET', KEYS[2]) or '0') ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[2])
return 1
";

// KEYS: list, version, in-flight counter. ARGV: expected version, ttl, values...
const LIST_REPLACE_IF_VERSION: &str = r"
if tonumber(redis.call('GET', KEYS[3]) or '0') > 0 then
    return 0
end
if tonumber(redis.call('GET', KEYS[2]) or '0') ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('DEL', KEYS[1])
if #ARGV > 2 then
    redis.call('RPUSH', KEYS[1], unpack(ARGV, 3))
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 1
";

fn version_key(key: &str) -> String {
    format!("{key}:version")
}

fn in_flight_key(key: &str) -> String {
    format!("{key}:writing")
}

fn unavailable(e: RedisError) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Cache on a shared Redis instance.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    incr_if_exists: Script,
    delete_and_bump: Script,
    begin_write: Script,
    end_write: Script,
    version: Script,
    set_if_version: Script,
    list_replace_if_version: Script,
}

impl RedisCache {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!(url, "Connected cache to Redis");
        Ok(Self {
            conn,
            incr_if_exists: Script::new(INCR_IF_EXISTS),
            delete_and_bump: Script::new(DELETE_AND_BUMP),
            begin_write: Script::new(BEGIN_WRITE),
            end_write: Script::new(END_WRITE),
            version: Script::new(VERSION),
            set_if_version: Script::new(SET_IF_VERSION),
            list_replace_if_version: Script::new(LIST_REPLACE_IF_VERSION),
        })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(unavailable)?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(values)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_ms(ttl));
        }
        let () = cmd.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .delete_and_bump
            .key(key)
            .key(version_key(key))
            .arg(ttl_ms(VERSION_TTL))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| match e.kind() {
                redis::ErrorKind::ResponseError => CacheError::NotAnInteger(key.to_string()),
                _ => unavailable(e),
            })?;
        Ok(value)
    }

    async fn incr_if_exists(&self, key: &str, delta: i64) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = self
            .incr_if_exists
            .key(key)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| match e.kind() {
                redis::ErrorKind::ResponseError => CacheError::NotAnInteger(key.to_string()),
                _ => unavailable(e),
            })?;
        Ok(value)
    }

    async fn list_push_trim(
        &self,
        key: &str,
        value: String,
        keep: usize,
    ) -> Result<Option<usize>, CacheError> {
        let mut conn = self.conn.clone();
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        // RPUSHX leaves a missing list missing; LTRIM on it is a no-op.
        let (len,): (usize,) = redis::pipe()
            .atomic()
            .cmd("RPUSHX")
            .arg(key)
            .arg(value)
            .cmd("LTRIM")
            .arg(key)
            .arg(-keep)
            .arg(-1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(len.min(usize::try_from(keep).unwrap_or(usize::MAX))))
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(key, 0, -1).await.map_err(unavailable)?;
        Ok(values)
    }

    async fn list_replace(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        if !values.is_empty() {
            pipe.cmd("RPUSH").arg(key).arg(values).ignore();
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE").arg(key).arg(ttl_ms(ttl)).ignore();
            }
        }
        let () = pipe.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let updated: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(updated)
    }

    async fn version(&self, key: &str) -> Result<Option<u64>, CacheError> {
        let mut conn = self.conn.clone();
        let version: Option<u64> = self
            .version
            .key(version_key(key))
            .key(in_flight_key(key))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(version)
    }

    async fn begin_write(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .begin_write
            .key(version_key(key))
            .key(in_flight_key(key))
            .arg(ttl_ms(VERSION_TTL))
            .arg(ttl_ms(PATCH_GUARD_TTL))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn end_write(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .end_write
            .key(version_key(key))
            .key(in_flight_key(key))
            .arg(ttl_ms(VERSION_TTL))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn set_if_version(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        version: u64,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .set_if_version
            .key(key)
            .key(version_key(key))
            .key(in_flight_key(key))
            .arg(version)
            .arg(ttl_ms(ttl))
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(written == 1)
    }

    async fn list_replace_if_version(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
        version: u64,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.list_replace_if_version.prepare_invoke();
        invocation
            .key(key)
            .key(version_key(key))
            .key(in_flight_key(key))
            .arg(version)
            .arg(ttl_ms(ttl));
        for value in values {
            invocation.arg(value);
        }
        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(written == 1)
    }
}

/// Bus over Redis pub/sub.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisBus {
    /// Connect to `url` and use `channel` for all traffic.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(|e| BusError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        let channel = channel.into();
        info!(url, channel = %channel, "Connected bus to Redis");
        Ok(Self {
            client,
            conn,
            channel,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Unreadable bus payload");
                        continue;
                    }
                };
                match serde_json::from_str::<BusMessage>(&payload) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Undecodable bus message"),
                }
            }
            debug!(channel = %channel, "Bus subscription ended");
        });
        Ok(rx)
    }
}
