//! Backend selection.

use crate::config::{CacheBackend, Config, DEV_SECRET};
use anyhow::{Context, Result};
use parley_core::{
    Backends, Bus, Cache, JwtVerifier, MemoryCache, MemoryStore, RedisBus, RedisCache, UserStore,
};
use parley_protocol::User;
use std::sync::Arc;
use tracing::{info, warn};

/// Build the collaborators named by the configuration.
///
/// # Errors
///
/// Returns an error if a Redis backend cannot be reached.
pub async fn build(config: &Config) -> Result<Backends> {
    if config.auth.jwt_secret == DEV_SECRET {
        warn!("Using the development JWT secret; set PARLEY__AUTH__JWT_SECRET");
    }
    let verifier = Arc::new(JwtVerifier::new(&config.auth.jwt_secret, config.auth.leeway_secs));

    let store = Arc::new(MemoryStore::new());
    for seed in &config.users {
        let user = User {
            id: seed.id.as_str().into(),
            display_name: seed.display_name.clone(),
            avatar_ref: seed.avatar_ref.clone(),
        };
        store.create_user(user).await?;
    }
    info!(users = config.users.len(), "User store ready");

    let cache: Arc<dyn Cache> = match config.cache.backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::Redis => {
            let url = config.cache.redis_url.as_deref().unwrap_or_default();
            let cache = RedisCache::connect(url)
                .await
                .context("Failed to connect the Redis cache")?;
            info!("Using Redis cache");
            Arc::new(cache)
        }
    };

    let bus: Option<Arc<dyn Bus>> = match (&config.bus.redis_url, config.bus.enabled) {
        (Some(url), true) => {
            let bus = RedisBus::connect(url, config.bus.channel.clone())
                .await
                .context("Failed to connect the Redis bus")?;
            info!(channel = %config.bus.channel, "Using Redis bus");
            Some(Arc::new(bus) as Arc<dyn Bus>)
        }
        _ => None,
    };

    Ok(Backends {
        verifier,
        users: store.clone(),
        chats: store,
        cache,
        bus,
    })
}
