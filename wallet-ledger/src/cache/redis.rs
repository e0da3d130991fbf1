use super::{CacheBackend, CacheError};
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Redis-backed cache
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
}

impl RedisCache {
    pub fn new(redis: ConnectionManager) -> Self {
        RedisCache { redis }
    }

    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        info!("Connected to Redis cache");
        Ok(RedisCache { redis })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let value: Option<String> = self.redis.clone().get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        // SETEX rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        let _: () = self.redis.clone().set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let _: () = self.redis.clone().del(keys).await?;
        Ok(())
    }
}
