//! 缓存后端的 Redis 实现

use std::time::Duration;

use application::{ApplicationError, CacheStore};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::map_redis_err;

#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ApplicationError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_redis_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.conn.clone();
        // SET .. PX .. NX 返回 OK 或 nil
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(map_redis_err)?;
        Ok(())
    }
}
