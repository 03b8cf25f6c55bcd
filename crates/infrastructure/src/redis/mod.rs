//! Redis 适配器：缓存、消息代理、地理索引读取、在线集合、事件管道。

mod broker;
mod cache_store;
mod geo_store;
mod pipeline;
mod presence;

pub use broker::RedisRoomBroker;
pub use cache_store::RedisCacheStore;
pub use geo_store::RedisGeoCellStore;
pub use pipeline::RedisEventPipeline;
pub use presence::RedisPresenceTracker;

use application::ApplicationError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::info;

pub(crate) fn map_redis_err(err: redis::RedisError) -> ApplicationError {
    ApplicationError::cache(err.to_string())
}

/// 打开客户端并建立带自动重连的连接。
pub async fn connect_redis(url: &str) -> Result<(Client, ConnectionManager), ApplicationError> {
    let client = Client::open(url).map_err(map_redis_err)?;
    let manager = client
        .get_connection_manager()
        .await
        .map_err(map_redis_err)?;
    info!("Redis 连接建立成功");
    Ok((client, manager))
}
