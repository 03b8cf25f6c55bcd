//! 基础设施层：应用层端口的 Redis 与 Postgres 适配器。

pub mod pg;
pub mod redis;

pub use pg::{create_pg_pool, PgRoomStore};
pub use redis::{
    connect_redis, RedisCacheStore, RedisEventPipeline, RedisGeoCellStore,
    RedisPresenceTracker, RedisRoomBroker,
};

/// 数据库迁移，启动时执行
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
