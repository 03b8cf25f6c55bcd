//! 主应用程序入口
//!
//! 装配 Postgres/Redis 适配器与网关，启动 Axum 服务。

use std::sync::Arc;

use application::{Cache, EventPipeline, GeoLookupService, RoomService};
use config::AppConfig;
use gateway::{build_router, AppState, RoomRegistry, SessionVerifier};
use infrastructure::{
    connect_redis, create_pg_pool, PgRoomStore, RedisCacheStore, RedisEventPipeline,
    RedisGeoCellStore, RedisPresenceTracker, RedisRoomBroker, MIGRATOR,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let app_config = AppConfig::from_env()?;
    app_config.validate()?;

    tracing::info!(
        "连接数据库: {}",
        app_config.database.url.split('@').next_back().unwrap_or("unknown")
    );
    let pg_pool = create_pg_pool(&app_config.database.url, app_config.database.max_connections)
        .await?;
    MIGRATOR.run(&pg_pool).await?;

    let (redis_client, redis_conn) = connect_redis(&app_config.redis.url)
        .await
        .map_err(|err| anyhow::anyhow!("redis connection failed: {err}"))?;

    // 存储与端口适配器
    let store = Arc::new(PgRoomStore::new(pg_pool));
    let cache = Cache::new(Arc::new(RedisCacheStore::new(redis_conn.clone())));
    let pipeline: Arc<dyn EventPipeline> =
        Arc::new(RedisEventPipeline::new(redis_conn.clone()));
    let broker = Arc::new(
        RedisRoomBroker::connect(&redis_client)
            .await
            .map_err(|err| anyhow::anyhow!("redis pubsub failed: {err}"))?,
    );
    let presence = Arc::new(RedisPresenceTracker::new(redis_conn.clone()));
    let geo_store = Arc::new(RedisGeoCellStore::new(redis_conn));

    // 应用层服务与网关
    let rooms = Arc::new(RoomService::new(store.clone(), cache, pipeline.clone()));
    let geo = Arc::new(GeoLookupService::new(geo_store));
    let registry = Arc::new(RoomRegistry::new(store, broker, presence, pipeline));
    let verifier = SessionVerifier::new(&app_config.session.secret);

    let app = build_router(AppState::new(rooms, geo, registry, verifier));

    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("附近聊天室服务启动在 http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
