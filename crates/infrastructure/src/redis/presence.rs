//! 在线连接集合的 Redis 实现，`room:{roomId}:members` 集合。

use application::{ApplicationError, PresenceTracker};
use domain::{ConnectionId, RoomId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::map_redis_err;

fn members_key(room_id: RoomId) -> String {
    format!("room:{room_id}:members")
}

#[derive(Clone)]
pub struct RedisPresenceTracker {
    conn: ConnectionManager,
}

impl RedisPresenceTracker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl PresenceTracker for RedisPresenceTracker {
    async fn add(&self, room_id: RoomId, conn_id: ConnectionId)
        -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .sadd(members_key(room_id), conn_id.to_string())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn remove(
        &self,
        room_id: RoomId,
        conn_id: ConnectionId,
    ) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .srem(members_key(room_id), conn_id.to_string())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn members(&self, room_id: RoomId) -> Result<Vec<ConnectionId>, ApplicationError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .smembers(members_key(room_id))
            .await
            .map_err(map_redis_err)?;
        Ok(raw
            .into_iter()
            .filter_map(|id| id.parse::<Uuid>().ok())
            .map(ConnectionId::from)
            .collect())
    }
}
