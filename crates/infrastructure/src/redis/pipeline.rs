//! 事件管道的 Redis 实现
//!
//! 生命周期事件与聊天消息发布到固定频道，由外部消费者（地理索引
//! 更新器、归档服务）以至少一次语义处理。

use application::{ApplicationError, EventPipeline};
use domain::{RoomEvent, RoomMessage};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::map_redis_err;

const ROOM_EVENTS_CHANNEL: &str = "events:rooms";
const MESSAGE_ARCHIVE_CHANNEL: &str = "events:messages";

#[derive(Clone)]
pub struct RedisEventPipeline {
    conn: ConnectionManager,
}

impl RedisEventPipeline {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(channel, payload)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventPipeline for RedisEventPipeline {
    async fn room_event(&self, event: &RoomEvent) -> Result<(), ApplicationError> {
        self.publish(ROOM_EVENTS_CHANNEL, serde_json::to_string(event)?)
            .await
    }

    async fn chat_message(&self, message: &RoomMessage) -> Result<(), ApplicationError> {
        self.publish(MESSAGE_ARCHIVE_CHANNEL, serde_json::to_string(message)?)
            .await
    }
}
