//! 下游事件管道端口
//!
//! 房间生命周期事件与聊天消息投递给外部消费者（地理索引写入方、
//! 历史归档等）。语义是至少一次、尽力而为：投递失败记录日志，
//! 不回滚已提交的业务状态。

use domain::{RoomEvent, RoomMessage};

use crate::error::ApplicationError;

#[async_trait::async_trait]
pub trait EventPipeline: Send + Sync {
    async fn room_event(&self, event: &RoomEvent) -> Result<(), ApplicationError>;

    async fn chat_message(&self, message: &RoomMessage) -> Result<(), ApplicationError>;
}

/// 空实现，单机开发和测试时使用。
#[derive(Debug, Default, Clone)]
pub struct NoopEventPipeline;

#[async_trait::async_trait]
impl EventPipeline for NoopEventPipeline {
    async fn room_event(&self, _event: &RoomEvent) -> Result<(), ApplicationError> {
        Ok(())
    }

    async fn chat_message(&self, _message: &RoomMessage) -> Result<(), ApplicationError> {
        Ok(())
    }
}
