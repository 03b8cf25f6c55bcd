//! 跨实例消息代理端口
//!
//! 每个房间对应一个频道 `room:{roomId}:pubsub`。网关在房间第一个本地
//! 成员加入时订阅，最后一个成员离开时退订。Redis 实现位于基础设施层，
//! 本地实现用进程内广播通道模拟多实例扇出。

use std::collections::HashMap;
use std::sync::Mutex;

use domain::{RoomId, RoomMessage};
use tokio::sync::broadcast;

use crate::error::ApplicationError;

/// 房间频道名
pub fn room_channel(room_id: RoomId) -> String {
    format!("room:{}:pubsub", room_id)
}

/// 消息代理端口。subscribe 返回的接收端在 unsubscribe 后收到 Closed。
#[async_trait::async_trait]
pub trait RoomBroker: Send + Sync {
    async fn publish(&self, message: &RoomMessage) -> Result<(), ApplicationError>;

    async fn subscribe(
        &self,
        room_id: RoomId,
    ) -> Result<broadcast::Receiver<RoomMessage>, ApplicationError>;

    async fn unsubscribe(&self, room_id: RoomId) -> Result<(), ApplicationError>;
}

/// 进程内代理。同一个实例挂多个网关注册表即可模拟多实例部署。
#[derive(Default)]
pub struct LocalRoomBroker {
    channels: Mutex<HashMap<RoomId, broadcast::Sender<RoomMessage>>>,
}

impl LocalRoomBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RoomBroker for LocalRoomBroker {
    async fn publish(&self, message: &RoomMessage) -> Result<(), ApplicationError> {
        let channels = self.channels.lock().expect("broker poisoned");
        if let Some(sender) = channels.get(&message.room_id()) {
            // 没有订阅者不算错误，消息本来就是尽力投递
            let _ = sender.send(message.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: RoomId,
    ) -> Result<broadcast::Receiver<RoomMessage>, ApplicationError> {
        let mut channels = self.channels.lock().expect("broker poisoned");
        let sender = channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(256).0);
        Ok(sender.subscribe())
    }

    async fn unsubscribe(&self, room_id: RoomId) -> Result<(), ApplicationError> {
        let mut channels = self.channels.lock().expect("broker poisoned");
        channels.remove(&room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::UserId;

    fn message(room_id: RoomId, sender_id: UserId, content: &str) -> RoomMessage {
        RoomMessage::message(
            room_id,
            sender_id,
            content.to_string(),
            "text".to_string(),
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn published_messages_reach_all_subscribers() {
        let broker = LocalRoomBroker::new();
        let room_id = RoomId::from(uuid::Uuid::new_v4());

        let mut rx_a = broker.subscribe(room_id).await.unwrap();
        let mut rx_b = broker.subscribe(room_id).await.unwrap();

        let msg = message(room_id, UserId::from(uuid::Uuid::new_v4()), "hello");
        broker.publish(&msg).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), msg);
        assert_eq!(rx_b.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let broker = LocalRoomBroker::new();
        let room_a = RoomId::from(uuid::Uuid::new_v4());
        let room_b = RoomId::from(uuid::Uuid::new_v4());

        let mut rx_a = broker.subscribe(room_a).await.unwrap();
        let _rx_b = broker.subscribe(room_b).await.unwrap();

        broker
            .publish(&message(room_b, UserId::from(uuid::Uuid::new_v4()), "b"))
            .await
            .unwrap();

        assert!(matches!(
            rx_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_closes_receivers() {
        let broker = LocalRoomBroker::new();
        let room_id = RoomId::from(uuid::Uuid::new_v4());

        let mut rx = broker.subscribe(room_id).await.unwrap();
        broker.unsubscribe(room_id).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let broker = LocalRoomBroker::new();
        let msg = message(
            RoomId::from(uuid::Uuid::new_v4()),
            UserId::from(uuid::Uuid::new_v4()),
            "nobody home",
        );
        broker.publish(&msg).await.unwrap();
    }

    #[test]
    fn channel_name_convention() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            room_channel(RoomId::from(id)),
            format!("room:{}:pubsub", id)
        );
    }
}
