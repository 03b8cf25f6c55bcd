//! 消息代理的 Redis Pub/Sub 实现
//!
//! 一条专用的 pub/sub 连接被拆分为发送端（运行时动态订阅/退订）和
//! 接收端（后台路由任务）。收到的消息按载荷里的房间号派发到对应的
//! 进程内广播通道，网关从那里扇出给本地连接。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use application::{broker::room_channel, ApplicationError, RoomBroker};
use domain::{RoomId, RoomMessage};
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::AsyncCommands;
use redis::Client;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::map_redis_err;

fn map_broker_err(err: redis::RedisError) -> ApplicationError {
    ApplicationError::broker(err.to_string())
}

type ChannelMap = Arc<Mutex<HashMap<RoomId, broadcast::Sender<RoomMessage>>>>;

pub struct RedisRoomBroker {
    publish_conn: ConnectionManager,
    sink: tokio::sync::Mutex<PubSubSink>,
    channels: ChannelMap,
}

impl RedisRoomBroker {
    pub async fn connect(client: &Client) -> Result<Self, ApplicationError> {
        let publish_conn = client
            .get_connection_manager()
            .await
            .map_err(map_redis_err)?;
        let pubsub = client.get_async_pubsub().await.map_err(map_broker_err)?;
        let (sink, stream) = pubsub.split();

        let channels: ChannelMap = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(Self::route_messages(stream, channels.clone()));

        Ok(Self {
            publish_conn,
            sink: tokio::sync::Mutex::new(sink),
            channels,
        })
    }

    /// 后台路由循环：pub/sub 消息按房间派发到进程内通道。
    async fn route_messages(mut stream: PubSubStream, channels: ChannelMap) {
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    error!(error = %err, "读取 pub/sub 载荷失败");
                    continue;
                }
            };
            let message: RoomMessage = match serde_json::from_str(&payload) {
                Ok(message) => message,
                Err(err) => {
                    warn!(
                        channel = msg.get_channel_name(),
                        error = %err,
                        "丢弃无法解析的频道消息"
                    );
                    continue;
                }
            };

            let sender = {
                let channels = channels.lock().expect("broker channels poisoned");
                channels.get(&message.room_id()).cloned()
            };
            match sender {
                // 本实例已无订阅者时消息直接丢弃
                Some(sender) => {
                    let _ = sender.send(message);
                }
                None => debug!(room_id = %message.room_id(), "收到未订阅房间的消息"),
            }
        }
        warn!("Redis pub/sub 流已结束");
    }
}

#[async_trait::async_trait]
impl RoomBroker for RedisRoomBroker {
    async fn publish(&self, message: &RoomMessage) -> Result<(), ApplicationError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.publish_conn.clone();
        let _: () = conn
            .publish(room_channel(message.room_id()), payload)
            .await
            .map_err(map_broker_err)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: RoomId,
    ) -> Result<broadcast::Receiver<RoomMessage>, ApplicationError> {
        let receiver = {
            let mut channels = self.channels.lock().expect("broker channels poisoned");
            channels
                .entry(room_id)
                .or_insert_with(|| broadcast::channel(256).0)
                .subscribe()
        };

        let mut sink = self.sink.lock().await;
        sink.subscribe(room_channel(room_id))
            .await
            .map_err(map_broker_err)?;
        debug!(room_id = %room_id, "已订阅房间频道");
        Ok(receiver)
    }

    async fn unsubscribe(&self, room_id: RoomId) -> Result<(), ApplicationError> {
        {
            let mut channels = self.channels.lock().expect("broker channels poisoned");
            channels.remove(&room_id);
        }

        let mut sink = self.sink.lock().await;
        sink.unsubscribe(room_channel(room_id))
            .await
            .map_err(map_broker_err)?;
        debug!(room_id = %room_id, "已退订房间频道");
        Ok(())
    }
}
