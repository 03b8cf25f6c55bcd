//! 房间消息的共享频道载荷
//!
//! 每条消息以 JSON 形式发布到 `room:{roomId}:pubsub`，所有实例的订阅回调
//! 反序列化同一结构。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, UserId};

/// 发布到共享频道的消息，封闭的 tagged 变体。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RoomMessage {
    #[serde(rename = "MESSAGE", rename_all = "camelCase")]
    Message {
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        /// 客户端定义的展示类型（text/image/...），服务端不解释
        #[serde(rename = "type")]
        kind: String,
        created_at: DateTime<Utc>,
    },
}

impl RoomMessage {
    pub fn message(
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        kind: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::Message {
            room_id,
            sender_id,
            content,
            kind,
            created_at,
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            Self::Message { sender_id, .. } => *sender_id,
        }
    }

    pub fn room_id(&self) -> RoomId {
        match self {
            Self::Message { room_id, .. } => *room_id,
        }
    }
}
