//! 房间生命周期事件
//!
//! 事务引擎在提交后发出这些事件；外部的地理索引更新器与归档管道以
//! 至少一次语义消费，消费端必须幂等。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, UserId};

/// 房间生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RoomEvent {
    /// 房间创建完成
    #[serde(rename = "room-created", rename_all = "camelCase")]
    RoomCreated {
        room_id: RoomId,
        name: String,
        lat: f64,
        lng: f64,
        created_by: UserId,
        expires_at: Option<DateTime<Utc>>,
    },
    /// 成员计数变化（加入或离开之后的最新值）
    #[serde(rename = "room-membercount", rename_all = "camelCase")]
    MemberCountChanged { room_id: RoomId, member_count: u32 },
    /// 房间软删除
    #[serde(rename = "room-deleted", rename_all = "camelCase")]
    RoomDeleted { room_id: RoomId },
}

impl RoomEvent {
    pub fn room_id(&self) -> RoomId {
        match self {
            Self::RoomCreated { room_id, .. }
            | Self::MemberCountChanged { room_id, .. }
            | Self::RoomDeleted { room_id } => *room_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn events_carry_kebab_case_tags() {
        let event = RoomEvent::MemberCountChanged {
            room_id: RoomId::new(Uuid::nil()),
            member_count: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "room-membercount");
        assert_eq!(json["memberCount"], 7);
    }
}
