//! 房间成员实体

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, UserId};

/// 单个房间的最大成员数
pub const MAX_MEMBERS: u32 = 50;

/// 单个房间的最大管理员数
pub const MAX_ADMINS: u32 = 5;

/// 成员角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomRole {
    Admin,
    Member,
}

impl RoomRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Member => "MEMBER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ADMIN" => Some(Self::Admin),
            "MEMBER" => Some(Self::Member),
            _ => None,
        }
    }
}

/// 房间成员，(user_id, room_id) 为复合标识，每个用户在一个房间最多一行。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub role: RoomRole,
    pub joined_at: DateTime<Utc>,
}

impl RoomMember {
    pub fn new(user_id: UserId, room_id: RoomId, role: RoomRole, joined_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            room_id,
            role,
            joined_at,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == RoomRole::Admin
    }
}
