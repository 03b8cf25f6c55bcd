//! 房间实体与可加入规则

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::ids::{RoomId, UserId};
use crate::room_member::MAX_MEMBERS;

/// 新建房间的固定生命周期（小时）
pub const ROOM_LIFETIME_HOURS: i64 = 24;

/// 位置绑定的临时聊天室。
///
/// `member_count` 是反范式化计数器，只能与成员行在同一行锁下一起变更。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub img: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub member_count: u32,
    pub max_members: u32,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    /// None 表示永不过期
    pub expires_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub is_blacklisted: bool,
}

impl Room {
    /// 创建新房间。创建者立即成为唯一成员，所以 member_count 从 1 开始。
    pub fn create(
        id: RoomId,
        name: String,
        img: Option<String>,
        lat: f64,
        lng: f64,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if name.trim().is_empty() {
            return Err(DomainError::validation("room name must not be empty"));
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(DomainError::validation("coordinates out of range"));
        }

        Ok(Self {
            id,
            name,
            img,
            lat,
            lng,
            member_count: 1,
            max_members: MAX_MEMBERS,
            created_by,
            created_at: now,
            expires_at: Some(now + Duration::hours(ROOM_LIFETIME_HOURS)),
            is_deleted: false,
            is_blacklisted: false,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    /// 可加入判定，返回第一个不满足的具体原因。
    pub fn ensure_joinable(&self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_deleted {
            return Err(DomainError::RoomNotFound);
        }
        if self.is_blacklisted {
            return Err(DomainError::Blacklisted);
        }
        if self.is_expired(now) {
            return Err(DomainError::RoomExpired);
        }
        if self.member_count >= self.max_members {
            return Err(DomainError::RoomFull {
                max_members: self.max_members,
            });
        }
        Ok(())
    }
}
