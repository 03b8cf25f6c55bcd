//! 房间持久化端口
//!
//! 每个变更操作对应一个方法，适配器保证方法内部是一个事务：要么全部
//! 生效，要么在领域错误时完整回滚。Postgres 实现用行锁串行化对同一
//! 房间的并发变更，内存实现用互斥锁达到等价效果。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use domain::{
    DomainError, Room, RoomId, RoomMember, RoomRole, UserId, MAX_ADMINS,
};
use tokio::sync::Mutex;

use crate::error::ApplicationError;

#[async_trait::async_trait]
pub trait RoomStore: Send + Sync {
    /// 原子插入房间与创建者的 ADMIN 成员行。
    async fn insert_room(&self, room: &Room, creator: &RoomMember)
        -> Result<(), ApplicationError>;

    async fn fetch_room(&self, room_id: RoomId) -> Result<Option<Room>, ApplicationError>;

    async fn is_user_blacklisted(&self, user_id: UserId) -> Result<bool, ApplicationError>;

    /// 成员关系是否存在（网关 attach 前的准入检查）。
    async fn is_member(&self, room_id: RoomId, user_id: UserId)
        -> Result<bool, ApplicationError>;

    /// 加入房间，返回变更后的成员数。
    async fn join_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<u32, ApplicationError>;

    /// 离开房间，返回变更后的成员数。
    async fn leave_room(&self, room_id: RoomId, user_id: UserId)
        -> Result<u32, ApplicationError>;

    /// 提升普通成员为管理员。requester 必须已是该房间管理员。
    async fn promote_member(
        &self,
        room_id: RoomId,
        requester: UserId,
        target: UserId,
    ) -> Result<(), ApplicationError>;

    /// 撤销管理员。requester 与 target 都必须是管理员。
    async fn demote_admin(
        &self,
        room_id: RoomId,
        requester: UserId,
        target: UserId,
    ) -> Result<(), ApplicationError>;

    /// 批量移除普通成员（跳过管理员行），返回变更后的成员数。
    async fn remove_members(
        &self,
        room_id: RoomId,
        requester: UserId,
        targets: &[UserId],
    ) -> Result<u32, ApplicationError>;

    /// 软删除房间并清空成员行，不可逆。
    async fn delete_room(&self, room_id: RoomId, requester: UserId)
        -> Result<(), ApplicationError>;

    /// 所有未删除房间的列表（缓存层之下的原始查询）。
    async fn list_available(&self) -> Result<Vec<Room>, ApplicationError>;
}

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<RoomId, Room>,
    members: HashMap<RoomId, HashMap<UserId, RoomMember>>,
    blacklisted_users: HashSet<UserId>,
}

impl MemoryState {
    fn admin_count(&self, room_id: RoomId) -> u32 {
        self.members
            .get(&room_id)
            .map(|members| members.values().filter(|m| m.is_admin()).count() as u32)
            .unwrap_or(0)
    }

    fn live_room_mut(&mut self, room_id: RoomId) -> Result<&mut Room, DomainError> {
        match self.rooms.get_mut(&room_id) {
            Some(room) if !room.is_deleted => Ok(room),
            _ => Err(DomainError::RoomNotFound),
        }
    }

    fn require_admin(&self, room_id: RoomId, user_id: UserId, action: &str)
        -> Result<(), DomainError> {
        let is_admin = self
            .members
            .get(&room_id)
            .and_then(|members| members.get(&user_id))
            .map(RoomMember::is_admin)
            .unwrap_or(false);
        if is_admin {
            Ok(())
        } else {
            Err(DomainError::permission_denied(action))
        }
    }
}

/// 内存存储。整个状态在一把锁后面，每个方法等价于一个可串行化事务。
#[derive(Default)]
pub struct MemoryRoomStore {
    state: Mutex<MemoryState>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试辅助：把用户加入全局黑名单。
    pub async fn blacklist_user(&self, user_id: UserId) {
        self.state.lock().await.blacklisted_users.insert(user_id);
    }

    /// 测试辅助：直接改写房间行，模拟过期、拉黑等既成状态。
    pub async fn patch_room(&self, room_id: RoomId, patch: impl FnOnce(&mut Room)) {
        let mut state = self.state.lock().await;
        if let Some(room) = state.rooms.get_mut(&room_id) {
            patch(room);
        }
    }

    pub async fn member_rows(&self, room_id: RoomId) -> Vec<RoomMember> {
        let state = self.state.lock().await;
        state
            .members
            .get(&room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RoomStore for MemoryRoomStore {
    async fn insert_room(
        &self,
        room: &Room,
        creator: &RoomMember,
    ) -> Result<(), ApplicationError> {
        let mut state = self.state.lock().await;
        state.rooms.insert(room.id, room.clone());
        state
            .members
            .entry(room.id)
            .or_default()
            .insert(creator.user_id, creator.clone());
        Ok(())
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<Option<Room>, ApplicationError> {
        let state = self.state.lock().await;
        Ok(state.rooms.get(&room_id).cloned())
    }

    async fn is_user_blacklisted(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        let state = self.state.lock().await;
        Ok(state.blacklisted_users.contains(&user_id))
    }

    async fn is_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<bool, ApplicationError> {
        let state = self.state.lock().await;
        Ok(state
            .members
            .get(&room_id)
            .map(|members| members.contains_key(&user_id))
            .unwrap_or(false))
    }

    async fn join_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<u32, ApplicationError> {
        let mut state = self.state.lock().await;

        let already_member = state
            .members
            .get(&room_id)
            .map(|members| members.contains_key(&user_id))
            .unwrap_or(false);

        let room = state.live_room_mut(room_id)?;
        if already_member {
            return Err(DomainError::AlreadyMember.into());
        }
        room.ensure_joinable(now)?;

        room.member_count += 1;
        let member_count = room.member_count;
        state
            .members
            .entry(room_id)
            .or_default()
            .insert(user_id, RoomMember::new(user_id, room_id, RoomRole::Member, now));
        Ok(member_count)
    }

    async fn leave_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<u32, ApplicationError> {
        let mut state = self.state.lock().await;

        let removed = state
            .members
            .get_mut(&room_id)
            .and_then(|members| members.remove(&user_id));
        if removed.is_none() {
            return Err(DomainError::NotAMember.into());
        }

        let room = state.live_room_mut(room_id)?;
        room.member_count = room.member_count.saturating_sub(1);
        Ok(room.member_count)
    }

    async fn promote_member(
        &self,
        room_id: RoomId,
        requester: UserId,
        target: UserId,
    ) -> Result<(), ApplicationError> {
        let mut state = self.state.lock().await;
        state.live_room_mut(room_id)?;
        state.require_admin(room_id, requester, "promote")?;

        let admin_count = state.admin_count(room_id);
        let member = state
            .members
            .get_mut(&room_id)
            .and_then(|members| members.get_mut(&target))
            .ok_or(DomainError::NotAMember)?;
        if member.is_admin() {
            return Err(DomainError::AlreadyAdmin.into());
        }
        if admin_count >= MAX_ADMINS {
            return Err(DomainError::AdminQuotaExceeded {
                max_admins: MAX_ADMINS,
            }
            .into());
        }
        member.role = RoomRole::Admin;
        Ok(())
    }

    async fn demote_admin(
        &self,
        room_id: RoomId,
        requester: UserId,
        target: UserId,
    ) -> Result<(), ApplicationError> {
        let mut state = self.state.lock().await;
        state.live_room_mut(room_id)?;
        state.require_admin(room_id, requester, "demote")?;

        let member = state
            .members
            .get_mut(&room_id)
            .and_then(|members| members.get_mut(&target))
            .ok_or(DomainError::NotAMember)?;
        if !member.is_admin() {
            return Err(DomainError::validation("target is not an admin").into());
        }
        member.role = RoomRole::Member;
        Ok(())
    }

    async fn remove_members(
        &self,
        room_id: RoomId,
        requester: UserId,
        targets: &[UserId],
    ) -> Result<u32, ApplicationError> {
        let mut state = self.state.lock().await;
        state.live_room_mut(room_id)?;
        state.require_admin(room_id, requester, "remove members")?;

        let mut removed = 0u32;
        if let Some(members) = state.members.get_mut(&room_id) {
            for target in targets {
                // 管理员行不受批量移除影响
                let is_plain_member = members
                    .get(target)
                    .map(|m| !m.is_admin())
                    .unwrap_or(false);
                if is_plain_member {
                    members.remove(target);
                    removed += 1;
                }
            }
        }

        let room = state.live_room_mut(room_id)?;
        room.member_count = room.member_count.saturating_sub(removed);
        Ok(room.member_count)
    }

    async fn delete_room(
        &self,
        room_id: RoomId,
        requester: UserId,
    ) -> Result<(), ApplicationError> {
        let mut state = self.state.lock().await;
        state.live_room_mut(room_id)?;
        state.require_admin(room_id, requester, "delete room")?;

        state.members.remove(&room_id);
        let room = state.live_room_mut(room_id)?;
        room.is_deleted = true;
        room.member_count = 0;
        Ok(())
    }

    async fn list_available(&self) -> Result<Vec<Room>, ApplicationError> {
        let state = self.state.lock().await;
        let mut rooms: Vec<Room> = state
            .rooms
            .values()
            .filter(|room| !room.is_deleted)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rooms)
    }
}
