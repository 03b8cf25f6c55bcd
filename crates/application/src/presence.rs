//! 房间在线连接集合端口
//!
//! 记录每个房间当前活跃的 socket，键空间 `room:{roomId}:members`。
//! 与持久化的成员关系不同，这里只反映存活连接，纯记账用途，
//! 不在扇出路径上。

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use domain::{ConnectionId, RoomId};

use crate::error::ApplicationError;

#[async_trait::async_trait]
pub trait PresenceTracker: Send + Sync {
    async fn add(&self, room_id: RoomId, conn_id: ConnectionId) -> Result<(), ApplicationError>;

    async fn remove(&self, room_id: RoomId, conn_id: ConnectionId)
        -> Result<(), ApplicationError>;

    async fn members(&self, room_id: RoomId) -> Result<Vec<ConnectionId>, ApplicationError>;
}

/// 内存实现，用于测试和单机开发。
#[derive(Default)]
pub struct MemoryPresenceTracker {
    rooms: Mutex<HashMap<RoomId, HashSet<ConnectionId>>>,
}

impl MemoryPresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PresenceTracker for MemoryPresenceTracker {
    async fn add(&self, room_id: RoomId, conn_id: ConnectionId) -> Result<(), ApplicationError> {
        let mut rooms = self.rooms.lock().expect("presence poisoned");
        rooms.entry(room_id).or_default().insert(conn_id);
        Ok(())
    }

    async fn remove(
        &self,
        room_id: RoomId,
        conn_id: ConnectionId,
    ) -> Result<(), ApplicationError> {
        let mut rooms = self.rooms.lock().expect("presence poisoned");
        if let Some(members) = rooms.get_mut(&room_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&room_id);
            }
        }
        Ok(())
    }

    async fn members(&self, room_id: RoomId) -> Result<Vec<ConnectionId>, ApplicationError> {
        let rooms = self.rooms.lock().expect("presence poisoned");
        Ok(rooms
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }
}
