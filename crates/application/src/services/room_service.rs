//! 房间生命周期用例
//!
//! 编排存储、缓存与事件管道：业务规则在存储事务内裁决，生命周期事件
//! 提交后尽力投递，可缓存的列表查询走防击穿缓存。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use domain::{
    DomainError, Room, RoomEvent, RoomId, RoomMember, RoomRole, UserId,
};
use tracing::warn;
use uuid::Uuid;

use crate::cache::{Cache, CacheOptions};
use crate::error::ApplicationError;
use crate::pipeline::EventPipeline;
use crate::repository::RoomStore;

/// 可用房间列表的缓存参数
const AVAILABLE_TTL: Duration = Duration::from_secs(300);
const AVAILABLE_LOCK_TTL: Duration = Duration::from_secs(10);

const CACHE_KIND_ROOMS: &str = "rooms";
const CACHE_ARG_AVAILABLE: &str = "available";

pub struct RoomService {
    store: Arc<dyn RoomStore>,
    cache: Cache,
    pipeline: Arc<dyn EventPipeline>,
}

impl RoomService {
    pub fn new(store: Arc<dyn RoomStore>, cache: Cache, pipeline: Arc<dyn EventPipeline>) -> Self {
        Self {
            store,
            cache,
            pipeline,
        }
    }

    /// 创建房间，创建者立即成为 ADMIN 成员。
    pub async fn create_room(
        &self,
        creator: UserId,
        name: String,
        img: Option<String>,
        lat: f64,
        lng: f64,
    ) -> Result<Room, ApplicationError> {
        if self.store.is_user_blacklisted(creator).await? {
            return Err(DomainError::Blacklisted.into());
        }

        let now = Utc::now();
        let room = Room::create(RoomId::new(Uuid::new_v4()), name, img, lat, lng, creator, now)?;
        let admin = RoomMember::new(creator, room.id, RoomRole::Admin, now);
        self.store.insert_room(&room, &admin).await?;

        self.emit(RoomEvent::RoomCreated {
            room_id: room.id,
            name: room.name.clone(),
            lat: room.lat,
            lng: room.lng,
            created_by: creator,
            expires_at: room.expires_at,
        })
        .await;
        self.invalidate_available().await;

        Ok(room)
    }

    /// 加入房间，返回变更后的成员数。
    pub async fn join_room(&self, room_id: RoomId, user_id: UserId)
        -> Result<u32, ApplicationError> {
        let member_count = self.store.join_room(room_id, user_id, Utc::now()).await?;
        self.emit(RoomEvent::MemberCountChanged {
            room_id,
            member_count,
        })
        .await;
        Ok(member_count)
    }

    /// 离开房间，返回变更后的成员数。
    pub async fn leave_room(&self, room_id: RoomId, user_id: UserId)
        -> Result<u32, ApplicationError> {
        let member_count = self.store.leave_room(room_id, user_id).await?;
        self.emit(RoomEvent::MemberCountChanged {
            room_id,
            member_count,
        })
        .await;
        Ok(member_count)
    }

    pub async fn promote_member(
        &self,
        room_id: RoomId,
        requester: UserId,
        target: UserId,
    ) -> Result<(), ApplicationError> {
        self.store.promote_member(room_id, requester, target).await
    }

    pub async fn demote_admin(
        &self,
        room_id: RoomId,
        requester: UserId,
        target: UserId,
    ) -> Result<(), ApplicationError> {
        self.store.demote_admin(room_id, requester, target).await
    }

    pub async fn remove_members(
        &self,
        room_id: RoomId,
        requester: UserId,
        targets: &[UserId],
    ) -> Result<u32, ApplicationError> {
        let member_count = self.store.remove_members(room_id, requester, targets).await?;
        self.emit(RoomEvent::MemberCountChanged {
            room_id,
            member_count,
        })
        .await;
        Ok(member_count)
    }

    /// 软删除房间，不可逆。
    pub async fn delete_room(&self, room_id: RoomId, requester: UserId)
        -> Result<(), ApplicationError> {
        self.store.delete_room(room_id, requester).await?;
        self.emit(RoomEvent::RoomDeleted { room_id }).await;
        self.invalidate_available().await;
        Ok(())
    }

    /// 用户是否为房间的持久化成员。
    pub async fn is_member(&self, room_id: RoomId, user_id: UserId)
        -> Result<bool, ApplicationError> {
        self.store.is_member(room_id, user_id).await
    }

    /// 所有未删除房间，走防击穿缓存。
    pub async fn available_rooms(&self) -> Result<Vec<Room>, ApplicationError> {
        let store = self.store.clone();
        self.cache
            .get_or_set(
                CACHE_KIND_ROOMS,
                &[CACHE_ARG_AVAILABLE],
                move || {
                    let store = store.clone();
                    async move { store.list_available().await }
                },
                CacheOptions {
                    ttl: AVAILABLE_TTL,
                    lock_ttl: AVAILABLE_LOCK_TTL,
                    ..CacheOptions::default()
                },
            )
            .await
    }

    async fn invalidate_available(&self) {
        if let Err(err) = self.cache.del(CACHE_KIND_ROOMS, &[CACHE_ARG_AVAILABLE]).await {
            warn!(error = %err, "清除可用房间缓存失败");
        }
    }

    async fn emit(&self, event: RoomEvent) {
        // 至少一次、尽力投递；失败不影响已提交的业务状态
        if let Err(err) = self.pipeline.room_event(&event).await {
            warn!(room_id = %event.room_id(), error = %err, "投递房间事件失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::pipeline::NoopEventPipeline;
    use crate::repository::MemoryRoomStore;
    use std::sync::Mutex;

    struct RecordingPipeline {
        events: Mutex<Vec<RoomEvent>>,
    }

    impl RecordingPipeline {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn take(&self) -> Vec<RoomEvent> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    #[async_trait::async_trait]
    impl EventPipeline for RecordingPipeline {
        async fn room_event(&self, event: &RoomEvent) -> Result<(), ApplicationError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn chat_message(
            &self,
            _message: &domain::RoomMessage,
        ) -> Result<(), ApplicationError> {
            Ok(())
        }
    }

    fn service_with(
        store: Arc<MemoryRoomStore>,
        pipeline: Arc<RecordingPipeline>,
    ) -> RoomService {
        RoomService::new(
            store,
            Cache::new(Arc::new(MemoryCacheStore::new())),
            pipeline,
        )
    }

    fn user() -> UserId {
        UserId::new(Uuid::new_v4())
    }

    #[tokio::test]
    async fn create_emits_event_and_seeds_admin() {
        let store = Arc::new(MemoryRoomStore::new());
        let pipeline = Arc::new(RecordingPipeline::new());
        let service = service_with(store.clone(), pipeline.clone());

        let creator = user();
        let room = service
            .create_room(creator, "yard".into(), None, 52.52, 13.405)
            .await
            .unwrap();

        assert_eq!(room.member_count, 1);
        let rows = store.member_rows(room.id).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_admin());

        let events = pipeline.take();
        assert!(matches!(events[0], RoomEvent::RoomCreated { room_id, .. } if room_id == room.id));
    }

    #[tokio::test]
    async fn blacklisted_creator_is_rejected() {
        let store = Arc::new(MemoryRoomStore::new());
        let service = service_with(store.clone(), Arc::new(RecordingPipeline::new()));

        let creator = user();
        store.blacklist_user(creator).await;

        let err = service
            .create_room(creator, "yard".into(), None, 0.0, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::Blacklisted)
        ));
    }

    #[tokio::test]
    async fn membership_changes_emit_member_count() {
        let store = Arc::new(MemoryRoomStore::new());
        let pipeline = Arc::new(RecordingPipeline::new());
        let service = service_with(store, pipeline.clone());

        let creator = user();
        let room = service
            .create_room(creator, "yard".into(), None, 0.0, 0.0)
            .await
            .unwrap();
        pipeline.take();

        let joiner = user();
        service.join_room(room.id, joiner).await.unwrap();
        service.leave_room(room.id, joiner).await.unwrap();

        let counts: Vec<u32> = pipeline
            .take()
            .into_iter()
            .map(|e| match e {
                RoomEvent::MemberCountChanged { member_count, .. } => member_count,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(counts, vec![2, 1]);
    }

    #[tokio::test]
    async fn available_rooms_cache_is_invalidated_by_lifecycle() {
        let store = Arc::new(MemoryRoomStore::new());
        let service = RoomService::new(
            store,
            Cache::new(Arc::new(MemoryCacheStore::new())),
            Arc::new(NoopEventPipeline),
        );

        assert!(service.available_rooms().await.unwrap().is_empty());

        // 创建使缓存失效，下一次读取看到新房间
        let room = service
            .create_room(user(), "yard".into(), None, 0.0, 0.0)
            .await
            .unwrap();
        let listed = service.available_rooms().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, room.id);

        // 删除同样使缓存失效
        service.delete_room(room.id, room.created_by).await.unwrap();
        assert!(service.available_rooms().await.unwrap().is_empty());
    }
}
