//! 连接注册表与房间扇出
//!
//! 每个实例维护 `房间 -> 本地连接` 的映射。房间的第一个本地连接触发
//! 对代理频道的订阅，最后一个离开触发恰好一次退订。入站的代理消息由
//! 每房间一个的扇出任务投递给除发送者本人之外的所有本地连接。

use std::collections::HashMap;
use std::sync::Arc;

use application::{
    ApplicationError, EventPipeline, PresenceTracker, RoomBroker, RoomStore,
};
use chrono::Utc;
use domain::{ConnectionId, DomainError, RoomId, RoomMessage, UserId};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

/// 出站帧通道，socket 发送任务从另一端消费。
pub type OutboundSender = mpsc::UnboundedSender<String>;

#[derive(Clone)]
struct LocalConn {
    user_id: UserId,
    sender: OutboundSender,
}

struct RoomEntry {
    connections: HashMap<ConnectionId, LocalConn>,
    fanout: tokio::task::JoinHandle<()>,
}

type Rooms = Arc<RwLock<HashMap<RoomId, RoomEntry>>>;

pub struct RoomRegistry {
    store: Arc<dyn RoomStore>,
    broker: Arc<dyn RoomBroker>,
    presence: Arc<dyn PresenceTracker>,
    pipeline: Arc<dyn EventPipeline>,
    rooms: Rooms,
}

impl RoomRegistry {
    pub fn new(
        store: Arc<dyn RoomStore>,
        broker: Arc<dyn RoomBroker>,
        presence: Arc<dyn PresenceTracker>,
        pipeline: Arc<dyn EventPipeline>,
    ) -> Self {
        Self {
            store,
            broker,
            presence,
            pipeline,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 把连接挂入房间的本地集合。前提是持久化的成员关系已存在。
    pub async fn attach(
        &self,
        conn_id: ConnectionId,
        user_id: UserId,
        sender: OutboundSender,
        room_id: RoomId,
    ) -> Result<(), ApplicationError> {
        if !self.store.is_member(room_id, user_id).await? {
            return Err(DomainError::NotAMember.into());
        }

        {
            let mut rooms = self.rooms.write().await;
            if !rooms.contains_key(&room_id) {
                // 房间的第一个本地连接：先订阅再挂入，期间持有写锁，
                // 保证不会出现两次订阅
                let receiver = self.broker.subscribe(room_id).await?;
                let fanout = tokio::spawn(Self::fanout_loop(
                    receiver,
                    room_id,
                    Arc::clone(&self.rooms),
                ));
                rooms.insert(
                    room_id,
                    RoomEntry {
                        connections: HashMap::new(),
                        fanout,
                    },
                );
            }
            if let Some(entry) = rooms.get_mut(&room_id) {
                entry.connections.insert(conn_id, LocalConn { user_id, sender });
            }
        }

        // 在线集合是记账性质的，失败不影响加入
        if let Err(err) = self.presence.add(room_id, conn_id).await {
            warn!(room_id = %room_id, error = %err, "记录在线连接失败");
        }
        debug!(room_id = %room_id, conn_id = %conn_id, "连接已挂入房间");
        Ok(())
    }

    /// 把连接从房间的本地集合摘除。
    pub async fn detach(
        &self,
        conn_id: ConnectionId,
        room_id: RoomId,
    ) -> Result<(), ApplicationError> {
        {
            let mut rooms = self.rooms.write().await;
            let entry = rooms
                .get_mut(&room_id)
                .filter(|entry| entry.connections.contains_key(&conn_id))
                .ok_or(DomainError::NotInRoom)?;
            entry.connections.remove(&conn_id);

            if entry.connections.is_empty() {
                if let Some(entry) = rooms.remove(&room_id) {
                    entry.fanout.abort();
                }
                // 最后一个本地连接离开：恰好一次退订，仍持有写锁
                self.broker.unsubscribe(room_id).await?;
            }
        }

        if let Err(err) = self.presence.remove(room_id, conn_id).await {
            warn!(room_id = %room_id, error = %err, "移除在线连接失败");
        }
        debug!(room_id = %room_id, conn_id = %conn_id, "连接已摘出房间");
        Ok(())
    }

    /// 连接断开：同步从所有房间摘除，空房间退订。
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let mut left = Vec::new();
        {
            let mut rooms = self.rooms.write().await;
            let mut emptied = Vec::new();
            for (room_id, entry) in rooms.iter_mut() {
                if entry.connections.remove(&conn_id).is_some() {
                    left.push(*room_id);
                    if entry.connections.is_empty() {
                        emptied.push(*room_id);
                    }
                }
            }
            for room_id in emptied {
                if let Some(entry) = rooms.remove(&room_id) {
                    entry.fanout.abort();
                }
                if let Err(err) = self.broker.unsubscribe(room_id).await {
                    warn!(room_id = %room_id, error = %err, "退订房间频道失败");
                }
            }
        }

        for room_id in left {
            if let Err(err) = self.presence.remove(room_id, conn_id).await {
                warn!(room_id = %room_id, error = %err, "移除在线连接失败");
            }
        }
        debug!(conn_id = %conn_id, "连接已清理");
    }

    /// 发布消息到房间频道。要求该连接此前已在本实例挂入房间。
    pub async fn broadcast(
        &self,
        conn_id: ConnectionId,
        user_id: UserId,
        room_id: RoomId,
        content: String,
        kind: String,
    ) -> Result<RoomMessage, ApplicationError> {
        let attached = {
            let rooms = self.rooms.read().await;
            rooms
                .get(&room_id)
                .map(|entry| entry.connections.contains_key(&conn_id))
                .unwrap_or(false)
        };
        if !attached {
            return Err(DomainError::NotInRoom.into());
        }

        let message = RoomMessage::message(room_id, user_id, content, kind, Utc::now());
        self.broker.publish(&message).await?;

        // 归档是旁路：失败记日志，从不影响实时路径
        let pipeline = Arc::clone(&self.pipeline);
        let archived = message.clone();
        tokio::spawn(async move {
            if let Err(err) = pipeline.chat_message(&archived).await {
                warn!(room_id = %archived.room_id(), error = %err, "归档消息投递失败");
            }
        });

        Ok(message)
    }

    /// 扇出循环：代理消息投给房间内除发送者本人外的所有本地连接。
    async fn fanout_loop(
        mut receiver: broadcast::Receiver<RoomMessage>,
        room_id: RoomId,
        rooms: Rooms,
    ) {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    let payload = match serde_json::to_string(&message) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(room_id = %room_id, error = %err, "序列化扇出消息失败");
                            continue;
                        }
                    };
                    let rooms = rooms.read().await;
                    if let Some(entry) = rooms.get(&room_id) {
                        for conn in entry.connections.values() {
                            if conn.user_id == message.sender_id() {
                                continue;
                            }
                            // 发送端掉线由 disconnect 清理，这里不处理
                            let _ = conn.sender.send(payload.clone());
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(room_id = %room_id, skipped, "扇出任务落后，丢弃积压消息");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(room_id = %room_id, "扇出任务退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::{
        LocalRoomBroker, MemoryPresenceTracker, MemoryRoomStore, NoopEventPipeline,
    };
    use domain::{Room, RoomMember, RoomRole};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// 包一层计数器，验证退订恰好一次。
    struct CountingBroker {
        inner: LocalRoomBroker,
        unsubscribes: AtomicU32,
    }

    impl CountingBroker {
        fn new() -> Self {
            Self {
                inner: LocalRoomBroker::new(),
                unsubscribes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl RoomBroker for CountingBroker {
        async fn publish(&self, message: &RoomMessage) -> Result<(), ApplicationError> {
            self.inner.publish(message).await
        }

        async fn subscribe(
            &self,
            room_id: RoomId,
        ) -> Result<broadcast::Receiver<RoomMessage>, ApplicationError> {
            self.inner.subscribe(room_id).await
        }

        async fn unsubscribe(&self, room_id: RoomId) -> Result<(), ApplicationError> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            self.inner.unsubscribe(room_id).await
        }
    }

    async fn seeded_store(member_ids: &[UserId]) -> (Arc<MemoryRoomStore>, RoomId) {
        let store = Arc::new(MemoryRoomStore::new());
        let now = Utc::now();
        let creator = member_ids[0];
        let room = Room::create(
            RoomId::new(Uuid::new_v4()),
            "bridge".to_string(),
            None,
            52.52,
            13.405,
            creator,
            now,
        )
        .unwrap();
        let admin = RoomMember::new(creator, room.id, RoomRole::Admin, now);
        store.insert_room(&room, &admin).await.unwrap();
        for member in &member_ids[1..] {
            store.join_room(room.id, *member, now).await.unwrap();
        }
        (store, room.id)
    }

    fn registry_with(
        store: Arc<MemoryRoomStore>,
        broker: Arc<dyn RoomBroker>,
    ) -> RoomRegistry {
        RoomRegistry::new(
            store,
            broker,
            Arc::new(MemoryPresenceTracker::new()),
            Arc::new(NoopEventPipeline),
        )
    }

    fn conn() -> (ConnectionId, OutboundSender, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionId::generate(), tx, rx)
    }

    async fn expect_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> RoomMessage {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open");
        serde_json::from_str(&frame).expect("valid frame")
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<String>) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "expected no frame");
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_the_sender() {
        let alice = UserId::new(Uuid::new_v4());
        let bob = UserId::new(Uuid::new_v4());
        let carol = UserId::new(Uuid::new_v4());
        let (store, room_id) = seeded_store(&[alice, bob, carol]).await;
        let registry = registry_with(store, Arc::new(LocalRoomBroker::new()));

        let (conn_a, tx_a, mut rx_a) = conn();
        let (conn_b, tx_b, mut rx_b) = conn();
        let (conn_c, tx_c, mut rx_c) = conn();
        registry.attach(conn_a, alice, tx_a, room_id).await.unwrap();
        registry.attach(conn_b, bob, tx_b, room_id).await.unwrap();
        registry.attach(conn_c, carol, tx_c, room_id).await.unwrap();

        registry
            .broadcast(conn_a, alice, room_id, "hello".into(), "text".into())
            .await
            .unwrap();

        let for_b = expect_frame(&mut rx_b).await;
        let for_c = expect_frame(&mut rx_c).await;
        assert_eq!(for_b.sender_id(), alice);
        assert_eq!(for_b, for_c);
        expect_silence(&mut rx_a).await;
    }

    #[tokio::test]
    async fn sender_exclusion_is_by_user_identity() {
        // 同一用户的另一条连接同样不收到回声
        let alice = UserId::new(Uuid::new_v4());
        let bob = UserId::new(Uuid::new_v4());
        let (store, room_id) = seeded_store(&[alice, bob]).await;
        let registry = registry_with(store, Arc::new(LocalRoomBroker::new()));

        let (conn_a1, tx_a1, mut rx_a1) = conn();
        let (conn_a2, tx_a2, mut rx_a2) = conn();
        let (conn_b, tx_b, mut rx_b) = conn();
        registry.attach(conn_a1, alice, tx_a1, room_id).await.unwrap();
        registry.attach(conn_a2, alice, tx_a2, room_id).await.unwrap();
        registry.attach(conn_b, bob, tx_b, room_id).await.unwrap();

        registry
            .broadcast(conn_a1, alice, room_id, "hi".into(), "text".into())
            .await
            .unwrap();

        expect_frame(&mut rx_b).await;
        expect_silence(&mut rx_a1).await;
        expect_silence(&mut rx_a2).await;
    }

    #[tokio::test]
    async fn fanout_crosses_instances_through_the_broker() {
        let alice = UserId::new(Uuid::new_v4());
        let bob = UserId::new(Uuid::new_v4());
        let (store, room_id) = seeded_store(&[alice, bob]).await;
        let broker: Arc<dyn RoomBroker> = Arc::new(LocalRoomBroker::new());

        // 两个注册表共享一个代理，等价于两个实例
        let instance_a = registry_with(store.clone(), broker.clone());
        let instance_b = registry_with(store, broker);

        let (conn_a, tx_a, mut rx_a) = conn();
        let (conn_b, tx_b, mut rx_b) = conn();
        instance_a.attach(conn_a, alice, tx_a, room_id).await.unwrap();
        instance_b.attach(conn_b, bob, tx_b, room_id).await.unwrap();

        instance_a
            .broadcast(conn_a, alice, room_id, "over the wire".into(), "text".into())
            .await
            .unwrap();

        let delivered = expect_frame(&mut rx_b).await;
        assert_eq!(delivered.sender_id(), alice);
        expect_silence(&mut rx_a).await;
    }

    #[tokio::test]
    async fn last_connection_out_unsubscribes_exactly_once() {
        let alice = UserId::new(Uuid::new_v4());
        let bob = UserId::new(Uuid::new_v4());
        let (store, room_id) = seeded_store(&[alice, bob]).await;
        let broker = Arc::new(CountingBroker::new());
        let registry = registry_with(store, broker.clone());

        let (conn_a, tx_a, _rx_a) = conn();
        let (conn_b, tx_b, _rx_b) = conn();
        registry.attach(conn_a, alice, tx_a, room_id).await.unwrap();
        registry.attach(conn_b, bob, tx_b, room_id).await.unwrap();

        registry.detach(conn_a, room_id).await.unwrap();
        assert_eq!(broker.unsubscribes.load(Ordering::SeqCst), 0);

        registry.detach(conn_b, room_id).await.unwrap();
        assert_eq!(broker.unsubscribes.load(Ordering::SeqCst), 1);

        // 再次离开只会得到 NOT_IN_ROOM，不会二次退订
        assert!(registry.detach(conn_b, room_id).await.is_err());
        assert_eq!(broker.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_cleans_every_room() {
        let alice = UserId::new(Uuid::new_v4());
        let bob = UserId::new(Uuid::new_v4());
        let (store, room_one) = seeded_store(&[alice, bob]).await;

        // 第二个房间，同样两名成员
        let now = Utc::now();
        let second = Room::create(
            RoomId::new(Uuid::new_v4()),
            "annex".to_string(),
            None,
            48.85,
            2.35,
            alice,
            now,
        )
        .unwrap();
        let admin = RoomMember::new(alice, second.id, RoomRole::Admin, now);
        store.insert_room(&second, &admin).await.unwrap();
        store.join_room(second.id, bob, now).await.unwrap();

        let broker = Arc::new(CountingBroker::new());
        let registry = registry_with(store, broker.clone());

        let (conn_a, tx_a, _rx_a) = conn();
        let (conn_b, tx_b, _rx_b) = conn();
        registry.attach(conn_a, alice, tx_a.clone(), room_one).await.unwrap();
        registry.attach(conn_a, alice, tx_a, second.id).await.unwrap();
        registry.attach(conn_b, bob, tx_b, room_one).await.unwrap();

        registry.disconnect(conn_a).await;
        // 只有 annex 变空，bridge 还剩 bob
        assert_eq!(broker.unsubscribes.load(Ordering::SeqCst), 1);

        registry.disconnect(conn_b).await;
        assert_eq!(broker.unsubscribes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn attach_requires_persisted_membership() {
        let alice = UserId::new(Uuid::new_v4());
        let (store, room_id) = seeded_store(&[alice]).await;
        let registry = registry_with(store, Arc::new(LocalRoomBroker::new()));

        let stranger = UserId::new(Uuid::new_v4());
        let (conn_s, tx_s, _rx_s) = conn();
        let err = registry
            .attach(conn_s, stranger, tx_s, room_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::NotAMember)
        ));
    }

    #[tokio::test]
    async fn broadcast_requires_prior_attach_on_this_connection() {
        let alice = UserId::new(Uuid::new_v4());
        let (store, room_id) = seeded_store(&[alice]).await;
        let registry = registry_with(store, Arc::new(LocalRoomBroker::new()));

        // alice 是持久化成员，但这条连接从未 JOIN
        let (conn_a, _tx_a, _rx_a) = conn();
        let err = registry
            .broadcast(conn_a, alice, room_id, "hi".into(), "text".into())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApplicationError::Domain(DomainError::NotInRoom)
        ));
    }
}
