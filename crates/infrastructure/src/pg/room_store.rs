//! 房间存储的 Postgres 实现
//!
//! 每个变更操作是一个事务，先 `SELECT ... FOR UPDATE` 锁住房间行，
//! 再裁决业务规则、一并更新反范式化计数器与成员行。领域错误触发
//! 回滚（事务句柄被丢弃即回滚），不留部分状态。

use application::{ApplicationError, RoomStore};
use chrono::{DateTime, Utc};
use domain::{
    DomainError, Room, RoomId, RoomMember, RoomRole, UserId, MAX_ADMINS,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> ApplicationError {
    ApplicationError::storage(err.to_string())
}

#[derive(Debug, FromRow)]
struct RoomRecord {
    id: Uuid,
    name: String,
    img: Option<String>,
    lat: f64,
    lng: f64,
    member_count: i32,
    max_members: i32,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    is_deleted: bool,
    is_blacklisted: bool,
}

impl From<RoomRecord> for Room {
    fn from(value: RoomRecord) -> Self {
        Room {
            id: RoomId::from(value.id),
            name: value.name,
            img: value.img,
            lat: value.lat,
            lng: value.lng,
            member_count: value.member_count.max(0) as u32,
            max_members: value.max_members.max(0) as u32,
            created_by: UserId::from(value.created_by),
            created_at: value.created_at,
            expires_at: value.expires_at,
            is_deleted: value.is_deleted,
            is_blacklisted: value.is_blacklisted,
        }
    }
}

const ROOM_COLUMNS: &str = "id, name, img, lat, lng, member_count, max_members, \
     created_by, created_at, expires_at, is_deleted, is_blacklisted";

#[derive(Clone)]
pub struct PgRoomStore {
    pool: PgPool,
}

impl PgRoomStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 锁住房间行；不存在或已软删除的房间一律视为不存在。
    async fn lock_room(
        tx: &mut Transaction<'_, Postgres>,
        room_id: RoomId,
    ) -> Result<Room, ApplicationError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1 FOR UPDATE"
        ))
        .bind(Uuid::from(room_id))
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;

        match record {
            Some(record) if !record.is_deleted => Ok(record.into()),
            _ => Err(DomainError::RoomNotFound.into()),
        }
    }

    async fn member_role(
        tx: &mut Transaction<'_, Postgres>,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<RoomRole>, ApplicationError> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM room_members WHERE room_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;

        match role {
            Some(raw) => RoomRole::parse(&raw)
                .map(Some)
                .ok_or_else(|| ApplicationError::storage(format!("unknown role: {raw}"))),
            None => Ok(None),
        }
    }

    async fn require_admin(
        tx: &mut Transaction<'_, Postgres>,
        room_id: RoomId,
        user_id: UserId,
        action: &str,
    ) -> Result<(), ApplicationError> {
        match Self::member_role(tx, room_id, user_id).await? {
            Some(RoomRole::Admin) => Ok(()),
            _ => Err(DomainError::permission_denied(action).into()),
        }
    }

    /// 按增量调整计数器并返回新值，下限为 0。
    async fn shift_member_count(
        tx: &mut Transaction<'_, Postgres>,
        room_id: RoomId,
        delta: i32,
    ) -> Result<u32, ApplicationError> {
        let count: i32 = sqlx::query_scalar(
            "UPDATE rooms SET member_count = GREATEST(member_count + $2, 0) \
             WHERE id = $1 RETURNING member_count",
        )
        .bind(Uuid::from(room_id))
        .bind(delta)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(count.max(0) as u32)
    }
}

#[async_trait::async_trait]
impl RoomStore for PgRoomStore {
    async fn insert_room(
        &self,
        room: &Room,
        creator: &RoomMember,
    ) -> Result<(), ApplicationError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        sqlx::query(
            "INSERT INTO rooms (id, name, img, lat, lng, member_count, max_members, \
             created_by, created_at, expires_at, is_deleted, is_blacklisted) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(Uuid::from(room.id))
        .bind(&room.name)
        .bind(&room.img)
        .bind(room.lat)
        .bind(room.lng)
        .bind(room.member_count as i32)
        .bind(room.max_members as i32)
        .bind(Uuid::from(room.created_by))
        .bind(room.created_at)
        .bind(room.expires_at)
        .bind(room.is_deleted)
        .bind(room.is_blacklisted)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            "INSERT INTO room_members (user_id, room_id, role, joined_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::from(creator.user_id))
        .bind(Uuid::from(creator.room_id))
        .bind(creator.role.as_str())
        .bind(creator.joined_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<Option<Room>, ApplicationError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
        ))
        .bind(Uuid::from(room_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(record.map(Room::from))
    }

    async fn is_user_blacklisted(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM blacklisted_users WHERE user_id = $1)")
            .bind(Uuid::from(user_id))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }

    async fn is_member(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<bool, ApplicationError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2)",
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn join_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<u32, ApplicationError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let room = Self::lock_room(&mut tx, room_id).await?;
        if Self::member_role(&mut tx, room_id, user_id).await?.is_some() {
            return Err(DomainError::AlreadyMember.into());
        }
        room.ensure_joinable(now)?;

        let member_count = Self::shift_member_count(&mut tx, room_id, 1).await?;
        sqlx::query(
            "INSERT INTO room_members (user_id, room_id, role, joined_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::from(user_id))
        .bind(Uuid::from(room_id))
        .bind(RoomRole::Member.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(member_count)
    }

    async fn leave_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<u32, ApplicationError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        Self::lock_room(&mut tx, room_id).await?;
        let deleted = sqlx::query(
            "DELETE FROM room_members WHERE room_id = $1 AND user_id = $2",
        )
        .bind(Uuid::from(room_id))
        .bind(Uuid::from(user_id))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if deleted.rows_affected() == 0 {
            return Err(DomainError::NotAMember.into());
        }

        let member_count = Self::shift_member_count(&mut tx, room_id, -1).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(member_count)
    }

    async fn promote_member(
        &self,
        room_id: RoomId,
        requester: UserId,
        target: UserId,
    ) -> Result<(), ApplicationError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        Self::lock_room(&mut tx, room_id).await?;
        Self::require_admin(&mut tx, room_id, requester, "promote").await?;

        match Self::member_role(&mut tx, room_id, target).await? {
            None => return Err(DomainError::NotAMember.into()),
            Some(RoomRole::Admin) => return Err(DomainError::AlreadyAdmin.into()),
            Some(RoomRole::Member) => {}
        }

        let admin_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM room_members WHERE room_id = $1 AND role = 'ADMIN'",
        )
        .bind(Uuid::from(room_id))
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        if admin_count >= i64::from(MAX_ADMINS) {
            return Err(DomainError::AdminQuotaExceeded {
                max_admins: MAX_ADMINS,
            }
            .into());
        }

        sqlx::query("UPDATE room_members SET role = 'ADMIN' WHERE room_id = $1 AND user_id = $2")
            .bind(Uuid::from(room_id))
            .bind(Uuid::from(target))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn demote_admin(
        &self,
        room_id: RoomId,
        requester: UserId,
        target: UserId,
    ) -> Result<(), ApplicationError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        Self::lock_room(&mut tx, room_id).await?;
        Self::require_admin(&mut tx, room_id, requester, "demote").await?;

        match Self::member_role(&mut tx, room_id, target).await? {
            None => return Err(DomainError::NotAMember.into()),
            Some(RoomRole::Member) => {
                return Err(DomainError::validation("target is not an admin").into())
            }
            Some(RoomRole::Admin) => {}
        }

        sqlx::query("UPDATE room_members SET role = 'MEMBER' WHERE room_id = $1 AND user_id = $2")
            .bind(Uuid::from(room_id))
            .bind(Uuid::from(target))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn remove_members(
        &self,
        room_id: RoomId,
        requester: UserId,
        targets: &[UserId],
    ) -> Result<u32, ApplicationError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        Self::lock_room(&mut tx, room_id).await?;
        Self::require_admin(&mut tx, room_id, requester, "remove members").await?;

        let target_ids: Vec<Uuid> = targets.iter().copied().map(Uuid::from).collect();
        // 管理员行不受批量移除影响
        let deleted = sqlx::query(
            "DELETE FROM room_members \
             WHERE room_id = $1 AND user_id = ANY($2) AND role = 'MEMBER'",
        )
        .bind(Uuid::from(room_id))
        .bind(&target_ids)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let member_count =
            Self::shift_member_count(&mut tx, room_id, -(deleted.rows_affected() as i32)).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(member_count)
    }

    async fn delete_room(
        &self,
        room_id: RoomId,
        requester: UserId,
    ) -> Result<(), ApplicationError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        Self::lock_room(&mut tx, room_id).await?;
        Self::require_admin(&mut tx, room_id, requester, "delete room").await?;

        sqlx::query("DELETE FROM room_members WHERE room_id = $1")
            .bind(Uuid::from(room_id))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        sqlx::query("UPDATE rooms SET is_deleted = TRUE, member_count = 0 WHERE id = $1")
            .bind(Uuid::from(room_id))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn list_available(&self) -> Result<Vec<Room>, ApplicationError> {
        let records = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE is_deleted = FALSE ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(records.into_iter().map(Room::from).collect())
    }
}
