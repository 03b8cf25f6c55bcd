//! 附近聊天室系统核心领域模型
//!
//! 包含房间、房间成员等核心实体，地理单元格计算，以及相关的业务规则。

pub mod errors;
pub mod events;
pub mod geo;
pub mod ids;
pub mod message;
pub mod room;
pub mod room_member;

// 重新导出常用类型
pub use errors::{DomainError, DomainResult, ErrorKind};
pub use events::RoomEvent;
pub use geo::{
    cell_of, covering_cells, haversine_km, round_km_mm, CellId, RoomSnapshot, SEARCH_RADIUS_KM,
};
pub use ids::{ConnectionId, RoomId, UserId};
pub use message::RoomMessage;
pub use room::{Room, ROOM_LIFETIME_HOURS};
pub use room_member::{RoomMember, RoomRole, MAX_ADMINS, MAX_MEMBERS};
