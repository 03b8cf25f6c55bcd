//! 应用层实现。
//!
//! 这里提供围绕领域模型的用例服务，以及对外部适配器（缓存、消息代理、
//! 持久化存储、事件管道）的端口抽象。所有端口都有内存实现用于测试和
//! 单机开发，Redis/Postgres 实现位于基础设施层。

pub mod broker;
pub mod cache;
pub mod error;
pub mod pipeline;
pub mod presence;
pub mod repository;
pub mod services;

pub use broker::{room_channel, LocalRoomBroker, RoomBroker};
pub use cache::{Cache, CacheOptions, CacheStore, MemoryCacheStore};
pub use error::ApplicationError;
pub use pipeline::{EventPipeline, NoopEventPipeline};
pub use presence::{MemoryPresenceTracker, PresenceTracker};
pub use repository::{MemoryRoomStore, RoomStore};
pub use services::{GeoCellStore, GeoLookupService, MemoryGeoCellStore, NearbyRoom, RoomService};
