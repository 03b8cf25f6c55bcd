//! 用例服务

mod geo_service;
mod room_service;

pub use geo_service::{GeoCellStore, GeoLookupService, MemoryGeoCellStore, NearbyRoom};
pub use room_service::RoomService;
