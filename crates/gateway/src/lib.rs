//! 网关层：WebSocket 连接注册表与扇出，外加房间生命周期的薄 HTTP 路由。
//!
//! 每个实例只看到自己的连接切片；跨实例的消息流经消息代理。注册表
//! 负责「首个本地成员订阅、最后一个离开退订」的生命周期。

pub mod auth;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod routes;
pub mod state;
pub mod websocket;

pub use auth::SessionVerifier;
pub use error::ApiError;
pub use registry::RoomRegistry;
pub use routes::build_router;
pub use state::AppState;
