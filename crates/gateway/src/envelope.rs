//! socket 双向信封
//!
//! 入站：`{event: "JOIN"|"LEAVE"|"BROADCAST"|"ROOMSNEARME", data: {...}}`，
//! 封闭的 tagged 枚举，未知事件在反序列化时即被拒绝。出站统一为
//! `{event, success, code?, message?, data?}`。

use domain::DomainError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

fn default_kind() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JoinData {
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LeaveData {
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastData {
    pub room_id: Uuid,
    #[validate(length(min = 1, max = 2000))]
    pub content: String,
    /// 客户端定义的展示类型，服务端透传
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NearMeData {
    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub lng: f64,
}

/// 客户端事件
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "JOIN")]
    Join(JoinData),
    #[serde(rename = "LEAVE")]
    Leave(LeaveData),
    #[serde(rename = "BROADCAST")]
    Broadcast(BroadcastData),
    #[serde(rename = "ROOMSNEARME")]
    RoomsNearMe(NearMeData),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "JOIN",
            Self::Leave(_) => "LEAVE",
            Self::Broadcast(_) => "BROADCAST",
            Self::RoomsNearMe(_) => "ROOMSNEARME",
        }
    }

    /// 字段级校验，信封解析通过后调用。
    pub fn validate_data(&self) -> Result<(), DomainError> {
        let result = match self {
            Self::Join(data) => data.validate(),
            Self::Leave(data) => data.validate(),
            Self::Broadcast(data) => data.validate(),
            Self::RoomsNearMe(data) => data.validate(),
        };
        result.map_err(|err| DomainError::validation(err.to_string()))
    }
}

/// 服务端回执
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketReply {
    pub event: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SocketReply {
    pub fn ok(event: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            event: event.to_string(),
            success: true,
            code: None,
            message: None,
            data,
        }
    }

    pub fn rejected(event: &str, err: &DomainError) -> Self {
        Self {
            event: event.to_string(),
            success: false,
            code: Some(err.code()),
            message: Some(err.to_string()),
            data: None,
        }
    }

    pub fn internal(event: &str) -> Self {
        Self {
            event: event.to_string(),
            success: false,
            code: Some("INTERNAL"),
            message: Some("internal server error".to_string()),
            data: None,
        }
    }
}
