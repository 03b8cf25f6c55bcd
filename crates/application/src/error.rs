use domain::DomainError;
use thiserror::Error;

/// 应用层错误
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApplicationError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache(message.into())
    }

    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker(message.into())
    }

    /// 业务错误返回 Some，基础设施故障返回 None（映射为通用内部错误）
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(err) => Some(err),
            _ => None,
        }
    }
}
