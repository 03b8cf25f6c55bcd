//! 应用错误到 HTTP 响应的映射
//!
//! 业务错误携带稳定机器码与对应状态码；基础设施故障一律折叠成
//! 500 INTERNAL，细节只进日志不出网。

use application::ApplicationError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use domain::{DomainError, ErrorKind};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "internal server error",
        )
    }
}

pub(crate) fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Gone => StatusCode::GONE,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::new(status_for(err.kind()), err.code(), err.to_string())
    }
}

impl From<ApplicationError> for ApiError {
    fn from(err: ApplicationError) -> Self {
        match err.as_domain() {
            Some(domain_err) => domain_err.clone().into(),
            None => {
                error!(error = %err, "请求因内部错误失败");
                ApiError::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_taxonomy_statuses() {
        let full: ApiError = DomainError::RoomFull { max_members: 50 }.into();
        assert_eq!(full.status, StatusCode::CONFLICT);
        assert_eq!(full.body.code, "FULL");

        let expired: ApiError = DomainError::RoomExpired.into();
        assert_eq!(expired.status, StatusCode::GONE);

        let blacklisted: ApiError = DomainError::Blacklisted.into();
        assert_eq!(blacklisted.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn infrastructure_failures_do_not_leak_details() {
        let err: ApiError = ApplicationError::storage("password=hunter2 connection refused").into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body.code, "INTERNAL");
        assert!(!err.body.message.contains("hunter2"));
    }
}
