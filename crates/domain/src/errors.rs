//! 领域错误定义
//!
//! 按照错误分类法划分所有可能的业务错误，每个错误携带稳定的机器码，
//! 供网关层映射到客户端响应。

use thiserror::Error;

/// 领域错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 身份缺失或无效
    #[error("unauthorized")]
    Unauthorized,

    /// 请求格式或字段非法
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// 房间不存在（或已软删除）
    #[error("room not found")]
    RoomNotFound,

    /// 用户不是该房间的持久化成员
    #[error("you are not a member of this room")]
    NotAMember,

    /// 连接尚未在本实例加入该房间
    #[error("you must join the room on this connection first")]
    NotInRoom,

    /// 用户已经是该房间的成员
    #[error("you are already a member of this room")]
    AlreadyMember,

    /// 房间人数已满
    #[error("room is full, max {max_members} members")]
    RoomFull { max_members: u32 },

    /// 房间已过期
    #[error("room has expired")]
    RoomExpired,

    /// 房间或用户被拉黑
    #[error("blacklisted")]
    Blacklisted,

    /// 目标已经是管理员
    #[error("the requested user is already an admin of this room")]
    AlreadyAdmin,

    /// 管理员名额已满
    #[error("room can have {max_admins} admins only")]
    AdminQuotaExceeded { max_admins: u32 },

    /// 权限不足
    #[error("permission denied: {action}")]
    PermissionDenied { action: String },
}

/// 错误分类，网关层据此映射状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Validation,
    NotFound,
    Conflict,
    Gone,
    Forbidden,
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn permission_denied(action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            action: action.into(),
        }
    }

    /// 稳定的机器码，出现在 socket/HTTP 响应中
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Validation { .. } => "VALIDATION",
            Self::RoomNotFound => "NOT_FOUND",
            Self::NotAMember => "NOT_A_MEMBER",
            Self::NotInRoom => "NOT_IN_ROOM",
            Self::AlreadyMember => "ALREADY_MEMBER",
            Self::RoomFull { .. } => "FULL",
            Self::RoomExpired => "EXPIRED",
            Self::Blacklisted => "BLACKLISTED",
            Self::AlreadyAdmin => "ALREADY_ADMIN",
            Self::AdminQuotaExceeded { .. } => "ADMIN_QUOTA",
            Self::PermissionDenied { .. } => "FORBIDDEN",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::RoomNotFound => ErrorKind::NotFound,
            Self::NotAMember | Self::NotInRoom => ErrorKind::NotFound,
            Self::AlreadyMember
            | Self::RoomFull { .. }
            | Self::AlreadyAdmin
            | Self::AdminQuotaExceeded { .. } => ErrorKind::Conflict,
            Self::RoomExpired => ErrorKind::Gone,
            Self::Blacklisted | Self::PermissionDenied { .. } => ErrorKind::Forbidden,
        }
    }
}

/// 领域结果类型
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(DomainError::RoomFull { max_members: 50 }.code(), "FULL");
        assert_eq!(DomainError::RoomExpired.code(), "EXPIRED");
        assert_eq!(DomainError::Blacklisted.code(), "BLACKLISTED");
        assert_eq!(DomainError::RoomNotFound.code(), "NOT_FOUND");
        assert_eq!(DomainError::NotAMember.code(), "NOT_A_MEMBER");
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            DomainError::RoomFull { max_members: 50 }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(DomainError::RoomExpired.kind(), ErrorKind::Gone);
        assert_eq!(DomainError::Blacklisted.kind(), ErrorKind::Forbidden);
        assert_eq!(DomainError::AlreadyMember.kind(), ErrorKind::Conflict);
    }
}
