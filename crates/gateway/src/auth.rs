//! 会话令牌校验
//!
//! 令牌的签发在系统边界之外，网关只做验证：解出用户身份后才允许
//! 连接进入注册表。

use axum::http::HeaderMap;
use domain::UserId;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// 会话令牌声明
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: i64,
}

#[derive(Clone)]
pub struct SessionVerifier {
    decoding_key: DecodingKey,
}

impl SessionVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    /// 验证令牌并返回其承载的用户身份。
    pub fn verify(&self, token: &str) -> Result<UserId, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| UserId::from(data.claims.sub))
            .map_err(|err| ApiError::unauthorized(format!("invalid session token: {err}")))
    }

    /// 从请求头提取 Bearer 令牌并验证。
    pub fn verify_headers(&self, headers: &HeaderMap) -> Result<UserId, ApiError> {
        let header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("invalid authorization header format"))?;
        self.verify(token)
    }
}
