//! 请求凭证提取
//!
//! REST 接口使用 `Authorization: Bearer <token>`；WebSocket 握手额外支持 `?token=` 查询参数，
//! 便于浏览器端连接。

use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};
use domain::User;

use crate::error::ApiError;
use crate::state::AppState;

/// 从 headers 中提取 Bearer 凭证
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// 已认证的请求用户
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = state.identity.resolve(bearer_token(&parts.headers)).await?;
        Ok(AuthUser(user))
    }
}
