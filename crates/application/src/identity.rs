//! 连接凭证解析
//!
//! 账户子系统负责签发会话凭证，聊天核心只负责把凭证映射回用户。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{User, UserRepository};
use tracing::debug;

use crate::error::ApplicationError;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// 解析连接凭证；凭证缺失或无效时返回 [`ApplicationError::Unauthenticated`]
    async fn resolve(&self, credential: Option<&str>) -> Result<User, ApplicationError>;
}

/// 按用户表里的当前会话凭证解析身份
pub struct SessionTokenResolver {
    users: Arc<dyn UserRepository>,
}

impl SessionTokenResolver {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl IdentityResolver for SessionTokenResolver {
    async fn resolve(&self, credential: Option<&str>) -> Result<User, ApplicationError> {
        let token = match credential.map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => return Err(ApplicationError::Unauthenticated),
        };

        match self.users.find_by_session_token(token.to_string()).await? {
            Some(user) => Ok(user),
            None => {
                debug!("会话凭证无效");
                Err(ApplicationError::Unauthenticated)
            }
        }
    }
}
