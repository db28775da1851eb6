use crate::value_objects::{Timestamp, UserId};

/// 聊天核心所见的用户。账户的注册、登录由外部子系统负责，
/// 这里只关心展示名、在线状态和当前有效的会话凭证。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub is_online: bool,
    pub last_seen_at: Option<Timestamp>,
    #[serde(skip_serializing)] // 会话凭证不暴露给客户端
    pub session_token: Option<String>,
}

impl User {
    pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            is_online: false,
            last_seen_at: None,
            session_token: None,
        }
    }

    /// 登录时轮换凭证：每个用户同一时间只有一个有效凭证，旧凭证随之失效。
    pub fn rotate_session(&mut self, token: impl Into<String>) {
        self.session_token = Some(token.into());
    }

    pub fn set_presence(&mut self, online: bool, at: Timestamp) {
        self.is_online = online;
        self.last_seen_at = Some(at);
    }
}
