use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 单条消息允许的最大字符数。
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// 用户唯一标识（来自外部账户系统的整数主键）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<UserId> for i64 {
    fn from(value: UserId) -> Self {
        value.0
    }
}

/// 消息唯一标识，由存储按插入顺序分配，用作同一时间戳下的稳定排序依据。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<MessageId> for i64 {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

/// 商品（广告）标识，仅用于会话上下文展示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub i64);

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ListingId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// 客户端传入的原始会话标识。
///
/// 合法的会话标识总是 `"{较小用户ID}-{较大用户ID}"`，但查找时按原样使用，
/// 只有在需要懒创建会话时才通过 [`ParticipantPair::parse`] 校验格式。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// 会话的两位参与者，始终按 `low < high` 排列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantPair {
    low: UserId,
    high: UserId,
}

impl ParticipantPair {
    /// 以任意顺序传入两个用户，得到规范化的参与者对。
    pub fn new(a: UserId, b: UserId) -> Result<Self, DomainError> {
        if a.0 <= 0 || b.0 <= 0 {
            return Err(DomainError::invalid_argument(
                "participants",
                "user ids must be positive",
            ));
        }
        if a == b {
            return Err(DomainError::invalid_argument(
                "participants",
                "a conversation needs two distinct users",
            ));
        }
        Ok(Self {
            low: a.min(b),
            high: a.max(b),
        })
    }

    /// 解析规范格式 `"{smaller}-{larger}"` 的会话标识。
    ///
    /// 前导零、正负号、逆序或者自聊都会被拒绝。
    pub fn parse(id: &ConversationId) -> Result<Self, DomainError> {
        let malformed = || DomainError::invalid_argument("conversation_id", "malformed pair id");
        let (left, right) = id.as_str().split_once('-').ok_or_else(malformed)?;
        let left: i64 = left.parse().map_err(|_| malformed())?;
        let right: i64 = right.parse().map_err(|_| malformed())?;

        let pair = Self::new(UserId(left), UserId(right)).map_err(|_| malformed())?;
        if pair.conversation_id() != *id {
            return Err(malformed());
        }
        Ok(pair)
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }

    pub fn conversation_id(&self) -> ConversationId {
        ConversationId(format!("{}-{}", self.low, self.high))
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// 返回另一位参与者；`user` 不在会话中时返回 `None`。
    pub fn other(&self, user: UserId) -> Option<UserId> {
        if user == self.low {
            Some(self.high)
        } else if user == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

/// 发送者角色标记，仅用于展示。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Buyer,
    Seller,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Buyer => "buyer",
            SenderRole::Seller => "seller",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "buyer" => Ok(SenderRole::Buyer),
            "seller" => Ok(SenderRole::Seller),
            other => Err(DomainError::invalid_argument(
                "sender_role",
                format!("unknown role '{other}'"),
            )),
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息正文内容。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageText(String);

impl MessageText {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_argument("text", "cannot be empty"));
        }
        if value.chars().count() > MAX_MESSAGE_CHARS {
            return Err(DomainError::invalid_argument("text", "too long"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 生成通知用的截断预览，按字符边界截断。
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.0.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        if chars.next().is_some() {
            format!("{head}…")
        } else {
            head
        }
    }
}
