use crate::value_objects::{ConversationId, MessageId, MessageText, SenderRole, Timestamp, UserId};

/// 已持久化的消息，创建后不可修改；`is_read` 只会由 false 变为 true。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_role: SenderRole,
    pub text: MessageText,
    pub is_read: bool,
    pub created_at: Timestamp,
}

impl Message {
    /// 会话内的全序排序键
    pub fn order_key(&self) -> (Timestamp, MessageId) {
        (self.created_at, self.id)
    }
}

/// 待写入的消息，`id` 与 `created_at` 由存储分配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_role: SenderRole,
    pub text: MessageText,
    pub sent_at: Timestamp,
}

/// 追加消息的结果。屏蔽检查与写入在同一个原子操作内完成。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(Message),
    Blocked,
    ConversationMissing,
}
