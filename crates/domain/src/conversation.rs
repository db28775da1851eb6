use crate::errors::DomainError;
use crate::message::Message;
use crate::value_objects::{ConversationId, ListingId, ParticipantPair, Timestamp, UserId};

/// 屏蔽操作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// 本次请求完成了屏蔽
    Blocked,
    /// 会话此前已被屏蔽，`blocked_by` 保持不变
    AlreadyBlocked,
}

/// 两人会话及其元数据
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: ParticipantPair,
    pub listing_id: Option<ListingId>,
    pub is_blocked: bool,
    pub blocked_by: Option<UserId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Conversation {
    pub fn open(
        participants: ParticipantPair,
        listing_id: Option<ListingId>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: participants.conversation_id(),
            participants,
            listing_id,
            is_blocked: false,
            blocked_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 屏蔽是会话级别的：一旦屏蔽，双方都不能再发送消息。
    pub fn block(&mut self, by: UserId) -> Result<BlockOutcome, DomainError> {
        if !self.participants.contains(by) {
            return Err(DomainError::NotParticipant);
        }
        if self.is_blocked {
            return Ok(BlockOutcome::AlreadyBlocked);
        }
        self.is_blocked = true;
        self.blocked_by = Some(by);
        Ok(BlockOutcome::Blocked)
    }

    pub fn ensure_can_send(&self, sender: UserId) -> Result<(), DomainError> {
        if !self.participants.contains(sender) {
            return Err(DomainError::NotParticipant);
        }
        if self.is_blocked {
            return Err(DomainError::ConversationBlocked);
        }
        Ok(())
    }

    /// 新消息的时间戳不早于会话最近一次更新，保证会话内时间单调不减。
    pub fn next_message_time(&self, now: Timestamp) -> Timestamp {
        now.max(self.updated_at)
    }

    pub fn touch(&mut self, at: Timestamp) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

/// 会话列表中的一项，面向某个具体用户
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub unread_count: u64,
    pub last_message: Option<Message>,
}
