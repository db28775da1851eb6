//! 会话存储接口
//!
//! 领域层只定义接口，由内存实现（测试、开发环境）和 PostgreSQL 实现分别提供。

use futures::future::BoxFuture;

use crate::conversation::{BlockOutcome, Conversation, ConversationSummary};
use crate::errors::RepositoryError;
use crate::message::{AppendOutcome, Message, NewMessage};
use crate::user::User;
use crate::value_objects::{ConversationId, ListingId, MessageId, ParticipantPair, Timestamp, UserId};

pub type RepositoryResult<T> = Result<T, RepositoryError>;
pub type RepositoryFuture<T> = BoxFuture<'static, RepositoryResult<T>>;

#[cfg_attr(feature = "testing", mockall::automock)]
pub trait UserRepository: Send + Sync {
    fn find_by_id(&self, id: UserId) -> RepositoryFuture<Option<User>>;
    fn find_by_session_token(&self, token: String) -> RepositoryFuture<Option<User>>;
    /// 写入在线标记和最后在线时间
    fn set_online(&self, id: UserId, online: bool, at: Timestamp) -> RepositoryFuture<()>;
}

#[cfg_attr(feature = "testing", mockall::automock)]
pub trait ConversationRepository: Send + Sync {
    /// 幂等创建：同一对用户只会存在一条会话记录，已存在时原样返回。
    fn get_or_create(
        &self,
        participants: ParticipantPair,
        listing_id: Option<ListingId>,
        now: Timestamp,
    ) -> RepositoryFuture<Conversation>;

    fn find_by_id(&self, id: ConversationId) -> RepositoryFuture<Option<Conversation>>;

    /// 对 `is_blocked = false` 做比较并设置；会话不存在时返回 `None`。
    /// `updated_at` 只随新消息推进，屏蔽不改变会话列表的顺序。
    fn set_blocked(
        &self,
        id: ConversationId,
        blocker: UserId,
    ) -> RepositoryFuture<Option<(Conversation, BlockOutcome)>>;

    /// 按 `updated_at` 倒序列出用户参与的会话
    fn list_for_user(&self, user: UserId) -> RepositoryFuture<Vec<ConversationSummary>>;
}

#[cfg_attr(feature = "testing", mockall::automock)]
pub trait MessageRepository: Send + Sync {
    /// 在会话行锁内检查屏蔽状态、写入消息并刷新 `updated_at`。
    fn append(&self, message: NewMessage) -> RepositoryFuture<AppendOutcome>;

    /// 把会话中所有非 `reader` 发送的未读消息标为已读，返回被修改的条数。
    fn mark_read(&self, conversation: ConversationId, reader: UserId) -> RepositoryFuture<u64>;

    /// 按 `(created_at, id)` 升序返回 `before` 之前最近的 `limit` 条消息
    fn history(
        &self,
        conversation: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> RepositoryFuture<Vec<Message>>;

    fn count(&self, conversation: ConversationId) -> RepositoryFuture<u64>;
}

/// 商品子系统的只读视图，聊天只需要确认商品存在。
#[cfg_attr(feature = "testing", mockall::automock)]
pub trait ListingDirectory: Send + Sync {
    fn exists(&self, listing: ListingId) -> RepositoryFuture<bool>;
}
