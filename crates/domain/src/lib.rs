//! 二手交易平台实时聊天核心领域模型
//!
//! 包含用户、会话、消息等核心实体，以及会话存储的仓储接口。

pub mod conversation;
pub mod errors;
pub mod message;
pub mod repository;
pub mod user;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::{BlockOutcome, Conversation, ConversationSummary};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use message::{AppendOutcome, Message, NewMessage};
pub use repository::{
    ConversationRepository, ListingDirectory, MessageRepository, RepositoryFuture,
    RepositoryResult, UserRepository,
};
pub use user::User;
pub use value_objects::{
    ConversationId, ListingId, MessageId, MessageText, ParticipantPair, SenderRole, Timestamp,
    UserId, MAX_MESSAGE_CHARS,
};

#[cfg(feature = "testing")]
pub use repository::{
    MockConversationRepository, MockListingDirectory, MockMessageRepository, MockUserRepository,
};
