use domain::{DomainError, RepositoryError};
use thiserror::Error;

/// 应用层错误，同时承载实时协议对客户端暴露的错误分类
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("Identity mismatch")]
    IdentityMismatch,
    #[error("Chat is blocked")]
    ChatBlocked,
    #[error("conversation could not be created: {0}")]
    ConversationCreationFailed(String),
    #[error("user is not a participant of this conversation")]
    NotParticipant,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("listing not found")]
    ListingNotFound,
    #[error("connection is not registered")]
    ConnectionNotFound,
    #[error("domain error: {0}")]
    Domain(DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
}

impl ApplicationError {
    pub fn creation_failed(reason: impl Into<String>) -> Self {
        ApplicationError::ConversationCreationFailed(reason.into())
    }

    /// 写入 ack `error` 字段的文本。存储错误细节只进日志，不下发给客户端。
    pub fn ack_reason(&self) -> String {
        match self {
            ApplicationError::IdentityMismatch | ApplicationError::ChatBlocked => self.to_string(),
            ApplicationError::Unauthenticated => "Unauthenticated".to_string(),
            ApplicationError::ConversationCreationFailed(_) => {
                "Could not create conversation".to_string()
            }
            ApplicationError::NotParticipant => "Not a participant".to_string(),
            ApplicationError::ConversationNotFound => "Conversation not found".to_string(),
            ApplicationError::ListingNotFound => "Listing not found".to_string(),
            ApplicationError::Domain(DomainError::InvalidArgument { field, reason }) => {
                format!("Invalid {field}: {reason}")
            }
            ApplicationError::Domain(_)
            | ApplicationError::ConnectionNotFound
            | ApplicationError::Repository(_) => "Internal server error".to_string(),
        }
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::NotParticipant => ApplicationError::NotParticipant,
            DomainError::ConversationBlocked => ApplicationError::ChatBlocked,
            other => ApplicationError::Domain(other),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
