use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::{DomainError, RepositoryError};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use ApplicationError as AppErr;

        match error {
            AppErr::Unauthenticated => ApiError::unauthorized("missing or invalid credential"),
            AppErr::IdentityMismatch => {
                ApiError::forbidden("IDENTITY_MISMATCH", "Identity mismatch")
            }
            AppErr::NotParticipant => ApiError::forbidden(
                "NOT_PARTICIPANT",
                "user is not a participant of this conversation",
            ),
            AppErr::ChatBlocked => {
                ApiError::new(StatusCode::CONFLICT, "CHAT_BLOCKED", "Chat is blocked")
            }
            AppErr::ConversationCreationFailed(reason) => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "CONVERSATION_CREATION_FAILED",
                reason,
            ),
            AppErr::ConversationNotFound => ApiError::new(
                StatusCode::NOT_FOUND,
                "CONVERSATION_NOT_FOUND",
                "conversation not found",
            ),
            AppErr::ListingNotFound => {
                ApiError::new(StatusCode::NOT_FOUND, "LISTING_NOT_FOUND", "listing not found")
            }
            AppErr::Domain(DomainError::InvalidArgument { field, reason }) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                format!("{}: {}", field, reason),
            ),
            AppErr::Domain(err) => ApiError::bad_request(err.to_string()),
            AppErr::Repository(RepositoryError::NotFound) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "requested resource not found",
            ),
            AppErr::Repository(RepositoryError::Conflict) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", "resource already exists")
            }
            AppErr::Repository(RepositoryError::Storage { message }) => {
                tracing::error!(error = %message, "存储访问失败");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "storage is unavailable",
                )
            }
            AppErr::ConnectionNotFound => ApiError::internal_server_error("connection is gone"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
