use domain::{DomainError, RepositoryError, RoomId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 回传给客户端的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    Unauthorized,
    NotAMember,
    RateLimitExceeded,
    NotFound,
    ValidationFailed,
    StorageFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotAMember => "NOT_A_MEMBER",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::StorageFailure => "STORAGE_FAILURE",
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("user {user_id} is not a member of room {room_id}")]
    NotAMember { room_id: RoomId, user_id: UserId },
    #[error("rate limit exceeded for {action}")]
    RateLimitExceeded { action: String },
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    /// 快速存储或消息总线故障
    #[error("infrastructure error: {message}")]
    Infrastructure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ApplicationError {
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: None,
        }
    }

    pub fn infrastructure_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        ApplicationError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApplicationError::Validation(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApplicationError::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            ApplicationError::Unauthorized(_) => ErrorCode::Unauthorized,
            ApplicationError::NotAMember { .. } => ErrorCode::NotAMember,
            ApplicationError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            ApplicationError::NotFound { .. } => ErrorCode::NotFound,
            ApplicationError::Validation(_) => ErrorCode::ValidationFailed,
            ApplicationError::Storage(_) | ApplicationError::Infrastructure { .. } => {
                ErrorCode::StorageFailure
            }
        }
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        ApplicationError::Validation(value.to_string())
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound => ApplicationError::NotFound {
                resource: "record",
                id: String::new(),
            },
            RepositoryError::Conflict(message) => ApplicationError::Validation(message),
            RepositoryError::Storage { message } => ApplicationError::Storage(message),
        }
    }
}
