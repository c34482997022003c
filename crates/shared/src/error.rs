use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingImage,
    MissingLink,
    MethodNotAllowed,
    InvalidRequestBody,
    LockNotFoundOrEmpty,
    NoBlocksToFinalize,
    NoBlocksAvailable,
    StoreAccessError,
    StoreSaveError,
    ServerError,
}

impl ErrorCode {
    pub fn http_status(self) -> u16 {
        match self {
            Self::MissingImage
            | Self::MissingLink
            | Self::InvalidRequestBody
            | Self::NoBlocksToFinalize => 400,
            Self::LockNotFoundOrEmpty => 404,
            Self::MethodNotAllowed => 405,
            Self::NoBlocksAvailable => 409,
            Self::ServerError => 500,
            Self::StoreAccessError | Self::StoreSaveError => 503,
        }
    }

    /// The client answers these by re-acquiring a reservation and retrying once.
    pub fn is_lock_not_found(self) -> bool {
        matches!(self, Self::LockNotFoundOrEmpty | Self::NoBlocksToFinalize)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingImage => "MISSING_IMAGE",
            Self::MissingLink => "MISSING_LINK",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::InvalidRequestBody => "INVALID_REQUEST_BODY",
            Self::LockNotFoundOrEmpty => "LOCK_NOT_FOUND_OR_EMPTY",
            Self::NoBlocksToFinalize => "NO_BLOCKS_TO_FINALIZE",
            Self::NoBlocksAvailable => "NO_BLOCKS_AVAILABLE",
            Self::StoreAccessError => "STORE_ACCESS_ERROR",
            Self::StoreSaveError => "STORE_SAVE_ERROR",
            Self::ServerError => "SERVER_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Wire shape of every failed request: `{ ok: false, error, message? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureBody {
    pub ok: bool,
    pub error: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<ApiError> for FailureBody {
    fn from(value: ApiError) -> Self {
        Self {
            ok: false,
            error: value.code,
            message: (!value.message.is_empty()).then_some(value.message),
        }
    }
}

impl From<FailureBody> for ApiError {
    fn from(value: FailureBody) -> Self {
        Self {
            code: value.error,
            message: value.message.unwrap_or_default(),
        }
    }
}
