use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use thiserror::Error;

/// Field of a scale telemetry line, used to point at what failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageField {
    Type,
    MessageId,
    Rssi,
    Value,
}

impl fmt::Display for MessageField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageField::Type => "type",
            MessageField::MessageId => "message_id",
            MessageField::Rssi => "rssi",
            MessageField::Value => "value",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected at least 3 fields (type|message_id|rssi), got {found}")]
    TooFewFields { found: usize },
    #[error("missing {field}")]
    Missing { field: MessageField },
    #[error("invalid {field}: {raw:?} is not a number")]
    NotANumber { field: MessageField, raw: String },
    #[error("unexpected trailing field {raw:?}")]
    UnexpectedField { raw: String },
}

impl ParseError {
    pub fn field(&self) -> Option<MessageField> {
        match self {
            ParseError::Missing { field } | ParseError::NotANumber { field, .. } => Some(*field),
            ParseError::TooFewFields { .. } | ParseError::UnexpectedField { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl From<ParseError> for AppError {
    fn from(err: ParseError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
