use std::fmt;

use thiserror::Error;

/// Message shown when a failure carries no usable text of its own.
pub const GENERIC_ERROR_MESSAGE: &str = "An unexpected error occurred";

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Response body of a failed request, with the server's own `message`
/// field pulled out when the body is JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerBody {
    text: String,
    message: Option<String>,
}

impl ServerBody {
    pub fn parse(body: &str) -> Self {
        Self {
            text: Self::truncate(body),
            message: extract_message(body),
        }
    }

    /// Server-supplied message, if the body carried one.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut cut = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
    }
}

impl fmt::Display for ServerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Look for `message`, `error.message` or a string `error` in a JSON body.
fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let found = value
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| value.pointer("/error/message").and_then(|m| m.as_str()))
        .or_else(|| value.get("error").and_then(|m| m.as_str()))?;
    let found = found.trim();
    (!found.is_empty()).then(|| found.to_string())
}

/// Failure of a producer (a call to the remote API or any other async
/// operation wrapped by a fetch or mutation unit).
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized - token may be expired")]
    Unauthorized(ServerBody),

    #[error("Access denied: {0}")]
    AccessDenied(ServerBody),

    #[error("Resource not found: {0}")]
    NotFound(ServerBody),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(ServerBody),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: ServerBody },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Free-form failure raised by a non-HTTP producer.
    #[error("{0}")]
    Failed(String),
}

impl ApiError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = ServerBody::parse(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized(body),
            403 => ApiError::AccessDenied(body),
            404 => ApiError::NotFound(body),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(body),
            code => ApiError::Status { status: code, body },
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ApiError::Failed(message.into())
    }

    fn server_body(&self) -> Option<&ServerBody> {
        match self {
            ApiError::Unauthorized(body)
            | ApiError::AccessDenied(body)
            | ApiError::NotFound(body)
            | ApiError::ServerError(body)
            | ApiError::Status { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn server_message(&self) -> Option<&str> {
        self.server_body().and_then(ServerBody::message)
    }

    /// Text suitable for showing to a user: the server's own message when
    /// it sent one, else this error's description, else a generic line.
    pub fn user_message(&self) -> String {
        if let Some(message) = self.server_message() {
            return message.to_string();
        }
        let own = self.to_string();
        if own.trim().is_empty() {
            GENERIC_ERROR_MESSAGE.to_string()
        } else {
            own
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}
