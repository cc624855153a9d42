//! Normalized errors for every failed API call
//!
//! Whatever goes wrong below the client (the connection dropped, the server
//! answered 4xx/5xx, a body could not be decoded) reaches callers as one
//! `ApiError` with a stable `{message, code}` shape.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::transport::TransportError;

/// Broad class of a failure, used for retry and re-authentication decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No response was received (connection failure or timeout)
    Network,
    /// 4xx other than 401; retrying cannot help
    Client,
    /// The credential is missing, expired or rejected; the user must log in again
    Auth,
    /// 5xx
    Server,
    /// A body could not be decoded
    Parse,
}

/// Machine-readable error code: an HTTP status or a symbolic name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Status(u16),
    Named(&'static str),
}

impl ErrorCode {
    pub const NETWORK_ERROR: ErrorCode = ErrorCode::Named("NETWORK_ERROR");
    pub const PARSE_ERROR: ErrorCode = ErrorCode::Named("PARSE_ERROR");
    pub const AUTH_REQUIRED: ErrorCode = ErrorCode::Named("AUTH_REQUIRED");
    pub const INVALID_REQUEST: ErrorCode = ErrorCode::Named("INVALID_REQUEST");

    /// The HTTP status, if this code carries one
    pub fn status(&self) -> Option<u16> {
        match self {
            ErrorCode::Status(status) => Some(*status),
            ErrorCode::Named(_) => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Status(status) => write!(f, "{}", status),
            ErrorCode::Named(name) => f.write_str(name),
        }
    }
}

/// The uniform error surfaced to callers
///
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{message}")]
pub struct ApiError {
    message: String,
    code: ErrorCode,
    #[serde(skip)]
    kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ApiError {
    fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            kind,
            details: None,
        }
    }

    fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }

    /// Raised before any I/O when the stored credential has expired
    pub fn auth_required() -> Self {
        Self::new(
            ErrorKind::Auth,
            ErrorCode::AUTH_REQUIRED,
            "Authentication required: the session has expired",
        )
    }

    /// A failure with no response, e.g. a timeout
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, ErrorCode::NETWORK_ERROR, message)
    }

    /// A body that could not be decoded or encoded
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, ErrorCode::PARSE_ERROR, message)
    }

    /// A request that could not be built, e.g. a path that does not form a valid URL
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Client, ErrorCode::INVALID_REQUEST, message)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The HTTP status, if a response was received
    pub fn status(&self) -> Option<u16> {
        self.code.status()
    }

    /// Opaque extra information, usually the decoded error body
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// Whether the caller must re-authenticate
    pub fn is_auth(&self) -> bool {
        self.kind == ErrorKind::Auth
    }
}

/// A failure as observed at the transport boundary, before normalization
#[derive(Debug)]
pub enum RawFailure {
    /// The transport gave up before any response arrived
    Transport(TransportError),
    /// A response arrived with a non-2xx status
    Status {
        status: u16,
        status_text: String,
        body: String,
    },
    /// Anything else, e.g. a success body that is not valid JSON
    Unexpected(String),
}

impl From<TransportError> for RawFailure {
    fn from(err: TransportError) -> Self {
        RawFailure::Transport(err)
    }
}

impl From<serde_json::Error> for RawFailure {
    fn from(err: serde_json::Error) -> Self {
        RawFailure::Unexpected(err.to_string())
    }
}

/// Converts any raw failure into an `ApiError`
///
/// Never panics. For non-2xx responses the message comes from the body's
/// `message` field (or `error` if it is a string), falling back to the status
/// text. The decoded body, or the raw text if it is not JSON, becomes `details`.
pub fn normalize(raw: RawFailure) -> ApiError {
    match raw {
        RawFailure::Transport(err) => ApiError::network(err.to_string()),
        RawFailure::Status {
            status,
            status_text,
            body,
        } => {
            let decoded: Option<Value> = serde_json::from_str(&body).ok();
            let message = decoded
                .as_ref()
                .and_then(body_message)
                .map(str::to_string)
                .unwrap_or_else(|| fallback_message(status, &status_text));

            let details = match decoded {
                Some(value) => Some(value),
                None if !body.trim().is_empty() => Some(Value::String(body)),
                None => None,
            };

            ApiError::new(status_kind(status), ErrorCode::Status(status), message)
                .with_details(details)
        }
        RawFailure::Unexpected(message) => ApiError::parse(message),
    }
}

fn body_message(body: &Value) -> Option<&str> {
    body.get("message")
        .and_then(Value::as_str)
        .or_else(|| body.get("error").and_then(Value::as_str))
        .filter(|message| !message.trim().is_empty())
}

fn fallback_message(status: u16, status_text: &str) -> String {
    if status_text.trim().is_empty() {
        format!("Request failed with status {}", status)
    } else {
        status_text.to_string()
    }
}

fn status_kind(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::Auth,
        500..=u16::MAX => ErrorKind::Server,
        _ => ErrorKind::Client,
    }
}
