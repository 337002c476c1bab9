//! Typed errors surfaced by the query and mutation coordinators.

use thiserror::Error;

/// Default message used when the backend reports failure without one.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Request failed";

/// Normalized failure of a remote read or write.
///
/// Transport and envelope failures are both folded into this one shape before
/// they reach consumers or the notification sink. It is `Clone` so every
/// waiter attached to a deduplicated request receives the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
  /// No response was received (connection refused, DNS, reset...)
  #[error("Network error: {0}")]
  Transport(String),

  /// The request exceeded the client timeout
  #[error("Request timed out")]
  Timeout,

  /// Non-success HTTP status without a usable envelope
  #[error("HTTP {status}: {message}")]
  Http { status: u16, message: String },

  /// The envelope reported `success = false`, or carried no data
  #[error("{0}")]
  Envelope(String),

  /// The response body could not be decoded into the expected type
  #[error("Failed to decode response: {0}")]
  Decode(String),

  /// The pending request backing an in-flight marker went away
  #[error("In-flight request was lost")]
  InFlightLost,
}

impl QueryError {
  /// Build an envelope failure, falling back to the default message.
  pub fn envelope(message: Option<String>) -> Self {
    match message {
      Some(m) if !m.trim().is_empty() => Self::Envelope(m),
      _ => Self::Envelope(DEFAULT_FAILURE_MESSAGE.to_string()),
    }
  }
}

impl From<reqwest::Error> for QueryError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      Self::Timeout
    } else if e.is_decode() {
      Self::Decode(e.to_string())
    } else if let Some(status) = e.status() {
      Self::Http {
        status: status.as_u16(),
        message: e.to_string(),
      }
    } else {
      Self::Transport(e.to_string())
    }
  }
}

impl From<serde_json::Error> for QueryError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}

/// Client-side rejection of a form payload. Raised before any network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
  pub field: &'static str,
  pub message: String,
}

impl ValidationError {
  pub fn new(field: &'static str, message: impl Into<String>) -> Self {
    Self {
      field,
      message: message.into(),
    }
  }
}

/// A failed write, wrapped with what was being attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{context}: {source}")]
pub struct MutationError {
  pub context: String,
  #[source]
  pub source: QueryError,
}

/// Errors returned by the typed project/task client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
  #[error("Invalid input - {0}")]
  Validation(#[from] ValidationError),

  #[error(transparent)]
  Query(#[from] QueryError),

  #[error(transparent)]
  Mutation(#[from] MutationError),
}
