//! The uniform response wrapper used by every backend endpoint.

use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// `{ "success": bool, "data"?: T, "message"?: string }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
  pub success: bool,
  // No `default` here: it would make Deserialize require `T: Default`.
  // A missing `data` still comes out as `None`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl<T> Envelope<T> {
  pub fn ok(data: T) -> Self {
    Self {
      success: true,
      data: Some(data),
      message: None,
    }
  }

  pub fn failure(message: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      message: Some(message.into()),
    }
  }

  /// Unwrap into the payload.
  ///
  /// `success = false` and a successful envelope without `data` are treated
  /// the same: both become [`QueryError::Envelope`] with the carried message.
  pub fn into_result(self) -> Result<T, QueryError> {
    let Envelope {
      success,
      data,
      message,
    } = self;
    match (success, data) {
      (true, Some(data)) => Ok(data),
      _ => Err(QueryError::envelope(message)),
    }
  }
}
