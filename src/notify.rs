//! User-facing feedback for completed operations.

use std::sync::{Mutex, PoisonError};
use tracing::{error, info};

/// Receives success/failure signals. Fire-and-forget.
pub trait Notifier: Send + Sync {
  fn success(&self, message: &str);
  fn error(&self, message: &str);
  fn info(&self, message: &str);
}

/// Routes notifications into the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
  fn success(&self, message: &str) {
    info!(kind = "success", "{}", message);
  }

  fn error(&self, message: &str) {
    error!(kind = "error", "{}", message);
  }

  fn info(&self, message: &str) {
    info!(kind = "info", "{}", message);
  }
}

/// Prints notifications to stderr, keeping stdout for command output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
  fn success(&self, message: &str) {
    eprintln!("✓ {}", message);
  }

  fn error(&self, message: &str) {
    eprintln!("✗ {}", message);
  }

  fn info(&self, message: &str) {
    eprintln!("  {}", message);
  }
}

/// A recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
  Success(String),
  Error(String),
  Info(String),
}

/// Keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
  received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn notifications(&self) -> Vec<Notification> {
    self
      .received
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn errors(&self) -> Vec<String> {
    self
      .notifications()
      .into_iter()
      .filter_map(|n| match n {
        Notification::Error(m) => Some(m),
        _ => None,
      })
      .collect()
  }

  pub fn successes(&self) -> Vec<String> {
    self
      .notifications()
      .into_iter()
      .filter_map(|n| match n {
        Notification::Success(m) => Some(m),
        _ => None,
      })
      .collect()
  }

  fn push(&self, n: Notification) {
    self
      .received
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(n);
  }
}

impl Notifier for RecordingNotifier {
  fn success(&self, message: &str) {
    self.push(Notification::Success(message.to_string()));
  }

  fn error(&self, message: &str) {
    self.push(Notification::Error(message.to_string()));
  }

  fn info(&self, message: &str) {
    self.push(Notification::Info(message.to_string()));
  }
}
