//! Write coordination: send, then invalidate or patch the cache.
//!
//! Mutations are fire-and-confirm. Nothing touches the cache until the
//! backend has accepted the write, so a failed write leaves every entry as it
//! was.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::{EntityCache, QueryKey};
use crate::error::{MutationError, QueryError};
use crate::notify::Notifier;

/// Derives the detail key a mutation result should be written to.
type KeyFn<R> = Box<dyn Fn(&R) -> QueryKey + Send + Sync>;

/// A pending write and the cache effects it has once confirmed.
pub struct MutationRequest<P, R> {
  /// Entity kind, for logs ("project", "task")
  pub kind: &'static str,
  pub payload: P,
  invalidates: Vec<QueryKey>,
  removes: Vec<QueryKey>,
  write_through: Option<KeyFn<R>>,
  success_message: Option<String>,
  error_context: String,
}

impl<P, R> MutationRequest<P, R> {
  pub fn new(kind: &'static str, payload: P) -> Self {
    Self {
      kind,
      payload,
      invalidates: Vec::new(),
      removes: Vec::new(),
      write_through: None,
      success_message: None,
      error_context: format!("Failed to save {}", kind),
    }
  }

  /// Mark every key under `prefix` stale on success.
  pub fn invalidate(mut self, prefix: QueryKey) -> Self {
    self.invalidates.push(prefix);
    self
  }

  /// Evict `key` on success (e.g. the detail entry of a deleted entity).
  pub fn remove(mut self, key: QueryKey) -> Self {
    self.removes.push(key);
    self
  }

  /// Store the returned entity at the key derived from it.
  pub fn write_through<K>(mut self, key_for: K) -> Self
  where
    K: Fn(&R) -> QueryKey + Send + Sync + 'static,
  {
    self.write_through = Some(Box::new(key_for));
    self
  }

  pub fn success_message(mut self, message: impl Into<String>) -> Self {
    self.success_message = Some(message.into());
    self
  }

  /// Prefix for the error reported on failure.
  pub fn error_context(mut self, context: impl Into<String>) -> Self {
    self.error_context = context.into();
    self
  }
}

/// Runs mutations and applies their cache effects.
#[derive(Clone)]
pub struct MutationClient {
  cache: EntityCache,
  notifier: Arc<dyn Notifier>,
}

impl MutationClient {
  pub fn new(cache: EntityCache, notifier: Arc<dyn Notifier>) -> Self {
    Self { cache, notifier }
  }

  pub fn cache(&self) -> &EntityCache {
    &self.cache
  }

  pub fn notifier(&self) -> &Arc<dyn Notifier> {
    &self.notifier
  }

  /// Send the write, then apply the request's cache effects.
  ///
  /// On success: invalidations, then removals, then write-through, then a
  /// success notification. On failure the cache is untouched, the sink gets
  /// exactly one error and the wrapped error is returned.
  pub async fn mutate<P, R, F, Fut>(
    &self,
    request: MutationRequest<P, R>,
    mutate_fn: F,
  ) -> Result<R, MutationError>
  where
    R: Serialize,
    F: FnOnce(P) -> Fut,
    Fut: Future<Output = Result<R, QueryError>>,
  {
    let MutationRequest {
      kind,
      payload,
      invalidates,
      removes,
      write_through,
      success_message,
      error_context,
    } = request;

    debug!(kind, "mutation pending");
    match mutate_fn(payload).await {
      Ok(result) => {
        for prefix in &invalidates {
          let touched = self.cache.invalidate_prefix(prefix);
          debug!(kind, %prefix, touched, "invalidated");
        }
        for key in &removes {
          self.cache.remove(key);
        }
        if let Some(key_for) = write_through {
          let key = key_for(&result);
          match serde_json::to_value(&result) {
            Ok(value) => self.cache.put(&key, value, self.cache.now()),
            Err(e) => warn!(kind, %key, error = %e, "could not write result to cache"),
          }
        }
        if let Some(message) = success_message {
          self.notifier.success(&message);
        }
        debug!(kind, "mutation succeeded");
        Ok(result)
      }
      Err(source) => {
        let err = MutationError {
          context: error_context,
          source,
        };
        warn!(kind, error = %err, "mutation failed");
        self.notifier.error(&err.to_string());
        Err(err)
      }
    }
  }
}

/// The state of a mutation handle.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState<R> {
  Idle,
  Pending,
  Success(R),
  Error(MutationError),
}

/// One consumer's handle on a write, polled like a [`crate::query::QueryObserver`].
///
/// Moves `Idle → Pending → Success | Error`. Both outcomes are terminal;
/// calling [`Mutation::mutate`] again starts a new cycle.
pub struct Mutation<R> {
  client: MutationClient,
  state: MutationState<R>,
  receiver: Option<mpsc::UnboundedReceiver<Result<R, MutationError>>>,
}

impl<R> Mutation<R>
where
  R: Serialize + Send + 'static,
{
  pub fn new(client: MutationClient) -> Self {
    Self {
      client,
      state: MutationState::Idle,
      receiver: None,
    }
  }

  /// Start the write. Returns false (and does nothing) while one is pending.
  pub fn mutate<P, F, Fut>(&mut self, request: MutationRequest<P, R>, mutate_fn: F) -> bool
  where
    P: Send + 'static,
    F: FnOnce(P) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, QueryError>> + Send + 'static,
  {
    if self.is_pending() {
      return false;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = MutationState::Pending;

    let client = self.client.clone();
    tokio::spawn(async move {
      let result = client.mutate(request, mutate_fn).await;
      let _ = tx.send(result);
    });
    true
  }

  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.state = match result {
          Ok(data) => MutationState::Success(data),
          Err(e) => MutationState::Error(e),
        };
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = MutationState::Error(MutationError {
          context: "Mutation was cancelled".to_string(),
          source: QueryError::InFlightLost,
        });
        self.receiver = None;
        true
      }
    }
  }

  /// Back to idle. A pending result is dropped; the write itself still lands.
  pub fn reset(&mut self) {
    self.receiver = None;
    self.state = MutationState::Idle;
  }

  pub fn state(&self) -> &MutationState<R> {
    &self.state
  }

  pub fn is_idle(&self) -> bool {
    matches!(self.state, MutationState::Idle)
  }

  pub fn is_pending(&self) -> bool {
    matches!(self.state, MutationState::Pending)
  }

  pub fn is_success(&self) -> bool {
    matches!(self.state, MutationState::Success(_))
  }

  pub fn data(&self) -> Option<&R> {
    match &self.state {
      MutationState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&MutationError> {
    match &self.state {
      MutationState::Error(e) => Some(e),
      _ => None,
    }
  }
}
