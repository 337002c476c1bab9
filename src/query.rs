//! Async query coordination on top of the entity cache.
//!
//! Inspired by TanStack Query. [`QueryClient`] decides, per read, whether the
//! cache can answer or a fetch is needed, and guarantees that concurrent reads
//! of the same key share one request. [`QueryObserver`] wraps a single query
//! in the loading/success/error state a UI polls from its event loop.
//!
//! # Example
//!
//! ```ignore
//! let api = api_client.clone();
//! let key = QueryKey::new("projects").with(json!({}));
//! let projects: Vec<Project> = queries
//!     .fetch_query(&key, &QueryOptions::default(), move || {
//!         let api = api.clone();
//!         async move { api.list_projects(&ProjectFilter::default()).await }
//!     })
//!     .await?;
//! ```

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::{EntityCache, FetchTicket, QueryKey, DEFAULT_STALE_TIME};
use crate::error::QueryError;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Additional attempts after the first failure
  pub retries: u32,
  /// Delay before the first retry; doubles each attempt
  pub base_delay: Duration,
  /// Upper bound on any single delay
  pub max_delay: Duration,
}

impl RetryPolicy {
  /// Never retry.
  pub fn none() -> Self {
    Self {
      retries: 0,
      ..Self::default()
    }
  }

  /// Delay before retry number `attempt` (0-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(16);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries: 2,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }
}

/// Per-query overrides of the client defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  pub stale_time: Option<Duration>,
  pub retry: Option<RetryPolicy>,
}

impl QueryOptions {
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }
}

/// What a consumer sees for a read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
  /// Latest known data, possibly stale
  pub data: Option<T>,
  /// No data yet and a fetch is pending
  pub is_loading: bool,
  /// A fetch (initial or background) is pending
  pub is_fetching: bool,
  /// Last fetch failure, if the latest fetch failed
  pub error: Option<QueryError>,
}

impl<T> QueryResult<T> {
  fn ready(data: T) -> Self {
    Self {
      data: Some(data),
      is_loading: false,
      is_fetching: false,
      error: None,
    }
  }

  fn failed(error: QueryError) -> Self {
    Self {
      data: None,
      is_loading: false,
      is_fetching: false,
      error: Some(error),
    }
  }
}

/// Coordinates reads against an [`EntityCache`].
///
/// Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct QueryClient {
  cache: EntityCache,
  stale_time: Duration,
  retry: RetryPolicy,
}

impl QueryClient {
  pub fn new(cache: EntityCache) -> Self {
    Self {
      cache,
      stale_time: DEFAULT_STALE_TIME,
      retry: RetryPolicy::default(),
    }
  }

  /// Default stale time for queries that don't set their own.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Default retry policy for queries that don't set their own.
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn cache(&self) -> &EntityCache {
    &self.cache
  }

  /// Read `key` with stale-while-revalidate semantics.
  ///
  /// - Fresh entry: cached data, no fetch.
  /// - Stale entry with data: cached data right away, `is_fetching` set and
  ///   a background refresh started (or joined).
  /// - Otherwise: waits for the fetch.
  ///
  /// When the last refresh failed but older data exists, both are returned.
  pub async fn query<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: &QueryOptions,
    fetcher: F,
  ) -> QueryResult<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    if let Some(entry) = self.cache.get(key) {
      let cached = entry.data.clone().and_then(|v| decode::<T>(v).ok());
      if let Some(data) = cached {
        if self.cache.is_fresh(&entry) {
          return QueryResult::ready(data);
        }
        self.start_fetch(key, options, Arc::new(fetcher));
        return QueryResult {
          data: Some(data),
          is_loading: false,
          is_fetching: true,
          error: entry.error,
        };
      }
    }

    match self.fetch_query(key, options, fetcher).await {
      Ok(data) => QueryResult::ready(data),
      Err(e) => QueryResult::failed(e),
    }
  }

  /// Read `key`, waiting for a fetch unless the cached entry is fresh.
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: &QueryOptions,
    fetcher: F,
  ) -> Result<T, QueryError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    if let Some(entry) = self.cache.get(key) {
      if self.cache.is_fresh(&entry) {
        if let Some(data) = entry.data {
          match decode(data) {
            Ok(data) => return Ok(data),
            Err(e) => debug!(%key, error = %e, "cached value did not decode, refetching"),
          }
        }
      }
    }

    let fetcher = Arc::new(fetcher);
    let ticket = self.start_fetch(key, options, fetcher.clone());
    match ticket.handle.await {
      Err(QueryError::InFlightLost) => {
        warn!(%key, seq = ticket.seq, "in-flight request lost, fetching again");
        self.cache.clear_in_flight(key, ticket.seq);
        let retry = self.start_fetch(key, options, fetcher);
        decode(retry.handle.await?)
      }
      result => decode(result?),
    }
  }

  /// Warm the cache for `key` if it is not fresh.
  pub async fn prefetch<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: &QueryOptions,
    fetcher: F,
  ) -> Result<(), QueryError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    self.fetch_query::<T, _, _>(key, options, fetcher).await.map(|_| ())
  }

  /// Cached data for `key`, fresh or not.
  pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    self
      .cache
      .get(key)
      .and_then(|e| e.data)
      .and_then(|v| decode(v).ok())
  }

  /// Write `data` straight into the cache as a fresh value.
  pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<(), QueryError> {
    let value = serde_json::to_value(data)?;
    self.cache.put(key, value, self.cache.now());
    Ok(())
  }

  pub fn invalidate(&self, key: &QueryKey) -> bool {
    self.cache.invalidate(key)
  }

  /// Wait for the request in flight for `key`, if any, then report what the
  /// cache holds.
  ///
  /// Used after [`QueryClient::query`] answered with stale data and a
  /// background refresh. The last known data survives a failed refresh and
  /// is returned alongside the error.
  pub async fn settled<T: DeserializeOwned>(&self, key: &QueryKey) -> QueryResult<T> {
    let failure = match self.cache.in_flight(key) {
      Some(handle) => handle.await.err(),
      None => None,
    };
    let entry = self.cache.get(key);
    let data = entry
      .as_ref()
      .and_then(|e| e.data.clone())
      .and_then(|v| decode(v).ok());
    QueryResult {
      data,
      is_loading: false,
      is_fetching: false,
      error: failure.or_else(|| entry.and_then(|e| e.error)),
    }
  }

  pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
    self.cache.invalidate_prefix(prefix)
  }

  /// Join the fetch in flight for `key` or spawn a new one.
  ///
  /// The fetch runs on its own task and writes into the cache when done,
  /// whether or not anybody is still waiting for it.
  fn start_fetch<T, F, Fut>(
    &self,
    key: &QueryKey,
    options: &QueryOptions,
    fetcher: Arc<F>,
  ) -> FetchTicket
  where
    T: Serialize + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    let stale_time = options.stale_time.unwrap_or(self.stale_time);
    let retry = options.retry.clone().unwrap_or_else(|| self.retry.clone());
    let cache = self.cache.clone();
    let task_key = key.clone();

    let ticket = self.cache.begin_fetch(key, stale_time, move |seq| {
      let task = tokio::spawn(run_fetch(cache, task_key, seq, retry, fetcher));
      async move { task.await.unwrap_or(Err(QueryError::InFlightLost)) }
        .boxed()
        .shared()
    });

    if ticket.started {
      debug!(%key, seq = ticket.seq, "fetch started");
    } else {
      debug!(%key, seq = ticket.seq, "joined in-flight fetch");
    }
    ticket
  }
}

/// Fetch with retries, then record the outcome under `seq`.
async fn run_fetch<T, F, Fut>(
  cache: EntityCache,
  key: QueryKey,
  seq: u64,
  retry: RetryPolicy,
  fetcher: Arc<F>,
) -> Result<Value, QueryError>
where
  T: Serialize,
  F: Fn() -> Fut,
  Fut: Future<Output = Result<T, QueryError>>,
{
  let mut attempt = 0;
  loop {
    let result = (*fetcher)()
      .await
      .and_then(|data| serde_json::to_value(data).map_err(QueryError::from));

    match result {
      Ok(value) => {
        if cache.put_if_newer(&key, value.clone(), cache.now(), seq) {
          debug!(%key, seq, attempts = attempt + 1, "fetch applied");
          return Ok(value);
        }
        // A newer write landed first; hand waiters what the cache holds
        debug!(%key, seq, "discarding out-of-date response");
        let current = cache.get(&key).and_then(|e| e.data);
        return Ok(current.unwrap_or(value));
      }
      Err(e) if attempt < retry.retries => {
        let delay = retry.delay_for(attempt);
        attempt += 1;
        warn!(%key, attempt, error = %e, ?delay, "fetch failed, retrying");
        tokio::time::sleep(delay).await;
      }
      Err(e) => {
        warn!(%key, seq, error = %e, "fetch failed");
        cache.set_error(&key, e.clone(), seq);
        return Err(e);
      }
    }
  }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, QueryError> {
  serde_json::from_value(value).map_err(QueryError::from)
}

/// The state of an observed query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(QueryError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&QueryError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A boxed future that returns a Result<T, QueryError>
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, QueryError>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// One consumer's view of a query.
///
/// QueryObserver<T> encapsulates:
/// - The key and fetching logic
/// - Loading/success/error states
/// - Async result handling via channels, polled from an event loop
///
/// Any number of observers may watch the same key; the [`QueryClient`]
/// makes sure they share one request.
pub struct QueryObserver<T> {
  client: QueryClient,
  key: QueryKey,
  options: QueryOptions,
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<QueryResult<T>>>,
}

impl<T> QueryObserver<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Create an observer for `key`.
  ///
  /// The fetcher is a closure that returns a future. It is only invoked when
  /// the client decides a network fetch is needed.
  pub fn new<F, Fut>(client: QueryClient, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
  {
    Self {
      client,
      key,
      options: QueryOptions::default(),
      state: QueryState::Idle,
      fetcher: Arc::new(move || -> BoxFuture<T> { Box::pin(fetcher()) }),
      receiver: None,
    }
  }

  pub fn with_options(mut self, options: QueryOptions) -> Self {
    self.options = options;
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Get the data if the query succeeded.
  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&QueryError> {
    self.state.error()
  }

  /// True when the cached entry for this key is missing, stale or invalidated.
  pub fn is_stale(&self) -> bool {
    let cache = self.client.cache();
    cache
      .get(&self.key)
      .map(|entry| !cache.is_fresh(&entry))
      .unwrap_or(true)
  }

  /// Start reading if not already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start();
  }

  /// Force a new read, abandoning any pending result.
  pub fn refetch(&mut self) {
    // Dropping the receiver detaches; the underlying fetch still lands in the cache
    self.receiver = None;
    self.client.invalidate(&self.key);
    self.start();
  }

  /// Poll for results from a pending read.
  ///
  /// Returns `true` if the state changed (data arrived or error occurred).
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(result) => {
        // Stale data first; the refreshed result follows on the same channel
        let refreshing = result.is_fetching;
        self.state = match (result.data, result.error) {
          (Some(data), _) => QueryState::Success(data),
          (None, Some(error)) => QueryState::Error(error),
          (None, None) => QueryState::Error(QueryError::envelope(None)),
        };
        if !refreshing {
          self.receiver = None;
        }
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = QueryState::Error(QueryError::InFlightLost);
        self.receiver = None;
        true
      }
    }
  }

  fn start(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if self.state.data().is_none() {
      self.state = QueryState::Loading;
    }

    let client = self.client.clone();
    let key = self.key.clone();
    let options = self.options.clone();
    let fetcher = self.fetcher.clone();
    tokio::spawn(async move {
      let result = client.query(&key, &options, move || fetcher()).await;
      let refreshing = result.is_fetching;
      // A send error means the observer was dropped or detached
      if tx.send(result).is_err() || !refreshing {
        return;
      }
      let settled = client.settled::<T>(&key).await;
      let _ = tx.send(settled);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ManualClock;
  use serde_json::json;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn projects_key() -> QueryKey {
    QueryKey::new("projects").with(json!({}))
  }

  fn client() -> QueryClient {
    QueryClient::new(EntityCache::new()).with_retry(RetryPolicy::none())
  }

  fn counting_fetcher(
    calls: Arc<AtomicU32>,
    delay: Duration,
  ) -> impl Fn() -> BoxFuture<Vec<String>> + Send + Sync + 'static {
    move || {
      let calls = calls.clone();
      Box::pin(async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        Ok(vec!["alpha".to_string()])
      })
    }
  }

  async fn poll_until_settled<T>(observer: &mut QueryObserver<T>)
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    tokio::time::timeout(Duration::from_secs(2), async {
      while !observer.poll() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("observer did not settle");
  }

  #[tokio::test]
  async fn test_empty_cache_fetches_once_and_populates() {
    let key = projects_key();
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));

    let data: Vec<String> = client
      .fetch_query(
        &key,
        &QueryOptions::default(),
        counting_fetcher(calls.clone(), Duration::ZERO),
      )
      .await
      .unwrap();

    assert_eq!(data, vec!["alpha".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let entry = client.cache().get(&key).unwrap();
    assert_eq!(entry.data, Some(json!(["alpha"])));
    assert!(!entry.is_fetching());
  }

  #[tokio::test]
  async fn test_fresh_entry_skips_network() {
    let key = projects_key();
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default();

    for _ in 0..3 {
      let _: Vec<String> = client
        .fetch_query(
          &key,
          &options,
          counting_fetcher(calls.clone(), Duration::ZERO),
        )
        .await
        .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_concurrent_reads_share_one_fetch() {
    let key = projects_key();
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default();
    let delay = Duration::from_millis(50);

    let (a, b) = tokio::join!(
      client.fetch_query::<Vec<String>, _, _>(
        &key,
        &options,
        counting_fetcher(calls.clone(), delay)
      ),
      client.fetch_query::<Vec<String>, _, _>(
        &key,
        &options,
        counting_fetcher(calls.clone(), delay)
      ),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), b.unwrap());
  }

  #[tokio::test]
  async fn test_concurrent_readers_share_the_same_error() {
    let key = projects_key();
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default();

    let failing = |calls: Arc<AtomicU32>| {
      move || {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(20)).await;
          Err::<Vec<String>, _>(QueryError::Envelope("boom".to_string()))
        }
      }
    };

    let (a, b) = tokio::join!(
      client.fetch_query(&key, &options, failing(calls.clone())),
      client.fetch_query(&key, &options, failing(calls.clone())),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap_err(), QueryError::Envelope("boom".to_string()));
    assert_eq!(b.unwrap_err(), QueryError::Envelope("boom".to_string()));
  }

  #[tokio::test]
  async fn test_no_refetch_before_stale_time() {
    let key = projects_key();
    let clock = Arc::new(ManualClock::default());
    let client = QueryClient::new(EntityCache::with_clock(clock.clone()))
      .with_retry(RetryPolicy::none())
      .with_stale_time(Duration::from_secs(300));
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default();

    let read = || {
      client.fetch_query::<Vec<String>, _, _>(
        &key,
        &options,
        counting_fetcher(calls.clone(), Duration::ZERO),
      )
    };

    read().await.unwrap();
    clock.advance(chrono::TimeDelta::seconds(299));
    read().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(chrono::TimeDelta::seconds(1));
    read().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidation_forces_refetch() {
    let key = projects_key();
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::default();

    let _: Vec<String> = client
      .fetch_query(&key, &options, counting_fetcher(calls.clone(), Duration::ZERO))
      .await
      .unwrap();
    client.invalidate_prefix(&QueryKey::new("projects"));
    let _: Vec<String> = client
      .fetch_query(&key, &options, counting_fetcher(calls.clone(), Duration::ZERO))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_retry_then_success() {
    let key = projects_key();
    let client = QueryClient::new(EntityCache::new()).with_retry(RetryPolicy {
      retries: 2,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(5),
    });
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher_calls = calls.clone();

    let result = client
      .query(&key, &QueryOptions::default(), move || {
        let calls = fetcher_calls.clone();
        async move {
          if calls.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(QueryError::Transport("connection reset".to_string()))
          } else {
            Ok(vec!["alpha".to_string()])
          }
        }
      })
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.data, Some(vec!["alpha".to_string()]));
    assert_eq!(result.error, None);
    let entry = client.cache().get(&key).unwrap();
    assert!(client.cache().is_fresh(&entry));
    assert!(entry.error.is_none());
  }

  #[tokio::test]
  async fn test_retries_exhausted_surfaces_error_and_keeps_data() {
    let key = projects_key();
    let client = QueryClient::new(EntityCache::new()).with_retry(RetryPolicy {
      retries: 2,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(1),
    });
    client
      .set_query_data(&key, &vec!["old".to_string()])
      .unwrap();
    client.invalidate(&key);
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher_calls = calls.clone();

    let result = client
      .fetch_query::<Vec<String>, _, _>(&key, &QueryOptions::default(), move || {
        let calls = fetcher_calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Err(QueryError::Timeout)
        }
      })
      .await;

    assert_eq!(result, Err(QueryError::Timeout));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let entry = client.cache().get(&key).unwrap();
    assert_eq!(entry.data, Some(json!(["old"])));
    assert_eq!(entry.error, Some(QueryError::Timeout));
    assert!(!entry.is_fetching());
  }

  #[tokio::test]
  async fn test_stale_data_served_while_revalidating() {
    let key = projects_key();
    let client = client();
    client
      .set_query_data(&key, &vec!["old".to_string()])
      .unwrap();
    client.invalidate(&key);
    let calls = Arc::new(AtomicU32::new(0));

    let result: QueryResult<Vec<String>> = client
      .query(
        &key,
        &QueryOptions::default(),
        counting_fetcher(calls.clone(), Duration::from_millis(20)),
      )
      .await;

    assert_eq!(result.data, Some(vec!["old".to_string()]));
    assert!(result.is_fetching);
    assert!(!result.is_loading);

    // Wait for the background refresh to land
    let handle = client.cache().in_flight(&key).unwrap();
    handle.await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
      client.get_query_data::<Vec<String>>(&key),
      Some(vec!["alpha".to_string()])
    );
  }

  #[tokio::test]
  async fn test_stale_data_returned_with_last_refresh_error() {
    let key = projects_key();
    let client = client();
    let options = QueryOptions::default();
    client
      .set_query_data(&key, &vec!["old".to_string()])
      .unwrap();
    client.invalidate(&key);

    let failing = || async { Err::<Vec<String>, _>(QueryError::Transport("offline".to_string())) };
    let first = client.fetch_query(&key, &options, failing).await;
    assert!(first.is_err());

    let result: QueryResult<Vec<String>> = client.query(&key, &options, failing).await;
    assert_eq!(result.data, Some(vec!["old".to_string()]));
    assert_eq!(
      result.error,
      Some(QueryError::Transport("offline".to_string()))
    );
    assert!(result.is_fetching);

    let settled: QueryResult<Vec<String>> = client.settled(&key).await;
    assert_eq!(settled.data, Some(vec!["old".to_string()]));
    assert!(settled.error.is_some());
    assert!(!settled.is_fetching);
  }

  #[tokio::test]
  async fn test_prefetch_warms_cache() {
    let key = projects_key();
    let client = client();
    let options = QueryOptions::default();
    let calls = Arc::new(AtomicU32::new(0));

    client
      .prefetch(&key, &options, counting_fetcher(calls.clone(), Duration::ZERO))
      .await
      .unwrap();
    let data: Vec<String> = client
      .fetch_query(&key, &options, counting_fetcher(calls.clone(), Duration::ZERO))
      .await
      .unwrap();

    assert_eq!(data, vec!["alpha".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_slow_older_response_does_not_overwrite_newer_write() {
    let client = client();
    let key = projects_key();
    let options = QueryOptions::default();

    let slow = client.fetch_query::<Vec<String>, _, _>(&key, &options, || async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(vec!["stale".to_string()])
    });
    let write = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      client
        .set_query_data(&key, &vec!["fresh".to_string()])
        .unwrap();
    };
    let (result, _) = tokio::join!(slow, write);

    assert_eq!(result.unwrap(), vec!["fresh".to_string()]);
    assert_eq!(
      client.get_query_data::<Vec<String>>(&key),
      Some(vec!["fresh".to_string()])
    );
  }

  #[tokio::test]
  async fn test_lost_in_flight_triggers_fresh_fetch() {
    let key = projects_key();
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher_calls = calls.clone();

    let result = client
      .fetch_query::<u32, _, _>(&key, &QueryOptions::default(), move || {
        let calls = fetcher_calls.clone();
        async move {
          if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("fetch task died");
          }
          Ok(7)
        }
      })
      .await;

    assert_eq!(result, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_observer_loading_then_success() {
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));
    let mut observer = QueryObserver::new(
      client.clone(),
      projects_key(),
      counting_fetcher(calls.clone(), Duration::from_millis(10)),
    );

    assert!(matches!(observer.state(), QueryState::Idle));
    assert!(observer.is_stale());

    observer.fetch();
    assert!(observer.is_loading());

    // Second fetch should be no-op
    observer.fetch();
    poll_until_settled(&mut observer).await;

    assert!(!observer.is_loading());
    assert!(observer.is_success());
    assert_eq!(observer.data(), Some(&vec!["alpha".to_string()]));
    assert!(!observer.is_stale());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_observers_of_same_key_share_fetch() {
    let client = client();
    let calls = Arc::new(AtomicU32::new(0));
    let delay = Duration::from_millis(30);
    let mut first = QueryObserver::new(
      client.clone(),
      projects_key(),
      counting_fetcher(calls.clone(), delay),
    );
    let mut second = QueryObserver::new(
      client.clone(),
      projects_key(),
      counting_fetcher(calls.clone(), delay),
    );

    first.fetch();
    second.fetch();
    poll_until_settled(&mut first).await;
    poll_until_settled(&mut second).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.data(), second.data());
  }

  #[tokio::test]
  async fn test_observer_refetch_delivers_new_data() {
    let client = client();
    let key = projects_key();
    client
      .set_query_data(&key, &vec!["old".to_string()])
      .unwrap();
    let mut observer: QueryObserver<Vec<String>> =
      QueryObserver::new(client.clone(), key.clone(), || async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(vec!["new".to_string()])
      });

    observer.fetch();
    poll_until_settled(&mut observer).await;
    assert_eq!(observer.data(), Some(&vec!["old".to_string()]));

    observer.refetch();
    let expected = vec!["new".to_string()];
    tokio::time::timeout(Duration::from_secs(2), async {
      while observer.data() != Some(&expected) {
        observer.poll();
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("refetched data never reached the observer");

    assert!(observer.is_success());
    assert!(!observer.poll());
    assert_eq!(
      client.get_query_data::<Vec<String>>(&key),
      Some(expected)
    );
  }

  #[tokio::test]
  async fn test_observer_error() {
    let client = client();
    let mut observer: QueryObserver<i32> =
      QueryObserver::new(client, projects_key(), || async {
        Err(QueryError::Envelope("Something went wrong".to_string()))
      });

    observer.fetch();
    poll_until_settled(&mut observer).await;

    assert!(observer.is_error());
    assert_eq!(
      observer.error(),
      Some(&QueryError::Envelope("Something went wrong".to_string()))
    );
  }

  #[test]
  fn test_retry_backoff_is_bounded() {
    let policy = RetryPolicy {
      retries: 5,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    };
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    assert_eq!(policy.delay_for(5), Duration::from_secs(30));
    assert_eq!(policy.delay_for(40), Duration::from_secs(30));
  }
}
