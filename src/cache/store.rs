//! In-memory entity cache with staleness tracking and in-flight markers.

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::key::QueryKey;
use crate::error::QueryError;

/// Default time before fetched data is considered stale.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);

/// A pending request that any number of readers can await.
pub type FetchHandle = Shared<BoxFuture<'static, Result<Value, QueryError>>>;

#[derive(Clone)]
struct InFlight {
  seq: u64,
  handle: FetchHandle,
}

/// Outcome of [`EntityCache::begin_fetch`].
pub struct FetchTicket {
  pub handle: FetchHandle,
  pub seq: u64,
  /// False when the caller attached to a request that was already in flight
  pub started: bool,
}

/// One cache slot.
#[derive(Clone)]
pub struct CacheEntry {
  /// Last known value, kept across invalidations and failed refreshes
  pub data: Option<Value>,
  /// When `data` was last successfully fetched or written
  pub fetched_at: Option<DateTime<Utc>>,
  /// How long `data` stays fresh after `fetched_at`
  pub stale_time: Duration,
  /// Set by invalidation; forces the next read to refetch
  pub invalidated: bool,
  /// Most recent fetch failure, cleared by the next successful write
  pub error: Option<QueryError>,
  in_flight: Option<InFlight>,
  applied_seq: u64,
  /// Requests issued before this sequence number land stale
  invalidated_seq: u64,
}

impl CacheEntry {
  fn empty(stale_time: Duration) -> Self {
    Self {
      data: None,
      fetched_at: None,
      stale_time,
      invalidated: false,
      error: None,
      in_flight: None,
      applied_seq: 0,
      invalidated_seq: 0,
    }
  }

  /// Fresh iff not invalidated and `now - fetched_at < stale_time`.
  pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
    if self.invalidated {
      return false;
    }
    let Some(fetched_at) = self.fetched_at else {
      return false;
    };
    match TimeDelta::from_std(self.stale_time) {
      Ok(stale_time) => now - fetched_at < stale_time,
      // Larger than chrono can represent: never goes stale
      Err(_) => true,
    }
  }

  pub fn is_fetching(&self) -> bool {
    self.in_flight.is_some()
  }

  /// Sequence number of the pending request, if any.
  pub fn in_flight_seq(&self) -> Option<u64> {
    self.in_flight.as_ref().map(|f| f.seq)
  }

  /// Sequence number of the write currently reflected in `data`.
  pub fn applied_seq(&self) -> u64 {
    self.applied_seq
  }
}

impl PartialEq for CacheEntry {
  fn eq(&self, other: &Self) -> bool {
    self.data == other.data
      && self.fetched_at == other.fetched_at
      && self.stale_time == other.stale_time
      && self.invalidated == other.invalidated
      && self.error == other.error
      && self.in_flight_seq() == other.in_flight_seq()
      && self.applied_seq == other.applied_seq
      && self.invalidated_seq == other.invalidated_seq
  }
}

impl fmt::Debug for CacheEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheEntry")
      .field("data", &self.data)
      .field("fetched_at", &self.fetched_at)
      .field("stale_time", &self.stale_time)
      .field("invalidated", &self.invalidated)
      .field("error", &self.error)
      .field("in_flight", &self.in_flight_seq())
      .field("applied_seq", &self.applied_seq)
      .finish()
  }
}

/// Counts by entry state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: usize,
  pub fresh: usize,
  pub stale: usize,
  pub in_flight: usize,
  pub errored: usize,
}

/// Keyed store of query results.
///
/// Cloning yields another handle onto the same state. Every operation takes
/// the lock once and never across an await, so readers see either the whole
/// write or none of it.
#[derive(Clone)]
pub struct EntityCache {
  entries: Arc<Mutex<HashMap<QueryKey, CacheEntry>>>,
  seq: Arc<AtomicU64>,
  clock: Arc<dyn Clock>,
  default_stale_time: Duration,
}

impl EntityCache {
  pub fn new() -> Self {
    Self::with_clock(Arc::new(SystemClock))
  }

  pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
    Self {
      entries: Arc::new(Mutex::new(HashMap::new())),
      seq: Arc::new(AtomicU64::new(0)),
      clock,
      default_stale_time: DEFAULT_STALE_TIME,
    }
  }

  /// Stale time for entries created by plain `put`.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.default_stale_time = stale_time;
    self
  }

  pub fn default_stale_time(&self) -> Duration {
    self.default_stale_time
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Next request sequence number. Strictly increasing, starts at 1.
  pub fn next_seq(&self) -> u64 {
    self.seq.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Snapshot of the entry for `key`.
  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().get(key).cloned()
  }

  pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
    entry.is_fresh_at(self.now())
  }

  /// Overwrite the value for `key` and clear any in-flight marker.
  ///
  /// Takes a new sequence number, so fetches issued before this write can no
  /// longer overwrite it.
  pub fn put(&self, key: &QueryKey, value: Value, timestamp: DateTime<Utc>) {
    let seq = self.next_seq();
    let mut entries = self.lock();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::empty(self.default_stale_time));
    apply(entry, value, timestamp, seq);
    entry.in_flight = None;
  }

  /// Apply a fetch completion tagged with `seq`.
  ///
  /// Returns false, leaving the value untouched, when a newer write has
  /// already been applied. A request issued before the last invalidation is
  /// applied but stays stale, so the next read still goes to the network.
  pub fn put_if_newer(
    &self,
    key: &QueryKey,
    value: Value,
    timestamp: DateTime<Utc>,
    seq: u64,
  ) -> bool {
    let mut entries = self.lock();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::empty(self.default_stale_time));
    release(entry, seq);
    if seq < entry.applied_seq {
      return false;
    }
    apply(entry, value, timestamp, seq);
    if seq < entry.invalidated_seq {
      entry.invalidated = true;
    }
    true
  }

  /// Record a failed fetch. Last known data is kept.
  pub fn set_error(&self, key: &QueryKey, error: QueryError, seq: u64) {
    let mut entries = self.lock();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::empty(self.default_stale_time));
    release(entry, seq);
    if seq >= entry.applied_seq {
      entry.error = Some(error);
    }
  }

  /// Mark `key` stale. Returns false if there was no entry.
  ///
  /// A request already in flight is detached: it can still complete, but
  /// the next read starts a new one.
  pub fn invalidate(&self, key: &QueryKey) -> bool {
    let seq = self.next_seq();
    match self.lock().get_mut(key) {
      Some(entry) => {
        mark_invalidated(entry, seq);
        true
      }
      None => false,
    }
  }

  /// Mark every entry whose key satisfies `predicate` stale.
  pub fn invalidate_matching<P>(&self, predicate: P) -> usize
  where
    P: Fn(&QueryKey) -> bool,
  {
    let seq = self.next_seq();
    let mut count = 0;
    for (key, entry) in self.lock().iter_mut() {
      if predicate(key) {
        mark_invalidated(entry, seq);
        count += 1;
      }
    }
    count
  }

  /// Mark every entry under `prefix` stale.
  pub fn invalidate_prefix(&self, prefix: &QueryKey) -> usize {
    self.invalidate_matching(|key| key.starts_with(prefix))
  }

  /// Attach a pending request to `key`, creating the entry if needed.
  pub fn mark_in_flight(&self, key: &QueryKey, handle: FetchHandle, seq: u64) {
    let mut entries = self.lock();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::empty(self.default_stale_time));
    entry.in_flight = Some(InFlight { seq, handle });
  }

  /// Drop the in-flight marker if it still belongs to request `seq`.
  pub fn clear_in_flight(&self, key: &QueryKey, seq: u64) -> bool {
    match self.lock().get_mut(key) {
      Some(entry) => release(entry, seq),
      None => false,
    }
  }

  pub fn in_flight(&self, key: &QueryKey) -> Option<FetchHandle> {
    self
      .lock()
      .get(key)
      .and_then(|e| e.in_flight.as_ref().map(|f| f.handle.clone()))
  }

  /// Join the request already in flight for `key`, or start one.
  ///
  /// The check and the mark happen under one lock, so concurrent callers for
  /// the same key never both get `started = true`. `start` receives the new
  /// sequence number and must not touch the cache synchronously.
  pub fn begin_fetch<F>(&self, key: &QueryKey, stale_time: Duration, start: F) -> FetchTicket
  where
    F: FnOnce(u64) -> FetchHandle,
  {
    let mut entries = self.lock();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::empty(stale_time));

    if let Some(in_flight) = &entry.in_flight {
      return FetchTicket {
        handle: in_flight.handle.clone(),
        seq: in_flight.seq,
        started: false,
      };
    }

    let seq = self.next_seq();
    let handle = start(seq);
    entry.stale_time = stale_time;
    entry.in_flight = Some(InFlight {
      seq,
      handle: handle.clone(),
    });
    FetchTicket {
      handle,
      seq,
      started: true,
    }
  }

  /// Insert a previously persisted entry. Existing entries win.
  pub fn restore(
    &self,
    key: QueryKey,
    data: Value,
    fetched_at: DateTime<Utc>,
    stale_time: Duration,
    invalidated: bool,
  ) -> bool {
    let mut entries = self.lock();
    if entries.contains_key(&key) {
      return false;
    }
    let mut entry = CacheEntry::empty(stale_time);
    entry.data = Some(data);
    entry.fetched_at = Some(fetched_at);
    entry.invalidated = invalidated;
    entries.insert(key, entry);
    true
  }

  pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().remove(key)
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    self.lock().keys().cloned().collect()
  }

  /// All entries, for persistence.
  pub fn entries(&self) -> Vec<(QueryKey, CacheEntry)> {
    self
      .lock()
      .iter()
      .map(|(k, e)| (k.clone(), e.clone()))
      .collect()
  }

  pub fn stats(&self) -> CacheStats {
    let now = self.now();
    let entries = self.lock();
    let mut stats = CacheStats {
      entries: entries.len(),
      ..CacheStats::default()
    };
    for entry in entries.values() {
      if entry.is_fresh_at(now) {
        stats.fresh += 1;
      } else if entry.data.is_some() {
        stats.stale += 1;
      }
      if entry.is_fetching() {
        stats.in_flight += 1;
      }
      if entry.error.is_some() {
        stats.errored += 1;
      }
    }
    stats
  }
}

impl Default for EntityCache {
  fn default() -> Self {
    Self::new()
  }
}

fn apply(entry: &mut CacheEntry, value: Value, timestamp: DateTime<Utc>, seq: u64) {
  entry.data = Some(value);
  entry.fetched_at = Some(timestamp);
  entry.invalidated = false;
  entry.error = None;
  entry.applied_seq = seq;
}

fn mark_invalidated(entry: &mut CacheEntry, seq: u64) {
  entry.invalidated = true;
  entry.invalidated_seq = seq;
  entry.in_flight = None;
}

fn release(entry: &mut CacheEntry, seq: u64) -> bool {
  if entry.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
    entry.in_flight = None;
    true
  } else {
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ManualClock;
  use futures::FutureExt;
  use serde_json::json;

  fn pending_handle() -> FetchHandle {
    futures::future::pending().boxed().shared()
  }

  fn projects_key() -> QueryKey {
    QueryKey::new("projects").with(json!({}))
  }

  #[test]
  fn test_get_on_empty_cache() {
    let cache = EntityCache::new();
    assert!(cache.get(&projects_key()).is_none());
    assert!(cache.is_empty());
  }

  #[test]
  fn test_put_then_get() {
    let cache = EntityCache::new();
    let now = cache.now();
    cache.put(&projects_key(), json!([1, 2]), now);

    let entry = cache.get(&projects_key()).unwrap();
    assert_eq!(entry.data, Some(json!([1, 2])));
    assert_eq!(entry.fetched_at, Some(now));
    assert!(cache.is_fresh(&entry));
  }

  #[test]
  fn test_staleness_follows_clock() {
    let clock = Arc::new(ManualClock::default());
    let cache = EntityCache::with_clock(clock.clone()).with_stale_time(Duration::from_secs(60));
    cache.put(&projects_key(), json!([]), cache.now());

    clock.advance(TimeDelta::seconds(59));
    assert!(cache.is_fresh(&cache.get(&projects_key()).unwrap()));

    clock.advance(TimeDelta::seconds(1));
    assert!(!cache.is_fresh(&cache.get(&projects_key()).unwrap()));
  }

  #[test]
  fn test_invalidate_keeps_last_value() {
    let cache = EntityCache::new();
    cache.put(&projects_key(), json!(["a"]), cache.now());

    assert!(cache.invalidate(&projects_key()));
    let entry = cache.get(&projects_key()).unwrap();
    assert!(!cache.is_fresh(&entry));
    assert_eq!(entry.data, Some(json!(["a"])));

    assert!(!cache.invalidate(&QueryKey::new("missing")));
  }

  #[test]
  fn test_invalidate_prefix_only_touches_matching_keys() {
    let cache = EntityCache::new();
    let now = cache.now();
    cache.put(&projects_key(), json!([]), now);
    cache.put(
      &QueryKey::new("projects").with(json!({"status": "active"})),
      json!([]),
      now,
    );
    cache.put(&QueryKey::new("project").with(1), json!({}), now);

    assert_eq!(cache.invalidate_prefix(&QueryKey::new("projects")), 2);
    assert!(cache.is_fresh(&cache.get(&QueryKey::new("project").with(1)).unwrap()));
  }

  #[test]
  fn test_begin_fetch_deduplicates() {
    let cache = EntityCache::new();
    let mut starts = 0;

    let first = cache.begin_fetch(&projects_key(), DEFAULT_STALE_TIME, |_| {
      starts += 1;
      pending_handle()
    });
    let second = cache.begin_fetch(&projects_key(), DEFAULT_STALE_TIME, |_| {
      starts += 1;
      pending_handle()
    });

    assert_eq!(starts, 1);
    assert!(first.started);
    assert!(!second.started);
    assert_eq!(first.seq, second.seq);
    assert!(cache.get(&projects_key()).unwrap().is_fetching());
  }

  #[test]
  fn test_older_completion_is_discarded() {
    let cache = EntityCache::new();
    let now = cache.now();
    let older = cache.next_seq();
    let newer = cache.next_seq();

    assert!(cache.put_if_newer(&projects_key(), json!("new"), now, newer));
    assert!(!cache.put_if_newer(&projects_key(), json!("old"), now, older));
    assert_eq!(cache.get(&projects_key()).unwrap().data, Some(json!("new")));
  }

  #[test]
  fn test_put_supersedes_pending_fetch() {
    let cache = EntityCache::new();
    let ticket = cache.begin_fetch(&projects_key(), DEFAULT_STALE_TIME, |_| pending_handle());
    cache.put(&projects_key(), json!("written"), cache.now());

    assert!(!cache.get(&projects_key()).unwrap().is_fetching());
    assert!(!cache.put_if_newer(&projects_key(), json!("fetched"), cache.now(), ticket.seq));
    assert_eq!(
      cache.get(&projects_key()).unwrap().data,
      Some(json!("written"))
    );
  }

  #[test]
  fn test_invalidation_detaches_pending_fetch() {
    let cache = EntityCache::new();
    let before = cache.begin_fetch(&projects_key(), DEFAULT_STALE_TIME, |_| pending_handle());
    assert!(cache.invalidate(&projects_key()));
    assert!(!cache.get(&projects_key()).unwrap().is_fetching());

    // The request issued before invalidation lands, but not as fresh data
    assert!(cache.put_if_newer(&projects_key(), json!(["before"]), cache.now(), before.seq));
    let entry = cache.get(&projects_key()).unwrap();
    assert_eq!(entry.data, Some(json!(["before"])));
    assert!(!cache.is_fresh(&entry));

    let after = cache.begin_fetch(&projects_key(), DEFAULT_STALE_TIME, |_| pending_handle());
    assert!(after.started);
    assert!(after.seq > before.seq);
    assert!(cache.put_if_newer(&projects_key(), json!(["after"]), cache.now(), after.seq));
    assert!(cache.is_fresh(&cache.get(&projects_key()).unwrap()));
  }

  #[test]
  fn test_set_error_retains_data_and_clears_marker() {
    let cache = EntityCache::new();
    cache.put(&projects_key(), json!([1]), cache.now());
    let seq = cache.next_seq();
    cache.mark_in_flight(&projects_key(), pending_handle(), seq);

    cache.set_error(&projects_key(), QueryError::Timeout, seq);
    let entry = cache.get(&projects_key()).unwrap();
    assert_eq!(entry.data, Some(json!([1])));
    assert_eq!(entry.error, Some(QueryError::Timeout));
    assert!(!entry.is_fetching());
  }

  #[test]
  fn test_clear_in_flight_ignores_foreign_seq() {
    let cache = EntityCache::new();
    let seq = cache.next_seq();
    cache.mark_in_flight(&projects_key(), pending_handle(), seq);
    assert!(!cache.clear_in_flight(&projects_key(), seq + 1));
    assert!(cache.in_flight(&projects_key()).is_some());
    assert!(cache.clear_in_flight(&projects_key(), seq));
    assert!(cache.in_flight(&projects_key()).is_none());
  }

  #[test]
  fn test_clear_and_stats() {
    let cache = EntityCache::new();
    cache.put(&projects_key(), json!([]), cache.now());
    cache.put(&QueryKey::new("project").with(1), json!({}), cache.now());
    cache.invalidate(&projects_key());

    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.fresh, 1);
    assert_eq!(stats.stale, 1);

    cache.clear();
    assert_eq!(cache.len(), 0);
  }
}
