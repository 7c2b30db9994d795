//! Cached fetch unit: one instance per call site.
//!
//! A unit wraps a [`Producer`], checks the [`TtlStore`] before calling it,
//! and exposes `{data, loading, error}`. It re-runs when its trigger
//! (enabled flag, computed cache key, skip-cache flag) changes; changing
//! the dependency list changes the key, which is how dependency-driven
//! refetching works.
//!
//! Every run takes a ticket from a generation counter. A producer result
//! only lands if its ticket is still current when it resolves, so a slow
//! earlier request can never overwrite the state written by a newer one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::cache::{derive_cache_key, DepValue, TtlStore};
use crate::error::ConfigError;

use super::envelope::{decode, Envelope};
use super::producer::Producer;
use super::state::UnitState;

/// Default lifetime of a cached response (30 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Options recognised by a fetch unit.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Explicit cache key. Preferred over the label-derived fallback.
    pub cache_key: Option<String>,
    pub ttl: Duration,
    /// When false the unit is dormant: no fetch, `loading` stays false.
    pub enabled: bool,
    pub dependencies: Vec<DepValue>,
    /// Bypass the cache entirely, for both reads and writes.
    pub skip_cache: bool,
    pub envelope: Envelope,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            cache_key: None,
            ttl: DEFAULT_TTL,
            enabled: true,
            dependencies: Vec::new(),
            skip_cache: false,
            envelope: Envelope::default(),
        }
    }
}

impl FetchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<DepValue>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_skip_cache(mut self, skip: bool) -> Self {
        self.skip_cache = skip;
        self
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = envelope;
        self
    }

    fn validate(&self, producer: &Producer) -> Result<(), ConfigError> {
        if self.cache_key.is_none() && producer.label().trim().is_empty() {
            return Err(ConfigError::MissingKey);
        }
        Ok(())
    }

    fn key_for(&self, producer: &Producer) -> String {
        match self.cache_key {
            Some(ref key) => key.clone(),
            None => derive_cache_key(producer.label(), &self.dependencies),
        }
    }
}

/// Values whose change re-runs the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Trigger {
    enabled: bool,
    key: String,
    skip_cache: bool,
}

struct FetchInner<T> {
    store: TtlStore,
    /// Always the most recently supplied producer; read at call time.
    producer: Mutex<Producer>,
    config: Mutex<FetchConfig>,
    state: Mutex<UnitState<T>>,
    applied: Mutex<Option<Trigger>>,
    generation: AtomicU64,
    disposed: AtomicBool,
}

/// A cached, re-runnable fetch bound to one call site.
///
/// Clones share the same unit.
pub struct FetchUnit<T = Value> {
    inner: Arc<FetchInner<T>>,
}

impl<T> Clone for FetchUnit<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FetchUnit<T>
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    /// Build a dormant unit. Nothing runs until [`sync`](Self::sync) or
    /// [`run`](Self::run).
    pub fn new(store: TtlStore, producer: Producer, config: FetchConfig) -> Result<Self, ConfigError> {
        config.validate(&producer)?;
        Ok(Self {
            inner: Arc::new(FetchInner {
                store,
                producer: Mutex::new(producer),
                config: Mutex::new(config),
                state: Mutex::new(UnitState::default()),
                applied: Mutex::new(None),
                generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Key this unit currently reads and writes.
    pub fn cache_key(&self) -> String {
        let producer = self.inner.producer.lock();
        self.inner.config.lock().key_for(&producer)
    }

    fn trigger(&self) -> Trigger {
        let producer = self.inner.producer.lock();
        let config = self.inner.config.lock();
        Trigger {
            enabled: config.enabled,
            key: config.key_for(&producer),
            skip_cache: config.skip_cache,
        }
    }

    /// Run once if the trigger differs from the last one applied. The
    /// first call always runs.
    pub async fn sync(&self) {
        let trigger = self.trigger();
        let changed = {
            let mut applied = self.inner.applied.lock();
            if applied.as_ref() == Some(&trigger) {
                false
            } else {
                *applied = Some(trigger);
                true
            }
        };
        if changed {
            self.run(false).await;
        }
    }

    /// Replace the configuration, then [`sync`](Self::sync).
    pub async fn update(&self, config: FetchConfig) -> Result<(), ConfigError> {
        {
            let producer = self.inner.producer.lock();
            config.validate(&producer)?;
            *self.inner.config.lock() = config;
        }
        self.sync().await;
        Ok(())
    }

    /// Swap in a newer producer. Does not trigger a run; any run started
    /// afterwards, including one already scheduled, calls this producer.
    pub fn set_producer(&self, producer: Producer) -> Result<(), ConfigError> {
        self.inner.config.lock().validate(&producer)?;
        *self.inner.producer.lock() = producer;
        Ok(())
    }

    /// Fetch through the cache. With `force_refresh` the cache read is
    /// skipped but the fresh result is still written back.
    ///
    /// Tickets are issued under the state lock and checked again under it
    /// before any write, so a superseded run never touches state or cache.
    pub async fn run(&self, force_refresh: bool) {
        let config = self.inner.config.lock().clone();
        let key = self.cache_key();

        let ticket = {
            let mut state = self.inner.state.lock();
            if self.is_disposed() {
                return;
            }
            let ticket = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if config.enabled {
                state.begin();
            } else {
                state.loading = false;
            }
            ticket
        };

        if !config.enabled {
            return;
        }

        if !config.skip_cache && !force_refresh {
            if let Some(cached) = self.inner.store.get::<T>(&key) {
                debug!(key = %key, "Cache hit");
                let mut state = self.inner.state.lock();
                if self.is_current(ticket) {
                    state.data = Some(cached);
                    state.loading = false;
                }
                return;
            }
            debug!(key = %key, "Cache miss");
        }

        let producer = self.inner.producer.lock().clone();
        let outcome = producer.call().await;

        let result = outcome.and_then(|response| {
            let payload = config.envelope.extract(response);
            let data = decode::<T>(payload.clone())?;
            Ok((payload, data))
        });

        let mut state = self.inner.state.lock();
        if !self.is_current(ticket) {
            debug!(key = %key, ticket, "Dropping superseded result");
            return;
        }
        match result {
            Ok((payload, data)) => {
                if !config.skip_cache {
                    self.inner.store.set(&key, &payload, config.ttl);
                }
                state.data = Some(data);
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Fetch failed");
                // Previous data stays visible
                state.error = Some(e.user_message());
            }
        }
        state.loading = false;
    }

    /// Fetch from the producer regardless of the cache.
    pub async fn refetch(&self) {
        self.run(true).await;
    }

    /// Drop this unit's cache entry without fetching.
    pub fn invalidate_cache(&self) {
        self.inner.store.remove(&self.cache_key());
    }

    fn is_current(&self, ticket: u64) -> bool {
        !self.is_disposed() && self.inner.generation.load(Ordering::SeqCst) == ticket
    }

    /// Stop all further state writes. In-flight producer calls are left to
    /// finish; their results are discarded.
    pub fn dispose(&self) {
        let _state = self.inner.state.lock();
        self.inner.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> UnitState<T> {
        self.inner.state.lock().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.lock().data.clone()
    }

    pub fn loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{oneshot, Notify};

    fn store() -> (TtlStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = TtlStore::with_clock(Arc::new(MemoryStorage::new()), clock.clone());
        (store, clock)
    }

    /// Producer returning `{"data": {"call": n}}` and counting calls.
    fn counting(label: &str) -> (Producer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let producer = Producer::new(label, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, ApiError>(json!({"data": {"call": n}})) }
        });
        (producer, calls)
    }

    /// Producer whose responses are released one at a time by the test.
    fn gated(started: Arc<Notify>) -> (Producer, Vec<oneshot::Sender<Value>>) {
        let mut senders = Vec::new();
        let mut receivers = VecDeque::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel::<Value>();
            senders.push(tx);
            receivers.push_back(rx);
        }
        let pending = Arc::new(Mutex::new(receivers));
        let producer = Producer::new("roster", move || {
            let rx = pending.lock().pop_front();
            started.notify_one();
            async move {
                match rx {
                    Some(rx) => rx.await.map_err(|_| ApiError::failed("response dropped")),
                    None => Err(ApiError::failed("no response queued")),
                }
            }
        });
        (producer, senders)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_producer() {
        let (store, _) = store();
        store.set("students", &json!([{"id": 1}]), DEFAULT_TTL);
        let (producer, calls) = counting("students");

        let unit: FetchUnit = FetchUnit::new(
            store,
            producer,
            FetchConfig::new().with_cache_key("students"),
        )
        .unwrap();
        unit.sync().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(unit.data(), Some(json!([{"id": 1}])));
        assert!(!unit.loading());
    }

    #[tokio::test]
    async fn test_miss_fetches_once_and_caches_payload() {
        let (store, _) = store();
        let (producer, calls) = counting("students");
        let unit: FetchUnit = FetchUnit::new(
            store.clone(),
            producer,
            FetchConfig::new().with_cache_key("students"),
        )
        .unwrap();

        unit.sync().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(unit.data(), Some(json!({"call": 1})));
        assert_eq!(store.get::<Value>("students"), Some(json!({"call": 1})));

        // A second unit on the same key is served from the cache
        let (producer, other_calls) = counting("students");
        let other: FetchUnit =
            FetchUnit::new(store, producer, FetchConfig::new().with_cache_key("students")).unwrap();
        other.sync().await;
        assert_eq!(other_calls.load(Ordering::SeqCst), 0);
        assert_eq!(other.data(), Some(json!({"call": 1})));
    }

    #[tokio::test]
    async fn test_dependency_change_refetches_exactly_once() {
        let (store, _) = store();
        let (producer, calls) = counting("grades");
        let config = FetchConfig::new().with_dependencies(vec![DepValue::from(1)]);
        let unit: FetchUnit = FetchUnit::new(store, producer, config.clone()).unwrap();

        unit.sync().await;
        unit.sync().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(unit.cache_key(), "grades_[1]");

        unit.update(config.clone().with_dependencies(vec![DepValue::from(2)]))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        unit.sync().await;
        unit.update(config.with_dependencies(vec![DepValue::from(2)]))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reordered_map_dependencies_do_not_refetch() {
        let (store, _) = store();
        let (producer, calls) = counting("attendance");
        let config = FetchConfig::new().with_dependencies(vec![DepValue::map([
            ("class", DepValue::from("7B")),
            ("week", DepValue::from(12)),
        ])]);
        let unit: FetchUnit = FetchUnit::new(store, producer, config).unwrap();
        unit.sync().await;

        let reordered = FetchConfig::new().with_dependencies(vec![DepValue::map([
            ("week", DepValue::from(12)),
            ("class", DepValue::from("7B")),
        ])]);
        unit.update(reordered).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_unit_is_dormant() {
        let (store, _) = store();
        let (producer, calls) = counting("timetable");
        let config = FetchConfig::new().with_enabled(false);
        let unit: FetchUnit = FetchUnit::new(store, producer, config.clone()).unwrap();

        unit.sync().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!unit.loading());
        assert_eq!(unit.data(), None);

        unit.update(config.with_enabled(true)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refetch_bypasses_read_but_writes_back() {
        let (store, _) = store();
        store.set("teachers", &json!({"call": 0}), DEFAULT_TTL);
        let (producer, calls) = counting("teachers");
        let unit: FetchUnit = FetchUnit::new(
            store.clone(),
            producer,
            FetchConfig::new().with_cache_key("teachers"),
        )
        .unwrap();

        unit.refetch().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(unit.data(), Some(json!({"call": 1})));
        assert_eq!(store.get::<Value>("teachers"), Some(json!({"call": 1})));
    }

    #[tokio::test]
    async fn test_skip_cache_never_touches_store() {
        let (store, _) = store();
        store.set("fees", &json!("stale"), DEFAULT_TTL);
        let (producer, calls) = counting("fees");
        let unit: FetchUnit = FetchUnit::new(
            store.clone(),
            producer,
            FetchConfig::new().with_cache_key("fees").with_skip_cache(true),
        )
        .unwrap();

        unit.sync().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(unit.data(), Some(json!({"call": 1})));
        assert_eq!(store.get::<Value>("fees"), Some(json!("stale")));
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let (store, clock) = store();
        let (producer, calls) = counting("notices");
        let config = FetchConfig::new()
            .with_cache_key("notices")
            .with_ttl(Duration::from_secs(60));
        let unit: FetchUnit = FetchUnit::new(store, producer, config).unwrap();

        unit.run(false).await;
        unit.run(false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(61));
        unit.run(false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_cache_does_not_refetch() {
        let (store, _) = store();
        let (producer, calls) = counting("exams");
        let unit: FetchUnit = FetchUnit::new(
            store.clone(),
            producer,
            FetchConfig::new().with_cache_key("exams"),
        )
        .unwrap();
        unit.sync().await;

        unit.invalidate_cache();

        assert!(!store.has("exams"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(unit.data(), Some(json!({"call": 1})));
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_data() {
        let (store, _) = store();
        let fail = Arc::new(AtomicBool::new(false));
        let should_fail = fail.clone();
        let producer = Producer::new("classes", move || {
            let fail = should_fail.load(Ordering::SeqCst);
            async move {
                if fail {
                    Err(ApiError::from_status(
                        reqwest::StatusCode::SERVICE_UNAVAILABLE,
                        r#"{"message": "Maintenance window"}"#,
                    ))
                } else {
                    Ok(json!({"data": ["7A", "7B"]}))
                }
            }
        });
        let unit: FetchUnit = FetchUnit::new(
            store,
            producer,
            FetchConfig::new().with_cache_key("classes"),
        )
        .unwrap();
        unit.sync().await;

        fail.store(true, Ordering::SeqCst);
        unit.refetch().await;

        let state = unit.snapshot();
        assert_eq!(state.data, Some(json!(["7A", "7B"])));
        assert_eq!(state.error.as_deref(), Some("Maintenance window"));
        assert!(!state.loading);

        // A later success clears the error
        fail.store(false, Ordering::SeqCst);
        unit.refetch().await;
        assert_eq!(unit.error(), None);
    }

    #[tokio::test]
    async fn test_typed_payload_and_shape_mismatch() {
        #[derive(Debug, Clone, PartialEq, serde::Deserialize)]
        struct Student {
            id: u32,
            name: String,
        }

        let (store, _) = store();
        let producer = Producer::new("student", || async {
            Ok::<_, ApiError>(json!({"data": {"id": 7, "name": "Grace"}}))
        });
        let unit: FetchUnit<Student> = FetchUnit::new(
            store.clone(),
            producer,
            FetchConfig::new().with_cache_key("student"),
        )
        .unwrap();
        unit.sync().await;
        assert_eq!(
            unit.data(),
            Some(Student {
                id: 7,
                name: "Grace".to_string()
            })
        );

        let bad = Producer::new("student", || async { Ok::<_, ApiError>(json!({"data": "oops"})) });
        let broken: FetchUnit<Student> = FetchUnit::new(
            store.clone(),
            bad,
            FetchConfig::new().with_cache_key("student_bad"),
        )
        .unwrap();
        broken.sync().await;
        assert_eq!(broken.data(), None);
        assert!(broken.error().unwrap().starts_with("Invalid response"));
        assert!(!store.has("student_bad"));
    }

    #[tokio::test]
    async fn test_missing_label_and_key_is_rejected() {
        let (store, _) = store();
        let (producer, _) = counting("");
        let result: Result<FetchUnit, _> = FetchUnit::new(store.clone(), producer, FetchConfig::new());
        assert!(matches!(result, Err(ConfigError::MissingKey)));

        let (producer, _) = counting("");
        let result: Result<FetchUnit, _> =
            FetchUnit::new(store, producer, FetchConfig::new().with_cache_key("ok"));
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_latest_producer_is_called() {
        let (store, _) = store();
        let (old, old_calls) = counting("report");
        let (new, new_calls) = counting("report");
        let unit: FetchUnit =
            FetchUnit::new(store, old, FetchConfig::new().with_skip_cache(true)).unwrap();

        unit.set_producer(new).unwrap();
        unit.sync().await;

        assert_eq!(old_calls.load(Ordering::SeqCst), 0);
        assert_eq!(new_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_earlier_result_does_not_overwrite_newer() {
        let (store, _) = store();
        let started = Arc::new(Notify::new());
        let (producer, mut senders) = gated(started.clone());
        let config = FetchConfig::new().with_dependencies(vec![DepValue::from(1)]);
        let unit: FetchUnit = FetchUnit::new(store.clone(), producer, config.clone()).unwrap();

        let first = tokio::spawn({
            let unit = unit.clone();
            async move { unit.sync().await }
        });
        started.notified().await;

        let second = tokio::spawn({
            let unit = unit.clone();
            let config = config.with_dependencies(vec![DepValue::from(2)]);
            async move { unit.update(config).await }
        });
        started.notified().await;

        let _ = senders.remove(2);
        let tx_second = senders.remove(1);
        let tx_first = senders.remove(0);

        tx_second.send(json!({"data": "class 2"})).unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(unit.data(), Some(json!("class 2")));

        tx_first.send(json!({"data": "class 1"})).unwrap();
        first.await.unwrap();

        assert_eq!(unit.data(), Some(json!("class 2")));
        assert!(!unit.loading());
        assert!(!store.has("roster_[1]"));
        assert!(store.has("roster_[2]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_runs_settle_on_latest() {
        let (store, _) = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let producer = Producer::new("gradebook", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                for _ in 0..(n % 4) {
                    tokio::task::yield_now().await;
                }
                Ok::<_, ApiError>(json!({"data": n}))
            }
        });
        let unit: FetchUnit =
            FetchUnit::new(store, producer, FetchConfig::new().with_skip_cache(true)).unwrap();

        for _ in 0..20 {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let unit = unit.clone();
                    tokio::spawn(async move { unit.refetch().await })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            let state = unit.snapshot();
            assert!(!state.loading);
            assert_eq!(state.error, None);
            assert!(state.data.is_some());
        }

        // A run issued after everything settled always wins
        unit.refetch().await;
        let last = calls.load(Ordering::SeqCst);
        assert_eq!(unit.data(), Some(json!(last)));
    }

    #[tokio::test]
    async fn test_disposed_unit_ignores_late_result() {
        let (store, _) = store();
        let started = Arc::new(Notify::new());
        let (producer, mut senders) = gated(started.clone());
        let unit: FetchUnit = FetchUnit::new(store, producer, FetchConfig::new()).unwrap();

        let pending = tokio::spawn({
            let unit = unit.clone();
            async move { unit.sync().await }
        });
        started.notified().await;

        unit.dispose();
        senders.remove(0).send(json!({"data": 1})).unwrap();
        pending.await.unwrap();

        assert_eq!(unit.data(), None);
        unit.refetch().await;
        assert_eq!(unit.data(), None);
    }
}
