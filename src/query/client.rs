//! The query cache client.
//!
//! Records are keyed by [`QueryKey`] and follow a stale-while-revalidate
//! policy: a fresh record is served as is, an age-stale record is served while
//! a background refetch runs, and an invalidated, empty or failed record makes
//! the caller wait for the refetch. Every fetch of one key is shared by all of
//! its concurrent readers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::error::ContentError;
use crate::cache::durable::now_millis;
use crate::cache::lock::mutex_lock;

use super::key::{QueryKey, QueryPrefix};
use super::persist::{
    DehydrateFilter, PersistedRecord, PersistedSnapshot, Persister, SNAPSHOT_VERSION,
};
use super::record::{InFlight, QueryData, QueryError, QueryRecord, QueryState, QueryStatus};

const SOURCE: &str = "query::client";

const METRIC_HIT: &str = "paddock_query_hit_total";
const METRIC_FETCH: &str = "paddock_query_fetch_total";

/// Backoff between fetch attempts: `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(1u32 << attempt.min(16))
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Age after which a read triggers a background refetch.
    pub stale_time: Duration,
    /// How long an unobserved record is kept before collection.
    pub gc_time: Duration,
    pub gc_interval: Duration,
    pub retry: RetryPolicy,
    /// Persisted snapshots older than this are discarded on startup.
    pub persist_max_age: Duration,
    /// Minimum spacing between snapshot writes.
    pub persist_throttle: Duration,
    pub dehydrate: DehydrateFilter,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(5 * 60),
            gc_time: Duration::from_secs(30 * 60),
            gc_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            persist_max_age: Duration::from_secs(24 * 60 * 60),
            persist_throttle: Duration::from_secs(1),
            dehydrate: DehydrateFilter::default(),
        }
    }
}

impl From<&crate::config::QuerySettings> for QueryConfig {
    fn from(settings: &crate::config::QuerySettings) -> Self {
        Self {
            stale_time: settings.stale_time,
            gc_time: settings.gc_time,
            gc_interval: settings.gc_interval,
            retry: RetryPolicy {
                retries: settings.retries,
                base: settings.retry_base,
                cap: settings.retry_cap,
            },
            persist_max_age: settings.persist_max_age,
            persist_throttle: settings.persist_throttle,
            dehydrate: DehydrateFilter {
                namespaces: settings.persisted_namespaces.clone(),
                include_search: false,
            },
        }
    }
}

/// Application-wide query cache. Cloning yields another handle to the same
/// cache; separately constructed clients share nothing.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<Inner>,
}

struct Inner {
    records: Mutex<HashMap<QueryKey, QueryRecord>>,
    config: QueryConfig,
    persister: Option<Arc<dyn Persister>>,
    persist_pending: AtomicBool,
    sequence: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl QueryClient {
    pub fn new(config: QueryConfig, persister: Option<Arc<dyn Persister>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(HashMap::new()),
                config,
                persister,
                persist_pending: AtomicBool::new(false),
                sequence: AtomicU64::new(1),
                tasks: Mutex::new(JoinSet::new()),
                collector: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Hydrate from the persister and start the garbage collector. Returns
    /// the number of restored records.
    pub async fn init(&self) -> usize {
        let restored = match &self.inner.persister {
            Some(persister) => self.hydrate(persister.as_ref()).await,
            None => 0,
        };

        let mut collector = mutex_lock(&self.inner.collector, SOURCE, "init");
        if collector.is_none() {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let every = self.inner.config.gc_interval;
            *collector = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let collected = inner.collect_garbage();
                    if collected > 0 {
                        debug!(collected, "Collected unobserved query records");
                    }
                }
            }));
        }
        restored
    }

    /// Stop background work and write a final snapshot.
    pub async fn dispose(&self) {
        if let Some(handle) = mutex_lock(&self.inner.collector, SOURCE, "dispose").take() {
            handle.abort();
        }
        mutex_lock(&self.inner.tasks, SOURCE, "dispose").abort_all();
        if let Some(persister) = &self.inner.persister {
            let snapshot = self.inner.dehydrate();
            if let Err(err) = persister.persist(&snapshot).await {
                warn!(error = %err, "Final query snapshot could not be written");
            }
        }
    }

    /// Read `key` through the cache, calling `fetcher` when the record needs
    /// (re)fetching.
    pub async fn fetch<F, Fut>(&self, key: QueryKey, fetcher: F) -> Result<QueryData, QueryError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryData, ContentError>> + Send + 'static,
    {
        let now = Instant::now();
        let (served, in_flight) = {
            let mut records = mutex_lock(&self.inner.records, SOURCE, "fetch");
            let record = records
                .entry(key.clone())
                .or_insert_with(|| QueryRecord::new(now));
            if record.is_fresh(now, self.inner.config.stale_time)
                && let Some(data) = &record.data
            {
                counter!(METRIC_HIT).increment(1);
                return Ok(data.clone());
            }

            let revalidating = record.status == QueryStatus::Success && !record.invalidated;
            let served = record.data.clone().filter(|_| revalidating);
            let in_flight = self.start_fetch(&key, record, fetcher);
            (served, in_flight)
        };

        match served {
            Some(data) => {
                counter!(METRIC_HIT).increment(1);
                debug!(query = %key, "Serving stale query data while revalidating");
                Ok(data)
            }
            None => in_flight.await,
        }
    }

    fn start_fetch<F, Fut>(&self, key: &QueryKey, record: &mut QueryRecord, fetcher: F) -> InFlight
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryData, ContentError>> + Send + 'static,
    {
        if let Some(in_flight) = &record.in_flight
            && record.fetch_epoch == record.epoch
        {
            return in_flight.clone();
        }

        let fetch_id = self.inner.next_sequence();
        let epoch = record.epoch;
        let inner = Arc::clone(&self.inner);
        let owned_key = key.clone();
        let retry = self.inner.config.retry;
        let in_flight = async move {
            let result = run_with_retry(&fetcher, retry).await;
            inner.settle(&owned_key, fetch_id, epoch, result)
        }
        .boxed()
        .shared();

        record.in_flight = Some(in_flight.clone());
        record.fetch_id = fetch_id;
        record.fetch_epoch = epoch;
        record.publish();
        counter!(METRIC_FETCH).increment(1);

        // Drive the fetch independently of the callers so abandoned reads
        // still land in the cache.
        self.inner.spawn(in_flight.clone().map(|_| ()));
        in_flight
    }

    /// Watch a key. The record is retained from collection while any observer
    /// lives.
    pub fn observe(&self, key: QueryKey) -> QueryObserver {
        let mut records = mutex_lock(&self.inner.records, SOURCE, "observe");
        let record = records
            .entry(key.clone())
            .or_insert_with(|| QueryRecord::new(Instant::now()));
        record.observers += 1;
        record.unobserved_since = None;
        QueryObserver {
            key,
            receiver: record.state.subscribe(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current state of a key without fetching.
    pub fn state(&self, key: &QueryKey) -> QueryState {
        mutex_lock(&self.inner.records, SOURCE, "state")
            .get(key)
            .map(|record| record.state.borrow().clone())
            .unwrap_or_default()
    }

    pub fn get_data(&self, key: &QueryKey) -> Option<QueryData> {
        mutex_lock(&self.inner.records, SOURCE, "get_data")
            .get(key)
            .and_then(|record| record.data.clone())
    }

    pub fn is_invalidated(&self, key: &QueryKey) -> bool {
        mutex_lock(&self.inner.records, SOURCE, "is_invalidated")
            .get(key)
            .is_some_and(|record| record.invalidated)
    }

    pub fn keys_matching(&self, prefix: &QueryPrefix) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = mutex_lock(&self.inner.records, SOURCE, "keys_matching")
            .keys()
            .filter(|key| prefix.matches(key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Mark every record under `prefix` stale; the next read refetches.
    pub fn invalidate(&self, prefix: &QueryPrefix) -> usize {
        self.invalidate_where(|key| prefix.matches(key))
    }

    pub fn invalidate_where(&self, mut predicate: impl FnMut(&QueryKey) -> bool) -> usize {
        let mut invalidated = 0;
        {
            let mut records = mutex_lock(&self.inner.records, SOURCE, "invalidate");
            for (key, record) in records.iter_mut() {
                if !predicate(key) {
                    continue;
                }
                record.invalidated = true;
                record.epoch = self.inner.next_sequence();
                record.publish();
                invalidated += 1;
            }
        }
        if invalidated > 0 {
            self.inner.schedule_persist();
        }
        invalidated
    }

    /// Replace a record's data as if it had just been fetched.
    pub fn set_data(&self, key: QueryKey, data: QueryData) {
        {
            let mut records = mutex_lock(&self.inner.records, SOURCE, "set_data");
            let now = Instant::now();
            let record = records.entry(key).or_insert_with(|| QueryRecord::new(now));
            record.data = Some(data);
            record.status = QueryStatus::Success;
            record.error = None;
            record.updated_at = Some(now);
            record.invalidated = false;
            record.publish();
        }
        self.inner.schedule_persist();
    }

    /// Patch existing data in place. `patch` returns `None` to leave the
    /// record untouched. Returns whether the record changed.
    pub fn update_data(
        &self,
        key: &QueryKey,
        patch: impl FnOnce(&QueryData) -> Option<QueryData>,
    ) -> bool {
        let changed = {
            let mut records = mutex_lock(&self.inner.records, SOURCE, "update_data");
            let Some(record) = records.get_mut(key) else {
                return false;
            };
            let Some(next) = record.data.as_ref().and_then(patch) else {
                return false;
            };
            record.data = Some(next);
            record.status = QueryStatus::Success;
            record.error = None;
            record.updated_at = Some(Instant::now());
            record.publish();
            true
        };
        if changed {
            self.inner.schedule_persist();
        }
        changed
    }

    /// Drop a record's data. Observed records stay registered but empty.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let removed = {
            let mut records = mutex_lock(&self.inner.records, SOURCE, "remove");
            match records.get_mut(key) {
                Some(record) if record.observers > 0 => {
                    record.data = None;
                    record.status = QueryStatus::Pending;
                    record.error = None;
                    record.updated_at = None;
                    record.invalidated = true;
                    record.epoch = self.inner.next_sequence();
                    record.publish();
                    true
                }
                Some(_) => records.remove(key).is_some(),
                None => false,
            }
        };
        if removed {
            self.inner.schedule_persist();
        }
        removed
    }

    pub fn collect_garbage(&self) -> usize {
        self.inner.collect_garbage()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.records, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record and the persisted snapshot. Observed records stay
    /// registered but empty.
    pub async fn clear(&self) {
        {
            let mut records = mutex_lock(&self.inner.records, SOURCE, "clear");
            records.retain(|_, record| record.observers > 0);
            for record in records.values_mut() {
                record.data = None;
                record.status = QueryStatus::Pending;
                record.error = None;
                record.invalidated = true;
                record.epoch = self.inner.next_sequence();
                record.publish();
            }
        }
        if let Some(persister) = &self.inner.persister {
            discard(persister.as_ref()).await;
        }
    }

    async fn hydrate(&self, persister: &dyn Persister) -> usize {
        let snapshot = match persister.restore().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return 0,
            Err(err) => {
                warn!(error = %err, "Persisted query cache unreadable; starting cold");
                discard(persister).await;
                return 0;
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            info!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "Persisted query cache has another shape; discarding"
            );
            discard(persister).await;
            return 0;
        }

        let max_age = self.inner.config.persist_max_age;
        if millis_since(snapshot.timestamp) > max_age {
            info!("Persisted query cache is too old; discarding");
            discard(persister).await;
            return 0;
        }

        let now = Instant::now();
        let mut restored = 0;
        let mut records = mutex_lock(&self.inner.records, SOURCE, "hydrate");
        for persisted in snapshot.records {
            let Ok(key) = persisted.key.parse::<QueryKey>() else {
                debug!(key = %persisted.key, "Skipping unrecognised persisted query key");
                continue;
            };
            if !self.inner.config.dehydrate.allows_key(&key) {
                continue;
            }
            let age = millis_since(persisted.updated_at);
            if age > max_age {
                continue;
            }
            let record = records.entry(key).or_insert_with(|| QueryRecord::new(now));
            if record.data.is_some() {
                continue;
            }
            record.data = Some(persisted.data);
            record.status = QueryStatus::Success;
            match now.checked_sub(age) {
                Some(updated_at) => record.updated_at = Some(updated_at),
                None => {
                    record.updated_at = Some(now);
                    record.invalidated = true;
                }
            }
            record.publish();
            restored += 1;
        }
        info!(restored, "Query cache hydrated");
        restored
    }
}

impl Inner {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "spawn");
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn settle(
        self: &Arc<Self>,
        key: &QueryKey,
        fetch_id: u64,
        epoch: u64,
        result: Result<QueryData, QueryError>,
    ) -> Result<QueryData, QueryError> {
        let outcome = {
            let mut records = mutex_lock(&self.records, SOURCE, "settle");
            let Some(record) = records.get_mut(key) else {
                return result;
            };
            if record.fetch_id != fetch_id {
                debug!(query = %key, "Superseded query fetch landed; record left to its successor");
                return result;
            }
            record.in_flight = None;
            let outcome = match result {
                // Removed while the fetch ran.
                Ok(data) if record.epoch != epoch && record.data.is_none() => Ok(data),
                Ok(data) => {
                    record.data = Some(data.clone());
                    record.status = QueryStatus::Success;
                    record.error = None;
                    record.updated_at = Some(Instant::now());
                    record.invalidated = record.epoch != epoch;
                    Ok(data)
                }
                Err(error) if error.inner().is_not_found() => {
                    record.data = None;
                    record.status = QueryStatus::Error;
                    record.error = Some(error.clone());
                    Err(error)
                }
                Err(error) => {
                    record.status = QueryStatus::Error;
                    record.error = Some(error.clone());
                    match &record.data {
                        Some(last) => {
                            warn!(query = %key, error = %error, "Query refetch failed; keeping last data");
                            Ok(last.clone())
                        }
                        None => Err(error),
                    }
                }
            };
            record.publish();
            outcome
        };
        self.schedule_persist();
        outcome
    }

    fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let gc_time = self.config.gc_time;
        let mut records = mutex_lock(&self.records, SOURCE, "collect_garbage");
        let before = records.len();
        records.retain(|_, record| {
            let idle = record.observers == 0
                && record.in_flight.is_none()
                && record
                    .unobserved_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= gc_time);
            !idle
        });
        before - records.len()
    }

    fn schedule_persist(self: &Arc<Self>) {
        if self.persister.is_none() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        if self.persist_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        self.spawn(async move {
            tokio::time::sleep(inner.config.persist_throttle).await;
            inner.persist_pending.store(false, Ordering::Release);
            let Some(persister) = &inner.persister else {
                return;
            };
            let snapshot = inner.dehydrate();
            if let Err(err) = persister.persist(&snapshot).await {
                warn!(error = %err, "Query snapshot could not be written");
            }
        });
    }

    fn dehydrate(&self) -> PersistedSnapshot {
        let now = Instant::now();
        let now_ms = now_millis();
        let records = mutex_lock(&self.records, SOURCE, "dehydrate")
            .iter()
            .filter(|(key, record)| {
                !record.invalidated && self.config.dehydrate.should_dehydrate(key, record.status)
            })
            .filter_map(|(key, record)| {
                let data = record.data.clone()?;
                let age = record
                    .updated_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
                Some(PersistedRecord {
                    key: key.to_string(),
                    data,
                    updated_at: now_ms.saturating_sub(age_ms),
                })
            })
            .collect();
        PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp: now_ms,
            records,
        }
    }
}

async fn run_with_retry<F, Fut>(fetcher: &F, policy: RetryPolicy) -> Result<QueryData, QueryError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<QueryData, ContentError>>,
{
    let mut attempt = 0;
    loop {
        match fetcher().await {
            Ok(data) => return Ok(data),
            Err(error) => {
                let error = QueryError::from(error);
                if attempt >= policy.retries || !error.should_retry() {
                    return Err(error);
                }
                let delay = policy.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Query fetch failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn discard(persister: &dyn Persister) {
    if let Err(err) = persister.remove().await {
        warn!(error = %err, "Persisted query snapshot could not be removed");
    }
}

fn millis_since(timestamp: i64) -> Duration {
    let elapsed = now_millis().saturating_sub(timestamp).max(0);
    Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
}

/// Live view of one key's state.
pub struct QueryObserver {
    key: QueryKey,
    receiver: watch::Receiver<QueryState>,
    inner: Weak<Inner>,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn state(&self) -> QueryState {
        self.receiver.borrow().clone()
    }

    /// Wait for the next state change. Returns `false` once the record is
    /// gone.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut records = mutex_lock(&inner.records, SOURCE, "observer.drop");
        if let Some(record) = records.get_mut(&self.key) {
            record.observers = record.observers.saturating_sub(1);
            if record.observers == 0 {
                record.unobserved_since = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cache::MemoryBackend;
    use crate::domain::entities::ContentItem;
    use crate::query::key::Namespace;
    use crate::query::persist::DurablePersister;

    fn items(ids: &[i64]) -> QueryData {
        QueryData::Items(Arc::new(
            ids.iter()
                .map(|&id| ContentItem {
                    id,
                    published: true,
                    ..Default::default()
                })
                .collect(),
        ))
    }

    fn counting_fetcher(
        calls: Arc<AtomicUsize>,
        data: QueryData,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<QueryData, ContentError>>
    + Send
    + Sync
    + 'static {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let data = data.clone();
            async move { Ok(data) }.boxed()
        }
    }

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(5), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_records_do_not_refetch() {
        let client = QueryClient::new(QueryConfig::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(calls.clone(), items(&[1]));

        let first = client.fetch(QueryKey::featured(), fetcher).await.expect("first");
        let fetcher = counting_fetcher(calls.clone(), items(&[2]));
        let second = client.fetch(QueryKey::featured(), fetcher).await.expect("second");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(first.same_allocation(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_records_are_served_while_revalidating() {
        let client = QueryClient::new(QueryConfig::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        client
            .fetch(QueryKey::items(), counting_fetcher(calls.clone(), items(&[1])))
            .await
            .expect("prime");

        tokio::time::advance(Duration::from_secs(301)).await;
        let served = client
            .fetch(QueryKey::items(), counting_fetcher(calls.clone(), items(&[1, 2])))
            .await
            .expect("stale read");
        assert_eq!(served, items(&[1]));

        // Let the background refetch land.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.get_data(&QueryKey::items()), Some(items(&[1, 2])));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_records_wait_for_the_refetch() {
        let client = QueryClient::new(QueryConfig::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        client
            .fetch(QueryKey::category("f1"), counting_fetcher(calls.clone(), items(&[1])))
            .await
            .expect("prime");

        assert_eq!(client.invalidate(&QueryPrefix::category_lists(Namespace::Public)), 1);
        let served = client
            .fetch(QueryKey::category("f1"), counting_fetcher(calls.clone(), items(&[])))
            .await
            .expect("refetch");
        assert_eq!(served, items(&[]));
        assert!(!client.is_invalidated(&QueryKey::category("f1")));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_with_backoff() {
        let client = QueryClient::new(QueryConfig::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let started = Instant::now();
        let result = client
            .fetch(QueryKey::featured(), move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(ContentError::Transient("timeout".into()))
                    } else {
                        Ok(items(&[7]))
                    }
                }
            })
            .await;

        assert_eq!(result.expect("third attempt succeeds"), items(&[7]));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_never_retried() {
        let client = QueryClient::new(QueryConfig::default(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = client
            .fetch(QueryKey::item(999), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ContentError::not_found("item")) }
            })
            .await;

        let error = result.expect_err("not found");
        assert!(error.inner().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(client.state(&QueryKey::item(999)).error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn observed_records_survive_garbage_collection() {
        let client = QueryClient::new(QueryConfig::default(), None);
        client.set_data(QueryKey::featured(), items(&[1]));
        client.set_data(QueryKey::items(), items(&[1]));
        let observer = client.observe(QueryKey::featured());

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(client.collect_garbage(), 1);
        assert_eq!(observer.state().data, Some(items(&[1])));

        drop(observer);
        assert_eq!(client.collect_garbage(), 0);
        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        assert_eq!(client.collect_garbage(), 1);
        assert!(client.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_patches() {
        let client = QueryClient::new(QueryConfig::default(), None);
        let mut observer = client.observe(QueryKey::items());
        client.set_data(QueryKey::items(), items(&[1]));
        assert!(observer.changed().await);
        assert_eq!(observer.state().data, Some(items(&[1])));

        let patched = client.update_data(&QueryKey::items(), |_| Some(items(&[1, 2])));
        assert!(patched);
        assert_eq!(observer.state().data, Some(items(&[1, 2])));
        assert!(!client.update_data(&QueryKey::featured(), |_| Some(items(&[3]))));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_written_after_mutations_and_rehydrated() {
        let backend = Arc::new(MemoryBackend::new());
        let persister: Arc<dyn Persister> = Arc::new(DurablePersister::new(backend.clone()));
        let client = QueryClient::new(QueryConfig::default(), Some(persister.clone()));
        client.set_data(QueryKey::featured(), items(&[1]));
        client.set_data(QueryKey::search("spa"), items(&[2]));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let snapshot = persister.restore().await.expect("restore").expect("snapshot");
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].key, "public/posts/featured");

        let restored = QueryClient::new(QueryConfig::default(), Some(persister));
        assert_eq!(restored.init().await, 1);
        assert_eq!(restored.get_data(&QueryKey::featured()), Some(items(&[1])));
        restored.dispose().await;
    }
}
