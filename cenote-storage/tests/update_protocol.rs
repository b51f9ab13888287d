// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Update protocol against the in-memory backend and failing test doubles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use cenote_core::{
    AggregateKey, AggregationPolicy, CenoteConfig, CodecFormat, Granularity, RetryPolicy,
    TimeLabels,
};
use cenote_storage::{
    AggregateError, AggregateStore, AggregateUpdater, CasOutcome, KvBackend, MemoryBackend,
    Snapshot, StoreError, StoreResult, Version, BINCODE_MAGIC,
};

fn updater_over(backend: Arc<dyn KvBackend>, config: &CenoteConfig) -> AggregateUpdater {
    AggregateUpdater::new(AggregateStore::new(backend), config)
}

fn memory_updater() -> (Arc<MemoryBackend>, AggregateUpdater) {
    let backend = Arc::new(MemoryBackend::new());
    let updater = updater_over(backend.clone(), &CenoteConfig::default());
    (backend, updater)
}

fn key(attribute: &str) -> AggregateKey {
    AggregateKey::new("shop_orders", attribute).unwrap()
}

fn labels(day: &str, hour: &str) -> TimeLabels {
    TimeLabels::new(day, &day[..7], hour).unwrap()
}

/// Loses every compare-and-set.
#[derive(Default)]
struct AlwaysConflicting {
    attempts: AtomicU32,
}

#[async_trait]
impl KvBackend for AlwaysConflicting {
    async fn get(&self, _key: &str) -> StoreResult<Snapshot> {
        Ok(Snapshot::absent())
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: Version,
        _value: Vec<u8>,
    ) -> StoreResult<CasOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(CasOutcome::Conflict {
            current: Version::from_raw(7),
        })
    }
}

/// Conflicts a fixed number of times, then behaves like the memory backend.
struct ConflictsThenCommits {
    remaining: Mutex<u32>,
    inner: MemoryBackend,
}

#[async_trait]
impl KvBackend for ConflictsThenCommits {
    async fn get(&self, key: &str) -> StoreResult<Snapshot> {
        self.inner.get(key).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Version,
        value: Vec<u8>,
    ) -> StoreResult<CasOutcome> {
        {
            let mut remaining = self.remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(CasOutcome::Conflict { current: expected });
            }
        }
        self.inner.compare_and_set(key, expected, value).await
    }
}

struct Unavailable;

#[async_trait]
impl KvBackend for Unavailable {
    async fn get(&self, _key: &str) -> StoreResult<Snapshot> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: Version,
        _value: Vec<u8>,
    ) -> StoreResult<CasOutcome> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_lose_no_updates() {
    const WRITERS: usize = 64;

    let (_backend, updater) = memory_updater();
    let updater = Arc::new(updater);
    let key = key("price");

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let updater = updater.clone();
            let key = key.clone();
            tokio::spawn(async move { updater.update_aggregate(&key, i as f64, None).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let record = updater.read_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(record.count(), WRITERS as u64);
    let expected_mean = (0..WRITERS).sum::<usize>() as f64 / WRITERS as f64;
    assert!((record.mean() - expected_mean).abs() < 1e-9);
    assert!(record.stats.tier2.count <= record.stats.tier1.count);
}

#[tokio::test]
async fn sequential_updates_follow_welford() {
    let (_backend, updater) = memory_updater();
    let key = key("price");

    for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
        updater.update_aggregate(&key, x, None).await.unwrap();
    }

    let record = updater.read_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(record.count(), 8);
    assert!((record.mean() - 5.0).abs() < 1e-9);
    assert!((record.stats.tier1.variance - 4.0).abs() < 1e-9);
    assert!(record.histogram.is_none());
}

#[tokio::test]
async fn outlier_stays_out_of_tier2() {
    let (_backend, updater) = memory_updater();
    let key = key("price");

    for x in [10.0, 10.0, 10.0, 10.0, 10.0, 1000.0] {
        updater.update_aggregate(&key, x, None).await.unwrap();
    }

    let record = updater.read_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(record.stats.tier1.count, 6);
    assert_eq!(record.stats.tier2.count, 5);
    assert_eq!(record.filtered_mean(), 10.0);
}

#[tokio::test]
async fn duplicate_delivery_is_counted_again() {
    let (_backend, updater) = memory_updater();
    let key = key("price");

    let first = updater.update_aggregate(&key, 3.0, None).await.unwrap();
    let second = updater.update_aggregate(&key, 3.0, None).await.unwrap();

    assert!(second.version > first.version);
    let record = updater.read_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(record.count(), 2);
}

#[tokio::test]
async fn never_written_key_reads_absent() {
    let (_backend, updater) = memory_updater();
    assert!(updater.read_aggregate(&key("nothing")).await.unwrap().is_none());
}

#[tokio::test]
async fn histogram_buckets_per_granularity() {
    let (_backend, updater) = memory_updater();
    let key = key("price");

    updater
        .update_aggregate(&key, 10.0, Some(&labels("2024-01-01", "09")))
        .await
        .unwrap();
    updater
        .update_aggregate(&key, 20.0, Some(&labels("2024-01-01", "17")))
        .await
        .unwrap();

    let record = updater.read_aggregate(&key).await.unwrap().unwrap();
    let histogram = record.histogram.unwrap();

    let day = histogram.get("2024-01-01").unwrap();
    assert_eq!(day.count, 2);
    assert_eq!(day.sum, 30.0);
    assert_eq!(day.avg, 15.0);
    assert_eq!(day.min, Some(10.0));
    assert_eq!(day.max, Some(20.0));

    let month = histogram.get("2024-01").unwrap();
    assert_eq!(month.count, 2);
    assert_eq!(month.min, None);

    assert_eq!(histogram.buckets(Granularity::DayHour).count(), 2);
    assert_eq!(histogram.get("2024-01-01_09").unwrap().sum, 10.0);
}

#[tokio::test]
async fn disabled_histogram_is_carried_forward() {
    let backend = Arc::new(MemoryBackend::new());
    let key = key("price");

    let tracking = updater_over(backend.clone(), &CenoteConfig::default());
    tracking
        .update_aggregate(&key, 10.0, Some(&labels("2024-01-01", "09")))
        .await
        .unwrap();
    let before = tracking.read_aggregate(&key).await.unwrap().unwrap();

    let mut config = CenoteConfig::default();
    config.policy.overrides.insert(
        "shop_orders".to_string(),
        AggregationPolicy {
            outlier_filter: true,
            histogram: None,
        },
    );
    let plain = updater_over(backend, &config);
    plain
        .update_aggregate(&key, 50.0, Some(&labels("2024-01-02", "10")))
        .await
        .unwrap();

    let after = plain.read_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(after.count(), 2);
    assert_eq!(after.histogram, before.histogram);
}

#[tokio::test]
async fn entity_and_table_keys_are_independent() {
    let (backend, updater) = memory_updater();
    let table = key("price");
    let entity = AggregateKey::for_entity("shop_orders", "user-1", "price").unwrap();

    updater.update_aggregate(&table, 1.0, None).await.unwrap();
    updater.update_aggregate(&table, 2.0, None).await.unwrap();
    updater.update_aggregate(&entity, 5.0, None).await.unwrap();

    assert_eq!(backend.len(), 2);
    assert_eq!(updater.read_aggregate(&table).await.unwrap().unwrap().count(), 2);
    assert_eq!(updater.read_aggregate(&entity).await.unwrap().unwrap().count(), 1);
}

#[tokio::test]
async fn invalid_sample_leaves_key_untouched() {
    let (backend, updater) = memory_updater();
    let key = key("price");

    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = updater.update_aggregate(&key, bad, None).await.unwrap_err();
        assert!(matches!(err, AggregateError::InvalidSample(_)));
    }
    assert!(backend.is_empty());
}

#[tokio::test]
async fn overflowing_sample_is_rejected_before_write() {
    let (backend, updater) = memory_updater();
    let key = key("price");

    let receipt = updater.update_aggregate(&key, 1.0e308, None).await.unwrap();
    let err = updater.update_aggregate(&key, -1.0e308, None).await.unwrap_err();
    assert!(matches!(err, AggregateError::InvalidSample(_)));

    assert_eq!(backend.get(&key.to_storage_key()).await.unwrap().version, receipt.version);
    assert_eq!(updater.read_aggregate(&key).await.unwrap().unwrap().count(), 1);
}

#[tokio::test]
async fn corrupt_snapshot_is_never_reset() {
    let (backend, updater) = memory_updater();
    let key = key("price");
    let raw_key = key.to_storage_key();
    let version = backend.put_raw(&raw_key, b"{not json".to_vec());

    let err = updater.update_aggregate(&key, 1.0, None).await.unwrap_err();
    assert!(matches!(err, AggregateError::DecodeFailure { .. }));
    assert!(matches!(
        updater.read_aggregate(&key).await,
        Err(AggregateError::DecodeFailure { .. })
    ));

    let snapshot = backend.get(&raw_key).await.unwrap();
    assert_eq!(snapshot.version, version);
    assert_eq!(snapshot.data.as_deref(), Some(&b"{not json"[..]));
}

#[tokio::test]
async fn sustained_contention_is_bounded() {
    let backend = Arc::new(AlwaysConflicting::default());
    let updater = updater_over(backend.clone(), &CenoteConfig::default())
        .with_retry_policy(RetryPolicy::immediate(5));

    let err = updater.update_aggregate(&key("price"), 1.0, None).await.unwrap_err();
    match err {
        AggregateError::ContentionExhausted { attempts, .. } => assert_eq!(attempts, 5),
        other => panic!("expected ContentionExhausted, got {other:?}"),
    }
    assert_eq!(backend.attempts.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn conflicts_are_retried_until_commit() {
    let backend = Arc::new(ConflictsThenCommits {
        remaining: Mutex::new(3),
        inner: MemoryBackend::new(),
    });
    let mut config = CenoteConfig::default();
    config.retry.max_delay_ms = 2;
    let updater = updater_over(backend, &config);

    let receipt = updater.update_aggregate(&key("price"), 1.0, None).await.unwrap();
    assert_eq!(receipt.attempts, 4);
    assert_eq!(
        updater.read_aggregate(&key("price")).await.unwrap().unwrap().count(),
        1
    );
}

#[tokio::test]
async fn backend_failure_is_surfaced() {
    let updater = updater_over(Arc::new(Unavailable), &CenoteConfig::default());

    let err = updater.update_aggregate(&key("price"), 1.0, None).await.unwrap_err();
    assert!(matches!(err, AggregateError::BackendUnavailable(_)));
    assert!(matches!(
        updater.read_aggregate(&key("price")).await,
        Err(AggregateError::BackendUnavailable(_))
    ));
}

#[tokio::test]
async fn bincode_snapshots_are_readable_by_json_updater() {
    let backend = Arc::new(MemoryBackend::new());
    let key = key("price");

    let mut config = CenoteConfig::default();
    config.codec.format = CodecFormat::Bincode;
    let binary = updater_over(backend.clone(), &config);
    binary
        .update_aggregate(&key, 4.0, Some(&labels("2024-05-05", "05")))
        .await
        .unwrap();

    let raw = backend.get(&key.to_storage_key()).await.unwrap().data.unwrap();
    assert!(raw.starts_with(BINCODE_MAGIC));

    let json = updater_over(backend, &CenoteConfig::default());
    json.update_aggregate(&key, 6.0, None).await.unwrap();
    let record = json.read_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(record.count(), 2);
    assert_eq!(record.mean(), 5.0);
    assert!(record.histogram.is_some());
}
