//! Shared fixtures for the service tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;

use hzn_bus::{Bus, DeliveryStream, MemBus, MemDelivery};
use hzn_storage::mem::MemBucket;
use hzn_storage::{CacheStore, CreateOutcome, KvBucket, KvEntry, LockStore, WatchStream};
use hzn_types::{HznError, Location, Radius};

use crate::compute::HorizonComputer;

pub const BENCH_R1: &str = r#"{"part":{"id":0,"of":1},"spot":{"dir":0.0,"kind":"bench","loc":{"lat":48.8186,"lon":9.58734}},"request_id":"r1"}"#;

/// The same bench as [`BENCH_R1`] under another request id.
pub fn bench_request(request_id: &str) -> Bytes {
    Bytes::from(BENCH_R1.replace("\"r1\"", &format!("\"{request_id}\"")))
}

pub fn bench_location() -> Location {
    Location { lat: 48.8186, lon: 9.58734 }
}

pub fn profile_for(location: Location, radius: Radius) -> Bytes {
    Bytes::from(format!("profile:{}:{}:{}", location.lat, location.lon, radius))
}

pub struct Stores<K: KvBucket> {
    pub cache: CacheStore<K>,
    pub locks: LockStore<K>,
}

pub fn mem_stores() -> Stores<MemBucket> {
    Stores {
        cache: CacheStore::new(Arc::new(MemBucket::new("horizons"))),
        locks: LockStore::new(Arc::new(MemBucket::new("horizons-in-computation"))),
    }
}

pub async fn next_delivery(stream: &mut DeliveryStream<MemDelivery>) -> MemDelivery {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("delivery")
        .expect("stream open")
        .expect("delivery ok")
}

/// Poll until at least `count` messages were published on `filter`.
pub async fn wait_for_published(bus: &MemBus, filter: &str, count: usize) -> Vec<Bytes> {
    let poll = async {
        loop {
            let published = bus.published(filter).await;
            if published.len() >= count {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("fewer than {count} messages on {filter}"))
}

// ---------------------------------------------------------------------------
// Computers
// ---------------------------------------------------------------------------

/// Deterministic computer that counts invocations.
#[derive(Default)]
pub struct CountingComputer {
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
}

impl CountingComputer {
    pub fn with_delay(delay: Duration) -> Self {
        CountingComputer { delay, ..Default::default() }
    }

    pub fn failing() -> Self {
        CountingComputer { fail: true, ..Default::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HorizonComputer for CountingComputer {
    async fn compute(&self, location: Location, radius: Radius) -> Result<Bytes, HznError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(HznError::Compute("elevation model has no tile for this location".into()));
        }
        Ok(profile_for(location, radius))
    }
}

// ---------------------------------------------------------------------------
// FlakyBucket
// ---------------------------------------------------------------------------

/// [`MemBucket`] whose reads fail while the failure budget lasts.
pub struct FlakyBucket {
    inner: MemBucket,
    failures_left: AtomicU64,
}

impl FlakyBucket {
    pub fn new(name: &str, failures: u64) -> Self {
        FlakyBucket { inner: MemBucket::new(name), failures_left: AtomicU64::new(failures) }
    }

    fn trip(&self) -> Result<(), HznError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(HznError::Storage(format!("{}: connection reset", self.inner.name())));
        }
        Ok(())
    }
}

impl KvBucket for FlakyBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, HznError> {
        self.trip()?;
        self.inner.entry(key).await
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<CreateOutcome, HznError> {
        self.inner.create(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), HznError> {
        self.inner.delete(key).await
    }

    async fn watch(&self, key: &str) -> Result<WatchStream, HznError> {
        self.inner.watch(key).await
    }
}

/// Bus whose publishes to one topic always fail.
pub struct BrokenTopicBus {
    pub inner: MemBus,
    pub broken: String,
}

impl Bus for BrokenTopicBus {
    type Delivery = MemDelivery;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), HznError> {
        if topic == self.broken {
            return Err(HznError::Bus(format!("no responders for {topic}")));
        }
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(&self, filter: &str, group: &str) -> Result<DeliveryStream<MemDelivery>, HznError> {
        self.inner.subscribe(filter, group).await
    }
}
