use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use hzn_types::HznError;

use crate::traits::KvBucket;
use crate::types::{CreateOutcome, KvEntry, KvOperation, WatchStream};

/// Events buffered per watcher before it is reported as lagging.
pub const DEFAULT_WATCH_CAPACITY: usize = 1024;

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn is_expired(entry: &KvEntry, now: i64) -> bool {
    entry.is_live() && entry.expires_at_ns.is_some_and(|at| at <= now)
}

/// Present an expired-but-not-yet-swept entry as a tombstone.
fn visible(entry: &KvEntry, now: i64) -> KvEntry {
    if is_expired(entry, now) {
        KvEntry {
            value: Bytes::new(),
            operation: KvOperation::Delete,
            ..entry.clone()
        }
    } else {
        entry.clone()
    }
}

// ---------------------------------------------------------------------------
// MemBucket
// ---------------------------------------------------------------------------

struct MemBucketInner {
    /// Latest entry per key, tombstones included.
    data: BTreeMap<String, KvEntry>,
    next_revision: u64,
}

impl MemBucketInner {
    fn bump(&mut self) -> u64 {
        let revision = self.next_revision;
        self.next_revision += 1;
        revision
    }
}

/// In-process `KvBucket` with watch support and an optional per-bucket TTL.
///
/// Every write is published on a broadcast channel while the write lock is
/// held; `watch` subscribes and snapshots under the read lock, so a watcher
/// sees each revision of its key exactly once and in order.
///
/// Not shared across processes: intended for tests and the standalone node.
pub struct MemBucket {
    name: String,
    ttl: Option<Duration>,
    inner: Arc<RwLock<MemBucketInner>>,
    events: broadcast::Sender<KvEntry>,
}

impl MemBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, None, DEFAULT_WATCH_CAPACITY)
    }

    pub fn with_ttl(name: impl Into<String>, ttl: Duration) -> Self {
        Self::with_options(name, Some(ttl), DEFAULT_WATCH_CAPACITY)
    }

    pub fn with_options(name: impl Into<String>, ttl: Option<Duration>, watch_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(watch_capacity.max(1));
        MemBucket {
            name: name.into(),
            ttl,
            inner: Arc::new(RwLock::new(MemBucketInner {
                data: BTreeMap::new(),
                next_revision: 1,
            })),
            events,
        }
    }

    /// Earliest expiry among live entries, if any entry carries one.
    pub async fn next_expiry_ns(&self) -> Option<i64> {
        let g = self.inner.read().await;
        g.data
            .values()
            .filter(|e| e.is_live())
            .filter_map(|e| e.expires_at_ns)
            .min()
    }

    /// Replace every expired live entry with a tombstone and notify watchers.
    /// Returns the number of entries expired.
    pub async fn purge_expired(&self) -> usize {
        let mut g = self.inner.write().await;
        let now = now_ns();
        let expired: Vec<String> = g
            .data
            .values()
            .filter(|e| is_expired(e, now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            let revision = g.bump();
            let tombstone = KvEntry {
                key: key.clone(),
                value: Bytes::new(),
                revision,
                operation: KvOperation::Delete,
                modified_at_ns: now,
                expires_at_ns: None,
            };
            g.data.insert(key.clone(), tombstone.clone());
            let _ = self.events.send(tombstone);
        }
        expired.len()
    }
}

impl KvBucket for MemBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, HznError> {
        let g = self.inner.read().await;
        Ok(g.data.get(key).map(|e| visible(e, now_ns())))
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<CreateOutcome, HznError> {
        let mut g = self.inner.write().await;
        let now = now_ns();
        if let Some(existing) = g.data.get(key) {
            if existing.is_live() && !is_expired(existing, now) {
                return Ok(CreateOutcome::AlreadyExists);
            }
        }
        let revision = g.bump();
        let entry = KvEntry {
            key: key.to_string(),
            value,
            revision,
            operation: KvOperation::Put,
            modified_at_ns: now,
            expires_at_ns: self.ttl.map(|ttl| now + ttl.as_nanos() as i64),
        };
        g.data.insert(key.to_string(), entry.clone());
        // No receivers is not an error.
        let _ = self.events.send(entry);
        Ok(CreateOutcome::Created { revision })
    }

    async fn delete(&self, key: &str) -> Result<(), HznError> {
        let mut g = self.inner.write().await;
        let live = g.data.get(key).is_some_and(|e| e.is_live());
        if !live {
            return Ok(());
        }
        let revision = g.bump();
        let tombstone = KvEntry {
            key: key.to_string(),
            value: Bytes::new(),
            revision,
            operation: KvOperation::Delete,
            modified_at_ns: now_ns(),
            expires_at_ns: None,
        };
        g.data.insert(key.to_string(), tombstone.clone());
        let _ = self.events.send(tombstone);
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<WatchStream, HznError> {
        let g = self.inner.read().await;
        let rx = self.events.subscribe();
        let current = g.data.get(key).map(|e| visible(e, now_ns()));
        drop(g);

        let key = key.to_string();
        let bucket = self.name.clone();
        let changes = BroadcastStream::new(rx).filter_map(move |item| {
            let out = match item {
                Ok(entry) if entry.key == key => Some(Ok(entry)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(HznError::Storage(
                    format!("watch on bucket '{bucket}' lagged by {skipped} events"),
                ))),
            };
            futures::future::ready(out)
        });
        Ok(Box::pin(stream::iter(current.map(Ok)).chain(changes)))
    }
}
