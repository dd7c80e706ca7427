//! "Computation in progress" flags.
//!
//! A lock entry for a [`HorizonKey`] means one compute invocation for that key
//! is in flight. The flag is claimed by the resolver right before it hands a
//! request to the compute service, and released by the compute service right
//! after the profile has been written to the cache.
//!
//! # How It Works
//!
//! 1. `claim` is the bucket's atomic create-if-absent, never a read-then-write,
//!    so of several resolvers racing on the same key exactly one wins.
//! 2. `release` deletes the entry, leaving a tombstone that watchers observe.
//! 3. `watch` turns the bucket's change feed into [`LockEvent`]s so that a
//!    resolver can wait for the release without polling.
//!
//! Mutual exclusion is only as strong as the backend's create-if-absent.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use hzn_types::{HorizonKey, HznError};

use crate::traits::KvBucket;
use crate::types::{CreateOutcome, KvEntry};

/// Value stored for a claimed key.
pub const LOCK_VALUE: &[u8] = b"true";

/// Result of [`LockStore::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Present { revision: u64 },
    Absent,
}

/// Result of [`LockStore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed { revision: u64 },
    /// A concurrent claim won the race.
    AlreadyClaimed,
}

/// A change to one lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Created { revision: u64 },
    Updated { revision: u64 },
    Deleted { revision: u64 },
}

impl LockEvent {
    pub fn revision(&self) -> u64 {
        match *self {
            LockEvent::Created { revision }
            | LockEvent::Updated { revision }
            | LockEvent::Deleted { revision } => revision,
        }
    }
}

pub type LockWatch = Pin<Box<dyn Stream<Item = Result<LockEvent, HznError>> + Send>>;

/// Tombstones read as not held. A live entry is held; any value other than
/// [`LOCK_VALUE`] is an error, since `claim` could never replace it.
fn is_held(entry: &KvEntry) -> Result<bool, HznError> {
    if !entry.is_live() {
        return Ok(false);
    }
    match entry.value.as_ref() {
        LOCK_VALUE => Ok(true),
        other => Err(HznError::Storage(format!(
            "unreadable lock value '{}' for key '{}'",
            String::from_utf8_lossy(other),
            entry.key
        ))),
    }
}

pub struct LockStore<K: KvBucket> {
    bucket: Arc<K>,
}

impl<K: KvBucket> Clone for LockStore<K> {
    fn clone(&self) -> Self {
        LockStore { bucket: Arc::clone(&self.bucket) }
    }
}

impl<K: KvBucket> LockStore<K> {
    pub fn new(bucket: Arc<K>) -> Self {
        LockStore { bucket }
    }

    pub fn bucket(&self) -> &K {
        &self.bucket
    }

    pub async fn get(&self, key: &HorizonKey) -> Result<LockState, HznError> {
        match self.bucket.entry(key.as_str()).await? {
            Some(entry) if is_held(&entry)? => Ok(LockState::Present { revision: entry.revision }),
            _ => Ok(LockState::Absent),
        }
    }

    pub async fn claim(&self, key: &HorizonKey) -> Result<ClaimOutcome, HznError> {
        match self
            .bucket
            .create(key.as_str(), Bytes::from_static(LOCK_VALUE))
            .await?
        {
            CreateOutcome::Created { revision } => Ok(ClaimOutcome::Claimed { revision }),
            CreateOutcome::AlreadyExists => Ok(ClaimOutcome::AlreadyClaimed),
        }
    }

    /// Idempotent.
    pub async fn release(&self, key: &HorizonKey) -> Result<(), HznError> {
        self.bucket.delete(key.as_str()).await
    }

    /// Change feed for `key`, starting with an event describing the current
    /// state when the key has one.
    pub async fn watch(&self, key: &HorizonKey) -> Result<LockWatch, HznError> {
        let changes = self.bucket.watch(key.as_str()).await?;
        let events = changes.scan(false, |held, item| {
            let event = item.and_then(|entry| {
                let now_held = is_held(&entry)?;
                let event = match (*held, now_held) {
                    (_, false) => LockEvent::Deleted { revision: entry.revision },
                    (false, true) => LockEvent::Created { revision: entry.revision },
                    (true, true) => LockEvent::Updated { revision: entry.revision },
                };
                *held = now_held;
                Ok(event)
            });
            futures::future::ready(Some(event))
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mem::MemBucket;

    fn key() -> HorizonKey {
        HorizonKey::new("horizon-v1.0.0-k")
    }

    async fn next_event(watch: &mut LockWatch) -> LockEvent {
        tokio::time::timeout(Duration::from_secs(1), watch.next())
            .await
            .expect("lock event")
            .expect("stream open")
            .expect("event ok")
    }

    #[tokio::test]
    async fn claim_get_release() {
        let locks = LockStore::new(Arc::new(MemBucket::new("horizons-in-computation")));

        assert_eq!(locks.get(&key()).await.unwrap(), LockState::Absent);

        let claimed = locks.claim(&key()).await.unwrap();
        assert_eq!(claimed, ClaimOutcome::Claimed { revision: 1 });
        assert_eq!(locks.get(&key()).await.unwrap(), LockState::Present { revision: 1 });

        assert_eq!(locks.claim(&key()).await.unwrap(), ClaimOutcome::AlreadyClaimed);

        locks.release(&key()).await.unwrap();
        assert_eq!(locks.get(&key()).await.unwrap(), LockState::Absent);

        // Idempotent.
        locks.release(&key()).await.unwrap();

        // Claimable again once released.
        assert!(matches!(locks.claim(&key()).await.unwrap(), ClaimOutcome::Claimed { .. }));
    }

    #[tokio::test]
    async fn watch_reports_created_updated_deleted() {
        let bucket = Arc::new(MemBucket::new("horizons-in-computation"));
        let locks = LockStore::new(bucket.clone());
        locks.claim(&key()).await.unwrap();

        let mut watch = locks.watch(&key()).await.unwrap();
        assert_eq!(next_event(&mut watch).await, LockEvent::Created { revision: 1 });

        locks.release(&key()).await.unwrap();
        assert_eq!(next_event(&mut watch).await, LockEvent::Deleted { revision: 2 });

        locks.claim(&key()).await.unwrap();
        assert_eq!(next_event(&mut watch).await, LockEvent::Created { revision: 3 });
    }

    #[tokio::test]
    async fn live_false_is_a_storage_error() {
        let bucket = Arc::new(MemBucket::new("horizons-in-computation"));
        bucket.create(key().as_str(), Bytes::from_static(b"false")).await.unwrap();

        let locks = LockStore::new(bucket);
        assert!(matches!(locks.get(&key()).await, Err(HznError::Storage(_))));
        assert_eq!(locks.claim(&key()).await.unwrap(), ClaimOutcome::AlreadyClaimed);

        let mut watch = locks.watch(&key()).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert!(matches!(first, Err(HznError::Storage(_))));
    }

    #[tokio::test]
    async fn garbage_value_is_a_storage_error() {
        let bucket = Arc::new(MemBucket::new("horizons-in-computation"));
        bucket.create(key().as_str(), Bytes::from_static(b"maybe")).await.unwrap();

        let locks = LockStore::new(bucket);
        let err = locks.get(&key()).await.unwrap_err();
        assert!(matches!(err, HznError::Storage(_)));
    }

    #[test]
    fn event_revision() {
        assert_eq!(LockEvent::Created { revision: 4 }.revision(), 4);
        assert_eq!(LockEvent::Updated { revision: 5 }.revision(), 5);
        assert_eq!(LockEvent::Deleted { revision: 6 }.revision(), 6);
    }
}
