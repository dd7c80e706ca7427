use std::sync::Arc;

use bytes::Bytes;

use hzn_types::{HorizonKey, HznError};

use crate::traits::KvBucket;
use crate::types::CreateOutcome;

/// Outcome of [`CacheStore::create_if_absent`].
///
/// `AlreadyExists` means another replica finished first. Callers treat it
/// exactly like `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    Created,
    AlreadyExists,
}

/// Content-addressed store of computed horizon profiles.
///
/// Entries are written once and never mutated or deleted by normal operation.
pub struct CacheStore<K: KvBucket> {
    bucket: Arc<K>,
}

// Manual Clone: `Arc<K>` is cloneable whether or not `K` is.
impl<K: KvBucket> Clone for CacheStore<K> {
    fn clone(&self) -> Self {
        CacheStore { bucket: Arc::clone(&self.bucket) }
    }
}

impl<K: KvBucket> CacheStore<K> {
    pub fn new(bucket: Arc<K>) -> Self {
        CacheStore { bucket }
    }

    pub fn bucket(&self) -> &K {
        &self.bucket
    }

    /// The cached profile for `key`, or `None` on a miss.
    pub async fn get(&self, key: &HorizonKey) -> Result<Option<Bytes>, HznError> {
        Ok(self
            .bucket
            .entry(key.as_str())
            .await?
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value))
    }

    pub async fn create_if_absent(
        &self,
        key: &HorizonKey,
        profile: Bytes,
    ) -> Result<CacheWrite, HznError> {
        match self.bucket.create(key.as_str(), profile).await? {
            CreateOutcome::Created { .. } => Ok(CacheWrite::Created),
            CreateOutcome::AlreadyExists => Ok(CacheWrite::AlreadyExists),
        }
    }
}
