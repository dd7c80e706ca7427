use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

use hzn_types::HznError;

/// Kind of change recorded by a bucket entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    Put,
    /// Tombstone left behind by a delete or an expiry.
    Delete,
}

/// One revision of a key inside a bucket.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    /// Empty for tombstones.
    pub value: Bytes,
    /// Bucket-wide, strictly increasing with every write.
    pub revision: u64,
    pub operation: KvOperation,
    pub modified_at_ns: i64,
    pub expires_at_ns: Option<i64>,
}

impl KvEntry {
    pub fn is_live(&self) -> bool {
        self.operation == KvOperation::Put
    }
}

/// Result of an atomic create-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { revision: u64 },
    AlreadyExists,
}

/// Change feed for a single key: the current entry first (tombstones
/// included), then every later write in revision order.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<KvEntry, HznError>> + Send>>;
