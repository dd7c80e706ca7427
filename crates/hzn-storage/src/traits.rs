use std::future::Future;

use bytes::Bytes;

use hzn_types::HznError;

use crate::types::{CreateOutcome, KvEntry, WatchStream};

/// A named, watchable key-value namespace shared by every replica.
///
/// Methods use RPITIT (`-> impl Future + Send`) so that generic services can
/// hold the returned futures across `.await` points on a multi-threaded
/// runtime without an `async-trait` dependency.
///
/// The cache and the in-computation lock are two buckets of the same backend;
/// see [`CacheStore`](crate::cache::CacheStore) and
/// [`LockStore`](crate::lock::LockStore) for the typed views.
pub trait KvBucket: Send + Sync + 'static {
    /// Bucket name, used for logging only.
    fn name(&self) -> &str;

    /// Return the latest entry for `key`, including a tombstone if the key
    /// was deleted, or `None` if the key was never written (or has been
    /// purged by the backend).
    fn entry(&self, key: &str)
        -> impl Future<Output = Result<Option<KvEntry>, HznError>> + Send;

    /// Atomically write `value` if `key` has no live entry.
    ///
    /// A tombstone or an expired entry counts as absent. Exactly one of any
    /// number of concurrent callers observes `Created`.
    fn create(&self, key: &str, value: Bytes)
        -> impl Future<Output = Result<CreateOutcome, HznError>> + Send;

    /// Replace the live entry for `key` with a tombstone. Deleting an absent
    /// key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), HznError>> + Send;

    /// Subscribe to changes of `key`. The stream never ends on its own;
    /// dropping it cancels the subscription.
    fn watch(&self, key: &str) -> impl Future<Output = Result<WatchStream, HznError>> + Send;
}
