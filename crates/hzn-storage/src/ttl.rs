use std::sync::Arc;
use std::time::Duration;

use crate::mem::{now_ns, MemBucket};
use crate::traits::KvBucket;

/// Upper bound on how long the sweeper sleeps between checks.
const GC_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Turns expired entries of a [`MemBucket`] into tombstones.
///
/// Lock entries carry a TTL so that a lock left behind by a compute replica
/// that crashed mid-computation is eventually released. Expiry goes through
/// [`MemBucket::purge_expired`], which notifies watchers with a delete like an
/// explicit release would.
pub struct TtlGcTask {
    bucket: Arc<MemBucket>,
    poll_interval: Duration,
}

impl TtlGcTask {
    pub fn new(bucket: Arc<MemBucket>) -> Self {
        TtlGcTask { bucket, poll_interval: GC_POLL_INTERVAL }
    }

    pub fn with_poll_interval(bucket: Arc<MemBucket>, poll_interval: Duration) -> Self {
        TtlGcTask { bucket, poll_interval }
    }

    /// Run the GC loop until the task is cancelled.
    ///
    /// Algorithm:
    /// 1. Find the earliest expiry among live entries.
    /// 2. If none: sleep `poll_interval` and retry.
    /// 3. Else sleep until that expiry, capped at `poll_interval` so entries
    ///    created in the meantime with an earlier expiry are not overslept.
    /// 4. Tombstone everything that has expired.
    pub async fn run(self) {
        loop {
            match self.bucket.next_expiry_ns().await {
                None => tokio::time::sleep(self.poll_interval).await,
                Some(expires_at_ns) => {
                    let now = now_ns();
                    if expires_at_ns > now {
                        let wait = Duration::from_nanos((expires_at_ns - now) as u64);
                        tokio::time::sleep(wait.min(self.poll_interval)).await;
                    }
                    let expired = self.bucket.purge_expired().await;
                    if expired > 0 {
                        tracing::debug!(bucket = self.bucket.name(), expired, "expired entries tombstoned");
                    }
                }
            }
        }
    }
}
