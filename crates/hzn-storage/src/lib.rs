pub mod cache;
pub mod keys;
pub mod lock;
pub mod mem;
pub mod traits;
pub mod ttl;
pub mod types;

pub use cache::{CacheStore, CacheWrite};
pub use keys::derive_key;
pub use lock::{ClaimOutcome, LockEvent, LockState, LockStore, LockWatch};
pub use traits::KvBucket;
pub use types::{CreateOutcome, KvEntry, KvOperation, WatchStream};
