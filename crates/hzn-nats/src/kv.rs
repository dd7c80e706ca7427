use async_nats::jetstream::kv::{self, CreateErrorKind, Operation, Store};
use bytes::Bytes;
use futures::StreamExt;

use hzn_storage::{CreateOutcome, KvBucket, KvEntry, KvOperation, WatchStream};
use hzn_types::HznError;

/// [`KvBucket`] over a JetStream key-value bucket.
///
/// `create` is the server-side "create if the last operation was not a put",
/// so lock claims stay atomic across replicas.
#[derive(Clone)]
pub struct NatsBucket {
    name: String,
    store: Store,
}

impl NatsBucket {
    pub fn new(name: impl Into<String>, store: Store) -> Self {
        NatsBucket { name: name.into(), store }
    }
}

fn to_entry(entry: kv::Entry) -> KvEntry {
    let operation = match entry.operation {
        Operation::Put => KvOperation::Put,
        Operation::Delete | Operation::Purge => KvOperation::Delete,
    };
    KvEntry {
        key: entry.key,
        value: entry.value,
        revision: entry.revision,
        operation,
        modified_at_ns: entry.created.unix_timestamp_nanos() as i64,
        // Expiry is enforced server side through the bucket's max_age.
        expires_at_ns: None,
    }
}

impl KvBucket for NatsBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn entry(&self, key: &str) -> Result<Option<KvEntry>, HznError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| HznError::Storage(format!("{}: get {key}: {e}", self.name)))?;
        Ok(entry.map(to_entry))
    }

    async fn create(&self, key: &str, value: Bytes) -> Result<CreateOutcome, HznError> {
        match self.store.create(key, value).await {
            Ok(revision) => Ok(CreateOutcome::Created { revision }),
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(HznError::Storage(format!("{}: create {key}: {e}", self.name))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), HznError> {
        self.store
            .delete(key)
            .await
            .map_err(|e| HznError::Storage(format!("{}: delete {key}: {e}", self.name)))
    }

    async fn watch(&self, key: &str) -> Result<WatchStream, HznError> {
        // Last-per-subject delivery: the current entry first, then changes.
        let watch = self
            .store
            .watch_with_history(key)
            .await
            .map_err(|e| HznError::Storage(format!("{}: watch {key}: {e}", self.name)))?;
        let bucket = self.name.clone();
        let entries = watch.map(move |entry| {
            entry
                .map(to_entry)
                .map_err(|e| HznError::Storage(format!("{bucket}: watch: {e}")))
        });
        Ok(Box::pin(entries))
    }
}
