use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use hzn_bus::{Bus, Delivery};
use hzn_storage::{derive_key, CacheStore, CacheWrite, KvBucket, LockStore};
use hzn_types::{attach_horizon, HorizonKey, HorizonRequest, HznError, Location, Radius};

use crate::config::{ComputeSettings, Topics};
use crate::sink::ErrorSink;
use crate::MessageHandler;

/// Service name used as consumer group and error record sender.
pub const COMPUTE_NAME: &str = "horizon-compute-service";

/// The expensive horizon calculation.
pub trait HorizonComputer: Send + Sync + 'static {
    fn compute(&self, location: Location, radius: Radius)
        -> impl Future<Output = Result<Bytes, HznError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Computation {
    Computed,
    /// The profile was cached by an earlier delivery; nothing was computed.
    AlreadyCached,
}

/// Consumes compute requests: computes, caches, releases the lock, publishes.
///
/// The cache write always happens before the lock release, so a resolver that
/// observes the release reads the profile on its next cache access.
///
/// Every delivery is acked. Failures are dead-lettered rather than retried and
/// release the lock so waiting resolvers can move on.
pub struct Computer<K: KvBucket, B: Bus, C: HorizonComputer> {
    cache: CacheStore<K>,
    locks: LockStore<K>,
    bus: Arc<B>,
    computer: Arc<C>,
    topics: Topics,
    radius: Radius,
    settings: ComputeSettings,
    errors: ErrorSink<B>,
}

impl<K: KvBucket, B: Bus, C: HorizonComputer> Computer<K, B, C> {
    pub fn new(
        cache: CacheStore<K>,
        locks: LockStore<K>,
        bus: Arc<B>,
        computer: Arc<C>,
        topics: Topics,
        radius: Radius,
        settings: ComputeSettings,
    ) -> Self {
        let errors = ErrorSink::new(Arc::clone(&bus), &topics, COMPUTE_NAME);
        Computer { cache, locks, bus, computer, topics, radius, settings, errors }
    }

    /// Handle one delivery and ack it.
    pub async fn process(&self, delivery: B::Delivery) -> Result<Computation, HznError> {
        let result = self.handle_request(delivery.payload()).await;
        if let Err(e) = &result {
            tracing::warn!(delivered = delivery.delivery_count(), error = %e, "compute request dead-lettered");
            self.errors.report(delivery.payload(), e).await;
        }
        if let Err(e) = delivery.ack().await {
            tracing::warn!(error = %e, "cannot ack compute request, the bus will redeliver it");
        }
        result
    }

    async fn handle_request(&self, payload: &Bytes) -> Result<Computation, HznError> {
        let request = HorizonRequest::decode(payload)?;
        let key = derive_key(&request.spot.loc, self.radius);

        let outcome = match self.compute_and_store(&request, &key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(release) = self.locks.release(&key).await {
                    tracing::warn!(%key, error = %release, "cannot release lock after failed computation");
                }
                return Err(e);
            }
        };

        self.locks.release(&key).await?;
        let result = attach_horizon(payload, &key)?;
        self.bus.publish(&self.topics.results, Bytes::from(result)).await?;
        tracing::info!(request_id = %request.request_id, %key, ?outcome, "horizon published");
        Ok(outcome)
    }

    async fn compute_and_store(
        &self,
        request: &HorizonRequest,
        key: &HorizonKey,
    ) -> Result<Computation, HznError> {
        if self.cache.get(key).await?.is_some() {
            tracing::debug!(request_id = %request.request_id, %key, "already cached, skipping computation");
            return Ok(Computation::AlreadyCached);
        }

        let timeout = self.settings.timeout();
        let profile = tokio::time::timeout(timeout, self.computer.compute(request.spot.loc, self.radius))
            .await
            .map_err(|_| HznError::Compute(format!("no result within {}s", timeout.as_secs())))??;

        if self.cache.create_if_absent(key, profile).await? == CacheWrite::AlreadyExists {
            tracing::debug!(%key, "profile cached concurrently by another replica");
        }
        Ok(Computation::Computed)
    }
}

impl<K: KvBucket, B: Bus, C: HorizonComputer> MessageHandler<B::Delivery> for Computer<K, B, C> {
    async fn handle(&self, delivery: B::Delivery) {
        let _ = self.process(delivery).await;
    }
}
